// Library module for mirrorsync
// Re-exports modules for use in integration tests and the binary

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod sync;

pub use error::{SyncError, SyncResult};
