pub mod backend;
pub mod local;
pub mod remote;

pub use backend::{join_remote, BackendType, RemoteTransport, TransportCapabilities};
pub use local::LocalTransport;
pub use remote::OpendalTransport;
