//! Authenticated encryption of mirrored files.
//!
//! Files are sealed with `XChaCha20-Poly1305`. The on-disk layout is a fresh
//! random 24-byte nonce followed by the ciphertext and its 16-byte tag, so
//! encrypting the same plaintext twice never yields the same bytes.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{IoContext, SyncError, SyncResult};

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// Key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyMaterial([u8; KEY_SIZE]);

/// Encrypts and decrypts files with a single symmetric key.
#[derive(Clone)]
pub struct CryptoManager {
    key: KeyMaterial,
}

impl std::fmt::Debug for CryptoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoManager").finish_non_exhaustive()
    }
}

impl CryptoManager {
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: KeyMaterial(key),
        }
    }

    /// Load a key file holding either 32 raw bytes or 64 hex characters.
    pub fn from_key_file(path: &Path) -> SyncResult<Self> {
        let mut raw = fs::read(path).with_path("reading key file", path)?;
        let parsed = parse_key(&raw);
        raw.zeroize();

        parsed.map(Self::from_key).ok_or_else(|| {
            SyncError::crypto(
                path,
                format!("key must be {KEY_SIZE} raw bytes or {} hex characters", KEY_SIZE * 2),
            )
        })
    }

    /// Write a fresh random key, hex encoded, readable only by the owner.
    pub fn generate_key_file(path: &Path) -> SyncResult<Self> {
        let key: [u8; KEY_SIZE] = XChaCha20Poly1305::generate_key(&mut OsRng).into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_path("creating key directory", parent)?;
        }

        let mut encoded = hex::encode(key);
        encoded.push('\n');
        let written = open_key_file(path).and_then(|mut file| file.write_all(encoded.as_bytes()));
        encoded.zeroize();
        written.with_path("writing key file", path)?;

        Ok(Self::from_key(key))
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.key.0).into())
    }

    /// Seal `plaintext`, returning nonce ‖ ciphertext ‖ tag. `path` only labels errors.
    pub fn encrypt_bytes(&self, plaintext: &[u8], path: &Path) -> SyncResult<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|_| SyncError::crypto(path, "encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open data produced by [`encrypt_bytes`](Self::encrypt_bytes).
    pub fn decrypt_bytes(&self, data: &[u8], path: &Path) -> SyncResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(SyncError::crypto(path, "ciphertext too short"));
        }
        let (nonce, sealed) = data.split_at(NONCE_SIZE);
        if sealed.len() < TAG_SIZE {
            return Err(SyncError::crypto(path, "ciphertext too short"));
        }

        self.cipher()
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| SyncError::crypto(path, "authentication failed"))
    }

    pub fn encrypt_file(&self, source: &Path, dest: &Path) -> SyncResult<()> {
        let plaintext = fs::read(source).with_path("reading", source)?;
        let sealed = self.encrypt_bytes(&plaintext, source)?;
        fs::write(dest, sealed).with_path("writing encrypted file", dest)
    }

    pub fn decrypt_file(&self, source: &Path, dest: &Path) -> SyncResult<()> {
        let sealed = fs::read(source).with_path("reading encrypted file", source)?;
        let plaintext = self.decrypt_bytes(&sealed, source)?;
        fs::write(dest, plaintext).with_path("writing", dest)
    }
}

/// Create or truncate `path`, readable only by the owner from the first byte.
#[cfg(unix)]
fn open_key_file(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation; an existing file keeps its old bits.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_key_file(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

fn parse_key(raw: &[u8]) -> Option<[u8; KEY_SIZE]> {
    if raw.len() == KEY_SIZE {
        return raw.try_into().ok();
    }

    let text = std::str::from_utf8(raw).ok()?.trim();
    let mut key = [0u8; KEY_SIZE];
    hex::decode_to_slice(text, &mut key).ok()?;
    Some(key)
}
