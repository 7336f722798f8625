//! Loads this node's persistent WireGuard private key, generating and
//! persisting one on first start. Kept out of the `config` crate since it
//! touches the filesystem and the key-generation primitive, not just
//! environment parsing.

use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use wireguard_control::Key;

#[derive(Debug, Error)]
pub enum PrivateKeyError {
    #[error("failed to read private key at {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("private key at {path} is not valid base64: {source}")]
    Decode { path: String, source: base64::DecodeError },
    #[error("private key at {path} decodes to {len} bytes, expected 32")]
    Length { path: String, len: usize },
    #[error("failed to create private key at {path}: {source}")]
    Create { path: String, source: io::Error },
}

/// Reads the base64-encoded 32-byte key at `path`. If the file does not
/// exist, generates a fresh one and writes it back with mode 0600.
pub fn load_or_create(path: &Path) -> Result<[u8; 32], PrivateKeyError> {
    match fs::read_to_string(path) {
        Ok(contents) => decode(path, contents.trim()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => create(path),
        Err(source) => Err(PrivateKeyError::Read { path: display(path), source }),
    }
}

fn decode(path: &Path, encoded: &str) -> Result<[u8; 32], PrivateKeyError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|source| PrivateKeyError::Decode { path: display(path), source })?;
    let len = bytes.len();
    <[u8; 32]>::try_from(bytes).map_err(|_| PrivateKeyError::Length { path: display(path), len })
}

fn create(path: &Path) -> Result<[u8; 32], PrivateKeyError> {
    let key: [u8; 32] = *Key::generate_private().as_bytes();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PrivateKeyError::Create {
            path: display(path),
            source,
        })?;
    }

    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .and_then(|mut f| {
            use io::Write;
            f.write_all(BASE64.encode(key).as_bytes())
        })
        .map_err(|source| PrivateKeyError::Create { path: display(path), source })?;

    tracing::info!(?path, "generated a new private key");
    Ok(key)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Derives the WireGuard public key for a raw private key.
pub fn public_key(private: &[u8; 32]) -> [u8; 32] {
    *Key::from_raw(*private).generate_public().as_bytes()
}
