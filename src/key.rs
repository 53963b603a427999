//! Server host key management.

use std::fs;
use std::path::Path;

use anyhow::Context;
use log::{info, warn};
use russh_keys::{Algorithm, HashAlg, PrivateKey};

/// Load the host key at `path`.
///
/// A missing file is fatal unless `generate_missing` is set, in which case a
/// fresh Ed25519 key is generated and saved there.
pub fn load_server_key(path: &Path, generate_missing: bool) -> anyhow::Result<PrivateKey> {
    if path.exists() {
        info!("Loading server key from {}...", path.display());
        let key_data = fs::read_to_string(path)
            .with_context(|| format!("failed to read host key {}", path.display()))?;
        let key = PrivateKey::from_openssh(&key_data)
            .with_context(|| format!("failed to parse host key {}", path.display()))?;
        log_fingerprint(&key);
        return Ok(key);
    }

    if !generate_missing {
        anyhow::bail!(
            "host key {} not found (set SERVER_KEY_PATH or APP_ENV=development)",
            path.display()
        );
    }

    warn!("Host key {} missing, generating Ed25519 key", path.display());
    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let key_data = key.to_openssh(russh_keys::ssh_key::LineEnding::LF)?;
    fs::write(path, key_data.as_bytes())?;
    info!("Server key saved to {}", path.display());
    log_fingerprint(&key);

    Ok(key)
}

fn log_fingerprint(key: &PrivateKey) {
    info!(
        "Server key fingerprint: {}",
        key.public_key().fingerprint(HashAlg::Sha256)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_key_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("sshhook-key-test-{}-{}", std::process::id(), name))
            .join("hostkey")
    }

    #[test]
    fn test_missing_key_is_fatal_in_production() {
        let path = temp_key_path("prod");
        assert!(load_server_key(&path, false).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_generated_key_is_reloaded() {
        let path = temp_key_path("dev");
        let generated = load_server_key(&path, true).unwrap();
        assert!(path.exists());

        let loaded = load_server_key(&path, false).unwrap();
        assert_eq!(
            generated.public_key().fingerprint(HashAlg::Sha256).to_string(),
            loaded.public_key().fingerprint(HashAlg::Sha256).to_string()
        );
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_garbage_key_is_rejected() {
        let path = temp_key_path("garbage");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not a key").unwrap();
        assert!(load_server_key(&path, true).is_err());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
