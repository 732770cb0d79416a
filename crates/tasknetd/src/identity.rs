//! Node identity on disk: the 32-byte Ed25519 secret, owner read/write only.

use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use anyhow::Context;
use tasknet_core::crypto::{self, Keypair};

pub fn save(keypair: &Keypair, path: &Path) -> anyhow::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    #[cfg(unix)]
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    #[cfg(not(unix))]
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let secret = keypair.private_bytes();
    file.write_all(&secret[..])?;
    Ok(())
}

pub fn load(path: &Path) -> anyhow::Result<Keypair> {
    let bytes = std::fs::read(path)?;
    let secret: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("invalid key file: expected 32 bytes"))?;
    Ok(Keypair::from_private(secret))
}

/// Load the identity at `path`, or mine and save one meeting `difficulty`.
///
/// A stored key below the required difficulty is still used; peers will
/// refuse it, so the mismatch is logged loudly.
pub fn load_or_generate(path: &Path, difficulty: u32) -> anyhow::Result<Keypair> {
    if path.exists() {
        let keypair = load(path).with_context(|| format!("failed to load identity {}", path.display()))?;
        let actual = crypto::key_difficulty(&keypair.public);
        if actual < difficulty {
            tracing::warn!(
                key_id = %keypair.key_id(),
                actual,
                required = difficulty,
                "stored identity is below the required key difficulty"
            );
        }
        tracing::info!(key_id = %keypair.key_id(), path = %path.display(), "loaded identity");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_with_difficulty(difficulty);
    save(&keypair, path).with_context(|| format!("failed to save identity {}", path.display()))?;
    tracing::info!(
        key_id = %keypair.key_id(),
        difficulty = crypto::key_difficulty(&keypair.public),
        path = %path.display(),
        "generated new identity"
    );
    Ok(keypair)
}
