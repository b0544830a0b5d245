//! Node key pair persistence: 32 raw secret bytes, generated on first start.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context};
use colossus_core::identity::SECRET_KEY_SIZE;
use colossus_core::Keypair;

/// Read the key at `path`, or generate and store a new one.
pub fn load_or_generate(path: &Path) -> anyhow::Result<Keypair> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let Ok(secret) = <[u8; SECRET_KEY_SIZE]>::try_from(bytes.as_slice()) else {
                bail!(
                    "key file {} holds {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    SECRET_KEY_SIZE
                );
            };
            let keypair = Keypair::from_secret_bytes(secret);
            tracing::info!(path = %path.display(), key = %keypair.public_key(), "loaded node key");
            Ok(keypair)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            store(path, &keypair.secret_bytes())?;
            tracing::info!(path = %path.display(), key = %keypair.public_key(), "generated node key");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("reading key file {}", path.display())),
    }
}

fn store(path: &Path, secret: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating key file {}", path.display()))?;
    file.write_all(secret)?;
    file.sync_all()?;
    Ok(())
}
