use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Symmetric cipher applied to bulk attachments before they enter the
/// channel. The real primitive is supplied by the embedding process; the
/// built-in implementation is a base64 transfer encoding so staged files are
/// not raw plaintext on disk and the decrypt path is exercised end to end.
pub trait FileCipher: Send + Sync {
    fn encrypt(&self, src: &Path, dst: &Path) -> Result<()>;
    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()>;
}

pub struct Base64Cipher;

impl FileCipher for Base64Cipher {
    fn encrypt(&self, src: &Path, dst: &Path) -> Result<()> {
        let content = std::fs::read(src)
            .with_context(|| format!("Failed to read attachment {}", src.display()))?;
        std::fs::write(dst, STANDARD.encode(content))
            .with_context(|| format!("Failed to stage attachment {}", dst.display()))?;
        Ok(())
    }

    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()> {
        let content = std::fs::read_to_string(src)
            .with_context(|| format!("Failed to read attachment {}", src.display()))?;
        let decoded = STANDARD
            .decode(content.trim())
            .context("Attachment is not valid base64")?;
        std::fs::write(dst, decoded)
            .with_context(|| format!("Failed to write attachment {}", dst.display()))?;
        Ok(())
    }
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// A fresh unique path inside the scratch directory.
pub fn scratch_path(scratch_dir: &Path) -> PathBuf {
    let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    scratch_dir.join(format!("{}-{}-{}", std::process::id(), nanos, seq))
}

/// Serializes a value into a scratch file for transmission as an attachment.
pub fn stage_json<T: Serialize>(scratch_dir: &Path, value: &T) -> Result<PathBuf> {
    std::fs::create_dir_all(scratch_dir)
        .with_context(|| format!("Failed to create scratch dir {}", scratch_dir.display()))?;
    let path = scratch_path(scratch_dir);
    let content = serde_json::to_string_pretty(value).context("Failed to serialize attachment")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write attachment {}", path.display()))?;
    Ok(path)
}

/// Best-effort scratch cleanup after a successful transmission.
pub fn remove_scratch(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Delete scratch file {} error: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        let staged = dir.path().join("staged");
        let restored = dir.path().join("restored");
        std::fs::write(&plain, b"{\"id\": 42}").unwrap();

        let cipher = Base64Cipher;
        cipher.encrypt(&plain, &staged).unwrap();
        assert_ne!(std::fs::read(&staged).unwrap(), b"{\"id\": 42}");
        cipher.decrypt(&staged, &restored).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), b"{\"id\": 42}");
    }

    #[test]
    fn test_stage_json_creates_unique_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = stage_json(dir.path(), &serde_json::json!({"a": 1})).unwrap();
        let b = stage_json(dir.path(), &serde_json::json!({"b": 2})).unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
    }
}
