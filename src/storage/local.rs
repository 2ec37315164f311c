//! On-disk fallback for attachments that couldn't reach the primary store.
//! Each item is a data file plus a sibling `.meta` JSON file; when a 32-byte
//! encryption key is configured, the data file holds AES-256-GCM ciphertext
//! and the meta file records the IV/auth-tag needed to decrypt it.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::generate_id;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalMeta {
    original_name: String,
    content_type: String,
    size: usize,
    saved_at: String,
    file_id: String,
    encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_tag: Option<String>,
}

/// Result of reading an attachment back off disk.
pub struct LocalAttachment {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub original_name: String,
}

/// A directory of `<millis>-<randHex16>-<name>` data files and sibling
/// `.meta` JSON files.
#[derive(Clone)]
pub struct LocalStore {
    dir: PathBuf,
    encryption_key: Option<[u8; 32]>,
}

impl LocalStore {
    pub fn open(dir: impl Into<PathBuf>, encryption_key: Option<[u8; 32]>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            #[cfg(unix)]
            {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(&dir)
                    .with_context(|| format!("creating local storage directory {}", dir.display()))?;
            }
            #[cfg(not(unix))]
            {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("creating local storage directory {}", dir.display()))?;
            }
        }
        Ok(LocalStore { dir, encryption_key })
    }

    /// Writes `bytes` to disk (encrypted, if a key is configured) along
    /// with its `.meta` sibling. Returns `(data_path, attachment_id)`.
    pub fn save(&self, filename: &str, content_type: &str, bytes: &[u8]) -> Result<(PathBuf, String)> {
        let file_id = generate_id(16);
        let data_name = format!("{}-{}", file_id, filename);
        let data_path = self.dir.join(&data_name);
        let meta_path = self.meta_path(&data_path);

        let (payload, encrypted_fields) = match &self.encryption_key {
            Some(key) => {
                let (ciphertext, iv, tag) = encrypt(key, bytes)?;
                (
                    ciphertext,
                    Some((hex::encode(iv), hex::encode(tag))),
                )
            }
            None => (bytes.to_vec(), None),
        };

        write_owner_only(&data_path, &payload)?;

        let meta = LocalMeta {
            original_name: filename.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len(),
            saved_at: Utc::now().to_rfc3339(),
            file_id: file_id.clone(),
            encrypted: encrypted_fields.is_some(),
            algorithm: encrypted_fields.as_ref().map(|_| "AES-256-GCM".to_string()),
            iv: encrypted_fields.as_ref().map(|(iv, _)| iv.clone()),
            auth_tag: encrypted_fields.as_ref().map(|(_, tag)| tag.clone()),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).context("serializing attachment meta")?;
        write_owner_only(&meta_path, &meta_bytes)?;

        Ok((data_path, file_id))
    }

    /// Reads content and meta together, decrypting if the meta marks the
    /// content as encrypted. An auth-tag mismatch surfaces as an error.
    pub fn read(&self, data_path: &Path) -> Result<LocalAttachment> {
        let meta_path = self.meta_path(data_path);
        let meta_bytes = std::fs::read(&meta_path)
            .with_context(|| format!("reading meta file {}", meta_path.display()))?;
        let meta: LocalMeta = serde_json::from_slice(&meta_bytes).context("parsing attachment meta")?;

        let raw = std::fs::read(data_path).with_context(|| format!("reading attachment {}", data_path.display()))?;

        let bytes = if meta.encrypted {
            let key = self
                .encryption_key
                .ok_or_else(|| anyhow!("attachment is encrypted but no LOCAL_STORAGE_ENCRYPTION_KEY is configured"))?;
            let iv = hex::decode(meta.iv.as_deref().unwrap_or_default()).context("decoding IV")?;
            let tag = hex::decode(meta.auth_tag.as_deref().unwrap_or_default()).context("decoding auth tag")?;
            decrypt(&key, &raw, &iv, &tag)?
        } else {
            raw
        };

        Ok(LocalAttachment {
            bytes,
            content_type: meta.content_type,
            original_name: meta.original_name,
        })
    }

    /// Removes both the data file and its meta sibling. Idempotent.
    pub fn remove(&self, data_path: &Path) -> Result<()> {
        let meta_path = self.meta_path(data_path);
        remove_if_exists(data_path)?;
        remove_if_exists(&meta_path)?;
        Ok(())
    }

    /// Every still-pending locally-stored item (data + meta both present),
    /// garbage-collecting any `.meta` file whose data sibling is gone.
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        let mut pending = Vec::new();
        let entries = std::fs::read_dir(&self.dir).context("reading local storage directory")?;
        for entry in entries {
            let entry = entry.context("reading local storage entry")?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".meta") {
                continue;
            }
            let data_path = self.dir.join(name.trim_end_matches(".meta"));
            if data_path.exists() {
                pending.push(data_path);
            } else {
                // Orphaned meta file: its data sibling is gone, clean it up.
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(pending)
    }

    /// Deletes every data+meta pair whose data file's mtime is older than
    /// `retention`.
    pub fn sweep_expired(&self, retention: std::time::Duration) -> Result<usize> {
        let mut removed = 0;
        let entries = std::fs::read_dir(&self.dir).context("reading local storage directory")?;
        for entry in entries {
            let entry = entry.context("reading local storage entry")?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".meta") {
                continue;
            }
            let metadata = entry.metadata().context("reading file metadata")?;
            let modified = metadata.modified().context("reading file mtime")?;
            if modified.elapsed().unwrap_or_default() > retention {
                self.remove(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn meta_path(&self, data_path: &Path) -> PathBuf {
        let mut name = data_path.file_name().unwrap_or_default().to_os_string();
        name.push(".meta");
        data_path.with_file_name(name)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

fn write_owner_only(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut file = opts.open(path).with_context(|| format!("creating {}", path.display()))?;
    std::io::Write::write_all(&mut file, bytes)?;
    Ok(())
}

fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 12], Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("invalid AES key: {e}"))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow!("AES-GCM encryption failed: {e}"))?;
    // aes-gcm appends the 16-byte tag to the ciphertext; split it out so the
    // meta file can record it explicitly per the on-disk layout.
    let tag = ciphertext.split_off(ciphertext.len() - 16);
    Ok((ciphertext, nonce.into(), tag))
}

fn decrypt(key: &[u8; 32], ciphertext: &[u8], iv: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("invalid AES key: {e}"))?;
    let nonce = Nonce::from_slice(iv);

    let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|e| anyhow!("AES-GCM decryption failed (auth tag mismatch?): {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_read_round_trips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), None).unwrap();

        let (path, _id) = store.save("doc.pdf", "application/pdf", b"hello attachment").unwrap();
        let read_back = store.read(&path).unwrap();

        assert_eq!(read_back.bytes, b"hello attachment");
        assert_eq!(read_back.original_name, "doc.pdf");
    }

    #[test]
    fn save_then_read_round_trips_encrypted_content() {
        let dir = tempfile::tempdir().unwrap();
        let key = [0x42u8; 32];
        let store = LocalStore::open(dir.path(), Some(key)).unwrap();

        let (path, _id) = store.save("secret.txt", "text/plain", b"top secret bytes").unwrap();
        let read_back = store.read(&path).unwrap();

        assert_eq!(read_back.bytes, b"top secret bytes");
    }

    #[test]
    fn remove_deletes_both_data_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), None).unwrap();
        let (path, _id) = store.save("a.txt", "text/plain", b"x").unwrap();

        store.remove(&path).unwrap();

        assert!(!path.exists());
        assert_eq!(store.pending().unwrap().len(), 0);
    }

    #[test]
    fn pending_lists_saved_items_and_collects_orphaned_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path(), None).unwrap();
        let (path, _id) = store.save("a.txt", "text/plain", b"x").unwrap();

        // Simulate a crash that left an orphaned meta file behind.
        std::fs::write(dir.path().join("orphan.meta"), b"{}").unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending, vec![path]);
        assert!(!dir.path().join("orphan.meta").exists());
    }
}
