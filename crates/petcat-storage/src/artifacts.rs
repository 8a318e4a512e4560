//! Immutable archive of raw fetched payloads, addressed by content hash.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already archived at this path.
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        category: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(slug(source))
            .join(format!("{}-{content_hash}.json", slug(category)))
    }

    /// Write bytes once; the temp file is renamed into place so readers never
    /// observe a partial payload.
    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        category: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(fetched_at, source, category, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let archived = |duplicate: bool| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            duplicate,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating payload directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking payload path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

fn slug(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    let joined = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if joined.is_empty() {
        "unknown".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:30:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            PayloadArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn path_layout_uses_stamp_source_and_category() {
        let archive = PayloadArchive::new("/tmp/raw");
        let path = archive.payload_relative_path(fetched_at(), "Zooplus", "Cibo Secco / Cani", "abc");
        assert_eq!(path, PathBuf::from("20260302_093000/zooplus/cibo-secco-cani-abc.json"));
    }

    #[tokio::test]
    async fn repeated_payload_is_detected_as_duplicate() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let body = br#"[{"id":"1","title":"Crocchette"}]"#;

        let first = archive
            .store_payload(fetched_at(), "zooplus", "cani", body)
            .await
            .expect("first store");
        let second = archive
            .store_payload(fetched_at(), "zooplus", "cani", body)
            .await
            .expect("second store");

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.relative_path, second.relative_path);
        assert_eq!(std::fs::read(&first.absolute_path).unwrap(), body.to_vec());
    }
}
