//! Fast-resume records, so a restarted transfer can skip re-hashing.

use std::path::PathBuf;

use anyhow::Context;
use libmule_core::Id16;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::type_aliases::BF;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    pub hash: Id16,
    pub total_pieces: u32,
    /// Verified pieces.
    #[serde(with = "bitmap_base64")]
    pub have: BF,
    pub accepted: u64,
    pub requested: u64,
    pub transferred: u64,
    #[serde(default)]
    pub paused: bool,
}

mod bitmap_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::type_aliases::BF;

    pub fn serialize<S: Serializer>(bf: &BF, s: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bf.as_raw_slice());
        s.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BF, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(BF::from_vec(bytes))
    }
}

impl ResumeData {
    /// The have bitmap trimmed to the piece count.
    pub fn have_pieces(&self) -> BF {
        let mut have = self.have.clone();
        have.resize(self.total_pieces as usize, false);
        have
    }
}

/// One JSON file per transfer in a folder.
#[derive(Debug, Clone)]
pub struct ResumeDataStore {
    folder: PathBuf,
}

impl ResumeDataStore {
    pub async fn new(folder: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&folder)
            .await
            .with_context(|| format!("couldn't create directory {folder:?} for resume data"))?;
        Ok(Self { folder })
    }

    fn filename(&self, hash: &Id16) -> PathBuf {
        self.folder.join(format!("{hash}.resume.json"))
    }

    pub async fn load(&self, hash: &Id16) -> anyhow::Result<Option<ResumeData>> {
        let filename = self.filename(hash);
        let buf = match tokio::fs::read(&filename).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("error reading {filename:?}")),
        };
        let rd: ResumeData = serde_json::from_slice(&buf)
            .with_context(|| format!("error deserializing {filename:?}"))?;
        if rd.hash != *hash {
            anyhow::bail!("{filename:?} is for {}, expected {hash}", rd.hash);
        }
        Ok(Some(rd))
    }

    /// Writes to a temporary file, then renames over the old record.
    pub async fn save(&self, rd: &ResumeData) -> anyhow::Result<()> {
        let filename = self.filename(&rd.hash);
        let tmp_filename = filename.with_extension("json.tmp");
        let buf = serde_json::to_vec(rd).context("error serializing resume data")?;
        let mut tmp = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_filename)
            .await
            .with_context(|| format!("error opening {tmp_filename:?}"))?;
        tmp.write_all(&buf)
            .await
            .with_context(|| format!("error writing {tmp_filename:?}"))?;
        tmp.flush().await?;
        tokio::fs::rename(&tmp_filename, &filename)
            .await
            .context("error renaming resume data file")?;
        trace!(?filename, "wrote resume data");
        Ok(())
    }

    pub async fn delete(&self, hash: &Id16) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.filename(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResumeData {
        let mut have = BF::repeat(false, 11);
        have.set(0, true);
        have.set(10, true);
        ResumeData {
            hash: Id16::new([7; 16]),
            total_pieces: 11,
            have,
            accepted: 1,
            requested: 2,
            transferred: 3,
            paused: false,
        }
    }

    #[test]
    fn test_have_is_base64() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json["have"].is_string());
        let back: ResumeData = serde_json::from_value(json).unwrap();
        let have = back.have_pieces();
        assert_eq!(have.len(), 11);
        assert_eq!(have.iter_ones().collect::<Vec<_>>(), vec![0, 10]);
    }

    #[tokio::test]
    async fn test_store() {
        let dir = tempfile::TempDir::with_prefix("libmule-resume").unwrap();
        let store = ResumeDataStore::new(dir.path().join("resume")).await.unwrap();
        let rd = sample();
        assert!(store.load(&rd.hash).await.unwrap().is_none());
        store.save(&rd).await.unwrap();
        let loaded = store.load(&rd.hash).await.unwrap().unwrap();
        assert_eq!(loaded.have_pieces(), rd.have);
        assert_eq!(loaded.transferred, 3);
        store.delete(&rd.hash).await.unwrap();
        assert!(store.load(&rd.hash).await.unwrap().is_none());
    }
}
