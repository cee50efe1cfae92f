//! On-disk artifacts for a namespace.
//!
//! Each namespace is stored as `<sha256(namespace)>.index` (the binary flat
//! index) next to `<sha256(namespace)>.json` (the document records in row
//! order).
//!
//! The records file is the commit point. A save writes both temp files, then
//! renames the index and finally the records. Rows only ever get appended, so
//! an index that is longer than its records holds an uncommitted tail from an
//! interrupted save and is trimmed back on load.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use super::DocumentRecord;
use crate::error::{RecallError, RecallResult};
use crate::index::FlatIndex;

/// Lowercase hex SHA-256 of the namespace string.
pub(crate) fn namespace_key(namespace: &str) -> String {
    format!("{:x}", Sha256::digest(namespace.as_bytes()))
}

pub(crate) struct Artifacts {
    index: PathBuf,
    records: PathBuf,
}

impl Artifacts {
    pub(crate) fn new(root: &Path, key: &str) -> Self {
        Self {
            index: root.join(format!("{key}.index")),
            records: root.join(format!("{key}.json")),
        }
    }

    /// `Ok(None)` when the namespace has no committed records. Anything
    /// present but unusable is reported as [`RecallError::CorruptIndex`].
    pub(crate) async fn load(
        &self,
        namespace: &str,
    ) -> RecallResult<Option<(FlatIndex, Vec<DocumentRecord>)>> {
        let corrupt = |reason: String| RecallError::CorruptIndex {
            namespace: namespace.to_string(),
            reason,
        };

        let index_exists = tokio::fs::try_exists(&self.index).await.unwrap_or(false);
        let records_exist = tokio::fs::try_exists(&self.records).await.unwrap_or(false);
        match (index_exists, records_exist) {
            (_, false) => return Ok(None),
            (false, true) => return Err(corrupt("records without an index".into())),
            (true, true) => {}
        }

        let index_bytes = tokio::fs::read(&self.index)
            .await
            .map_err(|e| corrupt(format!("reading index: {e}")))?;
        let mut index = FlatIndex::from_bytes(&index_bytes).map_err(corrupt)?;

        let record_bytes = tokio::fs::read(&self.records)
            .await
            .map_err(|e| corrupt(format!("reading records: {e}")))?;
        let records: Vec<DocumentRecord> = serde_json::from_slice(&record_bytes)
            .map_err(|e| corrupt(format!("decoding records: {e}")))?;

        if index.len() < records.len() {
            return Err(corrupt(format!(
                "index has {} rows but {} records",
                index.len(),
                records.len()
            )));
        }
        if index.len() > records.len() {
            warn!(
                namespace,
                rows = index.len(),
                records = records.len(),
                "dropping uncommitted index rows"
            );
            index.truncate(records.len());
        }
        Ok(Some((index, records)))
    }

    pub(crate) async fn save(&self, index: &FlatIndex, records: &[DocumentRecord]) -> RecallResult<()> {
        if let Some(dir) = self.index.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec(records)?;
        let index_tmp = tmp_path(&self.index);
        let records_tmp = tmp_path(&self.records);

        let staged = async {
            tokio::fs::write(&index_tmp, index.to_bytes()).await?;
            tokio::fs::write(&records_tmp, &json).await
        }
        .await;
        if let Err(e) = staged {
            let _ = tokio::fs::remove_file(&index_tmp).await;
            let _ = tokio::fs::remove_file(&records_tmp).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&index_tmp, &self.index).await {
            let _ = tokio::fs::remove_file(&records_tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&records_tmp, &self.records).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
