//! Persistent progress marker for incremental runs.
//!
//! The cursor is a small JSON object:
//!
//! ```json
//! {"last_attachment_rowid": 1234, "total_images_embedded": 900, "last_run": "2024-05-01T10:00:00+00:00"}
//! ```
//!
//! Loading is permissive (a missing or unreadable file means "no prior
//! state"); saving is an atomic overwrite and any failure is fatal to the run.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "last_attachment_rowid", default)]
    pub watermark: i64,
    #[serde(rename = "total_images_embedded", default)]
    pub total_processed: u64,
    /// ISO-8601; older state files carry a naive local timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
}

impl Cursor {
    /// `last_run` as Unix seconds, if it parses.
    pub fn last_run_ts(&self) -> Option<i64> {
        let raw = self.last_run.as_deref()?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.timestamp());
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .and_then(|naive| naive.and_local_timezone(chrono::Local).earliest())
            .map(|dt| dt.timestamp())
    }

    /// The cursor that follows a run.
    ///
    /// The watermark never moves backwards, even after a `--full` run.
    pub fn advance(&self, max_seen: Option<i64>, processed: u64, now: DateTime<Utc>) -> Cursor {
        Cursor {
            watermark: max_seen.map_or(self.watermark, |m| m.max(self.watermark)),
            total_processed: self.total_processed + processed,
            last_run: Some(now.to_rfc3339()),
        }
    }
}

/// File-backed cursor storage.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted cursor, or the zero cursor if there is none.
    pub fn load(&self) -> Cursor {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Cursor::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "could not read cursor, starting from zero");
                return Cursor::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "could not parse cursor, starting from zero");
                Cursor::default()
            }
        }
    }

    /// Atomically replace the persisted cursor.
    pub fn save(&self, cursor: &Cursor) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory: {}", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string(cursor)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write cursor: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace cursor: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_zero_cursor() {
        let tmp = TempDir::new().unwrap();
        let store = CursorStore::new(tmp.path().join("state.json"));
        let cursor = store.load();
        assert_eq!(cursor.watermark, 0);
        assert_eq!(cursor.total_processed, 0);
        assert!(cursor.last_run.is_none());
    }

    #[test]
    fn corrupt_file_loads_zero_cursor() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(CursorStore::new(path).load(), Cursor::default());
    }

    #[test]
    fn save_creates_directory_and_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = CursorStore::new(tmp.path().join("nested/dir/state.json"));
        let cursor = Cursor {
            watermark: 42,
            total_processed: 7,
            last_run: Some(Utc::now().to_rfc3339()),
        };
        store.save(&cursor).unwrap();
        assert_eq!(store.load().watermark, 42);
        assert_eq!(store.load().total_processed, 7);
    }

    #[test]
    fn uses_legacy_field_names() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"last_attachment_rowid": 12, "total_images_embedded": 3, "last_run": "2024-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        let cursor = CursorStore::new(&path).load();
        assert_eq!(cursor.watermark, 12);
        assert_eq!(cursor.total_processed, 3);
        assert_eq!(cursor.last_run_ts(), Some(1704164645));

        CursorStore::new(&path).save(&cursor).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"last_attachment_rowid\":12"));
    }

    #[test]
    fn naive_last_run_still_loads() {
        let cursor: Cursor = serde_json::from_str(
            r#"{"last_attachment_rowid": 5, "total_images_embedded": 1, "last_run": "2024-01-02T03:04:05.123456"}"#,
        )
        .unwrap();
        assert_eq!(cursor.watermark, 5);
        assert!(cursor.last_run_ts().is_some());
    }

    #[test]
    fn advance_never_moves_backwards() {
        let old = Cursor {
            watermark: 50,
            total_processed: 10,
            last_run: None,
        };
        let next = old.advance(Some(20), 2, Utc::now());
        assert_eq!(next.watermark, 50);
        assert_eq!(next.total_processed, 12);

        let next = old.advance(Some(70), 0, Utc::now());
        assert_eq!(next.watermark, 70);

        let next = old.advance(None, 0, Utc::now());
        assert_eq!(next.watermark, 50);
    }
}
