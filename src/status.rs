//! Pipeline and index health overview.
//!
//! Shows where the cursor stands and how many documents the index holds, so
//! users can confirm that embed runs are making progress. An unreachable
//! index is reported, not treated as an error.

use anyhow::Result;

use crate::config::Config;
use crate::cursor::{Cursor, CursorStore};
use crate::index::elastic::ElasticIndex;
use crate::index::DocumentIndex;
use crate::present::{relative_time, TimeStyle};
use crate::progress::format_number;

/// Snapshot printed by `imsg-lens status`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub archive: String,
    pub archive_present: bool,
    pub state_path: String,
    pub cursor: Cursor,
    pub index: String,
    /// Document count, or the reason it could not be read.
    pub documents: Result<u64, String>,
}

impl StatusReport {
    pub fn render(&self, now: i64) -> Vec<String> {
        let last_run = match self.cursor.last_run_ts() {
            Some(ts) => relative_time(ts, now, TimeStyle::Long),
            None => "never".to_string(),
        };
        let documents = match &self.documents {
            Ok(n) => format_number(*n),
            Err(reason) => format!("unavailable ({})", reason),
        };

        vec![
            "imsg-lens status".to_string(),
            String::new(),
            format!(
                "  Archive:     {}{}",
                self.archive,
                if self.archive_present { "" } else { " (missing)" }
            ),
            format!("  State:       {}", self.state_path),
            format!("  Watermark:   {}", self.cursor.watermark),
            format!(
                "  Embedded:    {} (all time)",
                format_number(self.cursor.total_processed)
            ),
            format!("  Last run:    {}", last_run),
            String::new(),
            format!("  Index:       {}", self.index),
            format!("  Documents:   {}", documents),
        ]
    }
}

pub async fn collect(config: &Config, index: &dyn DocumentIndex) -> StatusReport {
    let store = CursorStore::new(&config.state.path);
    let documents = index.count().await.map_err(|e| e.to_string());

    StatusReport {
        archive: config.archive.path.display().to_string(),
        archive_present: config.archive.path.is_file(),
        state_path: store.path().display().to_string(),
        cursor: store.load(),
        index: index.describe(),
        documents,
    }
}

/// Run the status command and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let index = ElasticIndex::new(&config.index)?;
    let report = collect(config, &index).await;
    for line in report.render(chrono::Utc::now().timestamp()) {
        println!("{}", line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::InMemoryIndex;

    #[tokio::test]
    async fn status_without_prior_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state.path = tmp.path().join("state.json");
        config.archive.path = tmp.path().join("chat.db");

        let report = collect(&config, &InMemoryIndex::new()).await;
        assert_eq!(report.cursor, Cursor::default());
        assert!(!report.archive_present);
        assert_eq!(report.documents, Ok(0));

        let lines = report.render(0);
        assert!(lines.iter().any(|l| l.contains("Last run:    never")));
        assert!(lines.iter().any(|l| l.contains("(missing)")));
    }

    #[test]
    fn unavailable_index_is_rendered() {
        let report = StatusReport {
            archive: "chat.db".into(),
            archive_present: true,
            state_path: "state.json".into(),
            cursor: Cursor {
                watermark: 12,
                total_processed: 1500,
                last_run: None,
            },
            index: "http://localhost:9200/imessage_chunks".into(),
            documents: Err("index unreachable".into()),
        };
        let lines = report.render(0);
        assert!(lines.iter().any(|l| l.ends_with("1,500 (all time)")));
        assert!(lines.iter().any(|l| l.contains("unavailable (index unreachable)")));
    }
}
