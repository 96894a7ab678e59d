//! Inspect command implementation.

use super::{CliError, Target};
use resync_engine::{Record, SyncState};
use serde::Serialize;
use std::io::Write;

/// Directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Record directory.
    pub path: String,
    /// Application namespace.
    pub namespace: String,
    /// User identifier.
    pub user_id: String,
    /// Records waiting for delivery (Dirty or Syncing).
    pub pending: usize,
    /// Records the remote holds.
    pub synced: usize,
    /// Records that gave up.
    pub failed: usize,
    /// Every record, ordered by key.
    pub records: Vec<RecordSummary>,
}

/// One record without its payload.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    /// Record key.
    pub key: String,
    /// Sync state name.
    pub state: &'static str,
    /// Record version.
    pub version: u64,
    /// Failed delivery attempts of this version.
    pub attempt: u32,
    /// Payload size in bytes.
    pub payload_bytes: usize,
    /// Last delivery error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time of the last change, in ms since the epoch.
    pub last_updated: u64,
}

impl From<&Record> for RecordSummary {
    fn from(record: &Record) -> Self {
        Self {
            key: record.key.clone(),
            state: record.sync_state.as_str(),
            version: record.version,
            attempt: record.attempt,
            payload_bytes: record.payload.len(),
            last_error: record.last_error.clone(),
            last_updated: record.last_updated,
        }
    }
}

/// Runs the inspect command.
pub fn run(target: &Target, format: &str, out: &mut impl Write) -> Result<(), CliError> {
    let store = target.open()?;
    let records = store.list()?;

    let count = |wanted: fn(SyncState) -> bool| {
        records
            .iter()
            .filter(|record| wanted(record.sync_state))
            .count()
    };
    let result = InspectResult {
        path: target.path.display().to_string(),
        namespace: target.config.namespace.clone(),
        user_id: target.config.user_id.clone(),
        pending: count(|state| state.is_pending()),
        synced: count(|state| state == SyncState::Synced),
        failed: count(|state| state == SyncState::Failed),
        records: records.iter().map(RecordSummary::from).collect(),
    };

    match format {
        "json" => writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?,
        _ => print_text_output(&result, out)?,
    }

    Ok(())
}

fn print_text_output(result: &InspectResult, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "Records: {}", result.path)?;
    writeln!(out, "  Namespace: {}/{}", result.namespace, result.user_id)?;
    writeln!(
        out,
        "  Pending: {}  Synced: {}  Failed: {}",
        result.pending, result.synced, result.failed
    )?;

    if result.records.is_empty() {
        writeln!(out, "  (no records)")?;
        return Ok(());
    }

    writeln!(out)?;
    writeln!(
        out,
        "  {:<32} {:<8} {:>15} {:>7} {:>8}",
        "KEY", "STATE", "VERSION", "ATTEMPT", "BYTES"
    )?;
    for record in &result.records {
        writeln!(
            out,
            "  {:<32} {:<8} {:>15} {:>7} {:>8}",
            record.key, record.state, record.version, record.attempt, record.payload_bytes
        )?;
        if let Some(error) = &record.last_error {
            writeln!(out, "    last error: {error}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{output, populated};

    #[test]
    fn text_lists_records_and_counts() {
        let (_dir, target) = populated(&[("progress_1", "{}"), ("settings", "dark")], &["settings"]);

        let text = output(|out| run(&target, "text", out).unwrap());

        assert!(text.contains("Namespace: lingo/user-1"));
        assert!(text.contains("Pending: 1  Synced: 0  Failed: 1"));
        assert!(text.contains("progress_1"));
        assert!(text.contains("last error: rejected by remote: bad schema"));
    }

    #[test]
    fn json_is_machine_readable() {
        let (_dir, target) = populated(&[("progress_1", "{score:80}")], &[]);

        let json = output(|out| run(&target, "json", out).unwrap());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["pending"], 1);
        assert_eq!(value["records"][0]["key"], "progress_1");
        assert_eq!(value["records"][0]["state"], "dirty");
        assert_eq!(value["records"][0]["payload_bytes"], 10);
        assert!(value["records"][0].get("last_error").is_none());
    }

    #[test]
    fn other_users_are_not_listed() {
        let (_dir, target) = populated(&[("progress_1", "1")], &[]);
        let other = Target::new(target.path.clone(), "lingo", "user-2");

        let text = output(|out| run(&other, "text", out).unwrap());
        assert!(text.contains("(no records)"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let target = Target::new("/nonexistent/resync".into(), "lingo", "user-1");
        let err = run(&target, "text", &mut Vec::new()).unwrap_err();
        assert!(matches!(err, CliError::Missing(_)));
    }
}
