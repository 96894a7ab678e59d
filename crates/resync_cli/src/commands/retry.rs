//! Retry-failed command implementation.

use super::{CliError, Target};
use resync_engine::SyncState;
use std::io::Write;
use tracing::debug;

/// Runs the retry-failed command.
///
/// Moves Failed records (or just `key`) back to Dirty with a fresh retry
/// budget; the next engine that opens the directory delivers them.
pub fn run(target: &Target, key: Option<&str>, out: &mut impl Write) -> Result<usize, CliError> {
    let store = target.open()?;
    let mut rearmed = 0;

    for record in store.list()? {
        if record.sync_state != SyncState::Failed {
            continue;
        }
        if key.is_some_and(|wanted| wanted != record.key) {
            continue;
        }
        if store.reset(&record.key)?.is_some() {
            debug!(key = %record.key, "re-armed");
            writeln!(out, "  {}", record.key)?;
            rearmed += 1;
        }
    }

    writeln!(out, "Re-armed {rearmed} failed record(s)")?;
    Ok(rearmed)
}
