//! Clear command implementation.

use super::{CliError, Target};
use std::io::Write;
use tracing::info;

/// Runs the clear command.
///
/// Deletes `key`, or every record of the target user when no key is given.
pub fn run(target: &Target, key: Option<&str>, out: &mut impl Write) -> Result<usize, CliError> {
    let store = target.open()?;
    let removed = match key {
        Some(key) => usize::from(store.delete(key)?),
        None => store.clear_all()?,
    };
    info!(removed, "records cleared");
    writeln!(out, "Removed {removed} record(s)")?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{output, populated};

    #[test]
    fn clears_one_key() {
        let (_dir, target) = populated(&[("a", "1"), ("b", "2")], &[]);

        let text = output(|out| assert_eq!(run(&target, Some("a"), out).unwrap(), 1));
        assert_eq!(text, "Removed 1 record(s)\n");

        let store = target.open().unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert!(store.get("b").unwrap().is_some());
    }

    #[test]
    fn clears_everything_for_the_user() {
        let (_dir, target) = populated(&[("a", "1"), ("b", "2")], &["b"]);

        assert_eq!(run(&target, None, &mut Vec::new()).unwrap(), 2);
        assert!(target.open().unwrap().list().unwrap().is_empty());
    }

    #[test]
    fn unknown_key_removes_nothing() {
        let (_dir, target) = populated(&[("a", "1")], &[]);
        assert_eq!(run(&target, Some("zzz"), &mut Vec::new()).unwrap(), 0);
    }
}
