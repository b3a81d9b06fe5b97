//! Health reporting capability and report merging.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::error::{Error, Result, join_errors};

/// Health of every component in a tree, keyed by qualified name.
pub type HealthReport = HashMap<String, Result<()>>;

/// Anything that can report readiness and health.
pub trait HealthReporter: Send + Sync {
    /// Qualified name, unique across the process.
    fn name(&self) -> &str;

    /// Whether the component has finished starting.
    ///
    /// # Errors
    ///
    /// Returns why the component is not ready.
    fn ready(&self) -> Result<()>;

    /// Health of this component and everything beneath it.
    fn health_report(&self) -> HealthReport;
}

/// What to do when two reports share a name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Treat the duplicate as a configuration bug and panic.
    Panic,
    /// Join both errors under the shared name.
    Join,
}

impl Default for DuplicatePolicy {
    /// Strict in debug builds, which includes test builds.
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Join
        }
    }
}

/// Merges `src` into `dest` with the default [`DuplicatePolicy`].
pub fn copy_health(dest: &mut HealthReport, src: HealthReport) {
    merge_health(dest, src, DuplicatePolicy::default());
}

/// Merges `src` into `dest`, resolving shared names with `policy`.
///
/// # Panics
///
/// Panics on a shared name if `policy` is [`DuplicatePolicy::Panic`].
pub fn merge_health(dest: &mut HealthReport, src: HealthReport, policy: DuplicatePolicy) {
    for (name, result) in src {
        match dest.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(result);
            }
            Entry::Occupied(mut entry) => {
                assert!(
                    policy != DuplicatePolicy::Panic,
                    "duplicate health report name {:?}",
                    entry.key()
                );
                let merged = join_errors([entry.get().clone(), result]);
                entry.insert(merged);
            }
        }
    }
}

/// Whether any entry of `report` holds an error matching `predicate`.
pub fn contains_error<F>(report: &HealthReport, predicate: F) -> bool
where
    F: Fn(&Error) -> bool + Copy,
{
    report
        .values()
        .any(|result| result.as_ref().is_err_and(|err| err.any(predicate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn report(entries: Vec<(&str, Result<()>)>) -> HealthReport {
        entries
            .into_iter()
            .map(|(name, result)| (name.to_string(), result))
            .collect()
    }

    #[test]
    fn test_merge_disjoint() {
        let mut dest = report(vec![("a", Ok(()))]);
        copy_health(&mut dest, report(vec![("b", Err(Error::custom("b failed")))]));

        assert_eq!(dest.len(), 2);
        assert!(dest["a"].is_ok());
        assert!(dest["b"].is_err());
    }

    #[test]
    fn test_merge_duplicate_joins() {
        let mut dest = report(vec![("a", Err(Error::custom("first")))]);
        merge_health(
            &mut dest,
            report(vec![("a", Err(Error::custom("second")))]),
            DuplicatePolicy::Join,
        );

        assert_eq!(dest.len(), 1);
        assert_matches!(&dest["a"], Err(Error::Joined(joined)) if joined.errors().len() == 2);
    }

    #[test]
    fn test_merge_duplicate_of_healthy_entries_stays_healthy() {
        let mut dest = report(vec![("a", Ok(()))]);
        merge_health(&mut dest, report(vec![("a", Ok(()))]), DuplicatePolicy::Join);

        assert!(dest["a"].is_ok());
    }

    #[test]
    #[should_panic(expected = "duplicate health report name")]
    fn test_merge_duplicate_panics_when_strict() {
        let mut dest = report(vec![("a", Ok(()))]);
        merge_health(&mut dest, report(vec![("a", Ok(()))]), DuplicatePolicy::Panic);
    }

    #[test]
    fn test_contains_error() {
        let report = report(vec![
            ("a", Ok(())),
            ("b", Err(Error::WaitGroupStopped)),
        ]);

        assert!(contains_error(&report, |e| matches!(e, Error::WaitGroupStopped)));
        assert!(!contains_error(&report, |e| matches!(e, Error::EmptyName)));
    }
}
