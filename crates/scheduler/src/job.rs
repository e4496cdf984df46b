//! The unit of periodic work a scheduler row stands for.

use async_trait::async_trait;
use uds_domain::Result;

/// A named, periodic unit of work. `name()` doubles as the
/// [`uds_domain::entities::ScheduleRow`] registry key, so renaming a job
/// orphans its old row rather than reusing it — matching the original
/// broker's behavior of treating the class name as identity.
#[async_trait]
pub trait Job: Send + Sync {
    /// Registry key and `ScheduleRow::name`. Must be stable across
    /// releases: changing it creates a new row rather than migrating the
    /// old one.
    fn name(&self) -> &str;

    /// Operator-facing label, shown in logs and admin tooling.
    fn friendly_name(&self) -> &str {
        self.name()
    }

    /// Seconds between successive executions once this run completes.
    fn frequency_seconds(&self) -> u32;

    /// Runs one pass. Called with no Store row lock held — see §5's
    /// suspension-point rule. Any error is caught by the runner, logged,
    /// and treated as "this pass failed"; it never crashes the loop.
    async fn run(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    #[async_trait]
    impl Job for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn frequency_seconds(&self) -> u32 {
            30
        }
        async fn run(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn friendly_name_falls_back_to_name() {
        assert_eq!(Noop.friendly_name(), "noop");
    }
}
