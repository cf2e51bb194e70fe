use crate::logger::BundleLogger;
use databundle_store::{FinalizeError, Partition};

/// Tally of one finalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeSummary {
    pub finalized: usize,
    /// References and partitions that were already finalized.
    pub skipped: usize,
    pub unsupported: usize,
    pub failed: usize,
}

/// Compute statistics for every partition that needs them, in enumeration
/// order.
///
/// A partition kind without statistics is logged and passed over, and a
/// configuration error fails only that partition. An operational error
/// aborts the pass and is returned. Every partition that was attempted is
/// closed, whatever the outcome.
pub fn post_build_finalize(
    partitions: &mut [Box<dyn Partition>],
    logger: &mut BundleLogger,
) -> Result<FinalizeSummary, FinalizeError> {
    let mut summary = FinalizeSummary::default();

    for partition in partitions.iter_mut() {
        if partition.is_reference() || partition.is_finalized() {
            summary.skipped += 1;
            continue;
        }

        logger.info(&format!("finalizing partition {}", partition.identity()));
        let outcome = partition.finalize();
        partition.close();

        match outcome {
            Ok(()) => summary.finalized += 1,
            Err(FinalizeError::NotImplemented { partition: name, .. }) => {
                logger.info(&format!(
                    "cannot finalize partition {name}: not implemented for this kind"
                ));
                summary.unsupported += 1;
            }
            Err(e @ FinalizeError::Configuration { .. }) => {
                logger.error(&e.to_string());
                summary.failed += 1;
            }
            Err(e @ FinalizeError::Operational { .. }) => {
                logger.error(&format!("failed to write partition statistics: {e}"));
                return Err(e);
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::FatalMode;
    use crate::mock::{MockPartition, ScriptedFinalize};

    fn logger() -> BundleLogger {
        BundleLogger::new("example.com-mock-r1", FatalMode::Raise)
    }

    #[test]
    fn configuration_error_does_not_stop_the_loop() {
        let first = MockPartition::new("p1");
        let second = MockPartition::new("p2").with_script(ScriptedFinalize::Configuration);
        let third = MockPartition::new("p3");
        let closes = [first.close_calls(), second.close_calls(), third.close_calls()];
        let finalizes = [first.finalize_calls(), third.finalize_calls()];

        let mut parts = vec![first.boxed(), second.boxed(), third.boxed()];
        let mut log = logger();
        let summary = post_build_finalize(&mut parts, &mut log).unwrap();

        assert_eq!(summary.finalized, 2);
        assert_eq!(summary.failed, 1);
        assert!(parts[0].is_finalized());
        assert!(!parts[1].is_finalized());
        assert!(parts[2].is_finalized());
        for counter in &closes {
            assert_eq!(counter.get(), 1);
        }
        for counter in &finalizes {
            assert_eq!(counter.get(), 1);
        }
        assert_eq!(log.errors().len(), 1);
        assert!(log.errors()[0].contains("p2"));
    }

    #[test]
    fn operational_error_aborts_the_loop() {
        let first = MockPartition::new("p1");
        let second = MockPartition::new("p2").with_script(ScriptedFinalize::Operational);
        let third = MockPartition::new("p3");
        let second_closes = second.close_calls();
        let third_finalizes = third.finalize_calls();
        let third_closes = third.close_calls();

        let mut parts = vec![first.boxed(), second.boxed(), third.boxed()];
        let err = post_build_finalize(&mut parts, &mut logger()).unwrap_err();

        assert!(matches!(err, FinalizeError::Operational { .. }));
        assert_eq!(second_closes.get(), 1);
        assert_eq!(third_finalizes.get(), 0);
        assert_eq!(third_closes.get(), 0);
    }

    #[test]
    fn not_implemented_is_not_an_error() {
        let geo = MockPartition::new("geo").with_script(ScriptedFinalize::NotImplemented);
        let mut parts = vec![geo.boxed()];
        let mut log = logger();
        let summary = post_build_finalize(&mut parts, &mut log).unwrap();
        assert_eq!(summary.unsupported, 1);
        assert!(log.errors().is_empty());
    }

    #[test]
    fn references_and_finalized_partitions_are_skipped() {
        let alias = MockPartition::new("alias").as_reference();
        let done = MockPartition::new("done").already_finalized();
        let calls = [alias.finalize_calls(), done.finalize_calls()];
        let closes = [alias.close_calls(), done.close_calls()];

        let mut parts = vec![alias.boxed(), done.boxed()];
        let summary = post_build_finalize(&mut parts, &mut logger()).unwrap();

        assert_eq!(summary.skipped, 2);
        for counter in calls.iter().chain(&closes) {
            assert_eq!(counter.get(), 0);
        }
    }
}
