use serde::{Deserialize, Serialize};

/// Flags consulted throughout one orchestrator invocation. Built once by the
/// caller and never mutated by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Rebuild the schema and partitions even if already prepared.
    pub rebuild: bool,
    /// Re-run phases whose completion markers are already set.
    pub force: bool,
    /// Clean before running, and re-run meta generation.
    pub clean: bool,
    /// Skip per-column schema validation.
    pub fast: bool,
    /// Degree of parallelism for dispatched work. `0` means every available
    /// core, `1` runs in the caller's own process.
    pub multi: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            rebuild: false,
            force: false,
            clean: false,
            fast: false,
            multi: 1,
        }
    }
}

impl RunOptions {
    /// `multi` with `0` resolved to the number of logical cores.
    pub fn parallelism(&self) -> usize {
        resolve_parallelism(self.multi)
    }
}

pub fn resolve_parallelism(degree: usize) -> usize {
    if degree == 0 {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    } else {
        degree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_serial() {
        let opts = RunOptions::default();
        assert_eq!(opts.parallelism(), 1);
        assert!(!opts.rebuild && !opts.force && !opts.clean && !opts.fast);
    }

    #[test]
    fn zero_means_all_cores() {
        assert!(resolve_parallelism(0) >= 1);
        assert_eq!(resolve_parallelism(4), 4);
    }
}
