use databundle_schema::{BundleManifest, CoverageSection};
use databundle_store::Coverage;
use std::collections::BTreeSet;
use tracing::warn;

/// Widest range, in years, a single time term may span.
const MAX_SPAN: i64 = 1000;

/// Expand a time expression into the years it covers.
///
/// Accepts single years, inclusive ranges (`2010-2012` or `2010/2012`), and
/// comma separated lists of either. Terms that are not years, and ranges
/// wider than a millennium, are ignored.
pub fn expand_to_years(expr: &str) -> Vec<i32> {
    let mut years = BTreeSet::new();
    for term in expr.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let bounds: Vec<&str> = term.splitn(2, ['-', '/']).map(str::trim).collect();
        match bounds.as_slice() {
            [single] => {
                if let Ok(year) = single.parse() {
                    years.insert(year);
                }
            }
            [start, end] => {
                if let (Ok(start), Ok(end)) = (start.parse::<i32>(), end.parse::<i32>()) {
                    let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
                    if i64::from(hi) - i64::from(lo) > MAX_SPAN {
                        warn!("ignoring time range '{term}': spans more than {MAX_SPAN} years");
                        continue;
                    }
                    years.extend(lo..=hi);
                }
            }
            _ => {}
        }
    }
    years.into_iter().collect()
}

/// Recompute bundle coverage from the manifest's `[about]` section, the
/// identity's time and space components, and every partition's coverage.
pub fn recompute(manifest: &BundleManifest, partitions: &[Coverage]) -> CoverageSection {
    let mut time = BTreeSet::new();
    let mut geo = BTreeSet::new();
    let mut grain = BTreeSet::new();

    let about = &manifest.about;
    let identity = &manifest.identity;
    for expr in [about.time.as_deref(), identity.btime.as_deref()]
        .into_iter()
        .flatten()
    {
        time.extend(expand_to_years(expr));
    }
    geo.extend(about.space.iter().cloned());
    geo.extend(identity.bspace.iter().cloned());
    grain.extend(about.grain.iter().cloned());

    for coverage in partitions {
        time.extend(coverage.time.iter().copied());
        geo.extend(coverage.geo.iter().cloned());
        grain.extend(coverage.grain.iter().cloned());
    }

    CoverageSection {
        time: time.into_iter().collect(),
        geo: geo.into_iter().collect(),
        grain: grain.into_iter().collect(),
    }
}
