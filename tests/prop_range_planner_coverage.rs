//! Property: for any start/size/chunk-count triple, the plan `range_planner`
//! produces is gap-free, non-overlapping, and covers exactly
//! `[start, start+size)` (SPEC_FULL.md §8 properties 1/2, §3 Plan
//! invariants).

use proptest::prelude::*;
use xget::range_planner::{plan, resolve_chunk_count};

proptest! {
    #[test]
    fn plan_is_always_contiguous_and_exhaustive(
        start in 0u64..1_000_000,
        size in 0u64..100_000,
        chunks in 1u32..32,
    ) {
        let p = plan(start, Some(size), chunks).unwrap();

        if size == 0 {
            prop_assert!(p.is_empty());
            return Ok(());
        }

        prop_assert_eq!(p[0].min, start);
        let mut cursor = start;
        for r in &p {
            prop_assert_eq!(r.min, cursor);
            prop_assert!(r.max.unwrap() >= r.min);
            cursor = r.max.unwrap() + 1;
        }
        prop_assert_eq!(cursor, start + size);
        prop_assert!(p.len() as u64 <= u64::from(chunks));
    }

    /// `resolve_chunk_count` never returns zero, and never exceeds the
    /// configured target (or the tiny-resource fallback of 5) for a
    /// chunkable resource; a non-chunkable origin always collapses to 1.
    #[test]
    fn resolve_chunk_count_never_zero_or_over_configured(
        configured in 1u32..32,
        size in 0u64..100_000,
        chunkable in any::<bool>(),
    ) {
        let resolved = resolve_chunk_count(configured, size, chunkable);
        prop_assert!(resolved > 0);
        if chunkable {
            prop_assert!(resolved <= configured.max(5));
        } else {
            prop_assert_eq!(resolved, 1);
        }
    }
}
