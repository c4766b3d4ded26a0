//! Exact-decimal sibling ordering shared by every reorderable entity
//! (currently just `llm_task`, but deliberately not task-specific).
//!
//! Positions are never binary floats: repeated midpoint insertion on an
//! `f64` loses precision within a few dozen inserts, while `Decimal` only
//! needs rebalancing once the gap between neighbors underflows
//! [`MIN_GAP`].

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Below this gap between two neighboring positions, a rebalance is due
/// rather than continuing to bisect.
pub const MIN_GAP: Decimal = dec!(0.00000095);

/// Position for inserting a new sibling strictly between `left` and
/// `right`. Either bound may be absent (inserting before the first sibling
/// or after the last).
pub fn between(left: Option<Decimal>, right: Option<Decimal>) -> Decimal {
    match (left, right) {
        (Some(l), Some(r)) => (l + r) / Decimal::from(2),
        (None, Some(r)) => r - Decimal::ONE,
        (Some(l), None) => l + Decimal::ONE,
        (None, None) => Decimal::ONE,
    }
}

/// Position for appending after the current last sibling (or the first
/// position in an empty group).
pub fn at_end(max_existing: Option<Decimal>) -> Decimal {
    match max_existing {
        Some(m) => m + Decimal::ONE,
        None => Decimal::ONE,
    }
}

/// Whether two adjacent positions have collapsed close enough together
/// that the group needs rebalancing before another midpoint insert.
pub fn gap_too_small(left: Decimal, right: Decimal) -> bool {
    (right - left).abs() < MIN_GAP
}

/// Freshly spaced positions `1, 2, …, n` for `n` siblings in their current
/// sorted order.
pub fn rebalanced(n: usize) -> Vec<Decimal> {
    (1..=n).map(|i| Decimal::from(i as u64)).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn between_bisects_exactly() {
        assert_eq!(between(Some(dec!(1)), Some(dec!(3))), dec!(2));
    }

    #[test]
    fn at_end_of_empty_group_starts_at_one() {
        assert_eq!(at_end(None), dec!(1));
    }

    #[test]
    fn at_end_increments_past_the_max() {
        assert_eq!(at_end(Some(dec!(5))), dec!(6));
    }

    #[test]
    fn repeated_bisection_eventually_needs_rebalancing() {
        let mut left = dec!(1);
        let mut right = dec!(2);
        let mut iterations = 0;
        while !gap_too_small(left, right) {
            let mid = between(Some(left), Some(right));
            right = mid;
            iterations += 1;
            assert!(iterations < 100, "should converge well before 100 bisections");
        }
        assert!(iterations > 0);
    }

    #[test]
    fn rebalanced_produces_unit_spaced_sequence() {
        assert_eq!(rebalanced(3), vec![dec!(1), dec!(2), dec!(3)]);
    }
}
