//! Allocation validation for milestone amounts against a contract total.
//!
//! Pure functions only; callers decide when an allocation must hold.

use crate::error::EscrowError;

/// Slack allowed between the milestone sum and the contract total, absorbing
/// integer-division remainders from hand-entered splits.
pub const ALLOCATION_TOLERANCE_MINOR: u64 = 1;

/// Check that `amounts` add up to `total_minor` within the tolerance.
pub fn validate(total_minor: u64, amounts: &[u64]) -> Result<(), EscrowError> {
    let actual = checked_sum(amounts).ok_or(EscrowError::Allocation {
        expected: total_minor,
        actual: u64::MAX,
    })?;

    if actual.abs_diff(total_minor) > ALLOCATION_TOLERANCE_MINOR {
        return Err(EscrowError::Allocation {
            expected: total_minor,
            actual,
        });
    }
    Ok(())
}

/// Split `total_minor` across `count` milestones.
///
/// The first `count - 1` entries get `floor(total / count)` and the last one absorbs
/// the remainder, so the result always sums exactly to the total. Totals smaller than
/// `count` produce zero-value entries; raising them is the contract author's call.
pub fn distribute_evenly(total_minor: u64, count: usize) -> Result<Vec<u64>, EscrowError> {
    if count == 0 {
        return Err(EscrowError::Validation(
            "cannot distribute an amount across zero milestones".to_string(),
        ));
    }

    let parts = count as u64;
    let share = total_minor / parts;
    let last = total_minor - share * (parts - 1);

    let mut amounts = vec![share; count - 1];
    amounts.push(last);
    Ok(amounts)
}

pub(crate) fn checked_sum(amounts: &[u64]) -> Option<u64> {
    amounts
        .iter()
        .try_fold(0u64, |acc, amount| acc.checked_add(*amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_contract_budget_with_remainder_on_last() {
        let amounts = distribute_evenly(25_000, 3).unwrap();
        assert_eq!(amounts, vec![8_333, 8_333, 8_334]);
        assert_eq!(amounts.iter().sum::<u64>(), 25_000);
    }

    #[test]
    fn rejects_zero_count() {
        let err = distribute_evenly(1_000, 0).unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[test]
    fn small_totals_yield_zero_value_entries() {
        assert_eq!(distribute_evenly(2, 4).unwrap(), vec![0, 0, 0, 2]);
    }

    #[test]
    fn tolerates_one_unit_of_drift() {
        assert!(validate(10_000, &[3_333, 3_333, 3_333]).is_ok());
        assert!(validate(10_000, &[3_334, 3_334, 3_333]).is_ok());

        let err = validate(10_000, &[3_333, 3_333, 3_332]).unwrap_err();
        match err {
            EscrowError::Allocation { expected, actual } => {
                assert_eq!(expected, 10_000);
                assert_eq!(actual, 9_998);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn overflowing_sums_are_rejected() {
        assert!(validate(100, &[u64::MAX, 1]).is_err());
    }

    proptest! {
        #[test]
        fn even_split_sums_exactly(total in 0u64..10_000_000_000, count in 1usize..64) {
            let amounts = distribute_evenly(total, count).unwrap();
            prop_assert_eq!(amounts.len(), count);
            prop_assert_eq!(amounts.iter().sum::<u64>(), total);
            prop_assert!(validate(total, &amounts).is_ok());
        }
    }
}
