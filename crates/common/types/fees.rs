use ethereum_types::U256;

use crate::constants::{BASE_FEE_CHANGE_DENOMINATOR, ELASTICITY_MULTIPLIER, INITIAL_BASE_FEE};

/// EIP-1559 base-fee derivation from the parent header's gas numbers.
/// Block zero always starts at [`INITIAL_BASE_FEE`].
pub fn calculate_base_fee_per_gas(
    block_number: u64,
    parent_gas_limit: u64,
    parent_gas_used: u64,
    parent_base_fee: U256,
) -> U256 {
    if block_number == 0 {
        return U256::from(INITIAL_BASE_FEE);
    }

    let parent_gas_target = parent_gas_limit / ELASTICITY_MULTIPLIER;
    if parent_gas_used == parent_gas_target {
        return parent_base_fee;
    }

    if parent_gas_used > parent_gas_target {
        let gas_used_delta = U256::from(parent_gas_used - parent_gas_target);
        let delta = (parent_base_fee * gas_used_delta
            / U256::from(parent_gas_target)
            / U256::from(BASE_FEE_CHANGE_DENOMINATOR))
        .max(U256::one());
        parent_base_fee.saturating_add(delta)
    } else {
        let gas_used_delta = U256::from(parent_gas_target - parent_gas_used);
        let delta = parent_base_fee * gas_used_delta
            / U256::from(parent_gas_target)
            / U256::from(BASE_FEE_CHANGE_DENOMINATOR);
        parent_base_fee.saturating_sub(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: u64 = 15_000_000;
    const LIMIT: u64 = 30_000_000;

    #[test]
    fn genesis_uses_initial_base_fee() {
        assert_eq!(
            calculate_base_fee_per_gas(0, LIMIT, 0, U256::zero()),
            U256::from(INITIAL_BASE_FEE)
        );
    }

    #[test]
    fn on_target_usage_keeps_base_fee() {
        let parent = U256::from(INITIAL_BASE_FEE);
        assert_eq!(calculate_base_fee_per_gas(5, LIMIT, TARGET, parent), parent);
    }

    #[test]
    fn saturated_parent_raises_base_fee() {
        let parent = U256::from(INITIAL_BASE_FEE);
        let next = calculate_base_fee_per_gas(5, LIMIT, LIMIT, parent);
        // full blocks move the fee up by 1/8
        assert_eq!(next, parent + parent / 8);
    }

    #[test]
    fn empty_parent_lowers_base_fee() {
        let parent = U256::from(INITIAL_BASE_FEE);
        let next = calculate_base_fee_per_gas(5, LIMIT, 0, parent);
        assert_eq!(next, parent - parent / 8);
    }

    #[test]
    fn increase_is_monotonic_in_delta() {
        let parent = U256::from(INITIAL_BASE_FEE);
        let mut last = parent;
        for used in [TARGET + 1, TARGET + TARGET / 4, TARGET + TARGET / 2, LIMIT] {
            let next = calculate_base_fee_per_gas(5, LIMIT, used, parent);
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn minimum_upward_step_is_one() {
        // tiny overshoot still moves the fee by at least one wei
        let parent = U256::one();
        let next = calculate_base_fee_per_gas(5, LIMIT, TARGET + 1, parent);
        assert_eq!(next, U256::from(2));
    }
}
