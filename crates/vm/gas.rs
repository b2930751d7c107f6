//! Dynamic gas handlers. Each runs as its own pipeline step
//! (`ExecMode::DynamicGas`) and may suspend into state work before the
//! interpreter continues with the memory update.

use ethereum_types::U256;
use stepex_common::constants::*;

use crate::{
    errors::VmError,
    exec_mode::ExecMode,
    state::{self, StateWork, StateWorkMode},
    step::{Step, h256_to_address},
    trace::StepsTrace,
};

fn dyn_gas_done(mut next: Step) -> Result<Step, VmError> {
    next.exec_mode = ExecMode::UpdateMemorySize;
    Ok(next)
}

fn out_of_gas(mut next: Step) -> Result<Step, VmError> {
    next.exec_mode = ExecMode::ErrOutOfGas;
    Ok(next)
}

pub fn to_word_size(size: u64) -> u64 {
    size.div_ceil(32)
}

/// Total gas attributable to a memory of `words` 32-byte words.
fn memory_fee(words: u64) -> Option<u64> {
    let linear = words.checked_mul(MEMORY_GAS)?;
    let quadratic = words.checked_mul(words)? / QUAD_COEFF_DIV;
    linear.checked_add(quadratic)
}

/// Charges for the expansion to `memory_desired`, tracking what has already
/// been paid in `memory_last_gas`. Returns false when the frame cannot pay.
fn charge_memory(next: &mut Step) -> Result<bool, VmError> {
    let desired = next.contract.memory_desired;
    if desired == 0 {
        return Ok(true);
    }
    let words = to_word_size(desired);
    let Some(fee) = memory_fee(words) else {
        return Err(VmError::Internal("memory fee overflow past size checks"));
    };
    if fee <= next.contract.memory_last_gas {
        return Ok(true);
    }
    let delta = fee - next.contract.memory_last_gas;
    if !next.use_gas(delta) {
        return Ok(false);
    }
    next.contract.memory_last_gas = fee;
    Ok(true)
}

/// Ops whose only dynamic cost is the memory expansion.
pub fn gas_pure_memory(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    if !charge_memory(&mut next)? {
        return out_of_gas(next);
    }
    dyn_gas_done(next)
}

pub fn gas_keccak256(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    if !charge_memory(&mut next)? {
        return out_of_gas(next);
    }
    let size = next.contract.stack.back_u256(1)?;
    if !charge_words(&mut next, size, KECCAK256_WORD_GAS) {
        return out_of_gas(next);
    }
    dyn_gas_done(next)
}

/// CALLDATACOPY, CODECOPY and RETURNDATACOPY: length sits in stack slot 2.
pub fn gas_copy(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    if !charge_memory(&mut next)? {
        return out_of_gas(next);
    }
    let length = next.contract.stack.back_u256(2)?;
    if !charge_words(&mut next, length, COPY_GAS) {
        return out_of_gas(next);
    }
    dyn_gas_done(next)
}

/// EXTCODECOPY carries the address in slot 0, length in slot 3.
pub fn gas_ext_code_copy(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    if !charge_memory(&mut next)? {
        return out_of_gas(next);
    }
    let length = next.contract.stack.back_u256(3)?;
    if !charge_words(&mut next, length, COPY_GAS) {
        return out_of_gas(next);
    }
    dyn_gas_done(next)
}

pub fn gas_create2(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    if !charge_memory(&mut next)? {
        return out_of_gas(next);
    }
    // hashing the initcode for the address derivation
    let size = next.contract.stack.back_u256(2)?;
    if !charge_words(&mut next, size, KECCAK256_WORD_GAS) {
        return out_of_gas(next);
    }
    dyn_gas_done(next)
}

pub fn gas_exp(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let exponent = next.contract.stack.back_u256(1)?;
    let byte_len = (exponent.bits() as u64).div_ceil(8);
    let Some(cost) = byte_len.checked_mul(EXP_BYTE_GAS) else {
        next.exec_mode = ExecMode::ErrGasUintOverflow;
        return Ok(next);
    };
    if !next.use_gas(cost) {
        return out_of_gas(next);
    }
    dyn_gas_done(next)
}

/// LOG0..LOG4: the topic count comes from the cached opcode byte.
pub fn gas_log(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    if !charge_memory(&mut next)? {
        return out_of_gas(next);
    }
    let topics = (next.contract.op - 0xa0) as u64;
    let size = next.contract.stack.back_u256(1)?;
    if size > U256::from(u64::MAX) {
        next.exec_mode = ExecMode::ErrGasUintOverflow;
        return Ok(next);
    }
    let cost = LOG_GAS
        .checked_add(topics.saturating_mul(LOG_TOPIC_GAS))
        .and_then(|c| c.checked_add(size.low_u64().saturating_mul(LOG_DATA_GAS)));
    let Some(cost) = cost else {
        next.exec_mode = ExecMode::ErrGasUintOverflow;
        return Ok(next);
    };
    if !next.use_gas(cost) {
        return out_of_gas(next);
    }
    dyn_gas_done(next)
}

/// SSTORE pricing needs the slot's current value, so the first visit suspends
/// into a storage read and the second one charges.
pub fn gas_sstore(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::StorageRead { value: current, .. } = last.state_work.work.clone() else {
            return Err(VmError::Internal("sstore gas got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;

        if next.contract.gas <= SSTORE_SENTRY_GAS {
            return out_of_gas(next);
        }
        let new_value = next.contract.stack.back(1)?;
        let cost = if current == new_value {
            SLOAD_GAS
        } else if current.is_zero() {
            SSTORE_SET_GAS
        } else {
            SSTORE_RESET_GAS
        };
        if !current.is_zero() && new_value.is_zero() {
            next.tx.gas_refund += SSTORE_CLEARS_REFUND;
        }
        if !next.use_gas(cost) {
            return out_of_gas(next);
        }
        return dyn_gas_done(next);
    }

    let slot = last.contract.stack.back(0)?;
    state::request(
        trac,
        StateWork::StorageRead {
            address: last.contract.self_addr,
            slot,
            value: Default::default(),
        },
    )
}

/// SELFDESTRUCT charges extra when the beneficiary account must be created.
pub fn gas_self_destruct(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::HasAccount { exists, .. } = last.state_work.work.clone() else {
            return Err(VmError::Internal("selfdestruct gas got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;
        let mut cost = SELFDESTRUCT_GAS;
        if !exists {
            cost += CREATE_BY_SELFDESTRUCT_GAS;
        }
        if !next.use_gas(cost) {
            return out_of_gas(next);
        }
        return dyn_gas_done(next);
    }

    let beneficiary = h256_to_address(last.contract.stack.back(0)?);
    state::request(
        trac,
        StateWork::HasAccount {
            address: beneficiary,
            exists: false,
        },
    )
}

fn charge_words(next: &mut Step, size: U256, per_word: u64) -> bool {
    if size > U256::from(u64::MAX) {
        return false;
    }
    let words = to_word_size(size.low_u64());
    match words.checked_mul(per_word) {
        Some(cost) => next.use_gas(cost),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_rounding() {
        assert_eq!(to_word_size(0), 0);
        assert_eq!(to_word_size(1), 1);
        assert_eq!(to_word_size(32), 1);
        assert_eq!(to_word_size(33), 2);
    }

    #[test]
    fn memory_fee_is_quadratic() {
        let small = memory_fee(1).unwrap();
        assert_eq!(small, MEMORY_GAS);
        let large = memory_fee(1024).unwrap();
        assert_eq!(large, 1024 * MEMORY_GAS + 1024 * 1024 / QUAD_COEFF_DIV);
    }

    #[test]
    fn charge_memory_tracks_paid_fee() {
        let mut step = Step::default();
        step.contract.gas = 1_000_000;
        step.contract.memory_desired = 64;
        assert!(charge_memory(&mut step).unwrap());
        let charged_once = step.contract.memory_last_gas;
        assert!(charged_once > 0);

        // same size again costs nothing further
        let gas_before = step.contract.gas;
        assert!(charge_memory(&mut step).unwrap());
        assert_eq!(step.contract.gas, gas_before);
    }
}
