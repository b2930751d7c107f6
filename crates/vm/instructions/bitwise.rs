use ethereum_types::U256;

use crate::{errors::VmError, step::Step, trace::StepsTrace};

use super::progress;

fn is_negative(value: U256) -> bool {
    value.bit(255)
}

fn compare(trac: &dyn StepsTrace, cmp: impl Fn(U256, U256) -> bool) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    let result = if cmp(x, y) { U256::one() } else { U256::zero() };
    next.contract.stack.tweak_u256(result)?;
    Ok(progress(next))
}

pub fn op_lt(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    compare(trac, |x, y| x < y)
}

pub fn op_gt(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    compare(trac, |x, y| x > y)
}

pub fn op_slt(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    compare(trac, |x, y| match (is_negative(x), is_negative(y)) {
        (true, false) => true,
        (false, true) => false,
        _ => x < y,
    })
}

pub fn op_sgt(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    compare(trac, |x, y| match (is_negative(x), is_negative(y)) {
        (true, false) => false,
        (false, true) => true,
        _ => x > y,
    })
}

pub fn op_eq(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    compare(trac, |x, y| x == y)
}

pub fn op_iszero(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.peek_u256()?;
    let result = if x.is_zero() { U256::one() } else { U256::zero() };
    next.contract.stack.tweak_u256(result)?;
    Ok(progress(next))
}

pub fn op_and(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    next.contract.stack.tweak_u256(x & y)?;
    Ok(progress(next))
}

pub fn op_or(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    next.contract.stack.tweak_u256(x | y)?;
    Ok(progress(next))
}

pub fn op_xor(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    next.contract.stack.tweak_u256(x ^ y)?;
    Ok(progress(next))
}

pub fn op_not(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.peek_u256()?;
    next.contract.stack.tweak_u256(!x)?;
    Ok(progress(next))
}

pub fn op_byte(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let index = next.contract.stack.pop_u256()?;
    let value = next.contract.stack.peek()?;
    let result = if index < U256::from(32) {
        U256::from(value.as_bytes()[index.low_u64() as usize])
    } else {
        U256::zero()
    };
    next.contract.stack.tweak_u256(result)?;
    Ok(progress(next))
}

pub fn op_shl(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let shift = next.contract.stack.pop_u256()?;
    let value = next.contract.stack.peek_u256()?;
    let result = if shift >= U256::from(256) {
        U256::zero()
    } else {
        value << shift.low_u64() as usize
    };
    next.contract.stack.tweak_u256(result)?;
    Ok(progress(next))
}

pub fn op_shr(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let shift = next.contract.stack.pop_u256()?;
    let value = next.contract.stack.peek_u256()?;
    let result = if shift >= U256::from(256) {
        U256::zero()
    } else {
        value >> shift.low_u64() as usize
    };
    next.contract.stack.tweak_u256(result)?;
    Ok(progress(next))
}

pub fn op_sar(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let shift = next.contract.stack.pop_u256()?;
    let value = next.contract.stack.peek_u256()?;
    let negative = is_negative(value);
    let result = if shift >= U256::from(256) {
        if negative { U256::MAX } else { U256::zero() }
    } else {
        let s = shift.low_u64() as usize;
        let shifted = value >> s;
        if negative && s > 0 {
            // drag the sign bit across the vacated width
            shifted | (U256::MAX << (256 - s))
        } else {
            shifted
        }
    };
    next.contract.stack.tweak_u256(result)?;
    Ok(progress(next))
}
