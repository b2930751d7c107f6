use ethereum_types::{U256, U512};

use crate::{errors::VmError, step::Step, trace::StepsTrace};

use super::progress;

// Two's-complement helpers: the EVM reinterprets the most significant bit as
// the sign for the S* family.

fn is_negative(value: U256) -> bool {
    value.bit(255)
}

fn twos_complement(value: U256) -> U256 {
    (!value).overflowing_add(U256::one()).0
}

fn abs(value: U256) -> U256 {
    if is_negative(value) {
        twos_complement(value)
    } else {
        value
    }
}

pub fn op_add(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    // leave the top stack slot in place, cheaper than a pop/push pair
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    next.contract.stack.tweak_u256(x.overflowing_add(y).0)?;
    Ok(progress(next))
}

pub fn op_mul(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    next.contract.stack.tweak_u256(x.overflowing_mul(y).0)?;
    Ok(progress(next))
}

pub fn op_sub(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    next.contract.stack.tweak_u256(x.overflowing_sub(y).0)?;
    Ok(progress(next))
}

pub fn op_div(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    let z = if y.is_zero() { U256::zero() } else { x / y };
    next.contract.stack.tweak_u256(z)?;
    Ok(progress(next))
}

pub fn op_sdiv(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    let z = if y.is_zero() {
        U256::zero()
    } else {
        let quotient = abs(x) / abs(y);
        if is_negative(x) != is_negative(y) {
            twos_complement(quotient)
        } else {
            quotient
        }
    };
    next.contract.stack.tweak_u256(z)?;
    Ok(progress(next))
}

pub fn op_mod(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    let z = if y.is_zero() { U256::zero() } else { x % y };
    next.contract.stack.tweak_u256(z)?;
    Ok(progress(next))
}

pub fn op_smod(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.peek_u256()?;
    let z = if y.is_zero() {
        U256::zero()
    } else {
        let remainder = abs(x) % abs(y);
        // the result takes the sign of the dividend
        if is_negative(x) {
            twos_complement(remainder)
        } else {
            remainder
        }
    };
    next.contract.stack.tweak_u256(z)?;
    Ok(progress(next))
}

pub fn op_addmod(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.pop_u256()?;
    let m = next.contract.stack.peek_u256()?;
    let z = if m.is_zero() {
        U256::zero()
    } else {
        let sum = U512::from(x) + U512::from(y);
        u512_to_u256(sum % U512::from(m))
    };
    next.contract.stack.tweak_u256(z)?;
    Ok(progress(next))
}

pub fn op_mulmod(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let x = next.contract.stack.pop_u256()?;
    let y = next.contract.stack.pop_u256()?;
    let m = next.contract.stack.peek_u256()?;
    let z = if m.is_zero() {
        U256::zero()
    } else {
        u512_to_u256(x.full_mul(y) % U512::from(m))
    };
    next.contract.stack.tweak_u256(z)?;
    Ok(progress(next))
}

pub fn op_exp(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let base = next.contract.stack.pop_u256()?;
    let exponent = next.contract.stack.peek_u256()?;
    next.contract.stack.tweak_u256(base.overflowing_pow(exponent).0)?;
    Ok(progress(next))
}

pub fn op_signextend(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let byte_index = next.contract.stack.pop_u256()?;
    let value = next.contract.stack.peek_u256()?;
    let result = if byte_index >= U256::from(31) {
        value
    } else {
        let sign_bit = byte_index.low_u64() as usize * 8 + 7;
        let mask = (U256::one() << (sign_bit + 1)) - U256::one();
        if value.bit(sign_bit) {
            value | !mask
        } else {
            value & mask
        }
    };
    next.contract.stack.tweak_u256(result)?;
    Ok(progress(next))
}

fn u512_to_u256(value: U512) -> U256 {
    let be = value.to_big_endian();
    U256::from_big_endian(&be[32..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_helpers() {
        let minus_one = U256::MAX;
        assert!(is_negative(minus_one));
        assert_eq!(twos_complement(minus_one), U256::one());
        assert_eq!(abs(minus_one), U256::one());
        assert_eq!(twos_complement(U256::one()), minus_one);
    }
}
