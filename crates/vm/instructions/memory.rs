use ethereum_types::U256;

use crate::{errors::VmError, step::Step, trace::StepsTrace};

use super::progress;

pub fn op_pop(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    next.contract.stack.pop()?;
    Ok(progress(next))
}

pub fn op_mload(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let offset = next.contract.stack.peek_u256()?.low_u64();
    let word = next.contract.memory.load_word(offset);
    next.contract.stack.tweak(word)?;
    Ok(progress(next))
}

pub fn op_mstore(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let offset = next.contract.stack.pop_u256()?.low_u64();
    let value = next.contract.stack.pop()?;
    next.contract.memory.store_word(offset, value)?;
    Ok(progress(next))
}

pub fn op_mstore8(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let offset = next.contract.stack.pop_u256()?.low_u64();
    let value = next.contract.stack.pop_u256()?;
    next.contract.memory.store_byte(offset, value.byte(0))?;
    Ok(progress(next))
}

pub fn op_msize(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let size = next.contract.memory.len();
    next.contract.stack.push_u256(U256::from(size))?;
    Ok(progress(next))
}

pub fn op_gas(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let gas = next.contract.gas;
    next.contract.stack.push_u256(U256::from(gas))?;
    Ok(progress(next))
}
