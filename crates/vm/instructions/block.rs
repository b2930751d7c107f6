use ethereum_types::{H256, U256};

use crate::{errors::VmError, step::{Step, address_to_h256}, trace::StepsTrace};

use super::progress;

pub fn op_block_hash(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let number = next.contract.stack.peek_u256()?;
    // only the most recent 256 ancestors are available, and never the block
    // itself
    let upper = next.block.block_number;
    let lower = upper.saturating_sub(256);
    let result = if number >= U256::from(lower) && number < U256::from(upper) {
        next.history.block_hashes[(number.low_u64() % 256) as usize]
    } else {
        H256::zero()
    };
    next.contract.stack.tweak(result)?;
    Ok(progress(next))
}

pub fn op_coinbase(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let coinbase = next.block.coinbase;
    next.contract.stack.push(address_to_h256(coinbase))?;
    Ok(progress(next))
}

pub fn op_timestamp(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let time = next.block.time;
    next.contract.stack.push_u256(U256::from(time))?;
    Ok(progress(next))
}

pub fn op_number(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let number = next.block.block_number;
    next.contract.stack.push_u256(U256::from(number))?;
    Ok(progress(next))
}

pub fn op_difficulty(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let difficulty = next.block.difficulty;
    next.contract.stack.push_u256(difficulty)?;
    Ok(progress(next))
}

pub fn op_gas_limit(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let gas_limit = next.block.gas_limit;
    next.contract.stack.push_u256(U256::from(gas_limit))?;
    Ok(progress(next))
}
