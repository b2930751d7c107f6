//! Block-level pipeline: payload ingestion, pre-state anchoring, ancestor
//! history, base-fee derivation, the transaction loop and the closing
//! validations.

use ethereum_types::{H256, U256};
use stepex_common::{
    constants::{GAS_LIMIT_BOUND_DIVISOR, MIN_GAS_LIMIT},
    types::{HeaderFields, MinimalExecutionPayload, calculate_base_fee_per_gas},
};

use crate::{
    errors::VmError,
    exec_mode::ExecMode,
    step::Step,
    trace::StepsTrace,
};

/// The first step of a trace: everything zeroed except the payload. The
/// pipeline loads the payload into the block scope field by field, so the
/// genesis step stays trivial to construct on-chain.
pub fn init_step(payload: MinimalExecutionPayload) -> Step {
    Step {
        payload,
        exec_mode: ExecMode::BlockPre,
        ..Default::default()
    }
}

/// Copies the payload into the block scope, one field per sub-step.
pub fn exec_block_pre(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    match last.sub_index {
        0 => next.block.parent_hash = last.payload.parent_hash,
        1 => next.block.coinbase = last.payload.coinbase,
        // post-merge, the randomness beacon value sits in the difficulty slot
        2 => next.block.difficulty = U256::from_big_endian(last.payload.random.as_bytes()),
        3 => next.block.block_number = last.payload.block_number,
        4 => next.block.gas_limit = last.payload.gas_limit,
        5 => next.block.time = last.payload.timestamp,
        _ => {
            // transactions stay in the payload; the tx loop reads them lazily
            next.exec_mode = ExecMode::BlockPreStateLoad;
            next.sub_index = 0;
            return Ok(next);
        }
    }
    next.sub_index += 1;
    Ok(next)
}

/// Derives the pre-state root from the parent header, which the parent hash
/// in the payload commits to.
pub fn exec_block_pre_state_load(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    if last.block.block_number == 0 {
        // genesis executes over the empty world
        next.state_root = H256::zero();
    } else {
        let header_rlp = trac.block_header(last.payload.parent_hash)?;
        let header = HeaderFields::decode(&header_rlp)?;
        next.state_root = header.state_root;
    }
    next.exec_mode = ExecMode::BlockHistoryLoad;
    next.sub_index = 0;
    Ok(next)
}

/// Fills the 256-entry ancestor ring, one hash per sub-step, walking parent
/// headers backwards. Past genesis the slots stay zero.
pub fn exec_block_history_load(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let sub_index = last.sub_index;
    if sub_index >= 256 {
        next.sub_index = 0;
        next.exec_mode = ExecMode::BlockCalcBaseFee;
        return Ok(next);
    }

    let number = last.block.block_number;
    // slot of block (number - 1 - sub_index) in the ring
    let dest = ((number + 255 - sub_index) % 256) as usize;
    if sub_index >= number {
        next.history.block_hashes[dest] = H256::zero();
    } else if sub_index == 0 {
        next.history.block_hashes[dest] = last.payload.parent_hash;
    } else {
        // the previously loaded ancestor names this one as its parent
        let child_hash = last.history.block_hashes[(dest + 1) % 256];
        let header_rlp = trac.block_header(child_hash)?;
        let header = HeaderFields::decode(&header_rlp)?;
        next.history.block_hashes[dest] = header.parent_hash;
    }
    next.sub_index += 1;
    Ok(next)
}

pub fn exec_block_calc_base_fee(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    if last.block.block_number == 0 {
        next.block.base_fee = calculate_base_fee_per_gas(0, 0, 0, U256::zero());
    } else {
        let header_rlp = trac.block_header(last.payload.parent_hash)?;
        let parent = HeaderFields::decode(&header_rlp)?;
        next.block.base_fee = calculate_base_fee_per_gas(
            last.block.block_number,
            parent.gas_limit,
            parent.gas_used,
            parent.base_fee_per_gas.unwrap_or_default(),
        );
    }
    next.exec_mode = ExecMode::BlockTxLoop;
    Ok(next)
}

/// Feeds the next transaction into the tx pipeline, or closes the block.
pub fn exec_block_tx_loop(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let tx_index = last.tx.tx_index as usize;
    if tx_index < last.payload.transactions.len() {
        next.tx.current_tx = last.payload.transactions[tx_index].clone();
        next.exec_mode = ExecMode::TxLoad;
    } else {
        next.exec_mode = ExecMode::BlockPost;
    }
    Ok(next)
}

/// Gas accounting can only be validated after execution; a violation proves
/// the block invalid.
pub fn exec_block_post(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();

    if last.block.gas_used > last.block.gas_limit || last.block.gas_limit < MIN_GAS_LIMIT {
        next.exec_mode = ExecMode::ErrInvalidTransactionType;
        return Ok(next);
    }
    if last.block.block_number > 0 {
        let header_rlp = trac.block_header(last.payload.parent_hash)?;
        let parent = HeaderFields::decode(&header_rlp)?;
        let bound = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
        if last.block.gas_limit >= parent.gas_limit + bound
            || last.block.gas_limit + bound <= parent.gas_limit
        {
            next.exec_mode = ExecMode::ErrInvalidTransactionType;
            return Ok(next);
        }
    }

    next.exec_mode = ExecMode::Done;
    Ok(next)
}
