use ethereum_types::{H256, U256};
use stepex_common::constants::CHAIN_ID;

use crate::{
    errors::VmError,
    exec_mode::ExecMode,
    state::{self, StateWork, StateWorkMode},
    step::{Step, address_to_h256, h256_to_address},
    trace::StepsTrace,
};

use super::{copy_delta, progress};

pub fn op_address(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let addr = next.contract.self_addr;
    next.contract.stack.push(address_to_h256(addr))?;
    Ok(progress(next))
}

pub fn op_origin(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let origin = next.tx.origin;
    next.contract.stack.push(address_to_h256(origin))?;
    Ok(progress(next))
}

pub fn op_caller(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let caller = next.contract.caller;
    next.contract.stack.push(address_to_h256(caller))?;
    Ok(progress(next))
}

pub fn op_call_value(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let value = next.contract.value;
    next.contract.stack.push_u256(value)?;
    Ok(progress(next))
}

pub fn op_gas_price(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let price = next.tx.gas_price;
    next.contract.stack.push_u256(price)?;
    Ok(progress(next))
}

pub fn op_chain_id(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    next.contract.stack.push_u256(U256::from(CHAIN_ID))?;
    Ok(progress(next))
}

pub fn op_base_fee(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let base_fee = next.block.base_fee;
    next.contract.stack.push_u256(base_fee)?;
    Ok(progress(next))
}

/// Reads a 32-byte word out of a data buffer, zero-padded past its end.
fn data_word(data: &[u8], start: U256) -> H256 {
    let mut out = [0u8; 32];
    if start <= U256::from(data.len()) {
        let start = start.low_u64() as usize;
        if start < data.len() {
            let end = (start + 32).min(data.len());
            out[..end - start].copy_from_slice(&data[start..end]);
        }
    }
    H256(out)
}

pub fn op_call_data_load(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let start = next.contract.stack.peek_u256()?;
    let word = data_word(&next.contract.input, start);
    next.contract.stack.tweak(word)?;
    Ok(progress(next))
}

pub fn op_call_data_size(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let size = next.contract.input.len();
    next.contract.stack.push_u256(U256::from(size))?;
    Ok(progress(next))
}

pub fn op_code_size(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let size = next.contract.code.len();
    next.contract.stack.push_u256(U256::from(size))?;
    Ok(progress(next))
}

pub fn op_return_data_size(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let size = next.contract.ret_data.len();
    next.contract.stack.push_u256(U256::from(size))?;
    Ok(progress(next))
}

/// One batch of a long copy: moves at most one aligned 32-byte span from
/// `source` into memory, reusing the three stack slots
/// `(mem_offset, data_offset, length)` as progress counters. Reads past the
/// source are zero when `pad` allows them.
fn copy_batch(next: &mut Step, source: &[u8]) -> Result<bool, VmError> {
    let mem_offset = next.contract.stack.back_u256(0)?.low_u64();
    let mut data_offset = next.contract.stack.back_u256(1)?;
    let length = next.contract.stack.back_u256(2)?.low_u64();

    // clamping keeps the cursor arithmetic in u64; everything past the
    // source reads as zeroes anyway
    if data_offset > U256::from(u64::MAX) {
        data_offset = U256::from(u64::MAX);
    }
    let data_offset = data_offset.low_u64();

    if length > 0 {
        let delta = copy_delta(data_offset, length);
        let mut chunk = vec![0u8; delta as usize];
        if (data_offset as usize) < source.len() {
            let end = ((data_offset + delta) as usize).min(source.len());
            chunk[..end - data_offset as usize]
                .copy_from_slice(&source[data_offset as usize..end]);
        }
        next.contract.memory.store_slice(mem_offset, &chunk)?;

        next.contract.stack.tweak_back_u256(U256::from(mem_offset + delta), 0)?;
        next.contract.stack.tweak_back_u256(U256::from(data_offset + delta), 1)?;
        next.contract.stack.tweak_back_u256(U256::from(length - delta), 2)?;
        return Ok(length - delta == 0);
    }
    Ok(true)
}

pub fn op_call_data_copy(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let input = next.contract.input.clone();
    if copy_batch(&mut next, &input)? {
        next.contract.stack.pop()?;
        next.contract.stack.pop()?;
        next.contract.stack.pop()?;
        return Ok(progress(next));
    }
    // repeat this opcode with the reduced work
    Ok(next)
}

pub fn op_code_copy(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let code = next.contract.code.clone();
    if copy_batch(&mut next, &code)? {
        next.contract.stack.pop()?;
        next.contract.stack.pop()?;
        next.contract.stack.pop()?;
        return Ok(progress(next));
    }
    Ok(next)
}

pub fn op_return_data_copy(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    // unlike the other copies, reading outside the return buffer is an error
    let data_offset = next.contract.stack.back_u256(1)?;
    let length = next.contract.stack.back_u256(2)?;
    let end = data_offset.checked_add(length);
    if end.is_none() || end.unwrap_or_default() > U256::from(next.contract.ret_data.len()) {
        next.exec_mode = ExecMode::ErrReturnDataOutOfBounds;
        return Ok(next);
    }
    let ret_data = next.contract.ret_data.clone();
    if copy_batch(&mut next, &ret_data)? {
        next.contract.stack.pop()?;
        next.contract.stack.pop()?;
        next.contract.stack.pop()?;
        return Ok(progress(next));
    }
    Ok(next)
}

pub fn op_balance(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::GetBalance { balance, .. } = last.state_work.work.clone() else {
            return Err(VmError::Internal("balance got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;
        next.contract.stack.tweak_u256(balance)?;
        return Ok(progress(next));
    }
    let address = h256_to_address(last.contract.stack.peek()?);
    state::request(
        trac,
        StateWork::GetBalance {
            address,
            balance: U256::zero(),
        },
    )
}

pub fn op_self_balance(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::GetBalance { balance, .. } = last.state_work.work.clone() else {
            return Err(VmError::Internal("selfbalance got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;
        next.contract.stack.push_u256(balance)?;
        return Ok(progress(next));
    }
    state::request(
        trac,
        StateWork::GetBalance {
            address: last.contract.self_addr,
            balance: U256::zero(),
        },
    )
}

pub fn op_ext_code_size(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::GetCodeSize { size, .. } = last.state_work.work.clone() else {
            return Err(VmError::Internal("extcodesize got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;
        next.contract.stack.tweak_u256(U256::from(size))?;
        return Ok(progress(next));
    }
    let address = h256_to_address(last.contract.stack.peek()?);
    state::request(trac, StateWork::GetCodeSize { address, size: 0 })
}

pub fn op_ext_code_hash(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::GetCodeHash { code_hash, .. } = last.state_work.work.clone() else {
            return Err(VmError::Internal("extcodehash got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;
        next.contract.stack.tweak(code_hash)?;
        return Ok(progress(next));
    }
    let address = h256_to_address(last.contract.stack.peek()?);
    state::request(
        trac,
        StateWork::GetCodeHash {
            address,
            code_hash: H256::zero(),
        },
    )
}

/// EXTCODECOPY: the external code is resolved once through state work, then
/// the copy batches run against the result kept in the returned work item.
/// Stack: address, mem_offset, code_offset, length.
pub fn op_ext_code_copy(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::GetCode { code, .. } = last.state_work.work.clone() else {
            return Err(VmError::Internal("extcodecopy got a foreign result"));
        };
        let mut next = last.clone();
        // same batching as the other copies, with the cursors one slot
        // deeper: the address stays parked on top of the stack
        let mem_offset = next.contract.stack.back_u256(1)?.low_u64();
        let code_offset = next.contract.stack.back_u256(2)?.min(U256::from(u64::MAX)).low_u64();
        let length = next.contract.stack.back_u256(3)?.low_u64();
        let done = if length > 0 {
            let delta = copy_delta(code_offset, length);
            let mut chunk = vec![0u8; delta as usize];
            if (code_offset as usize) < code.len() {
                let end = ((code_offset + delta) as usize).min(code.len());
                chunk[..end - code_offset as usize]
                    .copy_from_slice(&code[code_offset as usize..end]);
            }
            next.contract.memory.store_slice(mem_offset, &chunk)?;
            next.contract.stack.tweak_back_u256(U256::from(mem_offset + delta), 1)?;
            next.contract.stack.tweak_back_u256(U256::from(code_offset + delta), 2)?;
            next.contract.stack.tweak_back_u256(U256::from(length - delta), 3)?;
            length - delta == 0
        } else {
            true
        };
        if done {
            next.state_work.mode = StateWorkMode::Idle;
            next.state_work.work = StateWork::None;
            for _ in 0..4 {
                next.contract.stack.pop()?;
            }
            return Ok(progress(next));
        }
        return Ok(next);
    }
    let address = h256_to_address(last.contract.stack.peek()?);
    state::request(
        trac,
        StateWork::GetCode {
            address,
            code_hash: H256::zero(),
            code: Default::default(),
        },
    )
}
