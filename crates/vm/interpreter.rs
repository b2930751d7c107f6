//! The dispatcher and the per-opcode micro-pipeline.
//!
//! `next_step` is the whole engine: a pure function from the last step of the
//! trace to the next one. Opcode execution runs through eight observable
//! stages (load, stack validation, read-only check, constant gas, memory-size
//! calculation, dynamic gas, memory growth, the handler itself), each a step
//! of its own.

use crate::{
    block, call, create,
    errors::VmError,
    exec_mode::ExecMode,
    gas,
    jump_table::{OpCode, operation},
    mpt, state,
    step::Step,
    trace::StepsTrace,
    tx,
};

pub fn next_step(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mode = trac.last().exec_mode;
    match mode {
        ExecMode::BlockPre => block::exec_block_pre(trac),
        ExecMode::BlockPreStateLoad => block::exec_block_pre_state_load(trac),
        ExecMode::BlockHistoryLoad => block::exec_block_history_load(trac),
        ExecMode::BlockCalcBaseFee => block::exec_block_calc_base_fee(trac),
        ExecMode::BlockTxLoop => block::exec_block_tx_loop(trac),
        ExecMode::BlockPost => block::exec_block_post(trac),

        ExecMode::TxLoad => tx::exec_tx_load(trac),
        ExecMode::TxSig => tx::exec_tx_sig(trac),
        ExecMode::TxFeesPre => tx::exec_tx_fees_pre(trac),
        ExecMode::TxFeesPost => tx::exec_tx_fees_post(trac),
        ExecMode::BlockTxSuccess => tx::exec_block_tx_success(trac),
        ExecMode::BlockTxErr => tx::exec_block_tx_err(trac),
        ExecMode::BlockTxRevert => tx::exec_block_tx_revert(trac),

        ExecMode::OpcodeLoad => exec_opcode_load(trac),
        ExecMode::ValidateStack => exec_validate_stack(trac),
        ExecMode::ReadOnlyCheck => exec_read_only_check(trac),
        ExecMode::ConstantGas => exec_constant_gas(trac),
        ExecMode::CalcMemorySize => exec_calc_memory_size(trac),
        ExecMode::DynamicGas => exec_dynamic_gas(trac),
        ExecMode::UpdateMemorySize => exec_update_memory_size(trac),
        ExecMode::OpcodeRun => exec_opcode_run(trac),

        ExecMode::CallSetup => call::call_work_proc(trac),
        ExecMode::CallPre => call::exec_call_pre(trac),
        ExecMode::CallPost => call::exec_call_post(trac),
        ExecMode::CallRevert => call::exec_call_revert(trac),

        ExecMode::CreateSetup => create::create_work_proc(trac),
        ExecMode::CreateInitPost => create::create_init_post(trac),
        ExecMode::CreateInitRevert => create::create_init_revert(trac),
        ExecMode::CreateInitErr => create::create_init_err(trac),

        ExecMode::StateWork => state::state_work_proc(trac),
        ExecMode::MptWork => mpt::mpt_work_proc(trac),

        mode if mode.is_frame_exit() => call::exec_frame_exit(trac),
        mode if mode.is_block_fatal() => {
            Err(VmError::Internal("stepping past a block-fatal error"))
        }
        ExecMode::Done => Err(VmError::Internal("stepping past the end of the trace")),
        _ => Err(VmError::InvalidExecMode(mode.as_byte())),
    }
}

/// Reads `code[pc]` into the cached opcode; past the code length the implicit
/// opcode is STOP.
fn exec_opcode_load(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let pc = last.contract.pc;
    next.contract.op = if pc < last.contract.code.len() as u64 {
        last.contract.code[pc as usize]
    } else {
        OpCode::STOP as u8
    };
    next.exec_mode = ExecMode::ValidateStack;
    Ok(next)
}

fn exec_validate_stack(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let op = operation(last.contract.op);
    let stack_len = last.contract.stack.len() as u64;
    if stack_len < op.min_stack {
        next.exec_mode = ExecMode::ErrStackUnderflow;
    } else if stack_len > op.max_stack {
        next.exec_mode = ExecMode::ErrStackOverflow;
    } else {
        next.exec_mode = ExecMode::ReadOnlyCheck;
    }
    Ok(next)
}

/// In a static context any state-modifying operation is rejected; so is CALL
/// with a non-zero value, since a value transfer modifies state too.
fn exec_read_only_check(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    if last.contract.read_only {
        let op = operation(last.contract.op);
        if op.writes {
            next.exec_mode = ExecMode::ErrWriteProtection;
            return Ok(next);
        }
        if last.contract.op == OpCode::CALL as u8 && !last.contract.stack.back_u256(2)?.is_zero() {
            next.exec_mode = ExecMode::ErrWriteProtection;
            return Ok(next);
        }
    }
    next.exec_mode = ExecMode::ConstantGas;
    Ok(next)
}

fn exec_constant_gas(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let op = operation(last.contract.op);
    if !next.use_gas(op.constant_gas) {
        next.exec_mode = ExecMode::ErrOutOfGas;
        return Ok(next);
    }
    next.exec_mode = ExecMode::CalcMemorySize;
    Ok(next)
}

/// Memory requirements are computed and checked for overflow before any
/// dynamic gas maths runs over them.
fn exec_calc_memory_size(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let op = operation(last.contract.op);
    let mut memory_size = 0u64;
    if let Some(calc) = op.memory_size {
        let (size, overflow) = calc(&last.contract.stack)?;
        if overflow {
            next.exec_mode = ExecMode::ErrGasUintOverflow;
            return Ok(next);
        }
        // memory grows in words of 32 bytes; gas is calculated in words
        match gas::to_word_size(size).checked_mul(32) {
            Some(bytes) => memory_size = bytes,
            None => {
                next.exec_mode = ExecMode::ErrGasUintOverflow;
                return Ok(next);
            }
        }
    }
    next.contract.memory_desired = memory_size.max(last.contract.memory.len() as u64);
    next.exec_mode = ExecMode::DynamicGas;
    Ok(next)
}

fn exec_dynamic_gas(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let op = operation(last.contract.op);
    match op.dynamic_gas {
        // dynamic gas owns the step, and may suspend into further ones
        Some(handler) => handler(trac),
        None => {
            let mut next = last.clone();
            next.exec_mode = ExecMode::UpdateMemorySize;
            Ok(next)
        }
    }
}

/// Expands memory towards the desired size, at most one aligned 32-byte word
/// per step; the mode repeats itself until the size is reached.
fn exec_update_memory_size(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let desired = last.contract.memory_desired;
    if (last.contract.memory.len() as u64) < desired {
        if last.contract.memory.len() % 32 == 0 && desired - (last.contract.memory.len() as u64) >= 32
        {
            next.contract.memory.append_zero_word();
        } else {
            next.contract.memory.append_zero_byte();
        }
        if (next.contract.memory.len() as u64) < desired {
            return Ok(next);
        }
    }
    next.exec_mode = ExecMode::OpcodeRun;
    Ok(next)
}

fn exec_opcode_run(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let op = operation(trac.last().contract.op);
    (op.proc)(trac)
}
