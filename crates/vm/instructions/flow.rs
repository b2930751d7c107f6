use ethereum_types::U256;

use crate::{errors::VmError, exec_mode::ExecMode, step::Step, trace::StepsTrace};

use super::progress;

fn valid_jump_dest(trac: &dyn StepsTrace, step: &Step, dest: U256) -> bool {
    if dest > U256::from(u64::MAX) {
        return false;
    }
    trac.is_valid_jump_dest(step.contract.code_hash, &step.contract.code, dest.low_u64())
}

pub fn op_jump(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let dest = next.contract.stack.pop_u256()?;
    if !valid_jump_dest(trac, &next, dest) {
        next.exec_mode = ExecMode::ErrInvalidJump;
        return Ok(next);
    }
    next.contract.pc = dest.low_u64();
    next.exec_mode = ExecMode::OpcodeLoad;
    Ok(next)
}

pub fn op_jump_i(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let dest = next.contract.stack.pop_u256()?;
    let condition = next.contract.stack.pop_u256()?;
    if condition.is_zero() {
        return Ok(progress(next));
    }
    if !valid_jump_dest(trac, &next, dest) {
        next.exec_mode = ExecMode::ErrInvalidJump;
        return Ok(next);
    }
    next.contract.pc = dest.low_u64();
    next.exec_mode = ExecMode::OpcodeLoad;
    Ok(next)
}

pub fn op_jump_dest(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    Ok(progress(trac.last().clone()))
}

pub fn op_pc(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let pc = next.contract.pc;
    next.contract.stack.push_u256(U256::from(pc))?;
    Ok(progress(next))
}

pub fn op_stop(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    next.contract.ret_data.clear();
    next.exec_mode = ExecMode::ErrStop;
    Ok(next)
}
