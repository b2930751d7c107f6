use crate::{
    errors::VmError,
    exec_mode::ExecMode,
    jump_table::OpCode,
    step::Step,
    trace::StepsTrace,
};

use super::progress;

/// PUSH1..PUSH32, with the width taken from the cached opcode byte. The
/// immediate is pushed right-aligned and zero-padded; bytes past the end of
/// the code read as zero.
pub fn op_push(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let n = (next.contract.op - OpCode::PUSH1 as u8) as usize + 1;
    let code = &next.contract.code;
    let pc = next.contract.pc as usize;

    let mut word = [0u8; 32];
    for i in 0..n {
        word[32 - n + i] = code.get(pc + 1 + i).copied().unwrap_or(0);
    }
    next.contract.stack.push(word.into())?;
    next.contract.pc += 1 + n as u64;
    next.exec_mode = ExecMode::OpcodeLoad;
    Ok(next)
}

pub fn op_dup(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let n = (next.contract.op - OpCode::DUP1 as u8) as usize + 1;
    next.contract.stack.dup(n)?;
    Ok(progress(next))
}

pub fn op_swap(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    // swap n + 1, otherwise n would be swapped with itself
    let n = (next.contract.op - OpCode::SWAP1 as u8) as usize + 2;
    next.contract.stack.swap(n)?;
    Ok(progress(next))
}
