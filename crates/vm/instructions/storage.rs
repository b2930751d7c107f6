use crate::{
    errors::VmError,
    state::{self, StateWork, StateWorkMode},
    step::{Step, h256_to_u256, u256_to_h256},
    trace::StepsTrace,
};

use super::progress;

pub fn op_sload(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::StorageRead { value, .. } = last.state_work.work.clone() else {
            return Err(VmError::Internal("sload got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;
        next.contract.stack.tweak(value)?;
        return Ok(progress(next));
    }
    let slot = last.contract.stack.peek()?;
    state::request(
        trac,
        StateWork::StorageRead {
            address: last.contract.self_addr,
            slot,
            value: Default::default(),
        },
    )
}

pub fn op_sstore(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::StorageWrite { .. } = last.state_work.work else {
            return Err(VmError::Internal("sstore got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;
        next.contract.stack.pop()?;
        next.contract.stack.pop()?;
        return Ok(progress(next));
    }
    let slot = last.contract.stack.back(0)?;
    let value = last.contract.stack.back(1)?;
    // canonical form: storage keeps the value as an integer
    let value = u256_to_h256(h256_to_u256(value));
    state::request(
        trac,
        StateWork::StorageWrite {
            address: last.contract.self_addr,
            slot,
            value,
        },
    )
}
