use ethereum_types::{H256, U256};
use stepex_common::constants::{CALL_NEW_ACCOUNT_GAS, CALL_STIPEND, CALL_VALUE_TRANSFER_GAS};
use stepex_crypto::keccak::keccak_hash;

use crate::{
    call::{CallKind, CallScheme},
    create::CreateMode,
    errors::VmError,
    exec_mode::ExecMode,
    jump_table::OpCode,
    state::{self, StateWork, StateWorkMode},
    step::{Step, h256_to_address},
    trace::StepsTrace,
};

/// CALL, CALLCODE, DELEGATECALL and STATICCALL share one handler; the cached
/// opcode byte picks the scheme. The handler runs in three sub-steps: the
/// value surcharge, the destination-account probe, and the frame hand-off;
/// the call state machine takes over from there.
pub fn op_call(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let scheme = call_scheme(last.contract.op)?;
    let has_value_arg = matches!(scheme, CallScheme::Call | CallScheme::CallCode);
    let value = if has_value_arg {
        last.contract.stack.back_u256(2)?
    } else {
        U256::zero()
    };

    match last.sub_index {
        // transfer surcharge
        0 => {
            let mut next = last.clone();
            if has_value_arg && !value.is_zero() {
                if !next.use_gas(CALL_VALUE_TRANSFER_GAS) {
                    next.exec_mode = ExecMode::ErrOutOfGas;
                    return Ok(next);
                }
            }
            next.sub_index = 1;
            Ok(next)
        }
        // does the destination account exist yet?
        1 => {
            if scheme != CallScheme::Call {
                let mut next = last.clone();
                next.sub_index = 2;
                return Ok(next);
            }
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::HasAccount { exists, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("call got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                if !exists && !value.is_zero() && !next.use_gas(CALL_NEW_ACCOUNT_GAS) {
                    next.exec_mode = ExecMode::ErrOutOfGas;
                    return Ok(next);
                }
                next.sub_index = 2;
                return Ok(next);
            }
            let dest = h256_to_address(last.contract.stack.back(1)?);
            state::request(
                trac,
                StateWork::HasAccount {
                    address: dest,
                    exists: false,
                },
            )
        }
        // charge the forwarded gas and hand over to the call machine
        _ => {
            let mut next = last.clone();
            let requested = next.contract.stack.back_u256(0)?;
            let available = next.contract.gas;
            let cap = available - available / 64;
            let mut forwarded = if requested > U256::from(cap) {
                cap
            } else {
                requested.low_u64().min(cap)
            };
            if !next.use_gas(forwarded) {
                return Err(VmError::Internal("forwarded gas exceeds balance"));
            }
            if !value.is_zero() {
                // non-zero transfers get a free stipend on top
                forwarded += CALL_STIPEND;
            }

            let dest = h256_to_address(next.contract.stack.back(1)?);
            let arg_base = if has_value_arg { 3 } else { 2 };
            let input_offset = next.contract.stack.back_u256(arg_base)?.low_u64();
            let input_size = next.contract.stack.back_u256(arg_base + 1)?.low_u64();
            let return_offset = next.contract.stack.back_u256(arg_base + 2)?.low_u64();
            let return_size = next.contract.stack.back_u256(arg_base + 3)?.low_u64();

            let work = &mut next.call_work;
            work.mode = Default::default();
            work.kind = CallKind::Opcode;
            work.scheme = scheme;
            work.gas = forwarded;
            work.input_offset = input_offset;
            work.input_size = input_size;
            work.return_offset = return_offset;
            work.return_size = return_size;
            match scheme {
                CallScheme::Call => {
                    work.caller = next.contract.self_addr;
                    work.addr = dest;
                    work.code_addr = dest;
                    work.value = value;
                    work.read_only = next.contract.read_only;
                }
                CallScheme::CallCode => {
                    // runs foreign code against the local account
                    work.caller = next.contract.self_addr;
                    work.addr = next.contract.self_addr;
                    work.code_addr = dest;
                    work.value = value;
                    work.read_only = next.contract.read_only;
                }
                CallScheme::DelegateCall => {
                    // the parent's caller and value carry through
                    work.caller = next.contract.caller;
                    work.addr = next.contract.self_addr;
                    work.code_addr = dest;
                    work.value = next.contract.value;
                    work.read_only = next.contract.read_only;
                }
                CallScheme::StaticCall => {
                    work.caller = next.contract.self_addr;
                    work.addr = dest;
                    work.code_addr = dest;
                    work.value = U256::zero();
                    work.read_only = true;
                }
                CallScheme::InitCode => {
                    return Err(VmError::Internal("initcode frames are built by create work"));
                }
            }
            next.exec_mode = ExecMode::CallSetup;
            Ok(next)
        }
    }
}

fn call_scheme(op: u8) -> Result<CallScheme, VmError> {
    match op {
        x if x == OpCode::CALL as u8 => Ok(CallScheme::Call),
        x if x == OpCode::CALLCODE as u8 => Ok(CallScheme::CallCode),
        x if x == OpCode::DELEGATECALL as u8 => Ok(CallScheme::DelegateCall),
        x if x == OpCode::STATICCALL as u8 => Ok(CallScheme::StaticCall),
        _ => Err(VmError::Internal("call handler on a non-call opcode")),
    }
}

/// CREATE and CREATE2. Stack: value, offset, size (+ salt for CREATE2).
pub fn op_create(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let is_create2 = last.contract.op == OpCode::CREATE2 as u8;

    let value = next.contract.stack.back_u256(0)?;
    let init_offset = next.contract.stack.back_u256(1)?.low_u64();
    let init_size = next.contract.stack.back_u256(2)?.low_u64();
    let salt = if is_create2 {
        next.contract.stack.back(3)?
    } else {
        H256::zero()
    };

    // everything but one 64th is forwarded into the init frame
    let available = next.contract.gas;
    let forwarded = available - available / 64;
    if !next.use_gas(forwarded) {
        return Err(VmError::Internal("forwarded gas exceeds balance"));
    }

    let init_code_hash = if is_create2 {
        let init_code = next.contract.memory.load_slice(init_offset, init_size);
        H256(keccak_hash(&init_code))
    } else {
        H256::zero()
    };

    let work = &mut next.create_work;
    work.mode = if is_create2 {
        CreateMode::StartCreate2
    } else {
        CreateMode::StartCreate
    };
    work.kind = CallKind::Opcode;
    work.caller = next.contract.self_addr;
    work.addr = Default::default();
    work.value = value;
    work.gas = forwarded;
    work.salt = salt;
    work.is_create2 = is_create2;
    work.nonce = 0;
    work.init_offset = init_offset;
    work.init_size = init_size;
    work.init_code_hash = init_code_hash;

    next.exec_mode = ExecMode::CreateSetup;
    Ok(next)
}

pub fn op_return(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let offset = next.contract.stack.pop_u256()?.low_u64();
    let size = next.contract.stack.pop_u256()?.low_u64();
    next.contract.ret_data = next.contract.memory.load_slice(offset, size);
    next.exec_mode = ExecMode::ErrStop;
    Ok(next)
}

pub fn op_revert(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let offset = next.contract.stack.pop_u256()?.low_u64();
    let size = next.contract.stack.pop_u256()?.low_u64();
    next.contract.ret_data = next.contract.memory.load_slice(offset, size);
    next.exec_mode = ExecMode::ErrExecutionReverted;
    Ok(next)
}

pub fn op_self_destruct(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    if last.state_work.mode == StateWorkMode::Returned {
        let StateWork::SelfDestruct { .. } = last.state_work.work else {
            return Err(VmError::Internal("selfdestruct got a foreign result"));
        };
        let mut next = last.clone();
        next.state_work.mode = StateWorkMode::Idle;
        next.state_work.work = StateWork::None;
        next.contract.stack.pop()?;
        next.contract.ret_data.clear();
        next.exec_mode = ExecMode::ErrStop;
        return Ok(next);
    }
    let beneficiary = h256_to_address(last.contract.stack.peek()?);
    state::request(
        trac,
        StateWork::SelfDestruct {
            address: last.contract.self_addr,
            beneficiary,
            moved: U256::zero(),
        },
    )
}

/// Undefined opcodes (including the designated INVALID) abort the frame,
/// consuming all gas.
pub fn op_undefined(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    next.contract.gas = 0;
    next.contract.ret_data.clear();
    next.exec_mode = ExecMode::ErrOutOfGas;
    Ok(next)
}
