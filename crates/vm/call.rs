//! The call state machine and frame unwinding.
//!
//! Every frame entry (transaction-level call, CALL-family opcode, initcode
//! run) goes through the same multi-step setup: scope loading, input copy,
//! depth and balance checks, value transfer, code resolution, and finally the
//! interpreter hand-off. The frame's exit restores the step saved at `Start`:
//! success returns gas and commits state, revert returns gas and rolls back,
//! a hard error burns the gas.

use ethereum_types::{Address, H256, U256};
use stepex_common::constants::{
    CALL_CREATE_DEPTH, ECRECOVER_GAS, IDENTITY_BASE_GAS, IDENTITY_PER_WORD_GAS,
    RIPEMD160_BASE_GAS, RIPEMD160_PER_WORD_GAS, SHA256_BASE_GAS, SHA256_PER_WORD_GAS,
};
use stepex_crypto::{ecdsa, keccak::keccak_hash, ripemd160, sha256};

use crate::{
    errors::VmError,
    exec_mode::ExecMode,
    gas::to_word_size,
    instructions::copy_delta,
    state::{self, StateWork, StateWorkMode},
    step::Step,
    trace::StepsTrace,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CallMode {
    #[default]
    Start = 0x00,
    LoadScope = 0x01,
    ResetInput = 0x02,
    LoadInput = 0x03,
    CallDepthCheck = 0x04,
    ReadBalance = 0x05,
    CheckTransferValue = 0x06,
    CheckAccountExists = 0x07,
    CheckIfPrecompile = 0x08,
    /// Entered only when the destination account did not exist yet.
    CreateToAccount = 0x09,
    TransferValue = 0x0a,
    LoadCode = 0x0b,
    LoadPrecompile = 0x0c,
    LoadRegularContractCodeHash = 0x0d,
    LoadRegularContractCode = 0x0e,
    CheckRunningEmptyCode = 0x0f,
    RunContract = 0x10,
}

/// Who opened the frame; picks the continuation on unwind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CallKind {
    #[default]
    Transaction = 0x00,
    Opcode = 0x01,
    Create = 0x02,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CallScheme {
    #[default]
    Call = 0x00,
    CallCode = 0x01,
    DelegateCall = 0x02,
    StaticCall = 0x03,
    InitCode = 0x04,
}

pub fn call_work_proc(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let scheme = last.call_work.scheme;

    match last.call_work.mode {
        CallMode::Start => {
            // the caller frame is restored from this snapshot on success,
            // revert and error alike
            let mut next = last.clone();
            next.return_to_step = Some(trac.last_ref());
            next.call_work.mode = CallMode::LoadScope;
            Ok(next)
        }
        CallMode::LoadScope => {
            let mut next = last.clone();
            next.contract.caller = last.call_work.caller;
            next.contract.code_addr = last.call_work.code_addr;
            next.contract.read_only = last.call_work.read_only;
            next.contract.gas = last.call_work.gas;
            next.contract.self_addr = last.call_work.addr;
            next.contract.value = last.call_work.value;
            next.contract.is_init_code = scheme == CallScheme::InitCode;
            next.call_work.mode = CallMode::ResetInput;
            Ok(next)
        }
        CallMode::ResetInput => {
            let mut next = last.clone();
            next.contract.input.clear();
            if last.call_work.kind == CallKind::Transaction {
                // top-level frames take the tx payload wholesale
                next.contract.input = last.tx.norm_tx.payload.to_vec();
            }
            if scheme == CallScheme::InitCode {
                next.contract.code = Default::default();
            }
            next.call_work.mode = CallMode::LoadInput;
            Ok(next)
        }
        CallMode::LoadInput => load_input(trac),
        CallMode::CallDepthCheck => {
            let mut next = last.clone();
            if last.contract.call_depth >= CALL_CREATE_DEPTH {
                next.exec_mode = ExecMode::ErrDepth;
                return Ok(next);
            }
            next.call_work.mode = match scheme {
                // the create machine already moved value and made the account
                CallScheme::InitCode => CallMode::CheckRunningEmptyCode,
                // both value-carrying schemes must prove the caller can pay
                CallScheme::Call | CallScheme::CallCode => CallMode::ReadBalance,
                _ => CallMode::CheckIfPrecompile,
            };
            Ok(next)
        }
        CallMode::ReadBalance => {
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::GetBalance { balance, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("call balance got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                if balance < last.call_work.value {
                    next.exec_mode = ExecMode::ErrInsufficientBalance;
                    return Ok(next);
                }
                next.call_work.mode = CallMode::CheckTransferValue;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::GetBalance {
                    address: last.call_work.caller,
                    balance: U256::zero(),
                },
            )
        }
        CallMode::CheckTransferValue => {
            let mut next = last.clone();
            next.call_work.mode = CallMode::CheckAccountExists;
            Ok(next)
        }
        CallMode::CheckAccountExists => {
            if last.state_work.mode == StateWorkMode::Returned {
                // the probe's result rides along into the precompile check,
                // which decides whether a create or transfer is still due
                let mut next = last.clone();
                next.call_work.mode = CallMode::CheckIfPrecompile;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::HasAccount {
                    address: last.call_work.addr,
                    exists: false,
                },
            )
        }
        CallMode::CheckIfPrecompile => {
            let mut next = last.clone();
            // consume the existence probe when one ran; the transfer-free
            // schemes arrive here without it
            let mut exists = true;
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::HasAccount { exists: probed, .. } = last.state_work.work.clone()
                else {
                    return Err(VmError::Internal("call probe got a foreign result"));
                };
                exists = probed;
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
            }
            // only the schemes that move value still owe a create/transfer;
            // a delegate call inherits its value without transferring it.
            // The code load branches into the precompile afterwards, so a
            // value transfer to a precompile address lands first.
            let transfers = matches!(scheme, CallScheme::Call | CallScheme::CallCode);
            next.call_work.mode = if !transfers || last.call_work.value.is_zero() {
                CallMode::LoadCode
            } else if exists {
                CallMode::TransferValue
            } else {
                CallMode::CreateToAccount
            };
            Ok(next)
        }
        CallMode::CreateToAccount => {
            if last.state_work.mode == StateWorkMode::Returned {
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                next.call_work.mode = CallMode::TransferValue;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::CreateAccount {
                    address: last.call_work.addr,
                    nonce: 0,
                },
            )
        }
        CallMode::TransferValue => transfer_value(trac),
        CallMode::LoadPrecompile => run_precompile(trac),
        CallMode::LoadCode => {
            let mut next = last.clone();
            next.call_work.mode = if precompile_index(last.call_work.code_addr).is_some() {
                CallMode::LoadPrecompile
            } else {
                CallMode::LoadRegularContractCodeHash
            };
            Ok(next)
        }
        CallMode::LoadRegularContractCodeHash => {
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::GetCodeHash { code_hash, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("code hash got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                next.contract.code_hash = code_hash;
                if code_hash.is_zero() || code_hash == state::EMPTY_CODE_HASH {
                    next.contract.code = Default::default();
                    next.call_work.mode = CallMode::CheckRunningEmptyCode;
                } else {
                    next.call_work.mode = CallMode::LoadRegularContractCode;
                }
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::GetCodeHash {
                    address: last.call_work.code_addr,
                    code_hash: H256::zero(),
                },
            )
        }
        CallMode::LoadRegularContractCode => {
            let mut next = last.clone();
            next.contract.code = trac.code_by_hash(last.contract.code_hash)?;
            next.call_work.mode = CallMode::CheckRunningEmptyCode;
            Ok(next)
        }
        CallMode::CheckRunningEmptyCode => {
            let mut next = last.clone();
            if last.contract.code.is_empty() {
                // nothing to run; the frame completes successfully
                next.contract.ret_data.clear();
                next.exec_mode = ExecMode::ErrStop;
            } else {
                next.call_work.mode = CallMode::RunContract;
            }
            Ok(next)
        }
        CallMode::RunContract => {
            let mut next = last.clone();
            next.exec_mode = ExecMode::CallPre;
            Ok(next)
        }
    }
}

/// Copies the frame input (or initcode) out of the caller's memory, one
/// aligned 32-byte span per step, tracking progress in the work scope.
fn load_input(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();

    if last.call_work.kind == CallKind::Transaction {
        // payload was loaded wholesale at ResetInput; initcode likewise
        if last.call_work.scheme == CallScheme::InitCode {
            next.contract.code = last.tx.norm_tx.payload.clone();
            next.contract.code_hash = H256(keccak_hash(&last.tx.norm_tx.payload));
            next.contract.input.clear();
        }
        next.call_work.mode = CallMode::CallDepthCheck;
        return Ok(next);
    }

    let size = last.call_work.input_size;
    if size > 0 {
        let offset = last.call_work.input_offset;
        let delta = copy_delta(offset, size);
        let chunk = last.contract.memory.load_slice(offset, delta);
        if last.call_work.scheme == CallScheme::InitCode {
            let mut code = last.contract.code.to_vec();
            code.extend_from_slice(&chunk);
            next.contract.code = code.into();
        } else {
            next.contract.input.extend_from_slice(&chunk);
        }
        next.call_work.input_offset = offset + delta;
        next.call_work.input_size = size - delta;
        return Ok(next);
    }

    if last.call_work.scheme == CallScheme::InitCode {
        next.contract.code_hash = H256(keccak_hash(&next.contract.code));
    }
    next.call_work.mode = CallMode::CallDepthCheck;
    Ok(next)
}

/// Moves the call value from the caller to the destination, one balance side
/// per sub-step.
fn transfer_value(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    match (last.sub_index, last.state_work.mode) {
        (0, StateWorkMode::Returned) => {
            let StateWork::SubBalance { ok, .. } = last.state_work.work.clone() else {
                return Err(VmError::Internal("transfer got a foreign result"));
            };
            let mut next = last.clone();
            next.state_work.mode = StateWorkMode::Idle;
            next.state_work.work = StateWork::None;
            if !ok {
                next.exec_mode = ExecMode::ErrInsufficientBalance;
                return Ok(next);
            }
            next.sub_index = 1;
            Ok(next)
        }
        (0, _) => state::request(
            trac,
            StateWork::SubBalance {
                address: last.call_work.caller,
                delta: last.call_work.value,
                ok: false,
            },
        ),
        (_, StateWorkMode::Returned) => {
            let mut next = last.clone();
            next.state_work.mode = StateWorkMode::Idle;
            next.state_work.work = StateWork::None;
            next.sub_index = 0;
            next.call_work.mode = CallMode::LoadCode;
            Ok(next)
        }
        (_, _) => state::request(
            trac,
            StateWork::AddBalance {
                address: last.call_work.addr,
                delta: last.call_work.value,
            },
        ),
    }
}

// === Frame entry and exit ===

/// Opens the frame for the interpreter: one deeper, fresh stack, memory and
/// program counter.
pub fn exec_call_pre(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    next.contract.call_depth = last.contract.call_depth + 1;
    next.contract.stack = Default::default();
    next.contract.memory = Default::default();
    next.contract.memory_last_gas = 0;
    next.contract.memory_desired = 0;
    next.contract.ret_data = Default::default();
    next.contract.pc = 0;
    next.sub_index = 0;
    next.exec_mode = ExecMode::OpcodeLoad;
    Ok(next)
}

/// Routes a frame-local outcome into the matching unwind mode. The regular
/// halt commits; reverts keep their gas; depth and balance failures return
/// gas without output; everything else burns the frame's remaining gas.
pub fn exec_frame_exit(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    match last.exec_mode {
        ExecMode::ErrStop => {
            next.exec_mode = ExecMode::CallPost;
        }
        ExecMode::ErrExecutionReverted => {
            next.exec_mode = ExecMode::CallRevert;
        }
        ExecMode::ErrDepth | ExecMode::ErrInsufficientBalance => {
            next.contract.ret_data.clear();
            next.exec_mode = ExecMode::CallRevert;
        }
        _ => {
            next.contract.ret_data.clear();
            next.contract.gas = 0;
            next.exec_mode = ExecMode::CallRevert;
        }
    }
    Ok(next)
}

/// Successful frame completion: the caller resumes with the state committed,
/// the output delivered and the unused gas returned.
pub fn exec_call_post(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let caller_ref = last
        .return_to_step
        .ok_or(VmError::Internal("frame without a return step"))?;
    let caller = trac.by_ref(&caller_ref)?;
    let mut next = caller.clone();

    next.state_root = last.state_root;
    next.tx.logs = last.tx.logs.clone();
    next.tx.gas_refund = last.tx.gas_refund;
    next.contract.ret_data = last.contract.ret_data.clone();
    next.return_gas(last.contract.gas);

    if caller.call_work.scheme == CallScheme::InitCode {
        next.exec_mode = ExecMode::CreateInitPost;
        return Ok(next);
    }
    match caller.call_work.kind {
        CallKind::Transaction => {
            next.exec_mode = ExecMode::BlockTxSuccess;
            Ok(next)
        }
        CallKind::Create => {
            next.exec_mode = ExecMode::CreateInitPost;
            Ok(next)
        }
        CallKind::Opcode => finish_call_opcode(next, caller, true),
    }
}

/// Revert-style unwinds: gas comes back (already burned for hard errors) but
/// the caller's pre-call state stands.
pub fn exec_call_revert(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let caller_ref = last
        .return_to_step
        .ok_or(VmError::Internal("frame without a return step"))?;
    let caller = trac.by_ref(&caller_ref)?;
    let mut next = caller.clone();

    next.contract.ret_data = last.contract.ret_data.clone();
    next.return_gas(last.contract.gas);

    // failures inside the create machine (depth, balance, collision) carry a
    // snapshot of the step that entered it, before any call scope was set up
    if caller.call_work.scheme == CallScheme::InitCode || caller.exec_mode == ExecMode::CreateSetup
    {
        next.exec_mode = if last.contract.gas == 0 {
            ExecMode::CreateInitErr
        } else {
            ExecMode::CreateInitRevert
        };
        return Ok(next);
    }
    match caller.call_work.kind {
        CallKind::Transaction => {
            next.exec_mode = ExecMode::BlockTxRevert;
            Ok(next)
        }
        CallKind::Create => {
            next.exec_mode = if last.contract.gas == 0 {
                ExecMode::CreateInitErr
            } else {
                ExecMode::CreateInitRevert
            };
            Ok(next)
        }
        CallKind::Opcode => finish_call_opcode(next, caller, false),
    }
}

/// Caller-side completion of a CALL-family opcode: deliver the output into
/// memory, drop the arguments, push the status flag and move on.
fn finish_call_opcode(mut next: Step, caller: &Step, success: bool) -> Result<Step, VmError> {
    let work = &caller.call_work;
    let copy_len = (next.contract.ret_data.len() as u64).min(work.return_size);
    if copy_len > 0 {
        let data = next.contract.ret_data[..copy_len as usize].to_vec();
        next.contract.memory.store_slice(work.return_offset, &data)?;
    }
    let args = match work.scheme {
        CallScheme::Call | CallScheme::CallCode => 7,
        _ => 6,
    };
    for _ in 0..args {
        next.contract.stack.pop()?;
    }
    next.contract
        .stack
        .push_u256(if success { U256::one() } else { U256::zero() })?;
    next.sub_index = 0;
    next.contract.pc += 1;
    next.exec_mode = ExecMode::OpcodeLoad;
    Ok(next)
}

// === Precompiles ===

fn precompile_index(address: Address) -> Option<u64> {
    let bytes = address.as_bytes();
    if bytes[..19].iter().any(|b| *b != 0) {
        return None;
    }
    match bytes[19] {
        n @ 1..=4 => Some(n as u64),
        _ => None,
    }
}

/// Executes one of the supported precompiled contracts against the frame
/// input, in a single step.
fn run_precompile(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    let index = precompile_index(last.call_work.code_addr)
        .ok_or(VmError::Internal("precompile dispatch on a regular address"))?;
    let input = &last.contract.input;
    let words = to_word_size(input.len() as u64);

    let (gas, output) = match index {
        1 => (ECRECOVER_GAS, ecrecover(input)),
        2 => (
            SHA256_BASE_GAS + SHA256_PER_WORD_GAS * words,
            sha256(input).to_vec(),
        ),
        3 => {
            let mut padded = [0u8; 32];
            padded[12..].copy_from_slice(&ripemd160(input));
            (
                RIPEMD160_BASE_GAS + RIPEMD160_PER_WORD_GAS * words,
                padded.to_vec(),
            )
        }
        _ => (
            IDENTITY_BASE_GAS + IDENTITY_PER_WORD_GAS * words,
            input.clone(),
        ),
    };

    if !next.use_gas(gas) {
        next.exec_mode = ExecMode::ErrOutOfGas;
        return Ok(next);
    }
    next.contract.ret_data = output;
    next.exec_mode = ExecMode::ErrStop;
    Ok(next)
}

/// The ecrecover precompile: returns the recovered address left-padded to 32
/// bytes, or empty output on any invalid input.
fn ecrecover(input: &[u8]) -> Vec<u8> {
    let mut padded = [0u8; 128];
    let len = input.len().min(128);
    padded[..len].copy_from_slice(&input[..len]);

    let mut sighash = [0u8; 32];
    sighash.copy_from_slice(&padded[..32]);
    let v = U256::from_big_endian(&padded[32..64]);
    if v != U256::from(27) && v != U256::from(28) {
        return Vec::new();
    }
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&padded[64..96]);
    s.copy_from_slice(&padded[96..128]);
    let recovery_id = (v.low_u64() - 27) as u8;
    if !ecdsa::validate_signature_values(recovery_id, &r, &s, true) {
        return Vec::new();
    }

    let mut sig = [0u8; 65];
    sig[..32].copy_from_slice(&r);
    sig[32..64].copy_from_slice(&s);
    sig[64] = recovery_id;
    match ecdsa::recover_address(&sighash, &sig) {
        Ok(address) => {
            let mut out = vec![0u8; 32];
            out[12..].copy_from_slice(&address);
            out
        }
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precompile_addresses() {
        assert_eq!(precompile_index(Address::from_low_u64_be(1)), Some(1));
        assert_eq!(precompile_index(Address::from_low_u64_be(4)), Some(4));
        assert_eq!(precompile_index(Address::from_low_u64_be(5)), None);
        assert_eq!(precompile_index(Address::repeat_byte(1)), None);
    }

    #[test]
    fn ecrecover_rejects_bad_v() {
        let mut input = vec![0u8; 128];
        input[63] = 29;
        assert!(ecrecover(&input).is_empty());
    }
}
