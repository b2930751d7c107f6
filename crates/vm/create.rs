//! Contract creation: address derivation, nonce bookkeeping, initcode
//! execution through the call machine, and the deployment checks on the
//! returned runtime code.

use ethereum_types::{Address, H256, U256};
use stepex_common::constants::{CALL_CREATE_DEPTH, CREATE_DATA_GAS, MAX_CODE_SIZE};
use stepex_crypto::keccak::keccak_hash;
use stepex_rlp::structs::Encoder;

use crate::{
    call::{CallKind, CallMode, CallScheme},
    errors::VmError,
    exec_mode::ExecMode,
    state::{self, EMPTY_CODE_HASH, StateWork, StateWorkMode},
    step::{Step, address_to_h256},
    trace::StepsTrace,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CreateMode {
    #[default]
    StartCreate = 0x00,
    StartCreate2 = 0x01,
    GetCallerNonce = 0x02,
    ComputeAddress = 0x03,
    CreateDepthCheck = 0x04,
    ReadBalance = 0x05,
    IncrementNonce = 0x06,
    CheckContractAlreadyExists = 0x07,
    CreateAccount = 0x08,
    TransferValue = 0x09,
    RunInitContract = 0x0a,

    // post-initcode phases
    CheckCodeSize = 0x0b,
    CheckCodeStartingByte = 0x0c,
    UseCreateGas = 0x0d,
    SetAccountCode = 0x0e,
}

/// `keccak(rlp([sender, nonce]))[12..]`.
fn create_address(sender: Address, nonce: u64) -> Address {
    let mut buf = Vec::new();
    Encoder::new(&mut buf)
        .encode_field(&sender)
        .encode_field(&nonce)
        .finish();
    Address::from_slice(&keccak_hash(&buf)[12..])
}

/// `keccak(0xff ++ sender ++ salt ++ keccak(initcode))[12..]`.
fn create2_address(sender: Address, salt: H256, init_code_hash: H256) -> Address {
    let mut buf = Vec::with_capacity(85);
    buf.push(0xff);
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(salt.as_bytes());
    buf.extend_from_slice(init_code_hash.as_bytes());
    Address::from_slice(&keccak_hash(&buf)[12..])
}

pub fn create_work_proc(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let work = last.create_work.clone();

    match work.mode {
        CreateMode::StartCreate | CreateMode::StartCreate2 => {
            let mut next = last.clone();
            next.return_to_step = Some(trac.last_ref());
            next.create_work.snapshot_root = last.state_root;
            next.create_work.mode = CreateMode::GetCallerNonce;
            Ok(next)
        }
        CreateMode::GetCallerNonce => {
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::GetNonce { nonce, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("create got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                next.create_work.nonce = nonce;
                next.create_work.mode = CreateMode::ComputeAddress;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::GetNonce {
                    address: work.caller,
                    nonce: 0,
                },
            )
        }
        CreateMode::ComputeAddress => {
            let mut next = last.clone();
            next.create_work.addr = if work.is_create2 {
                create2_address(work.caller, work.salt, work.init_code_hash)
            } else {
                create_address(work.caller, work.nonce)
            };
            next.create_work.mode = CreateMode::CreateDepthCheck;
            Ok(next)
        }
        CreateMode::CreateDepthCheck => {
            let mut next = last.clone();
            if last.contract.call_depth >= CALL_CREATE_DEPTH {
                next.exec_mode = ExecMode::ErrDepth;
                return Ok(next);
            }
            next.create_work.mode = CreateMode::ReadBalance;
            Ok(next)
        }
        CreateMode::ReadBalance => {
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::GetBalance { balance, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("create got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                if balance < work.value {
                    next.exec_mode = ExecMode::ErrInsufficientBalance;
                    return Ok(next);
                }
                next.create_work.mode = CreateMode::IncrementNonce;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::GetBalance {
                    address: work.caller,
                    balance: U256::zero(),
                },
            )
        }
        CreateMode::IncrementNonce => {
            if last.state_work.mode == StateWorkMode::Returned {
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                // everything up to and including the increment survives a
                // failed init
                next.create_work.snapshot_root = next.state_root;
                next.create_work.mode = CreateMode::CheckContractAlreadyExists;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::SetNonce {
                    address: work.caller,
                    nonce: work.nonce + 1,
                },
            )
        }
        CreateMode::CheckContractAlreadyExists => {
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::GetCodeHash { code_hash, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("create got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                if !code_hash.is_zero() && code_hash != EMPTY_CODE_HASH {
                    // address collision burns the frame
                    next.contract.gas = 0;
                    next.exec_mode = ExecMode::ErrOutOfGas;
                    return Ok(next);
                }
                next.create_work.mode = CreateMode::CreateAccount;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::GetCodeHash {
                    address: work.addr,
                    code_hash: H256::zero(),
                },
            )
        }
        CreateMode::CreateAccount => {
            if last.state_work.mode == StateWorkMode::Returned {
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                next.create_work.mode = CreateMode::TransferValue;
                return Ok(next);
            }
            // a read-modify-write keeps any balance the address already held
            state::request(
                trac,
                StateWork::SetNonce {
                    address: work.addr,
                    nonce: 1,
                },
            )
        }
        CreateMode::TransferValue => transfer_value(trac),
        CreateMode::RunInitContract => {
            let mut next = last.clone();
            let call = &mut next.call_work;
            call.mode = CallMode::Start;
            // tx-level creates stream their initcode from the tx payload
            call.kind = match work.kind {
                CallKind::Transaction => CallKind::Transaction,
                _ => CallKind::Create,
            };
            call.scheme = CallScheme::InitCode;
            call.caller = work.caller;
            call.addr = work.addr;
            call.code_addr = work.addr;
            call.read_only = last.contract.read_only;
            call.gas = work.gas;
            call.value = work.value;
            call.input_offset = work.init_offset;
            call.input_size = work.init_size;
            call.return_offset = 0;
            call.return_size = 0;
            next.exec_mode = ExecMode::CallSetup;
            Ok(next)
        }
        _ => Err(VmError::Internal("create setup in a post-init mode")),
    }
}

fn transfer_value(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let work = last.create_work.clone();
    if work.value.is_zero() {
        let mut next = last.clone();
        next.sub_index = 0;
        next.create_work.mode = CreateMode::RunInitContract;
        return Ok(next);
    }
    match (last.sub_index, last.state_work.mode) {
        (0, StateWorkMode::Returned) => {
            let StateWork::SubBalance { ok, .. } = last.state_work.work.clone() else {
                return Err(VmError::Internal("create transfer got a foreign result"));
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
                address: work.caller,
                delta: work.value,
                ok: false,
            },
        ),
        (_, StateWorkMode::Returned) => {
            let mut next = last.clone();
            next.state_work.mode = StateWorkMode::Idle;
            next.state_work.work = StateWork::None;
            next.sub_index = 0;
            next.create_work.mode = CreateMode::RunInitContract;
            Ok(next)
        }
        (_, _) => state::request(
            trac,
            StateWork::AddBalance {
                address: work.addr,
                delta: work.value,
            },
        ),
    }
}

/// The initcode returned successfully: its output is the runtime code, which
/// must pass the size and first-byte checks and pay the deposit before it is
/// installed.
pub fn create_init_post(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    match last.create_work.mode {
        CreateMode::RunInitContract => {
            let mut next = last.clone();
            next.create_work.mode = CreateMode::CheckCodeSize;
            Ok(next)
        }
        CreateMode::CheckCodeSize => {
            let mut next = last.clone();
            if last.contract.ret_data.len() as u64 > MAX_CODE_SIZE {
                return fail_burning_init_gas(trac, next);
            }
            next.create_work.mode = CreateMode::CheckCodeStartingByte;
            Ok(next)
        }
        CreateMode::CheckCodeStartingByte => {
            let mut next = last.clone();
            if last.contract.ret_data.first() == Some(&0xef) {
                return fail_burning_init_gas(trac, next);
            }
            next.create_work.mode = CreateMode::UseCreateGas;
            Ok(next)
        }
        CreateMode::UseCreateGas => {
            let mut next = last.clone();
            let deposit = CREATE_DATA_GAS * last.contract.ret_data.len() as u64;
            if !next.use_gas(deposit) {
                return fail_burning_init_gas(trac, next);
            }
            next.create_work.mode = CreateMode::SetAccountCode;
            Ok(next)
        }
        CreateMode::SetAccountCode => {
            if last.state_work.mode == StateWorkMode::Returned {
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                return finish_create(next, true);
            }
            state::request(
                trac,
                StateWork::SetCode {
                    address: last.create_work.addr,
                    code: last.contract.ret_data.clone().into(),
                },
            )
        }
        _ => Err(VmError::Internal("create post-init in a setup mode")),
    }
}

/// Initcode reverted: the revert data surfaces, gas already came back.
pub fn create_init_revert(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    restore_snapshot_root(&mut next);
    finish_create(next, false)
}

/// Initcode failed hard: gas is gone, no output.
pub fn create_init_err(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    restore_snapshot_root(&mut next);
    next.contract.ret_data.clear();
    finish_create(next, false)
}

/// Pre-init failures restore a snapshot whose state root is already the
/// rollback point; only a recorded snapshot overrides it.
fn restore_snapshot_root(next: &mut Step) {
    if !next.create_work.snapshot_root.is_zero() {
        next.state_root = next.create_work.snapshot_root;
    }
}

/// Deployment checks failed after a successful init run: the gas the init
/// returned burns with it, and the state rolls back past the init.
fn fail_burning_init_gas(trac: &dyn StepsTrace, mut next: Step) -> Result<Step, VmError> {
    let init_frame_ref = next
        .return_to_step
        .ok_or(VmError::Internal("create without a frame snapshot"))?;
    let creator_gas_before_init = trac.by_ref(&init_frame_ref)?.contract.gas;
    next.contract.gas = creator_gas_before_init;
    restore_snapshot_root(&mut next);
    next.contract.ret_data.clear();
    finish_create(next, false)
}

/// Caller-side completion: drop the arguments, push the new address (or zero)
/// and resume the creator.
fn finish_create(mut next: Step, success: bool) -> Result<Step, VmError> {
    let address = next.create_work.addr;
    match next.create_work.kind {
        CallKind::Transaction => {
            next.exec_mode = if success {
                ExecMode::BlockTxSuccess
            } else {
                ExecMode::BlockTxRevert
            };
            Ok(next)
        }
        _ => {
            let args = if next.create_work.is_create2 { 4 } else { 3 };
            for _ in 0..args {
                next.contract.stack.pop()?;
            }
            let result = if success {
                address_to_h256(address)
            } else {
                H256::zero()
            };
            next.contract.stack.push(result)?;
            next.create_work.mode = CreateMode::StartCreate;
            next.sub_index = 0;
            next.contract.pc += 1;
            next.exec_mode = ExecMode::OpcodeLoad;
            Ok(next)
        }
    }
}
