//! Account-level state operations, built as multi-step calls into the MPT
//! engine.
//!
//! A caller (opcode handler or tx-pipeline step) stores a [`StateWork`]
//! request, snapshots itself into `return_to_step` and hands off with
//! `exec_mode = StateWork`. The work engine issues one MPT sub-request per
//! phase. Each phase has two observable sub-states: with the MPT scope
//! inactive the phase's request is issued; when the MPT engine has returned
//! (`MptMode::Done`) the result is consumed and the next phase opens in a
//! fresh step. When the variant's result fields are filled in, control
//! returns to the caller with `mode = Returned`; the caller reads the result
//! and resets the mode to `Idle`.

use bytes::{BufMut, Bytes};
use ethereum_types::{Address, H256, U256};
use hex_literal::hex;
use stepex_crypto::keccak::keccak_hash;
use stepex_rlp::{
    decode::RLPDecode,
    encode::{RLPEncode, encode},
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

use crate::{
    errors::VmError,
    exec_mode::ExecMode,
    mpt::{FAIL_NONE, MptMode, TreeSource},
    step::{Step, address_to_h256, h256_to_u256},
    trace::StepsTrace,
};

/// keccak256 of the empty byte string.
pub const EMPTY_CODE_HASH: H256 = H256(hex!(
    "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
));

/// Account value stored in the world tree under `keccak256(address)`:
/// `rlp([nonce, balance, storage_root, code_hash])`. The storage root keeps
/// the engine's ≤32-byte reference form (empty for no storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: Vec<u8>,
    pub code_hash: H256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: Vec::new(),
            code_hash: EMPTY_CODE_HASH,
        }
    }
}

impl Account {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&self.nonce)
            .encode_field(&self.balance)
            .encode_field(&self.storage_root.as_slice())
            .encode_field(&self.code_hash)
            .finish();
        buf
    }

    pub fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (balance, decoder) = decoder.decode_field("balance")?;
        let (storage_root, decoder): (Bytes, _) = decoder.decode_field("storage_root")?;
        let (code_hash, decoder) = decoder.decode_field("code_hash")?;
        decoder.finish()?;
        Ok(Self {
            nonce,
            balance,
            storage_root: storage_root.to_vec(),
            code_hash,
        })
    }

    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_CODE_HASH && self.code_hash != H256::zero()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum StateWorkMode {
    #[default]
    Idle = 0x00,
    Requesting = 0x01,
    /// Account data is loaded, the code blob still resolves through the
    /// code DB.
    ContinueCodeLookup = 0x02,
    /// Result available; the caller resets to Idle after consuming it.
    Returned = 0x03,
}

/// The account operations the engine exposes. Request fields are filled by
/// the caller; result fields by the work engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StateWork {
    #[default]
    None,
    HasAccount {
        address: Address,
        exists: bool,
    },
    CreateAccount {
        address: Address,
        nonce: u64,
    },
    GetBalance {
        address: Address,
        balance: U256,
    },
    SetBalance {
        address: Address,
        balance: U256,
    },
    AddBalance {
        address: Address,
        delta: U256,
    },
    SubBalance {
        address: Address,
        delta: U256,
        ok: bool,
    },
    GetCodeHash {
        address: Address,
        code_hash: H256,
    },
    GetCode {
        address: Address,
        code_hash: H256,
        code: Bytes,
    },
    GetCodeSize {
        address: Address,
        size: u64,
    },
    SetCode {
        address: Address,
        code: Bytes,
    },
    GetNonce {
        address: Address,
        nonce: u64,
    },
    SetNonce {
        address: Address,
        nonce: u64,
    },
    StorageRead {
        address: Address,
        slot: H256,
        value: H256,
    },
    StorageWrite {
        address: Address,
        slot: H256,
        value: H256,
    },
    SelfDestruct {
        address: Address,
        beneficiary: Address,
        moved: U256,
    },
}

impl StateWork {
    pub fn tag(&self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::HasAccount { .. } => 0x01,
            Self::CreateAccount { .. } => 0x02,
            Self::GetBalance { .. } => 0x03,
            Self::SetBalance { .. } => 0x04,
            Self::AddBalance { .. } => 0x05,
            Self::SubBalance { .. } => 0x06,
            Self::GetCodeHash { .. } => 0x07,
            Self::GetCode { .. } => 0x08,
            Self::GetCodeSize { .. } => 0x09,
            Self::SetCode { .. } => 0x0a,
            Self::GetNonce { .. } => 0x0b,
            Self::SetNonce { .. } => 0x0c,
            Self::StorageRead { .. } => 0x0d,
            Self::StorageWrite { .. } => 0x0e,
            Self::SelfDestruct { .. } => 0x0f,
        }
    }

    pub fn address(&self) -> Address {
        match self {
            Self::None => Address::zero(),
            Self::HasAccount { address, .. }
            | Self::CreateAccount { address, .. }
            | Self::GetBalance { address, .. }
            | Self::SetBalance { address, .. }
            | Self::AddBalance { address, .. }
            | Self::SubBalance { address, .. }
            | Self::GetCodeHash { address, .. }
            | Self::GetCode { address, .. }
            | Self::GetCodeSize { address, .. }
            | Self::SetCode { address, .. }
            | Self::GetNonce { address, .. }
            | Self::SetNonce { address, .. }
            | Self::StorageRead { address, .. }
            | Self::StorageWrite { address, .. }
            | Self::SelfDestruct { address, .. } => *address,
        }
    }

    /// Serialization with the tag byte explicit, the form the step tree
    /// commits to.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.tag()];
        buf.extend_from_slice(self.address().as_bytes());
        match self {
            Self::None => {}
            Self::HasAccount { exists, .. } => buf.put_u8(*exists as u8),
            Self::CreateAccount { nonce, .. } => buf.extend_from_slice(&nonce.to_le_bytes()),
            Self::GetBalance { balance, .. } | Self::SetBalance { balance, .. } => {
                buf.extend_from_slice(&balance.to_big_endian());
            }
            Self::AddBalance { delta, .. } => buf.extend_from_slice(&delta.to_big_endian()),
            Self::SubBalance { delta, ok, .. } => {
                buf.extend_from_slice(&delta.to_big_endian());
                buf.put_u8(*ok as u8);
            }
            Self::GetCodeHash { code_hash, .. } => buf.extend_from_slice(code_hash.as_bytes()),
            Self::GetCode {
                code_hash, code, ..
            } => {
                buf.extend_from_slice(code_hash.as_bytes());
                buf.extend_from_slice(code);
            }
            Self::GetCodeSize { size, .. } => buf.extend_from_slice(&size.to_le_bytes()),
            Self::SetCode { code, .. } => buf.extend_from_slice(code),
            Self::GetNonce { nonce, .. } | Self::SetNonce { nonce, .. } => {
                buf.extend_from_slice(&nonce.to_le_bytes());
            }
            Self::StorageRead { slot, value, .. } | Self::StorageWrite { slot, value, .. } => {
                buf.extend_from_slice(slot.as_bytes());
                buf.extend_from_slice(value.as_bytes());
            }
            Self::SelfDestruct {
                beneficiary, moved, ..
            } => {
                buf.extend_from_slice(beneficiary.as_bytes());
                buf.extend_from_slice(&moved.to_big_endian());
            }
        }
        buf
    }
}

/// Builds the request hand-off step for a caller: the work engine will give
/// control back to a copy of `last` with the result filled in.
pub fn request(trac: &dyn StepsTrace, work: StateWork) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();
    next.state_work.work = work;
    next.state_work.mode = StateWorkMode::Requesting;
    next.state_work.mode_on_finish = StateWorkMode::Returned;
    next.state_work.phase = 0;
    next.state_work.account = Account::default();
    next.return_to_step = Some(trac.last_ref());
    next.exec_mode = ExecMode::StateWork;
    Ok(next)
}

pub fn state_work_proc(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    match last.state_work.mode {
        StateWorkMode::Requesting => run_work(trac),
        StateWorkMode::ContinueCodeLookup => continue_code_lookup(trac),
        StateWorkMode::Idle | StateWorkMode::Returned => {
            Err(VmError::Internal("state work dispatched while idle"))
        }
    }
}

// === MPT sub-request plumbing ===

fn world_key(address: Address) -> U256 {
    U256::from_big_endian(&keccak_hash(address.as_bytes()))
}

fn storage_key(slot: H256) -> U256 {
    U256::from_big_endian(&keccak_hash(slot.as_bytes()))
}

fn state_root_bytes(state_root: H256) -> Vec<u8> {
    if state_root.is_zero() {
        Vec::new()
    } else {
        state_root.as_bytes().to_vec()
    }
}

/// Converts a ≤32-byte tree reference back into the 32-byte world commitment,
/// hashing embedded roots so they stay resolvable.
fn commit_root(trac: &dyn StepsTrace, reference: &[u8]) -> H256 {
    match reference.len() {
        0 => H256::zero(),
        32 => H256::from_slice(reference),
        _ => trac.put_mpt_node(reference),
    }
}

fn issue_mpt(
    trac: &dyn StepsTrace,
    source: TreeSource,
    start_reference: H256,
    root: Vec<u8>,
    key: U256,
    mode: MptMode,
    value: Vec<u8>,
) -> Step {
    let mut next = trac.last().clone();
    next.mpt_work.tree_source = source;
    next.mpt_work.start_reference = start_reference;
    next.mpt_work.current_root = root;
    next.mpt_work.lookup_key = key;
    next.mpt_work.lookup_key_nibbles = 64;
    next.mpt_work.lookup_nibble_depth = 0;
    next.mpt_work.fail_lookup = FAIL_NONE;
    next.mpt_work.value = value;
    next.mpt_work.mode = mode;
    next.return_to_step = Some(trac.last_ref());
    next.exec_mode = ExecMode::MptWork;
    next
}

fn issue_world(trac: &dyn StepsTrace, address: Address, mode: MptMode, value: Vec<u8>) -> Step {
    let state_root = trac.last().state_root;
    issue_mpt(
        trac,
        TreeSource::WorldAccounts,
        H256::zero(),
        state_root_bytes(state_root),
        world_key(address),
        mode,
        value,
    )
}

fn issue_storage(trac: &dyn StepsTrace, address: Address, slot: H256, mode: MptMode, value: Vec<u8>) -> Step {
    let storage_root = trac.last().state_work.account.storage_root.clone();
    issue_mpt(
        trac,
        TreeSource::AccountStorage,
        address_to_h256(address),
        storage_root,
        storage_key(slot),
        mode,
        value,
    )
}

/// Whether the phase's MPT sub-request has delivered its result.
fn mpt_done(step: &Step) -> bool {
    step.mpt_work.mode == MptMode::Done
}

fn mpt_found(step: &Step) -> bool {
    step.mpt_work.fail_lookup == FAIL_NONE
}

fn clear_mpt(next: &mut Step) {
    next.mpt_work.mode = MptMode::Inactive;
    next.mpt_work.value = Vec::new();
    next.mpt_work.current_root = Vec::new();
    next.mpt_work.write_root = Vec::new();
    next.mpt_work.parent_node_step = None;
}

/// Opens the next phase in a fresh step with the MPT scope cleared.
fn advance(last: &Step, phase: u64) -> Step {
    let mut next = last.clone();
    next.state_work.phase = phase;
    clear_mpt(&mut next);
    next
}

/// Hands the finished work item back to the caller, keeping the state root
/// the work produced.
fn finish(trac: &dyn StepsTrace, result: StateWork, state_root: H256) -> Result<Step, VmError> {
    let last = trac.last();
    let caller_ref = last
        .return_to_step
        .ok_or(VmError::Internal("state work without a caller"))?;
    let mut next = trac.by_ref(&caller_ref)?.clone();
    next.state_work.work = result;
    next.state_work.mode = last.state_work.mode_on_finish;
    next.state_work.phase = 0;
    next.state_work.account = Account::default();
    next.state_root = state_root;
    clear_mpt(&mut next);
    Ok(next)
}

fn decode_loaded_account(step: &Step) -> Result<(Account, bool), VmError> {
    if mpt_found(step) {
        let account = Account::decode(&step.mpt_work.value)?;
        Ok((account, true))
    } else {
        Ok((Account::default(), false))
    }
}

fn run_work(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let phase = last.state_work.phase;
    let done = mpt_done(last);
    let state_root = last.state_root;
    let work = last.state_work.work.clone();

    match work {
        StateWork::None => Err(VmError::Internal("empty state work request")),

        StateWork::HasAccount { address, .. } => {
            if !done {
                return Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new()));
            }
            finish(
                trac,
                StateWork::HasAccount {
                    address,
                    exists: mpt_found(last),
                },
                state_root,
            )
        }

        StateWork::GetBalance { address, .. } => {
            if !done {
                return Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new()));
            }
            let (account, _) = decode_loaded_account(last)?;
            finish(
                trac,
                StateWork::GetBalance {
                    address,
                    balance: account.balance,
                },
                state_root,
            )
        }

        StateWork::GetNonce { address, .. } => {
            if !done {
                return Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new()));
            }
            let (account, _) = decode_loaded_account(last)?;
            finish(
                trac,
                StateWork::GetNonce {
                    address,
                    nonce: account.nonce,
                },
                state_root,
            )
        }

        StateWork::GetCodeHash { address, .. } => {
            if !done {
                return Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new()));
            }
            let (account, exists) = decode_loaded_account(last)?;
            let code_hash = if exists { account.code_hash } else { H256::zero() };
            finish(trac, StateWork::GetCodeHash { address, code_hash }, state_root)
        }

        StateWork::GetCode { address, .. } => {
            if !done {
                return Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new()));
            }
            let (account, exists) = decode_loaded_account(last)?;
            if !exists || !account.has_code() {
                return finish(
                    trac,
                    StateWork::GetCode {
                        address,
                        code_hash: EMPTY_CODE_HASH,
                        code: Bytes::new(),
                    },
                    state_root,
                );
            }
            let mut next = advance(last, phase);
            next.state_work.account = account;
            next.state_work.mode = StateWorkMode::ContinueCodeLookup;
            Ok(next)
        }

        StateWork::GetCodeSize { address, .. } => {
            if !done {
                return Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new()));
            }
            let (account, exists) = decode_loaded_account(last)?;
            if !exists || !account.has_code() {
                return finish(trac, StateWork::GetCodeSize { address, size: 0 }, state_root);
            }
            let mut next = advance(last, phase);
            next.state_work.account = account;
            next.state_work.mode = StateWorkMode::ContinueCodeLookup;
            Ok(next)
        }

        StateWork::CreateAccount { address, nonce } => {
            if !done {
                let account = Account {
                    nonce,
                    ..Account::default()
                };
                return Ok(issue_world(
                    trac,
                    address,
                    MptMode::StartingWrite,
                    account.encode(),
                ));
            }
            let root = commit_root(trac, &last.mpt_work.current_root);
            finish(trac, StateWork::CreateAccount { address, nonce }, root)
        }

        StateWork::SetBalance { address, balance } => write_account_field(
            trac,
            address,
            StateWork::SetBalance { address, balance },
            None,
            move |account| {
                account.balance = balance;
                true
            },
        ),

        StateWork::AddBalance { address, delta } => write_account_field(
            trac,
            address,
            StateWork::AddBalance { address, delta },
            None,
            move |account| {
                account.balance = account.balance.saturating_add(delta);
                true
            },
        ),

        StateWork::SubBalance { address, delta, .. } => write_account_field(
            trac,
            address,
            StateWork::SubBalance {
                address,
                delta,
                ok: true,
            },
            Some(StateWork::SubBalance {
                address,
                delta,
                ok: false,
            }),
            move |account| {
                if account.balance < delta {
                    return false;
                }
                account.balance -= delta;
                true
            },
        ),

        StateWork::SetNonce { address, nonce } => write_account_field(
            trac,
            address,
            StateWork::SetNonce { address, nonce },
            None,
            move |account| {
                account.nonce = nonce;
                true
            },
        ),

        StateWork::SetCode { address, code } => {
            let result = StateWork::SetCode {
                address,
                code: code.clone(),
            };
            match (phase, done) {
                (0, false) => Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new())),
                (0, true) => {
                    let (mut account, _) = decode_loaded_account(last)?;
                    trac.put_code(&code);
                    account.code_hash = H256(keccak_hash(&code));
                    let mut next = advance(last, 1);
                    next.state_work.account = account;
                    Ok(next)
                }
                (_, false) => {
                    let account = last.state_work.account.clone();
                    Ok(issue_world(trac, address, MptMode::StartingWrite, account.encode()))
                }
                (_, true) => {
                    let root = commit_root(trac, &last.mpt_work.current_root);
                    finish(trac, result, root)
                }
            }
        }

        StateWork::StorageRead { address, slot, .. } => {
            match (phase, done) {
                (0, false) => Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new())),
                (0, true) => {
                    let (account, exists) = decode_loaded_account(last)?;
                    if !exists || account.storage_root.is_empty() {
                        return finish(
                            trac,
                            StateWork::StorageRead {
                                address,
                                slot,
                                value: H256::zero(),
                            },
                            state_root,
                        );
                    }
                    let mut next = advance(last, 1);
                    next.state_work.account = account;
                    Ok(next)
                }
                (_, false) => Ok(issue_storage(trac, address, slot, MptMode::StartingRead, Vec::new())),
                (_, true) => {
                    let value = if mpt_found(last) {
                        H256(U256::decode(&last.mpt_work.value)?.to_big_endian())
                    } else {
                        H256::zero()
                    };
                    finish(trac, StateWork::StorageRead { address, slot, value }, state_root)
                }
            }
        }

        StateWork::StorageWrite { address, slot, value } => {
            storage_write(trac, address, slot, value)
        }

        StateWork::SelfDestruct {
            address,
            beneficiary,
            moved,
        } => self_destruct(trac, address, beneficiary, moved),
    }
}

/// Shared read-modify-write flow over a single account record. `apply`
/// returning false skips the write and finishes with `skipped` instead.
fn write_account_field(
    trac: &dyn StepsTrace,
    address: Address,
    result: StateWork,
    skipped: Option<StateWork>,
    apply: impl FnOnce(&mut Account) -> bool,
) -> Result<Step, VmError> {
    let last = trac.last();
    match (last.state_work.phase, mpt_done(last)) {
        (0, false) => Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new())),
        (0, true) => {
            let (mut account, _) = decode_loaded_account(last)?;
            if !apply(&mut account) {
                return finish(trac, skipped.unwrap_or(result), last.state_root);
            }
            let mut next = advance(last, 1);
            next.state_work.account = account;
            Ok(next)
        }
        (_, false) => {
            let account = last.state_work.account.clone();
            Ok(issue_world(trac, address, MptMode::StartingWrite, account.encode()))
        }
        (_, true) => {
            let root = commit_root(trac, &last.mpt_work.current_root);
            finish(trac, result, root)
        }
    }
}

fn storage_write(
    trac: &dyn StepsTrace,
    address: Address,
    slot: H256,
    value: H256,
) -> Result<Step, VmError> {
    let last = trac.last();
    let result = StateWork::StorageWrite { address, slot, value };
    match (last.state_work.phase, mpt_done(last)) {
        // load the account record for its storage root
        (0, false) => Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new())),
        (0, true) => {
            let (account, _) = decode_loaded_account(last)?;
            if account.storage_root.is_empty() && value.is_zero() {
                // nothing to delete in an empty storage tree
                return finish(trac, result, last.state_root);
            }
            let mut next = advance(last, 1);
            next.state_work.account = account;
            Ok(next)
        }
        // probe the slot so zero-writes can distinguish delete from no-op
        (1, false) => Ok(issue_storage(trac, address, slot, MptMode::StartingRead, Vec::new())),
        (1, true) => {
            if value.is_zero() && !mpt_found(last) {
                return finish(trac, result, last.state_root);
            }
            Ok(advance(last, 2))
        }
        // mutate the storage tree
        (2, false) => {
            if value.is_zero() {
                Ok(issue_storage(trac, address, slot, MptMode::StartingDelete, Vec::new()))
            } else {
                let encoded = encode(h256_to_u256(value));
                Ok(issue_storage(trac, address, slot, MptMode::StartingWrite, encoded))
            }
        }
        (2, true) => {
            let mut next = advance(last, 3);
            let mut account = last.state_work.account.clone();
            account.storage_root = last.mpt_work.current_root.clone();
            next.state_work.account = account;
            Ok(next)
        }
        // fold the new storage root into the account record
        (_, false) => {
            let account = last.state_work.account.clone();
            Ok(issue_world(trac, address, MptMode::StartingWrite, account.encode()))
        }
        (_, true) => {
            let root = commit_root(trac, &last.mpt_work.current_root);
            finish(trac, result, root)
        }
    }
}

fn self_destruct(
    trac: &dyn StepsTrace,
    address: Address,
    beneficiary: Address,
    moved: U256,
) -> Result<Step, VmError> {
    let last = trac.last();
    let result = |moved| StateWork::SelfDestruct {
        address,
        beneficiary,
        moved,
    };
    match (last.state_work.phase, mpt_done(last)) {
        // load the destructing account
        (0, false) => Ok(issue_world(trac, address, MptMode::StartingRead, Vec::new())),
        (0, true) => {
            let (account, exists) = decode_loaded_account(last)?;
            if !exists {
                return finish(trac, result(U256::zero()), last.state_root);
            }
            let mut next = if beneficiary == address {
                // a self-beneficiary burns the balance with the account
                advance(last, 3)
            } else {
                advance(last, 1)
            };
            next.state_work.work = result(account.balance);
            Ok(next)
        }
        // credit the beneficiary
        (1, false) => Ok(issue_world(trac, beneficiary, MptMode::StartingRead, Vec::new())),
        (1, true) => {
            let (mut b_account, _) = decode_loaded_account(last)?;
            b_account.balance = b_account.balance.saturating_add(moved);
            let mut next = advance(last, 2);
            next.state_work.account = b_account;
            Ok(next)
        }
        (2, false) => {
            let account = last.state_work.account.clone();
            Ok(issue_world(trac, beneficiary, MptMode::StartingWrite, account.encode()))
        }
        (2, true) => {
            let mut next = advance(last, 3);
            next.state_root = commit_root(trac, &last.mpt_work.current_root);
            Ok(next)
        }
        // remove the account from the world tree
        (_, false) => Ok(issue_world(trac, address, MptMode::StartingDelete, Vec::new())),
        (_, true) => {
            let root = commit_root(trac, &last.mpt_work.current_root);
            finish(trac, result(moved), root)
        }
    }
}

fn continue_code_lookup(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let account = &last.state_work.account;
    let code = trac.code_by_hash(account.code_hash)?;
    match last.state_work.work.clone() {
        StateWork::GetCode { address, .. } => finish(
            trac,
            StateWork::GetCode {
                address,
                code_hash: account.code_hash,
                code,
            },
            last.state_root,
        ),
        StateWork::GetCodeSize { address, .. } => finish(
            trac,
            StateWork::GetCodeSize {
                address,
                size: code.len() as u64,
            },
            last.state_root,
        ),
        _ => Err(VmError::Internal("code lookup for a non-code work item")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_rlp_round_trip() {
        let account = Account {
            nonce: 7,
            balance: U256::from(1_000_000u64),
            storage_root: vec![0xaa; 32],
            code_hash: H256::repeat_byte(0x11),
        };
        assert_eq!(Account::decode(&account.encode()).unwrap(), account);
    }

    #[test]
    fn default_account_is_empty() {
        let account = Account::default();
        assert_eq!(account.code_hash, EMPTY_CODE_HASH);
        assert!(!account.has_code());
        assert!(account.storage_root.is_empty());
    }

    #[test]
    fn work_encoding_distinguishes_variants() {
        let a = StateWork::GetBalance {
            address: Address::repeat_byte(1),
            balance: U256::zero(),
        };
        let b = StateWork::GetNonce {
            address: Address::repeat_byte(1),
            nonce: 0,
        };
        assert_ne!(a.encode(), b.encode());
    }
}
