use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use stepex_common::types::{Log, MinimalExecutionPayload, NormalizedTransaction, Receipt};

use crate::{
    call::{CallKind, CallMode, CallScheme},
    create::CreateMode,
    errors::VmError,
    exec_mode::ExecMode,
    mpt::{MptMode, TreeSource},
    state::{Account, StateWork, StateWorkMode},
    tx::TxMode,
};

/// Reference to an earlier step of the trace. The tree commits only to the
/// referenced step's root; the index locates the step body in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRef {
    pub step_index: u64,
    pub root: H256,
}

pub fn u256_to_h256(value: U256) -> H256 {
    H256(value.to_big_endian())
}

pub fn h256_to_u256(value: H256) -> U256 {
    U256::from_big_endian(value.as_bytes())
}

pub fn address_to_h256(address: Address) -> H256 {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address.as_bytes());
    H256(out)
}

pub fn h256_to_address(value: H256) -> Address {
    Address::from_slice(&value.as_bytes()[12..])
}

/// The EVM stack: at most 1024 32-byte words. Out-of-range accesses are
/// interpreter bugs (the stack contract is validated before handlers run),
/// surfaced as [`VmError::Internal`] rather than panics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stack(Vec<H256>);

impl Stack {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn words(&self) -> &[H256] {
        &self.0
    }

    pub fn push(&mut self, value: H256) -> Result<(), VmError> {
        if self.0.len() >= 1024 {
            return Err(VmError::Internal("stack overflow past validation"));
        }
        self.0.push(value);
        Ok(())
    }

    pub fn push_u256(&mut self, value: U256) -> Result<(), VmError> {
        self.push(u256_to_h256(value))
    }

    pub fn pop(&mut self) -> Result<H256, VmError> {
        self.0
            .pop()
            .ok_or(VmError::Internal("stack underflow past validation"))
    }

    pub fn pop_u256(&mut self) -> Result<U256, VmError> {
        Ok(h256_to_u256(self.pop()?))
    }

    pub fn peek(&self) -> Result<H256, VmError> {
        self.back(0)
    }

    pub fn peek_u256(&self) -> Result<U256, VmError> {
        Ok(h256_to_u256(self.peek()?))
    }

    /// Like peek, but write instead of read, to avoid pop/push overhead.
    pub fn tweak(&mut self, value: H256) -> Result<(), VmError> {
        self.tweak_back(value, 0)
    }

    pub fn tweak_u256(&mut self, value: U256) -> Result<(), VmError> {
        self.tweak_back(u256_to_h256(value), 0)
    }

    /// Reads the n-th word from the top (top is 0).
    pub fn back(&self, n: usize) -> Result<H256, VmError> {
        let len = self.0.len();
        if n >= len {
            return Err(VmError::Internal("stack access out of range"));
        }
        Ok(self.0[len - n - 1])
    }

    pub fn back_u256(&self, n: usize) -> Result<U256, VmError> {
        Ok(h256_to_u256(self.back(n)?))
    }

    pub fn tweak_back(&mut self, value: H256, n: usize) -> Result<(), VmError> {
        let len = self.0.len();
        if n >= len {
            return Err(VmError::Internal("stack access out of range"));
        }
        self.0[len - n - 1] = value;
        Ok(())
    }

    pub fn tweak_back_u256(&mut self, value: U256, n: usize) -> Result<(), VmError> {
        self.tweak_back(u256_to_h256(value), n)
    }

    pub fn dup(&mut self, n: usize) -> Result<(), VmError> {
        let value = self.back(n - 1)?;
        self.push(value)
    }

    pub fn swap(&mut self, n: usize) -> Result<(), VmError> {
        let top = self.back(0)?;
        let other = self.back(n - 1)?;
        self.tweak_back(top, n - 1)?;
        self.tweak_back(other, 0)
    }
}

/// Frame memory. Expansion happens in 32-byte increments driven by the
/// UpdateMemorySize pipeline stage; the length is a multiple of 32 on every
/// step boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory(Vec<u8>);

impl Memory {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reads 32 bytes at `offset`, zero-padded past the current length.
    pub fn load_word(&self, offset: u64) -> H256 {
        let mut out = [0u8; 32];
        let offset = offset as usize;
        if offset < self.0.len() {
            let end = (offset + 32).min(self.0.len());
            out[..end - offset].copy_from_slice(&self.0[offset..end]);
        }
        H256(out)
    }

    /// Reads a span, zero-padded past the current length.
    pub fn load_slice(&self, offset: u64, len: u64) -> Vec<u8> {
        let mut out = vec![0u8; len as usize];
        let offset = offset as usize;
        if offset < self.0.len() {
            let end = (offset + len as usize).min(self.0.len());
            out[..end - offset].copy_from_slice(&self.0[offset..end]);
        }
        out
    }

    pub fn store_word(&mut self, offset: u64, value: H256) -> Result<(), VmError> {
        self.store_slice(offset, value.as_bytes())
    }

    pub fn store_byte(&mut self, offset: u64, value: u8) -> Result<(), VmError> {
        self.store_slice(offset, &[value])
    }

    pub fn store_slice(&mut self, offset: u64, data: &[u8]) -> Result<(), VmError> {
        let offset = offset as usize;
        if offset + data.len() > self.0.len() {
            return Err(VmError::Internal("memory access past expansion"));
        }
        self.0[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn append_zero_word(&mut self) {
        self.0.extend_from_slice(&[0u8; 32]);
    }

    pub fn append_zero_byte(&mut self) {
        self.0.push(0);
    }
}

// === Step scopes ===

/// Most recent 256 block hashes, a ring buffer keyed by `number % 256`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryScope {
    pub block_hashes: Vec<H256>,
}

impl Default for HistoryScope {
    fn default() -> Self {
        Self {
            block_hashes: vec![H256::zero(); 256],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockScope {
    pub parent_hash: H256,
    pub coinbase: Address,
    pub gas_limit: u64,
    pub block_number: u64,
    pub time: u64,
    pub difficulty: U256,
    pub base_fee: U256,
    pub gas_used: u64,
    pub receipts: Vec<Receipt>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxScope {
    pub tx_index: u64,
    pub origin: Address,
    /// Effective gas price of the current transaction.
    pub gas_price: U256,
    /// Raw envelope of the transaction being processed.
    pub current_tx: Bytes,
    pub norm_tx: NormalizedTransaction,
    /// Logs accumulated by the current transaction.
    pub logs: Vec<Log>,
    pub gas_refund: u64,
    pub mode: TxMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractScope {
    pub self_addr: Address,
    pub create: bool,
    pub call_depth: u64,
    pub caller: Address,
    pub memory: Memory,
    /// Memory gas already charged for the current size.
    pub memory_last_gas: u64,
    /// Size the memory must reach before the opcode runs.
    pub memory_desired: u64,
    pub stack: Stack,
    pub ret_data: Vec<u8>,
    pub code: Bytes,
    pub code_hash: H256,
    pub code_addr: Address,
    pub input: Vec<u8>,
    pub gas: u64,
    pub value: U256,
    pub read_only: bool,
    pub is_init_code: bool,
    /// Opcode cached by OpcodeLoad so later pipeline stages avoid re-reading
    /// the code.
    pub op: u8,
    pub pc: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallWorkScope {
    pub mode: CallMode,
    pub kind: CallKind,
    pub scheme: CallScheme,
    pub caller: Address,
    pub addr: Address,
    pub code_addr: Address,
    pub read_only: bool,
    pub gas: u64,
    pub value: U256,
    pub input_offset: u64,
    pub input_size: u64,
    pub return_offset: u64,
    pub return_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateWorkScope {
    pub mode: CreateMode,
    pub kind: CallKind,
    pub caller: Address,
    /// Address of the contract being created.
    pub addr: Address,
    pub value: U256,
    pub gas: u64,
    pub salt: H256,
    pub is_create2: bool,
    /// Creator nonce observed before the increment.
    pub nonce: u64,
    pub init_offset: u64,
    pub init_size: u64,
    /// keccak of the initcode, for the CREATE2 address derivation.
    pub init_code_hash: H256,
    /// World root to restore when the initcode fails: taken after the nonce
    /// increment, which survives the rollback.
    pub snapshot_root: H256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateWorkScope {
    pub work: StateWork,
    pub mode: StateWorkMode,
    pub mode_on_finish: StateWorkMode,
    /// Progress counter of the current account operation.
    pub phase: u64,
    /// The account the operation is transforming, loaded by its first
    /// world-tree read.
    pub account: Account,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MptWorkScope {
    pub tree_source: TreeSource,
    /// Identifies the tree instance, e.g. the account address for storage
    /// tries. Zero for the world tree.
    pub start_reference: H256,
    pub mode: MptMode,
    pub mode_on_finish: MptMode,
    /// The node currently expanded (reading) or bubbled up (writing):
    /// embedded RLP if shorter than 32 bytes, a keccak hash at exactly 32.
    pub current_root: Vec<u8>,
    /// The value a write will place, parked while the anchoring read pass
    /// reuses the value field for its own results.
    pub write_root: Vec<u8>,
    /// Outcome marker of the preparatory read pass, consumed by the first
    /// write/delete step. Zero means the lookup succeeded.
    pub fail_lookup: u8,
    /// Big-endian key; the first nibble is the most significant.
    pub lookup_key: U256,
    pub lookup_key_nibbles: u64,
    pub lookup_nibble_depth: u64,
    /// Path segment accumulated while grafting, most significant nibble first.
    pub graft_key_segment: U256,
    pub graft_key_nibbles: u64,
    /// Value read from or written into the tree. At most 2048 bytes.
    pub value: Vec<u8>,
    pub parent_node_step: Option<StepRef>,
}

/// The full execution state of the fraud-proof machine at one point of the
/// trace. Immutable once produced; transitions copy and modify.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    /// Commitment to the world MPT. Trusted by downstream steps.
    pub state_root: H256,
    pub exec_mode: ExecMode,
    /// Progress counter within a multi-step operation.
    pub sub_index: u64,
    /// Frame to continue in when the current work returns.
    pub return_to_step: Option<StepRef>,

    pub payload: MinimalExecutionPayload,
    pub history: HistoryScope,
    pub block: BlockScope,
    pub tx: TxScope,
    pub contract: ContractScope,
    pub call_work: CallWorkScope,
    pub create_work: CreateWorkScope,
    pub state_work: StateWorkScope,
    pub mpt_work: MptWorkScope,
}

impl Step {
    /// Deducts gas from the current frame; false means out of gas.
    pub fn use_gas(&mut self, delta: u64) -> bool {
        if delta > self.contract.gas {
            return false;
        }
        self.contract.gas -= delta;
        true
    }

    pub fn return_gas(&mut self, delta: u64) {
        // gas totals stay within u64, the block gas limit bounds them
        self.contract.gas += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_accessors() {
        let mut stack = Stack::default();
        stack.push_u256(U256::from(1)).unwrap();
        stack.push_u256(U256::from(2)).unwrap();
        stack.push_u256(U256::from(3)).unwrap();
        assert_eq!(stack.back_u256(0).unwrap(), U256::from(3));
        assert_eq!(stack.back_u256(2).unwrap(), U256::from(1));
        stack.swap(3).unwrap();
        assert_eq!(stack.back_u256(0).unwrap(), U256::from(1));
        assert_eq!(stack.back_u256(2).unwrap(), U256::from(3));
        stack.dup(2).unwrap();
        assert_eq!(stack.len(), 4);
        assert_eq!(stack.peek_u256().unwrap(), U256::from(2));
    }

    #[test]
    fn stack_bounds_are_errors() {
        let mut stack = Stack::default();
        assert!(stack.pop().is_err());
        assert!(stack.back(0).is_err());
        stack.push(H256::zero()).unwrap();
        assert!(stack.back(1).is_err());
    }

    #[test]
    fn memory_word_access() {
        let mut memory = Memory::default();
        memory.append_zero_word();
        memory.append_zero_word();
        memory.store_word(32, H256::repeat_byte(0xab)).unwrap();
        assert_eq!(memory.load_word(32), H256::repeat_byte(0xab));
        // reads past the end are zero padded
        let tail = memory.load_word(48);
        assert_eq!(&tail.as_bytes()[..16], &[0xab; 16]);
        assert_eq!(&tail.as_bytes()[16..], &[0u8; 16]);
        assert!(memory.store_word(48, H256::zero()).is_err());
    }

    #[test]
    fn address_embedding_round_trip() {
        let addr = Address::repeat_byte(0x77);
        assert_eq!(h256_to_address(address_to_h256(addr)), addr);
    }
}
