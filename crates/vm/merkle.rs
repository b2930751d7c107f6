//! The fixed tree schema of the step record.
//!
//! Every semantic field has a stable generalized index: the step root hangs
//! sixteen scope subtrees (depth 4); each scope hangs its fields at a fixed
//! per-scope depth. Variable-size fields occupy a two-node subtree of their
//! own: data root on the left, byte/item length mixed in on the right.

use ethereum_types::{Address, H256, U256};
use stepex_common::types::Receipt;
use stepex_crypto::keccak::keccak_hash;
use stepex_rlp::encode::RLPEncode;

use crate::{
    step::{Step, address_to_h256},
    tree::{TreeBuilder, gindex_leaf, zero_hash},
};

// === Scope layout ===

pub const SCOPE_DEPTH: usize = 4;

pub mod scope {
    pub const CONTROL: usize = 0;
    pub const PAYLOAD: usize = 1;
    pub const HISTORY: usize = 2;
    pub const BLOCK: usize = 3;
    pub const TX: usize = 4;
    pub const CONTRACT: usize = 5;
    pub const CALL_WORK: usize = 6;
    pub const CREATE_WORK: usize = 7;
    pub const STATE_WORK: usize = 8;
    pub const MPT_WORK: usize = 9;
}

pub const CONTROL_DEPTH: usize = 2;
pub const PAYLOAD_DEPTH: usize = 3;
pub const HISTORY_DEPTH: usize = 8;
pub const BLOCK_DEPTH: usize = 4;
pub const TX_DEPTH: usize = 3;
pub const CONTRACT_DEPTH: usize = 5;
pub const CALL_WORK_DEPTH: usize = 4;
pub const CREATE_WORK_DEPTH: usize = 4;
pub const STATE_WORK_DEPTH: usize = 3;
pub const MPT_WORK_DEPTH: usize = 4;

// === Variable-size field capacities (chunk-tree depths) ===

/// 64 MiB of memory, 2^21 chunks.
pub const MEMORY_DEPTH: usize = 21;
pub const RET_DATA_DEPTH: usize = 21;
pub const INPUT_DEPTH: usize = 21;
/// EIP-170 code cap rounds up to 1024 chunks.
pub const CODE_DEPTH: usize = 10;
pub const STACK_DEPTH: usize = 10;
/// A transaction envelope caps at 1 MiB.
pub const TX_BYTES_DEPTH: usize = 15;
pub const TXS_LIST_DEPTH: usize = 14;
pub const RECEIPTS_DEPTH: usize = 10;
pub const LOGS_DEPTH: usize = 10;
/// The MPT scratch value caps at 2048 bytes.
pub const MPT_VALUE_DEPTH: usize = 6;
pub const STATE_WORK_BYTES_DEPTH: usize = 10;

pub mod field {
    pub mod control {
        pub const STATE_ROOT: u64 = 0;
        pub const EXEC_MODE: u64 = 1;
        pub const SUB_INDEX: u64 = 2;
        pub const RETURN_TO_STEP: u64 = 3;
    }
    pub mod contract {
        pub const SELF_ADDR: u64 = 0;
        pub const CREATE: u64 = 1;
        pub const CALL_DEPTH: u64 = 2;
        pub const CALLER: u64 = 3;
        pub const MEMORY: u64 = 4;
        pub const MEMORY_LAST_GAS: u64 = 5;
        pub const MEMORY_DESIRED: u64 = 6;
        pub const STACK: u64 = 7;
        pub const RET_DATA: u64 = 8;
        pub const CODE: u64 = 9;
        pub const CODE_HASH: u64 = 10;
        pub const CODE_ADDR: u64 = 11;
        pub const INPUT: u64 = 12;
        pub const GAS: u64 = 13;
        pub const VALUE: u64 = 14;
        pub const READ_ONLY: u64 = 15;
        pub const IS_INIT_CODE: u64 = 16;
        pub const OP: u64 = 17;
        pub const PC: u64 = 18;
        pub const COUNT: u64 = 19;
    }
}

/// Gindex of a scope subtree root.
pub fn scope_gindex(scope: usize) -> u64 {
    (1u64 << SCOPE_DEPTH) + scope as u64
}

/// Gindex of a field leaf (or variable-size field subtree root).
pub fn field_gindex(scope: usize, scope_depth: usize, field: u64) -> u64 {
    gindex_leaf(scope_gindex(scope), scope_depth, field)
}

/// Gindex of chunk `i` inside a variable-size field subtree.
pub fn chunk_gindex(field_gindex: u64, data_depth: usize, chunk: u64) -> u64 {
    gindex_leaf(field_gindex << 1, data_depth, chunk)
}

/// Gindex of the length mix-in of a variable-size field.
pub fn length_gindex(field_gindex: u64) -> u64 {
    (field_gindex << 1) | 1
}

// === Leaf chunk encodings ===

pub fn chunk_u64(value: u64) -> H256 {
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&value.to_le_bytes());
    H256(out)
}

pub fn chunk_u8(value: u8) -> H256 {
    let mut out = [0u8; 32];
    out[0] = value;
    H256(out)
}

pub fn chunk_bool(value: bool) -> H256 {
    chunk_u8(value as u8)
}

pub fn chunk_u256(value: U256) -> H256 {
    H256(value.to_big_endian())
}

pub fn chunk_address(value: Address) -> H256 {
    address_to_h256(value)
}

fn receipt_leaves(receipts: &[Receipt]) -> Vec<H256> {
    receipts.iter().map(|r| r.hash()).collect()
}

/// Computes the tree root of a step. With a collecting builder, every hashed
/// pair lands in the builder's node map for witness output.
pub fn step_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let mut scopes = [zero_hash(0); 1 << SCOPE_DEPTH];
    scopes[scope::CONTROL] = control_root(step, builder);
    scopes[scope::PAYLOAD] = payload_root(step, builder);
    scopes[scope::HISTORY] = builder.merkleize_chunks(&step.history.block_hashes, HISTORY_DEPTH);
    scopes[scope::BLOCK] = block_root(step, builder);
    scopes[scope::TX] = tx_root(step, builder);
    scopes[scope::CONTRACT] = contract_root(step, builder);
    scopes[scope::CALL_WORK] = call_work_root(step, builder);
    scopes[scope::CREATE_WORK] = create_work_root(step, builder);
    scopes[scope::STATE_WORK] = state_work_root(step, builder);
    scopes[scope::MPT_WORK] = mpt_work_root(step, builder);
    builder.merkleize_chunks(&scopes, SCOPE_DEPTH)
}

fn control_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let chunks = [
        step.state_root,
        chunk_u8(step.exec_mode.as_byte()),
        chunk_u64(step.sub_index),
        step.return_to_step.map(|r| r.root).unwrap_or_default(),
    ];
    builder.merkleize_chunks(&chunks, CONTROL_DEPTH)
}

fn payload_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let payload = &step.payload;
    let tx_roots: Vec<H256> = payload
        .transactions
        .iter()
        .map(|tx| builder.merkleize_bytes(tx, TX_BYTES_DEPTH))
        .collect();
    let txs_root = builder.merkleize_list(&tx_roots, TXS_LIST_DEPTH);
    let chunks = [
        payload.parent_hash,
        chunk_address(payload.coinbase),
        payload.random,
        chunk_u64(payload.block_number),
        chunk_u64(payload.gas_limit),
        chunk_u64(payload.timestamp),
        txs_root,
    ];
    builder.merkleize_chunks(&chunks, PAYLOAD_DEPTH)
}

fn block_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let block = &step.block;
    let receipts = receipt_leaves(&block.receipts);
    let receipts_root = builder.merkleize_list(&receipts, RECEIPTS_DEPTH);
    let chunks = [
        block.parent_hash,
        chunk_address(block.coinbase),
        chunk_u64(block.gas_limit),
        chunk_u64(block.block_number),
        chunk_u64(block.time),
        chunk_u256(block.difficulty),
        chunk_u256(block.base_fee),
        chunk_u64(block.gas_used),
        receipts_root,
    ];
    builder.merkleize_chunks(&chunks, BLOCK_DEPTH)
}

fn tx_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let tx = &step.tx;
    let current_tx_root = builder.merkleize_bytes(&tx.current_tx, TX_BYTES_DEPTH);
    let norm_root = norm_tx_root(step, builder);
    let log_leaves: Vec<H256> = tx
        .logs
        .iter()
        .map(|log| H256(keccak_hash(log.encode_to_vec())))
        .collect();
    let logs_root = builder.merkleize_list(&log_leaves, LOGS_DEPTH);
    let chunks = [
        chunk_u64(tx.tx_index),
        chunk_address(tx.origin),
        chunk_u256(tx.gas_price),
        current_tx_root,
        norm_root,
        logs_root,
        chunk_u64(tx.gas_refund),
        chunk_u8(tx.mode as u8),
    ];
    builder.merkleize_chunks(&chunks, TX_DEPTH)
}

fn norm_tx_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let norm = &step.tx.norm_tx;
    let payload_root = builder.merkleize_bytes(&norm.payload, TX_BYTES_DEPTH);
    let access_list_hash = H256(keccak_hash(norm.access_list.encode_to_vec()));
    let chunks = [
        chunk_address(norm.signer),
        chunk_u64(norm.nonce),
        chunk_u64(norm.gas_limit),
        chunk_u256(norm.max_priority_fee_per_gas),
        chunk_u256(norm.max_fee_per_gas),
        chunk_address(norm.destination),
        chunk_bool(norm.is_contract_creation),
        chunk_u256(norm.value),
        payload_root,
        access_list_hash,
        chunk_u256(norm.mint),
        chunk_bool(norm.is_deposit),
    ];
    builder.merkleize_chunks(&chunks, 4)
}

fn contract_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let contract = &step.contract;
    let memory_root = builder.merkleize_bytes(contract.memory.bytes(), MEMORY_DEPTH);
    let stack_root = {
        let words = contract.stack.words().to_vec();
        builder.merkleize_list(&words, STACK_DEPTH)
    };
    let ret_data_root = builder.merkleize_bytes(&contract.ret_data, RET_DATA_DEPTH);
    let code_root = builder.merkleize_bytes(&contract.code, CODE_DEPTH);
    let input_root = builder.merkleize_bytes(&contract.input, INPUT_DEPTH);
    let chunks = [
        chunk_address(contract.self_addr),
        chunk_bool(contract.create),
        chunk_u64(contract.call_depth),
        chunk_address(contract.caller),
        memory_root,
        chunk_u64(contract.memory_last_gas),
        chunk_u64(contract.memory_desired),
        stack_root,
        ret_data_root,
        code_root,
        contract.code_hash,
        chunk_address(contract.code_addr),
        input_root,
        chunk_u64(contract.gas),
        chunk_u256(contract.value),
        chunk_bool(contract.read_only),
        chunk_bool(contract.is_init_code),
        chunk_u8(contract.op),
        chunk_u64(contract.pc),
    ];
    builder.merkleize_chunks(&chunks, CONTRACT_DEPTH)
}

fn call_work_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let work = &step.call_work;
    let chunks = [
        chunk_u8(work.mode as u8),
        chunk_u8(work.kind as u8),
        chunk_u8(work.scheme as u8),
        chunk_address(work.caller),
        chunk_address(work.addr),
        chunk_address(work.code_addr),
        chunk_bool(work.read_only),
        chunk_u64(work.gas),
        chunk_u256(work.value),
        chunk_u64(work.input_offset),
        chunk_u64(work.input_size),
        chunk_u64(work.return_offset),
        chunk_u64(work.return_size),
    ];
    builder.merkleize_chunks(&chunks, CALL_WORK_DEPTH)
}

fn create_work_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let work = &step.create_work;
    let chunks = [
        chunk_u8(work.mode as u8),
        chunk_u8(work.kind as u8),
        chunk_address(work.caller),
        chunk_address(work.addr),
        chunk_u256(work.value),
        chunk_u64(work.gas),
        work.salt,
        chunk_bool(work.is_create2),
        chunk_u64(work.nonce),
        chunk_u64(work.init_offset),
        chunk_u64(work.init_size),
        work.init_code_hash,
        work.snapshot_root,
    ];
    builder.merkleize_chunks(&chunks, CREATE_WORK_DEPTH)
}

fn state_work_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let work = &step.state_work;
    let work_root = builder.merkleize_bytes(&work.work.encode(), STATE_WORK_BYTES_DEPTH);
    let chunks = [
        work_root,
        chunk_u8(work.mode as u8),
        chunk_u8(work.mode_on_finish as u8),
        chunk_u64(work.phase),
        H256(keccak_hash(work.account.encode())),
    ];
    builder.merkleize_chunks(&chunks, STATE_WORK_DEPTH)
}

fn mpt_work_root(step: &Step, builder: &mut TreeBuilder) -> H256 {
    let work = &step.mpt_work;
    let current_root = builder.merkleize_bytes(&work.current_root, 0);
    let value_root = builder.merkleize_bytes(&work.value, MPT_VALUE_DEPTH);
    let write_root = builder.merkleize_bytes(&work.write_root, MPT_VALUE_DEPTH);
    let chunks = [
        chunk_u8(work.tree_source as u8),
        work.start_reference,
        chunk_u8(work.mode as u8),
        chunk_u8(work.mode_on_finish as u8),
        current_root,
        chunk_u8(work.fail_lookup),
        chunk_u256(work.lookup_key),
        chunk_u64(work.lookup_key_nibbles),
        chunk_u64(work.lookup_nibble_depth),
        chunk_u256(work.graft_key_segment),
        chunk_u64(work.graft_key_nibbles),
        value_root,
        work.parent_node_step.map(|r| r.root).unwrap_or_default(),
        write_root,
    ];
    builder.merkleize_chunks(&chunks, MPT_WORK_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepRef;

    #[test]
    fn root_is_deterministic() {
        let step = Step::default();
        let a = step_root(&step, &mut TreeBuilder::default());
        let b = step_root(&step, &mut TreeBuilder::collecting());
        assert_eq!(a, b);
    }

    #[test]
    fn every_field_moves_the_root() {
        let base = Step::default();
        let base_root = step_root(&base, &mut TreeBuilder::default());

        let mut changed = base.clone();
        changed.contract.pc = 1;
        assert_ne!(step_root(&changed, &mut TreeBuilder::default()), base_root);

        let mut changed = base.clone();
        changed.mpt_work.value = vec![0x01];
        assert_ne!(step_root(&changed, &mut TreeBuilder::default()), base_root);

        let mut changed = base.clone();
        changed.return_to_step = Some(StepRef {
            step_index: 0,
            root: H256::repeat_byte(1),
        });
        assert_ne!(step_root(&changed, &mut TreeBuilder::default()), base_root);
    }

    #[test]
    fn collected_tree_walks_from_root() {
        let mut builder = TreeBuilder::collecting();
        let mut step = Step::default();
        step.contract.gas = 77;
        let root = step_root(&step, &mut builder);
        let nodes = builder.nodes.unwrap();

        // walk to the contract.gas leaf by its gindex
        let gindex = field_gindex(scope::CONTRACT, CONTRACT_DEPTH, field::contract::GAS);
        let mut node = root;
        let bits = 64 - gindex.leading_zeros() - 1;
        for i in (0..bits).rev() {
            let (left, right) = nodes[&node];
            node = if (gindex >> i) & 1 == 1 { right } else { left };
        }
        assert_eq!(node, chunk_u64(77));
    }
}
