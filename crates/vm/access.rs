//! Witness read-sets: which generalized indices of a step the transition
//! consuming it touches.
//!
//! The sets are derived per execution mode from the step itself, mirroring
//! what the handlers read and write. They may over-approximate (the witness
//! only grows), but never under-approximate: reconstructing the next root
//! from the witness must always be possible. Chunk-level precision is used
//! for the big byte fields (code, memory, stack, inputs); scalar fields are
//! listed wholesale per touched scope.

use std::collections::BTreeSet;

use crate::{
    exec_mode::ExecMode,
    jump_table::{OpCode, operation},
    merkle::{
        self, CALL_WORK_DEPTH, CODE_DEPTH, CONTRACT_DEPTH, CONTROL_DEPTH, CREATE_WORK_DEPTH,
        HISTORY_DEPTH, INPUT_DEPTH, MEMORY_DEPTH, MPT_VALUE_DEPTH, MPT_WORK_DEPTH,
        PAYLOAD_DEPTH, RET_DATA_DEPTH, STACK_DEPTH, STATE_WORK_DEPTH, TX_BYTES_DEPTH, TX_DEPTH,
        field, scope,
    },
    step::Step,
    tree::proof_closure,
};

struct Access {
    set: BTreeSet<u64>,
}

impl Access {
    fn new() -> Self {
        Self {
            set: BTreeSet::new(),
        }
    }

    fn scope_fields(&mut self, scope: usize, depth: usize, count: u64) {
        for i in 0..count {
            self.set.insert(merkle::field_gindex(scope, depth, i));
        }
    }

    /// Chunks `[from, to)` of a variable-size field, plus its length mix-in.
    fn chunks(&mut self, scope: usize, depth: usize, index: u64, data_depth: usize, from: u64, to: u64) {
        let field_g = merkle::field_gindex(scope, depth, index);
        self.set.insert(merkle::length_gindex(field_g));
        let cap = 1u64 << data_depth;
        for chunk in (from / 32)..=(to / 32).min(cap - 1) {
            self.set.insert(merkle::chunk_gindex(field_g, data_depth, chunk));
        }
    }

    fn byte_field(&mut self, scope: usize, depth: usize, index: u64, data_depth: usize, len: usize) {
        self.chunks(scope, depth, index, data_depth, 0, len.max(1) as u64 - 1);
    }

    fn stack_span(&mut self, step: &Step, back_lo: u64, back_hi: u64) {
        let len = step.contract.stack.len() as u64;
        let field_g = merkle::field_gindex(scope::CONTRACT, CONTRACT_DEPTH, field::contract::STACK);
        self.set.insert(merkle::length_gindex(field_g));
        for n in back_lo..=back_hi {
            if n < len {
                let index = len - 1 - n;
                self.set.insert(merkle::chunk_gindex(field_g, STACK_DEPTH, index));
            }
        }
        // pushes land just past the current top
        if len < (1 << STACK_DEPTH) {
            self.set.insert(merkle::chunk_gindex(field_g, STACK_DEPTH, len));
        }
    }

    fn memory_span(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.chunks(
            scope::CONTRACT,
            CONTRACT_DEPTH,
            field::contract::MEMORY,
            MEMORY_DEPTH,
            offset,
            offset + len - 1,
        );
    }

    fn contract_scalars(&mut self) {
        self.scope_fields(scope::CONTRACT, CONTRACT_DEPTH, field::contract::COUNT);
    }
}

/// Everything the transition out of `last` touches, with the Merkle-proof
/// closure applied: the result is directly usable as a per-step witness
/// access list.
pub fn witness_gindices(last: &Step) -> BTreeSet<u64> {
    proof_closure(&touched_gindices(last))
}

pub fn touched_gindices(last: &Step) -> BTreeSet<u64> {
    let mut access = Access::new();
    // the control fields steer every dispatch
    access.scope_fields(scope::CONTROL, CONTROL_DEPTH, 4);

    match last.exec_mode {
        ExecMode::BlockPre => {
            access.scope_fields(scope::PAYLOAD, PAYLOAD_DEPTH, 7);
            access.scope_fields(scope::BLOCK, merkle::BLOCK_DEPTH, 9);
        }
        ExecMode::BlockPreStateLoad | ExecMode::BlockCalcBaseFee | ExecMode::BlockPost => {
            access.scope_fields(scope::PAYLOAD, PAYLOAD_DEPTH, 7);
            access.scope_fields(scope::BLOCK, merkle::BLOCK_DEPTH, 9);
        }
        ExecMode::BlockHistoryLoad => {
            access.scope_fields(scope::PAYLOAD, PAYLOAD_DEPTH, 7);
            access.scope_fields(scope::BLOCK, merkle::BLOCK_DEPTH, 9);
            let number = last.block.block_number;
            let sub = last.sub_index;
            let dest = (number + 255 - sub) % 256;
            let history_root = merkle::scope_gindex(scope::HISTORY);
            access
                .set
                .insert(crate::tree::gindex_leaf(history_root, HISTORY_DEPTH, dest));
            access
                .set
                .insert(crate::tree::gindex_leaf(history_root, HISTORY_DEPTH, (dest + 1) % 256));
        }
        ExecMode::BlockTxLoop => {
            access.scope_fields(scope::PAYLOAD, PAYLOAD_DEPTH, 7);
            access.scope_fields(scope::TX, TX_DEPTH, 8);
            access.byte_field(
                scope::TX,
                TX_DEPTH,
                3, // current_tx
                TX_BYTES_DEPTH,
                last.tx.current_tx.len(),
            );
            // the envelope about to be copied out of the payload
            let tx_index = last.tx.tx_index as usize;
            if let Some(envelope) = last.payload.transactions.get(tx_index) {
                let txs_field = merkle::field_gindex(scope::PAYLOAD, PAYLOAD_DEPTH, 6);
                let tx_root =
                    merkle::chunk_gindex(txs_field, merkle::TXS_LIST_DEPTH, tx_index as u64);
                access.set.insert(merkle::length_gindex(tx_root));
                for chunk in 0..=(envelope.len().max(1) as u64 - 1) / 32 {
                    access
                        .set
                        .insert(merkle::chunk_gindex(tx_root, TX_BYTES_DEPTH, chunk));
                }
            }
        }
        ExecMode::TxLoad | ExecMode::TxSig => {
            access.scope_fields(scope::TX, TX_DEPTH, 8);
            access.byte_field(scope::TX, TX_DEPTH, 3, TX_BYTES_DEPTH, last.tx.current_tx.len());
        }
        ExecMode::TxFeesPre | ExecMode::TxFeesPost => {
            access.scope_fields(scope::TX, TX_DEPTH, 8);
            access.scope_fields(scope::BLOCK, merkle::BLOCK_DEPTH, 9);
            access.scope_fields(scope::STATE_WORK, STATE_WORK_DEPTH, 5);
            access.contract_scalars();
        }
        ExecMode::BlockTxSuccess | ExecMode::BlockTxErr | ExecMode::BlockTxRevert => {
            access.scope_fields(scope::TX, TX_DEPTH, 8);
        }

        ExecMode::OpcodeLoad => {
            access.contract_scalars();
            access.chunks(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::CODE,
                CODE_DEPTH,
                last.contract.pc,
                last.contract.pc,
            );
        }
        ExecMode::ValidateStack | ExecMode::ReadOnlyCheck | ExecMode::ConstantGas => {
            access.contract_scalars();
            access.stack_span(last, 0, 2);
        }
        ExecMode::CalcMemorySize | ExecMode::DynamicGas => {
            access.contract_scalars();
            access.stack_span(last, 0, 6);
            access.scope_fields(scope::STATE_WORK, STATE_WORK_DEPTH, 5);
        }
        ExecMode::UpdateMemorySize => {
            access.contract_scalars();
            let len = last.contract.memory.len() as u64;
            access.memory_span(len.saturating_sub(1), 33);
        }
        ExecMode::OpcodeRun => {
            access.contract_scalars();
            opcode_run_access(&mut access, last);
        }

        ExecMode::CallSetup => {
            access.contract_scalars();
            access.scope_fields(scope::CALL_WORK, CALL_WORK_DEPTH, 13);
            access.scope_fields(scope::STATE_WORK, STATE_WORK_DEPTH, 5);
            access.scope_fields(scope::TX, TX_DEPTH, 8);
            // the input loader streams out of the caller's memory
            access.memory_span(last.call_work.input_offset, 33);
            access.byte_field(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::INPUT,
                INPUT_DEPTH,
                last.contract.input.len(),
            );
            // transaction-level frames take the normalized payload wholesale
            let norm_field = merkle::field_gindex(scope::TX, TX_DEPTH, 4);
            let payload_field = crate::tree::gindex_leaf(norm_field, 4, 8);
            access.set.insert(merkle::length_gindex(payload_field));
            let payload_len = last.tx.norm_tx.payload.len().max(1) as u64;
            for chunk in 0..=(payload_len - 1) / 32 {
                access
                    .set
                    .insert(merkle::chunk_gindex(payload_field, TX_BYTES_DEPTH, chunk));
            }
        }
        ExecMode::CallPre => {
            access.contract_scalars();
        }
        ExecMode::CallPost | ExecMode::CallRevert => {
            access.contract_scalars();
            access.scope_fields(scope::CALL_WORK, CALL_WORK_DEPTH, 13);
            access.scope_fields(scope::TX, TX_DEPTH, 8);
            access.byte_field(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::RET_DATA,
                RET_DATA_DEPTH,
                last.contract.ret_data.len(),
            );
        }
        ExecMode::CreateSetup
        | ExecMode::CreateInitPost
        | ExecMode::CreateInitRevert
        | ExecMode::CreateInitErr => {
            access.contract_scalars();
            access.scope_fields(scope::CREATE_WORK, CREATE_WORK_DEPTH, 13);
            access.scope_fields(scope::STATE_WORK, STATE_WORK_DEPTH, 5);
            access.byte_field(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::RET_DATA,
                RET_DATA_DEPTH,
                last.contract.ret_data.len(),
            );
        }

        ExecMode::StateWork => {
            access.scope_fields(scope::STATE_WORK, STATE_WORK_DEPTH, 5);
            access.scope_fields(scope::MPT_WORK, MPT_WORK_DEPTH, 14);
            access.byte_field(
                scope::MPT_WORK,
                MPT_WORK_DEPTH,
                11, // value
                MPT_VALUE_DEPTH,
                last.mpt_work.value.len(),
            );
        }
        ExecMode::MptWork => {
            access.scope_fields(scope::MPT_WORK, MPT_WORK_DEPTH, 14);
            access.byte_field(
                scope::MPT_WORK,
                MPT_WORK_DEPTH,
                11,
                MPT_VALUE_DEPTH,
                last.mpt_work.value.len(),
            );
        }

        mode if mode.is_frame_exit() => {
            access.contract_scalars();
            access.byte_field(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::RET_DATA,
                RET_DATA_DEPTH,
                last.contract.ret_data.len(),
            );
        }
        _ => {}
    }

    access.set
}

/// Per-opcode refinement for the handler step itself.
fn opcode_run_access(access: &mut Access, last: &Step) {
    let op = last.contract.op;
    let table_entry = operation(op);
    access.stack_span(last, 0, table_entry.min_stack.max(1) - 1);

    let stack = &last.contract.stack;
    let word = |n: usize| stack.back_u256(n).unwrap_or_default().low_u64();

    match op {
        x if x == OpCode::KECCAK256 as u8 => {
            access.memory_span(word(0), word(1));
        }
        x if x == OpCode::CALLDATALOAD as u8 => {
            access.chunks(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::INPUT,
                INPUT_DEPTH,
                word(0),
                word(0) + 32,
            );
        }
        x if x == OpCode::CALLDATACOPY as u8 || x == OpCode::RETURNDATACOPY as u8 => {
            access.memory_span(word(0), 33);
            let source = if x == OpCode::CALLDATACOPY as u8 {
                field::contract::INPUT
            } else {
                field::contract::RET_DATA
            };
            access.chunks(scope::CONTRACT, CONTRACT_DEPTH, source, INPUT_DEPTH, word(1), word(1) + 33);
        }
        x if x == OpCode::CODECOPY as u8 => {
            access.memory_span(word(0), 33);
            access.chunks(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::CODE,
                CODE_DEPTH,
                word(1),
                word(1) + 33,
            );
        }
        x if x == OpCode::EXTCODECOPY as u8 => {
            access.memory_span(word(1), 33);
            access.scope_fields(scope::STATE_WORK, STATE_WORK_DEPTH, 5);
        }
        x if x == OpCode::MLOAD as u8 || x == OpCode::MSTORE as u8 => {
            access.memory_span(word(0), 32);
        }
        x if x == OpCode::MSTORE8 as u8 => {
            access.memory_span(word(0), 1);
        }
        x if x == OpCode::BLOCKHASH as u8 => {
            access.scope_fields(scope::BLOCK, merkle::BLOCK_DEPTH, 9);
            let history_root = merkle::scope_gindex(scope::HISTORY);
            access
                .set
                .insert(crate::tree::gindex_leaf(history_root, HISTORY_DEPTH, word(0) % 256));
        }
        x if (OpCode::PUSH1 as u8..=OpCode::PUSH32 as u8).contains(&x) => {
            access.chunks(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::CODE,
                CODE_DEPTH,
                last.contract.pc,
                last.contract.pc + 33,
            );
        }
        x if (OpCode::LOG0 as u8..=OpCode::LOG4 as u8).contains(&x) => {
            access.memory_span(word(0), word(1));
            access.scope_fields(scope::TX, TX_DEPTH, 8);
        }
        x if x == OpCode::RETURN as u8 || x == OpCode::REVERT as u8 => {
            access.memory_span(word(0), word(1));
            access.byte_field(
                scope::CONTRACT,
                CONTRACT_DEPTH,
                field::contract::RET_DATA,
                RET_DATA_DEPTH,
                word(1) as usize,
            );
        }
        x if x == OpCode::CREATE as u8 || x == OpCode::CREATE2 as u8 => {
            access.memory_span(word(1), word(2));
            access.scope_fields(scope::CREATE_WORK, CREATE_WORK_DEPTH, 13);
        }
        x if x == OpCode::CALL as u8
            || x == OpCode::CALLCODE as u8
            || x == OpCode::DELEGATECALL as u8
            || x == OpCode::STATICCALL as u8 =>
        {
            access.scope_fields(scope::CALL_WORK, CALL_WORK_DEPTH, 13);
            access.scope_fields(scope::STATE_WORK, STATE_WORK_DEPTH, 5);
        }
        x if x == OpCode::SLOAD as u8
            || x == OpCode::SSTORE as u8
            || x == OpCode::BALANCE as u8
            || x == OpCode::SELFBALANCE as u8
            || x == OpCode::EXTCODESIZE as u8
            || x == OpCode::EXTCODEHASH as u8
            || x == OpCode::SELFDESTRUCT as u8 =>
        {
            access.scope_fields(scope::STATE_WORK, STATE_WORK_DEPTH, 5);
        }
        x if x == OpCode::COINBASE as u8
            || x == OpCode::TIMESTAMP as u8
            || x == OpCode::NUMBER as u8
            || x == OpCode::DIFFICULTY as u8
            || x == OpCode::GASLIMIT as u8
            || x == OpCode::BASEFEE as u8 =>
        {
            access.scope_fields(scope::BLOCK, merkle::BLOCK_DEPTH, 9);
        }
        x if x == OpCode::ORIGIN as u8 || x == OpCode::GASPRICE as u8 => {
            access.scope_fields(scope::TX, TX_DEPTH, 8);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_scope_always_included(){
        let step = Step::default();
        let set = touched_gindices(&step);
        let state_root_g = merkle::field_gindex(scope::CONTROL, CONTROL_DEPTH, field::control::STATE_ROOT);
        assert!(set.contains(&state_root_g));
    }

    #[test]
    fn opcode_load_reads_the_code_chunk() {
        let mut step = Step::default();
        step.exec_mode = ExecMode::OpcodeLoad;
        step.contract.pc = 100;
        let set = touched_gindices(&step);
        let field_g = merkle::field_gindex(scope::CONTRACT, CONTRACT_DEPTH, field::contract::CODE);
        let chunk_g = merkle::chunk_gindex(field_g, CODE_DEPTH, 100 / 32);
        assert!(set.contains(&chunk_g));
    }

    #[test]
    fn witness_set_is_sibling_closed() {
        let mut step = Step::default();
        step.exec_mode = ExecMode::OpcodeLoad;
        let witness = witness_gindices(&step);
        for g in witness.iter().copied().filter(|g| *g > 1) {
            assert!(witness.contains(&(g ^ 1)), "missing sibling of {g}");
        }
    }
}
