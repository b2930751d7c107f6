use ethereum_types::H256;
use stepex_common::types::PayloadError;
use stepex_rlp::error::RLPDecodeError;
use thiserror::Error;

use crate::exec_mode::ExecMode;

/// Failures of the transition function itself. These abort trace generation;
/// EVM-level failures (out of gas, reverts, invalid transactions) are encoded
/// in the step's execution mode instead and are part of normal execution.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("Witness blob does not hash to its key {0:#x}")]
    WitnessMismatch(H256),
    #[error("MPT node {0:#x} not available")]
    MissingNode(H256),
    #[error("Code {0:#x} not available")]
    MissingCode(H256),
    #[error("Block header {0:#x} not available")]
    MissingHeader(H256),
    #[error("Step reference {0} outside of trace")]
    InvalidStepRef(u64),
    #[error("Invalid execution mode byte 0x{0:02x}")]
    InvalidExecMode(u8),
    #[error("Corrupt trie: {0}")]
    CorruptTrie(&'static str),
    #[error("Interpreter invariant broken: {0}")]
    Internal(&'static str),
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Trace exceeded the sanity cap of {0} steps")]
    StepLimit(usize),
    #[error("Block is invalid: {0:?}")]
    InvalidBlock(ExecMode),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Vm(#[from] VmError),
}
