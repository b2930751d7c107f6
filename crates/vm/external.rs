use std::collections::HashMap;

use ethereum_types::{Address, H256};
use stepex_crypto::keccak::keccak_hash;

use crate::errors::VmError;

/// Where the engine gets witness data it does not already hold: MPT nodes,
/// contract code and block headers, all addressed by their keccak-256 hash.
/// Every blob an implementation returns is verified against the requested
/// hash by the caller before use.
pub trait ExternalSource {
    fn block_header(&self, block_hash: H256) -> Result<Vec<u8>, VmError>;
    fn get_world_node(&self, node_hash: H256) -> Result<Vec<u8>, VmError>;
    fn get_acc_storage_node(&self, address: Address, node_hash: H256) -> Result<Vec<u8>, VmError>;
    fn get_code(&self, code_hash: H256) -> Result<Vec<u8>, VmError>;
}

/// In-memory source backing tests and witness-based verification.
#[derive(Debug, Default)]
pub struct MemorySource {
    headers: HashMap<H256, Vec<u8>>,
    nodes: HashMap<H256, Vec<u8>>,
    codes: HashMap<H256, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_header(&mut self, header_rlp: Vec<u8>) -> H256 {
        let hash = H256(keccak_hash(&header_rlp));
        self.headers.insert(hash, header_rlp);
        hash
    }

    pub fn insert_node(&mut self, node_rlp: Vec<u8>) -> H256 {
        let hash = H256(keccak_hash(&node_rlp));
        self.nodes.insert(hash, node_rlp);
        hash
    }

    pub fn insert_code(&mut self, code: Vec<u8>) -> H256 {
        let hash = H256(keccak_hash(&code));
        self.codes.insert(hash, code);
        hash
    }

    pub fn insert_raw_node(&mut self, hash: H256, node_rlp: Vec<u8>) {
        self.nodes.insert(hash, node_rlp);
    }

    pub fn insert_raw_code(&mut self, hash: H256, code: Vec<u8>) {
        self.codes.insert(hash, code);
    }
}

impl ExternalSource for MemorySource {
    fn block_header(&self, block_hash: H256) -> Result<Vec<u8>, VmError> {
        self.headers
            .get(&block_hash)
            .cloned()
            .ok_or(VmError::MissingHeader(block_hash))
    }

    fn get_world_node(&self, node_hash: H256) -> Result<Vec<u8>, VmError> {
        self.nodes
            .get(&node_hash)
            .cloned()
            .ok_or(VmError::MissingNode(node_hash))
    }

    fn get_acc_storage_node(&self, _address: Address, node_hash: H256) -> Result<Vec<u8>, VmError> {
        self.get_world_node(node_hash)
    }

    fn get_code(&self, code_hash: H256) -> Result<Vec<u8>, VmError> {
        self.codes
            .get(&code_hash)
            .cloned()
            .ok_or(VmError::MissingCode(code_hash))
    }
}

/// Checks a returned blob against the hash it was requested by.
pub fn verify_blob(expected: H256, blob: &[u8]) -> Result<(), VmError> {
    if H256(keccak_hash(blob)) != expected {
        return Err(VmError::WitnessMismatch(expected));
    }
    Ok(())
}
