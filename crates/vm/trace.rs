use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use bytes::Bytes;
use ethereum_types::{Address, H256};
use stepex_common::types::MinimalExecutionPayload;
use stepex_crypto::keccak::keccak_hash;
use tracing::debug;

use crate::{
    access, block,
    errors::{TraceError, VmError},
    external::{ExternalSource, verify_blob},
    interpreter,
    jump_table::OpCode,
    merkle,
    mpt::TreeSource,
    step::{Step, StepRef},
    tree::{BinaryNodeDb, TreeBuilder},
};

/// What the transition handlers see: the trace so far plus the shared
/// content-addressed databases. All database traffic is recorded per step so
/// the witness can replay it.
pub trait StepsTrace {
    fn last(&self) -> &Step;
    fn last_ref(&self) -> StepRef;
    fn by_ref(&self, step_ref: &StepRef) -> Result<&Step, VmError>;

    /// Contract code by keccak hash, verified against the hash.
    fn code_by_hash(&self, code_hash: H256) -> Result<Bytes, VmError>;
    fn put_code(&self, code: &[u8]) -> H256;

    /// MPT node by content hash from the tree identified by
    /// `(source, start_reference)`.
    fn mpt_node(
        &self,
        source: TreeSource,
        start_reference: H256,
        node_hash: H256,
    ) -> Result<Vec<u8>, VmError>;
    fn put_mpt_node(&self, node: &[u8]) -> H256;

    /// Block header RLP by block hash, verified against the hash.
    fn block_header(&self, block_hash: H256) -> Result<Vec<u8>, VmError>;

    /// JUMPDEST analysis over immutable code, cached by code hash.
    fn is_valid_jump_dest(&self, code_hash: H256, code: &[u8], dest: u64) -> bool;
}

/// Everything one transition touched in the shared databases.
#[derive(Debug, Clone, Default)]
pub struct AccessRecord {
    pub gindices: BTreeSet<u64>,
    pub mpt_nodes: BTreeSet<H256>,
    pub codes: BTreeSet<H256>,
}

#[derive(Debug, Clone, Copy)]
pub struct TraceConfig {
    /// Abort generation past this many steps; a runaway trace means broken
    /// witness data or an engine bug, not a long block.
    pub step_limit: usize,
    /// Collect the binary-node map needed for witness output.
    pub capture: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            step_limit: 10_000,
            capture: true,
        }
    }
}

/// The arena of steps plus the capture databases.
pub struct Trace {
    config: TraceConfig,
    src: Box<dyn ExternalSource>,
    steps: Vec<Step>,
    roots: Vec<H256>,
    access: RefCell<Vec<AccessRecord>>,
    node_db: RefCell<HashMap<H256, Vec<u8>>>,
    code_db: RefCell<HashMap<H256, Bytes>>,
    jumpdest_cache: RefCell<HashMap<H256, Rc<Vec<bool>>>>,
    binary_nodes: RefCell<BinaryNodeDb>,
}

impl Trace {
    pub fn new(src: Box<dyn ExternalSource>, config: TraceConfig) -> Self {
        Self {
            config,
            src,
            steps: Vec::new(),
            roots: Vec::new(),
            access: RefCell::new(Vec::new()),
            node_db: RefCell::new(HashMap::new()),
            code_db: RefCell::new(HashMap::new()),
            jumpdest_cache: RefCell::new(HashMap::new()),
            binary_nodes: RefCell::new(BinaryNodeDb::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn roots(&self) -> &[H256] {
        &self.roots
    }

    pub fn access_records(&self) -> Vec<AccessRecord> {
        self.access.borrow().clone()
    }

    pub fn node_db(&self) -> HashMap<H256, Vec<u8>> {
        self.node_db.borrow().clone()
    }

    pub fn code_db(&self) -> HashMap<H256, Bytes> {
        self.code_db.borrow().clone()
    }

    pub fn binary_nodes(&self) -> BinaryNodeDb {
        self.binary_nodes.borrow().clone()
    }

    /// Appends a step, merkleizing it and opening its access record.
    pub fn push_step(&mut self, step: Step) {
        let mut builder = if self.config.capture {
            TreeBuilder::collecting()
        } else {
            TreeBuilder::default()
        };
        let root = merkle::step_root(&step, &mut builder);
        if let Some(nodes) = builder.nodes {
            self.binary_nodes.borrow_mut().extend(nodes);
        }
        self.steps.push(step);
        self.roots.push(root);
        self.access.borrow_mut().push(AccessRecord::default());
    }

    fn record_node_access(&self, node_hash: H256) {
        if let Some(record) = self.access.borrow_mut().last_mut() {
            record.mpt_nodes.insert(node_hash);
        }
    }

    fn record_code_access(&self, code_hash: H256) {
        if let Some(record) = self.access.borrow_mut().last_mut() {
            record.codes.insert(code_hash);
        }
    }

    fn set_gindices(&self, gindices: BTreeSet<u64>) {
        if let Some(record) = self.access.borrow_mut().last_mut() {
            record.gindices = gindices;
        }
    }
}

impl StepsTrace for Trace {
    fn last(&self) -> &Step {
        self.steps.last().expect("trace initialized with a step")
    }

    fn last_ref(&self) -> StepRef {
        StepRef {
            step_index: (self.steps.len() - 1) as u64,
            root: *self.roots.last().expect("trace initialized with a step"),
        }
    }

    fn by_ref(&self, step_ref: &StepRef) -> Result<&Step, VmError> {
        let index = step_ref.step_index as usize;
        let step = self
            .steps
            .get(index)
            .ok_or(VmError::InvalidStepRef(step_ref.step_index))?;
        if self.roots[index] != step_ref.root {
            return Err(VmError::Internal("step reference root mismatch"));
        }
        Ok(step)
    }

    fn code_by_hash(&self, code_hash: H256) -> Result<Bytes, VmError> {
        self.record_code_access(code_hash);
        if let Some(code) = self.code_db.borrow().get(&code_hash) {
            return Ok(code.clone());
        }
        let code = self.src.get_code(code_hash)?;
        verify_blob(code_hash, &code)?;
        let code = Bytes::from(code);
        self.code_db.borrow_mut().insert(code_hash, code.clone());
        Ok(code)
    }

    fn put_code(&self, code: &[u8]) -> H256 {
        let hash = H256(keccak_hash(code));
        self.code_db
            .borrow_mut()
            .insert(hash, Bytes::copy_from_slice(code));
        hash
    }

    fn mpt_node(
        &self,
        source: TreeSource,
        start_reference: H256,
        node_hash: H256,
    ) -> Result<Vec<u8>, VmError> {
        self.record_node_access(node_hash);
        if let Some(node) = self.node_db.borrow().get(&node_hash) {
            return Ok(node.clone());
        }
        let node = match source {
            TreeSource::WorldAccounts => self.src.get_world_node(node_hash)?,
            TreeSource::AccountStorage => {
                let address = Address::from_slice(&start_reference.as_bytes()[12..]);
                self.src.get_acc_storage_node(address, node_hash)?
            }
            TreeSource::Transactions | TreeSource::Receipts => {
                return Err(VmError::Internal("tx/receipt tries have no external source"));
            }
        };
        verify_blob(node_hash, &node)?;
        self.node_db.borrow_mut().insert(node_hash, node.clone());
        Ok(node)
    }

    fn put_mpt_node(&self, node: &[u8]) -> H256 {
        let hash = H256(keccak_hash(node));
        self.node_db.borrow_mut().insert(hash, node.to_vec());
        hash
    }

    fn block_header(&self, block_hash: H256) -> Result<Vec<u8>, VmError> {
        // headers live in the shared content-addressed blob store, so the
        // witness carries them the same way it carries trie nodes
        self.record_node_access(block_hash);
        if let Some(header) = self.node_db.borrow().get(&block_hash) {
            return Ok(header.clone());
        }
        let header = self.src.block_header(block_hash)?;
        verify_blob(block_hash, &header)?;
        self.node_db.borrow_mut().insert(block_hash, header.clone());
        Ok(header)
    }

    fn is_valid_jump_dest(&self, code_hash: H256, code: &[u8], dest: u64) -> bool {
        if dest >= code.len() as u64 {
            return false;
        }
        let analysis = {
            let mut cache = self.jumpdest_cache.borrow_mut();
            cache
                .entry(code_hash)
                .or_insert_with(|| Rc::new(analyze_jump_dests(code)))
                .clone()
        };
        analysis[dest as usize]
    }
}

/// Marks each code offset that is a JUMPDEST outside PUSH immediate data.
fn analyze_jump_dests(code: &[u8]) -> Vec<bool> {
    let mut valid = vec![false; code.len()];
    let mut pc = 0usize;
    while pc < code.len() {
        let op = code[pc];
        if op == OpCode::JUMPDEST as u8 {
            valid[pc] = true;
            pc += 1;
        } else if (OpCode::PUSH1 as u8..=OpCode::PUSH32 as u8).contains(&op) {
            pc += 2 + (op - OpCode::PUSH1 as u8) as usize;
        } else {
            pc += 1;
        }
    }
    valid
}

/// Runs the step machine from a payload until `DONE`, producing the full
/// trace. Block-fatal modes and the sanity cap abort generation.
pub fn generate(
    src: Box<dyn ExternalSource>,
    payload: MinimalExecutionPayload,
    config: TraceConfig,
) -> Result<Trace, TraceError> {
    let mut trace = Trace::new(src, config);
    trace.push_step(block::init_step(payload));

    loop {
        if trace.len() >= config.step_limit {
            return Err(TraceError::StepLimit(config.step_limit));
        }
        let next = interpreter::next_step(&trace)?;
        trace.set_gindices(access::witness_gindices(trace.last()));
        let mode = next.exec_mode;
        debug!(step = trace.len(), mode = ?mode, "produced step");
        trace.push_step(next);
        if mode.is_done() {
            return Ok(trace);
        }
        if mode.is_block_fatal() {
            return Err(TraceError::InvalidBlock(mode));
        }
    }
}
