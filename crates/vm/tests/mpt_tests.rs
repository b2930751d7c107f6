//! Trie engine scenarios driven step by step through a real trace arena.

use ethereum_types::U256;
use rand::{Rng, SeedableRng, rngs::StdRng};
use stepex_crypto::keccak::keccak_hash;
use stepex_rlp::node::{wrap_bytes, wrap_list};
use stepex_vm::{
    exec_mode::ExecMode,
    mpt::{self, MptMode, encode_path},
    external::MemorySource,
    step::Step,
    trace::{StepsTrace, Trace, TraceConfig},
};

fn new_trace() -> Trace {
    let config = TraceConfig {
        capture: false,
        step_limit: 100_000,
    };
    let mut trace = Trace::new(Box::new(MemorySource::new()), config);
    // a resident caller step for the returning modes to restore
    trace.push_step(Step::default());
    trace
}

fn key_from(bytes: [u8; 32]) -> U256 {
    U256::from_big_endian(&bytes)
}

fn start_op(trace: &Trace, mode: MptMode, root: Vec<u8>, key: U256, value: Vec<u8>) -> Step {
    let mut step = trace.last().clone();
    step.exec_mode = ExecMode::MptWork;
    step.mpt_work = Default::default();
    step.mpt_work.current_root = root;
    step.mpt_work.lookup_key = key;
    step.mpt_work.lookup_key_nibbles = 64;
    step.mpt_work.value = value;
    step.mpt_work.mode = mode;
    step.return_to_step = Some(trace.last_ref());
    step
}

/// Drives the trie machine until it hands the result back.
fn run_until_done(trace: &mut Trace, start: Step) -> Step {
    trace.push_step(start);
    for _ in 0..2048 {
        if trace.last().mpt_work.mode == MptMode::Done {
            return trace.last().clone();
        }
        let next = mpt::mpt_work_proc(trace).expect("mpt step");
        trace.push_step(next);
    }
    panic!("trie operation did not terminate");
}

fn write(trace: &mut Trace, root: Vec<u8>, key: U256, value: &[u8]) -> Vec<u8> {
    let start = start_op(trace, MptMode::StartingWrite, root, key, value.to_vec());
    let done = run_until_done(trace, start);
    done.mpt_work.current_root.clone()
}

fn read(trace: &mut Trace, root: Vec<u8>, key: U256) -> (u8, Vec<u8>) {
    let start = start_op(trace, MptMode::StartingRead, root, key, Vec::new());
    let done = run_until_done(trace, start);
    (done.mpt_work.fail_lookup, done.mpt_work.value.clone())
}

fn delete(trace: &mut Trace, root: Vec<u8>, key: U256) -> Vec<u8> {
    let start = start_op(trace, MptMode::StartingDelete, root, key, Vec::new());
    let done = run_until_done(trace, start);
    done.mpt_work.current_root.clone()
}

/// The canonical reference for a one-pair trie.
fn single_leaf_root(key: U256, value: &[u8]) -> Vec<u8> {
    let path = encode_path(key, 64, true);
    let node = wrap_list(&[wrap_bytes(&path), wrap_bytes(value)]);
    if node.len() >= 32 {
        keccak_hash(&node).to_vec()
    } else {
        node
    }
}

fn test_key_1() -> U256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x12;
    bytes[1] = 0x34;
    key_from(bytes)
}

fn test_key_2() -> U256 {
    let mut bytes = [0x22u8; 32];
    bytes[0] = 0x12;
    bytes[1] = 0x28;
    key_from(bytes)
}

#[test]
fn write_then_read_single_pair() {
    let mut trace = new_trace();
    let key = test_key_1();
    let value = [0x55, 0x42, 0x54, 0x02];

    let root = write(&mut trace, Vec::new(), key, &value);
    assert_eq!(root, single_leaf_root(key, &value));

    let (fail, read_back) = read(&mut trace, root, key);
    assert_eq!(fail, 0);
    assert_eq!(read_back, value);
}

#[test]
fn read_hit_with_sibling() {
    let mut trace = new_trace();
    let root = write(&mut trace, Vec::new(), test_key_1(), &[0x55, 0x42, 0x54, 0x02]);
    let root = write(&mut trace, root, test_key_2(), &[0x56, 0x42, 0x02, 0x44, 0x55]);

    let (fail, value) = read(&mut trace, root.clone(), test_key_1());
    assert_eq!(fail, 0);
    assert_eq!(value, vec![0x55, 0x42, 0x54, 0x02]);

    let (fail, value) = read(&mut trace, root, test_key_2());
    assert_eq!(fail, 0);
    assert_eq!(value, vec![0x56, 0x42, 0x02, 0x44, 0x55]);
}

#[test]
fn read_miss_on_common_prefix() {
    let mut trace = new_trace();
    let root = write(&mut trace, Vec::new(), test_key_1(), &[0x55, 0x42, 0x54, 0x02]);
    let root = write(&mut trace, root, test_key_2(), &[0x56, 0x42, 0x02, 0x44, 0x55]);

    // shares the 0x123 prefix with an existing key but is not present
    let mut bytes = [0u8; 32];
    bytes[0] = 0x12;
    bytes[1] = 0x35;
    let (fail, _) = read(&mut trace, root, key_from(bytes));
    assert_ne!(fail, 0);
}

#[test]
fn read_empty_trie_fails() {
    let mut trace = new_trace();
    let (fail, value) = read(&mut trace, Vec::new(), test_key_1());
    assert_ne!(fail, 0);
    assert!(value.is_empty());
}

#[test]
fn overwrite_updates_value() {
    let mut trace = new_trace();
    let key = test_key_1();
    let root = write(&mut trace, Vec::new(), key, b"old");
    let root = write(&mut trace, root, key, b"new");
    let (fail, value) = read(&mut trace, root.clone(), key);
    assert_eq!(fail, 0);
    assert_eq!(value, b"new");
    assert_eq!(root, single_leaf_root(key, b"new"));
}

#[test]
fn delete_grafts_the_survivor() {
    let mut trace = new_trace();
    let value2 = [0x56, 0x42, 0x02, 0x44, 0x55];
    let root = write(&mut trace, Vec::new(), test_key_1(), &[0x55, 0x42, 0x54, 0x02]);
    let root = write(&mut trace, root, test_key_2(), &value2);

    let root = delete(&mut trace, root, test_key_1());
    // the surviving leaf's path merges back through the dropped branch
    assert_eq!(root, single_leaf_root(test_key_2(), &value2));

    let (fail, _) = read(&mut trace, root.clone(), test_key_1());
    assert_ne!(fail, 0);
    let (fail, value) = read(&mut trace, root, test_key_2());
    assert_eq!(fail, 0);
    assert_eq!(value, value2);
}

#[test]
fn delete_last_key_empties_the_trie() {
    let mut trace = new_trace();
    let key = test_key_1();
    let root = write(&mut trace, Vec::new(), key, b"only");
    let root = delete(&mut trace, root, key);
    assert!(root.is_empty());
}

#[test]
fn randomized_writes_read_back_and_canonical_roots() {
    let mut rng = StdRng::seed_from_u64(0x5445);
    let mut trace = new_trace();

    let pairs: Vec<([u8; 32], Vec<u8>)> = (0..24)
        .map(|_| {
            let mut key = [0u8; 32];
            rng.fill(&mut key);
            let len = rng.gen_range(1..40);
            let value: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            (key, value)
        })
        .collect();

    let mut root = Vec::new();
    for (key, value) in &pairs {
        root = write(&mut trace, root, key_from(*key), value);
    }
    for (key, value) in &pairs {
        let (fail, read_back) = read(&mut trace, root.clone(), key_from(*key));
        assert_eq!(fail, 0, "lost key {:02x?}", &key[..4]);
        assert_eq!(&read_back, value);
    }

    // drop half the keys and check both absence and survivor integrity
    let (dropped, kept) = pairs.split_at(pairs.len() / 2);
    for (key, _) in dropped {
        root = delete(&mut trace, root, key_from(*key));
    }
    for (key, _) in dropped {
        let (fail, _) = read(&mut trace, root.clone(), key_from(*key));
        assert_ne!(fail, 0);
    }
    for (key, value) in kept {
        let (fail, read_back) = read(&mut trace, root.clone(), key_from(*key));
        assert_eq!(fail, 0);
        assert_eq!(&read_back, value);
    }

    // the trie is canonical: rebuilding from the surviving pairs in a fresh
    // arena lands on the same root
    let mut fresh = new_trace();
    let mut fresh_root = Vec::new();
    for (key, value) in kept.iter().rev() {
        fresh_root = write(&mut fresh, fresh_root, key_from(*key), value);
    }
    assert_eq!(root, fresh_root);
}
