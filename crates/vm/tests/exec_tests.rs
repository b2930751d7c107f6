//! Interpreter and pipeline scenarios: single frames driven opcode by
//! opcode, and whole-block traces through the generator.

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use stepex_common::{
    constants::{CHAIN_ID, INITIAL_BASE_FEE, TX_GAS},
    types::{DepositTransaction, MinimalExecutionPayload},
};
use stepex_crypto::keccak::keccak_hash;
use stepex_rlp::structs::Encoder;
use stepex_vm::{
    call::{CallKind, CallMode, CallScheme},
    exec_mode::ExecMode,
    external::MemorySource,
    interpreter,
    jump_table::OpCode,
    step::Step,
    trace::{StepsTrace, Trace, TraceConfig, generate},
    witness::{TraceWitness, verify_step},
};

fn frame_trace(code: Vec<u8>, gas: u64) -> Trace {
    let config = TraceConfig {
        capture: false,
        step_limit: 100_000,
    };
    let mut trace = Trace::new(Box::new(MemorySource::new()), config);

    // a transaction-level frame owner for the unwind to land in
    let mut owner = Step::default();
    owner.call_work.kind = CallKind::Transaction;
    owner.call_work.scheme = CallScheme::Call;
    owner.tx.norm_tx.gas_limit = gas + TX_GAS;
    trace.push_step(owner);

    let mut frame = trace.last().clone();
    frame.return_to_step = Some(trace.last_ref());
    frame.contract.code_hash = H256(keccak_hash(&code));
    frame.contract.code = code.into();
    frame.contract.gas = gas;
    frame.exec_mode = ExecMode::OpcodeLoad;
    trace.push_step(frame);
    trace
}

/// Steps a frame until the transaction-level unwind, returning the final step.
fn run_frame(trace: &mut Trace) -> Step {
    for _ in 0..20_000 {
        let mode = trace.last().exec_mode;
        if mode == ExecMode::BlockTxSuccess || mode == ExecMode::BlockTxRevert {
            return trace.last().clone();
        }
        assert!(!mode.is_block_fatal(), "unexpected block-fatal mode");
        let next = interpreter::next_step(trace).expect("step");
        trace.push_step(next);
    }
    panic!("frame did not unwind");
}

fn word(value: u64) -> H256 {
    H256(U256::from(value).to_big_endian())
}

#[test]
fn mstore_return_round_trip() {
    let code = vec![
        OpCode::PUSH1 as u8, 10,
        OpCode::PUSH1 as u8, 0,
        OpCode::MSTORE as u8,
        OpCode::PUSH1 as u8, 32,
        OpCode::PUSH1 as u8, 0,
        OpCode::RETURN as u8,
    ];
    let mut trace = frame_trace(code, 100_000);
    let end = run_frame(&mut trace);

    assert_eq!(end.exec_mode, ExecMode::BlockTxSuccess);
    assert_eq!(end.contract.ret_data, word(10).as_bytes().to_vec());
    assert!(trace.len() < 120, "trace too long: {}", trace.len());
}

#[test]
fn arithmetic_on_the_stack() {
    // (7 + 5) * 3 returned as a word
    let code = vec![
        OpCode::PUSH1 as u8, 7,
        OpCode::PUSH1 as u8, 5,
        OpCode::ADD as u8,
        OpCode::PUSH1 as u8, 3,
        OpCode::MUL as u8,
        OpCode::PUSH1 as u8, 0,
        OpCode::MSTORE as u8,
        OpCode::PUSH1 as u8, 32,
        OpCode::PUSH1 as u8, 0,
        OpCode::RETURN as u8,
    ];
    let mut trace = frame_trace(code, 100_000);
    let end = run_frame(&mut trace);
    assert_eq!(end.exec_mode, ExecMode::BlockTxSuccess);
    assert_eq!(end.contract.ret_data, word(36).as_bytes().to_vec());
}

#[test]
fn jump_skips_dead_code() {
    let code = vec![
        OpCode::PUSH1 as u8, 4, // jump over the INVALID
        OpCode::JUMP as u8,
        OpCode::INVALID as u8,
        OpCode::JUMPDEST as u8,
        OpCode::STOP as u8,
    ];
    let mut trace = frame_trace(code, 100_000);
    let end = run_frame(&mut trace);
    assert_eq!(end.exec_mode, ExecMode::BlockTxSuccess);
    assert!(end.contract.ret_data.is_empty());
}

#[test]
fn jump_into_push_data_is_invalid() {
    let code = vec![
        OpCode::PUSH1 as u8, 1, // destination 1 is PUSH immediate data
        OpCode::JUMP as u8,
        OpCode::JUMPDEST as u8,
        OpCode::STOP as u8,
    ];
    let mut trace = frame_trace(code, 100_000);
    let end = run_frame(&mut trace);
    assert_eq!(end.exec_mode, ExecMode::BlockTxRevert);
}

#[test]
fn stack_underflow_fails_the_frame() {
    let code = vec![OpCode::ADD as u8];
    let mut trace = frame_trace(code, 100_000);
    let end = run_frame(&mut trace);
    assert_eq!(end.exec_mode, ExecMode::BlockTxRevert);
}

#[test]
fn out_of_gas_burns_the_frame() {
    let code = vec![
        OpCode::PUSH1 as u8, 0,
        OpCode::PUSH1 as u8, 0,
        OpCode::MSTORE as u8,
    ];
    // not even enough for the pushes
    let mut trace = frame_trace(code, 4);
    let end = run_frame(&mut trace);
    assert_eq!(end.exec_mode, ExecMode::BlockTxRevert);
    assert_eq!(end.contract.gas, 0);
}

#[test]
fn sstore_sload_through_the_world_tree() {
    let code = vec![
        OpCode::PUSH1 as u8, 42,
        OpCode::PUSH1 as u8, 1,
        OpCode::SSTORE as u8,
        OpCode::PUSH1 as u8, 1,
        OpCode::SLOAD as u8,
        OpCode::PUSH1 as u8, 0,
        OpCode::MSTORE as u8,
        OpCode::PUSH1 as u8, 32,
        OpCode::PUSH1 as u8, 0,
        OpCode::RETURN as u8,
    ];
    let mut trace = frame_trace(code, 200_000);
    let end = run_frame(&mut trace);

    assert_eq!(end.exec_mode, ExecMode::BlockTxSuccess);
    assert_eq!(end.contract.ret_data, word(42).as_bytes().to_vec());
    // the write materialized an account record in the world tree
    assert_ne!(end.state_root, H256::zero());
}

#[test]
fn call_depth_limit_pushes_zero() {
    let config = TraceConfig {
        capture: false,
        step_limit: 1000,
    };
    let mut trace = Trace::new(Box::new(MemorySource::new()), config);

    let mut caller = Step::default();
    caller.contract.code = Bytes::from_static(&[OpCode::CALL as u8]);
    caller.contract.call_depth = 1024;
    caller.contract.gas = 50_000;
    for _ in 0..7 {
        caller.contract.stack.push(H256::zero()).unwrap();
    }
    caller.call_work.mode = CallMode::Start;
    caller.call_work.kind = CallKind::Opcode;
    caller.call_work.scheme = CallScheme::Call;
    caller.call_work.gas = 10_000;
    caller.exec_mode = ExecMode::CallSetup;
    trace.push_step(caller);

    for _ in 0..100 {
        if trace.last().exec_mode == ExecMode::OpcodeLoad {
            break;
        }
        let next = interpreter::next_step(&trace).expect("step");
        trace.push_step(next);
    }

    let end = trace.last();
    assert_eq!(end.exec_mode, ExecMode::OpcodeLoad);
    // the 1025th frame was refused and the caller saw a zero status
    assert_eq!(end.contract.stack.len(), 1);
    assert_eq!(end.contract.stack.peek().unwrap(), H256::zero());
    assert_eq!(end.contract.call_depth, 1024);
}

#[test]
fn random_code_never_breaks_the_interpreter() {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    let mut rng = StdRng::seed_from_u64(0xe76);

    for _ in 0..32 {
        let len = rng.gen_range(1..64);
        let code: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
        // a small budget keeps even accidental jump loops short
        let mut trace = frame_trace(code, 2_000);

        // whatever the bytes decode to, the stack validation and error
        // unwinding must keep every transition total
        for _ in 0..20_000 {
            let mode = trace.last().exec_mode;
            if mode == ExecMode::BlockTxSuccess || mode == ExecMode::BlockTxRevert {
                break;
            }
            let next = interpreter::next_step(&trace).expect("transition must stay total");
            trace.push_step(next);
        }
        let mode = trace.last().exec_mode;
        assert!(
            mode == ExecMode::BlockTxSuccess || mode == ExecMode::BlockTxRevert,
            "random frame did not unwind: {mode:?}"
        );
    }
}

fn deposit_envelope(deposit: &DepositTransaction) -> Bytes {
    let mut envelope = vec![0x42];
    envelope.extend_from_slice(&deposit.encode_ssz());
    Bytes::from(envelope)
}

fn genesis_payload(transactions: Vec<Bytes>) -> MinimalExecutionPayload {
    MinimalExecutionPayload {
        parent_hash: H256::zero(),
        coinbase: Address::repeat_byte(0xcb),
        random: H256::repeat_byte(0x01),
        block_number: 0,
        gas_limit: 30_000_000,
        timestamp: 1_700_000_000,
        transactions,
    }
}

#[test]
fn deposit_transfer_block_to_done() {
    let sender = Address::repeat_byte(0xaa);
    let dest = Address::repeat_byte(0xbb);
    let deposit = DepositTransaction {
        from: sender,
        to: Some(dest),
        mint: U256::exp10(18),
        value: U256::exp10(17),
        gas_limit: 100_000,
        data: Bytes::new(),
    };
    let payload = genesis_payload(vec![deposit_envelope(&deposit)]);

    let trace = generate(
        Box::new(MemorySource::new()),
        payload,
        TraceConfig::default(),
    )
    .expect("trace generation");

    let end = trace.last();
    assert_eq!(end.exec_mode, ExecMode::Done);
    assert_eq!(end.block.receipts.len(), 1);
    assert!(end.block.receipts[0].succeeded);
    assert_eq!(end.block.gas_used, TX_GAS);
    assert_eq!(end.block.base_fee, U256::from(INITIAL_BASE_FEE));
    assert_ne!(end.state_root, H256::zero());
}

#[test]
fn deposit_block_witness_reconstructs() {
    let deposit = DepositTransaction {
        from: Address::repeat_byte(0xaa),
        to: Some(Address::repeat_byte(0xbb)),
        mint: U256::exp10(18),
        value: U256::exp10(17),
        gas_limit: 100_000,
        data: Bytes::new(),
    };
    let payload = genesis_payload(vec![deposit_envelope(&deposit)]);

    let trace = generate(
        Box::new(MemorySource::new()),
        payload.clone(),
        TraceConfig::default(),
    )
    .expect("trace generation");
    let witness = TraceWitness::from_trace(&trace);

    assert_eq!(witness.steps.len(), trace.len());

    // every accessed gindex of an early step resolves through binary_nodes
    for index in [0usize, 1, 5] {
        let step_witness = witness.step_witness(index).expect("extraction");
        assert_eq!(step_witness.root, witness.steps[index].root);
        assert!(!step_witness.contents.is_empty());
    }

    // replaying from the witness databases alone reproduces the roots
    assert!(verify_step(&witness, payload, 3).expect("verification"));
}

fn signed_transfer_envelope(
    secret: &secp256k1::SecretKey,
    nonce: u64,
    dest: Address,
    value: U256,
) -> Bytes {
    use stepex_common::types::{AccessListEntry, Transaction};

    let base = stepex_common::types::DynamicFeeTransaction {
        chain_id: CHAIN_ID,
        nonce,
        max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        max_fee_per_gas: U256::from(2_000_000_000u64),
        gas_limit: 50_000,
        to: Some(dest),
        value,
        data: Bytes::new(),
        access_list: Vec::new(),
        y_parity: false,
        r: U256::zero(),
        s: U256::zero(),
    };
    let sighash = Transaction::DynamicFee(base.clone()).signing_hash();
    let message = secp256k1::Message::from_digest(sighash.0);
    let signature = secp256k1::SECP256K1.sign_ecdsa_recoverable(&message, secret);
    let (recovery, compact) = signature.serialize_compact();

    let mut buf = vec![0x02];
    Encoder::new(&mut buf)
        .encode_field(&base.chain_id)
        .encode_field(&base.nonce)
        .encode_field(&base.max_priority_fee_per_gas)
        .encode_field(&base.max_fee_per_gas)
        .encode_field(&base.gas_limit)
        .encode_field(&dest)
        .encode_field(&base.value)
        .encode_field(&base.data)
        .encode_field(&Vec::<AccessListEntry>::new())
        .encode_field(&(recovery.to_i32() == 1))
        .encode_field(&U256::from_big_endian(&compact[..32]))
        .encode_field(&U256::from_big_endian(&compact[32..]))
        .finish();
    Bytes::from(buf)
}

#[test]
fn signed_transfer_after_deposit_funding() {
    let secret = secp256k1::SecretKey::from_slice(&[0x11; 32]).unwrap();
    let public = secret.public_key(secp256k1::SECP256K1);
    let signer = Address::from_slice(&keccak_hash(&public.serialize_uncompressed()[1..])[12..]);
    let dest = Address::repeat_byte(0xdd);

    let funding = DepositTransaction {
        from: signer,
        to: Some(signer),
        mint: U256::exp10(18),
        value: U256::zero(),
        gas_limit: 50_000,
        data: Bytes::new(),
    };
    let transfer = signed_transfer_envelope(&secret, 0, dest, U256::exp10(15));
    let payload = genesis_payload(vec![deposit_envelope(&funding), transfer]);

    let trace = generate(
        Box::new(MemorySource::new()),
        payload,
        TraceConfig::default(),
    )
    .expect("trace generation");

    let end = trace.last();
    assert_eq!(end.exec_mode, ExecMode::Done);
    assert_eq!(end.block.receipts.len(), 2);
    assert!(end.block.receipts.iter().all(|r| r.succeeded));
    assert_eq!(end.block.gas_used, 2 * TX_GAS);
    assert_eq!(end.block.receipts[1].cumulative_gas_used, 2 * TX_GAS);
}
