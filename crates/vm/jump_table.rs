//! The 256-entry operation table: per opcode, its handler, gas costs, stack
//! contract and memory-size calculator. One indirect call per opcode is the
//! only dynamic dispatch in the engine.

use std::sync::OnceLock;

use ethereum_types::U256;
use stepex_common::constants::*;

use crate::{
    errors::VmError,
    gas,
    instructions::{arithmetic, bitwise, block, environment, flow, hashing, logging, memory, push,
        storage, system},
    step::{Stack, Step},
    trace::StepsTrace,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    STOP = 0x00,
    ADD = 0x01,
    MUL = 0x02,
    SUB = 0x03,
    DIV = 0x04,
    SDIV = 0x05,
    MOD = 0x06,
    SMOD = 0x07,
    ADDMOD = 0x08,
    MULMOD = 0x09,
    EXP = 0x0a,
    SIGNEXTEND = 0x0b,

    LT = 0x10,
    GT = 0x11,
    SLT = 0x12,
    SGT = 0x13,
    EQ = 0x14,
    ISZERO = 0x15,
    AND = 0x16,
    OR = 0x17,
    XOR = 0x18,
    NOT = 0x19,
    BYTE = 0x1a,
    SHL = 0x1b,
    SHR = 0x1c,
    SAR = 0x1d,

    KECCAK256 = 0x20,

    ADDRESS = 0x30,
    BALANCE = 0x31,
    ORIGIN = 0x32,
    CALLER = 0x33,
    CALLVALUE = 0x34,
    CALLDATALOAD = 0x35,
    CALLDATASIZE = 0x36,
    CALLDATACOPY = 0x37,
    CODESIZE = 0x38,
    CODECOPY = 0x39,
    GASPRICE = 0x3a,
    EXTCODESIZE = 0x3b,
    EXTCODECOPY = 0x3c,
    RETURNDATASIZE = 0x3d,
    RETURNDATACOPY = 0x3e,
    EXTCODEHASH = 0x3f,

    BLOCKHASH = 0x40,
    COINBASE = 0x41,
    TIMESTAMP = 0x42,
    NUMBER = 0x43,
    DIFFICULTY = 0x44,
    GASLIMIT = 0x45,
    CHAINID = 0x46,
    SELFBALANCE = 0x47,
    BASEFEE = 0x48,

    POP = 0x50,
    MLOAD = 0x51,
    MSTORE = 0x52,
    MSTORE8 = 0x53,
    SLOAD = 0x54,
    SSTORE = 0x55,
    JUMP = 0x56,
    JUMPI = 0x57,
    PC = 0x58,
    MSIZE = 0x59,
    GAS = 0x5a,
    JUMPDEST = 0x5b,

    PUSH1 = 0x60,
    PUSH32 = 0x7f,
    DUP1 = 0x80,
    DUP16 = 0x8f,
    SWAP1 = 0x90,
    SWAP16 = 0x9f,

    LOG0 = 0xa0,
    LOG1 = 0xa1,
    LOG2 = 0xa2,
    LOG3 = 0xa3,
    LOG4 = 0xa4,

    CREATE = 0xf0,
    CALL = 0xf1,
    CALLCODE = 0xf2,
    RETURN = 0xf3,
    DELEGATECALL = 0xf4,
    CREATE2 = 0xf5,
    STATICCALL = 0xfa,
    REVERT = 0xfd,
    INVALID = 0xfe,
    SELFDESTRUCT = 0xff,
}

pub type Processor = fn(&dyn StepsTrace) -> Result<Step, VmError>;
pub type MemoryCalculator = fn(&Stack) -> Result<(u64, bool), VmError>;

/// One jump-table entry.
#[derive(Clone, Copy)]
pub struct Operation {
    pub proc: Processor,
    pub constant_gas: u64,
    /// Dynamic gas takes a whole step of its own, and may suspend further.
    pub dynamic_gas: Option<Processor>,
    pub min_stack: u64,
    pub max_stack: u64,
    /// Required memory word count from the stack, plus an overflow flag.
    pub memory_size: Option<MemoryCalculator>,
    /// State-modifying op, rejected in read-only frames.
    pub writes: bool,
    pub defined: bool,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("constant_gas", &self.constant_gas)
            .field("min_stack", &self.min_stack)
            .field("max_stack", &self.max_stack)
            .field("writes", &self.writes)
            .field("defined", &self.defined)
            .finish()
    }
}

const fn min_stack(pops: u64, _push: u64) -> u64 {
    pops
}

const fn max_stack(pops: u64, push: u64) -> u64 {
    STACK_LIMIT + pops - push
}

const fn min_dup_stack(n: u64) -> u64 {
    min_stack(n, n + 1)
}

const fn max_dup_stack(n: u64) -> u64 {
    max_stack(n, n + 1)
}

const fn min_swap_stack(n: u64) -> u64 {
    min_stack(n, n)
}

const fn max_swap_stack(n: u64) -> u64 {
    max_stack(n, n)
}

struct Op;

impl Op {
    const UNDEFINED: Operation = Operation {
        proc: system::op_undefined,
        constant_gas: 0,
        dynamic_gas: None,
        min_stack: 0,
        max_stack: STACK_LIMIT,
        memory_size: None,
        writes: false,
        defined: false,
    };

    const fn new(proc: Processor, constant_gas: u64, pops: u64, push: u64) -> Operation {
        Operation {
            proc,
            constant_gas,
            dynamic_gas: None,
            min_stack: min_stack(pops, push),
            max_stack: max_stack(pops, push),
            memory_size: None,
            writes: false,
            defined: true,
        }
    }

    const fn dynamic(mut op: Operation, dynamic_gas: Processor) -> Operation {
        op.dynamic_gas = Some(dynamic_gas);
        op
    }

    const fn memory(mut op: Operation, memory_size: MemoryCalculator) -> Operation {
        op.memory_size = Some(memory_size);
        op
    }

    const fn writes(mut op: Operation) -> Operation {
        op.writes = true;
        op
    }
}

/// The operation table for the latest rule set.
pub fn jump_table() -> &'static [Operation; 256] {
    static TABLE: OnceLock<[Operation; 256]> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

pub fn operation(op: u8) -> &'static Operation {
    &jump_table()[op as usize]
}

fn build_table() -> [Operation; 256] {
    let mut table = [Op::UNDEFINED; 256];

    table[OpCode::STOP as usize] = Op::new(flow::op_stop, 0, 0, 0);
    table[OpCode::ADD as usize] = Op::new(arithmetic::op_add, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::MUL as usize] = Op::new(arithmetic::op_mul, GAS_FAST_STEP, 2, 1);
    table[OpCode::SUB as usize] = Op::new(arithmetic::op_sub, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::DIV as usize] = Op::new(arithmetic::op_div, GAS_FAST_STEP, 2, 1);
    table[OpCode::SDIV as usize] = Op::new(arithmetic::op_sdiv, GAS_FAST_STEP, 2, 1);
    table[OpCode::MOD as usize] = Op::new(arithmetic::op_mod, GAS_FAST_STEP, 2, 1);
    table[OpCode::SMOD as usize] = Op::new(arithmetic::op_smod, GAS_FAST_STEP, 2, 1);
    table[OpCode::ADDMOD as usize] = Op::new(arithmetic::op_addmod, GAS_MID_STEP, 3, 1);
    table[OpCode::MULMOD as usize] = Op::new(arithmetic::op_mulmod, GAS_MID_STEP, 3, 1);
    table[OpCode::EXP as usize] =
        Op::dynamic(Op::new(arithmetic::op_exp, EXP_GAS, 2, 1), gas::gas_exp);
    table[OpCode::SIGNEXTEND as usize] =
        Op::new(arithmetic::op_signextend, GAS_FAST_STEP, 2, 1);

    table[OpCode::LT as usize] = Op::new(bitwise::op_lt, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::GT as usize] = Op::new(bitwise::op_gt, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::SLT as usize] = Op::new(bitwise::op_slt, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::SGT as usize] = Op::new(bitwise::op_sgt, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::EQ as usize] = Op::new(bitwise::op_eq, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::ISZERO as usize] = Op::new(bitwise::op_iszero, GAS_FASTEST_STEP, 1, 1);
    table[OpCode::AND as usize] = Op::new(bitwise::op_and, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::OR as usize] = Op::new(bitwise::op_or, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::XOR as usize] = Op::new(bitwise::op_xor, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::NOT as usize] = Op::new(bitwise::op_not, GAS_FASTEST_STEP, 1, 1);
    table[OpCode::BYTE as usize] = Op::new(bitwise::op_byte, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::SHL as usize] = Op::new(bitwise::op_shl, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::SHR as usize] = Op::new(bitwise::op_shr, GAS_FASTEST_STEP, 2, 1);
    table[OpCode::SAR as usize] = Op::new(bitwise::op_sar, GAS_FASTEST_STEP, 2, 1);

    table[OpCode::KECCAK256 as usize] = Op::memory(
        Op::dynamic(
            Op::new(hashing::op_keccak256, KECCAK256_GAS, 2, 1),
            gas::gas_keccak256,
        ),
        memory_keccak256,
    );

    table[OpCode::ADDRESS as usize] = Op::new(environment::op_address, GAS_QUICK_STEP, 0, 1);
    table[OpCode::BALANCE as usize] = Op::new(environment::op_balance, BALANCE_GAS, 1, 1);
    table[OpCode::ORIGIN as usize] = Op::new(environment::op_origin, GAS_QUICK_STEP, 0, 1);
    table[OpCode::CALLER as usize] = Op::new(environment::op_caller, GAS_QUICK_STEP, 0, 1);
    table[OpCode::CALLVALUE as usize] = Op::new(environment::op_call_value, GAS_QUICK_STEP, 0, 1);
    table[OpCode::CALLDATALOAD as usize] =
        Op::new(environment::op_call_data_load, GAS_FASTEST_STEP, 1, 1);
    table[OpCode::CALLDATASIZE as usize] =
        Op::new(environment::op_call_data_size, GAS_QUICK_STEP, 0, 1);
    table[OpCode::CALLDATACOPY as usize] = Op::memory(
        Op::dynamic(
            Op::new(environment::op_call_data_copy, GAS_FASTEST_STEP, 3, 0),
            gas::gas_copy,
        ),
        memory_call_data_copy,
    );
    table[OpCode::CODESIZE as usize] = Op::new(environment::op_code_size, GAS_QUICK_STEP, 0, 1);
    table[OpCode::CODECOPY as usize] = Op::memory(
        Op::dynamic(
            Op::new(environment::op_code_copy, GAS_FASTEST_STEP, 3, 0),
            gas::gas_copy,
        ),
        memory_code_copy,
    );
    table[OpCode::GASPRICE as usize] = Op::new(environment::op_gas_price, GAS_QUICK_STEP, 0, 1);
    table[OpCode::EXTCODESIZE as usize] =
        Op::new(environment::op_ext_code_size, EXTCODE_SIZE_GAS, 1, 1);
    table[OpCode::EXTCODECOPY as usize] = Op::memory(
        Op::dynamic(
            Op::new(environment::op_ext_code_copy, EXTCODE_COPY_BASE_GAS, 4, 0),
            gas::gas_ext_code_copy,
        ),
        memory_ext_code_copy,
    );
    table[OpCode::RETURNDATASIZE as usize] =
        Op::new(environment::op_return_data_size, GAS_QUICK_STEP, 0, 1);
    table[OpCode::RETURNDATACOPY as usize] = Op::memory(
        Op::dynamic(
            Op::new(environment::op_return_data_copy, GAS_FASTEST_STEP, 3, 0),
            gas::gas_copy,
        ),
        memory_return_data_copy,
    );
    table[OpCode::EXTCODEHASH as usize] =
        Op::new(environment::op_ext_code_hash, EXTCODE_HASH_GAS, 1, 1);

    table[OpCode::BLOCKHASH as usize] = Op::new(block::op_block_hash, GAS_EXT_STEP, 1, 1);
    table[OpCode::COINBASE as usize] = Op::new(block::op_coinbase, GAS_QUICK_STEP, 0, 1);
    table[OpCode::TIMESTAMP as usize] = Op::new(block::op_timestamp, GAS_QUICK_STEP, 0, 1);
    table[OpCode::NUMBER as usize] = Op::new(block::op_number, GAS_QUICK_STEP, 0, 1);
    table[OpCode::DIFFICULTY as usize] = Op::new(block::op_difficulty, GAS_QUICK_STEP, 0, 1);
    table[OpCode::GASLIMIT as usize] = Op::new(block::op_gas_limit, GAS_QUICK_STEP, 0, 1);
    table[OpCode::CHAINID as usize] = Op::new(environment::op_chain_id, GAS_QUICK_STEP, 0, 1);
    table[OpCode::SELFBALANCE as usize] =
        Op::new(environment::op_self_balance, GAS_FAST_STEP, 0, 1);
    table[OpCode::BASEFEE as usize] = Op::new(environment::op_base_fee, GAS_QUICK_STEP, 0, 1);

    table[OpCode::POP as usize] = Op::new(memory::op_pop, GAS_QUICK_STEP, 1, 0);
    table[OpCode::MLOAD as usize] = Op::memory(
        Op::dynamic(
            Op::new(memory::op_mload, GAS_FASTEST_STEP, 1, 1),
            gas::gas_pure_memory,
        ),
        memory_mload,
    );
    table[OpCode::MSTORE as usize] = Op::memory(
        Op::dynamic(
            Op::new(memory::op_mstore, GAS_FASTEST_STEP, 2, 0),
            gas::gas_pure_memory,
        ),
        memory_mstore,
    );
    table[OpCode::MSTORE8 as usize] = Op::memory(
        Op::dynamic(
            Op::new(memory::op_mstore8, GAS_FASTEST_STEP, 2, 0),
            gas::gas_pure_memory,
        ),
        memory_mstore8,
    );
    table[OpCode::SLOAD as usize] = Op::new(storage::op_sload, SLOAD_GAS, 1, 1);
    table[OpCode::SSTORE as usize] = Op::writes(Op::dynamic(
        Op::new(storage::op_sstore, 0, 2, 0),
        gas::gas_sstore,
    ));
    table[OpCode::JUMP as usize] = Op::new(flow::op_jump, GAS_MID_STEP, 1, 0);
    table[OpCode::JUMPI as usize] = Op::new(flow::op_jump_i, GAS_SLOW_STEP, 2, 0);
    table[OpCode::PC as usize] = Op::new(flow::op_pc, GAS_QUICK_STEP, 0, 1);
    table[OpCode::MSIZE as usize] = Op::new(memory::op_msize, GAS_QUICK_STEP, 0, 1);
    table[OpCode::GAS as usize] = Op::new(memory::op_gas, GAS_QUICK_STEP, 0, 1);
    table[OpCode::JUMPDEST as usize] = Op::new(flow::op_jump_dest, JUMPDEST_GAS, 0, 0);

    for n in 0..32u64 {
        table[OpCode::PUSH1 as usize + n as usize] =
            Op::new(push::op_push, GAS_FASTEST_STEP, 0, 1);
    }
    for n in 1..=16u64 {
        let mut op = Op::new(push::op_dup, GAS_FASTEST_STEP, 0, 0);
        op.min_stack = min_dup_stack(n);
        op.max_stack = max_dup_stack(n);
        table[OpCode::DUP1 as usize + (n as usize - 1)] = op;
    }
    for n in 1..=16u64 {
        let mut op = Op::new(push::op_swap, GAS_FASTEST_STEP, 0, 0);
        op.min_stack = min_swap_stack(n + 1);
        op.max_stack = max_swap_stack(n + 1);
        table[OpCode::SWAP1 as usize + (n as usize - 1)] = op;
    }
    for n in 0..=4u64 {
        let op = Op::writes(Op::memory(
            Op::dynamic(Op::new(logging::op_log, 0, 2 + n, 0), gas::gas_log),
            memory_log,
        ));
        table[OpCode::LOG0 as usize + n as usize] = op;
    }

    table[OpCode::CREATE as usize] = Op::writes(Op::memory(
        Op::dynamic(Op::new(system::op_create, CREATE_GAS, 3, 1), gas::gas_pure_memory),
        memory_create,
    ));
    table[OpCode::CREATE2 as usize] = Op::writes(Op::memory(
        Op::dynamic(Op::new(system::op_create, CREATE2_GAS, 4, 1), gas::gas_create2),
        memory_create2,
    ));
    table[OpCode::CALL as usize] = Op::memory(
        Op::dynamic(Op::new(system::op_call, CALL_GAS, 7, 1), gas::gas_pure_memory),
        memory_call,
    );
    table[OpCode::CALLCODE as usize] = Op::memory(
        Op::dynamic(Op::new(system::op_call, CALL_GAS, 7, 1), gas::gas_pure_memory),
        memory_call,
    );
    table[OpCode::DELEGATECALL as usize] = Op::memory(
        Op::dynamic(Op::new(system::op_call, CALL_GAS, 6, 1), gas::gas_pure_memory),
        memory_delegate_call,
    );
    table[OpCode::STATICCALL as usize] = Op::memory(
        Op::dynamic(Op::new(system::op_call, CALL_GAS, 6, 1), gas::gas_pure_memory),
        memory_static_call,
    );
    table[OpCode::RETURN as usize] = Op::memory(
        Op::dynamic(Op::new(system::op_return, 0, 2, 0), gas::gas_pure_memory),
        memory_return,
    );
    table[OpCode::REVERT as usize] = Op::memory(
        Op::dynamic(Op::new(system::op_revert, 0, 2, 0), gas::gas_pure_memory),
        memory_revert,
    );
    table[OpCode::SELFDESTRUCT as usize] = Op::writes(Op::dynamic(
        Op::new(system::op_self_destruct, 0, 1, 0),
        gas::gas_self_destruct,
    ));

    table
}

// === Memory size calculators ===
// Required memory size per op, derived from the stack; the bool reports
// uint64 overflow.

fn calc_mem_size(offset: U256, len: U256) -> (u64, bool) {
    if len.is_zero() {
        return (0, false);
    }
    if len > U256::from(u64::MAX) || offset > U256::from(u64::MAX) {
        return (0, true);
    }
    match offset.low_u64().checked_add(len.low_u64()) {
        Some(size) => (size, false),
        None => (0, true),
    }
}

fn memory_keccak256(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, stack.back_u256(1)?))
}

fn memory_call_data_copy(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, stack.back_u256(2)?))
}

fn memory_return_data_copy(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, stack.back_u256(2)?))
}

fn memory_code_copy(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, stack.back_u256(2)?))
}

fn memory_ext_code_copy(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(1)?, stack.back_u256(3)?))
}

fn memory_mload(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, U256::from(32)))
}

fn memory_mstore(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, U256::from(32)))
}

fn memory_mstore8(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, U256::one()))
}

fn memory_create(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(1)?, stack.back_u256(2)?))
}

fn memory_create2(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(1)?, stack.back_u256(2)?))
}

fn max_of(a: (u64, bool), b: (u64, bool)) -> (u64, bool) {
    if a.1 || b.1 {
        return (0, true);
    }
    (a.0.max(b.0), false)
}

fn memory_call(stack: &Stack) -> Result<(u64, bool), VmError> {
    let ret = calc_mem_size(stack.back_u256(5)?, stack.back_u256(6)?);
    let input = calc_mem_size(stack.back_u256(3)?, stack.back_u256(4)?);
    Ok(max_of(ret, input))
}

fn memory_delegate_call(stack: &Stack) -> Result<(u64, bool), VmError> {
    let ret = calc_mem_size(stack.back_u256(4)?, stack.back_u256(5)?);
    let input = calc_mem_size(stack.back_u256(2)?, stack.back_u256(3)?);
    Ok(max_of(ret, input))
}

fn memory_static_call(stack: &Stack) -> Result<(u64, bool), VmError> {
    memory_delegate_call(stack)
}

fn memory_return(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, stack.back_u256(1)?))
}

fn memory_revert(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, stack.back_u256(1)?))
}

fn memory_log(stack: &Stack) -> Result<(u64, bool), VmError> {
    Ok(calc_mem_size(stack.back_u256(0)?, stack.back_u256(1)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_known_opcodes() {
        let table = jump_table();
        assert!(table[OpCode::ADD as usize].defined);
        assert!(table[OpCode::PUSH1 as usize + 13].defined);
        assert!(table[OpCode::SWAP16 as usize].defined);
        assert!(!table[0x0c].defined);
        assert!(!table[0x21].defined);
    }

    #[test]
    fn stack_contracts() {
        let table = jump_table();
        assert_eq!(table[OpCode::ADD as usize].min_stack, 2);
        assert_eq!(table[OpCode::ADD as usize].max_stack, STACK_LIMIT + 1);
        assert_eq!(table[OpCode::DUP1 as usize].min_stack, 1);
        assert_eq!(table[OpCode::DUP1 as usize].max_stack, STACK_LIMIT - 1);
        assert_eq!(table[OpCode::SWAP1 as usize].min_stack, 2);
        assert_eq!(table[OpCode::CALL as usize].min_stack, 7);
    }

    #[test]
    fn write_flags() {
        let table = jump_table();
        for op in [
            OpCode::SSTORE,
            OpCode::LOG0,
            OpCode::LOG4,
            OpCode::CREATE,
            OpCode::CREATE2,
            OpCode::SELFDESTRUCT,
        ] {
            assert!(table[op as usize].writes);
        }
        assert!(!table[OpCode::CALL as usize].writes);
    }

    #[test]
    fn memory_size_overflow_flags() {
        let mut stack = Stack::default();
        stack.push_u256(U256::MAX).unwrap(); // length
        stack.push_u256(U256::zero()).unwrap(); // unused
        stack.push_u256(U256::zero()).unwrap(); // offset
        let (_, overflow) = memory_call_data_copy(&stack).unwrap();
        assert!(overflow);
    }
}
