//! Protocol parameters for the target (London) rule set.

/// Chain id the rollup executes under.
pub const CHAIN_ID: u64 = 42;

// === Limits ===

/// Maximum size of the VM stack.
pub const STACK_LIMIT: u64 = 1024;
/// Maximum depth of the call/create stack.
pub const CALL_CREATE_DEPTH: u64 = 1024;
/// Maximum bytecode to permit for a contract (EIP-170).
pub const MAX_CODE_SIZE: u64 = 24576;
/// Maximum number of transaction envelopes in a payload.
pub const MAX_TRANSACTIONS_PER_PAYLOAD: usize = 16_384;
/// Maximum size of a single transaction envelope.
pub const MAX_TRANSACTION_SIZE: usize = 1 << 20;

// === Gas cost tiers ===

pub const GAS_QUICK_STEP: u64 = 2;
pub const GAS_FASTEST_STEP: u64 = 3;
pub const GAS_FAST_STEP: u64 = 5;
pub const GAS_MID_STEP: u64 = 8;
pub const GAS_SLOW_STEP: u64 = 10;
pub const GAS_EXT_STEP: u64 = 20;

// === Transactions ===

/// Per transaction not creating a contract.
pub const TX_GAS: u64 = 21_000;
/// Per transaction that creates a contract.
pub const TX_GAS_CONTRACT_CREATION: u64 = 53_000;
/// Per byte of transaction data that equals zero.
pub const TX_DATA_ZERO_GAS: u64 = 4;
/// Per byte of non-zero transaction data (EIP-2028).
pub const TX_DATA_NON_ZERO_GAS: u64 = 16;
/// Per address in an EIP-2930 access list.
pub const TX_ACCESS_LIST_ADDRESS_GAS: u64 = 2400;
/// Per storage key in an EIP-2930 access list.
pub const TX_ACCESS_LIST_STORAGE_KEY_GAS: u64 = 1900;

// === Memory ===

/// Linear coefficient of the memory cost equation, per word.
pub const MEMORY_GAS: u64 = 3;
/// Divisor for the quadratic particle of the memory cost equation.
pub const QUAD_COEFF_DIV: u64 = 512;
/// Per word copied by the *COPY instructions, rounded up.
pub const COPY_GAS: u64 = 3;

// === Hashing ===

/// Once per KECCAK256 operation.
pub const KECCAK256_GAS: u64 = 30;
/// Per word of KECCAK256 input.
pub const KECCAK256_WORD_GAS: u64 = 6;

// === Logs ===

/// Per LOG* operation.
pub const LOG_GAS: u64 = 375;
/// Per topic of a LOG* operation.
pub const LOG_TOPIC_GAS: u64 = 375;
/// Per byte in a LOG* operation's data.
pub const LOG_DATA_GAS: u64 = 8;

// === Storage (EIP-2200 shape, EIP-3529 refunds) ===

pub const SLOAD_GAS: u64 = 800;
pub const SSTORE_SET_GAS: u64 = 20_000;
pub const SSTORE_RESET_GAS: u64 = 5000;
pub const SSTORE_SENTRY_GAS: u64 = 2300;
pub const SSTORE_CLEARS_REFUND: u64 = 4800;

// === Calls ===

/// Static portion of gas for the CALL family (EIP-150).
pub const CALL_GAS: u64 = 700;
/// Free gas given at the beginning of a value-transferring call.
pub const CALL_STIPEND: u64 = 2300;
/// Paid for CALL when the value transfer is non-zero.
pub const CALL_VALUE_TRANSFER_GAS: u64 = 9000;
/// Paid for CALL when the destination address did not exist prior.
pub const CALL_NEW_ACCOUNT_GAS: u64 = 25_000;

// === Account access (EIP-150/1884 statics) ===

pub const BALANCE_GAS: u64 = 700;
pub const EXTCODE_SIZE_GAS: u64 = 700;
pub const EXTCODE_HASH_GAS: u64 = 700;
pub const EXTCODE_COPY_BASE_GAS: u64 = 700;
pub const SELFDESTRUCT_GAS: u64 = 5000;
pub const CREATE_BY_SELFDESTRUCT_GAS: u64 = 25_000;

// === Create ===

/// Once per CREATE operation and contract-creation transaction.
pub const CREATE_GAS: u64 = 32_000;
pub const CREATE2_GAS: u64 = 32_000;
/// Per byte of deposited contract code.
pub const CREATE_DATA_GAS: u64 = 200;

// === Misc opcodes ===

pub const JUMPDEST_GAS: u64 = 1;
pub const EXP_GAS: u64 = 10;
/// Per byte of the EXP exponent (EIP-158).
pub const EXP_BYTE_GAS: u64 = 50;

// === Refunds ===

/// Cap on refunded gas: gas_used / REFUND_QUOTIENT (EIP-3529).
pub const REFUND_QUOTIENT: u64 = 5;

// === Precompile pricing ===

pub const ECRECOVER_GAS: u64 = 3000;
pub const SHA256_BASE_GAS: u64 = 60;
pub const SHA256_PER_WORD_GAS: u64 = 12;
pub const RIPEMD160_BASE_GAS: u64 = 600;
pub const RIPEMD160_PER_WORD_GAS: u64 = 120;
pub const IDENTITY_BASE_GAS: u64 = 15;
pub const IDENTITY_PER_WORD_GAS: u64 = 3;

// === EIP-1559 ===

/// Bounds the amount the base fee can change between blocks.
pub const BASE_FEE_CHANGE_DENOMINATOR: u64 = 8;
/// Bounds the maximum gas limit an EIP-1559 block may have.
pub const ELASTICITY_MULTIPLIER: u64 = 2;
/// Base fee of the genesis block.
pub const INITIAL_BASE_FEE: u64 = 1_000_000_000;

// === Block validation ===

pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;
pub const MIN_GAS_LIMIT: u64 = 5000;
