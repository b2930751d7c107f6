mod fees;
mod header;
mod payload;
mod receipt;
mod transaction;

pub use fees::calculate_base_fee_per_gas;
pub use header::HeaderFields;
pub use payload::{MinimalExecutionPayload, PayloadError};
pub use receipt::{Log, Receipt};
pub use transaction::{
    AccessListEntry, AccessListTransaction, DepositTransaction, DynamicFeeTransaction,
    LegacyTransaction, NormalizedTransaction, Transaction, TxDecodeError, TxType,
};
