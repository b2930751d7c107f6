// Keep H256, H160, Address and the uint types from ethereum_types
pub use bytes::Bytes;
pub use ethereum_types::{Address, H160, H256, U256, U512};

pub mod constants;
pub mod serde_utils;
pub mod types;
