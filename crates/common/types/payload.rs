use bytes::Bytes;
use ethereum_types::{Address, H256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{MAX_TRANSACTION_SIZE, MAX_TRANSACTIONS_PER_PAYLOAD};

/// The execution input of a trace: one block, stripped down to the fields the
/// engine derives the rest from. SSZ-encoded on the wire; the JSON form uses
/// 0x-prefixed hex for byte fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalExecutionPayload {
    pub parent_hash: H256,
    pub coinbase: Address,
    /// Post-merge randomness, exposed to contracts as DIFFICULTY/PREVRANDAO.
    pub random: H256,
    pub block_number: u64,
    pub gas_limit: u64,
    pub timestamp: u64,
    /// Opaque EIP-2718 envelopes.
    #[serde(with = "crate::serde_utils::bytes_vec_hex")]
    pub transactions: Vec<Bytes>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Payload too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid SSZ offset")]
    InvalidOffset,
    #[error("Payload carries {0} transactions, max is {MAX_TRANSACTIONS_PER_PAYLOAD}")]
    TooManyTransactions(usize),
    #[error("Transaction {0} exceeds the {MAX_TRANSACTION_SIZE} byte cap")]
    TransactionTooLarge(usize),
}

/// Byte size of the fixed part: five fixed fields plus the offset of the
/// transactions list.
const FIXED_PART: usize = 32 + 20 + 32 + 8 + 8 + 8 + 4;

impl MinimalExecutionPayload {
    pub fn decode_ssz(data: &[u8]) -> Result<Self, PayloadError> {
        if data.len() < FIXED_PART {
            return Err(PayloadError::TooShort(data.len()));
        }
        let parent_hash = H256::from_slice(&data[0..32]);
        let coinbase = Address::from_slice(&data[32..52]);
        let random = H256::from_slice(&data[52..84]);
        let block_number = u64::from_le_bytes(data[84..92].try_into().unwrap_or_default());
        let gas_limit = u64::from_le_bytes(data[92..100].try_into().unwrap_or_default());
        let timestamp = u64::from_le_bytes(data[100..108].try_into().unwrap_or_default());
        let txs_offset = u32::from_le_bytes(data[108..112].try_into().unwrap_or_default()) as usize;
        if txs_offset != FIXED_PART {
            return Err(PayloadError::InvalidOffset);
        }

        let transactions = decode_byte_lists(&data[txs_offset..])?;

        Ok(Self {
            parent_hash,
            coinbase,
            random,
            block_number,
            gas_limit,
            timestamp,
            transactions,
        })
    }

    pub fn encode_ssz(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_PART);
        out.extend_from_slice(self.parent_hash.as_bytes());
        out.extend_from_slice(self.coinbase.as_bytes());
        out.extend_from_slice(self.random.as_bytes());
        out.extend_from_slice(&self.block_number.to_le_bytes());
        out.extend_from_slice(&self.gas_limit.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&(FIXED_PART as u32).to_le_bytes());
        encode_byte_lists(&self.transactions, &mut out);
        out
    }
}

fn decode_byte_lists(data: &[u8]) -> Result<Vec<Bytes>, PayloadError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < 4 {
        return Err(PayloadError::InvalidOffset);
    }
    let first = u32::from_le_bytes(data[0..4].try_into().unwrap_or_default()) as usize;
    if first % 4 != 0 || first > data.len() {
        return Err(PayloadError::InvalidOffset);
    }
    let count = first / 4;
    if count > MAX_TRANSACTIONS_PER_PAYLOAD {
        return Err(PayloadError::TooManyTransactions(count));
    }

    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..count {
        let raw = &data[i * 4..i * 4 + 4];
        offsets.push(u32::from_le_bytes(raw.try_into().unwrap_or_default()) as usize);
    }
    offsets.push(data.len());

    let mut out = Vec::with_capacity(count);
    for (i, pair) in offsets.windows(2).enumerate() {
        let (start, end) = (pair[0], pair[1]);
        if start > end || end > data.len() {
            return Err(PayloadError::InvalidOffset);
        }
        if end - start > MAX_TRANSACTION_SIZE {
            return Err(PayloadError::TransactionTooLarge(i));
        }
        out.push(Bytes::copy_from_slice(&data[start..end]));
    }
    Ok(out)
}

fn encode_byte_lists(items: &[Bytes], out: &mut Vec<u8>) {
    let mut offset = items.len() * 4;
    for item in items {
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += item.len();
    }
    for item in items {
        out.extend_from_slice(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssz_round_trip() {
        let payload = MinimalExecutionPayload {
            parent_hash: H256::repeat_byte(0xaa),
            coinbase: Address::repeat_byte(0xbb),
            random: H256::repeat_byte(0xcc),
            block_number: 7,
            gas_limit: 30_000_000,
            timestamp: 1_700_000_000,
            transactions: vec![Bytes::from_static(b"\x02abc"), Bytes::new()],
        };
        let encoded = payload.encode_ssz();
        assert_eq!(MinimalExecutionPayload::decode_ssz(&encoded).unwrap(), payload);
    }

    #[test]
    fn empty_transactions() {
        let payload = MinimalExecutionPayload::default();
        let encoded = payload.encode_ssz();
        let decoded = MinimalExecutionPayload::decode_ssz(&encoded).unwrap();
        assert!(decoded.transactions.is_empty());
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(
            MinimalExecutionPayload::decode_ssz(&[0u8; 16]),
            Err(PayloadError::TooShort(16))
        ));
    }

    #[test]
    fn json_round_trip() {
        let payload = MinimalExecutionPayload {
            transactions: vec![Bytes::from_static(&[0x02, 0xff])],
            ..Default::default()
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"0x02ff\""));
        let back: MinimalExecutionPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
