use bytes::{BufMut, Bytes};
use ethereum_types::{Address, H256};
use serde::{Deserialize, Serialize};
use stepex_crypto::keccak::keccak_hash;
use stepex_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

use super::TxType;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    #[serde(with = "crate::serde_utils::bytes_hex")]
    pub data: Bytes,
}

impl RLPEncode for Log {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.address)
            .encode_field(&self.topics)
            .encode_field(&self.data)
            .finish();
    }
}

impl RLPDecode for Log {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (address, decoder) = decoder.decode_field("address")?;
        let (topics, decoder) = decoder.decode_field("topics")?;
        let (data, decoder) = decoder.decode_field("data")?;
        let rest = decoder.finish()?;
        Ok((
            Self {
                address,
                topics,
                data,
            },
            rest,
        ))
    }
}

/// Result of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_type: TxType,
    pub succeeded: bool,
    /// Cumulative gas used by this and all previous transactions in the block.
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn new(tx_type: TxType, succeeded: bool, cumulative_gas_used: u64, logs: Vec<Log>) -> Self {
        Self {
            tx_type,
            succeeded,
            cumulative_gas_used,
            logs,
        }
    }

    /// The typed-envelope encoding: non-legacy receipts are prefixed by their
    /// transaction type byte.
    pub fn encode_inner(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if self.tx_type != TxType::Legacy {
            buf.push(self.tx_type as u8);
        }
        Encoder::new(&mut buf)
            .encode_field(&self.succeeded)
            .encode_field(&self.cumulative_gas_used)
            .encode_field(&self.logs)
            .finish();
        buf
    }

    /// Hash of the typed encoding; the form the step tree commits to.
    pub fn hash(&self) -> H256 {
        H256(keccak_hash(self.encode_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_receipt_is_prefixed() {
        let receipt = Receipt::new(TxType::DynamicFee, true, 21_000, vec![]);
        assert_eq!(receipt.encode_inner()[0], 0x02);
        let legacy = Receipt::new(TxType::Legacy, true, 21_000, vec![]);
        assert!(legacy.encode_inner()[0] >= 0xc0);
    }

    #[test]
    fn log_round_trip() {
        let log = Log {
            address: Address::repeat_byte(0x77),
            topics: vec![H256::repeat_byte(0x01), H256::repeat_byte(0x02)],
            data: Bytes::from_static(b"payload"),
        };
        let encoded = log.encode_to_vec();
        assert_eq!(Log::decode(&encoded).unwrap(), log);
    }
}
