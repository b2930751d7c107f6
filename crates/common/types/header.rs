use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use stepex_rlp::{
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

/// The subset of a parent block header the engine reads: the pre-state root,
/// and the gas numbers the EIP-1559 base-fee derivation needs. Decoded from
/// the canonical RLP header layout; the remaining fields are skipped without
/// interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    pub parent_hash: H256,
    pub state_root: H256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    /// Absent only on pre-London headers.
    pub base_fee_per_gas: Option<U256>,
}

impl HeaderFields {
    pub fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (parent_hash, decoder) = decoder.decode_field("parent_hash")?;
        let (_, decoder) = decoder.get_encoded_item()?; // ommers hash
        let (_, decoder) = decoder.get_encoded_item()?; // beneficiary
        let (state_root, decoder) = decoder.decode_field("state_root")?;
        let (_, decoder) = decoder.get_encoded_item()?; // transactions root
        let (_, decoder) = decoder.get_encoded_item()?; // receipts root
        let (_, decoder) = decoder.get_encoded_item()?; // logs bloom
        let (_, decoder) = decoder.get_encoded_item()?; // difficulty
        let (number, decoder) = decoder.decode_field("number")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (gas_used, decoder) = decoder.decode_field("gas_used")?;
        let (timestamp, decoder) = decoder.decode_field("timestamp")?;
        let (_, decoder) = decoder.get_encoded_item()?; // extra data
        let (_, decoder) = decoder.get_encoded_item()?; // mix hash / prevrandao
        let (_, mut decoder) = decoder.get_encoded_item()?; // nonce

        let mut base_fee_per_gas = None;
        if !decoder.is_done() {
            let (base_fee, rest) = decoder.decode_field("base_fee_per_gas")?;
            base_fee_per_gas = Some(base_fee);
            decoder = rest;
        }
        // headers may carry post-London trailing fields (withdrawals root,
        // blob gas); they are irrelevant here and left unread.
        let _ = decoder;

        Ok(Self {
            parent_hash,
            state_root,
            number,
            gas_limit,
            gas_used,
            timestamp,
            base_fee_per_gas,
        })
    }

    /// Produces a well-formed header RLP carrying these fields, with the
    /// unread fields zeroed. Used by tooling and tests to synthesize parent
    /// headers; real headers decode fine but do not round-trip through this.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = Encoder::new(&mut buf)
            .encode_field(&self.parent_hash)
            .encode_field(&H256::zero()) // ommers hash
            .encode_field(&Address::zero()) // beneficiary
            .encode_field(&self.state_root)
            .encode_field(&H256::zero()) // transactions root
            .encode_field(&H256::zero()) // receipts root
            .encode_field(&Bytes::from(vec![0u8; 256])) // logs bloom
            .encode_field(&U256::zero()) // difficulty
            .encode_field(&self.number)
            .encode_field(&self.gas_limit)
            .encode_field(&self.gas_used)
            .encode_field(&self.timestamp)
            .encode_field(&Bytes::new()) // extra data
            .encode_field(&H256::zero()) // mix hash
            .encode_field(&[0u8; 8]); // nonce
        match self.base_fee_per_gas {
            Some(base_fee) => encoder.encode_field(&base_fee).finish(),
            None => encoder.finish(),
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fields_from_london_header() {
        let fields = HeaderFields {
            parent_hash: H256::repeat_byte(0x01),
            state_root: H256::repeat_byte(0x02),
            number: 12_965_000,
            gas_limit: 30_000_000,
            gas_used: 15_000_000,
            timestamp: 1_628_166_822,
            base_fee_per_gas: Some(U256::from(1_000_000_000u64)),
        };
        let rlp = fields.encode();
        assert_eq!(HeaderFields::decode(&rlp).unwrap(), fields);
    }

    #[test]
    fn pre_london_header_has_no_base_fee() {
        let fields = HeaderFields {
            number: 1,
            gas_limit: 8_000_000,
            ..Default::default()
        };
        let rlp = fields.encode();
        assert_eq!(HeaderFields::decode(&rlp).unwrap().base_fee_per_gas, None);
    }
}
