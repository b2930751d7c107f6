use bytes::{BufMut, Bytes};
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use stepex_crypto::keccak::keccak_hash;
use stepex_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use thiserror::Error;

/// EIP-2718 envelope types the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxType {
    Legacy = 0x00,
    AccessList = 0x01,
    DynamicFee = 0x02,
    /// Rollup system deposit, SSZ-encoded.
    Deposit = 0x42,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxDecodeError {
    #[error("Unknown transaction envelope type: 0x{0:02x}")]
    InvalidType(u8),
    #[error("Empty transaction envelope")]
    Empty,
    #[error("Invalid destination field")]
    InvalidDestination,
    #[error("Malformed SSZ deposit transaction")]
    MalformedDeposit,
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListEntry {
    pub address: Address,
    pub storage_keys: Vec<H256>,
}

impl RLPEncode for AccessListEntry {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.address)
            .encode_field(&self.storage_keys)
            .finish();
    }
}

impl RLPDecode for AccessListEntry {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (address, decoder) = decoder.decode_field("address")?;
        let (storage_keys, decoder) = decoder.decode_field("storage_keys")?;
        let rest = decoder.finish()?;
        Ok((
            Self {
                address,
                storage_keys,
            },
            rest,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub v: U256,
    pub r: U256,
    pub s: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessListTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub access_list: Vec<AccessListEntry>,
    pub y_parity: bool,
    pub r: U256,
    pub s: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicFeeTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub access_list: Vec<AccessListEntry>,
    pub y_parity: bool,
    pub r: U256,
    pub s: U256,
}

/// Rollup system deposit, carried as SSZ rather than RLP: no signature, an
/// L1-minted balance, applied before the value transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepositTransaction {
    pub from: Address,
    pub to: Option<Address>,
    pub mint: U256,
    pub value: U256,
    pub gas_limit: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Legacy(LegacyTransaction),
    AccessList(AccessListTransaction),
    DynamicFee(DynamicFeeTransaction),
    Deposit(DepositTransaction),
}

impl Transaction {
    /// Decodes an EIP-2718 envelope: the first byte selects the payload
    /// format. Legacy transactions have no prefix; their first byte is the
    /// RLP list prefix (`0xc0..=0xfe`).
    pub fn decode_envelope(bytes: &[u8]) -> Result<Self, TxDecodeError> {
        let first = *bytes.first().ok_or(TxDecodeError::Empty)?;
        match first {
            0x01 => Ok(Self::AccessList(decode_access_list_tx(&bytes[1..])?)),
            0x02 => Ok(Self::DynamicFee(decode_dynamic_fee_tx(&bytes[1..])?)),
            0x42 => Ok(Self::Deposit(DepositTransaction::decode_ssz(&bytes[1..])?)),
            0xc0..=0xfe => Ok(Self::Legacy(decode_legacy_tx(bytes)?)),
            other => Err(TxDecodeError::InvalidType(other)),
        }
    }

    pub fn tx_type(&self) -> TxType {
        match self {
            Self::Legacy(_) => TxType::Legacy,
            Self::AccessList(_) => TxType::AccessList,
            Self::DynamicFee(_) => TxType::DynamicFee,
            Self::Deposit(_) => TxType::Deposit,
        }
    }

    /// Chain id the signature commits to, if any. Pre-EIP-155 legacy
    /// transactions commit to none.
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Self::Legacy(tx) => {
                let v = tx.v.low_u64();
                if v == 27 || v == 28 {
                    None
                } else {
                    Some((v.saturating_sub(35)) / 2)
                }
            }
            Self::AccessList(tx) => Some(tx.chain_id),
            Self::DynamicFee(tx) => Some(tx.chain_id),
            Self::Deposit(_) => None,
        }
    }

    /// The hash the signature was produced over.
    pub fn signing_hash(&self) -> H256 {
        match self {
            Self::Legacy(tx) => {
                let mut buf = Vec::new();
                let encoder = Encoder::new(&mut buf)
                    .encode_field(&tx.nonce)
                    .encode_field(&tx.gas_price)
                    .encode_field(&tx.gas_limit)
                    .encode_field(&DestinationField(tx.to))
                    .encode_field(&tx.value)
                    .encode_field(&tx.data);
                match self.chain_id() {
                    Some(chain_id) => encoder
                        .encode_field(&chain_id)
                        .encode_field(&0u8)
                        .encode_field(&0u8)
                        .finish(),
                    None => encoder.finish(),
                }
                H256(keccak_hash(&buf))
            }
            Self::AccessList(tx) => {
                let mut buf = vec![TxType::AccessList as u8];
                Encoder::new(&mut buf)
                    .encode_field(&tx.chain_id)
                    .encode_field(&tx.nonce)
                    .encode_field(&tx.gas_price)
                    .encode_field(&tx.gas_limit)
                    .encode_field(&DestinationField(tx.to))
                    .encode_field(&tx.value)
                    .encode_field(&tx.data)
                    .encode_field(&tx.access_list)
                    .finish();
                H256(keccak_hash(&buf))
            }
            Self::DynamicFee(tx) => {
                let mut buf = vec![TxType::DynamicFee as u8];
                Encoder::new(&mut buf)
                    .encode_field(&tx.chain_id)
                    .encode_field(&tx.nonce)
                    .encode_field(&tx.max_priority_fee_per_gas)
                    .encode_field(&tx.max_fee_per_gas)
                    .encode_field(&tx.gas_limit)
                    .encode_field(&DestinationField(tx.to))
                    .encode_field(&tx.value)
                    .encode_field(&tx.data)
                    .encode_field(&tx.access_list)
                    .finish();
                H256(keccak_hash(&buf))
            }
            Self::Deposit(_) => H256::zero(),
        }
    }

    /// Signature values as `(recovery_id, r, s)`. Legacy `v` folds the
    /// EIP-155 chain id back out; the caller validates the ranges.
    pub fn signature(&self) -> (U256, U256, U256) {
        match self {
            Self::Legacy(tx) => {
                let v = tx.v.low_u64();
                let recovery = if v == 27 || v == 28 {
                    v.wrapping_sub(27)
                } else {
                    v.wrapping_sub(35) % 2
                };
                (U256::from(recovery), tx.r, tx.s)
            }
            Self::AccessList(tx) => (U256::from(tx.y_parity as u8), tx.r, tx.s),
            Self::DynamicFee(tx) => (U256::from(tx.y_parity as u8), tx.r, tx.s),
            Self::Deposit(_) => (U256::zero(), U256::zero(), U256::zero()),
        }
    }
}

/// `to` encodes as a 20-byte string for calls and the empty string for
/// contract creation.
struct DestinationField(Option<Address>);

impl RLPEncode for DestinationField {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self.0 {
            Some(address) => address.encode(buf),
            None => Bytes::new().encode(buf),
        }
    }
}

fn decode_destination(raw: &Bytes) -> Result<Option<Address>, TxDecodeError> {
    match raw.len() {
        0 => Ok(None),
        20 => Ok(Some(Address::from_slice(raw))),
        _ => Err(TxDecodeError::InvalidDestination),
    }
}

fn decode_legacy_tx(bytes: &[u8]) -> Result<LegacyTransaction, TxDecodeError> {
    let decoder = Decoder::new(bytes)?;
    let (nonce, decoder) = decoder.decode_field("nonce")?;
    let (gas_price, decoder) = decoder.decode_field("gas_price")?;
    let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
    let (to_raw, decoder): (Bytes, _) = decoder.decode_field("to")?;
    let (value, decoder) = decoder.decode_field("value")?;
    let (data, decoder) = decoder.decode_field("data")?;
    let (v, decoder) = decoder.decode_field("v")?;
    let (r, decoder) = decoder.decode_field("r")?;
    let (s, decoder) = decoder.decode_field("s")?;
    decoder.finish()?;
    Ok(LegacyTransaction {
        nonce,
        gas_price,
        gas_limit,
        to: decode_destination(&to_raw)?,
        value,
        data,
        v,
        r,
        s,
    })
}

fn decode_access_list_tx(bytes: &[u8]) -> Result<AccessListTransaction, TxDecodeError> {
    let decoder = Decoder::new(bytes)?;
    let (chain_id, decoder) = decoder.decode_field("chain_id")?;
    let (nonce, decoder) = decoder.decode_field("nonce")?;
    let (gas_price, decoder) = decoder.decode_field("gas_price")?;
    let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
    let (to_raw, decoder): (Bytes, _) = decoder.decode_field("to")?;
    let (value, decoder) = decoder.decode_field("value")?;
    let (data, decoder) = decoder.decode_field("data")?;
    let (access_list, decoder) = decoder.decode_field("access_list")?;
    let (y_parity, decoder) = decoder.decode_field("y_parity")?;
    let (r, decoder) = decoder.decode_field("r")?;
    let (s, decoder) = decoder.decode_field("s")?;
    decoder.finish()?;
    Ok(AccessListTransaction {
        chain_id,
        nonce,
        gas_price,
        gas_limit,
        to: decode_destination(&to_raw)?,
        value,
        data,
        access_list,
        y_parity,
        r,
        s,
    })
}

fn decode_dynamic_fee_tx(bytes: &[u8]) -> Result<DynamicFeeTransaction, TxDecodeError> {
    let decoder = Decoder::new(bytes)?;
    let (chain_id, decoder) = decoder.decode_field("chain_id")?;
    let (nonce, decoder) = decoder.decode_field("nonce")?;
    let (max_priority_fee_per_gas, decoder) = decoder.decode_field("max_priority_fee_per_gas")?;
    let (max_fee_per_gas, decoder) = decoder.decode_field("max_fee_per_gas")?;
    let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
    let (to_raw, decoder): (Bytes, _) = decoder.decode_field("to")?;
    let (value, decoder) = decoder.decode_field("value")?;
    let (data, decoder) = decoder.decode_field("data")?;
    let (access_list, decoder) = decoder.decode_field("access_list")?;
    let (y_parity, decoder) = decoder.decode_field("y_parity")?;
    let (r, decoder) = decoder.decode_field("r")?;
    let (s, decoder) = decoder.decode_field("s")?;
    decoder.finish()?;
    Ok(DynamicFeeTransaction {
        chain_id,
        nonce,
        max_priority_fee_per_gas,
        max_fee_per_gas,
        gas_limit,
        to: decode_destination(&to_raw)?,
        value,
        data,
        access_list,
        y_parity,
        r,
        s,
    })
}

/// Fixed part: from(20) ++ to(20) ++ is_creation(1) ++ mint(32) ++ value(32)
/// ++ gas_limit(8) ++ data offset(4).
const DEPOSIT_FIXED_PART: usize = 20 + 20 + 1 + 32 + 32 + 8 + 4;

impl DepositTransaction {
    pub fn decode_ssz(data: &[u8]) -> Result<Self, TxDecodeError> {
        if data.len() < DEPOSIT_FIXED_PART {
            return Err(TxDecodeError::MalformedDeposit);
        }
        let from = Address::from_slice(&data[0..20]);
        let to_addr = Address::from_slice(&data[20..40]);
        let is_creation = match data[40] {
            0 => false,
            1 => true,
            _ => return Err(TxDecodeError::MalformedDeposit),
        };
        let mint = U256::from_little_endian(&data[41..73]);
        let value = U256::from_little_endian(&data[73..105]);
        let gas_limit = u64::from_le_bytes(data[105..113].try_into().unwrap_or_default());
        let offset = u32::from_le_bytes(data[113..117].try_into().unwrap_or_default()) as usize;
        if offset != DEPOSIT_FIXED_PART || offset > data.len() {
            return Err(TxDecodeError::MalformedDeposit);
        }
        Ok(Self {
            from,
            to: (!is_creation).then_some(to_addr),
            mint,
            value,
            gas_limit,
            data: Bytes::copy_from_slice(&data[offset..]),
        })
    }

    pub fn encode_ssz(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DEPOSIT_FIXED_PART + self.data.len());
        out.extend_from_slice(self.from.as_bytes());
        out.extend_from_slice(self.to.unwrap_or_default().as_bytes());
        out.push(self.to.is_none() as u8);
        out.extend_from_slice(&self.mint.to_little_endian());
        out.extend_from_slice(&self.value.to_little_endian());
        out.extend_from_slice(&self.gas_limit.to_le_bytes());
        out.extend_from_slice(&(DEPOSIT_FIXED_PART as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// The flattened view of a transaction after envelope decoding and signature
/// recovery, the form the step record carries through execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub signer: Address,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub destination: Address,
    pub is_contract_creation: bool,
    pub value: U256,
    #[serde(with = "crate::serde_utils::bytes_hex")]
    pub payload: Bytes,
    pub access_list: Vec<AccessListEntry>,
    /// L1-minted balance for deposit transactions, zero otherwise.
    pub mint: U256,
    pub is_deposit: bool,
}

impl NormalizedTransaction {
    /// The gas price this transaction actually pays under the given base fee.
    pub fn effective_gas_price(&self, base_fee: U256) -> U256 {
        let tip_cap = self.max_fee_per_gas.saturating_sub(base_fee);
        let tip = self.max_priority_fee_per_gas.min(tip_cap);
        base_fee.saturating_add(tip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dynamic_fee_envelope() -> Vec<u8> {
        let mut buf = vec![0x02];
        Encoder::new(&mut buf)
            .encode_field(&42u64) // chain id
            .encode_field(&7u64) // nonce
            .encode_field(&U256::from(2)) // max priority fee
            .encode_field(&U256::from(100)) // max fee
            .encode_field(&50_000u64) // gas limit
            .encode_field(&Address::repeat_byte(0x11))
            .encode_field(&U256::from(5))
            .encode_field(&Bytes::from_static(b"\xca\xfe"))
            .encode_field(&Vec::<AccessListEntry>::new())
            .encode_field(&false)
            .encode_field(&U256::from(1))
            .encode_field(&U256::from(2))
            .finish();
        buf
    }

    #[test]
    fn decodes_dynamic_fee_envelope() {
        let envelope = sample_dynamic_fee_envelope();
        let tx = Transaction::decode_envelope(&envelope).unwrap();
        let Transaction::DynamicFee(tx) = tx else {
            panic!("wrong variant");
        };
        assert_eq!(tx.chain_id, 42);
        assert_eq!(tx.nonce, 7);
        assert_eq!(tx.to, Some(Address::repeat_byte(0x11)));
        assert_eq!(tx.data.as_ref(), b"\xca\xfe");
    }

    #[test]
    fn rejects_unknown_type() {
        assert_eq!(
            Transaction::decode_envelope(&[0x05, 0x00]),
            Err(TxDecodeError::InvalidType(0x05))
        );
    }

    #[test]
    fn legacy_chain_id_folding() {
        let tx = Transaction::Legacy(LegacyTransaction {
            nonce: 0,
            gas_price: U256::one(),
            gas_limit: 21_000,
            to: Some(Address::zero()),
            value: U256::zero(),
            data: Bytes::new(),
            v: U256::from(35 + 2 * 42),
            r: U256::one(),
            s: U256::one(),
        });
        assert_eq!(tx.chain_id(), Some(42));
        let (recovery, _, _) = tx.signature();
        assert_eq!(recovery, U256::zero());
    }

    #[test]
    fn deposit_ssz_round_trip() {
        let deposit = DepositTransaction {
            from: Address::repeat_byte(0x01),
            to: Some(Address::repeat_byte(0x02)),
            mint: U256::from(1_000_000u64),
            value: U256::from(7u64),
            gas_limit: 100_000,
            data: Bytes::from_static(b"hello"),
        };
        let encoded = deposit.encode_ssz();
        assert_eq!(DepositTransaction::decode_ssz(&encoded).unwrap(), deposit);
    }

    #[test]
    fn effective_gas_price_is_capped() {
        let tx = NormalizedTransaction {
            max_fee_per_gas: U256::from(100),
            max_priority_fee_per_gas: U256::from(10),
            ..Default::default()
        };
        assert_eq!(tx.effective_gas_price(U256::from(95)), U256::from(100));
        assert_eq!(tx.effective_gas_price(U256::from(50)), U256::from(60));
    }
}
