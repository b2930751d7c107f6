use bytes::Bytes;
use ethereum_types::{H160, H256, U256};

use super::{
    constants::{RLP_EMPTY_LIST, RLP_NULL},
    error::RLPDecodeError,
};

/// Max payload size accepted when decoding.
/// While technically any size is RLP spec-compliant, nothing the engine
/// consumes (MPT nodes, headers, transactions) comes close, so larger
/// payloads are either bugs or malicious witness data.
const MAX_RLP_BYTES: usize = 1024 * 1024 * 1024;

/// Trait for decoding RLP encoded slices of data.
/// Implementors provide [`decode_unfinished`](RLPDecode::decode_unfinished),
/// which returns the decoded value along with the remaining bytes;
/// consumers normally call [`decode`](RLPDecode::decode).
pub trait RLPDecode: Sized {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok(decoded)
    }
}

impl RLPDecode for bool {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let first = buf.first().ok_or(RLPDecodeError::InvalidLength)?;
        let value = match *first {
            RLP_NULL => false,
            0x01 => true,
            b => return Err(RLPDecodeError::MalformedBoolean(b)),
        };
        Ok((value, &buf[1..]))
    }
}

impl RLPDecode for u8 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded: [u8; 1] = static_left_pad(bytes)?;
        Ok((padded[0], rest))
    }
}

impl RLPDecode for u16 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((u16::from_be_bytes(static_left_pad(bytes)?), rest))
    }
}

impl RLPDecode for u32 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((u32::from_be_bytes(static_left_pad(bytes)?), rest))
    }
}

impl RLPDecode for u64 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((u64::from_be_bytes(static_left_pad(bytes)?), rest))
    }
}

impl RLPDecode for usize {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((usize::from_be_bytes(static_left_pad(bytes)?), rest))
    }
}

impl RLPDecode for U256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        if bytes.len() > 32 || (!bytes.is_empty() && bytes[0] == 0) {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((U256::from_big_endian(bytes), rest))
    }
}

impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let value = bytes.try_into().map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((Bytes::copy_from_slice(bytes), rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest): ([u8; 32], _) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H256(value), rest))
    }
}

impl RLPDecode for H160 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest): ([u8; 20], _) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H160(value), rest))
    }
}

// A `Vec<T>` is interpreted as a list of elements of the same type. Byte
// strings decode via `Bytes` or the fixed-size array impls.
impl<T: RLPDecode> RLPDecode for Vec<T> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (is_list, mut payload, remaining) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        let mut out = Vec::new();
        while !payload.is_empty() {
            let (item, rest) = T::decode_unfinished(payload)?;
            out.push(item);
            payload = rest;
        }
        Ok((out, remaining))
    }
}

/// Splits off the first RLP item of `data`.
/// Returns `(is_list, payload_without_prefix, remaining_bytes)`.
pub fn decode_rlp_item(data: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let first_byte = *data.first().ok_or(RLPDecodeError::InvalidLength)?;

    match first_byte {
        0..=0x7f => Ok((false, &data[..1], &data[1..])),
        0x80..=0xb7 => {
            let length = (first_byte - RLP_NULL) as usize;
            if data.len() < length + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((false, &data[1..length + 1], &data[length + 1..]))
        }
        0xb8..=0xbf => {
            let ll = (first_byte - 0xb7) as usize;
            let (payload, rest) = split_long_payload(data, ll)?;
            Ok((false, payload, rest))
        }
        RLP_EMPTY_LIST..=0xf7 => {
            let length = (first_byte - RLP_EMPTY_LIST) as usize;
            if data.len() < length + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((true, &data[1..length + 1], &data[length + 1..]))
        }
        0xf8..=0xff => {
            let ll = (first_byte - 0xf7) as usize;
            let (payload, rest) = split_long_payload(data, ll)?;
            Ok((true, payload, rest))
        }
    }
}

fn split_long_payload(data: &[u8], ll: usize) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    if data.len() < ll + 1 {
        return Err(RLPDecodeError::InvalidLength);
    }
    let length = usize::from_be_bytes(static_left_pad(&data[1..ll + 1])?);
    if length > MAX_RLP_BYTES || data.len() < ll + length + 1 {
        return Err(RLPDecodeError::InvalidLength);
    }
    Ok((&data[ll + 1..ll + length + 1], &data[ll + length + 1..]))
}

/// Like [`decode_rlp_item`] but keeps the item's prefix attached.
/// Returns `(item_with_prefix, remaining_bytes)`.
pub fn get_item_with_prefix(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, _, rest) = decode_rlp_item(data)?;
    let consumed = data.len() - rest.len();
    Ok((&data[..consumed], rest))
}

/// Decodes the payload of an RLP string item, rejecting lists.
pub fn decode_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (is_list, payload, rest) = decode_rlp_item(data)?;
    if is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    Ok((payload, rest))
}

/// Pads a slice of bytes with zeros on the left to make it a fixed size slice.
/// The size of the data must be less than or equal to the size of the output array.
pub fn static_left_pad<const N: usize>(data: &[u8]) -> Result<[u8; N], RLPDecodeError> {
    let mut result = [0; N];
    if data.is_empty() {
        return Ok(result);
    }
    if data[0] == 0 {
        return Err(RLPDecodeError::MalformedData);
    }
    if data.len() > N {
        return Err(RLPDecodeError::InvalidLength);
    }
    result[N - data.len()..].copy_from_slice(data);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode;

    #[test]
    fn integer_round_trip() {
        for v in [0u64, 1, 0x7f, 0x80, 0xff, 0x100, u64::MAX] {
            let encoded = encode(v);
            assert_eq!(u64::decode(&encoded).unwrap(), v);
        }
    }

    #[test]
    fn reject_leading_zero_integers() {
        assert!(u64::decode(&[0x82, 0x00, 0x01]).is_err());
    }

    #[test]
    fn bytes_round_trip() {
        for len in [0usize, 1, 55, 56, 300] {
            let data = Bytes::from(vec![0x42u8; len]);
            let encoded = encode(&data);
            assert_eq!(Bytes::decode(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn item_with_prefix_spans_whole_item() {
        let encoded = encode(Bytes::from(vec![0x13u8; 70]));
        let mut buf = encoded.clone();
        buf.extend_from_slice(&[1, 2, 3]);
        let (item, rest) = get_item_with_prefix(&buf).unwrap();
        assert_eq!(item, encoded.as_slice());
        assert_eq!(rest, &[1, 2, 3]);
    }

    #[test]
    fn vec_of_hashes_round_trip() {
        let hashes = vec![H256::repeat_byte(1), H256::repeat_byte(2)];
        let encoded = encode(&hashes);
        assert_eq!(Vec::<H256>::decode(&encoded).unwrap(), hashes);
    }
}
