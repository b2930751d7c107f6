//! Helpers for the node-level RLP handling the trie engine needs: an MPT node
//! is decoded as a flat sequence of raw element slices (prefix included), not
//! as typed fields, because child slots may hold either a 32-byte hash string
//! or a small embedded node list.

use super::{
    constants::RLP_EMPTY_LIST,
    decode::{decode_rlp_item, get_item_with_prefix},
    encode::encode_length,
    error::RLPDecodeError,
};

/// Splits an RLP-encoded trie node into its raw elements, each slice keeping
/// its own RLP prefix. Yields 17 elements for a branch, 2 for a leaf or
/// extension, and 0 for the empty node (represented by an empty byte string).
pub fn decode_node_items(data: &[u8]) -> Result<Vec<&[u8]>, RLPDecodeError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let (is_list, mut payload, remaining) = decode_rlp_item(data)?;
    if !is_list {
        return Err(RLPDecodeError::UnexpectedString);
    }
    if !remaining.is_empty() {
        return Err(RLPDecodeError::InvalidLength);
    }
    let mut items = Vec::with_capacity(17);
    while !payload.is_empty() {
        let (item, rest) = get_item_with_prefix(payload)?;
        items.push(item);
        payload = rest;
    }
    if items.len() != 2 && items.len() != 17 {
        return Err(RLPDecodeError::InvalidNodeItemCount(items.len()));
    }
    Ok(items)
}

/// Strips the RLP prefix of a single element (string or list), leaving the
/// bare payload.
pub fn item_payload(item: &[u8]) -> Result<&[u8], RLPDecodeError> {
    let (_, payload, _) = decode_rlp_item(item)?;
    Ok(payload)
}

/// Whether a raw element is an RLP list (an embedded node) rather than a
/// string (a hash reference or a value).
pub fn is_list_item(item: &[u8]) -> bool {
    item.first().is_some_and(|b| *b >= RLP_EMPTY_LIST)
}

/// Encodes a byte string with its RLP string prefix. The empty string encodes
/// as `0x80`, which is also how empty branch slots are stored.
pub fn wrap_bytes(payload: &[u8]) -> Vec<u8> {
    if payload.len() == 1 && payload[0] <= 0x7f {
        return payload.to_vec();
    }
    let mut out = Vec::with_capacity(payload.len() + 9);
    encode_length(payload.len(), 0x80, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Concatenates already-encoded elements and adds the list prefix, producing
/// a complete RLP node.
pub fn wrap_list<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(|i| i.as_ref().len()).sum();
    let mut out = Vec::with_capacity(payload_len + 9);
    encode_length(payload_len, RLP_EMPTY_LIST, &mut out);
    for item in items {
        out.extend_from_slice(item.as_ref());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_item_node_round_trip() {
        let node = wrap_list(&[wrap_bytes(&[0x20, 0xab]), wrap_bytes(b"value")]);
        let items = decode_node_items(&node).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(item_payload(items[0]).unwrap(), &[0x20, 0xab]);
        assert_eq!(item_payload(items[1]).unwrap(), b"value");
    }

    #[test]
    fn branch_node_with_empty_slots() {
        let mut slots: Vec<Vec<u8>> = vec![wrap_bytes(&[]); 17];
        slots[4] = wrap_bytes(&[0x11; 32]);
        let node = wrap_list(&slots);
        let items = decode_node_items(&node).unwrap();
        assert_eq!(items.len(), 17);
        assert!(item_payload(items[0]).unwrap().is_empty());
        assert_eq!(item_payload(items[4]).unwrap(), &[0x11; 32]);
    }

    #[test]
    fn empty_node_has_no_items() {
        assert!(decode_node_items(&[]).unwrap().is_empty());
    }

    #[test]
    fn embedded_list_detected() {
        let embedded = wrap_list(&[wrap_bytes(&[0x35]), wrap_bytes(b"v")]);
        assert!(is_list_item(&embedded));
        assert!(!is_list_item(&wrap_bytes(&[0x12; 32])));
    }

    #[test]
    fn rejects_bad_item_count() {
        let node = wrap_list(&[wrap_bytes(b"a"), wrap_bytes(b"b"), wrap_bytes(b"c")]);
        assert!(matches!(
            decode_node_items(&node),
            Err(RLPDecodeError::InvalidNodeItemCount(3))
        ));
    }
}
