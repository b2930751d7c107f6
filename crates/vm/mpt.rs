//! Hash-addressed Merkle-Patricia-Trie engine, one tree node per step.
//!
//! Reads walk top-down, recording the visited path as a chain of
//! `parent_node_step` references. Writes and deletes first run that read pass
//! to anchor a trusted path, then bubble the change back up the chain,
//! re-hashing every ancestor. Collapsing a branch after a deletion grafts the
//! surviving child onto the branch's parent in two half-steps.
//!
//! Node references follow the MPT rule: an RLP node shorter than 32 bytes is
//! embedded in its parent, anything else is referenced by its keccak hash.

use ethereum_types::{H256, U256};
use stepex_rlp::node::{decode_node_items, is_list_item, item_payload, wrap_bytes, wrap_list};

use crate::{
    errors::VmError,
    step::Step,
    trace::StepsTrace,
};

/// Which trie a lookup operates on. The node DB is shared (all nodes are
/// content-addressed), but retrieval maps to different source calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TreeSource {
    #[default]
    WorldAccounts = 0x00,
    AccountStorage = 0x01,
    Transactions = 0x02,
    Receipts = 0x03,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MptMode {
    /// Top-down traversal towards the lookup key.
    Reading = 0x00,
    /// Bubbling a changed child reference up the anchored path.
    Writing = 0x01,
    /// Bubbling a removal up the anchored path.
    Deleting = 0x02,
    /// First graft half-step: open the surviving child, learn its path.
    GraftingA = 0x03,
    /// Second half-step, attach under the old branch's parent. The surviving
    /// child's terminating flag picks the variant.
    GraftingBTerminating = 0x04,
    GraftingBContinuing = 0x05,

    StartingRead = 0x10,
    StartingWrite = 0x11,
    StartingDelete = 0x12,

    // Writes and deletes anchor with a full read pass first; these pivot
    // from the read into the mutating phase.
    ReadyWrite = 0x21,
    ReadyDelete = 0x22,

    ReturningRead = 0x30,
    ReturningWrite = 0x31,
    ReturningDelete = 0x32,

    #[default]
    Inactive = 0xf0,
    /// Result available; the caller resets to Inactive after consuming it.
    Done = 0xff,
}

/// Marker stored in `fail_lookup` while bubbling, after the anchor step has
/// consumed the read outcome.
const BUBBLING: u8 = 0xff;

pub const FAIL_NONE: u8 = 0;
pub const FAIL_NULL_NODE: u8 = 1;
pub const FAIL_LEAF_SIBLING: u8 = 2;
pub const FAIL_LEAF_SHORT: u8 = 3;
pub const FAIL_PATH_PAST_KEY: u8 = 4;
pub const FAIL_EXTENSION_MISMATCH: u8 = 6;

// === Nibble arithmetic ===
// Keys and path segments are left-aligned in a U256: the first nibble of the
// path is the most significant nibble of the word.

pub fn shl_nibbles(value: U256, nibbles: u64) -> U256 {
    if nibbles >= 64 {
        U256::zero()
    } else {
        value << (nibbles as usize * 4)
    }
}

pub fn shr_nibbles(value: U256, nibbles: u64) -> U256 {
    if nibbles >= 64 {
        U256::zero()
    } else {
        value >> (nibbles as usize * 4)
    }
}

/// The `i`-th nibble from the most significant end.
pub fn nibble_at(value: U256, i: u64) -> u8 {
    (shr_nibbles(value, 63 - i).low_u64() & 0x0f) as u8
}

/// Keeps the first `nibbles` nibbles, zeroing the rest.
pub fn mask_nibbles(value: U256, nibbles: u64) -> U256 {
    if nibbles >= 64 {
        value
    } else {
        shl_nibbles(shr_nibbles(value, 64 - nibbles), 64 - nibbles)
    }
}

/// Longest common prefix of two left-aligned nibble strings.
pub fn common_nibble_prefix(a: U256, b: U256, a_len: u64, b_len: u64) -> (U256, u64) {
    let max_common = a_len.min(b_len);
    let mut prefix = U256::zero();
    for i in 0..max_common {
        let nib = nibble_at(a, i);
        if nib != nibble_at(b, i) {
            return (prefix, i);
        }
        prefix = prefix | shl_nibbles(U256::from(nib), 63 - i);
    }
    (prefix, max_common)
}

/// Decodes a hex-prefix encoded path: the flag nibble carries the parity and
/// the terminating (leaf) bit; odd paths pack their first nibble next to it.
pub fn decode_path(encoded: &[u8]) -> Result<(bool, U256, u64), VmError> {
    if encoded.is_empty() {
        return Ok((false, U256::zero(), 0));
    }
    if encoded.len() > 33 {
        return Err(VmError::CorruptTrie("encoded path too long"));
    }
    let flag = (encoded[0] & 0xf0) >> 4;
    if flag & 0b1100 != 0 {
        return Err(VmError::CorruptTrie("invalid path flag nibble"));
    }
    let terminating = flag & 0b0010 != 0;
    let even = flag & 0b0001 == 0;

    let mut buf = [0u8; 32];
    buf[..encoded.len() - 1].copy_from_slice(&encoded[1..]);
    let mut path = U256::from_big_endian(&buf);
    let mut nibble_len = (encoded.len() as u64 - 1) * 2;
    if !even {
        if nibble_len >= 64 {
            return Err(VmError::CorruptTrie("odd path overflows key width"));
        }
        path = (path >> 4) | (U256::from(encoded[0] & 0x0f) << 252);
        nibble_len += 1;
    }
    Ok((terminating, path, nibble_len))
}

pub fn encode_path(path: U256, nibble_len: u64, terminating: bool) -> Vec<u8> {
    let mut first_byte = 0u8;
    let mut path = path;
    let mut nibble_len = nibble_len;
    if nibble_len % 2 == 1 {
        first_byte |= 0x10 | nibble_at(path, 0);
        path = shl_nibbles(path, 1);
        nibble_len -= 1;
    }
    if terminating {
        first_byte |= 0x20;
    }
    let mut out = vec![first_byte];
    let be = path.to_big_endian();
    out.extend_from_slice(&be[..(nibble_len / 2) as usize]);
    out
}

// === Node reference plumbing ===

/// Resolves a ≤32-byte node reference to the node's RLP: embedded references
/// are the node, 32-byte references go through the hash-addressed DB.
fn resolve_node(trac: &dyn StepsTrace, step: &Step) -> Result<Vec<u8>, VmError> {
    let reference = &step.mpt_work.current_root;
    if reference.len() == 32 {
        trac.mpt_node(
            step.mpt_work.tree_source,
            step.mpt_work.start_reference,
            H256::from_slice(reference),
        )
    } else {
        Ok(reference.clone())
    }
}

/// Extracts a child reference out of a raw node element: an embedded node
/// (list), a 32-byte hash, or the null reference.
fn child_ref(item: &[u8]) -> Result<Vec<u8>, VmError> {
    if is_list_item(item) {
        return Ok(item.to_vec());
    }
    let payload = item_payload(item)?;
    match payload.len() {
        0 => Ok(Vec::new()),
        32 => Ok(payload.to_vec()),
        _ => Err(VmError::CorruptTrie("child reference is not hash or embedded node")),
    }
}

/// Encodes a node reference as an element of its parent.
fn ref_item(reference: &[u8]) -> Vec<u8> {
    if reference.len() < 32 && is_list_item(reference) {
        reference.to_vec()
    } else {
        wrap_bytes(reference)
    }
}

/// Builds a node from its encoded elements and returns its reference,
/// storing it in the node DB when it is hash-addressed.
fn make_node<T: AsRef<[u8]>>(trac: &dyn StepsTrace, items: &[T]) -> Vec<u8> {
    let rlp = wrap_list(items);
    if rlp.len() >= 32 {
        trac.put_mpt_node(&rlp).as_bytes().to_vec()
    } else {
        rlp
    }
}

fn empty_branch_items() -> Vec<Vec<u8>> {
    vec![wrap_bytes(&[]); 17]
}

fn count_children(items: &[Vec<u8>]) -> Result<(usize, Option<usize>), VmError> {
    let mut count = 0;
    let mut last_index = None;
    for (i, item) in items.iter().enumerate() {
        if !item_payload(item)?.is_empty() || is_list_item(item) {
            count += 1;
            last_index = Some(i);
        }
    }
    Ok((count, last_index))
}

// === The step machine ===

pub fn mpt_work_proc(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    match last.mpt_work.mode {
        MptMode::StartingRead => start(last, MptMode::ReturningRead),
        MptMode::StartingWrite => {
            // the anchoring read reuses the value field, so the payload to
            // write parks in write_root until the pivot
            let mut next = start(last, MptMode::ReadyWrite)?;
            next.mpt_work.write_root = last.mpt_work.value.clone();
            Ok(next)
        }
        MptMode::StartingDelete => start(last, MptMode::ReadyDelete),
        MptMode::Reading => read_step(trac),
        MptMode::ReadyWrite => {
            let mut next = pivot(last, MptMode::Writing, MptMode::ReturningWrite)?;
            next.mpt_work.value = last.mpt_work.write_root.clone();
            next.mpt_work.write_root = Vec::new();
            Ok(next)
        }
        MptMode::ReadyDelete => {
            if last.mpt_work.fail_lookup != FAIL_NONE {
                return Err(VmError::CorruptTrie("deleting a key that is not present"));
            }
            pivot(last, MptMode::Deleting, MptMode::ReturningDelete)
        }
        MptMode::Writing => write_step(trac),
        MptMode::Deleting => delete_step(trac),
        MptMode::GraftingA => graft_a_step(trac),
        MptMode::GraftingBTerminating | MptMode::GraftingBContinuing => graft_b_step(trac),
        MptMode::ReturningRead => return_read(trac),
        MptMode::ReturningWrite | MptMode::ReturningDelete => return_mutation(trac),
        MptMode::Inactive | MptMode::Done => {
            Err(VmError::Internal("MPT work dispatched while inactive"))
        }
    }
}

/// Seeds the read pass shared by all three operations.
fn start(last: &Step, on_finish: MptMode) -> Result<Step, VmError> {
    let mut next = last.clone();
    next.mpt_work.mode = MptMode::Reading;
    next.mpt_work.mode_on_finish = on_finish;
    next.mpt_work.fail_lookup = FAIL_NONE;
    next.mpt_work.lookup_nibble_depth = 0;
    next.mpt_work.parent_node_step = None;
    next.mpt_work.graft_key_segment = U256::zero();
    next.mpt_work.graft_key_nibbles = 0;
    Ok(next)
}

/// Switches from the anchoring read into the mutating phase.
fn pivot(last: &Step, mode: MptMode, on_finish: MptMode) -> Result<Step, VmError> {
    let mut next = last.clone();
    next.mpt_work.mode = mode;
    next.mpt_work.mode_on_finish = on_finish;
    Ok(next)
}

fn finish_read(next: &mut Step, fail: u8, value: Vec<u8>) {
    next.mpt_work.fail_lookup = fail;
    next.mpt_work.value = value;
    next.mpt_work.mode = next.mpt_work.mode_on_finish;
}

fn read_step(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let work = &last.mpt_work;
    let node = resolve_node(trac, last)?;
    let items: Vec<Vec<u8>> = decode_node_items(&node)?
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();

    let depth = work.lookup_nibble_depth;
    let remainder = shl_nibbles(work.lookup_key, depth);
    let remaining = work.lookup_key_nibbles - depth;

    let mut next = last.clone();
    next.mpt_work.parent_node_step = Some(trac.last_ref());

    match items.len() {
        0 => finish_read(&mut next, FAIL_NULL_NODE, Vec::new()),
        2 => {
            let (terminating, path, path_len) = decode_path(item_payload(&items[0])?)?;
            if terminating {
                if path_len == remaining && mask_nibbles(remainder, path_len) == path {
                    let value = item_payload(&items[1])?.to_vec();
                    finish_read(&mut next, FAIL_NONE, value);
                } else if path_len == remaining {
                    finish_read(&mut next, FAIL_LEAF_SIBLING, Vec::new());
                } else if path_len < remaining {
                    finish_read(&mut next, FAIL_LEAF_SHORT, Vec::new());
                } else {
                    finish_read(&mut next, FAIL_PATH_PAST_KEY, Vec::new());
                }
            } else if path_len > remaining {
                finish_read(&mut next, FAIL_PATH_PAST_KEY, Vec::new());
            } else if mask_nibbles(remainder, path_len) == path {
                // on our path: expand into the extension's child
                next.mpt_work.current_root = child_ref(&items[1])?;
                next.mpt_work.lookup_nibble_depth = depth + path_len;
            } else {
                finish_read(&mut next, FAIL_EXTENSION_MISMATCH, Vec::new());
            }
        }
        17 => {
            if remaining == 0 {
                let value = item_payload(&items[16])?;
                if value.is_empty() {
                    finish_read(&mut next, FAIL_NULL_NODE, Vec::new());
                } else {
                    finish_read(&mut next, FAIL_NONE, value.to_vec());
                }
            } else {
                let nib = nibble_at(remainder, 0) as usize;
                let child = child_ref(&items[nib])?;
                if child.is_empty() {
                    finish_read(&mut next, FAIL_NULL_NODE, Vec::new());
                } else {
                    next.mpt_work.current_root = child;
                    next.mpt_work.lookup_nibble_depth = depth + 1;
                }
            }
        }
        _ => return Err(VmError::CorruptTrie("unexpected node arity")),
    }
    Ok(next)
}

/// Pops the parent chain one entry, carrying the in-flight mutation along.
fn pop_chain(trac: &dyn StepsTrace, last: &Step) -> Result<Option<Step>, VmError> {
    let Some(parent_ref) = last.mpt_work.parent_node_step else {
        return Ok(None);
    };
    let content = trac.by_ref(&parent_ref)?;
    let mut next = content.clone();
    next.mpt_work.mode = last.mpt_work.mode;
    next.mpt_work.mode_on_finish = last.mpt_work.mode_on_finish;
    next.mpt_work.value = last.mpt_work.value.clone();
    next.mpt_work.fail_lookup = BUBBLING;
    next.mpt_work.graft_key_segment = last.mpt_work.graft_key_segment;
    next.mpt_work.graft_key_nibbles = last.mpt_work.graft_key_nibbles;
    Ok(Some(next))
}

fn write_step(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let anchor = last.mpt_work.fail_lookup != BUBBLING;

    let Some(mut next) = pop_chain(trac, last)? else {
        // bubbled past the root: the last produced reference is the new root
        let mut next = last.clone();
        next.mpt_work.mode = last.mpt_work.mode_on_finish;
        next.mpt_work.fail_lookup = FAIL_NONE;
        return Ok(next);
    };
    let node = resolve_node(trac, &next)?;
    let items: Vec<Vec<u8>> = decode_node_items(&node)?
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();

    let depth = next.mpt_work.lookup_nibble_depth;
    let key = next.mpt_work.lookup_key;
    let key_nibbles = next.mpt_work.lookup_key_nibbles;
    let remainder = shl_nibbles(key, depth);
    let remaining = key_nibbles - depth;

    let new_ref = if anchor {
        anchor_write(trac, &next, &items, remainder, remaining, last.mpt_work.fail_lookup)?
    } else {
        substitute_child(trac, &items, remainder, remaining, &last.mpt_work.current_root)?
    };
    next.mpt_work.current_root = new_ref;
    Ok(next)
}

/// First write step: place the value where the read pass ended. The read
/// outcome code selects between value replacement, slot fill and the
/// branch-split algorithm.
fn anchor_write(
    trac: &dyn StepsTrace,
    step: &Step,
    items: &[Vec<u8>],
    remainder: U256,
    remaining: u64,
    fail: u8,
) -> Result<Vec<u8>, VmError> {
    let value_item = wrap_bytes(&step.mpt_work.value);
    match items.len() {
        0 => {
            // the spot is empty: a fresh leaf carries the whole remaining key
            let path = encode_path(remainder, remaining, true);
            Ok(make_node(trac, &[wrap_bytes(&path), value_item]))
        }
        2 => {
            if fail == FAIL_NONE {
                // exact hit: rewrite the leaf with the new value
                return Ok(make_node(trac, &[items[0].clone(), value_item]));
            }
            let (terminating, path, path_len) = decode_path(item_payload(&items[0])?)?;
            branch_split(
                trac,
                remainder,
                remaining,
                path,
                path_len,
                terminating,
                &items[1],
                &step.mpt_work.value,
            )
        }
        17 => {
            let mut items = items.to_vec();
            if remaining == 0 {
                items[16] = value_item;
            } else {
                let nib = nibble_at(remainder, 0) as usize;
                let path = encode_path(shl_nibbles(remainder, 1), remaining - 1, true);
                let leaf = make_node(trac, &[wrap_bytes(&path), value_item]);
                items[nib] = ref_item(&leaf);
            }
            Ok(make_node(trac, &items))
        }
        _ => Err(VmError::CorruptTrie("unexpected node arity")),
    }
}

/// Splits a leaf or extension that diverges from the key: both sides land in
/// a fresh branch, wrapped in an extension when they share a prefix.
#[allow(clippy::too_many_arguments)]
fn branch_split(
    trac: &dyn StepsTrace,
    remainder: U256,
    remaining: u64,
    path: U256,
    path_len: u64,
    terminating: bool,
    existing_inner: &[u8],
    value: &[u8],
) -> Result<Vec<u8>, VmError> {
    let (prefix, prefix_len) = common_nibble_prefix(remainder, path, remaining, path_len);

    let mut branch = empty_branch_items();

    // key side
    if remaining == prefix_len {
        branch[16] = wrap_bytes(value);
    } else {
        let nib = nibble_at(remainder, prefix_len) as usize;
        let tail = shl_nibbles(remainder, prefix_len + 1);
        let path_enc = encode_path(tail, remaining - prefix_len - 1, true);
        let leaf = make_node(trac, &[wrap_bytes(&path_enc), wrap_bytes(value)]);
        branch[nib] = ref_item(&leaf);
    }

    // existing side
    if path_len == prefix_len {
        // an exhausted path can only belong to a leaf; extensions on the
        // lookup path would have been descended through
        branch[16] = existing_inner.to_vec();
    } else {
        let nib = nibble_at(path, prefix_len) as usize;
        let tail_len = path_len - prefix_len - 1;
        if !terminating && tail_len == 0 {
            // a one-nibble extension dissolves into the branch slot
            branch[nib] = existing_inner.to_vec();
        } else {
            let tail = shl_nibbles(path, prefix_len + 1);
            let path_enc = encode_path(tail, tail_len, terminating);
            let node = make_node(trac, &[wrap_bytes(&path_enc), existing_inner.to_vec()]);
            branch[nib] = ref_item(&node);
        }
    }

    let branch_ref = make_node(trac, &branch);
    if prefix_len > 0 {
        let ext_path = encode_path(prefix, prefix_len, false);
        Ok(make_node(trac, &[wrap_bytes(&ext_path), ref_item(&branch_ref)]))
    } else {
        Ok(branch_ref)
    }
}

/// Bubbling write step: the ancestor's reference to the child we came from is
/// replaced and the node re-hashed.
fn substitute_child(
    trac: &dyn StepsTrace,
    items: &[Vec<u8>],
    remainder: U256,
    remaining: u64,
    child: &[u8],
) -> Result<Vec<u8>, VmError> {
    match items.len() {
        2 => Ok(make_node(trac, &[items[0].clone(), ref_item(child)])),
        17 => {
            let mut items = items.to_vec();
            if remaining == 0 {
                return Err(VmError::CorruptTrie("bubbled into a branch value slot"));
            }
            let nib = nibble_at(remainder, 0) as usize;
            if child.is_empty() {
                items[nib] = wrap_bytes(&[]);
            } else {
                items[nib] = ref_item(child);
            }
            Ok(make_node(trac, &items))
        }
        _ => Err(VmError::CorruptTrie("unexpected node arity")),
    }
}

fn delete_step(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let anchor = last.mpt_work.fail_lookup != BUBBLING;

    let Some(mut next) = pop_chain(trac, last)? else {
        // deleted the last entry: the trie is empty now
        let mut next = last.clone();
        next.mpt_work.mode = last.mpt_work.mode_on_finish;
        next.mpt_work.fail_lookup = FAIL_NONE;
        next.mpt_work.current_root = Vec::new();
        return Ok(next);
    };
    let node = resolve_node(trac, &next)?;
    let items: Vec<Vec<u8>> = decode_node_items(&node)?
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();

    let depth = next.mpt_work.lookup_nibble_depth;
    let remainder = shl_nibbles(next.mpt_work.lookup_key, depth);
    let remaining = next.mpt_work.lookup_key_nibbles - depth;

    match items.len() {
        2 => {
            let (terminating, _, _) = decode_path(item_payload(&items[0])?)?;
            if anchor {
                if !terminating {
                    return Err(VmError::Internal("delete anchored on an extension"));
                }
                // the leaf disappears; the absence bubbles up
                next.mpt_work.current_root = Vec::new();
            } else if last.mpt_work.current_root.is_empty() {
                // the extension's only child vanished, so does the extension
                next.mpt_work.current_root = Vec::new();
            } else {
                next.mpt_work.current_root =
                    substitute_child(trac, &items, remainder, remaining, &last.mpt_work.current_root)?;
                next.mpt_work.mode = MptMode::Writing;
            }
            Ok(next)
        }
        17 => {
            let mut items = items.to_vec();
            if anchor && remaining == 0 {
                items[16] = wrap_bytes(&[]);
            } else if anchor {
                return Err(VmError::Internal("delete anchored on a branch child"));
            } else {
                let nib = nibble_at(remainder, 0) as usize;
                if last.mpt_work.current_root.is_empty() {
                    items[nib] = wrap_bytes(&[]);
                } else {
                    // the subtree shrank but survives: plain write from here
                    items[nib] = ref_item(&last.mpt_work.current_root);
                    next.mpt_work.current_root = make_node(trac, &items);
                    next.mpt_work.mode = MptMode::Writing;
                    return Ok(next);
                }
            }

            let (count, last_index) = count_children(&items)?;
            match (count, last_index) {
                (0, _) => {
                    // branch fully emptied; its absence bubbles further
                    next.mpt_work.current_root = Vec::new();
                    Ok(next)
                }
                (1, Some(16)) => {
                    // only the value slot survives: collapse to a leaf with
                    // an empty path and bubble it as a write
                    let value = item_payload(&items[16])?.to_vec();
                    let path = encode_path(U256::zero(), 0, true);
                    next.mpt_work.current_root =
                        make_node(trac, &[wrap_bytes(&path), wrap_bytes(&value)]);
                    next.mpt_work.mode = MptMode::Writing;
                    Ok(next)
                }
                (1, Some(nib)) => {
                    // a single child survives: graft it onto our parent,
                    // starting with the nibble that addressed it
                    next.mpt_work.current_root = child_ref(&items[nib])?;
                    next.mpt_work.graft_key_segment = shl_nibbles(U256::from(nib as u64), 63);
                    next.mpt_work.graft_key_nibbles = 1;
                    next.mpt_work.mode = MptMode::GraftingA;
                    Ok(next)
                }
                _ => {
                    next.mpt_work.current_root = make_node(trac, &items);
                    next.mpt_work.mode = MptMode::Writing;
                    Ok(next)
                }
            }
        }
        _ => Err(VmError::CorruptTrie("unexpected node arity during delete")),
    }
}

/// Opens the surviving child of a collapsed branch and folds any path it
/// carries into the graft segment.
fn graft_a_step(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let node = resolve_node(trac, last)?;
    let items: Vec<Vec<u8>> = decode_node_items(&node)?
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();

    let mut next = last.clone();
    match items.len() {
        2 => {
            let (terminating, path, path_len) = decode_path(item_payload(&items[0])?)?;
            let segment = last.mpt_work.graft_key_segment
                | shr_nibbles(path, last.mpt_work.graft_key_nibbles);
            next.mpt_work.graft_key_segment = segment;
            next.mpt_work.graft_key_nibbles = last.mpt_work.graft_key_nibbles + path_len;
            if terminating {
                next.mpt_work.value = item_payload(&items[1])?.to_vec();
                next.mpt_work.mode = MptMode::GraftingBTerminating;
            } else {
                next.mpt_work.current_root = child_ref(&items[1])?;
                next.mpt_work.mode = MptMode::GraftingBContinuing;
            }
            Ok(next)
        }
        17 => {
            // a branch carries no leading path; it grafts under the segment
            // collected so far
            next.mpt_work.mode = MptMode::GraftingBContinuing;
            Ok(next)
        }
        _ => Err(VmError::CorruptTrie("grafting into an empty node")),
    }
}

/// Attaches the grafted child (with its accumulated path) under the removed
/// branch's parent, then degenerates into a plain write bubble.
fn graft_b_step(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let terminating = last.mpt_work.mode == MptMode::GraftingBTerminating;
    let segment = last.mpt_work.graft_key_segment;
    let segment_len = last.mpt_work.graft_key_nibbles;

    let grafted = |trac: &dyn StepsTrace, path: U256, len: u64| -> Vec<u8> {
        let path_enc = encode_path(path, len, terminating);
        let inner = if terminating {
            wrap_bytes(&last.mpt_work.value)
        } else {
            ref_item(&last.mpt_work.current_root)
        };
        make_node(trac, &[wrap_bytes(&path_enc), inner])
    };

    let Some(mut next) = pop_chain(trac, last)? else {
        // the graft lands at the top: the root becomes a leaf or extension
        let mut next = last.clone();
        next.mpt_work.current_root = grafted(trac, segment, segment_len);
        next.mpt_work.mode = next.mpt_work.mode_on_finish;
        next.mpt_work.fail_lookup = FAIL_NONE;
        return Ok(next);
    };
    let node = resolve_node(trac, &next)?;
    let items: Vec<Vec<u8>> = decode_node_items(&node)?
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();

    let depth = next.mpt_work.lookup_nibble_depth;
    let remainder = shl_nibbles(next.mpt_work.lookup_key, depth);

    match items.len() {
        2 => {
            // merge the parent's own path with the graft segment
            let (parent_term, parent_path, parent_len) =
                decode_path(item_payload(&items[0])?)?;
            if parent_term {
                return Err(VmError::CorruptTrie("grafting under a leaf"));
            }
            let combined = parent_path | shr_nibbles(segment, parent_len);
            next.mpt_work.current_root = grafted(trac, combined, parent_len + segment_len);
            next.mpt_work.mode = MptMode::Writing;
            Ok(next)
        }
        17 => {
            let mut items = items.to_vec();
            let nib = nibble_at(remainder, 0) as usize;
            let node_ref = grafted(trac, segment, segment_len);
            items[nib] = ref_item(&node_ref);
            next.mpt_work.current_root = make_node(trac, &items);
            next.mpt_work.mode = MptMode::Writing;
            Ok(next)
        }
        _ => Err(VmError::CorruptTrie("grafting under an empty node")),
    }
}

fn return_read(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let caller_ref = last
        .return_to_step
        .ok_or(VmError::Internal("MPT work without a caller"))?;
    let mut next = trac.by_ref(&caller_ref)?.clone();
    next.mpt_work.value = last.mpt_work.value.clone();
    next.mpt_work.fail_lookup = last.mpt_work.fail_lookup;
    next.mpt_work.mode = MptMode::Done;
    Ok(next)
}

fn return_mutation(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let caller_ref = last
        .return_to_step
        .ok_or(VmError::Internal("MPT work without a caller"))?;
    let mut next = trac.by_ref(&caller_ref)?.clone();
    next.mpt_work.current_root = last.mpt_work.current_root.clone();
    next.mpt_work.fail_lookup = FAIL_NONE;
    next.mpt_work.mode = MptMode::Done;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_round_trip() {
        for (len, terminating) in [(0u64, true), (1, false), (5, true), (64, false), (63, true)] {
            let mut path = U256::zero();
            for i in 0..len {
                path = path | shl_nibbles(U256::from((i % 16) as u64), 63 - i);
            }
            let encoded = encode_path(path, len, terminating);
            let (t, p, l) = decode_path(&encoded).unwrap();
            assert_eq!((t, p, l), (terminating, path, len));
        }
    }

    #[test]
    fn nibble_helpers() {
        let key = U256::from_big_endian(&{
            let mut b = [0u8; 32];
            b[0] = 0x12;
            b[1] = 0x34;
            b
        });
        assert_eq!(nibble_at(key, 0), 0x1);
        assert_eq!(nibble_at(key, 1), 0x2);
        assert_eq!(nibble_at(key, 3), 0x4);
        assert_eq!(nibble_at(shl_nibbles(key, 1), 0), 0x2);
    }

    #[test]
    fn common_prefix() {
        let a = shl_nibbles(U256::from(0x1234u64), 60);
        let b = shl_nibbles(U256::from(0x1239u64), 60);
        let (prefix, len) = common_nibble_prefix(a, b, 4, 4);
        assert_eq!(len, 3);
        assert_eq!(prefix, shl_nibbles(U256::from(0x123u64), 61));
    }

    #[test]
    fn path_flag_bits() {
        // odd terminating path: first nibble packed into the flag byte
        let path = shl_nibbles(U256::from(0xabcu64), 61);
        let encoded = encode_path(path, 3, true);
        assert_eq!(encoded[0], 0x3a);
        assert_eq!(&encoded[1..], &[0xbc]);

        // even continuing path
        let encoded = encode_path(shl_nibbles(U256::from(0xabcdu64), 60), 4, false);
        assert_eq!(encoded[0], 0x00);
        assert_eq!(&encoded[1..], &[0xab, 0xcd]);
    }
}
