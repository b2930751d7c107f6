use ethereum_types::H256;
use stepex_crypto::keccak::keccak_hash;

use crate::{errors::VmError, step::Step, trace::StepsTrace};

use super::progress;

pub fn op_keccak256(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let offset = next.contract.stack.pop_u256()?.low_u64();
    let size = next.contract.stack.peek_u256()?.low_u64();
    let data = next.contract.memory.load_slice(offset, size);
    next.contract.stack.tweak(H256(keccak_hash(&data)))?;
    Ok(progress(next))
}
