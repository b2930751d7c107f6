use bytes::Bytes;
use stepex_common::types::Log;

use crate::{errors::VmError, jump_table::OpCode, step::Step, trace::StepsTrace};

use super::progress;

/// LOG0..LOG4, with the topic count taken from the cached opcode byte.
/// Stack: offset, size, then the topics.
pub fn op_log(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    let topic_count = (next.contract.op - OpCode::LOG0 as u8) as usize;

    let offset = next.contract.stack.back_u256(0)?.low_u64();
    let size = next.contract.stack.back_u256(1)?.low_u64();
    let mut topics = Vec::with_capacity(topic_count);
    for i in 0..topic_count {
        topics.push(next.contract.stack.back(2 + i)?);
    }

    let data = next.contract.memory.load_slice(offset, size);
    next.tx.logs.push(Log {
        address: next.contract.self_addr,
        topics,
        data: Bytes::from(data),
    });

    for _ in 0..2 + topic_count {
        next.contract.stack.pop()?;
    }
    Ok(progress(next))
}
