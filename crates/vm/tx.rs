//! Per-transaction pipeline: envelope normalization, signature recovery, the
//! pre-execution checks and gas purchase, the hand-off into the call or
//! create machine, and the fee settlement plus receipt once the frame
//! returns.

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use stepex_common::{
    constants::{
        CHAIN_ID, REFUND_QUOTIENT, TX_ACCESS_LIST_ADDRESS_GAS, TX_ACCESS_LIST_STORAGE_KEY_GAS,
        TX_DATA_NON_ZERO_GAS, TX_DATA_ZERO_GAS, TX_GAS, TX_GAS_CONTRACT_CREATION,
    },
    types::{NormalizedTransaction, Receipt, Transaction, TxType},
};
use stepex_crypto::ecdsa;

use crate::{
    call::{CallKind, CallMode, CallScheme},
    create::CreateMode,
    errors::VmError,
    exec_mode::ExecMode,
    state::{self, StateWork, StateWorkMode},
    step::Step,
    trace::StepsTrace,
};

/// Progress of the pre/post fee handling around a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TxMode {
    #[default]
    CheckNonce = 0x00,
    CheckBalance = 0x01,
    CheckGasAvailable = 0x02,
    CheckIntrinsicGas = 0x03,
    BuyGas = 0x04,
    BumpNonce = 0x05,
    Mint = 0x06,
    SetupApply = 0x07,
    FinishSuccess = 0x08,
    FinishFailed = 0x09,
}

/// EIP-2718 normalization of the current envelope. Malformed envelopes,
/// foreign chain ids and bad types are block-fatal.
pub fn exec_tx_load(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();

    let tx = match Transaction::decode_envelope(&last.tx.current_tx) {
        Ok(tx) => tx,
        Err(_) => {
            next.exec_mode = ExecMode::ErrInvalidTransactionType;
            return Ok(next);
        }
    };
    if let Some(chain_id) = tx.chain_id() {
        if chain_id != CHAIN_ID {
            next.exec_mode = ExecMode::ErrInvalidTransactionChain;
            return Ok(next);
        }
    }

    next.tx.norm_tx = normalize(&tx);
    next.tx.logs.clear();
    next.tx.gas_refund = 0;
    next.sub_index = 0;

    if matches!(tx, Transaction::Deposit(_)) {
        // deposits carry no signature and pre-pay their gas on the far side
        next.tx.mode = TxMode::CheckGasAvailable;
        next.exec_mode = ExecMode::TxFeesPre;
    } else {
        next.exec_mode = ExecMode::TxSig;
    }
    Ok(next)
}

fn normalize(tx: &Transaction) -> NormalizedTransaction {
    let mut norm = NormalizedTransaction::default();
    match tx {
        Transaction::Legacy(tx) => {
            norm.nonce = tx.nonce;
            norm.gas_limit = tx.gas_limit;
            norm.max_priority_fee_per_gas = tx.gas_price;
            norm.max_fee_per_gas = tx.gas_price;
            norm.destination = tx.to.unwrap_or_default();
            norm.is_contract_creation = tx.to.is_none();
            norm.value = tx.value;
            norm.payload = tx.data.clone();
        }
        Transaction::AccessList(tx) => {
            norm.nonce = tx.nonce;
            norm.gas_limit = tx.gas_limit;
            norm.max_priority_fee_per_gas = tx.gas_price;
            norm.max_fee_per_gas = tx.gas_price;
            norm.destination = tx.to.unwrap_or_default();
            norm.is_contract_creation = tx.to.is_none();
            norm.value = tx.value;
            norm.payload = tx.data.clone();
            norm.access_list = tx.access_list.clone();
        }
        Transaction::DynamicFee(tx) => {
            norm.nonce = tx.nonce;
            norm.gas_limit = tx.gas_limit;
            norm.max_priority_fee_per_gas = tx.max_priority_fee_per_gas;
            norm.max_fee_per_gas = tx.max_fee_per_gas;
            norm.destination = tx.to.unwrap_or_default();
            norm.is_contract_creation = tx.to.is_none();
            norm.value = tx.value;
            norm.payload = tx.data.clone();
            norm.access_list = tx.access_list.clone();
        }
        Transaction::Deposit(tx) => {
            norm.signer = tx.from;
            norm.gas_limit = tx.gas_limit;
            norm.destination = tx.to.unwrap_or_default();
            norm.is_contract_creation = tx.to.is_none();
            norm.value = tx.value;
            norm.payload = tx.data.clone();
            norm.mint = tx.mint;
            norm.is_deposit = true;
        }
    }
    norm
}

/// Recovers the signer from the envelope's signature values.
pub fn exec_tx_sig(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let mut next = last.clone();

    let tx = match Transaction::decode_envelope(&last.tx.current_tx) {
        Ok(tx) => tx,
        Err(_) => {
            next.exec_mode = ExecMode::ErrInvalidTransactionType;
            return Ok(next);
        }
    };
    let (recovery, r, s) = tx.signature();
    if recovery > U256::from(u8::MAX) {
        next.exec_mode = ExecMode::ErrInvalidTransactionSig;
        return Ok(next);
    }
    let recovery_id = recovery.low_u64() as u8;
    let r_bytes = r.to_big_endian();
    let s_bytes = s.to_big_endian();
    if !ecdsa::validate_signature_values(recovery_id, &r_bytes, &s_bytes, true) {
        next.exec_mode = ExecMode::ErrInvalidTransactionSig;
        return Ok(next);
    }

    let mut sig = [0u8; 65];
    sig[..32].copy_from_slice(&r_bytes);
    sig[32..64].copy_from_slice(&s_bytes);
    sig[64] = recovery_id;
    let sighash = tx.signing_hash();
    match ecdsa::recover_address(&sighash.0, &sig) {
        Ok(address) => next.tx.norm_tx.signer = Address::from(address),
        Err(_) => {
            next.exec_mode = ExecMode::ErrInvalidTransactionSig;
            return Ok(next);
        }
    }

    next.tx.mode = TxMode::CheckNonce;
    next.exec_mode = ExecMode::TxFeesPre;
    Ok(next)
}

/// Flat cost charged before execution: base fee plus per-byte data cost plus
/// the access-list surcharges. None on arithmetic overflow.
pub fn intrinsic_gas(norm: &NormalizedTransaction) -> Option<u64> {
    let mut gas = if norm.is_contract_creation {
        TX_GAS_CONTRACT_CREATION
    } else {
        TX_GAS
    };

    let nonzero = norm.payload.iter().filter(|b| **b != 0).count() as u64;
    let zero = norm.payload.len() as u64 - nonzero;
    gas = gas.checked_add(nonzero.checked_mul(TX_DATA_NON_ZERO_GAS)?)?;
    gas = gas.checked_add(zero.checked_mul(TX_DATA_ZERO_GAS)?)?;

    if !norm.access_list.is_empty() {
        let addresses = norm.access_list.len() as u64;
        let storage_keys: u64 = norm
            .access_list
            .iter()
            .map(|e| e.storage_keys.len() as u64)
            .sum();
        gas = gas.checked_add(addresses.checked_mul(TX_ACCESS_LIST_ADDRESS_GAS)?)?;
        gas = gas.checked_add(storage_keys.checked_mul(TX_ACCESS_LIST_STORAGE_KEY_GAS)?)?;
    }
    Some(gas)
}

fn block_fatal(last: &Step) -> Step {
    let mut next = last.clone();
    next.exec_mode = ExecMode::ErrInvalidTransactionType;
    next
}

/// Validity checks and gas purchase, one concern per mode. Failures are
/// block-fatal: a block that includes an unpayable transaction is invalid.
pub fn exec_tx_fees_pre(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let norm = last.tx.norm_tx.clone();

    match last.tx.mode {
        TxMode::CheckNonce => {
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::GetNonce { nonce, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("tx nonce got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                if nonce != norm.nonce {
                    return Ok(block_fatal(last));
                }
                next.tx.mode = TxMode::CheckBalance;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::GetNonce {
                    address: norm.signer,
                    nonce: 0,
                },
            )
        }
        TxMode::CheckBalance => {
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::GetBalance { balance, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("tx balance got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                if norm.max_fee_per_gas < last.block.base_fee {
                    return Ok(block_fatal(last));
                }
                let Some(cost) = U256::from(norm.gas_limit)
                    .checked_mul(norm.max_fee_per_gas)
                    .and_then(|gas_cost| gas_cost.checked_add(norm.value))
                else {
                    return Ok(block_fatal(last));
                };
                if balance < cost {
                    return Ok(block_fatal(last));
                }
                next.tx.mode = TxMode::CheckGasAvailable;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::GetBalance {
                    address: norm.signer,
                    balance: U256::zero(),
                },
            )
        }
        TxMode::CheckGasAvailable => {
            let mut next = last.clone();
            if last.block.gas_limit - last.block.gas_used < norm.gas_limit {
                return Ok(block_fatal(last));
            }
            next.tx.mode = TxMode::CheckIntrinsicGas;
            Ok(next)
        }
        TxMode::CheckIntrinsicGas => {
            let mut next = last.clone();
            let Some(intrinsic) = intrinsic_gas(&norm) else {
                return Ok(block_fatal(last));
            };
            if norm.gas_limit < intrinsic {
                return Ok(block_fatal(last));
            }
            next.tx.mode = if norm.is_deposit {
                TxMode::Mint
            } else {
                TxMode::BuyGas
            };
            Ok(next)
        }
        TxMode::BuyGas => {
            if last.state_work.mode == StateWorkMode::Returned {
                let StateWork::SubBalance { ok, .. } = last.state_work.work.clone() else {
                    return Err(VmError::Internal("gas purchase got a foreign result"));
                };
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                if !ok {
                    return Ok(block_fatal(last));
                }
                next.tx.mode = TxMode::BumpNonce;
                return Ok(next);
            }
            let price = norm.effective_gas_price(last.block.base_fee);
            state::request(
                trac,
                StateWork::SubBalance {
                    address: norm.signer,
                    delta: U256::from(norm.gas_limit) * price,
                    ok: false,
                },
            )
        }
        TxMode::BumpNonce => {
            // contract creations increment inside the create machine
            if norm.is_contract_creation {
                let mut next = last.clone();
                next.tx.mode = TxMode::Mint;
                return Ok(next);
            }
            if last.state_work.mode == StateWorkMode::Returned {
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                next.tx.mode = TxMode::Mint;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::SetNonce {
                    address: norm.signer,
                    nonce: norm.nonce + 1,
                },
            )
        }
        TxMode::Mint => {
            if !norm.is_deposit || norm.mint.is_zero() {
                let mut next = last.clone();
                next.tx.mode = TxMode::SetupApply;
                return Ok(next);
            }
            if last.state_work.mode == StateWorkMode::Returned {
                let mut next = last.clone();
                next.state_work.mode = StateWorkMode::Idle;
                next.state_work.work = StateWork::None;
                next.tx.mode = TxMode::SetupApply;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::AddBalance {
                    address: norm.signer,
                    delta: norm.mint,
                },
            )
        }
        TxMode::SetupApply => {
            let mut next = last.clone();
            let intrinsic = intrinsic_gas(&norm)
                .ok_or(VmError::Internal("intrinsic gas changed mid-pipeline"))?;
            let price = if norm.is_deposit {
                U256::zero()
            } else {
                norm.effective_gas_price(last.block.base_fee)
            };
            next.tx.gas_price = price;
            next.tx.origin = norm.signer;

            // the whole budget moves into the frame; the tx-level scope keeps
            // none, so the returned remainder is counted exactly once
            let frame_gas = norm.gas_limit - intrinsic;
            next.contract = Default::default();
            next.sub_index = 0;

            if norm.is_contract_creation {
                let work = &mut next.create_work;
                *work = Default::default();
                work.mode = CreateMode::StartCreate;
                work.kind = CallKind::Transaction;
                work.caller = norm.signer;
                work.value = norm.value;
                work.gas = frame_gas;
                next.exec_mode = ExecMode::CreateSetup;
            } else {
                let work = &mut next.call_work;
                *work = Default::default();
                work.mode = CallMode::Start;
                work.kind = CallKind::Transaction;
                work.scheme = CallScheme::Call;
                work.caller = norm.signer;
                work.addr = norm.destination;
                work.code_addr = norm.destination;
                work.value = norm.value;
                work.gas = frame_gas;
                next.exec_mode = ExecMode::CallSetup;
            }
            Ok(next)
        }
        TxMode::FinishSuccess | TxMode::FinishFailed => {
            Err(VmError::Internal("fee pre-processing after execution"))
        }
    }
}

pub fn exec_block_tx_success(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    next.tx.mode = TxMode::FinishSuccess;
    next.sub_index = 0;
    next.exec_mode = ExecMode::TxFeesPost;
    Ok(next)
}

pub fn exec_block_tx_revert(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let mut next = trac.last().clone();
    next.tx.mode = TxMode::FinishFailed;
    next.sub_index = 0;
    next.exec_mode = ExecMode::TxFeesPost;
    Ok(next)
}

pub fn exec_block_tx_err(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    exec_block_tx_revert(trac)
}

fn gas_returned(last: &Step) -> u64 {
    let norm = &last.tx.norm_tx;
    let remaining = last.contract.gas;
    let used = norm.gas_limit - remaining;
    // refunds cap at a fifth of what was spent
    let refund = last.tx.gas_refund.min(used / REFUND_QUOTIENT);
    remaining + refund
}

fn tx_type_of(envelope: &Bytes) -> TxType {
    match envelope.first() {
        Some(0x01) => TxType::AccessList,
        Some(0x02) => TxType::DynamicFee,
        Some(0x42) => TxType::Deposit,
        _ => TxType::Legacy,
    }
}

/// Fee settlement after the frame returned: refund the sender, pay the
/// coinbase its priority fee, account the block gas and append the receipt.
pub fn exec_tx_fees_post(trac: &dyn StepsTrace) -> Result<Step, VmError> {
    let last = trac.last();
    let norm = last.tx.norm_tx.clone();
    let returned = gas_returned(last);
    let gas_used = norm.gas_limit - returned;

    match (last.sub_index, last.state_work.mode) {
        // refund the unused and rebated gas to the sender
        (0, StateWorkMode::Returned) => {
            let mut next = last.clone();
            next.state_work.mode = StateWorkMode::Idle;
            next.state_work.work = StateWork::None;
            next.sub_index = 1;
            Ok(next)
        }
        (0, _) => {
            let amount = U256::from(returned) * last.tx.gas_price;
            if amount.is_zero() {
                let mut next = last.clone();
                next.sub_index = 1;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::AddBalance {
                    address: norm.signer,
                    delta: amount,
                },
            )
        }
        // the coinbase earns the priority fee on the gas actually used
        (1, StateWorkMode::Returned) => {
            let mut next = last.clone();
            next.state_work.mode = StateWorkMode::Idle;
            next.state_work.work = StateWork::None;
            next.sub_index = 2;
            Ok(next)
        }
        (1, _) => {
            let tip = last.tx.gas_price.saturating_sub(last.block.base_fee);
            let amount = U256::from(gas_used) * tip;
            if amount.is_zero() {
                let mut next = last.clone();
                next.sub_index = 2;
                return Ok(next);
            }
            state::request(
                trac,
                StateWork::AddBalance {
                    address: last.block.coinbase,
                    delta: amount,
                },
            )
        }
        // close the transaction: gas accounting, receipt, loop
        _ => {
            let mut next = last.clone();
            next.block.gas_used += gas_used;
            next.block.receipts.push(Receipt::new(
                tx_type_of(&last.tx.current_tx),
                last.tx.mode == TxMode::FinishSuccess,
                next.block.gas_used,
                last.tx.logs.clone(),
            ));
            next.tx.logs.clear();
            next.tx.gas_refund = 0;
            next.tx.gas_price = U256::zero();
            next.tx.norm_tx = Default::default();
            next.tx.current_tx = Default::default();
            next.tx.tx_index += 1;
            next.tx.mode = TxMode::CheckNonce;
            next.contract = Default::default();
            next.sub_index = 0;
            next.exec_mode = ExecMode::BlockTxLoop;
            Ok(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepex_common::types::AccessListEntry;

    #[test]
    fn intrinsic_gas_counts_bytes() {
        let norm = NormalizedTransaction {
            payload: Bytes::from_static(&[0, 0, 1, 2]),
            ..Default::default()
        };
        assert_eq!(
            intrinsic_gas(&norm),
            Some(TX_GAS + 2 * TX_DATA_ZERO_GAS + 2 * TX_DATA_NON_ZERO_GAS)
        );
    }

    #[test]
    fn intrinsic_gas_creation_and_access_list() {
        let norm = NormalizedTransaction {
            is_contract_creation: true,
            access_list: vec![AccessListEntry {
                address: Address::zero(),
                storage_keys: vec![H256::zero(), H256::zero()],
            }],
            ..Default::default()
        };
        assert_eq!(
            intrinsic_gas(&norm),
            Some(
                TX_GAS_CONTRACT_CREATION
                    + TX_ACCESS_LIST_ADDRESS_GAS
                    + 2 * TX_ACCESS_LIST_STORAGE_KEY_GAS
            )
        );
    }

    #[test]
    fn refund_is_capped() {
        let mut step = Step::default();
        step.tx.norm_tx.gas_limit = 100_000;
        step.contract.gas = 40_000;
        step.tx.gas_refund = 50_000;
        // 60k used, cap = 12k
        assert_eq!(gas_returned(&step), 40_000 + 12_000);
    }
}
