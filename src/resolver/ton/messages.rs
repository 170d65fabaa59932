//! Message bodies for the TON escrow factory, escrows and jetton wallets

use super::address::TonAddress;
use super::cell::{Cell, CellBuilder};
use crate::error::SwapResult;
use crate::model::{EscrowParams, Secret};

use ethers::types::U256;
use std::sync::Arc;

pub const OP_CREATE_ESCROW: u32 = 0x5d0c_a1e0;
pub const OP_WITHDRAW: u32 = 0x5d0c_a1e1;
pub const OP_CANCEL: u32 = 0x5d0c_a1e2;
/// TEP-74 jetton transfer
pub const OP_JETTON_TRANSFER: u32 = 0x0f8a_7ea5;

/// Factory call creating one escrow.
///
/// `op query_id order_key side amount safety_deposit`
/// `^[hashlock timelocks src_cancellation_at]`
/// `^[depositor beneficiary token]`
pub fn create_escrow_body(
    params: &EscrowParams,
    order_key: &[u8; 32],
    depositor: &TonAddress,
    beneficiary: &TonAddress,
    token: Option<&TonAddress>,
    query_id: u64,
) -> SwapResult<Arc<Cell>> {
    let src_cancellation_at = params
        .src_cancellation_at
        .map(|t| t.timestamp().clamp(0, i64::from(u32::MAX)) as u64)
        .unwrap_or(0);

    let mut terms = CellBuilder::new();
    terms
        .store_bytes(params.hashlock.as_bytes())?
        .store_u256(params.timelocks.pack(0))?
        .store_uint(src_cancellation_at, 32)?;

    let mut parties = CellBuilder::new();
    parties
        .store_address(Some(depositor))?
        .store_address(Some(beneficiary))?
        .store_address(token)?;

    let mut body = CellBuilder::new();
    body.store_uint(u64::from(OP_CREATE_ESCROW), 32)?
        .store_uint(query_id, 64)?
        .store_bytes(order_key)?
        .store_uint(u64::from(params.side.as_u8()), 8)?
        .store_coins(params.amount)?
        .store_coins(params.safety_deposit)?
        .store_ref(terms.build_ref())?
        .store_ref(parties.build_ref())?;
    Ok(body.build_ref())
}

pub fn withdraw_body(secret: &Secret, query_id: u64) -> SwapResult<Arc<Cell>> {
    let mut body = CellBuilder::new();
    body.store_uint(u64::from(OP_WITHDRAW), 32)?
        .store_uint(query_id, 64)?
        .store_bytes(secret.as_bytes())?;
    Ok(body.build_ref())
}

pub fn cancel_body(query_id: u64) -> SwapResult<Arc<Cell>> {
    let mut body = CellBuilder::new();
    body.store_uint(u64::from(OP_CANCEL), 32)?
        .store_uint(query_id, 64)?;
    Ok(body.build_ref())
}

/// Jetton transfer carrying `forward_payload` to `destination`
pub fn jetton_transfer_body(
    query_id: u64,
    amount: U256,
    destination: &TonAddress,
    response_destination: &TonAddress,
    forward_ton_amount: U256,
    forward_payload: Arc<Cell>,
) -> SwapResult<Arc<Cell>> {
    let mut body = CellBuilder::new();
    body.store_uint(u64::from(OP_JETTON_TRANSFER), 32)?
        .store_uint(query_id, 64)?
        .store_coins(amount)?
        .store_address(Some(destination))?
        .store_address(Some(response_destination))?
        .store_bit(false)? // no custom payload
        .store_coins(forward_ton_amount)?
        .store_bit(true)?
        .store_ref(forward_payload)?;
    Ok(body.build_ref())
}
