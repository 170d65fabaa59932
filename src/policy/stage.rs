use crate::error::{SwapError, SwapResult};
use crate::model::{Side, TimeLockConfig};

use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Window an escrow is in at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowStage {
    TooEarly,
    /// Only the designated party may withdraw
    Withdrawable,
    /// Anyone may trigger the withdrawal
    PublicWithdrawable,
    /// Only the resolver may cancel
    Cancellable,
    /// Anyone may cancel (source escrows only)
    PublicCancellable,
}

impl fmt::Display for EscrowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscrowStage::TooEarly => "TOO_EARLY",
            EscrowStage::Withdrawable => "WITHDRAWABLE",
            EscrowStage::PublicWithdrawable => "PUBLIC_WITHDRAWABLE",
            EscrowStage::Cancellable => "CANCELLABLE",
            EscrowStage::PublicCancellable => "PUBLIC_CANCELLABLE",
        };
        f.write_str(s)
    }
}

fn at(deployed_at: DateTime<Utc>, offset: u32) -> DateTime<Utc> {
    deployed_at + Duration::seconds(i64::from(offset))
}

pub fn withdrawal_opens_at(
    deployed_at: DateTime<Utc>,
    timelocks: &TimeLockConfig,
    side: Side,
) -> DateTime<Utc> {
    at(deployed_at, timelocks.withdrawal(side))
}

pub fn cancellation_opens_at(
    deployed_at: DateTime<Utc>,
    timelocks: &TimeLockConfig,
    side: Side,
) -> DateTime<Utc> {
    at(deployed_at, timelocks.cancellation(side))
}

pub fn evaluate(
    deployed_at: DateTime<Utc>,
    timelocks: &TimeLockConfig,
    now: DateTime<Utc>,
    side: Side,
) -> EscrowStage {
    if now < at(deployed_at, timelocks.withdrawal(side)) {
        return EscrowStage::TooEarly;
    }
    if now < at(deployed_at, timelocks.public_withdrawal(side)) {
        return EscrowStage::Withdrawable;
    }
    if now < at(deployed_at, timelocks.cancellation(side)) {
        return EscrowStage::PublicWithdrawable;
    }
    match timelocks.public_cancellation(side) {
        Some(public) if now >= at(deployed_at, public) => EscrowStage::PublicCancellable,
        _ => EscrowStage::Cancellable,
    }
}

/// Start of the next stage after `now`, if any
pub fn next_boundary(
    deployed_at: DateTime<Utc>,
    timelocks: &TimeLockConfig,
    now: DateTime<Utc>,
    side: Side,
) -> Option<DateTime<Utc>> {
    let mut offsets = vec![
        timelocks.withdrawal(side),
        timelocks.public_withdrawal(side),
        timelocks.cancellation(side),
    ];
    offsets.extend(timelocks.public_cancellation(side));

    offsets
        .into_iter()
        .map(|offset| at(deployed_at, offset))
        .find(|boundary| *boundary > now)
}

pub fn ensure_withdrawable(
    deployed_at: DateTime<Utc>,
    timelocks: &TimeLockConfig,
    now: DateTime<Utc>,
    side: Side,
) -> SwapResult<EscrowStage> {
    match evaluate(deployed_at, timelocks, now, side) {
        EscrowStage::TooEarly => Err(SwapError::NotYetWithdrawable {
            side,
            opens_at: withdrawal_opens_at(deployed_at, timelocks, side).timestamp(),
        }),
        stage @ (EscrowStage::Withdrawable | EscrowStage::PublicWithdrawable) => Ok(stage),
        EscrowStage::Cancellable | EscrowStage::PublicCancellable => {
            Err(SwapError::WindowClosed {
                side,
                closed_at: cancellation_opens_at(deployed_at, timelocks, side).timestamp(),
            })
        }
    }
}

pub fn ensure_cancellable(
    deployed_at: DateTime<Utc>,
    timelocks: &TimeLockConfig,
    now: DateTime<Utc>,
    side: Side,
) -> SwapResult<EscrowStage> {
    match evaluate(deployed_at, timelocks, now, side) {
        stage @ (EscrowStage::Cancellable | EscrowStage::PublicCancellable) => Ok(stage),
        _ => Err(SwapError::TooEarly {
            side,
            opens_at: cancellation_opens_at(deployed_at, timelocks, side).timestamp(),
        }),
    }
}
