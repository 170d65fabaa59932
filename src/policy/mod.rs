//! Timelock and cancellation policy
//!
//! Pure functions over an escrow's deployment time, the order's timelock
//! schedule and the current time. The orchestrator and the resolvers consult
//! them immediately before every withdraw or cancel.

mod deposit;
mod stage;

pub use deposit::{payout, EscrowAction, Payout};
pub use stage::{
    cancellation_opens_at, ensure_cancellable, ensure_withdrawable, evaluate, next_boundary,
    withdrawal_opens_at, EscrowStage,
};

use crate::error::{SwapError, SwapResult};
use crate::model::{EscrowRecord, Side, TimeLockConfig};

use chrono::{DateTime, Duration, Utc};

/// What to do with an escrow during failure handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDecision {
    /// Cancellation window is open
    CancelNow,
    /// Check again once the window opens
    RetryAt(DateTime<Utc>),
    /// Escrow is closed or was never deployed
    Nothing,
}

pub fn cancellation_decision(
    escrow: &EscrowRecord,
    timelocks: &TimeLockConfig,
    now: DateTime<Utc>,
) -> CancelDecision {
    if !escrow.may_hold_funds() {
        return CancelDecision::Nothing;
    }
    let Some(deployed_at) = escrow.deployed_at else {
        return CancelDecision::Nothing;
    };

    match evaluate(deployed_at, timelocks, now, escrow.side) {
        EscrowStage::Cancellable | EscrowStage::PublicCancellable => CancelDecision::CancelNow,
        _ => CancelDecision::RetryAt(cancellation_opens_at(deployed_at, timelocks, escrow.side)),
    }
}

/// Absolute deadline check before the destination escrow is created.
///
/// The destination cancellation time must fall at least `safety_margin_secs`
/// before the source cancellation time, measured from the actual deployment
/// times rather than the relative offsets.
pub fn check_destination_deadline(
    src_deployed_at: DateTime<Utc>,
    dst_deploy_time: DateTime<Utc>,
    timelocks: &TimeLockConfig,
    safety_margin_secs: u32,
) -> SwapResult<()> {
    let src_cancellation = cancellation_opens_at(src_deployed_at, timelocks, Side::Src);
    let latest_allowed = src_cancellation - Duration::seconds(i64::from(safety_margin_secs));
    let dst_cancellation = cancellation_opens_at(dst_deploy_time, timelocks, Side::Dst);

    if dst_cancellation > latest_allowed {
        return Err(SwapError::WindowClosed {
            side: Side::Dst,
            closed_at: (latest_allowed - Duration::seconds(i64::from(timelocks.dst_cancellation)))
                .timestamp(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::timelock::tests::sample;
    use crate::model::{Asset, EscrowParams, EscrowStatus, Hashlock};
    use ethers::types::U256;

    fn deployed_escrow(side: Side, deployed_at: DateTime<Utc>) -> EscrowRecord {
        let params = EscrowParams {
            order_id: "o".to_string(),
            side,
            chain_id: 1,
            escrow_factory: "f".to_string(),
            hashlock: Hashlock::new([0u8; 32]),
            depositor: "d".to_string(),
            beneficiary: "b".to_string(),
            asset: Asset::Native,
            amount: U256::one(),
            safety_deposit: U256::zero(),
            timelocks: sample(),
            src_cancellation_at: None,
        };
        let mut record = EscrowRecord::deploying(&params, deployed_at);
        record.address = Some("escrow".to_string());
        record.deployed_at = Some(deployed_at);
        record.set_status(EscrowStatus::Funded, None, None, deployed_at);
        record
    }

    #[test]
    fn test_decision_waits_for_window() {
        let t0 = Utc::now();
        let escrow = deployed_escrow(Side::Src, t0);
        let tl = sample();

        assert_eq!(
            cancellation_decision(&escrow, &tl, t0 + Duration::seconds(100)),
            CancelDecision::RetryAt(t0 + Duration::seconds(7_200))
        );
        assert_eq!(
            cancellation_decision(&escrow, &tl, t0 + Duration::seconds(7_200)),
            CancelDecision::CancelNow
        );
        assert_eq!(
            cancellation_decision(&escrow, &tl, t0 + Duration::seconds(9_000)),
            CancelDecision::CancelNow
        );
    }

    #[test]
    fn test_decision_ignores_closed_escrows() {
        let t0 = Utc::now();
        let mut escrow = deployed_escrow(Side::Dst, t0);
        escrow.set_status(EscrowStatus::Withdrawn, None, None, t0);
        assert_eq!(
            cancellation_decision(&escrow, &sample(), t0 + Duration::days(1)),
            CancelDecision::Nothing
        );
    }

    #[test]
    fn test_destination_deadline() {
        let t0 = Utc::now();
        let tl = sample();
        // src cancels at t0+7200, dst at deploy+3000; margin 600 leaves 3600s of slack
        assert!(check_destination_deadline(t0, t0 + Duration::seconds(3_600), &tl, 600).is_ok());
        let err = check_destination_deadline(t0, t0 + Duration::seconds(3_601), &tl, 600)
            .unwrap_err();
        assert!(matches!(err, SwapError::WindowClosed { side: Side::Dst, .. }));
    }
}
