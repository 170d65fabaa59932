//! Timelock schedule of a swap
//!
//! Offsets are seconds relative to the deployment of the escrow they govern.
//! On chain the seven offsets are packed 32 bits each into one word, with the
//! deployment timestamp in the top 32 bits.

use crate::error::{SwapError, SwapResult};
use crate::model::Side;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeLockConfig {
    pub src_withdrawal: u32,
    pub src_public_withdrawal: u32,
    pub src_cancellation: u32,
    pub src_public_cancellation: u32,
    pub dst_withdrawal: u32,
    pub dst_public_withdrawal: u32,
    pub dst_cancellation: u32,
}

const DEPLOYED_AT_OFFSET: usize = 224;

impl TimeLockConfig {
    /// Check ordering of both schedules and the cross-chain safety margin.
    ///
    /// `dst_cancellation + safety_margin <= src_cancellation` guarantees the
    /// resolver can still cancel the source escrow after it lost the right to
    /// cancel the destination one.
    pub fn validate(&self, safety_margin_secs: u32) -> SwapResult<()> {
        let src = [
            ("srcWithdrawal", self.src_withdrawal),
            ("srcPublicWithdrawal", self.src_public_withdrawal),
            ("srcCancellation", self.src_cancellation),
            ("srcPublicCancellation", self.src_public_cancellation),
        ];
        let dst = [
            ("dstWithdrawal", self.dst_withdrawal),
            ("dstPublicWithdrawal", self.dst_public_withdrawal),
            ("dstCancellation", self.dst_cancellation),
        ];

        for schedule in [&src[..], &dst[..]] {
            for pair in schedule.windows(2) {
                let (prev_name, prev) = pair[0];
                let (next_name, next) = pair[1];
                if prev > next {
                    return Err(SwapError::Validation(format!(
                        "timelock {} ({}) must not exceed {} ({})",
                        prev_name, prev, next_name, next
                    )));
                }
            }
        }

        if self.src_withdrawal == self.src_cancellation
            || self.dst_withdrawal == self.dst_cancellation
        {
            return Err(SwapError::Validation(
                "withdrawal windows must have non-zero length".to_string(),
            ));
        }

        let dst_deadline = u64::from(self.dst_cancellation) + u64::from(safety_margin_secs);
        if dst_deadline > u64::from(self.src_cancellation)
            || self.dst_cancellation >= self.src_cancellation
        {
            return Err(SwapError::Validation(format!(
                "dstCancellation ({}) plus safety margin ({}) must not exceed srcCancellation ({})",
                self.dst_cancellation, safety_margin_secs, self.src_cancellation
            )));
        }

        Ok(())
    }

    /// Largest offset; the order expires once it has elapsed
    pub fn max_offset(&self) -> u32 {
        [
            self.src_withdrawal,
            self.src_public_withdrawal,
            self.src_cancellation,
            self.src_public_cancellation,
            self.dst_withdrawal,
            self.dst_public_withdrawal,
            self.dst_cancellation,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }

    pub fn withdrawal(&self, side: Side) -> u32 {
        match side {
            Side::Src => self.src_withdrawal,
            Side::Dst => self.dst_withdrawal,
        }
    }

    pub fn public_withdrawal(&self, side: Side) -> u32 {
        match side {
            Side::Src => self.src_public_withdrawal,
            Side::Dst => self.dst_public_withdrawal,
        }
    }

    pub fn cancellation(&self, side: Side) -> u32 {
        match side {
            Side::Src => self.src_cancellation,
            Side::Dst => self.dst_cancellation,
        }
    }

    /// Destination escrows have no public cancellation stage.
    pub fn public_cancellation(&self, side: Side) -> Option<u32> {
        match side {
            Side::Src => Some(self.src_public_cancellation),
            Side::Dst => None,
        }
    }

    /// Pack into the on-chain word: stage `i` at bits `32*i`, deployment time at bit 224.
    pub fn pack(&self, deployed_at: u32) -> U256 {
        let stages = [
            self.src_withdrawal,
            self.src_public_withdrawal,
            self.src_cancellation,
            self.src_public_cancellation,
            self.dst_withdrawal,
            self.dst_public_withdrawal,
            self.dst_cancellation,
        ];

        let mut packed = U256::from(deployed_at) << DEPLOYED_AT_OFFSET;
        for (i, stage) in stages.iter().enumerate() {
            packed |= U256::from(*stage) << (i * 32);
        }
        packed
    }
}
