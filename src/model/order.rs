//! Orders and their lifecycle

use crate::error::{SwapError, SwapResult};
use crate::model::{EscrowRecord, EscrowStatus, Hashlock, Secret, Side, TimeLockConfig};

use chrono::{DateTime, Duration, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serde helpers writing 256-bit amounts as decimal strings.
///
/// Deserialization also accepts `0x` hex strings and JSON integers.
pub mod decimal_u256 {
    use ethers::types::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(U256::from(n)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn parse(value: &str) -> Result<U256, String> {
        let value = value.trim();
        if let Some(hex) = value.strip_prefix("0x") {
            U256::from_str_radix(hex, 16).map_err(|e| format!("invalid hex amount {}: {}", value, e))
        } else {
            U256::from_dec_str(value).map_err(|e| format!("invalid amount {}: {:?}", value, e))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    SrcEscrowDeployed,
    DstEscrowDeployed,
    EscrowsReady,
    SecretRevealed,
    DstWithdrawn,
    SrcWithdrawn,
    Completed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    /// Position along the happy path; terminal failure states have none
    fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::Created => Some(0),
            OrderStatus::SrcEscrowDeployed => Some(1),
            OrderStatus::DstEscrowDeployed => Some(2),
            OrderStatus::EscrowsReady => Some(3),
            OrderStatus::SecretRevealed => Some(4),
            OrderStatus::DstWithdrawn => Some(5),
            OrderStatus::SrcWithdrawn => Some(6),
            OrderStatus::Completed => Some(7),
            OrderStatus::Cancelled | OrderStatus::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Forward moves along the happy path, `CANCELLED`/`FAILED` from any
    /// non-terminal state, and `FAILED -> CANCELLED` once every escrow is refunded.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Failed, OrderStatus::Cancelled) => true,
            (current, _) if current.is_terminal() => false,
            (_, OrderStatus::Cancelled | OrderStatus::Failed) => true,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    /// At or beyond `other` on the happy path
    pub fn has_reached(&self, other: OrderStatus) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => *self == other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::SrcEscrowDeployed => "SRC_ESCROW_DEPLOYED",
            OrderStatus::DstEscrowDeployed => "DST_ESCROW_DEPLOYED",
            OrderStatus::EscrowsReady => "ESCROWS_READY",
            OrderStatus::SecretRevealed => "SECRET_REVEALED",
            OrderStatus::DstWithdrawn => "DST_WITHDRAWN",
            OrderStatus::SrcWithdrawn => "SRC_WITHDRAWN",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order as submitted to intake
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInput {
    #[serde(default)]
    pub id: Option<String>,
    pub maker: String,
    /// Maker's address on the destination chain; defaults to `maker`
    #[serde(default)]
    pub receiver: Option<String>,
    pub maker_asset: String,
    #[serde(with = "decimal_u256")]
    pub maker_amount: U256,
    pub taker_asset: String,
    #[serde(with = "decimal_u256")]
    pub taker_amount: U256,
    pub src_chain_id: i64,
    pub dst_chain_id: i64,
    pub secret_hash: String,
    pub time_locks: TimeLockConfig,
    #[serde(default, with = "decimal_u256")]
    pub src_safety_deposit: U256,
    #[serde(default, with = "decimal_u256")]
    pub dst_safety_deposit: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub maker: String,
    pub receiver: Option<String>,
    pub maker_asset: String,
    #[serde(with = "decimal_u256")]
    pub maker_amount: U256,
    pub taker_asset: String,
    #[serde(with = "decimal_u256")]
    pub taker_amount: U256,
    pub src_chain_id: i64,
    pub dst_chain_id: i64,
    pub secret_hash: Hashlock,
    pub time_locks: TimeLockConfig,
    #[serde(with = "decimal_u256")]
    pub src_safety_deposit: U256,
    #[serde(with = "decimal_u256")]
    pub dst_safety_deposit: U256,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

const MAX_ORDER_ID_LEN: usize = 128;

impl Order {
    /// Validate an intake order and assign its id and timestamps.
    ///
    /// Nothing here touches a chain; malformed orders never reach the orchestrator.
    pub fn from_input(
        input: OrderInput,
        now: DateTime<Utc>,
        safety_margin_secs: u32,
    ) -> SwapResult<Self> {
        let id = match input.id {
            Some(id) => {
                let id = id.trim().to_string();
                if id.is_empty() || id.len() > MAX_ORDER_ID_LEN {
                    return Err(SwapError::Validation(format!(
                        "order id must be 1..={} characters",
                        MAX_ORDER_ID_LEN
                    )));
                }
                if !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                {
                    return Err(SwapError::Validation(
                        "order id may only contain alphanumerics, '-' and '_'".to_string(),
                    ));
                }
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        for (name, value) in [
            ("maker", &input.maker),
            ("makerAsset", &input.maker_asset),
            ("takerAsset", &input.taker_asset),
        ] {
            if value.trim().is_empty() {
                return Err(SwapError::Validation(format!("{} is required", name)));
            }
        }
        if let Some(receiver) = &input.receiver {
            if receiver.trim().is_empty() {
                return Err(SwapError::Validation(
                    "receiver must not be empty when given".to_string(),
                ));
            }
        }

        if input.maker_amount.is_zero() || input.taker_amount.is_zero() {
            return Err(SwapError::Validation(
                "makerAmount and takerAmount must be positive".to_string(),
            ));
        }
        if input.src_chain_id == input.dst_chain_id {
            return Err(SwapError::Validation(format!(
                "source and destination chain must differ (both {})",
                input.src_chain_id
            )));
        }

        let secret_hash = Hashlock::from_hex(&input.secret_hash)?;
        input.time_locks.validate(safety_margin_secs)?;

        let expires_at = now + Duration::seconds(i64::from(input.time_locks.max_offset()));

        Ok(Self {
            id,
            maker: input.maker.trim().to_string(),
            receiver: input.receiver.map(|r| r.trim().to_string()),
            maker_asset: input.maker_asset.trim().to_string(),
            maker_amount: input.maker_amount,
            taker_asset: input.taker_asset.trim().to_string(),
            taker_amount: input.taker_amount,
            src_chain_id: input.src_chain_id,
            dst_chain_id: input.dst_chain_id,
            secret_hash,
            time_locks: input.time_locks,
            src_safety_deposit: input.src_safety_deposit,
            dst_safety_deposit: input.dst_safety_deposit,
            status: OrderStatus::Created,
            created_at: now,
            updated_at: now,
            expires_at,
        })
    }

    /// Apply a status change, rejecting anything the lifecycle forbids
    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> SwapResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SwapError::InvalidState {
                order_id: self.id.clone(),
                status: self.status.to_string(),
                operation: format!("move to {}", next),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Destination-chain address paid by the destination escrow
    pub fn receiver(&self) -> &str {
        self.receiver.as_deref().unwrap_or(&self.maker)
    }

    pub fn chain_id(&self, side: Side) -> i64 {
        match side {
            Side::Src => self.src_chain_id,
            Side::Dst => self.dst_chain_id,
        }
    }
}

/// Persisted unit keyed by order id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRecord {
    pub order: Order,
    pub src_escrow: Option<EscrowRecord>,
    pub dst_escrow: Option<EscrowRecord>,
    /// Kept so an interrupted settlement can resume after a restart
    pub revealed_secret: Option<Secret>,
    pub cancel_retry_at: Option<DateTime<Utc>>,
    /// Set when the order needs an operator
    pub attention: Option<String>,
    pub last_error: Option<String>,
}

impl SwapRecord {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            src_escrow: None,
            dst_escrow: None,
            revealed_secret: None,
            cancel_retry_at: None,
            attention: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.order.id
    }

    pub fn escrow(&self, side: Side) -> Option<&EscrowRecord> {
        match side {
            Side::Src => self.src_escrow.as_ref(),
            Side::Dst => self.dst_escrow.as_ref(),
        }
    }

    pub fn escrow_mut(&mut self, side: Side) -> Option<&mut EscrowRecord> {
        match side {
            Side::Src => self.src_escrow.as_mut(),
            Side::Dst => self.dst_escrow.as_mut(),
        }
    }

    pub fn set_escrow(&mut self, escrow: EscrowRecord) {
        match escrow.side {
            Side::Src => self.src_escrow = Some(escrow),
            Side::Dst => self.dst_escrow = Some(escrow),
        }
    }

    pub fn any_withdrawn(&self) -> bool {
        [Side::Src, Side::Dst].iter().any(|side| {
            self.escrow(*side)
                .map(|e| e.status == EscrowStatus::Withdrawn)
                .unwrap_or(false)
        })
    }

    /// True when escrows exist and every one of them is cancelled
    pub fn all_refunded(&self) -> bool {
        let escrows: Vec<_> = [Side::Src, Side::Dst]
            .iter()
            .filter_map(|side| self.escrow(*side))
            .collect();
        !escrows.is_empty()
            && escrows
                .iter()
                .all(|e| e.status == EscrowStatus::Cancelled)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::timelock::tests::sample;

    pub(crate) fn input() -> OrderInput {
        OrderInput {
            id: Some("order-1".to_string()),
            maker: "0x1111111111111111111111111111111111111111".to_string(),
            receiver: Some("0:2222222222222222222222222222222222222222222222222222222222222222".to_string()),
            maker_asset: "native".to_string(),
            maker_amount: U256::exp10(18),
            taker_asset: "native".to_string(),
            taker_amount: U256::exp10(18) * 2,
            src_chain_id: 1,
            dst_chain_id: -239,
            secret_hash: Secret::new([9u8; 32]).hashlock().to_hex(),
            time_locks: sample(),
            src_safety_deposit: U256::from(1_000u64),
            dst_safety_deposit: U256::from(2_000u64),
        }
    }

    #[test]
    fn test_from_input_sets_lifecycle_fields() {
        let now = Utc::now();
        let order = Order::from_input(input(), now, 600).unwrap();
        assert_eq!(order.status, OrderStatus::Created);
        assert_eq!(order.expires_at, now + Duration::seconds(7_800));
        assert_eq!(
            order.receiver(),
            "0:2222222222222222222222222222222222222222222222222222222222222222"
        );
    }

    #[test]
    fn test_generates_id_when_absent() {
        let mut raw = input();
        raw.id = None;
        let order = Order::from_input(raw, Utc::now(), 600).unwrap();
        assert!(uuid::Uuid::parse_str(&order.id).is_ok());
    }

    #[test]
    fn test_rejects_malformed_orders() {
        let mut zero = input();
        zero.maker_amount = U256::zero();
        assert!(matches!(
            Order::from_input(zero, Utc::now(), 600),
            Err(SwapError::Validation(_))
        ));

        let mut same_chain = input();
        same_chain.dst_chain_id = 1;
        assert!(Order::from_input(same_chain, Utc::now(), 600).is_err());

        let mut bad_hash = input();
        bad_hash.secret_hash = "0xdeadbeef".to_string();
        assert!(Order::from_input(bad_hash, Utc::now(), 600).is_err());

        let mut bad_id = input();
        bad_id.id = Some("has spaces".to_string());
        assert!(Order::from_input(bad_id, Utc::now(), 600).is_err());

        // margin larger than the gap between the two cancellation offsets
        assert!(Order::from_input(input(), Utc::now(), 5_000).is_err());
    }

    #[test]
    fn test_status_is_monotonic() {
        use OrderStatus::*;
        assert!(Created.can_transition_to(SrcEscrowDeployed));
        assert!(EscrowsReady.can_transition_to(SecretRevealed));
        assert!(!EscrowsReady.can_transition_to(DstEscrowDeployed));
        assert!(!SrcWithdrawn.can_transition_to(SrcWithdrawn));
        assert!(DstWithdrawn.can_transition_to(Failed));
        assert!(Created.can_transition_to(Cancelled));
        assert!(DstEscrowDeployed.has_reached(SrcEscrowDeployed));
        assert!(!Created.has_reached(SrcEscrowDeployed));
        assert!(!Failed.has_reached(Completed));
    }

    #[test]
    fn test_terminal_states_absorb() {
        use OrderStatus::*;
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(EscrowsReady));
        assert!(Failed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_transition_rejects_backwards_move() {
        let mut order = Order::from_input(input(), Utc::now(), 600).unwrap();
        order.transition(OrderStatus::SrcEscrowDeployed, Utc::now()).unwrap();
        let err = order
            .transition(OrderStatus::Created, Utc::now())
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidState { .. }));
        assert_eq!(order.status, OrderStatus::SrcEscrowDeployed);
    }

    #[test]
    fn test_amounts_serialize_as_decimal() {
        let order = Order::from_input(input(), Utc::now(), 600).unwrap();
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["makerAmount"], "1000000000000000000");
        assert_eq!(json["takerAmount"], "2000000000000000000");
        assert_eq!(json["status"], "CREATED");

        let back: Order = serde_json::from_value(json).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn test_amount_parsing_accepts_hex() {
        assert_eq!(decimal_u256::parse("0x10").unwrap(), U256::from(16u64));
        assert!(decimal_u256::parse("1.5").is_err());
    }
}
