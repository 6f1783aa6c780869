use thiserror::Error;
use ulid::Ulid;

use crate::model::OrderStatus;

/// What an operation collided with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictKind {
    /// The room already has a blocking order overlapping the interval.
    #[error("room already booked by order {order_id}")]
    RoomBooked { order_id: Ulid },
    /// The operator is already running another order.
    #[error("operator already running order {order_id}")]
    OperatorBusy { order_id: Ulid },
    /// The player is already settled by another confirmed payment.
    #[error("player {player_id} already settled by payment {payment_id}")]
    AlreadyCovered { player_id: Ulid, payment_id: Ulid },
    /// Auto-assignment found no room free for the whole interval.
    #[error("no room available for the interval")]
    NoRoomAvailable,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("illegal transition from {current} to {attempted}")]
    State {
        current: OrderStatus,
        attempted: OrderStatus,
    },
    /// Payment-level transition that is not allowed from the payment's status.
    #[error("payment {id} is {status}, cannot {action}")]
    PaymentState {
        id: Ulid,
        status: &'static str,
        action: &'static str,
    },
    #[error("not permitted")]
    Scope,
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Stable label used for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::State { .. } | EngineError::PaymentState { .. } => "state",
            EngineError::Scope => "scope",
            EngineError::Infrastructure(_) => "infrastructure",
        }
    }

    pub fn conflict_label(&self) -> Option<&'static str> {
        match self {
            EngineError::Conflict(kind) => Some(match kind {
                ConflictKind::RoomBooked { .. } => "room_booked",
                ConflictKind::OperatorBusy { .. } => "operator_busy",
                ConflictKind::AlreadyCovered { .. } => "already_covered",
                ConflictKind::NoRoomAvailable => "no_room_available",
            }),
            _ => None,
        }
    }
}
