use chrono::{Days, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Money in minor currency units.
pub type Amount = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Milliseconds of `date` at `time`, anchored at UTC.
pub fn date_time_ms(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

/// The whole calendar day `[date 00:00, date+1 00:00)`.
pub fn day_span(date: NaiveDate) -> Span {
    let start = date_time_ms(date, NaiveTime::MIN);
    let end = date
        .checked_add_days(Days::new(1))
        .map(|next| date_time_ms(next, NaiveTime::MIN))
        .unwrap_or(start + 86_400_000);
    Span::new(start, end)
}

/// A scheduled booking window on one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Slot {
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self { date, start, end }
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }

    /// Caller must have checked `is_well_formed`.
    pub fn span(&self) -> Span {
        Span::new(
            date_time_ms(self.date, self.start),
            date_time_ms(self.date, self.end),
        )
    }
}

// ── Stores and rooms ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: Ulid,
    pub name: String,
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
}

impl Store {
    /// Operating hours on `date`. A store that closes at or before it opens
    /// (e.g. closes at 00:00) runs until the end of the day.
    pub fn operating_window(&self, date: NaiveDate) -> Span {
        let day = day_span(date);
        let open = date_time_ms(date, self.opens_at);
        let close = if self.closes_at > self.opens_at {
            date_time_ms(date, self.closes_at)
        } else {
            day.end
        };
        Span::new(open, close)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Normal,
    Maintenance,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub store_id: Ulid,
    pub name: String,
    pub min_players: u32,
    pub max_players: u32,
    pub status: RoomStatus,
}

impl Room {
    pub fn fits(&self, participants: u32) -> bool {
        self.min_players <= participants && participants <= self.max_players
    }

    pub fn is_bookable(&self) -> bool {
        self.status == RoomStatus::Normal
    }
}

/// How an order occupies its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    /// Pending order: shown on the schedule, never blocks.
    Tentative,
    /// Confirmed or running order: blocks overlapping claims.
    Reserved,
}

/// An order's claim on a room, keyed by order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn is_blocking(&self) -> bool {
        self.kind == IntervalKind::Reserved
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub info: Room,
    /// Claims of every order that still holds the room, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl RoomState {
    pub fn new(info: Room) -> Self {
        Self {
            info,
            intervals: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.info.id
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by order id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn set_kind(&mut self, id: Ulid, kind: IntervalKind) {
        if let Some(interval) = self.intervals.iter_mut().find(|i| i.id == id) {
            interval.kind = kind;
        }
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

// ── Orders ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    Refunded,
    PartiallyRefunded,
    NoShow,
    /// Transient: only ever recorded in history, never the resting status.
    Rescheduled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
            OrderStatus::PartiallyRefunded => "partially_refunded",
            OrderStatus::NoShow => "no_show",
            OrderStatus::Rescheduled => "rescheduled",
        }
    }

    /// Orders in these states block overlapping claims on their room.
    pub fn blocks_room(&self) -> bool {
        matches!(self, OrderStatus::Confirmed | OrderStatus::InProgress)
    }

    /// Orders in these states keep an interval on their room.
    pub fn holds_room(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::InProgress
        )
    }

    pub fn interval_kind(&self) -> Option<IntervalKind> {
        match self {
            OrderStatus::Pending => Some(IntervalKind::Tentative),
            OrderStatus::Confirmed | OrderStatus::InProgress => Some(IntervalKind::Reserved),
            _ => None,
        }
    }

    /// The bounded field set may only change in these states.
    pub fn is_editable(&self) -> bool {
        self.holds_room()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub at: Ms,
    pub actor: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLine {
    pub label: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Ulid,
    pub tenant_id: String,
    pub store_id: Ulid,
    pub product_ref: String,
    pub product_name: String,
    pub room_id: Option<Ulid>,
    pub slot: Slot,
    pub actual_start: Option<Ms>,
    pub actual_end: Option<Ms>,
    pub participant_count: u32,
    pub language: Option<String>,
    pub notes: Option<String>,
    pub status: OrderStatus,
    pub operator_id: Option<Ulid>,
    /// Final price handed over by the pricing collaborator; never recomputed implicitly.
    pub total: Amount,
    pub price_breakdown: Vec<PriceLine>,
    pub created_at: Ms,
    pub created_by: Ulid,
    pub history: Vec<StatusChange>,
}

impl Order {
    pub fn span(&self) -> Span {
        self.slot.span()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerPaymentStatus {
    Pending,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlayer {
    pub id: Ulid,
    pub order_id: Ulid,
    pub role_name: String,
    pub display_name: String,
    pub contact: Option<String>,
    /// Passed back to pricing whenever the order is re-priced.
    pub discount_ref: Option<String>,
    pub price: Amount,
    pub payment_status: PlayerPaymentStatus,
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
    /// Fully refunded. Partial refunds leave the payment `Confirmed`.
    Refunded,
    /// Folded into another payment by a merge.
    Voided,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Voided => "voided",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    MobileWallet,
    Voucher,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayment {
    pub id: Ulid,
    pub order_id: Ulid,
    /// Players settled by this payment. A reference, not ownership.
    pub covered_players: Vec<Ulid>,
    pub amount: Amount,
    pub method: PaymentMethod,
    pub payer: String,
    pub proofs: Vec<String>,
    pub status: PaymentStatus,
    pub confirmed_at: Option<Ms>,
    pub refunded_amount: Amount,
    pub merged_into: Option<Ulid>,
    pub created_at: Ms,
}

impl OrderPayment {
    pub fn refundable(&self) -> Amount {
        self.amount - self.refunded_amount
    }

    pub fn covers(&self, player_id: &Ulid) -> bool {
        self.covered_players.contains(player_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub id: Ulid,
    pub payment_id: Ulid,
    pub order_id: Ulid,
    pub amount: Amount,
    pub reason: String,
    pub created_at: Ms,
    pub created_by: Ulid,
}

/// Order-level payment status. Always derived from payments, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPaymentStatus {
    Unpaid,
    Partial,
    Paid,
    Refunded,
    PartiallyRefunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentSummary {
    pub status: OrderPaymentStatus,
    pub total: Amount,
    /// Gross amount of confirmed payments, refunds not subtracted.
    pub confirmed_total: Amount,
    pub refunded_total: Amount,
    pub outstanding: Amount,
    pub overpaid: bool,
}

/// Fields of the bounded edit set after an edit has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedEdit {
    pub participant_count: u32,
    pub language: Option<String>,
    pub notes: Option<String>,
    pub product_ref: String,
    pub product_name: String,
    pub room_id: Option<Ulid>,
    pub total: Amount,
    pub price_breakdown: Vec<PriceLine>,
}

/// The event types. This is the WAL record format; every mutating
/// operation commits exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StoreUpserted {
        store: Store,
    },
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    OrderCreated {
        order: Order,
        players: Vec<OrderPlayer>,
        initial_payment: Option<OrderPayment>,
    },
    OrderTransitioned {
        id: Ulid,
        room_id: Option<Ulid>,
        change: StatusChange,
    },
    JobStarted {
        id: Ulid,
        room_id: Option<Ulid>,
        operator_id: Ulid,
        change: StatusChange,
    },
    JobCompleted {
        id: Ulid,
        room_id: Option<Ulid>,
        operator_id: Ulid,
        change: StatusChange,
    },
    OrderRescheduled {
        id: Ulid,
        from_room: Option<Ulid>,
        room_id: Ulid,
        slot: Slot,
        changes: Vec<StatusChange>,
    },
    OperatorAssigned {
        id: Ulid,
        operator_id: Option<Ulid>,
    },
    OrderEdited {
        id: Ulid,
        from_room: Option<Ulid>,
        edit: AppliedEdit,
    },
    /// Full order state, written only by WAL compaction.
    OrderRestored {
        order: Order,
        players: Vec<OrderPlayer>,
        payments: Vec<OrderPayment>,
        refunds: Vec<RefundRecord>,
    },
    PlayersAdded {
        order_id: Ulid,
        players: Vec<OrderPlayer>,
        participant_count: u32,
        total: Amount,
        price_breakdown: Vec<PriceLine>,
    },
    PaymentRecorded {
        payment: OrderPayment,
    },
    PaymentConfirmed {
        id: Ulid,
        order_id: Ulid,
        at: Ms,
    },
    PaymentFailed {
        id: Ulid,
        order_id: Ulid,
    },
    ProofAttached {
        id: Ulid,
        order_id: Ulid,
        reference: String,
    },
    PaymentsMerged {
        order_id: Ulid,
        merged: OrderPayment,
        voided: Vec<Ulid>,
    },
    PaymentRefunded {
        refund: RefundRecord,
        change: Option<StatusChange>,
    },
}

impl Event {
    /// The order this event mutates, if any.
    pub fn order_id(&self) -> Option<Ulid> {
        match self {
            Event::OrderCreated { order, .. } | Event::OrderRestored { order, .. } => {
                Some(order.id)
            }
            Event::OrderTransitioned { id, .. }
            | Event::JobStarted { id, .. }
            | Event::JobCompleted { id, .. }
            | Event::OrderRescheduled { id, .. }
            | Event::OperatorAssigned { id, .. }
            | Event::OrderEdited { id, .. } => Some(*id),
            Event::PlayersAdded { order_id, .. }
            | Event::PaymentConfirmed { order_id, .. }
            | Event::PaymentFailed { order_id, .. }
            | Event::ProofAttached { order_id, .. }
            | Event::PaymentsMerged { order_id, .. } => Some(*order_id),
            Event::PaymentRecorded { payment } => Some(payment.order_id),
            Event::PaymentRefunded { refund, .. } => Some(refund.order_id),
            Event::StoreUpserted { .. } | Event::RoomCreated { .. } | Event::RoomUpdated { .. } => {
                None
            }
        }
    }

    /// Rooms whose interval list this event touches, ascending and deduplicated.
    pub fn room_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = match self {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => vec![room.id],
            Event::OrderCreated { order, .. } | Event::OrderRestored { order, .. } => {
                order.room_id.into_iter().collect()
            }
            Event::OrderTransitioned { room_id, .. }
            | Event::JobStarted { room_id, .. }
            | Event::JobCompleted { room_id, .. } => room_id.iter().copied().collect(),
            Event::OrderRescheduled {
                from_room, room_id, ..
            } => from_room.iter().copied().chain([*room_id]).collect(),
            Event::OrderEdited {
                from_room, edit, ..
            } => from_room.iter().chain(edit.room_id.iter()).copied().collect(),
            _ => Vec::new(),
        };
        ids.sort();
        ids.dedup();
        ids
    }
}
