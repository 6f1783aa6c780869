//! Booking use cases composed from the engine and the external collaborators.
//!
//! Catalog and pricing lookups happen before the engine commit; the commit
//! itself is always one engine call, so a failure at any step leaves nothing
//! behind.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::actor::{Actor, Capability};
use crate::collab::{Catalog, FileStore, Participant, PriceQuote, Pricing, ProductConstraints};
use crate::engine::{Basis, ConflictKind, Engine, EngineError, NewOrder, now_ms};
use crate::limits::*;
use crate::model::*;
use crate::observability::observe;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInput {
    pub role_name: String,
    pub display_name: String,
    pub contact: Option<String>,
    pub discount_ref: Option<String>,
}

/// A payment taken together with the booking. It covers every player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialPayment {
    pub amount: Amount,
    pub method: PaymentMethod,
    pub payer: String,
    pub proofs: Vec<String>,
    /// A confirmed initial payment creates the order `confirmed`.
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub store_id: Ulid,
    pub product_ref: String,
    /// `None` picks the first free room of the store by name.
    pub room_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    /// Defaults to `start` plus the product's duration.
    pub end: Option<NaiveTime>,
    /// Defaults to the number of players. Missing players become guest slots.
    pub participant_count: Option<u32>,
    pub players: Vec<PlayerInput>,
    pub language: Option<String>,
    pub notes: Option<String>,
    pub operator_id: Option<Ulid>,
    pub initial_payment: Option<InitialPayment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedOrder {
    pub order_id: Ulid,
    pub room_id: Ulid,
    pub status: OrderStatus,
    pub player_ids: Vec<Ulid>,
    pub payment_id: Option<Ulid>,
    pub total: Amount,
}

/// What `pre_check_booking` is asked about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingQuery {
    pub store_id: Ulid,
    pub room_id: Option<Ulid>,
    pub slot: Slot,
    pub participant_count: u32,
}

/// Snapshot answer of `pre_check_booking`; a later create may still conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreCheck {
    pub available: bool,
    /// The room that would be booked.
    pub room_id: Option<Ulid>,
    /// Blocking orders on the requested room.
    pub conflicts: Vec<Ulid>,
}

/// Changes to the bounded field set. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEdit {
    pub participant_count: Option<u32>,
    pub language: Option<String>,
    pub notes: Option<String>,
    pub product_ref: Option<String>,
    pub room_id: Option<Ulid>,
}

async fn observed<T>(
    op: &'static str,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    let started = Instant::now();
    let result = fut.await;
    observe(op, started, &result);
    result
}

fn check_bounds(constraints: &ProductConstraints, participants: u32) -> Result<(), EngineError> {
    if participants < constraints.min_participants || participants > constraints.max_participants {
        return Err(EngineError::validation(format!(
            "{} takes {}..={} participants, got {participants}",
            constraints.display_name, constraints.min_participants, constraints.max_participants
        )));
    }
    Ok(())
}

fn check_player(player: &PlayerInput) -> Result<(), EngineError> {
    if player.role_name.len() > MAX_NAME_LEN
        || player.display_name.len() > MAX_NAME_LEN
        || player.contact.as_ref().is_some_and(|c| c.len() > MAX_NAME_LEN)
    {
        return Err(EngineError::LimitExceeded("player field too long"));
    }
    Ok(())
}

/// Guest slots fill the order up to its participant count.
fn guest(n: usize) -> PlayerInput {
    PlayerInput {
        role_name: "guest".into(),
        display_name: format!("Guest {n}"),
        contact: None,
        discount_ref: None,
    }
}

fn participants_of<'a>(players: impl IntoIterator<Item = (&'a str, Option<&'a String>)>) -> Vec<Participant> {
    players
        .into_iter()
        .map(|(role, discount)| Participant {
            role_name: role.to_string(),
            discount_ref: discount.cloned(),
        })
        .collect()
}

fn check_quote(quote: &PriceQuote, participants: usize) -> Result<(), EngineError> {
    if quote.breakdown.len() != participants {
        return Err(EngineError::Infrastructure(format!(
            "pricing returned {} lines for {participants} participants",
            quote.breakdown.len()
        )));
    }
    if quote.final_amount < 0 || quote.final_amount > MAX_AMOUNT {
        return Err(EngineError::Infrastructure(format!(
            "pricing returned out-of-range total {}",
            quote.final_amount
        )));
    }
    Ok(())
}

fn end_of(start: NaiveTime, minutes: u32) -> Result<NaiveTime, EngineError> {
    let (end, wrapped) = start.overflowing_add_signed(TimeDelta::minutes(i64::from(minutes)));
    if wrapped != 0 || end == NaiveTime::MIN {
        return Err(EngineError::validation("booking would run past midnight"));
    }
    Ok(end)
}

pub struct Orchestrator {
    engine: Arc<Engine>,
    catalog: Arc<dyn Catalog>,
    pricing: Arc<dyn Pricing>,
    files: Option<Arc<dyn FileStore>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>, catalog: Arc<dyn Catalog>, pricing: Arc<dyn Pricing>) -> Self {
        Self {
            engine,
            catalog,
            pricing,
            files: None,
        }
    }

    pub fn with_file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Validate against the product, price once, then commit order, players
    /// and optional initial payment as a single unit.
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
        actor: &Actor,
    ) -> Result<CreatedOrder, EngineError> {
        observed("create_order", self.create_order_inner(request, actor)).await
    }

    async fn create_order_inner(
        &self,
        request: CreateOrderRequest,
        actor: &Actor,
    ) -> Result<CreatedOrder, EngineError> {
        actor.require(Capability::CreateOrder)?;
        if request.players.len() > MAX_PLAYERS_PER_ORDER {
            return Err(EngineError::LimitExceeded("too many players"));
        }
        if request.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        for player in &request.players {
            check_player(player)?;
        }

        let constraints = self.catalog.product_constraints(&request.product_ref).await?;
        let participant_count = request
            .participant_count
            .unwrap_or(request.players.len() as u32)
            .max(request.players.len() as u32);
        check_bounds(&constraints, participant_count)?;
        if participant_count as usize > MAX_PLAYERS_PER_ORDER {
            return Err(EngineError::LimitExceeded("too many participants"));
        }

        let end = match request.end {
            Some(end) => end,
            None => end_of(request.start, constraints.duration_minutes)?,
        };
        let slot = Slot::new(request.date, request.start, end);
        if !slot.is_well_formed() {
            return Err(EngineError::validation("booking must end after it starts"));
        }

        let mut inputs = request.players;
        let named = inputs.len();
        inputs.extend((named..participant_count as usize).map(|i| guest(i + 1)));
        let quote = self
            .pricing
            .compute_order_price(
                &request.product_ref,
                &participants_of(inputs.iter().map(|p| (p.role_name.as_str(), p.discount_ref.as_ref()))),
                request.date,
            )
            .await?;
        check_quote(&quote, inputs.len())?;

        let now = now_ms();
        let order_id = Ulid::new();
        let players: Vec<OrderPlayer> = inputs
            .into_iter()
            .zip(&quote.breakdown)
            .map(|(input, line)| OrderPlayer {
                id: Ulid::new(),
                order_id,
                role_name: input.role_name,
                display_name: input.display_name,
                contact: input.contact,
                discount_ref: input.discount_ref,
                price: line.amount,
                payment_status: PlayerPaymentStatus::Pending,
            })
            .collect();
        let player_ids: Vec<Ulid> = players.iter().map(|p| p.id).collect();

        let initial_payment = match request.initial_payment {
            Some(initial) => {
                if initial.amount <= 0 || initial.amount > MAX_AMOUNT {
                    return Err(EngineError::validation("initial payment amount out of range"));
                }
                if initial.proofs.len() > MAX_PROOFS_PER_PAYMENT {
                    return Err(EngineError::LimitExceeded("too many proofs"));
                }
                Some(OrderPayment {
                    id: Ulid::new(),
                    order_id,
                    covered_players: player_ids.clone(),
                    amount: initial.amount,
                    method: initial.method,
                    payer: initial.payer,
                    proofs: initial.proofs,
                    status: if initial.confirmed {
                        PaymentStatus::Confirmed
                    } else {
                        PaymentStatus::Pending
                    },
                    confirmed_at: initial.confirmed.then_some(now),
                    refunded_amount: 0,
                    merged_into: None,
                    created_at: now,
                })
            }
            None => None,
        };
        let status = match &initial_payment {
            Some(p) if p.status == PaymentStatus::Confirmed => OrderStatus::Confirmed,
            _ => OrderStatus::Pending,
        };
        let payment_id = initial_payment.as_ref().map(|p| p.id);

        let order = Order {
            id: order_id,
            tenant_id: actor.tenant_id.clone(),
            store_id: request.store_id,
            product_ref: request.product_ref,
            product_name: constraints.display_name,
            room_id: request.room_id,
            slot,
            actual_start: None,
            actual_end: None,
            participant_count,
            language: request.language,
            notes: request.notes,
            status,
            operator_id: request.operator_id,
            total: quote.final_amount,
            price_breakdown: quote.breakdown,
            created_at: now,
            created_by: actor.user_id,
            history: Vec::new(),
        };
        let total = order.total;
        let room_id = self
            .engine
            .insert_order(
                NewOrder {
                    order,
                    players,
                    initial_payment,
                },
                actor,
            )
            .await?;

        Ok(CreatedOrder {
            order_id,
            room_id,
            status,
            player_ids,
            payment_id,
            total,
        })
    }

    /// Read-only dry run: would the booking be taken right now? Not race-free
    /// on its own; `create_order` re-checks under the room lock.
    pub async fn pre_check_booking(&self, query: &BookingQuery, actor: &Actor) -> Result<PreCheck, EngineError> {
        observed("pre_check_booking", async {
            match query.room_id {
                Some(room_id) => {
                    let (available, conflicts) = self
                        .engine
                        .room_accepts(query.store_id, room_id, &query.slot, query.participant_count, actor)
                        .await?;
                    Ok(PreCheck {
                        available,
                        room_id: Some(room_id),
                        conflicts,
                    })
                }
                None => {
                    let room_id = self
                        .engine
                        .find_free_room(query.store_id, &query.slot, query.participant_count, actor)
                        .await?;
                    Ok(PreCheck {
                        available: room_id.is_some(),
                        room_id,
                        conflicts: Vec::new(),
                    })
                }
            }
        })
        .await
    }

    /// Add players to a group booking. The whole group is re-priced; the new
    /// total replaces the old one.
    pub async fn append_players(
        &self,
        order_id: Ulid,
        players: Vec<PlayerInput>,
        actor: &Actor,
    ) -> Result<Vec<Ulid>, EngineError> {
        observed("append_players", async {
            actor.require(Capability::EditOrder)?;
            for player in &players {
                check_player(player)?;
            }
            let detail = self.engine.get_order(order_id, actor).await?;
            let basis = Basis::of(&detail.order, detail.players.len());
            let constraints = self.catalog.product_constraints(&detail.order.product_ref).await?;
            let count = detail.order.participant_count.max((detail.players.len() + players.len()) as u32);
            check_bounds(&constraints, count)?;

            let everyone = detail
                .players
                .iter()
                .map(|p| (p.role_name.as_str(), p.discount_ref.as_ref()))
                .chain(players.iter().map(|p| (p.role_name.as_str(), p.discount_ref.as_ref())));
            let quote = self
                .pricing
                .compute_order_price(&detail.order.product_ref, &participants_of(everyone), detail.order.slot.date)
                .await?;
            check_quote(&quote, detail.players.len() + players.len())?;

            let new_players: Vec<OrderPlayer> = players
                .into_iter()
                .zip(&quote.breakdown[detail.players.len()..])
                .map(|(input, line)| OrderPlayer {
                    id: Ulid::new(),
                    order_id,
                    role_name: input.role_name,
                    display_name: input.display_name,
                    contact: input.contact,
                    discount_ref: input.discount_ref,
                    price: line.amount,
                    payment_status: PlayerPaymentStatus::Pending,
                })
                .collect();
            let ids: Vec<Ulid> = new_players.iter().map(|p| p.id).collect();
            self.engine
                .add_players(order_id, new_players, quote.final_amount, quote.breakdown, &basis, actor)
                .await?;
            Ok(ids)
        })
        .await
    }

    /// Edit the bounded field set. A new product or participant count is
    /// checked against the catalog and re-priced; other edits keep the price.
    pub async fn edit_order(&self, order_id: Ulid, edit: OrderEdit, actor: &Actor) -> Result<(), EngineError> {
        observed("edit_order", async {
            actor.require(Capability::EditOrder)?;
            let detail = self.engine.get_order(order_id, actor).await?;
            let order = &detail.order;
            let basis = Basis::of(order, detail.players.len());

            let product_ref = edit.product_ref.unwrap_or_else(|| order.product_ref.clone());
            let participant_count = edit.participant_count.unwrap_or(order.participant_count);
            let reprice = product_ref != order.product_ref || participant_count != order.participant_count;

            let mut applied = AppliedEdit {
                participant_count,
                language: edit.language.or_else(|| order.language.clone()),
                notes: edit.notes.or_else(|| order.notes.clone()),
                product_ref,
                product_name: order.product_name.clone(),
                room_id: edit.room_id.or(order.room_id),
                total: order.total,
                price_breakdown: order.price_breakdown.clone(),
            };
            if reprice {
                if (participant_count as usize) < detail.players.len() {
                    return Err(EngineError::validation(format!(
                        "order already has {} players",
                        detail.players.len()
                    )));
                }
                let constraints = self.catalog.product_constraints(&applied.product_ref).await?;
                check_bounds(&constraints, participant_count)?;
                let mut participants = participants_of(
                    detail
                        .players
                        .iter()
                        .map(|p| (p.role_name.as_str(), p.discount_ref.as_ref())),
                );
                participants.extend((detail.players.len()..participant_count as usize).map(|_| Participant {
                    role_name: "guest".into(),
                    discount_ref: None,
                }));
                let quote = self
                    .pricing
                    .compute_order_price(&applied.product_ref, &participants, order.slot.date)
                    .await?;
                check_quote(&quote, participants.len())?;
                applied.product_name = constraints.display_name;
                applied.total = quote.final_amount;
                applied.price_breakdown = quote.breakdown;
            }
            self.engine.apply_edit(order_id, applied, Some(&basis), actor).await
        })
        .await
    }

    /// Move an order. Without a room the current room is kept when it is
    /// free for the new slot, otherwise the first free room of the store is taken.
    pub async fn reschedule(
        &self,
        order_id: Ulid,
        room_id: Option<Ulid>,
        slot: Slot,
        actor: &Actor,
    ) -> Result<Ulid, EngineError> {
        observed("reschedule", async {
            actor.require(Capability::RescheduleOrder)?;
            let target = match room_id {
                Some(room_id) => room_id,
                None => {
                    let detail = self.engine.get_order(order_id, actor).await?;
                    let order = detail.order;
                    let mut current = None;
                    if let Some(room) = order.room_id
                        && self.engine.is_slot_free(room, &slot, Some(order_id), actor).await?
                    {
                        current = Some(room);
                    }
                    match current {
                        Some(current) => current,
                        None => self
                            .engine
                            .find_free_room(order.store_id, &slot, order.participant_count, actor)
                            .await?
                            .ok_or(EngineError::Conflict(ConflictKind::NoRoomAvailable))?,
                    }
                }
            };
            self.engine.reschedule(order_id, target, slot, actor).await?;
            Ok(target)
        })
        .await
    }

    pub async fn start_job(&self, order_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        observed("start_job", self.engine.start_job(order_id, actor)).await
    }

    pub async fn complete_job(&self, order_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        observed("complete_job", self.engine.complete_job(order_id, actor)).await
    }

    pub async fn refund(
        &self,
        payment_id: Ulid,
        amount: Amount,
        reason: String,
        actor: &Actor,
    ) -> Result<Ulid, EngineError> {
        observed("refund", self.engine.refund_payment(payment_id, amount, reason, actor)).await
    }

    /// Store a proof file and attach its reference to a pending payment.
    pub async fn attach_proof(
        &self,
        payment_id: Ulid,
        name: &str,
        bytes: Vec<u8>,
        actor: &Actor,
    ) -> Result<String, EngineError> {
        observed("attach_proof", async {
            actor.require(Capability::RecordPayment)?;
            if actor.tenant_id != self.engine.tenant_id() {
                return Err(EngineError::Scope);
            }
            if bytes.is_empty() || bytes.len() > MAX_PROOF_BYTES {
                return Err(EngineError::LimitExceeded("proof size out of range"));
            }
            let files = self
                .files
                .as_ref()
                .ok_or_else(|| EngineError::Infrastructure("no file store configured".into()))?;
            let reference = files.put(name, bytes).await?;
            self.engine
                .attach_proof(payment_id, reference.clone(), actor)
                .await?;
            Ok(reference)
        })
        .await
    }
}
