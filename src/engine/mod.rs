mod availability;
mod conflict;
mod error;
mod ledger;
mod lifecycle;
mod mutations;
mod queries;

pub use availability::{RoomSchedule, merge_overlapping, subtract_intervals};
pub use conflict::conflicts_in;
pub(crate) use conflict::now_ms;
pub use error::{ConflictKind, EngineError};
pub use ledger::{MergeAttributes, PaymentRequest, summarize};
pub use lifecycle::can_transition;
pub use mutations::{Basis, NewOrder};
pub use queries::{AuditViolation, OrderDetail};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};
use tracing::{debug, error};
use ulid::Ulid;

use crate::actor::{Actor, Capability};
use crate::limits::MAX_LOCK_RETRIES;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub type SharedOrderState = Arc<RwLock<OrderState>>;
pub type SharedOperatorSlot = Arc<Mutex<Option<Ulid>>>;

/// An order together with everything it exclusively owns or references.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub order: Order,
    pub players: Vec<OrderPlayer>,
    pub payments: Vec<OrderPayment>,
    pub refunds: Vec<RefundRecord>,
}

impl OrderState {
    pub fn payment(&self, id: &Ulid) -> Option<&OrderPayment> {
        self.payments.iter().find(|p| p.id == *id)
    }

    pub fn payment_mut(&mut self, id: &Ulid) -> Option<&mut OrderPayment> {
        self.payments.iter_mut().find(|p| p.id == *id)
    }

    pub fn player_mut(&mut self, id: &Ulid) -> Option<&mut OrderPlayer> {
        self.players.iter_mut().find(|p| p.id == *id)
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    error!("WAL flush failed for {} events: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Applying events ──────────────────────────────────────

/// Re-derive a room's claim for `order` from the order's current room and status.
fn sync_room(rs: &mut RoomState, order: &Order) {
    rs.remove_interval(order.id);
    if order.room_id == Some(rs.id())
        && let Some(kind) = order.status.interval_kind()
    {
        rs.insert_interval(Interval {
            id: order.id,
            span: order.span(),
            kind,
        });
    }
}

/// Apply an event to a room (no locking; caller holds the lock). `order` is
/// the order's state after the same event was applied to it.
fn apply_to_room(rs: &mut RoomState, event: &Event, order: Option<&Order>) {
    match event {
        Event::RoomUpdated { room } if room.id == rs.id() => rs.info = room.clone(),
        Event::RoomCreated { .. } | Event::RoomUpdated { .. } | Event::StoreUpserted { .. } => {}
        _ => {
            if let Some(order) = order {
                sync_room(rs, order);
            }
        }
    }
}

/// Apply an event to an order (no locking; caller holds the lock).
fn apply_to_order(os: &mut OrderState, event: &Event, payment_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::OrderTransitioned { change, .. } => {
            lifecycle::record_change(&mut os.order, change);
            if change.to == OrderStatus::Cancelled {
                ledger::release_unpaid_players(os);
            }
        }
        Event::JobStarted {
            operator_id,
            change,
            ..
        } => {
            os.order.operator_id = Some(*operator_id);
            os.order.actual_start = Some(change.at);
            lifecycle::record_change(&mut os.order, change);
        }
        Event::JobCompleted { change, .. } => {
            os.order.actual_end = Some(change.at);
            lifecycle::record_change(&mut os.order, change);
        }
        Event::OrderRescheduled {
            room_id,
            slot,
            changes,
            ..
        } => {
            os.order.room_id = Some(*room_id);
            os.order.slot = *slot;
            for change in changes {
                lifecycle::record_change(&mut os.order, change);
            }
        }
        Event::OperatorAssigned { operator_id, .. } => {
            os.order.operator_id = *operator_id;
        }
        Event::OrderEdited { edit, .. } => {
            let order = &mut os.order;
            order.participant_count = edit.participant_count;
            order.language = edit.language.clone();
            order.notes = edit.notes.clone();
            order.product_ref = edit.product_ref.clone();
            order.product_name = edit.product_name.clone();
            order.room_id = edit.room_id;
            order.total = edit.total;
            order.price_breakdown = edit.price_breakdown.clone();
        }
        Event::PlayersAdded {
            players,
            participant_count,
            total,
            price_breakdown,
            ..
        } => {
            os.players.extend(players.iter().cloned());
            os.order.participant_count = *participant_count;
            os.order.total = *total;
            os.order.price_breakdown = price_breakdown.clone();
        }
        Event::PaymentRecorded { .. }
        | Event::PaymentConfirmed { .. }
        | Event::PaymentFailed { .. }
        | Event::ProofAttached { .. }
        | Event::PaymentsMerged { .. }
        | Event::PaymentRefunded { .. } => ledger::apply(os, event, payment_index),
        Event::OrderCreated { .. }
        | Event::OrderRestored { .. }
        | Event::StoreUpserted { .. }
        | Event::RoomCreated { .. }
        | Event::RoomUpdated { .. } => {}
    }
}

/// Apply an event to an operator's active-job slot.
fn apply_to_operator(slot: &mut Option<Ulid>, event: &Event) {
    match event {
        Event::JobStarted { id, .. } => *slot = Some(*id),
        Event::JobCompleted { id, .. } if *slot == Some(*id) => *slot = None,
        _ => {}
    }
}

fn operator_of(event: &Event) -> Option<Ulid> {
    match event {
        Event::JobStarted { operator_id, .. } | Event::JobCompleted { operator_id, .. } => {
            Some(*operator_id)
        }
        _ => None,
    }
}

/// Build the state of an order that enters the engine through `event`.
fn new_order_state(event: &Event, payment_index: &DashMap<Ulid, Ulid>) -> Option<OrderState> {
    let os = match event {
        Event::OrderCreated {
            order,
            players,
            initial_payment,
        } => {
            let mut os = OrderState {
                order: order.clone(),
                players: players.clone(),
                payments: Vec::new(),
                refunds: Vec::new(),
            };
            if let Some(payment) = initial_payment {
                os.payments.push(payment.clone());
                if payment.status == PaymentStatus::Confirmed {
                    ledger::mark_covered_paid(&mut os, payment.id);
                }
            }
            os
        }
        Event::OrderRestored {
            order,
            players,
            payments,
            refunds,
        } => OrderState {
            order: order.clone(),
            players: players.clone(),
            payments: payments.clone(),
            refunds: refunds.clone(),
        },
        _ => return None,
    };
    for payment in &os.payments {
        payment_index.insert(payment.id, os.order.id);
    }
    Some(os)
}

pub struct Engine {
    tenant_id: String,
    pub(super) stores: DashMap<Ulid, Store>,
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) orders: DashMap<Ulid, SharedOrderState>,
    /// Reverse lookup: payment id → order id
    pub(super) payment_to_order: DashMap<Ulid, Ulid>,
    /// Operator id → order currently in progress.
    pub(super) operators: DashMap<Ulid, SharedOperatorSlot>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Every mutation holds this shared for its whole duration; compaction
    /// holds it exclusively so the snapshot and the log cannot diverge.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(tenant_id: impl Into<String>, wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tenant_id: tenant_id.into(),
            stores: DashMap::new(),
            rooms: DashMap::new(),
            orders: DashMap::new(),
            payment_to_order: DashMap::new(),
            operators: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
        };

        // We're the sole owner of these Arcs, so try_read/try_write always
        // succeed instantly. Never use blocking_read/blocking_write here: this
        // may run inside an async context (lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }
        debug!(
            "tenant {} replayed {} events: {} rooms, {} orders",
            engine.tenant_id,
            events.len(),
            engine.rooms.len(),
            engine.orders.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::StoreUpserted { store } => {
                self.stores.insert(store.id, store.clone());
                return;
            }
            Event::RoomCreated { room } => {
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
                return;
            }
            _ => {}
        }

        let order_arc = match new_order_state(event, &self.payment_to_order) {
            Some(os) => {
                if os.order.status == OrderStatus::InProgress
                    && let Some(op) = os.order.operator_id
                {
                    self.operators
                        .insert(op, Arc::new(Mutex::new(Some(os.order.id))));
                }
                let id = os.order.id;
                let arc = Arc::new(RwLock::new(os));
                self.orders.insert(id, arc.clone());
                Some(arc)
            }
            None => match event.order_id().and_then(|id| self.order_handle(&id)) {
                Some(arc) => {
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_order(&mut guard, event, &self.payment_to_order);
                    drop(guard);
                    Some(arc)
                }
                None => None,
            },
        };

        let order_guard = order_arc
            .as_ref()
            .map(|arc| arc.try_read().expect("replay: uncontended read"));
        let order = order_guard.as_ref().map(|g| &g.order);
        for room_id in event.room_ids() {
            if let Some(rs) = self.room(&room_id) {
                let mut guard = rs.try_write().expect("replay: uncontended write");
                apply_to_room(&mut guard, event, order);
            }
        }
        if let Some(op) = operator_of(event) {
            let slot = self.operator_slot(op);
            let mut guard = slot.try_lock().expect("replay: uncontended lock");
            apply_to_operator(&mut guard, event);
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Infrastructure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Infrastructure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Infrastructure(format!("WAL append failed: {e}")))
    }

    /// WAL-append + apply + notify: the single atomic unit of every mutation.
    /// Nothing in memory changes unless the append succeeded. Callers hold the
    /// write locks of every room the event touches and of the order.
    pub(super) async fn commit(
        &self,
        event: Event,
        rooms: &mut [OwnedRwLockWriteGuard<RoomState>],
        order: Option<&mut OrderState>,
        operator: Option<&mut Option<Ulid>>,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;

        let created = new_order_state(&event, &self.payment_to_order);
        let order_ref = match (order, created.as_ref()) {
            (Some(os), _) => {
                apply_to_order(os, &event, &self.payment_to_order);
                Some(&os.order)
            }
            (None, Some(os)) => Some(&os.order),
            (None, None) => None,
        };
        for rs in rooms.iter_mut() {
            apply_to_room(rs, &event, order_ref);
        }
        if let Some(slot) = operator {
            apply_to_operator(slot, &event);
        }
        if let Some(os) = created {
            self.orders.insert(os.order.id, Arc::new(RwLock::new(os)));
        }
        for room_id in event.room_ids() {
            self.notify.send(room_id, &event);
        }
        Ok(())
    }

    /// Tenant check + capability check, then the shared commit gate.
    pub(super) async fn authorize(
        &self,
        actor: &Actor,
        capability: Capability,
    ) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        self.check_tenant(actor)?;
        actor.require(capability)?;
        Ok(self.commit_gate.read().await)
    }

    pub(super) fn check_tenant(&self, actor: &Actor) -> Result<(), EngineError> {
        if actor.tenant_id == self.tenant_id {
            Ok(())
        } else {
            Err(EngineError::Scope)
        }
    }

    pub fn room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn store(&self, id: &Ulid) -> Option<Store> {
        self.stores.get(id).map(|e| e.value().clone())
    }

    pub(super) fn order_handle(&self, id: &Ulid) -> Option<SharedOrderState> {
        self.orders.get(id).map(|e| e.value().clone())
    }

    pub(super) fn operator_slot(&self, operator_id: Ulid) -> SharedOperatorSlot {
        self.operators
            .entry(operator_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    pub fn order_for_payment(&self, payment_id: &Ulid) -> Option<Ulid> {
        self.payment_to_order.get(payment_id).map(|e| *e.value())
    }

    /// Acquire room write locks in ascending id order to prevent deadlocks.
    pub(super) async fn lock_rooms(
        &self,
        ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<RoomState>>, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let rs = self.room(id).ok_or(EngineError::NotFound(*id))?;
            guards.push(rs.write_owned().await);
        }
        Ok(guards)
    }

    /// Lock an order for mutation together with its current room and any
    /// `extra_rooms`, honouring the rooms → order lock order. Retries when the
    /// order moves to another room between lookup and lock.
    pub(super) async fn lock_order_with_rooms(
        &self,
        order_id: Ulid,
        actor: &Actor,
        extra_rooms: &[Ulid],
    ) -> Result<(Vec<OwnedRwLockWriteGuard<RoomState>>, OwnedRwLockWriteGuard<OrderState>), EngineError> {
        let handle = self
            .order_handle(&order_id)
            .ok_or_else(|| actor.not_found(order_id))?;

        for _ in 0..MAX_LOCK_RETRIES {
            let room_id = {
                let guard = handle.read().await;
                if !actor.sees(&guard.order) {
                    return Err(EngineError::Scope);
                }
                guard.order.room_id
            };
            let mut wanted: Vec<Ulid> = extra_rooms.to_vec();
            wanted.extend(room_id);
            let rooms = self.lock_rooms(&wanted).await?;
            let order = handle.clone().write_owned().await;
            if order.order.room_id == room_id {
                return Ok((rooms, order));
            }
            debug!("order {order_id} changed room while locking, retrying");
        }
        Err(EngineError::Infrastructure(format!(
            "order {order_id} kept moving while acquiring locks"
        )))
    }

    /// Lock an order alone, for operations that never touch its room.
    pub(super) async fn lock_order(
        &self,
        order_id: Ulid,
        actor: &Actor,
    ) -> Result<OwnedRwLockWriteGuard<OrderState>, EngineError> {
        let handle = self
            .order_handle(&order_id)
            .ok_or_else(|| actor.not_found(order_id))?;
        let guard = handle.write_owned().await;
        if !actor.sees(&guard.order) {
            return Err(EngineError::Scope);
        }
        Ok(guard)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::new();

        for entry in self.stores.iter() {
            events.push(Event::StoreUpserted {
                store: entry.value().clone(),
            });
        }
        let rooms: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            events.push(Event::RoomCreated {
                room: rs.read().await.info.clone(),
            });
        }
        let orders: Vec<SharedOrderState> = self.orders.iter().map(|e| e.value().clone()).collect();
        for os in orders {
            let guard = os.read().await;
            events.push(Event::OrderRestored {
                order: guard.order.clone(),
                players: guard.players.clone(),
                payments: guard.payments.clone(),
                refunds: guard.refunds.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Infrastructure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Infrastructure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Infrastructure(format!("WAL compaction failed: {e}")))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
