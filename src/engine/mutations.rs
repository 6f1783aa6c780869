use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::actor::{Actor, Capability};
use crate::limits::*;
use crate::model::*;

use super::error::ConflictKind;
use super::lifecycle::check_room_accepts;
use super::{Engine, EngineError, OrderState};

/// A fully built order handed over by the orchestrator, committed as one event.
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// `room_id: None` asks the engine to pick the first free room of the store.
    pub order: Order,
    pub players: Vec<OrderPlayer>,
    pub initial_payment: Option<OrderPayment>,
}

/// The order fields a price was computed from. A commit built on a stale
/// basis is rejected instead of overwriting a concurrent change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Basis {
    pub participant_count: u32,
    pub players: usize,
    pub product_ref: String,
}

impl Basis {
    pub fn of(order: &Order, players: usize) -> Self {
        Self {
            participant_count: order.participant_count,
            players,
            product_ref: order.product_ref.clone(),
        }
    }

    pub(crate) fn check(&self, os: &OrderState) -> Result<(), EngineError> {
        if *self == Basis::of(&os.order, os.players.len()) {
            Ok(())
        } else {
            Err(EngineError::validation(format!(
                "order {} changed concurrently, retry",
                os.order.id
            )))
        }
    }
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_room_shape(room: &Room) -> Result<(), EngineError> {
    check_name(&room.name, "room name")?;
    if room.min_players == 0 || room.min_players > room.max_players {
        return Err(EngineError::validation(format!(
            "invalid capacity range {}..={}",
            room.min_players, room.max_players
        )));
    }
    if room.max_players as usize > MAX_PLAYERS_PER_ORDER {
        return Err(EngineError::LimitExceeded("room capacity too large"));
    }
    Ok(())
}

impl Engine {
    pub async fn upsert_store(&self, store: Store, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::ManageRooms).await?;
        if !actor.sees(&store) {
            return Err(EngineError::Scope);
        }
        check_name(&store.name, "store name")?;

        let event = Event::StoreUpserted {
            store: store.clone(),
        };
        self.wal_append(&event).await?;
        info!("store {} ({}) saved", store.id, store.name);
        self.stores.insert(store.id, store);
        Ok(())
    }

    pub async fn create_room(&self, room: Room, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::ManageRooms).await?;
        if self.rooms.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        check_room_shape(&room)?;
        self.visible_store(room.store_id, actor)?;
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::validation(format!("room {} already exists", room.id)));
        }

        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        let id = room.id;
        self.rooms
            .insert(id, Arc::new(RwLock::new(RoomState::new(room))));
        self.notify.send(id, &event);
        info!("room {id} created");
        Ok(())
    }

    /// Change a room's name, capacity or operational status. Existing claims
    /// are kept; the new capacity and status apply to later bookings.
    pub async fn update_room(&self, room: Room, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::ManageRooms).await?;
        check_room_shape(&room)?;
        self.room(&room.id).ok_or_else(|| actor.not_found(room.id))?;
        let mut rooms = self.lock_rooms(&[room.id]).await?;
        let current = &rooms[0].info;
        if !actor.sees(current) {
            return Err(EngineError::Scope);
        }
        if current.store_id != room.store_id {
            return Err(EngineError::validation("a room cannot move to another store"));
        }
        self.commit(Event::RoomUpdated { room }, &mut rooms, None, None)
            .await
    }

    /// Commit a new order with its players and optional initial payment as one
    /// event. The room is re-checked under its write lock; without a room the
    /// store's rooms are tried in name order and the first free one is taken.
    pub(crate) async fn insert_order(&self, new: NewOrder, actor: &Actor) -> Result<Ulid, EngineError> {
        let _gate = self.authorize(actor, Capability::CreateOrder).await?;
        if let Some(payment) = &new.initial_payment {
            actor.require(Capability::RecordPayment)?;
            if payment.status == PaymentStatus::Confirmed {
                actor.require(Capability::ConfirmPayment)?;
            }
        }
        let NewOrder {
            mut order,
            players,
            initial_payment,
        } = new;
        if order.tenant_id != self.tenant_id() {
            return Err(EngineError::Scope);
        }
        self.visible_store(order.store_id, actor)?;
        if players.len() > MAX_PLAYERS_PER_ORDER {
            return Err(EngineError::LimitExceeded("too many players"));
        }
        let span = self.check_operating_hours(order.store_id, &order.slot)?;

        let candidates: Vec<Ulid> = match order.room_id {
            Some(room_id) => {
                self.room(&room_id).ok_or_else(|| actor.not_found(room_id))?;
                vec![room_id]
            }
            None => self
                .store_rooms(order.store_id)
                .await
                .into_iter()
                .map(|(info, _)| info.id)
                .collect(),
        };
        let auto = order.room_id.is_none();

        for room_id in candidates {
            let mut rooms = self.lock_rooms(&[room_id]).await?;
            let rs = &rooms[0];
            if !actor.sees(&rs.info) {
                return Err(EngineError::Scope);
            }
            if let Err(e) = check_room_accepts(rs, &order, &span, order.participant_count) {
                if auto {
                    continue;
                }
                return Err(e);
            }

            order.room_id = Some(room_id);
            let order_id = order.id;
            let status = order.status;
            let event = Event::OrderCreated {
                order,
                players,
                initial_payment,
            };
            self.commit(event, &mut rooms, None, None).await?;
            info!("order {order_id} created ({status}) on room {room_id}");
            return Ok(room_id);
        }
        tracing::debug!("no free room in store {} for {:?}", order.store_id, order.slot);
        Err(EngineError::Conflict(ConflictKind::NoRoomAvailable))
    }

    /// Append players to an order whose new price was computed from `basis`.
    pub(crate) async fn add_players(
        &self,
        order_id: Ulid,
        players: Vec<OrderPlayer>,
        total: Amount,
        price_breakdown: Vec<PriceLine>,
        basis: &Basis,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::EditOrder).await?;
        if players.is_empty() {
            return Err(EngineError::validation("no players to add"));
        }
        if total < 0 || total > MAX_AMOUNT {
            return Err(EngineError::LimitExceeded("order total out of range"));
        }
        let (mut rooms, mut os) = self.lock_order_with_rooms(order_id, actor, &[]).await?;
        basis.check(&os)?;
        if !os.order.status.is_editable() {
            return Err(EngineError::validation(format!(
                "players cannot join a {} order",
                os.order.status
            )));
        }
        let player_count = os.players.len() + players.len();
        if player_count > MAX_PLAYERS_PER_ORDER {
            return Err(EngineError::LimitExceeded("too many players"));
        }
        let participant_count = os.order.participant_count.max(player_count as u32);
        if let Some(rs) = rooms.first()
            && !rs.info.fits(participant_count)
        {
            return Err(EngineError::validation(format!(
                "{participant_count} participants do not fit room {}",
                rs.id()
            )));
        }

        let added = players.len();
        let event = Event::PlayersAdded {
            order_id,
            players,
            participant_count,
            total,
            price_breakdown,
        };
        self.commit(event, &mut rooms, Some(&mut *os), None).await?;
        info!("{added} players added to order {order_id}");
        Ok(())
    }
}
