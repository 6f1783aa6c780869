use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::actor::{Actor, Capability};
use crate::model::*;

use super::conflict::{conflicts_in, validate_slot};
use super::{Engine, EngineError, SharedRoomState};

/// One room's day: merged busy time and its complement inside operating hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSchedule {
    pub room_id: Ulid,
    pub room_name: String,
    pub status: RoomStatus,
    pub busy: Vec<Span>,
    pub free: Vec<Span>,
    /// Every claim on the room inside the window, pending ones included.
    pub claims: Vec<Interval>,
}

/// Build a room's schedule for `window`. Only blocking claims make time busy;
/// a room that is not bookable has no free time.
pub fn room_schedule(rs: &RoomState, window: &Span) -> RoomSchedule {
    let mut busy: Vec<Span> = Vec::new();
    let mut claims = Vec::new();
    for interval in rs.overlapping(window) {
        claims.push(interval.clone());
        if interval.is_blocking() {
            busy.push(Span::new(
                interval.span.start.max(window.start),
                interval.span.end.min(window.end),
            ));
        }
    }
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    let free = if rs.info.is_bookable() {
        subtract_intervals(&[*window], &busy)
    } else {
        Vec::new()
    };
    RoomSchedule {
        room_id: rs.id(),
        room_name: rs.info.name.clone(),
        status: rs.info.status,
        busy,
        free,
        claims,
    }
}

/// A room can take a new claim when it is bookable, sized for the group and
/// has no blocking claim overlapping `span`.
pub fn accepts(rs: &RoomState, span: &Span, participants: u32, exclude: Option<Ulid>) -> bool {
    rs.info.is_bookable() && rs.info.fits(participants) && conflicts_in(rs, span, exclude).is_empty()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

impl Engine {
    /// Rooms of a store in stable candidate order: by name, then id.
    pub(super) async fn store_rooms(&self, store_id: Ulid) -> Vec<(Room, SharedRoomState)> {
        let handles: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::new();
        for rs in handles {
            let info = rs.read().await.info.clone();
            if info.store_id == store_id {
                rooms.push((info, rs));
            }
        }
        rooms.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        rooms
    }

    pub(super) fn visible_store(&self, store_id: Ulid, actor: &Actor) -> Result<Store, EngineError> {
        let store = self.store(&store_id).ok_or_else(|| actor.not_found(store_id))?;
        if !actor.sees(&store) {
            return Err(EngineError::Scope);
        }
        Ok(store)
    }

    /// Per-room busy/free time for `date`, bounded by the store's operating hours.
    pub async fn day_schedule(
        &self,
        store_id: Ulid,
        date: NaiveDate,
        actor: &Actor,
    ) -> Result<Vec<RoomSchedule>, EngineError> {
        self.check_tenant(actor)?;
        actor.require(Capability::ViewOrders)?;
        let store = self.visible_store(store_id, actor)?;
        let window = store.operating_window(date);

        let mut schedules = Vec::new();
        for (_, rs) in self.store_rooms(store_id).await {
            let guard = rs.read().await;
            schedules.push(room_schedule(&guard, &window));
        }
        Ok(schedules)
    }

    /// First room of the store, in name order, free for the whole slot.
    /// A snapshot answer; commits re-check under the room lock.
    pub async fn find_free_room(
        &self,
        store_id: Ulid,
        slot: &Slot,
        participants: u32,
        actor: &Actor,
    ) -> Result<Option<Ulid>, EngineError> {
        self.check_tenant(actor)?;
        actor.require(Capability::ViewOrders)?;
        let store = self.visible_store(store_id, actor)?;
        let span = validate_slot(slot)?;
        if !store.operating_window(slot.date).contains_span(&span) {
            return Ok(None);
        }
        for (info, rs) in self.store_rooms(store_id).await {
            let guard = rs.read().await;
            if accepts(&guard, &span, participants, None) {
                return Ok(Some(info.id));
            }
        }
        Ok(None)
    }

    /// Whether `room_id` of `store_id` would take a booking of `participants`
    /// for `slot`, with the blocking claims in the way. Hours, room status,
    /// size and store all count, as they do when the order is created.
    pub async fn room_accepts(
        &self,
        store_id: Ulid,
        room_id: Ulid,
        slot: &Slot,
        participants: u32,
        actor: &Actor,
    ) -> Result<(bool, Vec<Ulid>), EngineError> {
        self.check_tenant(actor)?;
        actor.require(Capability::ViewOrders)?;
        let store = self.visible_store(store_id, actor)?;
        let span = validate_slot(slot)?;
        let rs = self.room(&room_id).ok_or_else(|| actor.not_found(room_id))?;
        let guard = rs.read().await;
        if !actor.sees(&guard.info) {
            return Err(EngineError::Scope);
        }
        let conflicts = conflicts_in(&guard, &span, None);
        let available = guard.info.store_id == store_id
            && store.operating_window(slot.date).contains_span(&span)
            && accepts(&guard, &span, participants, None);
        Ok((available, conflicts))
    }

    /// True when no blocking claim overlaps the slot on this room.
    pub async fn is_slot_free(
        &self,
        room_id: Ulid,
        slot: &Slot,
        exclude: Option<Ulid>,
        actor: &Actor,
    ) -> Result<bool, EngineError> {
        Ok(self.find_conflicts(room_id, slot, exclude, actor).await?.is_empty())
    }
}
