use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::actor::{Actor, Capability};
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_slot};
use super::error::ConflictKind;
use super::{Engine, EngineError};

/// The order transition table. Anything not listed is illegal.
pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, Cancelled)
            | (Confirmed, InProgress)
            | (Confirmed, Cancelled)
            | (Confirmed, NoShow)
            | (Confirmed, Rescheduled)
            | (Rescheduled, Pending)
            | (Rescheduled, Confirmed)
            | (InProgress, Completed)
            | (Completed, Refunded)
            | (Completed, PartiallyRefunded)
            | (PartiallyRefunded, Refunded)
            | (PartiallyRefunded, PartiallyRefunded)
    )
}

pub(super) fn record_change(order: &mut Order, change: &StatusChange) {
    order.status = change.to;
    order.history.push(change.clone());
}

/// Build the change moving `order` to `to`, or the state error naming both ends.
pub(super) fn change_to(
    order: &Order,
    to: OrderStatus,
    actor: &Actor,
    at: Ms,
) -> Result<StatusChange, EngineError> {
    if !can_transition(order.status, to) {
        return Err(EngineError::State {
            current: order.status,
            attempted: to,
        });
    }
    Ok(StatusChange {
        from: order.status,
        to,
        at,
        actor: actor.user_id,
    })
}

pub(super) fn locked_room(
    rooms: &[OwnedRwLockWriteGuard<RoomState>],
    id: Ulid,
) -> Result<&RoomState, EngineError> {
    rooms
        .iter()
        .find(|g| g.id() == id)
        .map(|g| &**g)
        .ok_or(EngineError::NotFound(id))
}

/// A room can host `order`'s group for `span`: same store, bookable, sized
/// for `participants` and free of other blocking claims.
pub(super) fn check_room_accepts(
    rs: &RoomState,
    order: &Order,
    span: &Span,
    participants: u32,
) -> Result<(), EngineError> {
    if rs.info.store_id != order.store_id {
        return Err(EngineError::validation(format!(
            "room {} belongs to another store",
            rs.id()
        )));
    }
    if !rs.info.is_bookable() {
        return Err(EngineError::validation(format!("room {} is not bookable", rs.id())));
    }
    if !rs.info.fits(participants) {
        return Err(EngineError::validation(format!(
            "{participants} participants do not fit room {} ({}..={})",
            rs.id(),
            rs.info.min_players,
            rs.info.max_players
        )));
    }
    check_no_conflict(rs, span, Some(order.id))
}

fn may_act_for(actor: &Actor, operator_id: Ulid) -> bool {
    operator_id == actor.user_id || actor.can(Capability::OverrideOperator) || actor.is_platform_scope
}

impl Engine {
    /// Validate `slot` and require it to lie inside the store's operating hours.
    pub(super) fn check_operating_hours(&self, store_id: Ulid, slot: &Slot) -> Result<Span, EngineError> {
        let span = validate_slot(slot)?;
        let store = self.store(&store_id).ok_or(EngineError::NotFound(store_id))?;
        let window = store.operating_window(slot.date);
        if !window.contains_span(&span) {
            return Err(EngineError::validation(format!(
                "slot {}-{} is outside operating hours of store {}",
                slot.start, slot.end, store.name
            )));
        }
        Ok(span)
    }

    /// pending → confirmed. The order's room must still be free: the check runs
    /// under the room's write lock, in the same critical section as the commit.
    pub async fn confirm_order(&self, order_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::ConfirmOrder).await?;
        let (mut rooms, mut os) = self.lock_order_with_rooms(order_id, actor, &[]).await?;
        let change = change_to(&os.order, OrderStatus::Confirmed, actor, now_ms())?;
        let room_id = os
            .order
            .room_id
            .ok_or_else(|| EngineError::validation("order has no room assigned"))?;
        let participants = os.order.participant_count;
        check_room_accepts(locked_room(&rooms, room_id)?, &os.order, &os.order.span(), participants)?;

        let event = Event::OrderTransitioned {
            id: order_id,
            room_id: Some(room_id),
            change,
        };
        self.commit(event, &mut rooms, Some(&mut *os), None).await?;
        info!("order {order_id} confirmed on room {room_id}");
        Ok(())
    }

    /// confirmed → in_progress. The operator is the assigned one, or the actor
    /// when nobody is assigned. Re-starting a running job by its operator is a no-op.
    pub async fn start_job(&self, order_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::RunJob).await?;
        let (mut rooms, mut os) = self.lock_order_with_rooms(order_id, actor, &[]).await?;
        let operator_id = os.order.operator_id.unwrap_or(actor.user_id);
        if !may_act_for(actor, operator_id) {
            return Err(EngineError::Scope);
        }
        if os.order.status == OrderStatus::InProgress && os.order.operator_id == Some(operator_id) {
            return Ok(());
        }
        let change = change_to(&os.order, OrderStatus::InProgress, actor, now_ms())?;

        let slot = self.operator_slot(operator_id);
        let mut active = slot.lock().await;
        if let Some(running) = *active
            && running != order_id
        {
            tracing::debug!("operator {operator_id} busy with order {running}");
            return Err(EngineError::Conflict(ConflictKind::OperatorBusy { order_id: running }));
        }

        let event = Event::JobStarted {
            id: order_id,
            room_id: os.order.room_id,
            operator_id,
            change,
        };
        self.commit(event, &mut rooms, Some(&mut *os), Some(&mut *active))
            .await?;
        info!("order {order_id} started by operator {operator_id}");
        Ok(())
    }

    /// in_progress → completed, by the operator running it or an override.
    /// Completing an already completed job is a no-op.
    pub async fn complete_job(&self, order_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::RunJob).await?;
        let (mut rooms, mut os) = self.lock_order_with_rooms(order_id, actor, &[]).await?;
        let Some(operator_id) = os.order.operator_id else {
            return Err(EngineError::State {
                current: os.order.status,
                attempted: OrderStatus::Completed,
            });
        };
        if !may_act_for(actor, operator_id) {
            return Err(EngineError::Scope);
        }
        if os.order.status == OrderStatus::Completed {
            return Ok(());
        }
        let change = change_to(&os.order, OrderStatus::Completed, actor, now_ms())?;

        let slot = self.operator_slot(operator_id);
        let mut active = slot.lock().await;
        let event = Event::JobCompleted {
            id: order_id,
            room_id: os.order.room_id,
            operator_id,
            change,
        };
        self.commit(event, &mut rooms, Some(&mut *os), Some(&mut *active))
            .await?;
        info!("order {order_id} completed by operator {operator_id}");
        Ok(())
    }

    /// {pending, confirmed} → cancelled. Releases the room; players that had
    /// not paid become cancelled.
    pub async fn cancel_order(&self, order_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::CancelOrder).await?;
        self.transition(order_id, OrderStatus::Cancelled, actor).await?;
        info!("order {order_id} cancelled");
        Ok(())
    }

    /// confirmed → no_show. Only ever declared by a caller.
    pub async fn declare_no_show(&self, order_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::DeclareNoShow).await?;
        self.transition(order_id, OrderStatus::NoShow, actor).await?;
        info!("order {order_id} declared no-show");
        Ok(())
    }

    async fn transition(&self, order_id: Ulid, to: OrderStatus, actor: &Actor) -> Result<(), EngineError> {
        let (mut rooms, mut os) = self.lock_order_with_rooms(order_id, actor, &[]).await?;
        let change = change_to(&os.order, to, actor, now_ms())?;
        let event = Event::OrderTransitioned {
            id: order_id,
            room_id: os.order.room_id,
            change,
        };
        self.commit(event, &mut rooms, Some(&mut *os), None).await
    }

    /// Move an order to `room_id` at `slot`. Releasing the old claim and taking
    /// the new one is a single commit under both room locks. A confirmed order
    /// passes through `rescheduled` back to `confirmed`; a pending order keeps
    /// its status. Players and payments are untouched.
    pub async fn reschedule(
        &self,
        order_id: Ulid,
        room_id: Ulid,
        slot: Slot,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::RescheduleOrder).await?;
        validate_slot(&slot)?;
        self.room(&room_id).ok_or_else(|| actor.not_found(room_id))?;
        let (mut rooms, mut os) = self.lock_order_with_rooms(order_id, actor, &[room_id]).await?;

        let now = now_ms();
        let changes = match os.order.status {
            OrderStatus::Pending => Vec::new(),
            OrderStatus::Confirmed => {
                let away = change_to(&os.order, OrderStatus::Rescheduled, actor, now)?;
                let back = StatusChange {
                    from: OrderStatus::Rescheduled,
                    to: OrderStatus::Confirmed,
                    at: now,
                    actor: actor.user_id,
                };
                vec![away, back]
            }
            current => {
                return Err(EngineError::State {
                    current,
                    attempted: OrderStatus::Rescheduled,
                });
            }
        };

        let target = locked_room(&rooms, room_id)?;
        if !actor.sees(&target.info) {
            return Err(EngineError::Scope);
        }
        let span = self.check_operating_hours(os.order.store_id, &slot)?;
        check_room_accepts(target, &os.order, &span, os.order.participant_count)?;

        let from_room = os.order.room_id;
        let event = Event::OrderRescheduled {
            id: order_id,
            from_room,
            room_id,
            slot,
            changes,
        };
        self.commit(event, &mut rooms, Some(&mut *os), None).await?;
        info!("order {order_id} rescheduled to room {room_id} on {} {}-{}", slot.date, slot.start, slot.end);
        Ok(())
    }

    /// Assign or clear the operator of an order that has not started yet.
    pub async fn assign_operator(
        &self,
        order_id: Ulid,
        operator_id: Option<Ulid>,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::AssignOperator).await?;
        let mut os = self.lock_order(order_id, actor).await?;
        match os.order.status {
            OrderStatus::Pending | OrderStatus::Confirmed => {}
            current => {
                return Err(EngineError::validation(format!(
                    "operator of a {current} order cannot change"
                )));
            }
        }
        if os.order.operator_id == operator_id {
            return Ok(());
        }
        let event = Event::OperatorAssigned {
            id: order_id,
            operator_id,
        };
        self.commit(event, &mut [], Some(&mut *os), None).await
    }

    /// Apply a resolved edit of the bounded field set. Moving the order to
    /// another room re-runs the conflict check under that room's lock.
    pub async fn edit_order(&self, order_id: Ulid, edit: AppliedEdit, actor: &Actor) -> Result<(), EngineError> {
        self.apply_edit(order_id, edit, None, actor).await
    }

    /// Shared by `edit_order` and the orchestrator, which passes the order
    /// fields its price was computed from so a concurrent edit is not overwritten.
    pub(crate) async fn apply_edit(
        &self,
        order_id: Ulid,
        edit: AppliedEdit,
        basis: Option<&super::mutations::Basis>,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::EditOrder).await?;
        validate_edit(&edit)?;
        if let Some(room_id) = edit.room_id {
            self.room(&room_id).ok_or_else(|| actor.not_found(room_id))?;
        }
        let extra: Vec<Ulid> = edit.room_id.into_iter().collect();
        let (mut rooms, mut os) = self.lock_order_with_rooms(order_id, actor, &extra).await?;
        if let Some(basis) = basis {
            basis.check(&os)?;
        }

        let order = &os.order;
        if !order.status.is_editable() {
            return Err(EngineError::validation(format!("a {} order cannot be edited", order.status)));
        }
        let moves = edit.room_id != order.room_id;
        if moves && order.status == OrderStatus::InProgress {
            return Err(EngineError::validation("a job in progress cannot change room"));
        }
        if (edit.participant_count as usize) < os.players.len() {
            return Err(EngineError::validation(format!(
                "order already has {} players",
                os.players.len()
            )));
        }
        match edit.room_id {
            Some(room_id) => {
                let target = locked_room(&rooms, room_id)?;
                if !actor.sees(&target.info) {
                    return Err(EngineError::Scope);
                }
                if moves || edit.participant_count != order.participant_count {
                    check_room_accepts(target, order, &order.span(), edit.participant_count)?;
                }
            }
            None if order.status.blocks_room() => {
                return Err(EngineError::validation("a confirmed order needs a room"));
            }
            None => {}
        }

        let event = Event::OrderEdited {
            id: order_id,
            from_room: order.room_id,
            edit,
        };
        self.commit(event, &mut rooms, Some(&mut *os), None).await?;
        info!("order {order_id} edited");
        Ok(())
    }

    /// The order an operator is currently running, if visible to `actor`.
    pub async fn active_job(&self, operator_id: Ulid, actor: &Actor) -> Result<Option<Ulid>, EngineError> {
        self.check_tenant(actor)?;
        actor.require(Capability::ViewOrders)?;
        let Some(slot) = self.operators.get(&operator_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let running = *slot.lock().await;
        let Some(order_id) = running else {
            return Ok(None);
        };
        match self.order_handle(&order_id) {
            Some(handle) if actor.sees(&handle.read().await.order) => Ok(Some(order_id)),
            _ => Ok(None),
        }
    }
}

fn validate_edit(edit: &AppliedEdit) -> Result<(), EngineError> {
    if edit.participant_count == 0 {
        return Err(EngineError::validation("participant count must be positive"));
    }
    if edit.participant_count as usize > MAX_PLAYERS_PER_ORDER {
        return Err(EngineError::LimitExceeded("too many participants"));
    }
    if edit.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if edit.language.as_ref().is_some_and(|l| l.len() > MAX_NAME_LEN)
        || edit.product_name.len() > MAX_NAME_LEN
        || edit.product_ref.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    if edit.total < 0 || edit.total > MAX_AMOUNT {
        return Err(EngineError::LimitExceeded("order total out of range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    #[test]
    fn forward_path_is_legal() {
        assert!(can_transition(Pending, Confirmed));
        assert!(can_transition(Confirmed, InProgress));
        assert!(can_transition(InProgress, Completed));
        assert!(can_transition(Completed, Refunded));
        assert!(can_transition(Completed, PartiallyRefunded));
        assert!(can_transition(PartiallyRefunded, Refunded));
    }

    #[test]
    fn terminal_states_stay_put() {
        for terminal in [Cancelled, Refunded, NoShow] {
            for to in [Pending, Confirmed, InProgress, Completed, Cancelled, Refunded, NoShow] {
                assert!(!can_transition(terminal, to), "{terminal} -> {to}");
            }
        }
        assert!(!can_transition(Completed, Cancelled));
        assert!(!can_transition(Completed, InProgress));
    }

    #[test]
    fn skipping_and_backward_moves_are_illegal() {
        assert!(!can_transition(Pending, InProgress));
        assert!(!can_transition(Pending, NoShow));
        assert!(!can_transition(InProgress, Cancelled));
        assert!(!can_transition(InProgress, Confirmed));
        assert!(!can_transition(Confirmed, Pending));
    }

    #[test]
    fn rescheduled_is_transient() {
        assert!(can_transition(Confirmed, Rescheduled));
        assert!(can_transition(Rescheduled, Confirmed));
        assert!(can_transition(Rescheduled, Pending));
        assert!(!can_transition(Rescheduled, InProgress));
        assert!(!can_transition(Pending, Rescheduled));
    }

    #[test]
    fn change_to_reports_both_states() {
        let actor = Actor::new(Ulid::new(), "acme");
        let order = Order {
            id: Ulid::new(),
            tenant_id: "acme".into(),
            store_id: Ulid::new(),
            product_ref: "escape-1".into(),
            product_name: "Escape".into(),
            room_id: None,
            slot: Slot::new(
                chrono::NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
                chrono::NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            ),
            actual_start: None,
            actual_end: None,
            participant_count: 3,
            language: None,
            notes: None,
            status: Completed,
            operator_id: None,
            total: 300,
            price_breakdown: vec![],
            created_at: 0,
            created_by: actor.user_id,
            history: vec![],
        };
        match change_to(&order, Cancelled, &actor, 1) {
            Err(EngineError::State { current, attempted }) => {
                assert_eq!(current, Completed);
                assert_eq!(attempted, Cancelled);
            }
            other => panic!("expected state error, got {other:?}"),
        }
        let change = change_to(&order, Refunded, &actor, 5).unwrap();
        assert_eq!((change.from, change.to, change.at), (Completed, Refunded, 5));
    }
}
