use ulid::Ulid;

use crate::actor::{Actor, Capability};
use crate::limits::*;
use crate::model::*;

use super::error::ConflictKind;
use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_slot(slot: &Slot) -> Result<Span, EngineError> {
    if !slot.is_well_formed() {
        return Err(EngineError::validation(format!(
            "slot end {} must be after start {}",
            slot.end, slot.start
        )));
    }
    let span = slot.span();
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(span)
}

/// Blocking claims on `rs` overlapping `span`, skipping `exclude`.
/// Pending claims never block; cancelled and completed orders hold no claim.
pub fn conflicts_in(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> Vec<Ulid> {
    rs.overlapping(span)
        .filter(|i| i.is_blocking() && Some(i.id) != exclude)
        .map(|i| i.id)
        .collect()
}

/// Must be called with the room's write lock held, in the same critical
/// section as the commit that claims `span`.
pub(crate) fn check_no_conflict(
    rs: &RoomState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match conflicts_in(rs, span, exclude).first() {
        Some(&order_id) => {
            tracing::debug!("room {} conflict with order {order_id}", rs.id());
            Err(EngineError::Conflict(ConflictKind::RoomBooked { order_id }))
        }
        None => Ok(()),
    }
}

impl Engine {
    /// Read-only conflict lookup. Not race-free on its own: commits re-run
    /// the check under the room's write lock.
    pub async fn find_conflicts(
        &self,
        room_id: Ulid,
        slot: &Slot,
        exclude: Option<Ulid>,
        actor: &Actor,
    ) -> Result<Vec<Ulid>, EngineError> {
        self.check_tenant(actor)?;
        actor.require(Capability::ViewOrders)?;
        let span = validate_slot(slot)?;
        let rs = self.room(&room_id).ok_or_else(|| actor.not_found(room_id))?;
        let guard = rs.read().await;
        if !actor.sees(&guard.info) {
            return Err(EngineError::Scope);
        }
        Ok(conflicts_in(&guard, &span, exclude))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn at(h: u32) -> Ms {
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        date_time_ms(date, NaiveTime::from_hms_opt(h, 0, 0).unwrap())
    }

    fn room_with(claims: &[(Ms, Ms, IntervalKind)]) -> (RoomState, Vec<Ulid>) {
        let mut rs = RoomState::new(Room {
            id: Ulid::new(),
            store_id: Ulid::new(),
            name: "R101".into(),
            min_players: 1,
            max_players: 8,
            status: RoomStatus::Normal,
        });
        let mut ids = Vec::new();
        for &(start, end, kind) in claims {
            let id = Ulid::new();
            ids.push(id);
            rs.insert_interval(Interval {
                id,
                span: Span::new(start, end),
                kind,
            });
        }
        (rs, ids)
    }

    #[test]
    fn overlap_is_a_conflict() {
        let (rs, ids) = room_with(&[(at(14), at(16), IntervalKind::Reserved)]);
        assert_eq!(conflicts_in(&rs, &Span::new(at(15), at(17)), None), ids);
        assert!(matches!(
            check_no_conflict(&rs, &Span::new(at(15), at(17)), None),
            Err(EngineError::Conflict(ConflictKind::RoomBooked { order_id })) if order_id == ids[0]
        ));
    }

    #[test]
    fn boundary_touch_is_not_a_conflict() {
        let (rs, _) = room_with(&[(at(14), at(16), IntervalKind::Reserved)]);
        assert!(conflicts_in(&rs, &Span::new(at(16), at(18)), None).is_empty());
        assert!(conflicts_in(&rs, &Span::new(at(12), at(14)), None).is_empty());
    }

    #[test]
    fn tentative_claims_never_block() {
        let (rs, _) = room_with(&[(at(14), at(16), IntervalKind::Tentative)]);
        assert!(check_no_conflict(&rs, &Span::new(at(14), at(16)), None).is_ok());
    }

    #[test]
    fn excluded_order_is_ignored() {
        let (rs, ids) = room_with(&[
            (at(10), at(12), IntervalKind::Reserved),
            (at(11), at(13), IntervalKind::Reserved),
        ]);
        let hits = conflicts_in(&rs, &Span::new(at(10), at(13)), Some(ids[0]));
        assert_eq!(hits, vec![ids[1]]);
    }

    #[test]
    fn enclosing_claim_is_found() {
        let (rs, ids) = room_with(&[(at(9), at(20), IntervalKind::Reserved)]);
        assert_eq!(conflicts_in(&rs, &Span::new(at(12), at(13)), None), ids);
    }

    #[test]
    fn malformed_slot_rejected() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let slot = Slot::new(
            date,
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
        );
        assert!(matches!(validate_slot(&slot), Err(EngineError::Validation(_))));

        let ancient = Slot::new(
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
        );
        assert!(matches!(validate_slot(&ancient), Err(EngineError::LimitExceeded(_))));
    }
}
