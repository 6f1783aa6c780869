use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::actor::{Actor, Capability};
use crate::model::*;

use super::ledger::summarize;
use super::{Engine, EngineError, SharedOrderState, SharedRoomState};

/// An order with everything it owns and its derived payment state.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetail {
    pub order: Order,
    pub players: Vec<OrderPlayer>,
    pub payments: Vec<OrderPayment>,
    pub refunds: Vec<RefundRecord>,
    pub summary: PaymentSummary,
}

/// A broken invariant found by `Engine::audit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AuditViolation {
    /// Two blocking claims on one room overlap.
    OverlappingClaims { room_id: Ulid, first: Ulid, second: Ulid },
    /// A player is settled by more than one confirmed payment.
    DoubleCoverage { order_id: Ulid, player_id: Ulid, payments: Vec<Ulid> },
    /// An operator has more than one order in progress.
    OperatorOverbooked { operator_id: Ulid, orders: Vec<Ulid> },
    /// A room's claim disagrees with the order's room or status.
    StaleClaim { room_id: Ulid, order_id: Ulid },
    /// An order that should hold its room has no claim on it.
    MissingClaim { room_id: Ulid, order_id: Ulid },
    /// Actual timestamps out of order or present in the wrong status.
    BadExecutionTimes { order_id: Ulid },
}

impl Engine {
    pub async fn get_order(&self, order_id: Ulid, actor: &Actor) -> Result<OrderDetail, EngineError> {
        self.check_tenant(actor)?;
        actor.require(Capability::ViewOrders)?;
        let handle = self
            .order_handle(&order_id)
            .ok_or_else(|| actor.not_found(order_id))?;
        let os = handle.read().await;
        if !actor.sees(&os.order) {
            return Err(EngineError::Scope);
        }
        Ok(OrderDetail {
            order: os.order.clone(),
            players: os.players.clone(),
            payments: os.payments.clone(),
            refunds: os.refunds.clone(),
            summary: summarize(&os),
        })
    }

    /// Orders of a store on `date`, by scheduled start.
    pub async fn list_orders(
        &self,
        store_id: Ulid,
        date: NaiveDate,
        actor: &Actor,
    ) -> Result<Vec<Order>, EngineError> {
        self.check_tenant(actor)?;
        actor.require(Capability::ViewOrders)?;
        self.visible_store(store_id, actor)?;

        let handles: Vec<SharedOrderState> = self.orders.iter().map(|e| e.value().clone()).collect();
        let mut orders = Vec::new();
        for handle in handles {
            let os = handle.read().await;
            if os.order.store_id == store_id && os.order.slot.date == date {
                orders.push(os.order.clone());
            }
        }
        let mut orders: Vec<Order> = actor.scope_filter(orders).collect();
        orders.sort_by(|a, b| a.slot.start.cmp(&b.slot.start).then(a.id.cmp(&b.id)));
        Ok(orders)
    }

    /// Re-verify the booking, coverage and operator invariants over the
    /// whole tenant. Holds the commit gate exclusively for a consistent view.
    pub async fn audit(&self) -> Vec<AuditViolation> {
        let _exclusive = self.commit_gate.write().await;
        let mut violations = Vec::new();

        let mut expected: HashMap<Ulid, (Ulid, IntervalKind)> = HashMap::new();
        let mut running: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        let orders: Vec<SharedOrderState> = self.orders.iter().map(|e| e.value().clone()).collect();
        for handle in orders {
            let os = handle.read().await;
            let order = &os.order;
            if let (Some(room_id), Some(kind)) = (order.room_id, order.status.interval_kind()) {
                expected.insert(order.id, (room_id, kind));
            }
            if order.status == OrderStatus::InProgress
                && let Some(op) = order.operator_id
            {
                running.entry(op).or_default().push(order.id);
            }
            let executed = matches!(order.status, OrderStatus::InProgress | OrderStatus::Completed)
                || order.history.iter().any(|c| c.to == OrderStatus::Completed);
            let times_ok = match (order.actual_start, order.actual_end) {
                (Some(start), Some(end)) => executed && start <= end,
                (Some(_), None) => executed,
                (None, Some(_)) => false,
                (None, None) => true,
            };
            if !times_ok {
                violations.push(AuditViolation::BadExecutionTimes { order_id: order.id });
            }

            for player in &os.players {
                let payments: Vec<Ulid> = os
                    .payments
                    .iter()
                    .filter(|p| p.status == PaymentStatus::Confirmed && p.covers(&player.id))
                    .map(|p| p.id)
                    .collect();
                if payments.len() > 1 {
                    violations.push(AuditViolation::DoubleCoverage {
                        order_id: order.id,
                        player_id: player.id,
                        payments,
                    });
                }
            }
        }

        for (operator_id, mut orders) in running {
            if orders.len() > 1 {
                orders.sort();
                violations.push(AuditViolation::OperatorOverbooked { operator_id, orders });
            }
        }

        let rooms: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let rs = rs.read().await;
            let room_id = rs.id();
            let mut reach: Option<(Ms, Ulid)> = None;
            for interval in &rs.intervals {
                match expected.remove(&interval.id) {
                    Some((room, kind)) if room == room_id && kind == interval.kind => {}
                    _ => violations.push(AuditViolation::StaleClaim {
                        room_id,
                        order_id: interval.id,
                    }),
                }
                if !interval.is_blocking() {
                    continue;
                }
                if let Some((end, first)) = reach
                    && interval.span.start < end
                {
                    violations.push(AuditViolation::OverlappingClaims {
                        room_id,
                        first,
                        second: interval.id,
                    });
                }
                if reach.is_none_or(|(end, _)| interval.span.end > end) {
                    reach = Some((interval.span.end, interval.id));
                }
            }
        }
        for (order_id, (room_id, _)) in expected {
            violations.push(AuditViolation::MissingClaim { room_id, order_id });
        }

        if violations.is_empty() {
            tracing::debug!("tenant {} audit clean", self.tenant_id());
        } else {
            tracing::warn!("tenant {} audit found {} violations", self.tenant_id(), violations.len());
        }
        violations
    }
}
