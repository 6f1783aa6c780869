use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::actor::{Actor, Capability};
use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::error::ConflictKind;
use super::lifecycle::{can_transition, record_change};
use super::{Engine, EngineError, OrderState};

/// Input of `record_payment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub covered_players: Vec<Ulid>,
    pub amount: Amount,
    pub method: PaymentMethod,
    pub payer: String,
    pub proofs: Vec<String>,
}

/// Overrides for the payment a merge produces. Unset fields come from the
/// first input payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeAttributes {
    pub method: Option<PaymentMethod>,
    pub payer: Option<String>,
    pub proofs: Vec<String>,
}

/// Payments that count towards what an order has been paid. A fully refunded
/// payment still counts; its refund is subtracted separately.
fn counted(payment: &OrderPayment) -> bool {
    matches!(payment.status, PaymentStatus::Confirmed | PaymentStatus::Refunded)
}

/// Derive the order-level payment state from the order's payments.
pub fn summarize(os: &OrderState) -> PaymentSummary {
    let total = os.order.total;
    let (confirmed_total, refunded_total) = os
        .payments
        .iter()
        .filter(|p| counted(p))
        .fold((0, 0), |(c, r), p| (c + p.amount, r + p.refunded_amount));
    let net = confirmed_total - refunded_total;

    let status = if confirmed_total == 0 {
        OrderPaymentStatus::Unpaid
    } else if refunded_total >= confirmed_total {
        OrderPaymentStatus::Refunded
    } else if refunded_total > 0 {
        OrderPaymentStatus::PartiallyRefunded
    } else if confirmed_total < total {
        OrderPaymentStatus::Partial
    } else {
        OrderPaymentStatus::Paid
    };

    PaymentSummary {
        status,
        total,
        confirmed_total,
        refunded_total,
        outstanding: (total - net).max(0),
        overpaid: refunded_total == 0 && confirmed_total > total,
    }
}

pub(super) fn mark_covered_paid(os: &mut OrderState, payment_id: Ulid) {
    let Some(covered) = os.payment(&payment_id).map(|p| p.covered_players.clone()) else {
        return;
    };
    for player_id in covered {
        if let Some(player) = os.player_mut(&player_id) {
            player.payment_status = PlayerPaymentStatus::Paid;
        }
    }
}

/// A fully refunded payment no longer settles anyone.
fn revert_covered(os: &mut OrderState, payment_id: Ulid) {
    let Some(covered) = os.payment(&payment_id).map(|p| p.covered_players.clone()) else {
        return;
    };
    for player_id in covered {
        if let Some(player) = os.player_mut(&player_id)
            && player.payment_status == PlayerPaymentStatus::Paid
        {
            player.payment_status = PlayerPaymentStatus::Pending;
        }
    }
}

pub(super) fn release_unpaid_players(os: &mut OrderState) {
    for player in &mut os.players {
        if player.payment_status == PlayerPaymentStatus::Pending {
            player.payment_status = PlayerPaymentStatus::Cancelled;
        }
    }
}

/// Apply a payment event to its order (no locking; caller holds the lock).
pub(super) fn apply(os: &mut OrderState, event: &Event, payment_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::PaymentRecorded { payment } => {
            payment_index.insert(payment.id, payment.order_id);
            os.payments.push(payment.clone());
        }
        Event::PaymentConfirmed { id, at, .. } => {
            if let Some(payment) = os.payment_mut(id) {
                payment.status = PaymentStatus::Confirmed;
                payment.confirmed_at = Some(*at);
            }
            mark_covered_paid(os, *id);
        }
        Event::PaymentFailed { id, .. } => {
            if let Some(payment) = os.payment_mut(id) {
                payment.status = PaymentStatus::Failed;
            }
        }
        Event::ProofAttached { id, reference, .. } => {
            if let Some(payment) = os.payment_mut(id) {
                payment.proofs.push(reference.clone());
            }
        }
        Event::PaymentsMerged { merged, voided, .. } => {
            for id in voided {
                if let Some(payment) = os.payment_mut(id) {
                    payment.status = PaymentStatus::Voided;
                    payment.merged_into = Some(merged.id);
                }
            }
            payment_index.insert(merged.id, merged.order_id);
            os.payments.push(merged.clone());
            if merged.status == PaymentStatus::Confirmed {
                mark_covered_paid(os, merged.id);
            }
        }
        Event::PaymentRefunded { refund, change } => {
            let mut fully_refunded = false;
            if let Some(payment) = os.payment_mut(&refund.payment_id) {
                payment.refunded_amount += refund.amount;
                if payment.refundable() == 0 {
                    payment.status = PaymentStatus::Refunded;
                    fully_refunded = true;
                }
            }
            if fully_refunded {
                revert_covered(os, refund.payment_id);
            }
            os.refunds.push(refund.clone());
            if let Some(change) = change {
                record_change(&mut os.order, change);
            }
        }
        _ => {}
    }
}

fn check_amount(amount: Amount) -> Result<(), EngineError> {
    if amount <= 0 {
        return Err(EngineError::validation("amount must be positive"));
    }
    if amount > MAX_AMOUNT {
        return Err(EngineError::LimitExceeded("amount too large"));
    }
    Ok(())
}

fn payment_state(payment: &OrderPayment, action: &'static str) -> EngineError {
    EngineError::PaymentState {
        id: payment.id,
        status: payment.status.as_str(),
        action,
    }
}

/// Cancelled and refunded orders settle no more players.
fn check_takes_payments(os: &OrderState) -> Result<(), EngineError> {
    if matches!(os.order.status, OrderStatus::Cancelled | OrderStatus::Refunded) {
        return Err(EngineError::validation(format!(
            "a {} order takes no payments",
            os.order.status
        )));
    }
    Ok(())
}

/// First covered player already settled by a different confirmed payment.
fn already_covered(os: &OrderState, covered: &[Ulid], skip: &[Ulid]) -> Option<ConflictKind> {
    covered.iter().find_map(|player_id| {
        os.payments
            .iter()
            .find(|p| {
                p.status == PaymentStatus::Confirmed && !skip.contains(&p.id) && p.covers(player_id)
            })
            .map(|p| ConflictKind::AlreadyCovered {
                player_id: *player_id,
                payment_id: p.id,
            })
    })
}

impl Engine {
    fn payment_order(&self, payment_id: Ulid, actor: &Actor) -> Result<Ulid, EngineError> {
        self.order_for_payment(&payment_id)
            .ok_or_else(|| actor.not_found(payment_id))
    }

    /// Record a pending payment covering some of the order's players. Player
    /// status is untouched until the payment is confirmed.
    pub async fn record_payment(
        &self,
        order_id: Ulid,
        request: PaymentRequest,
        actor: &Actor,
    ) -> Result<Ulid, EngineError> {
        let _gate = self.authorize(actor, Capability::RecordPayment).await?;
        check_amount(request.amount)?;
        if request.proofs.len() > MAX_PROOFS_PER_PAYMENT {
            return Err(EngineError::LimitExceeded("too many proofs"));
        }
        if request.payer.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("payer too long"));
        }

        let mut os = self.lock_order(order_id, actor).await?;
        check_takes_payments(&os)?;
        if os.payments.len() >= MAX_PAYMENTS_PER_ORDER {
            return Err(EngineError::LimitExceeded("too many payments on order"));
        }
        let covered = validate_coverage(&os, &request.covered_players)?;

        let payment = OrderPayment {
            id: Ulid::new(),
            order_id,
            covered_players: covered,
            amount: request.amount,
            method: request.method,
            payer: request.payer,
            proofs: request.proofs,
            status: PaymentStatus::Pending,
            confirmed_at: None,
            refunded_amount: 0,
            merged_into: None,
            created_at: now_ms(),
        };
        let id = payment.id;
        self.commit(Event::PaymentRecorded { payment }, &mut [], Some(&mut *os), None)
            .await?;
        info!("payment {id} recorded on order {order_id}");
        Ok(id)
    }

    /// pending → confirmed; every covered player becomes paid. Confirming a
    /// confirmed payment again is a no-op.
    pub async fn confirm_payment(&self, payment_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::ConfirmPayment).await?;
        let order_id = self.payment_order(payment_id, actor)?;
        let mut os = self.lock_order(order_id, actor).await?;
        let payment = os
            .payment(&payment_id)
            .ok_or_else(|| actor.not_found(payment_id))?;
        match payment.status {
            PaymentStatus::Confirmed => return Ok(()),
            PaymentStatus::Pending => {}
            _ => return Err(payment_state(payment, "confirm")),
        }
        check_takes_payments(&os)?;
        if let Some(conflict) = already_covered(&os, &payment.covered_players, &[payment_id]) {
            tracing::debug!("payment {payment_id} rejected: {conflict}");
            return Err(EngineError::Conflict(conflict));
        }

        let event = Event::PaymentConfirmed {
            id: payment_id,
            order_id,
            at: now_ms(),
        };
        self.commit(event, &mut [], Some(&mut *os), None).await?;
        info!("payment {payment_id} confirmed on order {order_id}");
        Ok(())
    }

    /// pending → failed.
    pub async fn fail_payment(&self, payment_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::ConfirmPayment).await?;
        let order_id = self.payment_order(payment_id, actor)?;
        let mut os = self.lock_order(order_id, actor).await?;
        let payment = os
            .payment(&payment_id)
            .ok_or_else(|| actor.not_found(payment_id))?;
        if payment.status != PaymentStatus::Pending {
            return Err(payment_state(payment, "fail"));
        }
        let event = Event::PaymentFailed {
            id: payment_id,
            order_id,
        };
        self.commit(event, &mut [], Some(&mut *os), None).await
    }

    /// Attach a stored proof reference to a payment that is still pending.
    pub async fn attach_proof(
        &self,
        payment_id: Ulid,
        reference: String,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let _gate = self.authorize(actor, Capability::RecordPayment).await?;
        if reference.is_empty() || reference.len() > MAX_NOTES_LEN {
            return Err(EngineError::validation("invalid proof reference"));
        }
        let order_id = self.payment_order(payment_id, actor)?;
        let mut os = self.lock_order(order_id, actor).await?;
        let payment = os
            .payment(&payment_id)
            .ok_or_else(|| actor.not_found(payment_id))?;
        if payment.status != PaymentStatus::Pending {
            return Err(payment_state(payment, "attach proof to"));
        }
        if payment.proofs.len() >= MAX_PROOFS_PER_PAYMENT {
            return Err(EngineError::LimitExceeded("too many proofs"));
        }
        let event = Event::ProofAttached {
            id: payment_id,
            order_id,
            reference,
        };
        self.commit(event, &mut [], Some(&mut *os), None).await
    }

    /// Fold two or more payments of one order into a single payment whose
    /// amount is the sum and coverage the union. The inputs are voided.
    pub async fn merge_payments(
        &self,
        payment_ids: &[Ulid],
        attrs: MergeAttributes,
        actor: &Actor,
    ) -> Result<Ulid, EngineError> {
        let _gate = self.authorize(actor, Capability::MergePayments).await?;
        let mut ids: Vec<Ulid> = Vec::with_capacity(payment_ids.len());
        for id in payment_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        if ids.len() < 2 {
            return Err(EngineError::validation(
                "merge needs at least two distinct payments",
            ));
        }
        if ids.len() > MAX_MERGE_SIZE {
            return Err(EngineError::LimitExceeded("too many payments to merge"));
        }
        if attrs.payer.as_ref().is_some_and(|p| p.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("payer too long"));
        }

        let order_id = self.payment_order(ids[0], actor)?;
        for id in &ids[1..] {
            if self.payment_order(*id, actor)? != order_id {
                return Err(EngineError::validation(
                    "merged payments must belong to the same order",
                ));
            }
        }

        let mut os = self.lock_order(order_id, actor).await?;
        check_takes_payments(&os)?;
        let mut inputs = Vec::with_capacity(ids.len());
        for id in &ids {
            inputs.push(os.payment(id).ok_or_else(|| actor.not_found(*id))?);
        }
        let status = inputs[0].status;
        for payment in &inputs {
            let mergeable = match payment.status {
                PaymentStatus::Pending => status == PaymentStatus::Pending,
                PaymentStatus::Confirmed => {
                    status == PaymentStatus::Confirmed && payment.refunded_amount == 0
                }
                _ => false,
            };
            if !mergeable {
                return Err(payment_state(payment, "merge"));
            }
        }

        let mut covered: Vec<Ulid> = Vec::new();
        let mut proofs: Vec<String> = Vec::new();
        let mut amount: Amount = 0;
        for payment in &inputs {
            for player_id in &payment.covered_players {
                if !covered.contains(player_id) {
                    covered.push(*player_id);
                }
            }
            proofs.extend(payment.proofs.iter().cloned());
            amount += payment.amount;
        }
        proofs.extend(attrs.proofs);
        check_amount(amount)?;
        if proofs.len() > MAX_PROOFS_PER_PAYMENT {
            return Err(EngineError::LimitExceeded("too many proofs"));
        }
        if status == PaymentStatus::Confirmed
            && let Some(conflict) = already_covered(&os, &covered, &ids)
        {
            return Err(EngineError::Conflict(conflict));
        }

        let merged = OrderPayment {
            id: Ulid::new(),
            order_id,
            covered_players: covered,
            amount,
            method: attrs.method.unwrap_or(inputs[0].method),
            payer: attrs.payer.unwrap_or_else(|| inputs[0].payer.clone()),
            proofs,
            status,
            confirmed_at: inputs.iter().filter_map(|p| p.confirmed_at).min(),
            refunded_amount: 0,
            merged_into: None,
            created_at: now_ms(),
        };
        let merged_id = merged.id;
        let event = Event::PaymentsMerged {
            order_id,
            merged,
            voided: ids,
        };
        self.commit(event, &mut [], Some(&mut *os), None).await?;
        info!("payments merged into {merged_id} on order {order_id}");
        Ok(merged_id)
    }

    /// Refund part or all of a confirmed payment. A completed (or already
    /// partially refunded) order moves to `refunded` once every confirmed
    /// payment is fully refunded, `partially_refunded` otherwise.
    pub async fn refund_payment(
        &self,
        payment_id: Ulid,
        amount: Amount,
        reason: String,
        actor: &Actor,
    ) -> Result<Ulid, EngineError> {
        let _gate = self.authorize(actor, Capability::RefundPayment).await?;
        check_amount(amount)?;
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let order_id = self.payment_order(payment_id, actor)?;
        let mut os = self.lock_order(order_id, actor).await?;
        let payment = os
            .payment(&payment_id)
            .ok_or_else(|| actor.not_found(payment_id))?;
        if payment.status != PaymentStatus::Confirmed {
            return Err(payment_state(payment, "refund"));
        }
        if amount > payment.refundable() {
            return Err(EngineError::validation(format!(
                "refund {amount} exceeds refundable {}",
                payment.refundable()
            )));
        }

        let now = now_ms();
        let everything_refunded = os.payments.iter().filter(|p| counted(p)).all(|p| {
            let left = p.refundable() - if p.id == payment_id { amount } else { 0 };
            left == 0
        });
        let target = if everything_refunded {
            OrderStatus::Refunded
        } else {
            OrderStatus::PartiallyRefunded
        };
        let moves_order = matches!(
            os.order.status,
            OrderStatus::Completed | OrderStatus::PartiallyRefunded
        ) && can_transition(os.order.status, target);
        let change = moves_order.then(|| StatusChange {
            from: os.order.status,
            to: target,
            at: now,
            actor: actor.user_id,
        });

        let refund = RefundRecord {
            id: Ulid::new(),
            payment_id,
            order_id,
            amount,
            reason,
            created_at: now,
            created_by: actor.user_id,
        };
        let refund_id = refund.id;
        self.commit(Event::PaymentRefunded { refund, change }, &mut [], Some(&mut *os), None)
            .await?;
        info!("refunded {amount} of payment {payment_id} on order {order_id}");
        Ok(refund_id)
    }

    pub async fn payment_summary(&self, order_id: Ulid, actor: &Actor) -> Result<PaymentSummary, EngineError> {
        self.check_tenant(actor)?;
        actor.require(Capability::ViewOrders)?;
        let handle = self
            .order_handle(&order_id)
            .ok_or_else(|| actor.not_found(order_id))?;
        let os = handle.read().await;
        if !actor.sees(&os.order) {
            return Err(EngineError::Scope);
        }
        Ok(summarize(&os))
    }
}

/// Covered players must be distinct, belong to the order and not be cancelled.
fn validate_coverage(os: &OrderState, covered: &[Ulid]) -> Result<Vec<Ulid>, EngineError> {
    if covered.is_empty() {
        return Err(EngineError::validation("payment must cover at least one player"));
    }
    let mut seen = HashSet::new();
    for player_id in covered {
        if !seen.insert(*player_id) {
            return Err(EngineError::validation(format!("player {player_id} listed twice")));
        }
        match os.players.iter().find(|p| p.id == *player_id) {
            Some(p) if p.payment_status == PlayerPaymentStatus::Cancelled => {
                return Err(EngineError::validation(format!("player {player_id} is cancelled")));
            }
            Some(_) => {}
            None => {
                return Err(EngineError::validation(format!(
                    "player {player_id} is not on order {}",
                    os.order.id
                )));
            }
        }
    }
    Ok(covered.to_vec())
}
