//! Resolved caller context.
//!
//! The permission engine decides who the caller is and what they may do; the
//! core only asks two independent questions: `can(capability)` for mutations
//! and `scope_filter(..)` / `sees_store(..)` for visibility.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    ViewOrders,
    CreateOrder,
    EditOrder,
    ConfirmOrder,
    CancelOrder,
    RescheduleOrder,
    DeclareNoShow,
    AssignOperator,
    /// Start and complete jobs.
    RunJob,
    /// Complete or start a job assigned to another operator.
    OverrideOperator,
    RecordPayment,
    ConfirmPayment,
    MergePayments,
    RefundPayment,
    ManageRooms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Ulid,
    pub tenant_id: String,
    pub store_scope: Vec<Ulid>,
    pub capabilities: HashSet<Capability>,
    pub is_platform_scope: bool,
}

/// Rows that belong to one store.
pub trait StoreScoped {
    fn store_id(&self) -> Ulid;
}

impl StoreScoped for crate::model::Order {
    fn store_id(&self) -> Ulid {
        self.store_id
    }
}

impl StoreScoped for crate::model::Room {
    fn store_id(&self) -> Ulid {
        self.store_id
    }
}

impl StoreScoped for crate::model::Store {
    fn store_id(&self) -> Ulid {
        self.id
    }
}

impl Actor {
    pub fn new(user_id: Ulid, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id,
            tenant_id: tenant_id.into(),
            store_scope: Vec::new(),
            capabilities: HashSet::new(),
            is_platform_scope: false,
        }
    }

    pub fn with_stores(mut self, stores: impl IntoIterator<Item = Ulid>) -> Self {
        self.store_scope.extend(stores);
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn platform(mut self) -> Self {
        self.is_platform_scope = true;
        self
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<(), EngineError> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(EngineError::Scope)
        }
    }

    pub fn sees_store(&self, store_id: Ulid) -> bool {
        self.is_platform_scope || self.store_scope.contains(&store_id)
    }

    pub fn sees<T: StoreScoped>(&self, row: &T) -> bool {
        self.sees_store(row.store_id())
    }

    /// Narrow a read to the rows this actor may see.
    pub fn scope_filter<T, I>(&self, rows: I) -> impl Iterator<Item = T>
    where
        T: StoreScoped,
        I: IntoIterator<Item = T>,
    {
        rows.into_iter().filter(move |row| self.sees(row))
    }

    /// Missing rows are only reported as such to actors who could see them
    /// anyway; store-scoped actors get the generic scope error.
    pub fn not_found(&self, id: Ulid) -> EngineError {
        if self.is_platform_scope {
            EngineError::NotFound(id)
        } else {
            EngineError::Scope
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Room, RoomStatus};

    fn room(store_id: Ulid) -> Room {
        Room {
            id: Ulid::new(),
            store_id,
            name: "R".into(),
            min_players: 1,
            max_players: 4,
            status: RoomStatus::Normal,
        }
    }

    #[test]
    fn capabilities_are_flat() {
        let actor = Actor::new(Ulid::new(), "acme").with_capabilities([Capability::RunJob]);
        assert!(actor.can(Capability::RunJob));
        assert!(!actor.can(Capability::OverrideOperator));
        assert!(matches!(
            actor.require(Capability::RefundPayment),
            Err(EngineError::Scope)
        ));
    }

    #[test]
    fn scope_filter_keeps_visible_stores() {
        let mine = Ulid::new();
        let theirs = Ulid::new();
        let actor = Actor::new(Ulid::new(), "acme").with_stores([mine]);
        let rows = vec![room(mine), room(theirs), room(mine)];
        let visible: Vec<Room> = actor.scope_filter(rows).collect();
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|r| r.store_id == mine));
    }

    #[test]
    fn platform_scope_sees_everything() {
        let actor = Actor::new(Ulid::new(), "acme").platform();
        assert!(actor.sees_store(Ulid::new()));
        assert!(matches!(actor.not_found(Ulid::new()), EngineError::NotFound(_)));

        let scoped = Actor::new(Ulid::new(), "acme");
        assert!(matches!(scoped.not_found(Ulid::new()), EngineError::Scope));
    }
}
