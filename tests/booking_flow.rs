use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use roomledger::collab::{Catalog, FileStore, Participant, PriceQuote, Pricing, ProductConstraints};
use roomledger::engine::{ConflictKind, PaymentRequest};
use roomledger::limits::MAX_PROOF_BYTES;
use roomledger::model::*;
use roomledger::orchestrator::{BookingQuery, CreateOrderRequest, InitialPayment, OrderEdit, PlayerInput};
use roomledger::tenant::TenantManager;
use roomledger::{Actor, Capability, Engine, EngineError, Orchestrator};

// ── Test collaborators ───────────────────────────────────────

struct StaticCatalog {
    products: HashMap<String, ProductConstraints>,
}

impl StaticCatalog {
    fn new() -> Self {
        let mut products = HashMap::new();
        products.insert(
            "lost-temple".to_string(),
            ProductConstraints {
                min_participants: 2,
                max_participants: 6,
                duration_minutes: 90,
                display_name: "Lost Temple".into(),
            },
        );
        products.insert(
            "vault".to_string(),
            ProductConstraints {
                min_participants: 2,
                max_participants: 8,
                duration_minutes: 60,
                display_name: "The Vault".into(),
            },
        );
        Self { products }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn product_constraints(&self, product_ref: &str) -> Result<ProductConstraints, EngineError> {
        self.products
            .get(product_ref)
            .cloned()
            .ok_or_else(|| EngineError::validation(format!("unknown product {product_ref}")))
    }
}

/// adult 100, child 60, guest 100; "vault" costs 50 more per head;
/// discount "HALF" halves a line.
struct TablePricing;

#[async_trait]
impl Pricing for TablePricing {
    async fn compute_order_price(
        &self,
        product_ref: &str,
        participants: &[Participant],
        _date: NaiveDate,
    ) -> Result<PriceQuote, EngineError> {
        let surcharge = if product_ref == "vault" { 50 } else { 0 };
        let breakdown: Vec<PriceLine> = participants
            .iter()
            .map(|p| {
                let base = match p.role_name.as_str() {
                    "child" => 60,
                    _ => 100,
                } + surcharge;
                let amount = match p.discount_ref.as_deref() {
                    Some("HALF") => base / 2,
                    _ => base,
                };
                PriceLine {
                    label: p.role_name.clone(),
                    amount,
                }
            })
            .collect();
        Ok(PriceQuote {
            final_amount: breakdown.iter().map(|l| l.amount).sum(),
            breakdown,
        })
    }
}

/// Returns one line too few.
struct BrokenPricing;

#[async_trait]
impl Pricing for BrokenPricing {
    async fn compute_order_price(
        &self,
        _product_ref: &str,
        participants: &[Participant],
        _date: NaiveDate,
    ) -> Result<PriceQuote, EngineError> {
        Ok(PriceQuote {
            final_amount: 100,
            breakdown: participants
                .iter()
                .skip(1)
                .map(|p| PriceLine {
                    label: p.role_name.clone(),
                    amount: 100,
                })
                .collect(),
        })
    }
}

#[derive(Default)]
struct MemoryFiles {
    stored: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl FileStore for MemoryFiles {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String, EngineError> {
        let mut stored = self.stored.lock().await;
        stored.push((name.to_string(), bytes.len()));
        Ok(format!("mem://{}/{name}", stored.len()))
    }
}

// ── Fixtures ─────────────────────────────────────────────────

const TENANT: &str = "escape_co";

fn test_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("roomledger_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn staff() -> Actor {
    Actor::new(Ulid::new(), TENANT).platform().with_capabilities([
        Capability::ViewOrders,
        Capability::CreateOrder,
        Capability::EditOrder,
        Capability::ConfirmOrder,
        Capability::CancelOrder,
        Capability::RescheduleOrder,
        Capability::AssignOperator,
        Capability::RunJob,
        Capability::RecordPayment,
        Capability::ConfirmPayment,
        Capability::RefundPayment,
        Capability::ManageRooms,
    ])
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn jan10() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
}

fn player(name: &str, role: &str) -> PlayerInput {
    PlayerInput {
        role_name: role.into(),
        display_name: name.into(),
        contact: None,
        discount_ref: None,
    }
}

struct Shop {
    orch: Orchestrator,
    store: Ulid,
    r101: Ulid,
    r102: Ulid,
}

impl Shop {
    fn engine(&self) -> &Arc<Engine> {
        self.orch.engine()
    }

    fn request(&self, room: Option<Ulid>, start: NaiveTime, players: Vec<PlayerInput>) -> CreateOrderRequest {
        CreateOrderRequest {
            store_id: self.store,
            product_ref: "lost-temple".into(),
            room_id: room,
            date: jan10(),
            start,
            end: None,
            participant_count: None,
            players,
            language: Some("en".into()),
            notes: None,
            operator_id: None,
            initial_payment: None,
        }
    }
}

async fn open_shop(engine: Arc<Engine>, pricing: Arc<dyn Pricing>, actor: &Actor) -> Shop {
    let store = Store {
        id: Ulid::new(),
        name: "Downtown".into(),
        opens_at: t(9, 0),
        closes_at: NaiveTime::MIN,
    };
    engine.upsert_store(store.clone(), actor).await.unwrap();
    let mut rooms = Vec::new();
    for name in ["R101", "R102"] {
        let room = Room {
            id: Ulid::new(),
            store_id: store.id,
            name: name.into(),
            min_players: 2,
            max_players: 8,
            status: RoomStatus::Normal,
        };
        rooms.push(room.id);
        engine.create_room(room, actor).await.unwrap();
    }
    let orch = Orchestrator::new(engine, Arc::new(StaticCatalog::new()), pricing)
        .with_file_store(Arc::new(MemoryFiles::default()));
    Shop {
        orch,
        store: store.id,
        r101: rooms[0],
        r102: rooms[1],
    }
}

async fn shop(tenants: &TenantManager, actor: &Actor) -> Shop {
    let engine = tenants.get_or_create(TENANT).unwrap();
    open_shop(engine, Arc::new(TablePricing), actor).await
}

// ── Creation ─────────────────────────────────────────────────

#[tokio::test]
async fn create_prices_and_books_atomically() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let created = assert_ok!(
        shop.orch
            .create_order(
                shop.request(Some(shop.r101), t(14, 0), vec![player("Ann", "adult"), player("Ben", "child")]),
                &actor,
            )
            .await
    );
    assert_eq!(created.status, OrderStatus::Pending);
    assert_eq!(created.room_id, shop.r101);
    assert_eq!(created.total, 160);
    assert_eq!(created.player_ids.len(), 2);
    assert!(created.payment_id.is_none());

    let detail = shop.engine().get_order(created.order_id, &actor).await.unwrap();
    // End comes from the 90 minute product duration.
    assert_eq!(detail.order.slot.end, t(15, 30));
    assert_eq!(detail.order.product_name, "Lost Temple");
    assert_eq!(detail.order.price_breakdown.len(), 2);
    assert_eq!(detail.players[1].price, 60);
    assert_eq!(detail.summary.status, OrderPaymentStatus::Unpaid);
}

#[tokio::test]
async fn confirmed_initial_payment_confirms_order() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let mut request = shop.request(None, t(18, 0), vec![player("Ann", "adult"), player("Ben", "adult")]);
    request.initial_payment = Some(InitialPayment {
        amount: 200,
        method: PaymentMethod::Card,
        payer: "Ann".into(),
        proofs: vec![],
        confirmed: true,
    });
    let created = assert_ok!(shop.orch.create_order(request, &actor).await);
    assert_eq!(created.status, OrderStatus::Confirmed);
    assert_eq!(created.room_id, shop.r101);

    let detail = shop.engine().get_order(created.order_id, &actor).await.unwrap();
    assert_eq!(detail.summary.status, OrderPaymentStatus::Paid);
    assert_eq!(detail.payments[0].id, created.payment_id.unwrap());
    assert!(detail.players.iter().all(|p| p.payment_status == PlayerPaymentStatus::Paid));
}

#[tokio::test]
async fn guests_fill_the_participant_count() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let mut request = shop.request(None, t(10, 0), vec![player("Ann", "adult")]);
    request.participant_count = Some(4);
    let created = assert_ok!(shop.orch.create_order(request, &actor).await);
    assert_eq!(created.total, 400);

    let detail = shop.engine().get_order(created.order_id, &actor).await.unwrap();
    assert_eq!(detail.order.participant_count, 4);
    let roles: Vec<&str> = detail.players.iter().map(|p| p.role_name.as_str()).collect();
    assert_eq!(roles, vec!["adult", "guest", "guest", "guest"]);
}

#[tokio::test]
async fn product_bounds_and_hours_are_enforced() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let alone = shop.request(None, t(10, 0), vec![player("Ann", "adult")]);
    assert!(matches!(
        shop.orch.create_order(alone, &actor).await,
        Err(EngineError::Validation(_))
    ));

    let crowd = shop.request(None, t(10, 0), (0..7).map(|i| player(&format!("P{i}"), "adult")).collect());
    assert!(matches!(
        shop.orch.create_order(crowd, &actor).await,
        Err(EngineError::Validation(_))
    ));

    // 23:00 plus 90 minutes crosses midnight.
    let late = shop.request(None, t(23, 0), vec![player("Ann", "adult"), player("Ben", "adult")]);
    assert!(matches!(
        shop.orch.create_order(late, &actor).await,
        Err(EngineError::Validation(_))
    ));

    let mut unknown = shop.request(None, t(10, 0), vec![player("Ann", "adult"), player("Ben", "adult")]);
    unknown.product_ref = "nope".into();
    assert_err!(shop.orch.create_order(unknown, &actor).await);

    let listed = shop.engine().list_orders(shop.store, jan10(), &actor).await.unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn pricing_that_skips_participants_is_rejected() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let engine = tenants.get_or_create(TENANT).unwrap();
    let shop = open_shop(engine, Arc::new(BrokenPricing), &actor).await;

    let request = shop.request(None, t(10, 0), vec![player("Ann", "adult"), player("Ben", "adult")]);
    assert!(matches!(
        shop.orch.create_order(request, &actor).await,
        Err(EngineError::Infrastructure(_))
    ));
    assert!(shop.engine().list_orders(shop.store, jan10(), &actor).await.unwrap().is_empty());
}

#[tokio::test]
async fn racing_creates_book_the_room_once() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let attempts = (0..8).map(|i| {
        let mut request = shop.request(
            Some(shop.r101),
            t(14, 0),
            vec![player(&format!("A{i}"), "adult"), player(&format!("B{i}"), "adult")],
        );
        request.initial_payment = Some(InitialPayment {
            amount: 200,
            method: PaymentMethod::Cash,
            payer: format!("A{i}"),
            proofs: vec![],
            confirmed: true,
        });
        shop.orch.create_order(request, &actor)
    });
    let results = join_all(attempts).await;

    let won = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(won, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result,
            Err(EngineError::Conflict(ConflictKind::RoomBooked { .. }))
        ));
    }
    let listed = shop.engine().list_orders(shop.store, jan10(), &actor).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(shop.engine().audit().await.is_empty());
}

#[tokio::test]
async fn pre_check_reports_conflicts_and_free_rooms() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;
    let slot = Slot::new(jan10(), t(14, 0), t(15, 30));

    let query = BookingQuery {
        store_id: shop.store,
        room_id: Some(shop.r101),
        slot,
        participant_count: 2,
    };
    assert!(shop.orch.pre_check_booking(&query, &actor).await.unwrap().available);

    let mut request = shop.request(Some(shop.r101), t(14, 0), vec![player("Ann", "adult"), player("Ben", "adult")]);
    request.initial_payment = Some(InitialPayment {
        amount: 200,
        method: PaymentMethod::Card,
        payer: "Ann".into(),
        proofs: vec![],
        confirmed: true,
    });
    let created = shop.orch.create_order(request, &actor).await.unwrap();

    let answer = shop.orch.pre_check_booking(&query, &actor).await.unwrap();
    assert!(!answer.available);
    assert_eq!(answer.conflicts, vec![created.order_id]);

    let anywhere = BookingQuery { room_id: None, ..query };
    let answer = shop.orch.pre_check_booking(&anywhere, &actor).await.unwrap();
    assert!(answer.available);
    assert_eq!(answer.room_id, Some(shop.r102));
}

#[tokio::test]
async fn pre_check_answers_like_create_would() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;
    let query = BookingQuery {
        store_id: shop.store,
        room_id: Some(shop.r101),
        slot: Slot::new(jan10(), t(14, 0), t(15, 30)),
        participant_count: 4,
    };

    let too_many = BookingQuery {
        participant_count: 9,
        ..query.clone()
    };
    assert!(!shop.orch.pre_check_booking(&too_many, &actor).await.unwrap().available);

    let too_early = BookingQuery {
        slot: Slot::new(jan10(), t(7, 0), t(8, 30)),
        ..query.clone()
    };
    assert!(!shop.orch.pre_check_booking(&too_early, &actor).await.unwrap().available);
    let anywhere_early = BookingQuery {
        room_id: None,
        ..too_early
    };
    let answer = shop.orch.pre_check_booking(&anywhere_early, &actor).await.unwrap();
    assert!(!answer.available);
    assert_eq!(answer.room_id, None);

    let room = shop.engine().room(&shop.r101).unwrap().read().await.info.clone();
    shop.engine()
        .update_room(
            Room {
                status: RoomStatus::Maintenance,
                ..room
            },
            &actor,
        )
        .await
        .unwrap();
    let answer = shop.orch.pre_check_booking(&query, &actor).await.unwrap();
    assert!(!answer.available);
    assert!(answer.conflicts.is_empty());
    let request = shop.request(
        Some(shop.r101),
        t(14, 0),
        vec![player("Ann", "adult"), player("Ben", "adult")],
    );
    assert_err!(shop.orch.create_order(request, &actor).await);
}

// ── Changes ──────────────────────────────────────────────────

#[tokio::test]
async fn appended_players_reprice_the_group() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let created = shop
        .orch
        .create_order(shop.request(None, t(10, 0), vec![player("Ann", "adult"), player("Ben", "adult")]), &actor)
        .await
        .unwrap();

    let mut kid = player("Cid", "child");
    kid.discount_ref = Some("HALF".into());
    let added = assert_ok!(shop.orch.append_players(created.order_id, vec![kid], &actor).await);
    assert_eq!(added.len(), 1);

    let detail = shop.engine().get_order(created.order_id, &actor).await.unwrap();
    assert_eq!(detail.order.total, 230);
    assert_eq!(detail.order.participant_count, 3);
    assert_eq!(detail.players[2].price, 30);
    assert_eq!(detail.players[2].discount_ref.as_deref(), Some("HALF"));

    let too_many: Vec<PlayerInput> = (0..4).map(|i| player(&format!("X{i}"), "adult")).collect();
    assert!(matches!(
        shop.orch.append_players(created.order_id, too_many, &actor).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn edit_reprices_only_when_the_basis_changes() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let created = shop
        .orch
        .create_order(shop.request(None, t(10, 0), vec![player("Ann", "adult"), player("Ben", "adult")]), &actor)
        .await
        .unwrap();

    let notes = OrderEdit {
        notes: Some("birthday cake at 11".into()),
        ..Default::default()
    };
    assert_ok!(shop.orch.edit_order(created.order_id, notes, &actor).await);
    let order = shop.engine().get_order(created.order_id, &actor).await.unwrap().order;
    assert_eq!(order.total, 200);
    assert_eq!(order.language.as_deref(), Some("en"));

    let switch = OrderEdit {
        product_ref: Some("vault".into()),
        participant_count: Some(3),
        ..Default::default()
    };
    assert_ok!(shop.orch.edit_order(created.order_id, switch, &actor).await);
    let order = shop.engine().get_order(created.order_id, &actor).await.unwrap().order;
    assert_eq!(order.product_name, "The Vault");
    assert_eq!(order.participant_count, 3);
    assert_eq!(order.total, 450);
    assert_eq!(order.notes.as_deref(), Some("birthday cake at 11"));

    let shrink = OrderEdit {
        participant_count: Some(1),
        ..Default::default()
    };
    assert_err!(shop.orch.edit_order(created.order_id, shrink, &actor).await);
}

#[tokio::test]
async fn reschedule_keeps_room_when_free_else_moves() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let confirmed = |start: NaiveTime, room: Option<Ulid>| {
        let mut request = shop.request(room, start, vec![player("Ann", "adult"), player("Ben", "adult")]);
        request.initial_payment = Some(InitialPayment {
            amount: 200,
            method: PaymentMethod::Card,
            payer: "Ann".into(),
            proofs: vec![],
            confirmed: true,
        });
        request
    };
    let mover = shop.orch.create_order(confirmed(t(10, 0), Some(shop.r101)), &actor).await.unwrap();
    let blocker = shop.orch.create_order(confirmed(t(16, 0), Some(shop.r101)), &actor).await.unwrap();

    let room = assert_ok!(
        shop.orch
            .reschedule(mover.order_id, None, Slot::new(jan10(), t(12, 0), t(13, 30)), &actor)
            .await
    );
    assert_eq!(room, shop.r101);

    let room = assert_ok!(
        shop.orch
            .reschedule(mover.order_id, None, Slot::new(jan10(), t(16, 30), t(18, 0)), &actor)
            .await
    );
    assert_eq!(room, shop.r102);

    // R102 now holds the moved order.
    assert!(matches!(
        shop.orch
            .reschedule(blocker.order_id, Some(shop.r102), Slot::new(jan10(), t(17, 0), t(18, 0)), &actor)
            .await,
        Err(EngineError::Conflict(ConflictKind::RoomBooked { .. }))
    ));

    let order = shop.engine().get_order(mover.order_id, &actor).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.room_id, Some(shop.r102));
}

#[tokio::test]
async fn job_and_refund_through_the_orchestrator() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let mut request = shop.request(Some(shop.r102), t(20, 0), vec![player("Ann", "adult"), player("Ben", "adult")]);
    request.initial_payment = Some(InitialPayment {
        amount: 200,
        method: PaymentMethod::Card,
        payer: "Ann".into(),
        proofs: vec![],
        confirmed: true,
    });
    let created = shop.orch.create_order(request, &actor).await.unwrap();
    let payment = created.payment_id.unwrap();

    assert_ok!(shop.orch.start_job(created.order_id, &actor).await);
    assert_ok!(shop.orch.complete_job(created.order_id, &actor).await);
    assert_ok!(shop.orch.refund(payment, 200, "heating broke".into(), &actor).await);

    let detail = shop.engine().get_order(created.order_id, &actor).await.unwrap();
    assert_eq!(detail.order.status, OrderStatus::Refunded);
    assert_eq!(detail.summary.status, OrderPaymentStatus::Refunded);
    assert!(shop.engine().audit().await.is_empty());
}

#[tokio::test]
async fn proofs_go_through_the_file_store() {
    let tenants = TenantManager::new(test_dir(), 1000);
    let actor = staff();
    let shop = shop(&tenants, &actor).await;

    let created = shop
        .orch
        .create_order(shop.request(None, t(10, 0), vec![player("Ann", "adult"), player("Ben", "adult")]), &actor)
        .await
        .unwrap();
    let payment = shop
        .engine()
        .record_payment(
            created.order_id,
            PaymentRequest {
                covered_players: created.player_ids.clone(),
                amount: 200,
                method: PaymentMethod::BankTransfer,
                payer: "Ann".into(),
                proofs: vec![],
            },
            &actor,
        )
        .await
        .unwrap();

    let reference = assert_ok!(
        shop.orch
            .attach_proof(payment, "receipt.png", vec![0u8; 2048], &actor)
            .await
    );
    assert_eq!(reference, "mem://1/receipt.png");

    assert!(matches!(
        shop.orch
            .attach_proof(payment, "huge.png", vec![0u8; MAX_PROOF_BYTES + 1], &actor)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));

    let bare = Orchestrator::new(shop.engine().clone(), Arc::new(StaticCatalog::new()), Arc::new(TablePricing));
    assert!(matches!(
        bare.attach_proof(payment, "receipt.png", vec![1, 2, 3], &actor).await,
        Err(EngineError::Infrastructure(_))
    ));

    let detail = shop.engine().get_order(created.order_id, &actor).await.unwrap();
    assert_eq!(detail.payments[0].proofs, vec![reference]);
}

// ── Tenancy and durability ───────────────────────────────────

#[tokio::test]
async fn tenants_restart_from_their_logs() {
    let dir = test_dir();
    let actor = staff();

    let (order_id, store) = {
        let tenants = TenantManager::new(dir.clone(), 1000);
        let shop = shop(&tenants, &actor).await;
        let created = shop
            .orch
            .create_order(shop.request(None, t(10, 0), vec![player("Ann", "adult"), player("Ben", "adult")]), &actor)
            .await
            .unwrap();
        (created.order_id, shop.store)
    };

    let tenants = TenantManager::new(dir, 1000);
    assert_eq!(tenants.discover().unwrap(), vec![TENANT.to_string()]);
    let engine = tenants.get_or_create(TENANT).unwrap();
    let listed = engine.list_orders(store, jan10(), &actor).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, order_id);

    let other = tenants.get_or_create("other_co").unwrap();
    let outsider = Actor::new(Ulid::new(), "other_co")
        .platform()
        .with_capabilities([Capability::ViewOrders]);
    assert!(matches!(
        other.get_order(order_id, &outsider).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.get_order(order_id, &outsider).await,
        Err(EngineError::Scope)
    ));
}
