use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;

/// Players on one order, regardless of what the catalog allows.
pub const MAX_PLAYERS_PER_ORDER: usize = 64;
pub const MAX_PAYMENTS_PER_ORDER: usize = 256;
pub const MAX_PROOFS_PER_PAYMENT: usize = 16;
pub const MAX_MERGE_SIZE: usize = 32;
pub const MAX_PROOF_BYTES: usize = 10 * 1024 * 1024;

/// Largest single payment or refund, in minor units.
pub const MAX_AMOUNT: i64 = 100_000_000_00;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Retry budget when an order's room changes between lookup and lock.
pub const MAX_LOCK_RETRIES: usize = 8;
