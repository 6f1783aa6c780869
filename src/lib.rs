pub mod actor;
pub mod collab;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod tenant;
pub mod wal;

pub use actor::{Actor, Capability};
pub use engine::{Engine, EngineError};
pub use orchestrator::Orchestrator;
