//! Reservation and capacity core for a shared-facility booking system.
//!
//! The [`Engine`](engine::Engine) decides whether a facility reservation,
//! a session registration or a weekly trainer schedule may be committed, and
//! keeps the member credit-score ledger in step with penalties. All state
//! lives behind the [`Store`](store::Store) trait; [`store::MemoryStore`] is
//! the bundled implementation, optionally backed by a write-ahead log.

pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{Config, Policy};
pub use engine::{ConflictKind, Engine, EngineError, retry_serializable};
