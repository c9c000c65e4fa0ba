mod availability;
mod capacity;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod quota;
mod retry;
mod schedule;

pub use availability::{free_windows, merge_overlapping, subtract_ranges};
pub use capacity::has_free_slot;
pub use conflict::{duplicate_booking, facility_overlap, member_overlap, trainer_overlap};
pub use error::{ConflictKind, EngineError};
pub use ledger::PenaltyContext;
pub use quota::exceeds_active_limit;
pub use retry::retry_serializable;
pub use schedule::{ExpansionJob, ExpansionReport, upcoming_dates};

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Policy};
use crate::maintenance;
use crate::observability::{
    self, COMMIT_DURATION_SECONDS, OPERATIONS_TOTAL, SERIALIZATION_FAILURES_TOTAL, outcome_label,
};
use crate::store::{MemoryStore, Store, StoreError, Transaction};

/// How often the compactor checks the WAL size.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Decides what may be committed. Holds no booking state of its own: every
/// check and write goes through one serializable store transaction.
pub struct Engine<S: Store = MemoryStore> {
    store: S,
    clock: Arc<dyn Clock>,
    policy: Policy,
    expansions: mpsc::Sender<ExpansionJob>,
}

impl<S: Store> Engine<S> {
    /// Must be called inside a tokio runtime: spawns the schedule expansion
    /// worker, which stops once the engine is dropped.
    pub fn new(store: S, clock: Arc<dyn Clock>, policy: Policy) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(policy.expansion_queue.max(1));
        let engine = Arc::new(Self { store, clock, policy, expansions: tx });
        tokio::spawn(schedule::run_expander(Arc::downgrade(&engine), rx));
        engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub(super) async fn begin(&self) -> Result<S::Tx, EngineError> {
        Ok(self.store.begin().await?)
    }

    pub(super) async fn commit(&self, tx: S::Tx, op: &'static str) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = tx.commit().await;
        metrics::histogram!(COMMIT_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
        if let Err(StoreError::SerializationFailure) = &result {
            metrics::counter!(SERIALIZATION_FAILURES_TOTAL, "op" => op).increment(1);
            debug!("{op}: lost a serialization race at commit");
        }
        Ok(result?)
    }

    /// Run one operation and record its outcome.
    pub(super) async fn tracked<T>(
        &self,
        op: &'static str,
        work: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let result = work.await;
        metrics::counter!(OPERATIONS_TOTAL, "op" => op, "outcome" => outcome_label(&result)).increment(1);
        if let Err(e) = &result {
            debug!("{op} rejected: {e}");
        }
        result
    }
}

impl Engine<MemoryStore> {
    /// Replay the WAL under `config.data_dir` and start the engine with its
    /// background compactor and horizon keeper. Also installs the metrics
    /// exporter when `config.metrics_port` is set.
    pub fn open(config: &Config) -> io::Result<Arc<Self>> {
        if let Err(e) = observability::init(config.metrics_port) {
            warn!("metrics exporter not installed: {e}");
        }
        let store = MemoryStore::open(&config.wal_path())?;
        let engine = Self::new(store.clone(), Arc::new(SystemClock), config.policy.clone());
        tokio::spawn(maintenance::run_compactor(
            store.downgrade(),
            config.compact_threshold,
            COMPACT_CHECK_INTERVAL,
        ));
        tokio::spawn(maintenance::run_horizon_keeper(
            Arc::downgrade(&engine),
            config.horizon_refresh,
        ));
        Ok(engine)
    }
}
