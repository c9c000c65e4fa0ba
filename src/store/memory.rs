use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::journal::{Journal, JournalStats};
use super::tables::{Key, Tables};
use super::{
    PenaltyScan, RegistrationScan, ReservationScan, SessionScan, Store, StoreError, TemplateScan,
    Transaction,
};

/// Commits between sweeps of stale key versions.
const PRUNE_EVERY: u64 = 512;

struct CommitLog {
    /// Seq of the last validated commit that wrote each key.
    versions: HashMap<Key, u64>,
    /// Seq handed to the last commit that passed validation.
    assigned: u64,
}

struct Shared {
    tables: RwLock<Tables>,
    /// The mutex doubles as the commit lock.
    log: Mutex<CommitLog>,
    /// Seq of the last applied commit. Commits apply strictly in seq order,
    /// once their WAL record is durable.
    applied: watch::Sender<u64>,
    /// Start seq of every open transaction, by ticket.
    live: DashMap<u64, u64>,
    next_ticket: AtomicU64,
    journal: Option<Journal>,
}

/// In-memory tables with optimistic serializable transactions, optionally
/// journaled to a write-ahead log.
///
/// A transaction records the keys it reads and buffers its writes. At
/// commit, if any of those keys (or any row it writes) was written by a
/// commit newer than the transaction's start, it fails with
/// [`StoreError::SerializationFailure`]. Otherwise it gets the next seq and
/// is queued on the WAL under the commit lock, then waits for its fsync
/// outside the lock so concurrent commits share one, and is applied in seq
/// order. Writes are invisible until commit, also to the transaction that
/// made them.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// A store with no durability, for tests and embedding.
    pub fn ephemeral() -> Self {
        Self::build(Tables::default(), 0, None)
    }

    /// Replay the WAL at `path` and journal every further commit to it.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, commits) = Wal::recover(path)?;
        let mut tables = Tables::default();
        let mut seq = 0;
        for commit in &commits {
            for event in &commit.events {
                tables.apply(event);
            }
            seq = commit.seq;
        }
        info!("replayed {} commits from {} (seq {seq})", commits.len(), path.display());
        let journal = Journal::spawn(wal);
        Ok(Self::build(tables, seq, Some(journal)))
    }

    fn build(tables: Tables, seq: u64, journal: Option<Journal>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(tables),
                log: Mutex::new(CommitLog { versions: HashMap::new(), assigned: seq }),
                applied: watch::channel(seq).0,
                live: DashMap::new(),
                next_ticket: AtomicU64::new(0),
                journal,
            }),
        }
    }

    /// Handle that does not keep the store, its journal or its WAL file
    /// alive.
    pub fn downgrade(&self) -> WeakMemoryStore {
        WeakMemoryStore(Arc::downgrade(&self.shared))
    }

    pub fn is_durable(&self) -> bool {
        self.shared.journal.is_some()
    }

    /// Seq of the last applied commit.
    pub fn last_seq(&self) -> u64 {
        *self.shared.applied.borrow()
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StoreError> {
        Ok(self.wal_stats().await?.appends_since_compact)
    }

    pub async fn wal_stats(&self) -> Result<JournalStats, StoreError> {
        match &self.shared.journal {
            Some(journal) => journal.stats().await,
            None => Ok(JournalStats { appends_since_compact: 0, syncs: 0 }),
        }
    }

    /// Rewrite the WAL as a single snapshot commit of the current state.
    /// Commits wait while the snapshot is taken and written.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(journal) = &self.shared.journal else { return Ok(()) };
        let log = self.shared.log.lock().await;
        // Commits already queued must be in the tables before the snapshot.
        let seq = log.assigned;
        self.shared
            .applied
            .subscribe()
            .wait_for(|applied| *applied >= seq)
            .await
            .map_err(|_| StoreError::Closed)?;
        let events = self.shared.tables.read().await.snapshot();
        let count = events.len();
        journal.rewrite(vec![Commit { seq, events }]).await?;
        info!("compacted WAL to {count} events at seq {seq}");
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let shared = &self.shared;
        let ticket = shared.next_ticket.fetch_add(1, Ordering::SeqCst);
        // Pin at 0 first so a concurrent prune can't drop versions this
        // transaction has yet to validate against.
        shared.live.insert(ticket, 0);
        let start_seq = *shared.applied.borrow();
        shared.live.insert(ticket, start_seq);
        Ok(MemoryTx {
            ticket: Ticket { shared: shared.clone(), id: ticket },
            start_seq,
            reads: HashSet::new(),
            writes: Vec::new(),
        })
    }
}

/// See [`MemoryStore::downgrade`].
#[derive(Clone)]
pub struct WeakMemoryStore(Weak<Shared>);

impl WeakMemoryStore {
    pub fn upgrade(&self) -> Option<MemoryStore> {
        self.0.upgrade().map(|shared| MemoryStore { shared })
    }
}

/// Registration of an open transaction; removed on drop.
struct Ticket {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.shared.live.remove(&self.id);
    }
}

pub struct MemoryTx {
    ticket: Ticket,
    start_seq: u64,
    reads: HashSet<Key>,
    writes: Vec<Event>,
}

impl MemoryTx {
    async fn read<T>(&mut self, key: Key, f: impl FnOnce(&Tables) -> T) -> T {
        self.reads.insert(key);
        let tables = self.ticket.shared.tables.read().await;
        f(&tables)
    }

    fn write(&mut self, event: Event) {
        self.writes.push(event);
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn member(&mut self, id: Ulid) -> Result<Option<Member>, StoreError> {
        self.reads.insert(Key::Member(id));
        Ok(self.read(Key::Credit(id), |t| t.member(id)).await)
    }

    async fn member_exists(&mut self, id: Ulid) -> Result<bool, StoreError> {
        Ok(self.read(Key::Member(id), |t| t.member_exists(id)).await)
    }

    async fn insert_member(&mut self, member: Member) -> Result<(), StoreError> {
        self.write(Event::MemberEnrolled { member });
        Ok(())
    }

    async fn adjust_credit(&mut self, member_id: Ulid, delta: i32) -> Result<(), StoreError> {
        self.write(Event::CreditAdjusted { member_id, delta });
        Ok(())
    }

    async fn reservation(&mut self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.read(Key::Reservation(id), |t| t.reservation(id)).await)
    }

    async fn reservations(&mut self, scan: ReservationScan) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.read(scan.key(), |t| t.reservations(scan)).await)
    }

    async fn count_active_reservations(
        &mut self,
        member_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<usize, StoreError> {
        Ok(self
            .read(Key::MemberReservations(member_id), |t| t.count_active_reservations(member_id, now))
            .await)
    }

    async fn insert_reservation(&mut self, reservation: Reservation) -> Result<(), StoreError> {
        self.write(Event::ReservationCreated { reservation });
        Ok(())
    }

    async fn cancel_reservation(
        &mut self,
        id: Ulid,
        admin_note: Option<String>,
        at: NaiveDateTime,
    ) -> Result<(), StoreError> {
        self.write(Event::ReservationCanceled { id, admin_note, at });
        Ok(())
    }

    async fn template(&mut self, id: Ulid) -> Result<Option<Template>, StoreError> {
        Ok(self.read(Key::Template(id), |t| t.template(id)).await)
    }

    async fn templates(&mut self, scan: TemplateScan) -> Result<Vec<Template>, StoreError> {
        Ok(self.read(scan.key(), |t| t.templates(scan)).await)
    }

    async fn insert_template(&mut self, template: Template) -> Result<(), StoreError> {
        self.write(Event::TemplateCreated { template });
        Ok(())
    }

    async fn deactivate_template(&mut self, id: Ulid, at: NaiveDateTime) -> Result<(), StoreError> {
        self.write(Event::TemplateDeactivated { id, at });
        Ok(())
    }

    async fn session(&mut self, id: Ulid) -> Result<Option<Session>, StoreError> {
        Ok(self.read(Key::Session(id), |t| t.session(id)).await)
    }

    async fn session_on(
        &mut self,
        template_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .read(Key::TemplateDate(template_id, date), |t| t.session_on(template_id, date))
            .await)
    }

    async fn sessions(&mut self, scan: SessionScan) -> Result<Vec<Session>, StoreError> {
        Ok(self.read(scan.key(), |t| t.sessions(scan)).await)
    }

    async fn insert_session(&mut self, session: Session) -> Result<(), StoreError> {
        self.write(Event::SessionCreated { session });
        Ok(())
    }

    async fn cancel_session(&mut self, id: Ulid, at: NaiveDateTime) -> Result<(), StoreError> {
        self.write(Event::SessionCanceled { id, at });
        Ok(())
    }

    async fn registration(&mut self, id: Ulid) -> Result<Option<Registration>, StoreError> {
        Ok(self.read(Key::Registration(id), |t| t.registration(id)).await)
    }

    async fn registrations(&mut self, scan: RegistrationScan) -> Result<Vec<Registration>, StoreError> {
        Ok(self.read(scan.key(), |t| t.registrations(scan)).await)
    }

    async fn count_registrations(&mut self, session_id: Ulid) -> Result<u32, StoreError> {
        Ok(self
            .read(Key::SessionSeats(session_id), |t| t.count_registrations(session_id))
            .await)
    }

    async fn member_registration(
        &mut self,
        session_id: Ulid,
        member_id: Ulid,
    ) -> Result<Option<Registration>, StoreError> {
        Ok(self
            .read(Key::SessionSeats(session_id), |t| t.member_registration(session_id, member_id))
            .await)
    }

    async fn insert_registration(&mut self, registration: Registration) -> Result<(), StoreError> {
        self.write(Event::RegistrationCreated { registration });
        Ok(())
    }

    async fn cancel_registration(&mut self, id: Ulid, at: NaiveDateTime) -> Result<(), StoreError> {
        self.write(Event::RegistrationCanceled { id, at });
        Ok(())
    }

    async fn penalties(&mut self, scan: PenaltyScan) -> Result<Vec<Penalty>, StoreError> {
        Ok(self.read(Key::Table(super::tables::Table::Penalties), |t| t.penalties(scan)).await)
    }

    async fn insert_penalty(&mut self, penalty: Penalty) -> Result<(), StoreError> {
        self.write(Event::PenaltyApplied { penalty });
        Ok(())
    }

    async fn delete_penalty(&mut self, id: Ulid) -> Result<Option<Penalty>, StoreError> {
        let found = self.read(Key::Penalty(id), |t| t.penalty(id)).await;
        if found.is_some() {
            self.write(Event::PenaltyRevoked { id });
        }
        Ok(found)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let MemoryTx { ticket, start_seq, reads, writes } = self;
        if writes.is_empty() {
            // Reads are not from a snapshot: a read-only transaction still has
            // to prove nothing it read moved underneath it.
            let log = ticket.shared.log.lock().await;
            if let Some(key) = stale_key(&log.versions, start_seq, reads.iter()) {
                debug!("read-only commit from seq {start_seq} aborted on {key:?}");
                return Err(StoreError::SerializationFailure);
            }
            return Ok(());
        }
        // Run to completion on its own task: a caller dropped mid-commit must
        // not leave a journaled commit unapplied.
        let shared = ticket.shared.clone();
        tokio::spawn(apply_commit(shared, ticket, start_seq, reads, writes))
            .await
            .map_err(|_| StoreError::Closed)?
    }
}

fn stale_key<'a>(
    versions: &HashMap<Key, u64>,
    start_seq: u64,
    mut keys: impl Iterator<Item = &'a Key>,
) -> Option<&'a Key> {
    keys.find(|key| versions.get(*key).is_some_and(|v| *v > start_seq))
}

async fn apply_commit(
    shared: Arc<Shared>,
    ticket: Ticket,
    start_seq: u64,
    reads: HashSet<Key>,
    events: Vec<Event>,
) -> Result<(), StoreError> {
    let (commit, queued) = {
        let mut log = shared.log.lock().await;

        let written: HashSet<Key> = {
            let tables = shared.tables.read().await;
            events.iter().flat_map(|e| tables.written_keys(e)).collect()
        };
        let checked = reads.iter().chain(written.iter().filter(|key| key.is_row()));
        if let Some(key) = stale_key(&log.versions, start_seq, checked) {
            debug!("commit from seq {start_seq} aborted on {key:?}");
            return Err(StoreError::SerializationFailure);
        }
        drop(ticket);

        log.assigned += 1;
        let seq = log.assigned;
        let commit = Commit { seq, events };
        let queued = match &shared.journal {
            Some(journal) => journal.enqueue(commit.clone()).await.map(Some),
            None => Ok(None),
        };
        // Bumped before apply: anyone who read these keys before this commit
        // lands fails validation from here on.
        for key in written {
            log.versions.insert(key, seq);
        }
        if seq % PRUNE_EVERY == 0 {
            prune(&shared, &mut log.versions, seq);
        }
        (commit, queued)
    };

    let durable = match queued {
        Ok(Some(pending)) => pending.wait().await,
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };

    // Every seq is marked applied, failed ones included, so later commits
    // never wait on a hole.
    shared
        .applied
        .subscribe()
        .wait_for(|applied| *applied + 1 >= commit.seq)
        .await
        .map_err(|_| StoreError::Closed)?;
    if durable.is_ok() {
        let mut tables = shared.tables.write().await;
        for event in &commit.events {
            tables.apply(event);
        }
    }
    shared.applied.send_replace(commit.seq);
    durable
}

/// Versions at or below the oldest open transaction's start can never fail
/// a validation again.
fn prune(shared: &Shared, versions: &mut HashMap<Key, u64>, seq: u64) {
    let applied = *shared.applied.borrow();
    let floor = shared
        .live
        .iter()
        .map(|entry| *entry.value())
        .min()
        .map_or(applied, |oldest| oldest.min(applied));
    let before = versions.len();
    versions.retain(|_, v| *v > floor);
    debug!("pruned {} key versions at seq {seq}", before - versions.len());
}
