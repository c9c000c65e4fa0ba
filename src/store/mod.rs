//! Storage collaborator: serializable transactions over the booking tables.

mod journal;
mod memory;
mod tables;

pub use journal::JournalStats;
pub use memory::{MemoryStore, MemoryTx, WeakMemoryStore};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A concurrent transaction committed a write this one depended on.
    #[error("could not serialize access due to a concurrent update")]
    SerializationFailure,
    #[error("write-ahead log: {0}")]
    Wal(#[from] std::io::Error),
    #[error("store is shut down")]
    Closed,
}

/// Which reservations to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationScan {
    /// Live reservations on one facility for one day.
    FacilityDay(Ulid, NaiveDate),
    /// Live reservations a member holds on one day, any facility.
    MemberDay(Ulid, NaiveDate),
    /// Live reservations on a facility overlapping the slot.
    FacilityOverlap(Ulid, Slot),
    /// Live reservations of a member overlapping the slot, any facility.
    MemberOverlap(Ulid, Slot),
    /// Everything a member ever booked, canceled included.
    Member(Ulid),
    /// Everything dated within `[from, to]`, canceled included.
    Between(NaiveDate, NaiveDate),
}

/// Which sessions to read. Canceled sessions are included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScan {
    FacilityDay(Ulid, NaiveDate),
    TrainerDay(Ulid, NaiveDate),
    Template(Ulid),
}

/// Which registrations to read. Only live registrations are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationScan {
    Session(Ulid),
    Member(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyScan {
    Member(Ulid),
    IssuedBy(Ulid),
    /// Created within `[from, to]`.
    Between(NaiveDateTime, NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateScan {
    /// Active templates of a trainer on one weekday.
    TrainerWeekday(Ulid, u8),
    Trainer(Ulid),
    Facility(Ulid),
    /// Every active template.
    Active,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: Transaction;

    /// Open a serializable transaction. Dropping it uncommitted rolls it back.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One serializable unit of work.
///
/// `commit` fails with [`StoreError::SerializationFailure`] when the
/// outcome could differ from some serial order of the transactions involved.
/// That holds for read-only transactions too: committing one confirms its
/// reads were consistent, dropping it skips the check.
#[async_trait]
pub trait Transaction: Send + 'static {
    async fn member(&mut self, id: Ulid) -> Result<Option<Member>, StoreError>;
    async fn member_exists(&mut self, id: Ulid) -> Result<bool, StoreError>;
    async fn insert_member(&mut self, member: Member) -> Result<(), StoreError>;
    /// Add `delta` to the member's credit score.
    async fn adjust_credit(&mut self, member_id: Ulid, delta: i32) -> Result<(), StoreError>;

    async fn reservation(&mut self, id: Ulid) -> Result<Option<Reservation>, StoreError>;
    async fn reservations(&mut self, scan: ReservationScan) -> Result<Vec<Reservation>, StoreError>;
    /// Live reservations of `member_id` that end after `now`.
    async fn count_active_reservations(
        &mut self,
        member_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<usize, StoreError>;
    async fn insert_reservation(&mut self, reservation: Reservation) -> Result<(), StoreError>;
    async fn cancel_reservation(
        &mut self,
        id: Ulid,
        admin_note: Option<String>,
        at: NaiveDateTime,
    ) -> Result<(), StoreError>;

    async fn template(&mut self, id: Ulid) -> Result<Option<Template>, StoreError>;
    async fn templates(&mut self, scan: TemplateScan) -> Result<Vec<Template>, StoreError>;
    async fn insert_template(&mut self, template: Template) -> Result<(), StoreError>;
    async fn deactivate_template(&mut self, id: Ulid, at: NaiveDateTime) -> Result<(), StoreError>;

    async fn session(&mut self, id: Ulid) -> Result<Option<Session>, StoreError>;
    /// The session materialized from `template_id` on `date`, if any.
    async fn session_on(
        &mut self,
        template_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<Session>, StoreError>;
    async fn sessions(&mut self, scan: SessionScan) -> Result<Vec<Session>, StoreError>;
    async fn insert_session(&mut self, session: Session) -> Result<(), StoreError>;
    async fn cancel_session(&mut self, id: Ulid, at: NaiveDateTime) -> Result<(), StoreError>;

    async fn registration(&mut self, id: Ulid) -> Result<Option<Registration>, StoreError>;
    async fn registrations(&mut self, scan: RegistrationScan) -> Result<Vec<Registration>, StoreError>;
    /// Live registrations on a session.
    async fn count_registrations(&mut self, session_id: Ulid) -> Result<u32, StoreError>;
    /// The member's live registration on a session, if any.
    async fn member_registration(
        &mut self,
        session_id: Ulid,
        member_id: Ulid,
    ) -> Result<Option<Registration>, StoreError>;
    async fn insert_registration(&mut self, registration: Registration) -> Result<(), StoreError>;
    async fn cancel_registration(&mut self, id: Ulid, at: NaiveDateTime) -> Result<(), StoreError>;

    async fn penalties(&mut self, scan: PenaltyScan) -> Result<Vec<Penalty>, StoreError>;
    async fn insert_penalty(&mut self, penalty: Penalty) -> Result<(), StoreError>;
    /// Delete a penalty, returning the row as it was.
    async fn delete_penalty(&mut self, id: Ulid) -> Result<Option<Penalty>, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}
