use chrono::{NaiveDate, NaiveTime};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{Store, Transaction};

use super::capacity::has_free_slot;
use super::conflict::{
    duplicate_booking, facility_overlap, member_overlap, validate_range, validate_text,
};
use super::quota::exceeds_active_limit;
use super::{ConflictKind, Engine, EngineError};

impl<S: Store> Engine<S> {
    /// Add a member with the configured starting credit score.
    pub async fn enroll_member(&self, id: Ulid) -> Result<Member, EngineError> {
        self.tracked("enroll_member", async move {
            let mut tx = self.begin().await?;
            if tx.member_exists(id).await? {
                return Err(EngineError::AlreadyExists(id));
            }
            let member = Member {
                id,
                credit_score: self.policy.initial_credit_score,
                enrolled_at: self.clock.now(),
            };
            tx.insert_member(member.clone()).await?;
            self.commit(tx, "enroll_member").await?;
            info!("enrolled member {id} with score {}", member.credit_score);
            Ok(member)
        })
        .await
    }

    /// Book `facility_id` for `[start, end)` on `date`.
    ///
    /// Checks run in order and the first failure wins: same facility already
    /// booked that day, member overlap on any facility, facility overlap,
    /// active-reservation quota. A lost race surfaces as
    /// [`EngineError::SerializationRetry`].
    pub async fn create_reservation(
        &self,
        member_id: Ulid,
        facility_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        note: Option<String>,
    ) -> Result<Ulid, EngineError> {
        self.tracked("create_reservation", async move {
            let range = validate_range(start, end)?;
            validate_text(note.as_deref(), MAX_NOTE_LEN, "note too long")?;
            let slot = Slot { date, range };
            let now = self.clock.now();

            let mut tx = self.begin().await?;
            if !tx.member_exists(member_id).await? {
                return Err(EngineError::NotFound(member_id));
            }
            if duplicate_booking(&mut tx, member_id, facility_id, date).await?.is_some() {
                return Err(ConflictKind::DuplicateBooking.into());
            }
            if let Some(other) = member_overlap(&mut tx, member_id, &slot).await? {
                return Err(ConflictKind::MemberOverlap(other).into());
            }
            if let Some(other) = facility_overlap(&mut tx, facility_id, &slot).await? {
                return Err(ConflictKind::FacilityOverlap(other).into());
            }
            let limit = self.policy.max_active_reservations;
            if exceeds_active_limit(&mut tx, member_id, now, limit).await? {
                return Err(EngineError::QuotaExceeded { member: member_id, limit });
            }

            let id = Ulid::new();
            tx.insert_reservation(Reservation {
                id,
                member_id,
                facility_id,
                slot,
                note,
                canceled: false,
                admin_note: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
            self.commit(tx, "create_reservation").await?;
            info!("reservation {id}: member {member_id} on facility {facility_id}, {date} {start}-{end}");
            Ok(id)
        })
        .await
    }

    /// Flip the cancellation flag. Never re-runs any check.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        admin_note: Option<String>,
    ) -> Result<(), EngineError> {
        self.tracked("cancel_reservation", async move {
            validate_text(admin_note.as_deref(), MAX_ADMIN_NOTE_LEN, "admin note too long")?;
            let mut tx = self.begin().await?;
            if tx.reservation(id).await?.is_none() {
                return Err(EngineError::NotFound(id));
            }
            tx.cancel_reservation(id, admin_note, self.clock.now()).await?;
            self.commit(tx, "cancel_reservation").await?;
            info!("reservation {id} canceled");
            Ok(())
        })
        .await
    }

    /// Sign a member up for a session if a seat is free.
    pub async fn create_registration(
        &self,
        member_id: Ulid,
        session_id: Ulid,
    ) -> Result<Ulid, EngineError> {
        self.tracked("create_registration", async move {
            let now = self.clock.now();
            let mut tx = self.begin().await?;
            if !tx.member_exists(member_id).await? {
                return Err(EngineError::NotFound(member_id));
            }
            let session = tx
                .session(session_id)
                .await?
                .ok_or(EngineError::NotFound(session_id))?;
            if session.canceled {
                return Err(ConflictKind::SessionCanceled(session_id).into());
            }
            if let Some(existing) = tx.member_registration(session_id, member_id).await? {
                return Err(ConflictKind::AlreadyRegistered(existing.id).into());
            }
            if !has_free_slot(&mut tx, &session).await? {
                return Err(EngineError::CapacityExceeded {
                    session: session_id,
                    capacity: session.capacity,
                });
            }

            let id = Ulid::new();
            tx.insert_registration(Registration {
                id,
                session_id,
                member_id,
                canceled: false,
                created_at: now,
                updated_at: now,
            })
            .await?;
            self.commit(tx, "create_registration").await?;
            info!("registration {id}: member {member_id} on session {session_id}");
            Ok(id)
        })
        .await
    }

    pub async fn cancel_registration(&self, id: Ulid) -> Result<(), EngineError> {
        self.tracked("cancel_registration", async move {
            let mut tx = self.begin().await?;
            if tx.registration(id).await?.is_none() {
                return Err(EngineError::NotFound(id));
            }
            tx.cancel_registration(id, self.clock.now()).await?;
            self.commit(tx, "cancel_registration").await?;
            info!("registration {id} canceled");
            Ok(())
        })
        .await
    }

    /// Cancel one session instance. Its registrations are left as they are.
    pub async fn cancel_session(&self, id: Ulid) -> Result<(), EngineError> {
        self.tracked("cancel_session", async move {
            let mut tx = self.begin().await?;
            if tx.session(id).await?.is_none() {
                return Err(EngineError::NotFound(id));
            }
            tx.cancel_session(id, self.clock.now()).await?;
            self.commit(tx, "cancel_session").await?;
            info!("session {id} canceled");
            Ok(())
        })
        .await
    }
}
