use std::cmp::Reverse;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use ulid::Ulid;

use crate::limits::{REGISTRATION_PAGE_SIZE, RESERVATION_PAGE_SIZE};
use crate::model::*;
use crate::store::{
    PenaltyScan, RegistrationScan, ReservationScan, SessionScan, Store, TemplateScan, Transaction,
};

use super::availability;
use super::capacity;
use super::conflict::{self, validate_range};
use super::quota;
use super::{Engine, EngineError};

/// Zero-based page `page` of `rows`.
fn page_of<T>(rows: Vec<T>, page: usize, size: usize) -> Vec<T> {
    rows.into_iter().skip(page.saturating_mul(size)).take(size).collect()
}

impl<S: Store> Engine<S> {
    pub async fn credit_score(&self, member_id: Ulid) -> Result<i32, EngineError> {
        let mut tx = self.begin().await?;
        let member = tx.member(member_id).await?.ok_or(EngineError::NotFound(member_id))?;
        Ok(member.credit_score)
    }

    pub async fn member(&self, id: Ulid) -> Result<Option<Member>, EngineError> {
        let mut tx = self.begin().await?;
        Ok(tx.member(id).await?)
    }

    pub async fn reservation(&self, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        let mut tx = self.begin().await?;
        Ok(tx.reservation(id).await?)
    }

    /// Live reservations on a facility for one day, ordered by start.
    pub async fn facility_reservations(
        &self,
        facility_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut tx = self.begin().await?;
        Ok(tx.reservations(ReservationScan::FacilityDay(facility_id, date)).await?)
    }

    /// A member's booking history, canceled included, newest slot first.
    pub async fn member_reservations(
        &self,
        member_id: Ulid,
        page: usize,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut tx = self.begin().await?;
        let mut rows = tx.reservations(ReservationScan::Member(member_id)).await?;
        rows.sort_by_key(|r| Reverse((r.slot.date, r.slot.range.start, r.id)));
        Ok(page_of(rows, page, RESERVATION_PAGE_SIZE))
    }

    /// Every reservation dated within `[from, to]`, newest slot first.
    pub async fn reservations_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        page: usize,
    ) -> Result<Vec<Reservation>, EngineError> {
        if from > to {
            return Err(EngineError::Validation("range end must not precede its start"));
        }
        let mut tx = self.begin().await?;
        let mut rows = tx.reservations(ReservationScan::Between(from, to)).await?;
        rows.sort_by_key(|r| Reverse((r.slot.date, r.slot.range.start, r.id)));
        Ok(page_of(rows, page, RESERVATION_PAGE_SIZE))
    }

    pub async fn template(&self, id: Ulid) -> Result<Option<Template>, EngineError> {
        let mut tx = self.begin().await?;
        Ok(tx.template(id).await?)
    }

    pub async fn trainer_templates(&self, trainer_id: Ulid) -> Result<Vec<Template>, EngineError> {
        let mut tx = self.begin().await?;
        Ok(tx.templates(TemplateScan::Trainer(trainer_id)).await?)
    }

    pub async fn facility_templates(&self, facility_id: Ulid) -> Result<Vec<Template>, EngineError> {
        let mut tx = self.begin().await?;
        Ok(tx.templates(TemplateScan::Facility(facility_id)).await?)
    }

    /// A session with its live registration count.
    pub async fn session(&self, id: Ulid) -> Result<SessionView, EngineError> {
        let mut tx = self.begin().await?;
        let session = tx.session(id).await?.ok_or(EngineError::NotFound(id))?;
        let registered = tx.count_registrations(id).await?;
        Ok(SessionView { session, registered })
    }

    pub async fn facility_sessions(
        &self,
        facility_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SessionView>, EngineError> {
        self.session_views(SessionScan::FacilityDay(facility_id, date)).await
    }

    pub async fn trainer_sessions(
        &self,
        trainer_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SessionView>, EngineError> {
        self.session_views(SessionScan::TrainerDay(trainer_id, date)).await
    }

    /// All sessions materialized from one template, oldest first.
    pub async fn template_sessions(&self, template_id: Ulid) -> Result<Vec<SessionView>, EngineError> {
        self.session_views(SessionScan::Template(template_id)).await
    }

    async fn session_views(&self, scan: SessionScan) -> Result<Vec<SessionView>, EngineError> {
        let mut tx = self.begin().await?;
        let sessions = tx.sessions(scan).await?;
        let mut views = Vec::with_capacity(sessions.len());
        for session in sessions {
            let registered = tx.count_registrations(session.id).await?;
            views.push(SessionView { session, registered });
        }
        Ok(views)
    }

    /// Live registrations on a session, in signup order.
    pub async fn session_registrations(
        &self,
        session_id: Ulid,
    ) -> Result<Vec<Registration>, EngineError> {
        let mut tx = self.begin().await?;
        let mut rows = tx.registrations(RegistrationScan::Session(session_id)).await?;
        rows.sort_by_key(|r| (r.created_at, r.id));
        Ok(rows)
    }

    /// A member's live registrations, newest first.
    pub async fn member_registrations(
        &self,
        member_id: Ulid,
        page: usize,
    ) -> Result<Vec<Registration>, EngineError> {
        let mut tx = self.begin().await?;
        let mut rows = tx.registrations(RegistrationScan::Member(member_id)).await?;
        rows.sort_by_key(|r| Reverse((r.created_at, r.id)));
        Ok(page_of(rows, page, REGISTRATION_PAGE_SIZE))
    }

    pub async fn member_penalties(&self, member_id: Ulid) -> Result<Vec<Penalty>, EngineError> {
        self.penalty_list(PenaltyScan::Member(member_id)).await
    }

    pub async fn issued_penalties(&self, issued_by: Ulid) -> Result<Vec<Penalty>, EngineError> {
        self.penalty_list(PenaltyScan::IssuedBy(issued_by)).await
    }

    pub async fn penalties_between(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Penalty>, EngineError> {
        if from > to {
            return Err(EngineError::Validation("range end must not precede its start"));
        }
        self.penalty_list(PenaltyScan::Between(from, to)).await
    }

    async fn penalty_list(&self, scan: PenaltyScan) -> Result<Vec<Penalty>, EngineError> {
        let mut tx = self.begin().await?;
        let mut rows = tx.penalties(scan).await?;
        rows.sort_by_key(|p| Reverse((p.created_at, p.id)));
        Ok(rows)
    }

    /// Bookable gaps of at least `min` inside the facility's opening hours.
    pub async fn free_windows(
        &self,
        facility_id: Ulid,
        date: NaiveDate,
        open: NaiveTime,
        close: NaiveTime,
        min: TimeDelta,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let opening = validate_range(open, close)?;
        let booked: Vec<TimeRange> = self
            .facility_reservations(facility_id, date)
            .await?
            .iter()
            .map(|r| r.slot.range)
            .collect();
        Ok(availability::free_windows(opening, &booked, min))
    }

    // ── Standalone checks ────────────────────────────────────────
    //
    // Each runs the transactional check in a read transaction of its own.
    // The answer may be stale by the time the caller acts on it.

    pub async fn has_facility_overlap(&self, facility_id: Ulid, slot: Slot) -> Result<bool, EngineError> {
        let mut tx = self.begin().await?;
        Ok(conflict::facility_overlap(&mut tx, facility_id, &slot).await?.is_some())
    }

    pub async fn has_member_overlap(&self, member_id: Ulid, slot: Slot) -> Result<bool, EngineError> {
        let mut tx = self.begin().await?;
        Ok(conflict::member_overlap(&mut tx, member_id, &slot).await?.is_some())
    }

    pub async fn has_free_slot(&self, session_id: Ulid) -> Result<bool, EngineError> {
        let mut tx = self.begin().await?;
        let session = tx.session(session_id).await?.ok_or(EngineError::NotFound(session_id))?;
        Ok(capacity::has_free_slot(&mut tx, &session).await?)
    }

    /// Whether the member is already at the active-reservation limit.
    pub async fn exceeds_active_limit(&self, member_id: Ulid) -> Result<bool, EngineError> {
        let mut tx = self.begin().await?;
        let now = self.clock.now();
        let limit = self.policy.max_active_reservations;
        Ok(quota::exceeds_active_limit(&mut tx, member_id, now, limit).await?)
    }
}
