use std::sync::Weak;

use chrono::{Days, NaiveDate, NaiveTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::{MAX_HORIZON, MAX_SESSION_CAPACITY};
use crate::model::*;
use crate::observability::{EXPANSION_JOBS_DROPPED_TOTAL, EXPANSION_SESSIONS_TOTAL};
use crate::store::{SessionScan, Store, TemplateScan, Transaction};

use super::conflict::{trainer_overlap, validate_range};
use super::{ConflictKind, Engine, EngineError};

/// The next `count` dates falling on `weekday` (0 = Sunday), starting with
/// `today` when it already is that weekday.
pub fn upcoming_dates(weekday: u8, today: NaiveDate, count: usize) -> Vec<NaiveDate> {
    debug_assert!(weekday < 7);
    let ahead = (u64::from(weekday % 7) + 7 - u64::from(weekday_index(today))) % 7;
    let Some(first) = today.checked_add_days(Days::new(ahead)) else {
        return Vec::new();
    };
    (0..count as u64)
        .map_while(|week| first.checked_add_days(Days::new(week * 7)))
        .collect()
}

/// Request to materialize a template's upcoming sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionJob {
    pub template_id: Ulid,
    pub horizon: usize,
}

/// Per-date outcome counts of one expansion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionReport {
    pub created: usize,
    /// Dates that already had a session.
    pub existing: usize,
    pub failed: usize,
}

/// Drains the expansion queue until the engine is gone. Failures are logged
/// and counted; nothing is reported back to whoever queued the job.
pub(super) async fn run_expander<S: Store>(
    engine: Weak<Engine<S>>,
    mut rx: mpsc::Receiver<ExpansionJob>,
) {
    while let Some(job) = rx.recv().await {
        let Some(engine) = engine.upgrade() else { break };
        match engine.materialize(job.template_id, job.horizon).await {
            Ok(report) if report.failed > 0 => warn!(
                "template {}: {} sessions created, {} failed",
                job.template_id, report.created, report.failed
            ),
            Ok(report) => debug!("template {}: {report:?}", job.template_id),
            Err(e) => warn!("expansion of template {} skipped: {e}", job.template_id),
        }
    }
    debug!("expansion worker stopped");
}

impl<S: Store> Engine<S> {
    /// Register a weekly slot for a trainer, then queue materialization of
    /// its upcoming sessions. Returns as soon as the template is committed.
    pub async fn create_template(
        &self,
        trainer_id: Ulid,
        facility_id: Ulid,
        weekday: u8,
        start: NaiveTime,
        end: NaiveTime,
        capacity: u32,
    ) -> Result<Ulid, EngineError> {
        let id = self
            .tracked("create_template", async move {
                if weekday > 6 {
                    return Err(EngineError::Validation("weekday must be 0 (Sunday) to 6"));
                }
                let range = validate_range(start, end)?;
                if capacity == 0 || capacity > MAX_SESSION_CAPACITY {
                    return Err(EngineError::Validation("capacity out of range"));
                }

                let now = self.clock.now();
                let mut tx = self.begin().await?;
                if let Some(other) = trainer_overlap(&mut tx, trainer_id, weekday, &range).await? {
                    return Err(ConflictKind::TemplateOverlap(other).into());
                }
                let id = Ulid::new();
                tx.insert_template(Template {
                    id,
                    trainer_id,
                    facility_id,
                    weekday,
                    range,
                    capacity,
                    active: true,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
                self.commit(tx, "create_template").await?;
                info!("template {id}: trainer {trainer_id} on weekday {weekday} {start}-{end}, {capacity} seats");
                Ok(id)
            })
            .await?;
        self.enqueue_expansion(id);
        Ok(id)
    }

    /// Hand a template to the expansion worker. False if the job was dropped.
    pub fn enqueue_expansion(&self, template_id: Ulid) -> bool {
        let job = ExpansionJob { template_id, horizon: self.policy.horizon };
        match self.expansions.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!(EXPANSION_JOBS_DROPPED_TOTAL).increment(1);
                warn!("expansion of template {template_id} not queued: {e}");
                false
            }
        }
    }

    /// Queue every active template. Returns how many were queued.
    pub async fn refresh_horizon(&self) -> Result<usize, EngineError> {
        let templates = {
            let mut tx = self.begin().await?;
            tx.templates(TemplateScan::Active).await?
        };
        Ok(templates.iter().filter(|t| self.enqueue_expansion(t.id)).count())
    }

    /// Create the template's sessions for the next `horizon` occurrences,
    /// today included. Each date is its own transaction: one failing date
    /// does not undo or stop the others. Dates that already have a session
    /// are left alone.
    pub async fn materialize(
        &self,
        template_id: Ulid,
        horizon: usize,
    ) -> Result<ExpansionReport, EngineError> {
        self.tracked("materialize", async move {
            let template = {
                let mut tx = self.begin().await?;
                tx.template(template_id).await?.ok_or(EngineError::NotFound(template_id))?
            };
            if !template.active {
                return Err(ConflictKind::TemplateInactive(template_id).into());
            }

            let mut report = ExpansionReport::default();
            let dates = upcoming_dates(template.weekday, self.clock.today(), horizon.min(MAX_HORIZON));
            for date in dates {
                let outcome = match self.materialize_on(&template, date).await {
                    Ok(true) => {
                        report.created += 1;
                        "created"
                    }
                    Ok(false) => {
                        report.existing += 1;
                        "existing"
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!("template {template_id}: session on {date} not created: {e}");
                        "failed"
                    }
                };
                metrics::counter!(EXPANSION_SESSIONS_TOTAL, "outcome" => outcome).increment(1);
            }
            if report.created > 0 {
                info!("template {template_id}: materialized {} sessions", report.created);
            }
            Ok(report)
        })
        .await
    }

    /// Ok(false) when the date already has a session.
    async fn materialize_on(&self, template: &Template, date: NaiveDate) -> Result<bool, EngineError> {
        let mut tx = self.begin().await?;
        match tx.template(template.id).await? {
            Some(current) if current.active => {}
            _ => return Err(ConflictKind::TemplateInactive(template.id).into()),
        }
        if tx.session_on(template.id, date).await?.is_some() {
            return Ok(false);
        }
        let now = self.clock.now();
        let id = Ulid::new();
        tx.insert_session(Session {
            id,
            template_id: template.id,
            trainer_id: template.trainer_id,
            facility_id: template.facility_id,
            slot: Slot { date, range: template.range },
            capacity: template.capacity,
            canceled: false,
            created_at: now,
            updated_at: now,
        })
        .await?;
        self.commit(tx, "materialize").await?;
        debug!("session {id} from template {} on {date}", template.id);
        Ok(true)
    }

    /// Retire a template: its weekday slot frees up, no further sessions are
    /// materialized, and its sessions that have not started yet are canceled,
    /// all in one transaction. Returns how many sessions were canceled.
    pub async fn deactivate_template(&self, id: Ulid) -> Result<usize, EngineError> {
        self.tracked("deactivate_template", async move {
            let now = self.clock.now();
            let mut tx = self.begin().await?;
            let template = tx.template(id).await?.ok_or(EngineError::NotFound(id))?;
            if !template.active {
                return Ok(0);
            }
            let upcoming: Vec<Ulid> = tx
                .sessions(SessionScan::Template(id))
                .await?
                .into_iter()
                .filter(|s| !s.canceled && s.slot.starts_at() > now)
                .map(|s| s.id)
                .collect();
            for session_id in &upcoming {
                tx.cancel_session(*session_id, now).await?;
            }
            tx.deactivate_template(id, now).await?;
            self.commit(tx, "deactivate_template").await?;
            info!("template {id} deactivated, {} upcoming sessions canceled", upcoming.len());
            Ok(upcoming.len())
        })
        .await
    }
}
