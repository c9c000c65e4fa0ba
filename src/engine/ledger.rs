use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::{Penalty, PenaltyKind};
use crate::observability::{PENALTY_POINTS_APPLIED_TOTAL, PENALTY_POINTS_REVOKED_TOTAL};
use crate::store::{Store, Transaction};

use super::{Engine, EngineError};

/// Who issued a penalty and what it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyContext {
    pub issued_by: Ulid,
    pub kind: PenaltyKind,
    pub session_id: Option<Ulid>,
    pub reservation_id: Option<Ulid>,
}

impl PenaltyContext {
    pub fn new(issued_by: Ulid, kind: PenaltyKind) -> Self {
        Self { issued_by, kind, session_id: None, reservation_id: None }
    }

    pub fn for_session(mut self, session_id: Ulid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn for_reservation(mut self, reservation_id: Ulid) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }
}

fn as_delta(points: u32) -> Result<i32, EngineError> {
    i32::try_from(points).map_err(|_| EngineError::Validation("penalty points out of range"))
}

impl<S: Store> Engine<S> {
    /// Deduct `points` from the member's credit score and record the penalty,
    /// both in one transaction.
    pub async fn apply_penalty(
        &self,
        member_id: Ulid,
        points: u32,
        reason: &str,
        context: PenaltyContext,
    ) -> Result<Ulid, EngineError> {
        self.tracked("apply_penalty", async move {
            if points < self.policy.penalty_min_points || points > self.policy.penalty_max_points {
                return Err(EngineError::Validation("penalty points out of range"));
            }
            let delta = as_delta(points)?;
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(EngineError::Validation("penalty reason is required"));
            }
            if reason.len() > MAX_REASON_LEN {
                return Err(EngineError::Validation("penalty reason too long"));
            }

            let mut tx = self.begin().await?;
            if !tx.member_exists(member_id).await? {
                return Err(EngineError::NotFound(member_id));
            }
            if let Some(session_id) = context.session_id
                && tx.session(session_id).await?.is_none()
            {
                return Err(EngineError::NotFound(session_id));
            }
            if let Some(reservation_id) = context.reservation_id
                && tx.reservation(reservation_id).await?.is_none()
            {
                return Err(EngineError::NotFound(reservation_id));
            }

            let id = Ulid::new();
            tx.adjust_credit(member_id, -delta).await?;
            tx.insert_penalty(Penalty {
                id,
                member_id,
                issued_by: context.issued_by,
                session_id: context.session_id,
                reservation_id: context.reservation_id,
                reason: reason.to_string(),
                points,
                kind: context.kind,
                created_at: self.clock.now(),
            })
            .await?;
            self.commit(tx, "apply_penalty").await?;

            metrics::counter!(PENALTY_POINTS_APPLIED_TOTAL, "kind" => context.kind.as_str())
                .increment(u64::from(points));
            info!("penalty {id}: -{points} ({}) for member {member_id}", context.kind.as_str());
            Ok(id)
        })
        .await
    }

    /// Delete a penalty and give back exactly the points it took.
    pub async fn revoke_penalty(&self, id: Ulid) -> Result<Penalty, EngineError> {
        self.tracked("revoke_penalty", async move {
            let mut tx = self.begin().await?;
            let penalty = tx.delete_penalty(id).await?.ok_or(EngineError::NotFound(id))?;
            tx.adjust_credit(penalty.member_id, as_delta(penalty.points)?).await?;
            self.commit(tx, "revoke_penalty").await?;

            metrics::counter!(PENALTY_POINTS_REVOKED_TOTAL, "kind" => penalty.kind.as_str())
                .increment(u64::from(penalty.points));
            info!(
                "penalty {id} revoked: +{} restored to member {}",
                penalty.points, penalty.member_id
            );
            Ok(penalty)
        })
        .await
    }
}
