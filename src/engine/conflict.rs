use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;
use crate::store::{ReservationScan, StoreError, TemplateScan, Transaction};

use super::EngineError;

pub(crate) fn validate_range(start: NaiveTime, end: NaiveTime) -> Result<TimeRange, EngineError> {
    if start >= end {
        return Err(EngineError::Validation("end time must be after start time"));
    }
    Ok(TimeRange::new(start, end))
}

pub(crate) fn validate_text(
    text: Option<&str>,
    max_len: usize,
    too_long: &'static str,
) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > max_len => Err(EngineError::Validation(too_long)),
        _ => Ok(()),
    }
}

/// The member's live reservation on `facility` for `date`, if any.
pub async fn duplicate_booking(
    tx: &mut impl Transaction,
    member: Ulid,
    facility: Ulid,
    date: NaiveDate,
) -> Result<Option<Ulid>, StoreError> {
    let booked = tx.reservations(ReservationScan::MemberDay(member, date)).await?;
    Ok(booked.into_iter().find(|r| r.facility_id == facility).map(|r| r.id))
}

/// First live reservation of `member` overlapping `slot` on any facility.
pub async fn member_overlap(
    tx: &mut impl Transaction,
    member: Ulid,
    slot: &Slot,
) -> Result<Option<Ulid>, StoreError> {
    let hits = tx.reservations(ReservationScan::MemberOverlap(member, *slot)).await?;
    Ok(hits.into_iter().find(|r| r.slot.overlaps(slot)).map(|r| r.id))
}

/// First live reservation on `facility` overlapping `slot`.
pub async fn facility_overlap(
    tx: &mut impl Transaction,
    facility: Ulid,
    slot: &Slot,
) -> Result<Option<Ulid>, StoreError> {
    let hits = tx.reservations(ReservationScan::FacilityOverlap(facility, *slot)).await?;
    Ok(hits.into_iter().find(|r| r.slot.overlaps(slot)).map(|r| r.id))
}

/// First active template of `trainer` on `weekday` overlapping `range`.
pub async fn trainer_overlap(
    tx: &mut impl Transaction,
    trainer: Ulid,
    weekday: u8,
    range: &TimeRange,
) -> Result<Option<Ulid>, StoreError> {
    let templates = tx.templates(TemplateScan::TrainerWeekday(trainer, weekday)).await?;
    Ok(templates
        .into_iter()
        .find(|t| t.active && t.range.overlaps(range))
        .map(|t| t.id))
}
