use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Touching ranges (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A time range on one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub range: TimeRange,
}

impl Slot {
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self { date, range: TimeRange::new(start, end) }
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.date == other.date && self.range.overlaps(&other.range)
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.start)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.end)
    }

    /// Later day, or same day with an end time still ahead of `now`.
    pub fn ends_after(&self, now: NaiveDateTime) -> bool {
        self.date > now.date() || (self.date == now.date() && self.range.end > now.time())
    }
}

/// Day index with Sunday = 0.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Live intervals of one partition (a facility-day or member-day), sorted by start.
#[derive(Debug, Clone, Default)]
pub struct DayLedger {
    entries: Vec<(Ulid, TimeRange)>,
}

impl DayLedger {
    pub fn insert(&mut self, id: Ulid, range: TimeRange) {
        let pos = self
            .entries
            .binary_search_by_key(&range.start, |(_, r)| r.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, (id, range));
    }

    pub fn remove(&mut self, id: Ulid) -> bool {
        match self.entries.iter().position(|(eid, _)| *eid == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Entries overlapping `query`. Binary search skips everything starting
    /// at or after `query.end`.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &(Ulid, TimeRange)> {
        let right_bound = self.entries.partition_point(|(_, r)| r.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |(_, r)| r.end > query.start)
    }

    pub fn ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn ranges(&self) -> impl Iterator<Item = TimeRange> + '_ {
        self.entries.iter().map(|(_, r)| *r)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Rows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Ulid,
    pub credit_score: i32,
    pub enrolled_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub member_id: Ulid,
    pub facility_id: Ulid,
    pub slot: Slot,
    pub note: Option<String>,
    pub canceled: bool,
    pub admin_note: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Reservation {
    pub fn is_live(&self) -> bool {
        !self.canceled
    }
}

/// A trainer's recurring weekly slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub facility_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub weekday: u8,
    pub range: TimeRange,
    pub capacity: u32,
    pub active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One dated occurrence of a [`Template`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub template_id: Ulid,
    pub trainer_id: Ulid,
    pub facility_id: Ulid,
    pub slot: Slot,
    /// Copied from the template when the session was materialized.
    pub capacity: u32,
    pub canceled: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: Ulid,
    pub session_id: Ulid,
    pub member_id: Ulid,
    pub canceled: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PenaltyKind {
    Late,
    Absence,
    Damage,
    Behavior,
    Other,
}

impl PenaltyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PenaltyKind::Late => "late",
            PenaltyKind::Absence => "absence",
            PenaltyKind::Damage => "damage",
            PenaltyKind::Behavior => "behavior",
            PenaltyKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Penalty {
    pub id: Ulid,
    pub member_id: Ulid,
    pub issued_by: Ulid,
    pub session_id: Option<Ulid>,
    pub reservation_id: Option<Ulid>,
    pub reason: String,
    pub points: u32,
    pub kind: PenaltyKind,
    pub created_at: NaiveDateTime,
}

// ── Journal records ──────────────────────────────────────────────

/// One state change. Creation events carry the full row so a snapshot is
/// just a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MemberEnrolled {
        member: Member,
    },
    CreditAdjusted {
        member_id: Ulid,
        delta: i32,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCanceled {
        id: Ulid,
        admin_note: Option<String>,
        at: NaiveDateTime,
    },
    TemplateCreated {
        template: Template,
    },
    TemplateDeactivated {
        id: Ulid,
        at: NaiveDateTime,
    },
    SessionCreated {
        session: Session,
    },
    SessionCanceled {
        id: Ulid,
        at: NaiveDateTime,
    },
    RegistrationCreated {
        registration: Registration,
    },
    RegistrationCanceled {
        id: Ulid,
        at: NaiveDateTime,
    },
    PenaltyApplied {
        penalty: Penalty,
    },
    PenaltyRevoked {
        id: Ulid,
    },
}

/// The events of one committed transaction. This is the WAL record format:
/// replay applies a commit entirely or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub seq: u64,
    pub events: Vec<Event>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub session: Session,
    /// Live registrations.
    pub registered: u32,
}

impl SessionView {
    pub fn seats_left(&self) -> u32 {
        self.session.capacity.saturating_sub(self.registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    #[test]
    fn range_overlap() {
        let a = TimeRange::new(t(9, 0), t(10, 0));
        let b = TimeRange::new(t(9, 30), t(10, 30));
        let c = TimeRange::new(t(10, 0), t(11, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
        assert_eq!(a.duration(), TimeDelta::hours(1));
    }

    #[test]
    fn range_containment_counts_as_overlap() {
        let outer = TimeRange::new(t(8, 0), t(12, 0));
        let inner = TimeRange::new(t(9, 0), t(9, 15));
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
        assert!(outer.contains_range(&inner));
        assert!(!inner.contains_range(&outer));
    }

    #[test]
    fn slot_overlap_needs_same_day() {
        let a = Slot::new(d(10), t(9, 0), t(10, 0));
        let b = Slot::new(d(11), t(9, 0), t(10, 0));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&Slot::new(d(10), t(9, 59), t(11, 0))));
    }

    #[test]
    fn ends_after_boundaries() {
        let slot = Slot::new(d(10), t(9, 0), t(10, 0));
        assert!(slot.ends_after(d(9).and_time(t(23, 0))));
        assert!(slot.ends_after(d(10).and_time(t(9, 59))));
        assert!(!slot.ends_after(d(10).and_time(t(10, 0))));
        assert!(!slot.ends_after(d(11).and_time(t(0, 0))));
    }

    #[test]
    fn weekday_index_is_sunday_based() {
        // 2025-03-09 is a Sunday, 2025-03-10 a Monday.
        assert_eq!(weekday_index(d(9)), 0);
        assert_eq!(weekday_index(d(10)), 1);
        assert_eq!(weekday_index(d(15)), 6);
    }

    #[test]
    fn day_ledger_keeps_start_order() {
        let mut ledger = DayLedger::default();
        let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        ledger.insert(a, TimeRange::new(t(14, 0), t(15, 0)));
        ledger.insert(b, TimeRange::new(t(9, 0), t(10, 0)));
        ledger.insert(c, TimeRange::new(t(11, 0), t(12, 0)));

        let starts: Vec<_> = ledger.ranges().map(|r| r.start).collect();
        assert_eq!(starts, vec![t(9, 0), t(11, 0), t(14, 0)]);

        assert!(ledger.remove(c));
        assert!(!ledger.remove(c));
        assert_eq!(ledger.ids().collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn day_ledger_overlapping_query() {
        let mut ledger = DayLedger::default();
        let morning = Ulid::new();
        let noon = Ulid::new();
        let evening = Ulid::new();
        ledger.insert(morning, TimeRange::new(t(9, 0), t(10, 0)));
        ledger.insert(noon, TimeRange::new(t(12, 0), t(13, 0)));
        ledger.insert(evening, TimeRange::new(t(18, 0), t(19, 0)));

        let hits: Vec<_> = ledger
            .overlapping(&TimeRange::new(t(9, 30), t(12, 30)))
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(hits, vec![morning, noon]);

        // Touching both ends of noon's booking.
        let touching = TimeRange::new(t(10, 0), t(12, 0));
        assert_eq!(ledger.overlapping(&touching).count(), 0);

        let wide = TimeRange::new(t(0, 0), t(23, 59));
        assert_eq!(ledger.overlapping(&wide).count(), 3);
    }

    #[test]
    fn session_view_seats_left() {
        let now = d(1).and_time(t(0, 0));
        let view = SessionView {
            session: Session {
                id: Ulid::new(),
                template_id: Ulid::new(),
                trainer_id: Ulid::new(),
                facility_id: Ulid::new(),
                slot: Slot::new(d(10), t(9, 0), t(10, 0)),
                capacity: 2,
                canceled: false,
                created_at: now,
                updated_at: now,
            },
            registered: 3,
        };
        assert_eq!(view.seats_left(), 0);
    }
}
