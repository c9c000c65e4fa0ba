use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

use super::{PenaltyScan, RegistrationScan, ReservationScan, SessionScan, TemplateScan};

/// A unit of conflict detection. Reads record the keys they depend on,
/// commits bump the keys they write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum Key {
    Member(Ulid),
    Credit(Ulid),
    Reservation(Ulid),
    FacilityDay(Ulid, NaiveDate),
    MemberDay(Ulid, NaiveDate),
    MemberReservations(Ulid),
    Template(Ulid),
    TrainerWeekday(Ulid, u8),
    Session(Ulid),
    TemplateDate(Ulid, NaiveDate),
    TemplateSessions(Ulid),
    SessionSeats(Ulid),
    Registration(Ulid),
    MemberRegistrations(Ulid),
    Penalty(Ulid),
    Table(Table),
}

impl Key {
    /// Keys naming a single row. Two commits writing the same row conflict
    /// even when neither read it; index and table keys only conflict with
    /// readers.
    pub(super) fn is_row(&self) -> bool {
        matches!(
            self,
            Key::Member(_)
                | Key::Credit(_)
                | Key::Reservation(_)
                | Key::Template(_)
                | Key::Session(_)
                | Key::Registration(_)
                | Key::Penalty(_)
        )
    }
}

/// Coarse keys for whole-table scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum Table {
    Reservations,
    Templates,
    Sessions,
    Penalties,
}

impl ReservationScan {
    pub(super) fn key(&self) -> Key {
        match *self {
            ReservationScan::FacilityDay(f, d) => Key::FacilityDay(f, d),
            ReservationScan::MemberDay(m, d) => Key::MemberDay(m, d),
            ReservationScan::FacilityOverlap(f, slot) => Key::FacilityDay(f, slot.date),
            ReservationScan::MemberOverlap(m, slot) => Key::MemberDay(m, slot.date),
            ReservationScan::Member(m) => Key::MemberReservations(m),
            ReservationScan::Between(..) => Key::Table(Table::Reservations),
        }
    }
}

impl SessionScan {
    pub(super) fn key(&self) -> Key {
        match *self {
            SessionScan::Template(t) => Key::TemplateSessions(t),
            SessionScan::FacilityDay(..) | SessionScan::TrainerDay(..) => Key::Table(Table::Sessions),
        }
    }
}

impl RegistrationScan {
    pub(super) fn key(&self) -> Key {
        match *self {
            RegistrationScan::Session(s) => Key::SessionSeats(s),
            RegistrationScan::Member(m) => Key::MemberRegistrations(m),
        }
    }
}

impl TemplateScan {
    pub(super) fn key(&self) -> Key {
        match *self {
            TemplateScan::TrainerWeekday(t, w) => Key::TrainerWeekday(t, w),
            _ => Key::Table(Table::Templates),
        }
    }
}

/// Committed state. Only ever mutated through [`Tables::apply`].
#[derive(Debug, Default)]
pub(super) struct Tables {
    members: HashMap<Ulid, Member>,
    reservations: HashMap<Ulid, Reservation>,
    facility_days: HashMap<(Ulid, NaiveDate), DayLedger>,
    member_days: HashMap<(Ulid, NaiveDate), DayLedger>,
    member_reservations: HashMap<Ulid, Vec<Ulid>>,
    templates: HashMap<Ulid, Template>,
    sessions: HashMap<Ulid, Session>,
    template_dates: HashMap<(Ulid, NaiveDate), Ulid>,
    registrations: HashMap<Ulid, Registration>,
    /// Live registrations only.
    session_registrations: HashMap<Ulid, Vec<Ulid>>,
    /// Live registrations only.
    member_registrations: HashMap<Ulid, Vec<Ulid>>,
    penalties: BTreeMap<Ulid, Penalty>,
}

fn unlist(index: &mut HashMap<Ulid, Vec<Ulid>>, owner: Ulid, id: Ulid) {
    if let Some(ids) = index.get_mut(&owner) {
        ids.retain(|x| *x != id);
        if ids.is_empty() {
            index.remove(&owner);
        }
    }
}

fn unledger(index: &mut HashMap<(Ulid, NaiveDate), DayLedger>, key: (Ulid, NaiveDate), id: Ulid) {
    if let Some(ledger) = index.get_mut(&key) {
        ledger.remove(id);
        if ledger.is_empty() {
            index.remove(&key);
        }
    }
}

impl Tables {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::MemberEnrolled { member } => {
                self.members.entry(member.id).or_insert_with(|| member.clone());
            }
            Event::CreditAdjusted { member_id, delta } => {
                if let Some(member) = self.members.get_mut(member_id) {
                    member.credit_score = member.credit_score.saturating_add(*delta);
                }
            }
            Event::ReservationCreated { reservation: r } => {
                if r.is_live() {
                    self.facility_days
                        .entry((r.facility_id, r.slot.date))
                        .or_default()
                        .insert(r.id, r.slot.range);
                    self.member_days
                        .entry((r.member_id, r.slot.date))
                        .or_default()
                        .insert(r.id, r.slot.range);
                }
                self.member_reservations.entry(r.member_id).or_default().push(r.id);
                self.reservations.insert(r.id, r.clone());
            }
            Event::ReservationCanceled { id, admin_note, at } => {
                let Some(r) = self.reservations.get_mut(id) else { return };
                if let Some(note) = admin_note {
                    r.admin_note = Some(note.clone());
                }
                r.updated_at = *at;
                if r.canceled {
                    return;
                }
                r.canceled = true;
                let (facility, member, date) = (r.facility_id, r.member_id, r.slot.date);
                unledger(&mut self.facility_days, (facility, date), *id);
                unledger(&mut self.member_days, (member, date), *id);
            }
            Event::TemplateCreated { template } => {
                self.templates.insert(template.id, template.clone());
            }
            Event::TemplateDeactivated { id, at } => {
                if let Some(t) = self.templates.get_mut(id) {
                    t.active = false;
                    t.updated_at = *at;
                }
            }
            Event::SessionCreated { session } => {
                self.template_dates
                    .insert((session.template_id, session.slot.date), session.id);
                self.sessions.insert(session.id, session.clone());
            }
            Event::SessionCanceled { id, at } => {
                if let Some(s) = self.sessions.get_mut(id) {
                    s.canceled = true;
                    s.updated_at = *at;
                }
            }
            Event::RegistrationCreated { registration: r } => {
                if !r.canceled {
                    self.session_registrations.entry(r.session_id).or_default().push(r.id);
                    self.member_registrations.entry(r.member_id).or_default().push(r.id);
                }
                self.registrations.insert(r.id, r.clone());
            }
            Event::RegistrationCanceled { id, at } => {
                let Some(r) = self.registrations.get_mut(id) else { return };
                r.updated_at = *at;
                if r.canceled {
                    return;
                }
                r.canceled = true;
                let (session, member) = (r.session_id, r.member_id);
                unlist(&mut self.session_registrations, session, *id);
                unlist(&mut self.member_registrations, member, *id);
            }
            Event::PenaltyApplied { penalty } => {
                self.penalties.insert(penalty.id, penalty.clone());
            }
            Event::PenaltyRevoked { id } => {
                self.penalties.remove(id);
            }
        }
    }

    /// Keys an event writes, resolved against the state it will be applied to.
    pub fn written_keys(&self, event: &Event) -> Vec<Key> {
        let reservation_keys = |r: &Reservation| {
            vec![
                Key::Reservation(r.id),
                Key::FacilityDay(r.facility_id, r.slot.date),
                Key::MemberDay(r.member_id, r.slot.date),
                Key::MemberReservations(r.member_id),
                Key::Table(Table::Reservations),
            ]
        };
        let template_keys = |t: &Template| {
            vec![
                Key::Template(t.id),
                Key::TrainerWeekday(t.trainer_id, t.weekday),
                Key::Table(Table::Templates),
            ]
        };
        let session_keys = |s: &Session| {
            vec![
                Key::Session(s.id),
                Key::TemplateDate(s.template_id, s.slot.date),
                Key::TemplateSessions(s.template_id),
                Key::Table(Table::Sessions),
            ]
        };
        let registration_keys = |r: &Registration| {
            vec![
                Key::Registration(r.id),
                Key::SessionSeats(r.session_id),
                Key::MemberRegistrations(r.member_id),
            ]
        };

        match event {
            Event::MemberEnrolled { member } => vec![Key::Member(member.id), Key::Credit(member.id)],
            Event::CreditAdjusted { member_id, .. } => vec![Key::Credit(*member_id)],
            Event::ReservationCreated { reservation } => reservation_keys(reservation),
            Event::ReservationCanceled { id, .. } => self
                .reservations
                .get(id)
                .map(reservation_keys)
                .unwrap_or_else(|| vec![Key::Reservation(*id)]),
            Event::TemplateCreated { template } => template_keys(template),
            Event::TemplateDeactivated { id, .. } => self
                .templates
                .get(id)
                .map(template_keys)
                .unwrap_or_else(|| vec![Key::Template(*id)]),
            Event::SessionCreated { session } => session_keys(session),
            Event::SessionCanceled { id, .. } => self
                .sessions
                .get(id)
                .map(session_keys)
                .unwrap_or_else(|| vec![Key::Session(*id)]),
            Event::RegistrationCreated { registration } => registration_keys(registration),
            Event::RegistrationCanceled { id, .. } => self
                .registrations
                .get(id)
                .map(registration_keys)
                .unwrap_or_else(|| vec![Key::Registration(*id)]),
            Event::PenaltyApplied { penalty } => {
                vec![Key::Penalty(penalty.id), Key::Table(Table::Penalties)]
            }
            Event::PenaltyRevoked { id } => vec![Key::Penalty(*id), Key::Table(Table::Penalties)],
        }
    }

    /// Creation events that rebuild the current state from empty tables.
    pub fn snapshot(&self) -> Vec<Event> {
        fn sorted<T: Clone>(rows: &HashMap<Ulid, T>) -> Vec<T> {
            let mut ids: Vec<&Ulid> = rows.keys().collect();
            ids.sort();
            ids.into_iter().map(|id| rows[id].clone()).collect()
        }

        let mut events = Vec::new();
        events.extend(sorted(&self.members).into_iter().map(|member| Event::MemberEnrolled { member }));
        events.extend(
            sorted(&self.reservations)
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );
        events.extend(sorted(&self.templates).into_iter().map(|template| Event::TemplateCreated { template }));
        events.extend(sorted(&self.sessions).into_iter().map(|session| Event::SessionCreated { session }));
        events.extend(
            sorted(&self.registrations)
                .into_iter()
                .map(|registration| Event::RegistrationCreated { registration }),
        );
        events.extend(
            self.penalties
                .values()
                .cloned()
                .map(|penalty| Event::PenaltyApplied { penalty }),
        );
        events
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn member(&self, id: Ulid) -> Option<Member> {
        self.members.get(&id).cloned()
    }

    pub fn member_exists(&self, id: Ulid) -> bool {
        self.members.contains_key(&id)
    }

    pub fn reservation(&self, id: Ulid) -> Option<Reservation> {
        self.reservations.get(&id).cloned()
    }

    pub fn reservations(&self, scan: ReservationScan) -> Vec<Reservation> {
        let rows = |ids: &mut dyn Iterator<Item = Ulid>| -> Vec<Reservation> {
            ids.filter_map(|id| self.reservations.get(&id).cloned()).collect()
        };
        let day = |index: &HashMap<(Ulid, NaiveDate), DayLedger>, owner: Ulid, slot: Option<&Slot>, date: NaiveDate| {
            match (index.get(&(owner, date)), slot) {
                (None, _) => Vec::new(),
                (Some(ledger), None) => rows(&mut ledger.ids()),
                (Some(ledger), Some(slot)) => rows(&mut ledger.overlapping(&slot.range).map(|(id, _)| *id)),
            }
        };

        let mut found: Vec<Reservation> = match scan {
            // Day indexes are already in start order.
            ReservationScan::FacilityDay(f, d) => return day(&self.facility_days, f, None, d),
            ReservationScan::MemberDay(m, d) => return day(&self.member_days, m, None, d),
            ReservationScan::FacilityOverlap(f, slot) => return day(&self.facility_days, f, Some(&slot), slot.date),
            ReservationScan::MemberOverlap(m, slot) => return day(&self.member_days, m, Some(&slot), slot.date),
            ReservationScan::Member(m) => self
                .member_reservations
                .get(&m)
                .map(|ids| rows(&mut ids.iter().copied()))
                .unwrap_or_default(),
            ReservationScan::Between(from, to) => self
                .reservations
                .values()
                .filter(|r| r.slot.date >= from && r.slot.date <= to)
                .cloned()
                .collect(),
        };
        found.sort_by_key(|r| (r.slot.date, r.slot.range.start, r.id));
        found
    }

    pub fn count_active_reservations(&self, member: Ulid, now: NaiveDateTime) -> usize {
        self.member_reservations
            .get(&member)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.reservations.get(id))
                    .filter(|r| r.is_live() && r.slot.ends_after(now))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn template(&self, id: Ulid) -> Option<Template> {
        self.templates.get(&id).cloned()
    }

    pub fn templates(&self, scan: TemplateScan) -> Vec<Template> {
        let mut rows: Vec<Template> = self
            .templates
            .values()
            .filter(|t| match scan {
                TemplateScan::TrainerWeekday(trainer, weekday) => {
                    t.active && t.trainer_id == trainer && t.weekday == weekday
                }
                TemplateScan::Trainer(trainer) => t.trainer_id == trainer,
                TemplateScan::Facility(facility) => t.facility_id == facility,
                TemplateScan::Active => t.active,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.weekday, t.range.start, t.id));
        rows
    }

    pub fn session(&self, id: Ulid) -> Option<Session> {
        self.sessions.get(&id).cloned()
    }

    pub fn session_on(&self, template: Ulid, date: NaiveDate) -> Option<Session> {
        self.template_dates
            .get(&(template, date))
            .and_then(|id| self.sessions.get(id))
            .cloned()
    }

    pub fn sessions(&self, scan: SessionScan) -> Vec<Session> {
        let mut rows: Vec<Session> = self
            .sessions
            .values()
            .filter(|s| match scan {
                SessionScan::FacilityDay(f, d) => s.facility_id == f && s.slot.date == d,
                SessionScan::TrainerDay(t, d) => s.trainer_id == t && s.slot.date == d,
                SessionScan::Template(t) => s.template_id == t,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.slot.date, s.slot.range.start, s.id));
        rows
    }

    pub fn registration(&self, id: Ulid) -> Option<Registration> {
        self.registrations.get(&id).cloned()
    }

    pub fn registrations(&self, scan: RegistrationScan) -> Vec<Registration> {
        let ids = match scan {
            RegistrationScan::Session(s) => self.session_registrations.get(&s),
            RegistrationScan::Member(m) => self.member_registrations.get(&m),
        };
        ids.map(|ids| ids.iter().filter_map(|id| self.registrations.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn count_registrations(&self, session: Ulid) -> u32 {
        self.session_registrations
            .get(&session)
            .map_or(0, |ids| ids.len() as u32)
    }

    pub fn member_registration(&self, session: Ulid, member: Ulid) -> Option<Registration> {
        self.session_registrations
            .get(&session)?
            .iter()
            .filter_map(|id| self.registrations.get(id))
            .find(|r| r.member_id == member)
            .cloned()
    }

    pub fn penalty(&self, id: Ulid) -> Option<Penalty> {
        self.penalties.get(&id).cloned()
    }

    pub fn penalties(&self, scan: PenaltyScan) -> Vec<Penalty> {
        self.penalties
            .values()
            .filter(|p| match scan {
                PenaltyScan::Member(m) => p.member_id == m,
                PenaltyScan::IssuedBy(actor) => p.issued_by == actor,
                PenaltyScan::Between(from, to) => p.created_at >= from && p.created_at <= to,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn at() -> NaiveDateTime {
        day().and_time(t(7))
    }

    fn reservation(member: Ulid, facility: Ulid, start: u32, end: u32) -> Reservation {
        Reservation {
            id: Ulid::new(),
            member_id: member,
            facility_id: facility,
            slot: Slot::new(day(), t(start), t(end)),
            note: None,
            canceled: false,
            admin_note: None,
            created_at: at(),
            updated_at: at(),
        }
    }

    #[test]
    fn cancel_removes_from_day_indexes() {
        let mut tables = Tables::default();
        let (member, facility) = (Ulid::new(), Ulid::new());
        let r = reservation(member, facility, 9, 10);
        tables.apply(&Event::ReservationCreated { reservation: r.clone() });

        let query = Slot::new(day(), t(9), t(11));
        let hits = tables.reservations(ReservationScan::FacilityOverlap(facility, query));
        assert_eq!(hits.iter().map(|r| r.id).collect::<Vec<_>>(), vec![r.id]);
        assert_eq!(tables.reservations(ReservationScan::MemberDay(member, day())).len(), 1);

        tables.apply(&Event::ReservationCanceled {
            id: r.id,
            admin_note: Some("court flooded".into()),
            at: at(),
        });
        assert!(tables.reservations(ReservationScan::FacilityOverlap(facility, query)).is_empty());
        assert!(tables.reservations(ReservationScan::MemberDay(member, day())).is_empty());

        // History keeps the canceled row with its note.
        let history = tables.reservations(ReservationScan::Member(member));
        assert_eq!(history.len(), 1);
        assert!(history[0].canceled);
        assert_eq!(history[0].admin_note.as_deref(), Some("court flooded"));
    }

    #[test]
    fn active_count_ignores_past_and_canceled() {
        let mut tables = Tables::default();
        let (member, facility) = (Ulid::new(), Ulid::new());
        let early = reservation(member, facility, 8, 9);
        let late = reservation(member, facility, 18, 19);
        let gone = reservation(member, Ulid::new(), 20, 21);
        for r in [&early, &late, &gone] {
            tables.apply(&Event::ReservationCreated { reservation: r.clone() });
        }
        tables.apply(&Event::ReservationCanceled { id: gone.id, admin_note: None, at: at() });

        assert_eq!(tables.count_active_reservations(member, day().and_time(t(7))), 2);
        assert_eq!(tables.count_active_reservations(member, day().and_time(t(9))), 1);
        assert_eq!(tables.count_active_reservations(member, day().and_time(t(19))), 0);
    }

    #[test]
    fn credit_adjustments_accumulate() {
        let mut tables = Tables::default();
        let id = Ulid::new();
        tables.apply(&Event::MemberEnrolled {
            member: Member { id, credit_score: 100, enrolled_at: at() },
        });
        tables.apply(&Event::CreditAdjusted { member_id: id, delta: -10 });
        tables.apply(&Event::CreditAdjusted { member_id: id, delta: -7 });
        tables.apply(&Event::CreditAdjusted { member_id: id, delta: 10 });
        assert_eq!(tables.member(id).unwrap().credit_score, 93);

        // Re-enrolling never resets an existing member.
        tables.apply(&Event::MemberEnrolled {
            member: Member { id, credit_score: 100, enrolled_at: at() },
        });
        assert_eq!(tables.member(id).unwrap().credit_score, 93);
    }

    #[test]
    fn snapshot_rebuilds_equal_state() {
        let mut tables = Tables::default();
        let member = Ulid::new();
        tables.apply(&Event::MemberEnrolled {
            member: Member { id: member, credit_score: 100, enrolled_at: at() },
        });
        let kept = reservation(member, Ulid::new(), 9, 10);
        let dropped = reservation(member, Ulid::new(), 11, 12);
        tables.apply(&Event::ReservationCreated { reservation: kept.clone() });
        tables.apply(&Event::ReservationCreated { reservation: dropped.clone() });
        tables.apply(&Event::ReservationCanceled { id: dropped.id, admin_note: None, at: at() });
        let penalty = Penalty {
            id: Ulid::new(),
            member_id: member,
            issued_by: Ulid::new(),
            session_id: None,
            reservation_id: Some(kept.id),
            reason: "late".into(),
            points: 10,
            kind: PenaltyKind::Late,
            created_at: at(),
        };
        tables.apply(&Event::PenaltyApplied { penalty: penalty.clone() });
        tables.apply(&Event::CreditAdjusted { member_id: member, delta: -10 });

        let mut rebuilt = Tables::default();
        for event in tables.snapshot() {
            rebuilt.apply(&event);
        }

        assert_eq!(rebuilt.member(member).unwrap().credit_score, 90);
        assert_eq!(rebuilt.count_active_reservations(member, at()), 1);
        assert_eq!(
            rebuilt.reservations(ReservationScan::Member(member)),
            tables.reservations(ReservationScan::Member(member))
        );
        assert_eq!(rebuilt.penalty(penalty.id), Some(penalty));
    }

    #[test]
    fn written_keys_resolve_cancel_targets() {
        let mut tables = Tables::default();
        let r = reservation(Ulid::new(), Ulid::new(), 9, 10);
        tables.apply(&Event::ReservationCreated { reservation: r.clone() });

        let keys = tables.written_keys(&Event::ReservationCanceled { id: r.id, admin_note: None, at: at() });
        assert!(keys.contains(&Key::FacilityDay(r.facility_id, day())));
        assert!(keys.contains(&Key::MemberReservations(r.member_id)));

        let unknown = Ulid::new();
        let keys = tables.written_keys(&Event::ReservationCanceled { id: unknown, admin_note: None, at: at() });
        assert_eq!(keys, vec![Key::Reservation(unknown)]);
    }
}
