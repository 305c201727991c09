use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Days from the common era to 1970-01-01, for local-day indexing.
const EPOCH_CE_DAYS: i64 = 719_163;

/// Monotonic-enough time source. Injectable so every time-driven path in the
/// kernel is deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn local_offset(&self) -> FixedOffset;

    /// Integer local-day index (days since 1970-01-01 in the local zone).
    fn day_epoch(&self) -> i64 {
        day_epoch_at(self.now(), self.local_offset())
    }
}

pub fn day_epoch_at(now: DateTime<Utc>, offset: FixedOffset) -> i64 {
    now.with_timezone(&offset).date_naive().num_days_from_ce() as i64 - EPOCH_CE_DAYS
}

/// Wall-clock implementation used by the running process.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_offset(&self) -> FixedOffset {
        *Local::now().offset()
    }
}

/// Hand-cranked clock for tests.
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self { now: std::sync::Mutex::new(start), offset }
    }

    pub fn utc(start: DateTime<Utc>) -> Self {
        Self::new(start, FixedOffset::east_opt(0).expect("zero offset"))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }

    fn local_offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Named segment of the local day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayPhase {
    Morning,
    Midday,
    Afternoon,
    Evening,
    Night,
}

impl DayPhase {
    pub const ALL: [DayPhase; 5] = [
        Self::Morning,
        Self::Midday,
        Self::Afternoon,
        Self::Evening,
        Self::Night,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Midday => "midday",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
            Self::Night => "night",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == name)
    }
}

impl std::fmt::Display for DayPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase boundaries within a local day. The night boundary wraps at
/// midnight, so any time before the morning boundary is night.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSchedule {
    boundaries: Vec<(DayPhase, NaiveTime)>,
}

impl Default for PhaseSchedule {
    fn default() -> Self {
        Self::new([
            (DayPhase::Night, NaiveTime::from_hms_opt(0, 0, 0).expect("valid time")),
            (DayPhase::Morning, NaiveTime::from_hms_opt(6, 0, 0).expect("valid time")),
            (DayPhase::Midday, NaiveTime::from_hms_opt(12, 0, 0).expect("valid time")),
            (DayPhase::Afternoon, NaiveTime::from_hms_opt(17, 0, 0).expect("valid time")),
            (DayPhase::Evening, NaiveTime::from_hms_opt(21, 0, 0).expect("valid time")),
        ])
    }
}

impl PhaseSchedule {
    pub fn new(boundaries: impl IntoIterator<Item = (DayPhase, NaiveTime)>) -> Self {
        let mut boundaries: Vec<_> = boundaries.into_iter().collect();
        boundaries.sort_by_key(|(_, t)| *t);
        Self { boundaries }
    }

    pub fn boundary(&self, phase: DayPhase) -> Option<NaiveTime> {
        self.boundaries.iter().find(|(p, _)| *p == phase).map(|(_, t)| *t)
    }

    /// The phase a local time falls inside.
    pub fn phase_at(&self, time: NaiveTime) -> DayPhase {
        self.boundaries
            .iter()
            .rev()
            .find(|(_, t)| *t <= time)
            .or_else(|| self.boundaries.last())
            .map(|(p, _)| *p)
            .unwrap_or(DayPhase::Night)
    }

    /// Next boundary instant of `phase` strictly after `after` (local).
    pub fn next_boundary_after(
        &self,
        phase: DayPhase,
        after: DateTime<FixedOffset>,
    ) -> Option<DateTime<FixedOffset>> {
        let time = self.boundary(phase)?;
        let offset = *after.offset();
        let today = offset.from_local_datetime(&after.date_naive().and_time(time)).single()?;
        if today > after {
            Some(today)
        } else {
            let tomorrow = after.date_naive().succ_opt()?;
            offset.from_local_datetime(&tomorrow.and_time(time)).single()
        }
    }
}

/// Zone a schedule spec is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleTz {
    #[default]
    Local,
    Utc,
}

impl ScheduleTz {
    pub fn offset(&self, clock: &dyn Clock) -> FixedOffset {
        match self {
            Self::Local => clock.local_offset(),
            Self::Utc => FixedOffset::east_opt(0).expect("zero offset"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScheduleError {
    #[error("expected 5 cron fields, found {0}")]
    FieldCount(usize),
    #[error("invalid cron field '{0}'")]
    Field(String),
    #[error("value {value} out of range {min}..={max}")]
    Range { value: u32, min: u32, max: u32 },
    #[error("unknown phase '{0}'")]
    Phase(String),
}

/// Cron-like schedule: standard `min hour dom month dow` fields, or a named
/// phase (`@morning`) resolved against the configured [`PhaseSchedule`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    Cron(CronExpr),
    Phase(DayPhase),
}

impl ScheduleSpec {
    pub fn parse(spec: &str) -> Result<Self, ScheduleError> {
        let spec = spec.trim();
        if let Some(name) = spec.strip_prefix('@') {
            return DayPhase::parse(name)
                .map(Self::Phase)
                .ok_or_else(|| ScheduleError::Phase(name.to_string()));
        }
        CronExpr::parse(spec).map(Self::Cron)
    }

    /// Next fire instant strictly after `after`, in UTC.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
        offset: FixedOffset,
        phases: &PhaseSchedule,
    ) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&offset);
        let next = match self {
            Self::Cron(expr) => expr.next_after(local)?,
            Self::Phase(phase) => phases.next_boundary_after(*phase, local)?,
        };
        Some(next.with_timezone(&Utc))
    }
}

/// Parsed five-field cron expression. Each field is a bit set.
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpr {
    minute: u64,
    hour: u32,
    dom: u32,
    month: u16,
    dow: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(spec: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)? as u32,
            dom: parse_field(fields[2], 1, 31)? as u32,
            month: parse_field(fields[3], 1, 12)? as u16,
            dow: parse_field(fields[4], 0, 7)? as u8,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_ok = self.dom & (1 << date.day()) != 0;
        let dow_ok = self.dow & (1 << date.weekday().num_days_from_sunday()) != 0;
        // Standard cron: with both day fields restricted, either may match
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Next matching minute strictly after `after`, in the same zone.
    pub fn next_after(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let offset = *after.offset();
        let start = after + Duration::seconds(60 - i64::from(after.second()) % 60);
        let start = start.with_second(0)?.with_nanosecond(0)?;

        for day in 0..=366i64 {
            let date = start.date_naive() + Duration::days(day);
            if self.month & (1 << date.month()) == 0 || !self.day_matches(date) {
                continue;
            }
            let first_hour = if day == 0 { start.hour() } else { 0 };
            for hour in first_hour..24 {
                if self.hour & (1 << hour) == 0 {
                    continue;
                }
                let first_minute = if day == 0 && hour == start.hour() { start.minute() } else { 0 };
                for minute in first_minute..60 {
                    if self.minute & (1 << minute) == 0 {
                        continue;
                    }
                    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                    return offset.from_local_datetime(&date.and_time(time)).single();
                }
            }
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, ScheduleError> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| ScheduleError::Field(part.to_string()))?;
                if step == 0 {
                    return Err(ScheduleError::Field(part.to_string()));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| ScheduleError::Field(part.to_string()))?;
            let b: u32 = b.parse().map_err(|_| ScheduleError::Field(part.to_string()))?;
            (a, b)
        } else {
            let v: u32 = range.parse().map_err(|_| ScheduleError::Field(part.to_string()))?;
            (v, v)
        };
        if lo < min || hi > max || lo > hi {
            return Err(ScheduleError::Range { value: hi.max(lo), min, max });
        }
        let mut v = lo;
        while v <= hi {
            // dow 7 is an alias for Sunday
            let bit = if max == 7 && v == 7 { 0 } else { v };
            mask |= 1 << bit;
            v += step;
        }
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn utc_offset() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    mod day_epoch_tests {
        use super::*;

        #[test]
        fn unix_epoch_is_day_zero() {
            assert_eq!(day_epoch_at(at("1970-01-01T12:00:00Z"), utc_offset()), 0);
        }

        #[test]
        fn offset_shifts_the_day_boundary() {
            // 23:30 UTC is already the next local day at +01:00
            let now = at("2026-03-01T23:30:00Z");
            let plus_one = FixedOffset::east_opt(3600).unwrap();
            assert_eq!(day_epoch_at(now, plus_one), day_epoch_at(now, utc_offset()) + 1);
        }
    }

    mod cron_tests {
        use super::*;

        #[test]
        fn phase_boundary_spec_fires_at_six() {
            let expr = ScheduleSpec::parse("0 6,12,17,21 * * *").unwrap();
            let next = expr
                .next_after(at("2026-03-01T05:59:30Z"), utc_offset(), &PhaseSchedule::default())
                .unwrap();
            assert_eq!(next, at("2026-03-01T06:00:00Z"));
        }

        #[test]
        fn no_refire_within_the_slot() {
            let expr = ScheduleSpec::parse("0 6,12,17,21 * * *").unwrap();
            let next = expr
                .next_after(at("2026-03-01T06:00:00Z"), utc_offset(), &PhaseSchedule::default())
                .unwrap();
            assert_eq!(next, at("2026-03-01T12:00:00Z"));
        }

        #[test]
        fn step_field_expands() {
            let expr = ScheduleSpec::parse("*/15 * * * *").unwrap();
            let next = expr
                .next_after(at("2026-03-01T10:16:10Z"), utc_offset(), &PhaseSchedule::default())
                .unwrap();
            assert_eq!(next, at("2026-03-01T10:30:00Z"));
        }

        #[test]
        fn day_of_week_only() {
            // Sundays at 09:00; 2026-03-01 is a Sunday
            let expr = ScheduleSpec::parse("0 9 * * 0").unwrap();
            let next = expr
                .next_after(at("2026-03-01T10:00:00Z"), utc_offset(), &PhaseSchedule::default())
                .unwrap();
            assert_eq!(next, at("2026-03-08T09:00:00Z"));
        }

        #[test]
        fn dow_seven_is_sunday() {
            let a = CronExpr::parse("0 9 * * 0").unwrap();
            let b = CronExpr::parse("0 9 * * 7").unwrap();
            assert_eq!(a.dow, b.dow);
        }

        #[test]
        fn midnight_rollover() {
            let expr = ScheduleSpec::parse("30 0 * * *").unwrap();
            let next = expr
                .next_after(at("2026-03-01T23:50:00Z"), utc_offset(), &PhaseSchedule::default())
                .unwrap();
            assert_eq!(next, at("2026-03-02T00:30:00Z"));
        }

        #[test]
        fn bad_specs_rejected() {
            assert!(ScheduleSpec::parse("61 * * * *").is_err());
            assert!(ScheduleSpec::parse("* * * *").is_err());
            assert!(ScheduleSpec::parse("@supper").is_err());
            assert!(ScheduleSpec::parse("*/0 * * * *").is_err());
        }
    }

    mod phase_tests {
        use super::*;

        #[test]
        fn phase_at_resolves_segments() {
            let phases = PhaseSchedule::default();
            let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
            assert_eq!(phases.phase_at(t(3, 0)), DayPhase::Night);
            assert_eq!(phases.phase_at(t(6, 0)), DayPhase::Morning);
            assert_eq!(phases.phase_at(t(11, 59)), DayPhase::Morning);
            assert_eq!(phases.phase_at(t(13, 0)), DayPhase::Midday);
            assert_eq!(phases.phase_at(t(18, 30)), DayPhase::Afternoon);
            assert_eq!(phases.phase_at(t(22, 0)), DayPhase::Evening);
        }

        #[test]
        fn named_phase_spec_resolves_to_boundary() {
            let spec = ScheduleSpec::parse("@morning").unwrap();
            let next = spec
                .next_after(at("2026-03-01T06:00:00Z"), utc_offset(), &PhaseSchedule::default())
                .unwrap();
            assert_eq!(next, at("2026-03-02T06:00:00Z"));
        }
    }

    mod manual_clock_tests {
        use super::*;

        #[test]
        fn advance_moves_time() {
            let clock = ManualClock::utc(at("2026-03-01T00:00:00Z"));
            clock.advance(Duration::hours(2));
            assert_eq!(clock.now(), at("2026-03-01T02:00:00Z"));
            assert_eq!(clock.day_epoch(), day_epoch_at(at("2026-03-01T00:00:00Z"), utc_offset()));
        }
    }
}
