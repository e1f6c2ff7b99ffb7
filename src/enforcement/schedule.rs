//! Rule schedule evaluation
//!
//! A rule window is a set of weekdays plus a civil start and end time. Times are
//! wall-clock minutes in the configured timezone, never UTC instants.

use crate::enforcement::EnforcementError;
use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Day of the week, serialized as its three-letter lowercase tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl Weekday {
    pub const ALL: [Self; 7] = [
        Self::Sun,
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
    ];

    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Sun => "sun",
            Self::Mon => "mon",
            Self::Tue => "tue",
            Self::Wed => "wed",
            Self::Thu => "thu",
            Self::Fri => "fri",
            Self::Sat => "sat",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Weekday {
    type Err = EnforcementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|day| day.tag() == tag)
            .ok_or_else(|| EnforcementError::Other(format!("Unknown weekday: {s}")))
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Sun => Self::Sun,
            chrono::Weekday::Mon => Self::Mon,
            chrono::Weekday::Tue => Self::Tue,
            chrono::Weekday::Wed => Self::Wed,
            chrono::Weekday::Thu => Self::Thu,
            chrono::Weekday::Fri => Self::Fri,
            chrono::Weekday::Sat => Self::Sat,
        }
    }
}

/// Set of weekdays a rule applies on, or the `all` sentinel
///
/// Serialized as a comma list (`"mon,wed,fri"`) or `"all"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DaySet {
    All,
    Days(u8),
}

impl Default for DaySet {
    fn default() -> Self {
        Self::All
    }
}

impl DaySet {
    #[must_use]
    pub fn of(days: &[Weekday]) -> Self {
        Self::Days(days.iter().fold(0, |mask, day| mask | day.bit()))
    }

    #[must_use]
    pub const fn contains(self, day: Weekday) -> bool {
        match self {
            Self::All => true,
            Self::Days(mask) => mask & day.bit() != 0,
        }
    }
}

impl FromStr for DaySet {
    type Err = EnforcementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = 0u8;
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token.eq_ignore_ascii_case("all") {
                return Ok(Self::All);
            }
            mask |= token.parse::<Weekday>()?.bit();
        }
        Ok(Self::Days(mask))
    }
}

impl TryFrom<String> for DaySet {
    type Error = EnforcementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DaySet> for String {
    fn from(days: DaySet) -> Self {
        days.to_string()
    }
}

impl fmt::Display for DaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Days(_) => {
                let tags: Vec<&str> = Weekday::ALL
                    .into_iter()
                    .filter(|day| self.contains(*day))
                    .map(Weekday::tag)
                    .collect();
                f.write_str(&tags.join(","))
            }
        }
    }
}

/// Civil minute of the day, serialized as `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    /// Build from hour and minute
    ///
    /// # Errors
    /// Returns an error if the hour or minute is out of range
    pub fn from_hm(hour: u32, minute: u32) -> Result<Self, EnforcementError> {
        if hour >= 24 || minute >= 60 {
            return Err(EnforcementError::Other(format!(
                "Invalid time of day: {hour:02}:{minute:02}"
            )));
        }
        // Both bounds checked above, fits comfortably in u16.
        Ok(Self((hour * 60 + minute) as u16))
    }

    #[must_use]
    pub const fn minutes(self) -> u16 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = EnforcementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EnforcementError::Other(format!("Invalid time of day: {s}"));
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse::<u32>().map_err(|_| invalid())?;
        let minute = minute.parse::<u32>().map_err(|_| invalid())?;
        Self::from_hm(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = EnforcementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(time: TimeOfDay) -> Self {
        time.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Reference time already resolved into the configured timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilTime {
    pub weekday: Weekday,
    pub time: TimeOfDay,
}

impl CivilTime {
    #[must_use]
    pub const fn new(weekday: Weekday, time: TimeOfDay) -> Self {
        Self { weekday, time }
    }

    /// Resolve a UTC instant into weekday and minute-of-day in `tz`
    #[must_use]
    pub fn resolve(now: DateTime<Utc>, tz: Tz) -> Self {
        let local = now.with_timezone(&tz);
        // hour() < 24 and minute() < 60 always hold for a resolved local time.
        let time = TimeOfDay((local.hour() * 60 + local.minute()) as u16);
        Self {
            weekday: local.weekday().into(),
            time,
        }
    }
}

impl fmt::Display for CivilTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.weekday, self.time)
    }
}

/// Recurring weekday and time-of-day window of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub days: DaySet,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            days: DaySet::All,
            start: TimeOfDay(0),
            end: TimeOfDay(MINUTES_PER_DAY - 1),
        }
    }
}

impl Schedule {
    #[must_use]
    pub const fn new(days: DaySet, start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { days, start, end }
    }

    /// Check whether the window is open at `at`
    ///
    /// A window with `start > end` crosses midnight. `start == end` takes the
    /// same-day branch and is open for that single minute only.
    #[must_use]
    pub fn is_active(&self, at: &CivilTime) -> bool {
        if !self.days.contains(at.weekday) {
            return false;
        }

        let current = at.time;
        if self.start <= self.end {
            self.start <= current && current <= self.end
        } else {
            current >= self.start || current <= self.end
        }
    }

    /// Minutes from `at` until the window's end time
    ///
    /// The end minute is inclusive, so an open window reports 0 during it.
    #[must_use]
    pub fn minutes_remaining(&self, at: &CivilTime) -> u16 {
        let current = at.time.minutes();
        let mut end = self.end.minutes();
        if end == current && self.is_active(at) {
            return 0;
        }
        if end <= current {
            end += MINUTES_PER_DAY;
        }
        end - current
    }
}

/// Whether `rule`'s window is open at `at`
///
/// Only the schedule is consulted; the rule's active flag is the caller's concern.
#[must_use]
pub fn is_active(rule: &crate::data::Rule, at: &CivilTime) -> bool {
    rule.schedule.is_active(at)
}

/// Parse an IANA timezone name
///
/// # Errors
/// Returns a configuration error for unknown names
pub fn parse_timezone(name: &str) -> Result<Tz, EnforcementError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EnforcementError::Config(format!("Unknown timezone: {name}")))
}
