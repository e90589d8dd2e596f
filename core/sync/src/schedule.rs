//! Cron-driven run scheduling.
//!
//! Turns a cron expression into future run instants and the delay until the
//! next one. The driver remembers the last instant it fired so the same
//! instant is never run twice, and a run that overruns the next instant is
//! followed by an immediate catch-up run.

use chrono::{DateTime, Local, Timelike, Utc};
use croner::Cron;
use std::fmt;
use std::time::Duration;
use tracing::warn;

use bwsync_common::settings::DEFAULT_CRON_SCHEDULE;
use bwsync_common::{Error, Result, ScheduleZone};

/// Shortest allowed gap between two scheduled runs.
pub const MIN_RUN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Number of upcoming occurrences inspected when validating the interval.
const INTERVAL_SAMPLES: usize = 10;

/// A parsed cron expression evaluated in a fixed timezone.
pub struct CronSchedule {
    expression: String,
    zone: ScheduleZone,
    cron: Cron,
}

impl CronSchedule {
    /// Parse an expression, validating it against the current time.
    ///
    /// # Errors
    /// - `InvalidSchedule` when unparsable, without future occurrences, or
    ///   firing more often than every five minutes
    pub fn parse(expression: &str, zone: ScheduleZone) -> Result<Self> {
        Self::parse_at(expression, zone, Utc::now())
    }

    /// Parse an expression, validating its upcoming occurrences after `now`.
    pub fn parse_at(expression: &str, zone: ScheduleZone, now: DateTime<Utc>) -> Result<Self> {
        Self::parse_with_interval(expression, zone, now, MIN_RUN_INTERVAL)
    }

    pub(crate) fn parse_with_interval(
        expression: &str,
        zone: ScheduleZone,
        now: DateTime<Utc>,
        min_interval: Duration,
    ) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let cron = Cron::new(expression.trim())
            .with_seconds_optional()
            .parse()
            .map_err(|e| invalid(e.to_string()))?;

        let schedule = Self {
            expression: expression.trim().to_string(),
            zone,
            cron,
        };

        let upcoming = schedule.upcoming(now, INTERVAL_SAMPLES);
        if upcoming.is_empty() {
            return Err(invalid("no upcoming occurrence".to_string()));
        }
        let too_frequent = upcoming.windows(2).any(|pair| {
            (pair[1] - pair[0])
                .to_std()
                .map(|gap| gap < min_interval)
                .unwrap_or(true)
        });
        if too_frequent {
            return Err(invalid(format!(
                "runs more often than every {} minutes",
                min_interval.as_secs() / 60
            )));
        }

        Ok(schedule)
    }

    /// Parse an expression, substituting daily at 00:00 when it is invalid.
    pub fn parse_or_default(expression: &str, zone: ScheduleZone) -> Self {
        match Self::parse(expression, zone) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!("{}. Using default schedule (daily at 00:00)", e);
                Self::default_schedule(zone)
            }
        }
    }

    /// Daily at 00:00.
    pub fn default_schedule(zone: ScheduleZone) -> Self {
        Self {
            expression: DEFAULT_CRON_SCHEDULE.to_string(),
            zone,
            cron: Cron::new(DEFAULT_CRON_SCHEDULE)
                .parse()
                .expect("default schedule is valid"),
        }
    }

    /// The expression as written.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Timezone the expression is evaluated in.
    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// First occurrence strictly after `after`.
    ///
    /// `after` is truncated to whole seconds, so an instant reached a few
    /// milliseconds late still counts as passed.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after = after.with_nanosecond(0).unwrap_or(after);
        match self.zone {
            ScheduleZone::Utc => self.cron.find_next_occurrence(&after, false).ok(),
            ScheduleZone::Local => self
                .cron
                .find_next_occurrence(&after.with_timezone(&Local), false)
                .ok()
                .map(|next| next.with_timezone(&Utc)),
        }
    }

    /// Up to `count` consecutive occurrences after `from`.
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut occurrences = Vec::with_capacity(count);
        let mut cursor = from;
        while occurrences.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    occurrences.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        occurrences
    }

    /// Delay from `now` until the next occurrence; zero when due.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_after(now).map(|next| non_negative(next - now))
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .field("zone", &self.zone)
            .finish()
    }
}

/// Delay from `now` until the next run of `expression`.
///
/// An invalid expression is replaced by the default schedule (daily at
/// 00:00); the result is never negative.
pub fn next_delay(expression: &str, zone: ScheduleZone, now: DateTime<Utc>) -> Duration {
    let schedule = CronSchedule::parse_at(expression, zone, now).unwrap_or_else(|e| {
        warn!("{}. Using default schedule (daily at 00:00)", e);
        CronSchedule::default_schedule(zone)
    });
    schedule.delay_from(now).unwrap_or(Duration::ZERO)
}

/// First occurrence of `expression` from now.
///
/// # Errors
/// - `InvalidSchedule` when the expression is rejected
pub fn sample(expression: &str, zone: ScheduleZone) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    let schedule = CronSchedule::parse_at(expression, zone, now)?;
    schedule.next_after(now).ok_or_else(|| Error::InvalidSchedule {
        expression: expression.to_string(),
        reason: "no upcoming occurrence".to_string(),
    })
}

fn non_negative(delta: chrono::TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

/// One armed run: when it is scheduled and how long to wait for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub instant: DateTime<Utc>,
    pub delay: Duration,
    /// The instant had already passed when armed (previous run overran).
    pub overdue: bool,
}

/// Produces the monotonically advancing sequence of run instants.
#[derive(Debug)]
pub struct ScheduleDriver {
    schedule: CronSchedule,
    last_fired: Option<DateTime<Utc>>,
}

impl ScheduleDriver {
    /// Create a driver that has not fired yet.
    pub fn new(schedule: CronSchedule) -> Self {
        Self {
            schedule,
            last_fired: None,
        }
    }

    /// Get the schedule.
    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    /// Arm the next run as seen at `now`.
    ///
    /// The next instant is searched after the last fired instant, so an
    /// instant that passed while the previous run was still executing is
    /// returned as overdue with zero delay.
    pub fn arm(&self, now: DateTime<Utc>) -> Option<Tick> {
        let base = self.last_fired.unwrap_or(now);
        let instant = self.schedule.next_after(base)?;
        let overdue = instant <= now;

        Some(Tick {
            instant,
            delay: non_negative(instant - now),
            overdue,
        })
    }

    /// Record that `tick` fired at `now`.
    ///
    /// An overdue tick stands in for every instant missed up to `now`, so
    /// the following instant is computed from the current time.
    pub fn mark_fired(&mut self, tick: &Tick, now: DateTime<Utc>) {
        let fired = if tick.overdue {
            now.max(tick.instant)
        } else {
            tick.instant
        };
        self.last_fired = Some(self.last_fired.map_or(fired, |last| last.max(fired)));
    }

    /// Record an unscheduled run (e.g. on startup) that began at `now`.
    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.last_fired = Some(self.last_fired.map_or(now, |last| last.max(now)));
    }

    /// Last fired instant, if any.
    pub fn last_fired(&self) -> Option<DateTime<Utc>> {
        self.last_fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn hourly() -> ScheduleDriver {
        let start = utc(2024, 1, 1, 0, 0, 0);
        ScheduleDriver::new(CronSchedule::parse_at("0 * * * *", ScheduleZone::Utc, start).unwrap())
    }

    #[test]
    fn test_midnight_schedule_one_hour_before() {
        let delay = next_delay("0 0 * * *", ScheduleZone::Utc, utc(2024, 1, 1, 23, 0, 0));
        assert_eq!(delay, Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_expression_uses_default() {
        let now = utc(2024, 1, 1, 23, 0, 0);
        assert_eq!(
            next_delay("not a cron expression", ScheduleZone::Utc, now),
            Duration::from_secs(3600)
        );

        let schedule = CronSchedule::parse_at("61 25 * * *", ScheduleZone::Utc, now);
        assert!(matches!(schedule, Err(Error::InvalidSchedule { .. })));
    }

    #[test]
    fn test_too_frequent_schedule_rejected() {
        let now = utc(2024, 1, 1, 12, 0, 0);
        assert!(CronSchedule::parse_at("* * * * *", ScheduleZone::Utc, now).is_err());
        assert!(CronSchedule::parse_at("*/2 0 * * *", ScheduleZone::Utc, now).is_err());
        assert!(CronSchedule::parse_at("*/5 * * * *", ScheduleZone::Utc, now).is_ok());
        assert_eq!(
            next_delay("* * * * *", ScheduleZone::Utc, utc(2024, 1, 1, 23, 0, 0)),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_six_field_expression() {
        let now = utc(2024, 3, 1, 5, 59, 0);
        let schedule = CronSchedule::parse_at("30 0 6 * * *", ScheduleZone::Utc, now).unwrap();
        assert_eq!(schedule.next_after(now), Some(utc(2024, 3, 1, 6, 0, 30)));
    }

    #[test]
    fn test_sunday_as_zero() {
        // 2024-01-06 is a Saturday.
        let now = utc(2024, 1, 6, 12, 0, 0);
        let schedule = CronSchedule::parse_at("0 4 * * 0", ScheduleZone::Utc, now).unwrap();
        assert_eq!(schedule.next_after(now), Some(utc(2024, 1, 7, 4, 0, 0)));
    }

    #[test]
    fn test_exact_instant_is_not_returned_again() {
        let schedule =
            CronSchedule::parse_at("0 0 * * *", ScheduleZone::Utc, utc(2024, 1, 1, 0, 0, 0))
                .unwrap();
        let midnight = utc(2024, 1, 2, 0, 0, 0);
        assert_eq!(schedule.next_after(midnight), Some(utc(2024, 1, 3, 0, 0, 0)));
        assert_eq!(
            schedule.next_after(midnight + chrono::TimeDelta::milliseconds(5)),
            Some(utc(2024, 1, 3, 0, 0, 0))
        );
    }

    #[test]
    fn test_upcoming() {
        let schedule =
            CronSchedule::parse_at("0 6 * * 1-5", ScheduleZone::Utc, utc(2024, 1, 1, 0, 0, 0))
                .unwrap();
        // Friday evening: next runs Monday and Tuesday.
        let upcoming = schedule.upcoming(utc(2024, 1, 5, 18, 0, 0), 2);
        assert_eq!(upcoming, [utc(2024, 1, 8, 6, 0, 0), utc(2024, 1, 9, 6, 0, 0)]);
    }

    #[test]
    fn test_driver_advances_without_double_fire() {
        let mut driver = hourly();

        let tick = driver.arm(utc(2024, 1, 1, 10, 30, 0)).unwrap();
        assert_eq!(tick.instant, utc(2024, 1, 1, 11, 0, 0));
        assert_eq!(tick.delay, Duration::from_secs(30 * 60));
        assert!(!tick.overdue);

        driver.mark_fired(&tick, utc(2024, 1, 1, 11, 0, 0));

        // Run finished within the hour: next is 12:00, never 11:00 again.
        let next = driver.arm(utc(2024, 1, 1, 11, 0, 0)).unwrap();
        assert_eq!(next.instant, utc(2024, 1, 1, 12, 0, 0));
        assert_eq!(next.delay, Duration::from_secs(3600));
    }

    #[test]
    fn test_driver_overrun_runs_immediately_then_recomputes() {
        let mut driver = hourly();
        let tick = driver.arm(utc(2024, 1, 1, 10, 30, 0)).unwrap();
        driver.mark_fired(&tick, tick.instant);

        // The 11:00 run took until 13:10, passing 12:00 and 13:00.
        let now = utc(2024, 1, 1, 13, 10, 0);
        let catch_up = driver.arm(now).unwrap();
        assert!(catch_up.overdue);
        assert_eq!(catch_up.delay, Duration::ZERO);
        assert_eq!(catch_up.instant, utc(2024, 1, 1, 12, 0, 0));

        driver.mark_fired(&catch_up, now);
        let following = driver.arm(utc(2024, 1, 1, 13, 15, 0)).unwrap();
        assert!(!following.overdue);
        assert_eq!(following.instant, utc(2024, 1, 1, 14, 0, 0));
    }

    #[test]
    fn test_startup_run_counts_as_fired() {
        let mut driver = hourly();
        driver.mark_started(utc(2024, 1, 1, 10, 59, 0));

        // Startup run overran 11:00.
        let tick = driver.arm(utc(2024, 1, 1, 11, 5, 0)).unwrap();
        assert!(tick.overdue);
        assert_eq!(tick.instant, utc(2024, 1, 1, 11, 0, 0));
    }

    #[test]
    fn test_local_zone_produces_future_instant() {
        let now = Utc::now();
        let schedule = CronSchedule::parse_at("0 0 * * *", ScheduleZone::Local, now).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::TimeDelta::hours(25));
        assert_eq!(next.with_timezone(&Local).hour(), 0);
    }

    #[test]
    fn test_sample() {
        let first = sample("0 0 * * *", ScheduleZone::Utc).unwrap();
        assert!(first > Utc::now() - chrono::TimeDelta::seconds(1));
        assert_eq!(first.hour(), 0);
        assert!(sample("bogus", ScheduleZone::Utc).is_err());
    }

    proptest! {
        #[test]
        fn prop_next_delay_is_consistent(
            secs in 1_600_000_000i64..1_900_000_000i64,
            idx in 0usize..4,
        ) {
            let expressions = ["0 0 * * *", "*/15 * * * *", "30 2 * * 1-5", "0 12 1 * *"];
            let expression = expressions[idx];
            let now = Utc.timestamp_opt(secs, 0).unwrap();
            let schedule = CronSchedule::parse_at(expression, ScheduleZone::Utc, now).unwrap();

            let next = schedule.next_after(now).unwrap();
            prop_assert!(next > now);
            let delay = next_delay(expression, ScheduleZone::Utc, now);
            prop_assert_eq!(delay, (next - now).to_std().unwrap());

            // Re-querying just before the instant lands on the same instant.
            let just_before = next - chrono::TimeDelta::milliseconds(1);
            prop_assert_eq!(schedule.next_after(just_before), Some(next));
            prop_assert!(schedule.delay_from(just_before).unwrap() <= Duration::from_millis(1));
        }
    }
}
