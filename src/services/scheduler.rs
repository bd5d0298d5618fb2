use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::config::normalize_cron;
use crate::error::{AppError, AppResult};

/// A cron expression evaluated in a fixed IANA timezone.
///
/// Five-field expressions are accepted, fire at second zero and number
/// weekdays from `0 = Sunday`.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// # Errors
    ///
    /// `ConfigError` if the expression does not parse.
    pub fn parse(expression: &str, timezone: Tz) -> AppResult<Self> {
        let normalized = normalize_cron(expression);
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            AppError::ConfigError(format!("invalid cron expression `{expression}`: {e}"))
        })?;
        Ok(Self { schedule, timezone })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Wall-clock time from `now` to the next firing.
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let next = self.next_after(now)?;
        (next - now).to_std().ok()
    }
}

/// At most one holder at a time; [`SingleFlight::try_acquire`] never waits.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if another run holds the flight.
    pub fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the flight when dropped, including on panic unwind.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}
