//! Thin wrapper over the `cron` crate: the only place that parses a job's
//! cron expression string and computes its next occurrence.

use crate::error::CronError;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

pub struct ParsedSchedule {
    schedule: Schedule,
}

impl ParsedSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let schedule = Schedule::from_str(expr).map_err(|e| CronError::Parse {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { schedule })
    }

    /// The next occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        self.schedule
            .after(&after)
            .next()
            .ok_or_else(|| CronError::NoUpcoming(self.schedule.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_malformed_expression() {
        assert!(ParsedSchedule::parse("not a cron expr").is_err());
    }

    #[test]
    fn every_second_fires_one_second_later() {
        let parsed = ParsedSchedule::parse("* * * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = parsed.next_after(now).unwrap();
        assert!(next > now);
        assert!((next - now).num_seconds() <= 1);
    }
}
