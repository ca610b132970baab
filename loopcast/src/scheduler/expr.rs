//! Auto-stop expressions.
//!
//! Two forms are accepted, case-insensitive, surrounding and inner
//! whitespace ignored:
//!
//! - a duration, `[<n>h][<n>m]` with at least one component (`2h`, `45m`,
//!   `1h30m`);
//! - a wall-clock time, `HH:MM`, meaning the next occurrence of that time in
//!   the configured timezone (today if still ahead, otherwise tomorrow).

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeZone};
use chrono_tz::Tz;
use regex::Regex;

use crate::{Error, Result};

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([0-9]+)h)?(?:([0-9]+)m)?$").expect("duration pattern is valid")
});

static CLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{1,2}):([0-9]{2})$").expect("clock pattern is valid"));

/// A parsed, not yet resolved, stop expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopExpression {
    After(Duration),
    At { hour: u32, minute: u32 },
}

/// When a stop should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTarget {
    pub delay: Duration,
    pub fire_at: DateTime<Tz>,
}

fn component(raw: Option<regex::Match<'_>>, unit: &str, input: &str) -> Result<u64> {
    match raw {
        None => Ok(0),
        Some(m) => m
            .as_str()
            .parse::<u64>()
            .map_err(|_| Error::schedule(format!("{unit} value in {input:?} is too large"))),
    }
}

impl StopExpression {
    pub fn parse(input: &str) -> Result<Self> {
        let compact: String = input
            .split_whitespace()
            .collect::<String>()
            .to_lowercase();

        if compact.is_empty() {
            return Err(Error::schedule("empty expression"));
        }

        if let Some(caps) = CLOCK_RE.captures(&compact) {
            let hour: u32 = caps[1]
                .parse()
                .map_err(|_| Error::schedule(format!("bad hour in {input:?}")))?;
            let minute: u32 = caps[2]
                .parse()
                .map_err(|_| Error::schedule(format!("bad minute in {input:?}")))?;
            if hour > 23 {
                return Err(Error::schedule(format!("hour {hour} is out of range (0-23)")));
            }
            if minute > 59 {
                return Err(Error::schedule(format!("minute {minute} is out of range (0-59)")));
            }
            return Ok(Self::At { hour, minute });
        }

        if let Some(caps) = DURATION_RE.captures(&compact) {
            if caps.get(1).is_none() && caps.get(2).is_none() {
                return Err(Error::schedule(format!("{input:?} has no duration")));
            }
            let hours = component(caps.get(1), "hour", input)?;
            let minutes = component(caps.get(2), "minute", input)?;
            let secs = hours
                .checked_mul(3600)
                .and_then(|h| minutes.checked_mul(60).and_then(|m| h.checked_add(m)))
                .ok_or_else(|| Error::schedule(format!("{input:?} is too far away")))?;
            if secs == 0 {
                return Err(Error::schedule("duration must be greater than zero"));
            }
            return Ok(Self::After(Duration::from_secs(secs)));
        }

        Err(Error::schedule(format!(
            "{input:?} is neither a duration like 1h30m / 45m nor a time like 21:30"
        )))
    }

    /// Resolve against the current time.
    pub fn resolve(self, now: DateTime<Tz>) -> Result<StopTarget> {
        match self {
            Self::After(delay) => {
                let offset = chrono::Duration::from_std(delay)
                    .map_err(|_| Error::schedule("duration is too large"))?;
                let fire_at = now
                    .checked_add_signed(offset)
                    .ok_or_else(|| Error::schedule("duration is too large"))?;
                Ok(StopTarget { delay, fire_at })
            }
            Self::At { hour, minute } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)
                    .ok_or_else(|| Error::schedule(format!("{hour:02}:{minute:02} is not a time")))?;
                let tz = now.timezone();
                let today = now.date_naive();

                // Today, tomorrow, or the day after if tomorrow's time is
                // skipped by a DST transition.
                let fire_at = (0..3u64)
                    .filter_map(|days| today.checked_add_days(Days::new(days)))
                    .filter_map(|date| tz.from_local_datetime(&date.and_time(time)).earliest())
                    .find(|candidate| *candidate > now)
                    .ok_or_else(|| {
                        Error::schedule(format!("no upcoming {hour:02}:{minute:02}"))
                    })?;

                let delay = (fire_at - now)
                    .to_std()
                    .map_err(|_| Error::schedule("resolved time is in the past"))?;
                Ok(StopTarget { delay, fire_at })
            }
        }
    }
}

/// Parse `input` and resolve it against `now`.
pub fn parse_stop_expression(input: &str, now: DateTime<Tz>) -> Result<StopTarget> {
    StopExpression::parse(input)?.resolve(now)
}
