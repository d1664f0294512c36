//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//! Supported grammar per field: `*`, integer literals, comma lists, `N-M`
//! ranges, and `*/K` steps. Anything else is rejected at parse time.
//! Day-of-week uses 0 = Sunday.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};

/// Walking bound for next-fire computation: a valid expression always
/// matches within a year plus leap slack.
const MAX_WALK_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug)]
pub(crate) struct CronExpr {
    minute: CronField,
    hour: CronField,
    dom: CronField,
    month: CronField,
    dow: CronField,
}

#[derive(Debug)]
pub(crate) enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronExpr {
    pub(crate) fn parse(expr: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "invalid cron '{expr}': expected 5 fields (minute hour dom month dow), got {}",
                parts.len()
            ));
        }
        Ok(CronExpr {
            minute: Self::parse_field(parts[0], 0, 59)?,
            hour: Self::parse_field(parts[1], 0, 23)?,
            dom: Self::parse_field(parts[2], 1, 31)?,
            month: Self::parse_field(parts[3], 1, 12)?,
            dow: Self::parse_field(parts[4], 0, 6)?,
        })
    }

    fn parse_field(field: &str, min: u32, max: u32) -> Result<CronField, String> {
        if field == "*" {
            return Ok(CronField::Any);
        }
        let mut values = Vec::new();
        for part in field.split(',') {
            if let Some((start_s, end_s)) = part.split_once('-') {
                let start: u32 = start_s
                    .parse()
                    .map_err(|_| bad_value(part))?;
                let end: u32 = end_s.parse().map_err(|_| bad_value(part))?;
                if start < min || end > max || start > end {
                    return Err(format!(
                        "invalid cron: range {start}-{end} out of bounds [{min}-{max}]"
                    ));
                }
                values.extend(start..=end);
            } else if let Some(step_s) = part.strip_prefix("*/") {
                let step: u32 = step_s.parse().map_err(|_| bad_value(part))?;
                if step == 0 {
                    return Err("invalid cron: step cannot be 0".to_string());
                }
                let mut v = min;
                while v <= max {
                    values.push(v);
                    v += step;
                }
            } else {
                let val: u32 = part.parse().map_err(|_| bad_value(part))?;
                if val < min || val > max {
                    return Err(format!(
                        "invalid cron: value {val} out of bounds [{min}-{max}]"
                    ));
                }
                values.push(val);
            }
        }
        if values.is_empty() {
            return Err(bad_value(field));
        }
        Ok(CronField::Values(values))
    }

    pub(crate) fn matches(&self, minute: u32, hour: u32, dom: u32, month: u32, dow: u32) -> bool {
        Self::field_matches(&self.minute, minute)
            && Self::field_matches(&self.hour, hour)
            && Self::field_matches(&self.dom, dom)
            && Self::field_matches(&self.month, month)
            && Self::field_matches(&self.dow, dow)
    }

    fn field_matches(field: &CronField, value: u32) -> bool {
        match field {
            CronField::Any => true,
            CronField::Values(vals) => vals.contains(&value),
        }
    }

    fn matches_instant(&self, at: DateTime<Utc>) -> bool {
        self.matches(
            at.minute(),
            at.hour(),
            at.day(),
            at.month(),
            weekday_num(at.weekday()),
        )
    }

    /// The next wall-clock minute strictly after `now_ms` whose decomposition
    /// satisfies every field. Evaluating exactly on a matching minute yields
    /// the following occurrence.
    pub(crate) fn next_after(&self, now_ms: i64) -> Option<i64> {
        let now = Utc.timestamp_millis_opt(now_ms).single()?;
        // Floor to the minute, then step forward. Starting one minute ahead
        // makes the bound strict.
        let mut candidate = now
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        for _ in 0..MAX_WALK_MINUTES {
            if self.matches_instant(candidate) {
                return Some(candidate.timestamp_millis());
            }
            candidate = candidate.checked_add_signed(Duration::minutes(1))?;
        }
        None
    }
}

fn bad_value(part: &str) -> String {
    format!("invalid cron field '{part}' (supported: *, N, N-M, */K, comma lists)")
}

/// chrono weekday → cron numbering (0 = Sunday).
pub(crate) fn weekday_num(weekday: Weekday) -> u32 {
    match weekday {
        Weekday::Sun => 0,
        Weekday::Mon => 1,
        Weekday::Tue => 2,
        Weekday::Wed => 3,
        Weekday::Thu => 4,
        Weekday::Fri => 5,
        Weekday::Sat => 6,
    }
}
