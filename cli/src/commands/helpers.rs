use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate, NaiveTime};

pub(crate) const DAY_NAMES: &[&str] = &[
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

#[allow(clippy::cast_sign_loss)]
pub(crate) fn day_name(day_of_week: i64) -> &'static str {
    DAY_NAMES[day_of_week as usize]
}

pub(crate) fn parse_days(day: &str) -> Result<Vec<i64>> {
    match day.to_lowercase().as_str() {
        "monday" | "mon" => Ok(vec![0]),
        "tuesday" | "tue" => Ok(vec![1]),
        "wednesday" | "wed" => Ok(vec![2]),
        "thursday" | "thu" => Ok(vec![3]),
        "friday" | "fri" => Ok(vec![4]),
        "saturday" | "sat" => Ok(vec![5]),
        "sunday" | "sun" => Ok(vec![6]),
        "weekdays" => Ok(vec![0, 1, 2, 3, 4]),
        "weekends" => Ok(vec![5, 6]),
        "all" => Ok(vec![0, 1, 2, 3, 4, 5, 6]),
        _ => bail!("Invalid day: {day}. Use monday-sunday, mon-sun, weekdays, weekends, or all"),
    }
}

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// Parse a wall-clock time written as `HH:MM` (24-hour).
pub(crate) fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("Invalid time '{s}'. Use HH:MM (24-hour), e.g. 07:30"))
}

pub(crate) fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
