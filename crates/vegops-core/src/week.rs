//! Week-boundary math. The work week runs Sunday through Saturday.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Saturday closing the week containing `date`. A Saturday maps to itself.
pub fn week_ending_for(date: NaiveDate) -> NaiveDate {
    let days_until_saturday = (Weekday::Sat.num_days_from_sunday() + 7
        - date.weekday().num_days_from_sunday())
        % 7;
    date + Duration::days(i64::from(days_until_saturday))
}

/// Sunday opening the week containing `date`. A Sunday maps to itself.
pub fn week_starting_for(date: NaiveDate) -> NaiveDate {
    let days_since_sunday = date.weekday().num_days_from_sunday();
    date - Duration::days(i64::from(days_since_sunday))
}
