//! Weekly-schedule and interval math for jobs. All times are UTC; a weekly
//! slot is `(day_of_week, time_of_day)` with Monday = 1.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Days, Duration, Utc};

use crate::error::{EngineError, EngineResult};
use crate::models::ScheduleEntry;

/// A schedule is valid when it is non-empty, every day is within 1..=7 and
/// no slot appears twice.
pub fn validate_schedule(entries: &[ScheduleEntry]) -> EngineResult<()> {
    if entries.is_empty() {
        return Err(EngineError::InvalidSchedule(
            "a weekly schedule requires at least one entry".to_owned(),
        ));
    }
    let mut seen = HashSet::new();
    for entry in entries {
        if !(1..=7).contains(&entry.day_of_week) {
            return Err(EngineError::InvalidSchedule(format!(
                "day_of_week must be 1 (Monday) through 7 (Sunday), got {}",
                entry.day_of_week
            )));
        }
        if !seen.insert((entry.day_of_week, entry.time_of_day)) {
            return Err(EngineError::InvalidSchedule(format!(
                "duplicate schedule entry for day {} at {}",
                entry.day_of_week, entry.time_of_day
            )));
        }
    }
    Ok(())
}

pub fn validate_interval(interval_seconds: i64) -> EngineResult<()> {
    if interval_seconds <= 0 {
        return Err(EngineError::InvalidSchedule(format!(
            "job interval must be positive, got {interval_seconds} seconds"
        )));
    }
    Ok(())
}

/// Earliest weekly slot strictly after `now`, in UTC.
pub fn next_run_job_schedule(
    entries: &[ScheduleEntry],
    now: DateTime<Utc>,
) -> EngineResult<DateTime<Utc>> {
    validate_schedule(entries)?;
    let next = entries
        .iter()
        .map(|entry| next_occurrence(entry, now))
        .min()
        .expect("validated schedule is non-empty");
    Ok(next)
}

/// Next run of an interval job, advanced from the previous `next_run` rather
/// than from the current time so the cadence never drifts.
pub fn advance_interval(next_run: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    next_run + Duration::seconds(interval_seconds)
}

fn next_occurrence(entry: &ScheduleEntry, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let current_day = today.weekday().number_from_monday() as i16;
    let days_ahead = (entry.day_of_week - current_day).rem_euclid(7) as u64;
    let date = today + Days::new(days_ahead);
    let candidate = date.and_time(entry.time_of_day).and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(7)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    use super::*;

    fn entry(day_of_week: i16, time: &str) -> ScheduleEntry {
        ScheduleEntry {
            day_of_week,
            time_of_day: time.parse::<NaiveTime>().unwrap(),
        }
    }

    fn utc(date: &str, time: &str) -> DateTime<Utc> {
        let date = date.parse::<NaiveDate>().unwrap();
        let time = time.parse::<NaiveTime>().unwrap();
        Utc.from_utc_datetime(&date.and_time(time))
    }

    #[test]
    fn wednesday_rolls_to_next_monday() {
        // 2023-06-14 is a Wednesday.
        let now = utc("2023-06-14", "12:00:00");
        let schedule = vec![entry(1, "00:00:00"), entry(2, "00:00:00")];
        let next = next_run_job_schedule(&schedule, now).unwrap();
        assert_eq!(next, utc("2023-06-19", "00:00:00"));
    }

    #[test]
    fn same_day_slot_in_the_future_is_used() {
        let now = utc("2023-06-14", "08:00:00");
        let schedule = vec![entry(3, "09:30:00")];
        let next = next_run_job_schedule(&schedule, now).unwrap();
        assert_eq!(next, utc("2023-06-14", "09:30:00"));
    }

    #[test]
    fn same_day_slot_already_passed_waits_a_week() {
        let now = utc("2023-06-14", "10:00:00");
        let schedule = vec![entry(3, "09:30:00")];
        let next = next_run_job_schedule(&schedule, now).unwrap();
        assert_eq!(next, utc("2023-06-21", "09:30:00"));
    }

    #[test]
    fn slot_exactly_at_now_is_not_returned() {
        let now = utc("2023-06-14", "09:30:00");
        let schedule = vec![entry(3, "09:30:00")];
        let next = next_run_job_schedule(&schedule, now).unwrap();
        assert_eq!(next, utc("2023-06-21", "09:30:00"));
    }

    #[test]
    fn earliest_of_many_slots_wins() {
        let now = utc("2023-06-14", "12:00:00");
        let schedule = vec![entry(5, "00:00:00"), entry(4, "06:00:00"), entry(1, "00:00:00")];
        let next = next_run_job_schedule(&schedule, now).unwrap();
        assert_eq!(next, utc("2023-06-15", "06:00:00"));
    }

    #[test]
    fn schedule_validation_rejects_bad_input() {
        assert!(validate_schedule(&[]).is_err());
        assert!(validate_schedule(&[entry(0, "00:00:00")]).is_err());
        assert!(validate_schedule(&[entry(8, "00:00:00")]).is_err());
        assert!(validate_schedule(&[entry(1, "00:00:00"), entry(1, "00:00:00")]).is_err());
        assert!(validate_schedule(&[entry(1, "00:00:00"), entry(1, "00:00:01")]).is_ok());
    }

    #[test]
    fn interval_validation_and_advancement() {
        assert!(validate_interval(0).is_err());
        assert!(validate_interval(-5).is_err());
        assert!(validate_interval(60).is_ok());
        let base = utc("2023-06-14", "12:00:00");
        assert_eq!(advance_interval(base, 3600), utc("2023-06-14", "13:00:00"));
    }
}
