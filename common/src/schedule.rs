// Pure calendar math: given a schedule and a reference instant, compute the
// next firing instant (or decide there isn't one).

use crate::errors::ScheduleError;
use crate::models::{DayOfMonth, ExecutionTime, Schedule, ScheduleInterval, Weekday};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::Tz;

pub const MIN_INTERVAL_MS: i64 = 5 * 60 * 1000;
pub const MAX_INTERVAL_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Stateless entry point for next-fire computation and schedule validation.
pub struct ScheduleCalculator;

impl ScheduleCalculator {
    /// Returns `Ok(None)` when the schedule is disabled or paused. Returns
    /// `Err` when the next candidate would fall after `end_date`, or the
    /// schedule is malformed.
    pub fn next(
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        if !schedule.enabled || schedule.paused {
            return Ok(None);
        }
        Self::validate(schedule)?;

        let candidate = match &schedule.interval {
            ScheduleInterval::Daily => {
                Self::next_daily(now, schedule.execution_time, schedule.timezone)
            }
            ScheduleInterval::Weekly { days_of_week } => {
                Self::next_weekly(now, schedule.execution_time, days_of_week, schedule.timezone)?
            }
            ScheduleInterval::Monthly { day_of_month } => {
                Self::next_monthly(now, schedule.execution_time, *day_of_month, schedule.timezone)
            }
            ScheduleInterval::Custom { custom_interval_ms } => {
                let start = schedule.start_date.unwrap_or(now);
                Self::next_custom(now, start, *custom_interval_ms)
            }
        };

        if let Some(end) = schedule.end_date {
            if candidate > end {
                return Err(ScheduleError::ScheduleExhausted(end));
            }
        }

        Ok(Some(candidate))
    }

    fn next_daily(now: DateTime<Utc>, time: ExecutionTime, tz: Tz) -> DateTime<Utc> {
        let local_now = now.with_timezone(&tz);
        let mut candidate = at_time(local_now, time);
        if candidate <= local_now {
            candidate += Duration::days(1);
        }
        candidate.with_timezone(&Utc)
    }

    fn next_weekly(
        now: DateTime<Utc>,
        time: ExecutionTime,
        days_of_week: &std::collections::BTreeSet<Weekday>,
        tz: Tz,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        if days_of_week.is_empty() {
            return Err(ScheduleError::EmptyWeeklyDays);
        }
        let local_now = now.with_timezone(&tz);
        for offset in 0..8 {
            let day = local_now + Duration::days(offset);
            let candidate = at_time(day, time);
            if candidate > local_now && days_of_week.contains(&Weekday::from_chrono(candidate.weekday())) {
                return Ok(candidate.with_timezone(&Utc));
            }
        }
        Err(ScheduleError::EmptyWeeklyDays)
    }

    fn next_monthly(
        now: DateTime<Utc>,
        time: ExecutionTime,
        day_of_month: DayOfMonth,
        tz: Tz,
    ) -> DateTime<Utc> {
        let local_now = now.with_timezone(&tz);
        let mut year = local_now.year();
        let mut month = local_now.month();

        loop {
            let candidate = match day_of_month {
                DayOfMonth::Last => {
                    let last_day = days_in_month(year, month);
                    build_local(&tz, year, month, last_day, time)
                }
                DayOfMonth::Day(d) => {
                    let days = days_in_month(year, month);
                    if d as u32 > days {
                        advance_month(&mut year, &mut month);
                        continue;
                    }
                    build_local(&tz, year, month, d as u32, time)
                }
            };

            if candidate > local_now {
                return candidate.with_timezone(&Utc);
            }
            advance_month(&mut year, &mut month);
        }
    }

    /// Grid-aligned: the next instant is `start + (k+1) * interval`, so
    /// rescheduling never drifts off the lattice anchored at `start`.
    fn next_custom(now: DateTime<Utc>, start: DateTime<Utc>, interval_ms: i64) -> DateTime<Utc> {
        if now < start {
            return start;
        }
        let elapsed_ms = (now - start).num_milliseconds();
        let intervals_passed = elapsed_ms / interval_ms;
        start + Duration::milliseconds((intervals_passed + 1) * interval_ms)
    }

    pub fn validate(schedule: &Schedule) -> Result<(), ScheduleError> {
        if schedule.execution_time.hour > 23 {
            return Err(ScheduleError::InvalidDayOfMonth(format!(
                "hour must be 0-23, got {}",
                schedule.execution_time.hour
            )));
        }
        if schedule.execution_time.minute > 59 {
            return Err(ScheduleError::InvalidDayOfMonth(format!(
                "minute must be 0-59, got {}",
                schedule.execution_time.minute
            )));
        }
        match &schedule.interval {
            ScheduleInterval::Daily => {}
            ScheduleInterval::Weekly { days_of_week } => {
                if days_of_week.is_empty() {
                    return Err(ScheduleError::EmptyWeeklyDays);
                }
            }
            ScheduleInterval::Monthly { day_of_month } => {
                if let DayOfMonth::Day(d) = day_of_month {
                    if *d < 1 || *d > 31 {
                        return Err(ScheduleError::InvalidDayOfMonth(d.to_string()));
                    }
                }
            }
            ScheduleInterval::Custom { custom_interval_ms } => {
                if *custom_interval_ms < MIN_INTERVAL_MS {
                    return Err(ScheduleError::CustomIntervalTooShort {
                        interval_ms: *custom_interval_ms,
                        min_ms: MIN_INTERVAL_MS,
                    });
                }
                if *custom_interval_ms > MAX_INTERVAL_MS {
                    return Err(ScheduleError::CustomIntervalTooLong {
                        interval_ms: *custom_interval_ms,
                        max_ms: MAX_INTERVAL_MS,
                    });
                }
            }
        }
        if let (Some(start), Some(end)) = (schedule.start_date, schedule.end_date) {
            if start >= end {
                return Err(ScheduleError::EndBeforeStart {
                    start_date: start,
                    end_date: end,
                });
            }
        }
        Ok(())
    }
}

/// Sets `day`'s wall-clock time to `time` in its own zone. Rebuilds from the
/// calendar date rather than `with_hour`/`with_minute` so a configured time
/// that lands in a DST spring-forward gap falls back to the earliest valid
/// local instant instead of panicking, matching `build_local`'s handling of
/// the same gap for monthly schedules.
fn at_time(day: DateTime<Tz>, time: ExecutionTime) -> DateTime<Tz> {
    let tz = day.timezone();
    tz.with_ymd_and_hms(day.year(), day.month(), day.day(), time.hour as u32, time.minute as u32, 0)
        .single()
        .unwrap_or_else(|| {
            tz.with_ymd_and_hms(day.year(), day.month(), day.day(), time.hour as u32, time.minute as u32, 0)
                .earliest()
                .expect("day/month already validated to exist in calendar")
        })
}

fn build_local(tz: &Tz, year: i32, month: u32, day: u32, time: ExecutionTime) -> DateTime<Tz> {
    tz.with_ymd_and_hms(year, month, day, time.hour as u32, time.minute as u32, 0)
        .single()
        .unwrap_or_else(|| {
            // DST gap/fold fallback: earliest valid local representation.
            tz.with_ymd_and_hms(year, month, day, time.hour as u32, time.minute as u32, 0)
                .earliest()
                .expect("day/month already validated to exist in calendar")
        })
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap();
    let first_of_this = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    (first_of_next - first_of_this).num_days() as u32
}

fn advance_month(year: &mut i32, month: &mut u32) {
    if *month == 12 {
        *month = 1;
        *year += 1;
    } else {
        *month += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionTime;
    use std::collections::BTreeSet;

    fn schedule(interval: ScheduleInterval, time: ExecutionTime) -> Schedule {
        Schedule {
            enabled: true,
            paused: false,
            interval,
            execution_time: time,
            timezone: Tz::UTC,
            start_date: None,
            end_date: None,
            next_execution: None,
        }
    }

    #[test]
    fn daily_schedule_advances_past_time_already_fired_today() {
        let sched = schedule(ScheduleInterval::Daily, ExecutionTime { hour: 14, minute: 30 });
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap();
        let next = ScheduleCalculator::next(&sched, now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 8, 1, 14, 30, 0).unwrap());

        let now2 = Utc.with_ymd_and_hms(2025, 8, 1, 16, 0, 0).unwrap();
        let next2 = ScheduleCalculator::next(&sched, now2).unwrap().unwrap();
        assert_eq!(next2, Utc.with_ymd_and_hms(2025, 8, 2, 14, 30, 0).unwrap());
    }

    #[test]
    fn weekly_schedule_lands_on_target_weekday_then_following_week() {
        let mut days = BTreeSet::new();
        days.insert(Weekday::Fri);
        let sched = schedule(
            ScheduleInterval::Weekly { days_of_week: days },
            ExecutionTime { hour: 14, minute: 30 },
        );
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap();
        let next = ScheduleCalculator::next(&sched, now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 3, 14, 30, 0).unwrap());

        let now2 = Utc.with_ymd_and_hms(2025, 1, 3, 16, 0, 0).unwrap();
        let next2 = ScheduleCalculator::next(&sched, now2).unwrap().unwrap();
        assert_eq!(next2, Utc.with_ymd_and_hms(2025, 1, 10, 14, 30, 0).unwrap());
    }

    #[test]
    fn monthly_last_day_of_month_skips_february() {
        let sched = schedule(
            ScheduleInterval::Monthly { day_of_month: DayOfMonth::Day(31) },
            ExecutionTime { hour: 14, minute: 30 },
        );
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 16, 0, 0).unwrap();
        let next = ScheduleCalculator::next(&sched, now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 31, 14, 30, 0).unwrap());
    }

    #[test]
    fn custom_interval_is_grid_aligned_not_drifted() {
        let start = Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap();
        let mut sched = schedule(
            ScheduleInterval::Custom { custom_interval_ms: 3_600_000 },
            ExecutionTime { hour: 0, minute: 0 },
        );
        sched.start_date = Some(start);
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 12, 35, 0).unwrap();
        let next = ScheduleCalculator::next(&sched, now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 8, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn monthly_day_31_sequence_skips_february_in_non_leap_year() {
        let sched = schedule(
            ScheduleInterval::Monthly { day_of_month: DayOfMonth::Day(31) },
            ExecutionTime { hour: 0, minute: 0 },
        );
        let jan31 = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let mar31 = ScheduleCalculator::next(&sched, jan31).unwrap().unwrap();
        assert_eq!(mar31, Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap());
        let may31 = ScheduleCalculator::next(&sched, mar31).unwrap().unwrap();
        assert_eq!(may31, Utc.with_ymd_and_hms(2025, 5, 31, 0, 0, 0).unwrap());
    }

    #[test]
    fn disabled_or_paused_yields_no_next_fire() {
        let mut sched = schedule(ScheduleInterval::Daily, ExecutionTime { hour: 9, minute: 0 });
        sched.enabled = false;
        assert!(ScheduleCalculator::next(&sched, Utc::now()).unwrap().is_none());
        sched.enabled = true;
        sched.paused = true;
        assert!(ScheduleCalculator::next(&sched, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn empty_weekly_days_is_validation_error() {
        let sched = schedule(
            ScheduleInterval::Weekly { days_of_week: BTreeSet::new() },
            ExecutionTime { hour: 9, minute: 0 },
        );
        assert!(matches!(
            ScheduleCalculator::next(&sched, Utc::now()),
            Err(ScheduleError::EmptyWeeklyDays)
        ));
    }

    #[test]
    fn custom_interval_below_minimum_rejected() {
        let sched = schedule(
            ScheduleInterval::Custom { custom_interval_ms: 1000 },
            ExecutionTime { hour: 0, minute: 0 },
        );
        assert!(matches!(
            ScheduleCalculator::next(&sched, Utc::now()),
            Err(ScheduleError::CustomIntervalTooShort { .. })
        ));
    }
}
