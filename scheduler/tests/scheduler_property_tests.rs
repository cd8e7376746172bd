// Property-based tests for the pure `ScheduleCalculator`, run from the
// scheduler crate so they exercise `common` the same way a downstream
// consumer of the workspace would, without needing a database.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use common::models::{DayOfMonth, ExecutionTime, Schedule, ScheduleInterval, Weekday};
use common::schedule::ScheduleCalculator;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn base_schedule(interval: ScheduleInterval, time: ExecutionTime, timezone: Tz) -> Schedule {
    Schedule {
        enabled: true,
        paused: false,
        interval,
        execution_time: time,
        timezone,
        start_date: None,
        end_date: None,
        next_execution: None,
    }
}

fn arb_timezone() -> impl Strategy<Value = Tz> {
    prop_oneof![
        Just(Tz::UTC),
        Just(Tz::America__New_York),
        Just(Tz::Asia__Tokyo),
        Just(Tz::Europe__London),
        Just(Tz::Australia__Sydney),
    ]
}

proptest! {
    /// For any custom-interval schedule anchored at `start`, every computed
    /// next-fire instant lands exactly on the lattice `start + k * interval`;
    /// rescheduling never drifts off it.
    #[test]
    fn custom_interval_is_always_grid_aligned(
        start_offset_secs in 0i64..100_000_000,
        interval_ms in 300_000i64..31_536_000_000i64,
        elapsed_secs in 0i64..200_000_000,
    ) {
        let start = Utc.timestamp_opt(start_offset_secs, 0).unwrap();
        let now = start + Duration::seconds(elapsed_secs);

        let mut schedule = base_schedule(
            ScheduleInterval::Custom { custom_interval_ms: interval_ms },
            ExecutionTime { hour: 0, minute: 0 },
            Tz::UTC,
        );
        schedule.start_date = Some(start);

        let next = ScheduleCalculator::next(&schedule, now).unwrap().unwrap();
        let offset_ms = (next - start).num_milliseconds();

        prop_assert_eq!(offset_ms % interval_ms, 0);
        prop_assert!(next > now || next == start);
    }

    /// A monthly schedule anchored on a day late in the month (29, 30, 31,
    /// or "last") always lands on a month that actually has that day,
    /// strictly advancing from the reference instant.
    #[test]
    fn monthly_late_day_only_lands_on_months_that_have_it(
        day in prop_oneof![Just(DayOfMonth::Day(29)), Just(DayOfMonth::Day(30)), Just(DayOfMonth::Day(31)), Just(DayOfMonth::Last)],
        year in 2024i32..2030i32,
        month in 1u32..=12u32,
    ) {
        let schedule = base_schedule(
            ScheduleInterval::Monthly { day_of_month: day },
            ExecutionTime { hour: 12, minute: 0 },
            Tz::UTC,
        );
        let now = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap();
        let next = ScheduleCalculator::next(&schedule, now).unwrap().unwrap();

        prop_assert!(next > now);
        if let DayOfMonth::Day(d) = day {
            prop_assert_eq!(next.day(), d as u32);
        }
    }

    /// A daily schedule fires when the *local* wall clock in the configured
    /// zone reads the configured time, regardless of which IANA zone is
    /// configured or what the host's own clock reads.
    #[test]
    fn daily_fires_at_configured_local_wall_clock_time(
        hour in 0u8..24u8,
        minute in 0u8..60u8,
        tz in arb_timezone(),
        now_offset_secs in 0i64..86_400i64,
    ) {
        let epoch_day = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let now = epoch_day + Duration::seconds(now_offset_secs);

        let schedule = base_schedule(
            ScheduleInterval::Daily,
            ExecutionTime { hour, minute },
            tz,
        );

        let next = ScheduleCalculator::next(&schedule, now).unwrap().unwrap();
        let local = next.with_timezone(&tz);

        prop_assert_eq!(local.hour(), hour as u32);
        prop_assert_eq!(local.minute(), minute as u32);
        prop_assert!(next > now);
    }

    /// Weekly schedules only ever land on one of the configured weekdays,
    /// strictly after `now`, within one lattice week.
    #[test]
    fn weekly_next_fire_lands_on_an_allowed_weekday_in_the_future(
        allowed_ordinals in prop::collection::btree_set(0u8..7u8, 1..4),
        hour in 0u8..24u8,
        minute in 0u8..60u8,
        now_offset_secs in 0i64..5_000_000,
    ) {
        let ordinal_to_day = |o: u8| match o {
            0 => Weekday::Sun,
            1 => Weekday::Mon,
            2 => Weekday::Tue,
            3 => Weekday::Wed,
            4 => Weekday::Thu,
            5 => Weekday::Fri,
            _ => Weekday::Sat,
        };
        let days: BTreeSet<Weekday> = allowed_ordinals.iter().map(|o| ordinal_to_day(*o)).collect();

        let schedule = base_schedule(
            ScheduleInterval::Weekly { days_of_week: days.clone() },
            ExecutionTime { hour, minute },
            Tz::UTC,
        );
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(now_offset_secs);

        let next = ScheduleCalculator::next(&schedule, now).unwrap().unwrap();
        prop_assert!(next > now);
        prop_assert!(days.contains(&Weekday::from_chrono(next.weekday())));
    }

    /// A disabled or paused schedule never produces a next-fire instant,
    /// regardless of its interval configuration.
    #[test]
    fn disabled_or_paused_schedules_never_compute_a_next_fire(
        enabled in any::<bool>(),
        paused in any::<bool>(),
        now_offset_secs in 0i64..100_000_000,
    ) {
        prop_assume!(!enabled || paused);
        let mut schedule = base_schedule(
            ScheduleInterval::Daily,
            ExecutionTime { hour: 9, minute: 0 },
            Tz::UTC,
        );
        schedule.enabled = enabled;
        schedule.paused = paused;

        let now = Utc.timestamp_opt(now_offset_secs, 0).unwrap();
        let next = ScheduleCalculator::next(&schedule, now).unwrap();
        prop_assert!(next.is_none());
    }
}

/// Pinned regression for a concrete instant: an hourly custom interval
/// anchored at 10:00 computes 13:00, not 13:35, when `now` is 12:35.
#[test]
fn custom_hourly_grid_does_not_drift_to_now_plus_interval() {
    let start: DateTime<Utc> = Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap();
    let now: DateTime<Utc> = Utc.with_ymd_and_hms(2025, 8, 1, 12, 35, 0).unwrap();

    let mut schedule = base_schedule(
        ScheduleInterval::Custom { custom_interval_ms: 3_600_000 },
        ExecutionTime { hour: 0, minute: 0 },
        Tz::UTC,
    );
    schedule.start_date = Some(start);

    let next = ScheduleCalculator::next(&schedule, now).unwrap().unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2025, 8, 1, 13, 0, 0).unwrap());
}
