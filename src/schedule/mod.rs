use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime};

use crate::tasks::{normalize_time, RepeatRule, TriggerConfig};

pub mod cron;

const DAILY_SCAN_DAYS: i64 = 7;
const WEEKLY_SCAN_DAYS: i64 = 14;

pub fn upcoming_runs(rule: &RepeatRule, count: usize, now: NaiveDateTime) -> Vec<NaiveDateTime> {
    if count == 0 {
        return Vec::new();
    }
    match rule {
        RepeatRule::Daily { times } => scan_times(times, None, DAILY_SCAN_DAYS, count, now),
        RepeatRule::Weekly { days, times } => {
            scan_times(times, Some(days), WEEKLY_SCAN_DAYS, count, now)
        }
        RepeatRule::Interval {
            start_hour,
            end_hour,
            step_hours,
            minute,
        } => {
            let step = (*step_hours).max(1) as u32;
            let mut runs = Vec::new();
            for day in 0..DAILY_SCAN_DAYS {
                let date = now.date() + Duration::days(day);
                let mut hour = *start_hour as u32;
                while hour <= *end_hour as u32 {
                    if let Some(time) = NaiveTime::from_hms_opt(hour, *minute as u32, 0) {
                        let candidate = date.and_time(time);
                        if candidate > now {
                            runs.push(candidate);
                            if runs.len() == count {
                                return runs;
                            }
                        }
                    }
                    hour += step;
                }
            }
            runs
        }
    }
}

fn scan_times(
    times: &[String],
    days: Option<&[u8]>,
    scan_days: i64,
    count: usize,
    now: NaiveDateTime,
) -> Vec<NaiveDateTime> {
    let mut parsed: Vec<NaiveTime> = times
        .iter()
        .filter_map(|raw| NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok())
        .collect();
    parsed.sort();
    parsed.dedup();
    if parsed.is_empty() {
        return Vec::new();
    }

    let mut runs = Vec::new();
    for day in 0..scan_days {
        let date = now.date() + Duration::days(day);
        if let Some(days) = days {
            let weekday = date.weekday().num_days_from_sunday() as u8;
            if !days.contains(&weekday) {
                continue;
            }
        }
        for time in &parsed {
            let candidate = date.and_time(*time);
            if candidate > now {
                runs.push(candidate);
                if runs.len() == count {
                    return runs;
                }
            }
        }
    }
    runs
}

// Preview over a draft trigger; pure, mutates nothing. Quota-reset drafts
// preview their fallback times.
pub fn preview_runs(trigger: &TriggerConfig, count: usize, now: NaiveDateTime) -> Vec<NaiveDateTime> {
    match trigger {
        TriggerConfig::Scheduled { rule } => upcoming_runs(rule, count, now),
        TriggerConfig::Crontab { expression } => cron::next_runs(expression, count, now),
        TriggerConfig::QuotaReset { fallback_times, .. } => {
            let times: Vec<String> = fallback_times
                .iter()
                .filter_map(|raw| normalize_time(raw))
                .collect();
            scan_times(&times, None, DAILY_SCAN_DAYS, count, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn monday_at(hour: u32, minute: u32) -> NaiveDateTime {
        // 2026-03-02 is a Monday
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn daily_picks_later_time_today_then_wraps() {
        let rule = RepeatRule::Daily {
            times: vec!["08:00".to_string(), "20:00".to_string()],
        };
        let now = monday_at(9, 0);
        let runs = upcoming_runs(&rule, 2, now);
        assert_eq!(runs[0], monday_at(20, 0));
        assert_eq!(runs[1], monday_at(8, 0) + Duration::days(1));
    }

    #[test]
    fn daily_scan_covers_seven_days() {
        let rule = RepeatRule::Daily {
            times: vec!["12:00".to_string()],
        };
        let runs = upcoming_runs(&rule, 10, monday_at(13, 0));
        assert_eq!(runs.len(), 6);
        assert!(runs.windows(2).all(|pair| pair[1] - pair[0] == Duration::days(1)));
    }

    #[test]
    fn weekly_respects_day_set() {
        // Wednesday (3) and Saturday (6), counting from Sunday = 0.
        let rule = RepeatRule::Weekly {
            days: vec![3, 6],
            times: vec!["10:00".to_string()],
        };
        let now = monday_at(9, 0);
        let runs = upcoming_runs(&rule, 4, now);
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0], monday_at(10, 0) + Duration::days(2)); // Wednesday
        assert_eq!(runs[1], monday_at(10, 0) + Duration::days(5)); // Saturday
        assert_eq!(runs[2], monday_at(10, 0) + Duration::days(9)); // next Wednesday
        assert!(runs
            .iter()
            .all(|run| matches!(run.weekday().num_days_from_sunday(), 3 | 6)));
    }

    #[test]
    fn interval_steps_between_bounds() {
        let rule = RepeatRule::Interval {
            start_hour: 9,
            end_hour: 18,
            step_hours: 4,
            minute: 30,
        };
        let now = monday_at(10, 0);
        let runs = upcoming_runs(&rule, 3, now);
        assert_eq!(runs[0], monday_at(13, 30));
        assert_eq!(runs[1], monday_at(17, 30));
        assert_eq!(runs[2], monday_at(9, 30) + Duration::days(1));
    }

    #[test]
    fn preview_dispatches_per_trigger_mode() {
        let now = monday_at(9, 0);

        let scheduled = TriggerConfig::Scheduled {
            rule: RepeatRule::Daily {
                times: vec!["10:00".to_string()],
            },
        };
        assert_eq!(preview_runs(&scheduled, 5, now).len(), 5);

        let crontab = TriggerConfig::Crontab {
            expression: "0 10".to_string(),
        };
        assert!(preview_runs(&crontab, 5, now).is_empty());

        let reset = TriggerConfig::QuotaReset {
            window: None,
            fallback_times: vec!["23:30".to_string()],
        };
        let runs = preview_runs(&reset, 2, now);
        assert_eq!(runs[0], monday_at(23, 30));
    }

    #[test]
    fn empty_or_invalid_times_produce_no_runs() {
        let rule = RepeatRule::Daily { times: Vec::new() };
        assert!(upcoming_runs(&rule, 5, monday_at(9, 0)).is_empty());

        let rule = RepeatRule::Daily {
            times: vec!["noon".to_string()],
        };
        assert!(upcoming_runs(&rule, 5, monday_at(9, 0)).is_empty());
    }
}
