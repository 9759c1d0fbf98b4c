use std::collections::BTreeSet;

use chrono::{Duration, NaiveDateTime, NaiveTime};

// Only the minute and hour fields are interpreted; day-of-month, month and
// day-of-week are accepted and ignored. Fewer than 5 fields (or an
// unparsable minute/hour field) yields no upcoming runs rather than an error.
pub fn next_runs(expression: &str, count: usize, now: NaiveDateTime) -> Vec<NaiveDateTime> {
    if count == 0 {
        return Vec::new();
    }
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() < 5 {
        return Vec::new();
    }
    let minutes = match parse_field(fields[0], 0, 59) {
        Some(values) if !values.is_empty() => values,
        _ => return Vec::new(),
    };
    let hours = match parse_field(fields[1], 0, 23) {
        Some(values) if !values.is_empty() => values,
        _ => return Vec::new(),
    };

    let mut runs = Vec::new();
    for day in 0..=7i64 {
        let date = now.date() + Duration::days(day);
        for &hour in &hours {
            for &minute in &minutes {
                let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                    continue;
                };
                let candidate = date.and_time(time);
                if candidate > now {
                    runs.push(candidate);
                    if runs.len() == count {
                        return runs;
                    }
                }
            }
        }
    }
    runs
}

fn parse_field(field: &str, min: u32, max: u32) -> Option<BTreeSet<u32>> {
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        if part == "*" {
            values.extend(min..=max);
        } else if let Some(step) = part.strip_prefix("*/") {
            let step: u32 = step.parse().ok()?;
            if step == 0 {
                return None;
            }
            values.extend((min..=max).step_by(step as usize));
        } else if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.trim().parse().ok()?;
            let end: u32 = end.trim().parse().ok()?;
            if start < min || end > max || start > end {
                return None;
            }
            values.extend(start..=end);
        } else {
            let value: u32 = part.parse().ok()?;
            if value < min || value > max {
                return None;
            }
            values.insert(value);
        }
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn runs_are_strictly_ascending_and_after_now() {
        let now = at(9, 30);
        let runs = next_runs("0 8,20 * * *", 5, now);
        assert_eq!(runs.len(), 5);
        assert!(runs.iter().all(|run| *run > now));
        assert!(runs.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(runs[0], at(20, 0));
        assert_eq!(runs[1], at(8, 0) + Duration::days(1));
    }

    #[test]
    fn fewer_than_five_fields_yields_empty() {
        assert!(next_runs("0 8 * *", 5, at(9, 0)).is_empty());
        assert!(next_runs("", 5, at(9, 0)).is_empty());
        assert!(next_runs("0", 5, at(9, 0)).is_empty());
    }

    #[test]
    fn unparsable_fields_yield_empty() {
        assert!(next_runs("banana 8 * * *", 5, at(9, 0)).is_empty());
        assert!(next_runs("0 25 * * *", 5, at(9, 0)).is_empty());
        assert!(next_runs("*/0 8 * * *", 5, at(9, 0)).is_empty());
        assert!(next_runs("10-5 8 * * *", 5, at(9, 0)).is_empty());
    }

    #[test]
    fn steps_ranges_and_lists_combine() {
        let now = at(0, 0);
        let runs = next_runs("*/15 3 * * *", 4, now);
        assert_eq!(
            runs,
            vec![at(3, 0), at(3, 15), at(3, 30), at(3, 45)]
        );

        let runs = next_runs("5 1-3,20 * * *", 4, now);
        assert_eq!(runs, vec![at(1, 5), at(2, 5), at(3, 5), at(20, 5)]);
    }

    #[test]
    fn extra_fields_are_ignored() {
        let with_five = next_runs("30 12 * * *", 3, at(0, 0));
        let with_seven = next_runs("30 12 1 1 0 2020 extra", 3, at(0, 0));
        assert_eq!(with_five, with_seven);
    }

    #[test]
    fn scan_window_is_bounded() {
        let now = at(12, 0);
        let runs = next_runs("0 0 * * *", 100, now);
        // one midnight per scanned day
        assert!(runs.len() <= 8);
        assert!(runs.iter().all(|run| *run - now <= Duration::days(8)));
    }
}
