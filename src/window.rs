//! Window planning for aggregation cycles.
//!
//! Pure functions only: the aggregator owns the "previous end" per
//! tracked key and feeds it back in on the next cycle.

use crate::config::{CalendarUnit, Interval};
use crate::schema::Window;

#[derive(Debug, Clone, Copy)]
pub struct WindowPlanner {
    interval: Interval,
}

impl WindowPlanner {
    pub fn new(interval: Interval) -> Self {
        Self { interval }
    }

    /// Window to process at `now_ms`.
    ///
    /// Plain-second intervals read by cursor. Calendar intervals end on
    /// the most recent unit boundary and start where the previous window
    /// for the same key ended, or `multiplier` units back on the first cycle.
    ///
    /// A window whose end has not moved past `prev_end` comes back empty.
    pub fn plan(&self, now_ms: i64, prev_end: Option<i64>) -> Window {
        let Interval::Calendar { unit, multiplier } = self.interval else {
            return Window::Cursor;
        };

        let end = floor_to_unit(now_ms, unit);
        let start = prev_end.unwrap_or(end - unit_ms(unit) * i64::from(multiplier));

        Window::Range {
            start,
            end: end.max(start),
        }
    }
}

fn unit_ms(unit: CalendarUnit) -> i64 {
    unit.seconds() as i64 * 1_000
}

/// Start of the UTC minute / hour / day containing `ts_ms`.
///
/// Unix time has no leap seconds, so UTC boundaries are exact
/// multiples of the unit length.
pub fn floor_to_unit(ts_ms: i64, unit: CalendarUnit) -> i64 {
    let step = unit_ms(unit);
    ts_ms.div_euclid(step) * step
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;
    const MINUTE: i64 = 60_000;

    fn hourly() -> WindowPlanner {
        WindowPlanner::new(Interval::Calendar {
            unit: CalendarUnit::Hour,
            multiplier: 1,
        })
    }

    #[test]
    fn cursor_mode_has_no_bounds() {
        let planner = WindowPlanner::new(Interval::Seconds(60));
        assert_eq!(planner.plan(123_456, None), Window::Cursor);
        assert_eq!(planner.plan(123_456, Some(100)), Window::Cursor);
    }

    #[test]
    fn first_window_ends_on_boundary() {
        let now = 10 * HOUR + 17 * MINUTE + 5_000;
        assert_eq!(
            hourly().plan(now, None),
            Window::Range { start: 9 * HOUR, end: 10 * HOUR }
        );
    }

    #[test]
    fn multiplier_widens_first_window() {
        let planner = WindowPlanner::new(Interval::Calendar {
            unit: CalendarUnit::Minute,
            multiplier: 5,
        });
        let now = 42 * MINUTE + 30_000;
        assert_eq!(
            planner.plan(now, None),
            Window::Range { start: 37 * MINUTE, end: 42 * MINUTE }
        );
    }

    #[test]
    fn day_boundary_is_utc_midnight() {
        // 2024-03-10T18:45:00Z
        let now = 1_710_096_300_000;
        let planner = WindowPlanner::new(Interval::Calendar {
            unit: CalendarUnit::Day,
            multiplier: 1,
        });
        assert_eq!(
            planner.plan(now, None),
            // 2024-03-09T00:00:00Z .. 2024-03-10T00:00:00Z
            Window::Range { start: 1_709_942_400_000, end: 1_710_028_800_000 }
        );
    }

    #[test]
    fn successive_windows_are_contiguous() {
        let planner = hourly();
        let mut prev: Option<Window> = None;

        // wake-ups drift across boundaries and sometimes skip an hour
        let wakeups = [
            3 * HOUR + 1_000,
            4 * HOUR + 59 * MINUTE,
            5 * HOUR + 2 * MINUTE,
            8 * HOUR + 30 * MINUTE,
            9 * HOUR,
        ];

        for now in wakeups {
            let window = planner.plan(now, prev.and_then(|w| w.end()));
            if let (Some(Window::Range { end: prev_end, .. }), Window::Range { start, end }) =
                (prev, window)
            {
                assert_eq!(start, prev_end, "gap or overlap at now={now}");
                assert!(end >= start);
            }
            prev = Some(window);
        }
    }

    #[test]
    fn same_bucket_twice_is_empty() {
        let planner = hourly();
        let first = planner.plan(5 * HOUR + MINUTE, None);
        let again = planner.plan(5 * HOUR + 40 * MINUTE, first.end());
        assert!(again.is_empty());
    }
}
