//! # Low-Tide Window Matching
//!
//! Decides whether a scene was acquired close enough to low water. The test
//! is a clock-hour window on the UTC hour of each predicted low tide for the
//! scene's day: with the window `10..14`, a low tide at 11:23 UTC qualifies,
//! one at 15:05 UTC does not.
//!
//! Two interval policies exist because the hour at the upper edge is
//! ambiguous. [`IntervalPolicy::Closed`] (the default) accepts a low tide at
//! 14:40 for the window `10..14`, matching the "between 10:00 and 14:00"
//! reading of the window; [`IntervalPolicy::HalfOpen`] rejects it.

use crate::TideExtreme;
use serde::{Deserialize, Serialize};

/// How the upper edge of a [`MatchWindow`] is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalPolicy {
    /// `start <= h <= end`
    #[default]
    Closed,
    /// `start <= h < end`
    HalfOpen,
}

/// Clock-hour window applied to the UTC hour of a low tide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchWindow {
    /// First accepted hour, 0..=24
    pub start_hour: u32,
    /// Last (closed) or first rejected (half-open) hour, 0..=24
    pub end_hour: u32,
    pub policy: IntervalPolicy,
}

impl MatchWindow {
    pub fn new(start_hour: u32, end_hour: u32, policy: IntervalPolicy) -> Self {
        Self {
            start_hour,
            end_hour,
            policy,
        }
    }

    /// Whether an hour of day falls inside the window.
    pub fn contains_hour(&self, hour: u32) -> bool {
        match self.policy {
            IntervalPolicy::Closed => self.start_hour <= hour && hour <= self.end_hour,
            IntervalPolicy::HalfOpen => self.start_hour <= hour && hour < self.end_hour,
        }
    }

    /// `HH:00 and HH:00`, used in the run log.
    pub fn describe(&self) -> String {
        format!("{:02}:00 and {:02}:00", self.start_hour, self.end_hour)
    }
}

/// Return the first low tide, in service order, whose UTC hour lies in
/// `window`. High extremes are ignored; an empty list never matches.
pub fn matches<'a>(extremes: &'a [TideExtreme], window: &MatchWindow) -> Option<&'a TideExtreme> {
    extremes
        .iter()
        .filter(|extreme| extreme.is_low())
        .find(|extreme| window.contains_hour(extreme.hour()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TideKind;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn extreme(kind: TideKind, hour: u32, minute: u32) -> TideExtreme {
        TideExtreme {
            kind,
            at: Utc.with_ymd_and_hms(2021, 6, 15, hour, minute, 0).unwrap(),
            source_date: NaiveDate::from_ymd_opt(2021, 6, 15).unwrap(),
            height_m: None,
        }
    }

    fn closed(start: u32, end: u32) -> MatchWindow {
        MatchWindow::new(start, end, IntervalPolicy::Closed)
    }

    #[test]
    fn test_empty_list_never_matches() {
        assert!(matches(&[], &closed(0, 24)).is_none());
    }

    #[test]
    fn test_high_tides_are_ignored() {
        let extremes = vec![
            extreme(TideKind::High, 10, 0),
            extreme(TideKind::High, 12, 30),
        ];
        assert!(matches(&extremes, &closed(0, 24)).is_none());
    }

    #[test]
    fn test_closed_window_boundaries() {
        let window = closed(10, 14);
        for (hour, expected) in [(9, false), (10, true), (14, true), (15, false)] {
            let extremes = vec![extreme(TideKind::Low, hour, 45)];
            assert_eq!(
                matches(&extremes, &window).is_some(),
                expected,
                "hour {hour} in closed 10..14"
            );
        }
    }

    #[test]
    fn test_half_open_window_rejects_end_hour() {
        let window = MatchWindow::new(10, 14, IntervalPolicy::HalfOpen);
        assert!(matches(&[extreme(TideKind::Low, 10, 0)], &window).is_some());
        assert!(matches(&[extreme(TideKind::Low, 13, 59)], &window).is_some());
        assert!(matches(&[extreme(TideKind::Low, 14, 0)], &window).is_none());
    }

    #[test]
    fn test_first_qualifying_low_wins() {
        let extremes = vec![
            extreme(TideKind::Low, 4, 10),
            extreme(TideKind::High, 11, 0),
            extreme(TideKind::Low, 12, 5),
            extreme(TideKind::Low, 13, 50),
        ];
        let found = matches(&extremes, &closed(10, 14)).unwrap();
        assert_eq!(found.clock_time(), "12:05");
    }

    #[test]
    fn test_describe_pads_hours() {
        assert_eq!(closed(9, 14).describe(), "09:00 and 14:00");
    }
}
