//! Property-based tests for the local playback clock.
//!
//! Uses proptest to verify:
//! 1. `progress` stays within `0.0..=1.0` and `remaining` never underflows.
//! 2. `format_clock` renders `MM:SS` that parses back to the same seconds.
//! 3. Displayed elapsed time never decreases as local time advances, and
//!    equals the anchor plus whole elapsed seconds.
//! 4. A held snapshot is never replaced by one with a lower or equal version.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, Instant};

use proptest::prelude::*;
use rundown::clock::{
    ApplyOutcome, PlaybackClock, displayed_elapsed, format_clock, progress, remaining,
};
use rundown_proto::agenda::{ItemId, ServiceId};
use rundown_proto::timer::TimerState;

const T: u64 = 1_744_600_000_000;

proptest! {
    #[test]
    fn progress_and_remaining_are_clamped(elapsed in 0_u64..200_000, duration in 1_u32..86_400) {
        let p = progress(elapsed, duration);
        prop_assert!((0.0..=1.0).contains(&p));
        let left = remaining(elapsed, duration);
        prop_assert!(left <= u64::from(duration));
        if elapsed >= u64::from(duration) {
            prop_assert_eq!(left, 0);
            prop_assert!((p - 1.0).abs() < f64::EPSILON);
        } else {
            prop_assert_eq!(left + elapsed, u64::from(duration));
        }
    }

    #[test]
    fn format_clock_round_trips(secs in 0_u64..1_000_000) {
        let text = format_clock(secs);
        let (mm, ss) = text.split_once(':').unwrap();
        prop_assert!(mm.len() >= 2);
        prop_assert_eq!(ss.len(), 2);
        let ss: u64 = ss.parse().unwrap();
        prop_assert!(ss < 60);
        prop_assert_eq!(mm.parse::<u64>().unwrap() * 60 + ss, secs);
    }

    #[test]
    fn running_elapsed_is_anchor_plus_whole_seconds(
        base in 0_u64..3_600,
        later_ms in 0_u64..600_000,
        step_ms in 0_u64..5_000,
    ) {
        let mut state = TimerState::idle(ServiceId::new(), T).started(ItemId::new(), T);
        state.elapsed_secs = base;
        let received = Instant::now();
        let at = |ms: u64| displayed_elapsed(&state, T, received, received + Duration::from_millis(ms));

        prop_assert_eq!(at(later_ms), base + later_ms / 1000);
        prop_assert!(at(later_ms + step_ms) >= at(later_ms));
    }

    #[test]
    fn stopped_elapsed_ignores_time(base in 0_u64..3_600, later_ms in 0_u64..600_000) {
        let state = TimerState {
            elapsed_secs: base,
            ..TimerState::idle(ServiceId::new(), T).started(ItemId::new(), T).paused(T).unwrap()
        };
        let received = Instant::now();
        prop_assert_eq!(
            displayed_elapsed(&state, T + later_ms, received, received + Duration::from_millis(later_ms)),
            base
        );
    }

    #[test]
    fn lower_or_equal_versions_never_replace(held in 1_u64..1_000, offered in 0_u64..1_000) {
        let service_id = ServiceId::new();
        let mut current = TimerState::idle(service_id, T);
        current.version = held;
        let mut incoming = TimerState::idle(service_id, T);
        incoming.version = offered;
        incoming.elapsed_secs = 42;

        let mut clock = PlaybackClock::new();
        let now = Instant::now();
        clock.apply(current, T, now);
        let outcome = clock.apply(incoming, T, now);

        if offered > held {
            prop_assert_eq!(outcome, ApplyOutcome::Applied);
            prop_assert_eq!(clock.version(), Some(offered));
        } else {
            prop_assert_eq!(outcome, ApplyOutcome::Stale);
            prop_assert_eq!(clock.version(), Some(held));
        }
    }
}
