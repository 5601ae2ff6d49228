//! Property-based tests for agenda ordering and timer transitions.
//!
//! Uses proptest to verify:
//! 1. `move_item` swaps exactly two adjacent entries or is a no-op at the
//!    boundaries, never losing or duplicating an item.
//! 2. Minute entry converts by truncation and whole minutes round-trip.
//! 3. Starting or skipping to an item always yields a running, zeroed state
//!    regardless of the prior state.
//! 4. Pausing is idempotent.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::NaiveDate;
use proptest::prelude::*;
use rundown_proto::agenda::{
    Direction, ItemId, NewItem, Service, UserId, minutes_to_seconds, whole_minutes,
};
use rundown_proto::timer::{TimerCommand, TimerPhase, TimerState};

fn service_with(count: usize) -> Service {
    let date = NaiveDate::from_ymd_opt(2025, 4, 14).unwrap_or_default();
    let mut service = Service::new("Property Service", date, UserId::new("1")).unwrap();
    for i in 0..count {
        let item = NewItem::new(format!("item-{i}"), 60).into_item().unwrap();
        service.push_item(item).unwrap();
    }
    service
}

fn arb_direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Up), Just(Direction::Down)]
}

/// Strategy for an arbitrary reachable timer state.
fn arb_state() -> impl Strategy<Value = TimerState> {
    let item = ItemId::new();
    (0_u8..4, 0_u64..10_000, 1_000_u64..1_000_000).prop_map(move |(phase, elapsed_ms, now)| {
        let idle = TimerState::idle(rundown_proto::agenda::ServiceId::new(), now);
        let running = idle.started(item, now);
        match phase {
            0 => idle,
            1 => running,
            2 => running.paused(now + elapsed_ms).unwrap_or(running),
            _ => running.reset(now + elapsed_ms),
        }
    })
}

proptest! {
    #[test]
    fn move_item_swaps_neighbours_or_noops(
        len in 0_usize..12,
        index in 0_usize..14,
        direction in arb_direction(),
    ) {
        let mut service = service_with(len);
        let before: Vec<ItemId> = service.items.iter().map(|i| i.id).collect();
        let moved = service.move_item(index, direction);
        let after: Vec<ItemId> = service.items.iter().map(|i| i.id).collect();

        let neighbour = match direction {
            Direction::Up => index.checked_sub(1),
            Direction::Down => Some(index + 1),
        }
        .filter(|n| *n < len && index < len);

        match neighbour {
            None => {
                prop_assert!(!moved);
                prop_assert_eq!(before, after);
            }
            Some(n) => {
                prop_assert!(moved);
                prop_assert_eq!(after.len(), before.len());
                prop_assert_eq!(after[index], before[n]);
                prop_assert_eq!(after[n], before[index]);
                for i in (0..len).filter(|i| *i != index && *i != n) {
                    prop_assert_eq!(after[i], before[i]);
                }
            }
        }
    }

    #[test]
    fn whole_minutes_round_trip(minutes in 1_u32..=1440) {
        let secs = minutes_to_seconds(f64::from(minutes)).unwrap();
        prop_assert_eq!(secs, minutes * 60);
        prop_assert_eq!(whole_minutes(secs), minutes);
    }

    #[test]
    fn fractional_minutes_truncate(minutes in 0.02_f64..1440.0) {
        let secs = minutes_to_seconds(minutes).unwrap();
        prop_assert!(f64::from(secs) <= minutes * 60.0);
        prop_assert!(minutes * 60.0 - f64::from(secs) < 1.0);
    }

    #[test]
    fn skip_always_resets_elapsed(state in arb_state(), later in 0_u64..100_000) {
        let target = ItemId::new();
        let now = state.last_changed_at + later;
        for command in [
            TimerCommand::SkipToItem { item_id: target },
            TimerCommand::Start { item_id: target },
        ] {
            let next = state.apply(command, now).unwrap();
            prop_assert_eq!(next.phase(), TimerPhase::Running);
            prop_assert_eq!(next.current_item_id, Some(target));
            prop_assert_eq!(next.elapsed_secs, 0);
            prop_assert_eq!(next.version, state.version + 1);
        }
    }

    #[test]
    fn pause_is_idempotent(state in arb_state(), later in 0_u64..100_000) {
        let now = state.last_changed_at + later;
        let once = state.paused(now).unwrap_or_else(|| state.clone());
        let twice = once.paused(now + 1_000).unwrap_or_else(|| once.clone());
        prop_assert_eq!(once, twice);
    }
}
