mod common;

use aero_cmd_stream::{CommandHeader, Dispatch, Request, StreamConfig};
use common::{Harness, RING_ENTRIES};
use proptest::prelude::*;

/// Fills the ring with one-entry NOOPs so that any put offset decodes cleanly.
fn fill_with_noops(stream: &common::TestStream) {
    let noop = CommandHeader { size: 1, opcode: 0 }.encode();
    stream.ring.write_words(0, &vec![noop; RING_ENTRIES]);
}

#[test]
fn stale_flush_after_newer_one_is_ignored() {
    let mut h = Harness::new();
    let mut s = h.stream();
    fill_with_noops(&s);

    let dispatch = h.send(
        s.id,
        Request::AsyncFlush {
            put_offset: 100,
            flush_count: 7,
        },
    );
    assert!(matches!(dispatch, Dispatch::Replied(_)));
    let state = h.channel.stream(s.id).unwrap().state();
    assert_eq!((state.get_offset, state.put_offset), (100, 100));

    h.send(
        s.id,
        Request::AsyncFlush {
            put_offset: 50,
            flush_count: 6,
        },
    );
    let state = h.channel.stream(s.id).unwrap().state();
    assert_eq!((state.get_offset, state.put_offset), (100, 100));
    assert_eq!(h.channel.stats().snapshot().flushes_dropped, 1);

    // Duplicates are dropped as well; stale flushes never destroy the stream.
    s.flush_count = 6;
    h.flush(&mut s);
    assert_eq!(h.channel.stats().snapshot().flushes_dropped, 2);
    assert!(h.messages().is_empty());
}

#[test]
fn flush_counter_may_wrap() {
    let mut h = Harness::new();
    let s = h.stream();
    fill_with_noops(&s);

    let flushes = [
        (10, 0x7000_0000),
        (20, 0xe000_0000),
        (30, u32::MAX),
        (40, 0),
        (50, 1),
    ];
    for (put_offset, flush_count) in flushes {
        h.send(
            s.id,
            Request::AsyncFlush {
                put_offset,
                flush_count,
            },
        );
    }
    assert_eq!(h.channel.stream(s.id).unwrap().state().get_offset, 50);
    assert_eq!(h.channel.stats().snapshot().flushes_dropped, 0);
}

#[test]
fn caught_up_state_is_published_to_shared_memory() {
    let mut h = Harness::new();
    let mut s = h.stream();
    s.writer.set_token(11).unwrap();
    h.flush(&mut s);

    let shared = aero_cmd_stream::read_shared_state(&s.shared_state).unwrap();
    assert_eq!(shared.get_offset, 2);
    assert_eq!(shared.put_offset, 2);
    assert_eq!(shared.token, 11);
    assert!(!shared.error.is_error());
}

#[derive(Clone, Debug)]
struct Flush {
    put_offset: u32,
    delta: u32,
}

fn flush_strategy() -> impl Strategy<Value = Flush> {
    let delta = prop_oneof![
        Just(0u32),
        1u32..4,
        Just(u32::MAX),
        (u32::MAX - 3)..=u32::MAX,
        Just(0x8000_0000),
        any::<u32>(),
    ];
    (0u32..RING_ENTRIES as u32, delta).prop_map(|(put_offset, delta)| Flush { put_offset, delta })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn only_flushes_ahead_of_the_last_accepted_move_the_cursors(
        flushes in proptest::collection::vec(flush_strategy(), 1..40)
    ) {
        let mut h = Harness::new();
        let s = h.stream();
        fill_with_noops(&s);
        let window = StreamConfig::default();

        let mut count = 0u32;
        let mut last_accepted = 0u32;
        let mut expected_put = 0u32;
        for flush in flushes {
            count = count.wrapping_add(flush.delta);
            let accepted = window.flush_is_ahead(last_accepted, count);
            h.send(s.id, Request::AsyncFlush { put_offset: flush.put_offset, flush_count: count });
            if accepted {
                last_accepted = count;
                expected_put = flush.put_offset;
            }
            let state = h.channel.stream(s.id).unwrap().state();
            prop_assert_eq!(state.put_offset, expected_put);
            prop_assert_eq!(state.get_offset, expected_put);
            prop_assert!(!state.error.is_error());
        }
    }
}
