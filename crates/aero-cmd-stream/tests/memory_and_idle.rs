mod common;

use aero_cmd_stream::software::opcode as sw;
use aero_cmd_stream::{
    ChannelConfig, ClientEvent, ErrorState, ManagedMemoryStats, MemoryAllocation, ParseError,
    Request, SharedMemory,
};
use aero_gpu_memory::{MemoryManagerConfig, PriorityCutoff};
use common::Harness;
use pretty_assertions::assert_eq;

fn small_memory() -> ChannelConfig {
    let mut config = ChannelConfig::default();
    config.memory = MemoryManagerConfig {
        total_bytes_available: 1000,
        min_bytes_per_client: 10,
        max_bytes_per_client: 800,
        default_bytes_per_client: 100,
    };
    config
}

fn allocation_events(events: Vec<ClientEvent>) -> Vec<MemoryAllocation> {
    events
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::SetMemoryAllocation { allocation } => Some(allocation),
            _ => None,
        })
        .collect()
}

#[test]
fn allocation_pushes_reach_the_client_only_on_change() {
    let mut h = Harness::with_config(small_memory());
    let s = h.stream();
    h.run_tasks();
    assert!(h.messages().is_empty());

    h.request(
        s.id,
        Request::SetMemoryAllocationChangedCallback { has_callback: true },
    );
    h.run_tasks();
    let pushed = allocation_events(h.events_for(s.id));
    assert_eq!(
        pushed,
        vec![MemoryAllocation {
            bytes_limit: 100,
            visible: true,
            priority_cutoff: PriorityCutoff::NiceToHave,
        }]
    );

    h.request(s.id, Request::SetSurfaceVisible { visible: true });
    h.run_tasks();
    assert!(h.messages().is_empty());

    h.request(s.id, Request::SetSurfaceVisible { visible: false });
    h.run_tasks();
    assert_eq!(
        allocation_events(h.events_for(s.id)),
        vec![MemoryAllocation::NONVISIBLE]
    );

    h.request(s.id, Request::SetSurfaceVisible { visible: true });
    h.request(
        s.id,
        Request::SetManagedMemoryStats {
            stats: ManagedMemoryStats {
                bytes_required: 200,
                bytes_nice_to_have: 400,
                bytes_allocated: 0,
            },
        },
    );
    h.run_tasks();
    let pushed = allocation_events(h.events_for(s.id));
    assert_eq!(pushed.last().map(|a| a.bytes_limit), Some(400));
}

#[test]
fn streams_without_a_callback_hear_nothing() {
    let mut h = Harness::with_config(small_memory());
    let s = h.stream();
    h.request(s.id, Request::SetSurfaceVisible { visible: false });
    h.run_tasks();
    assert!(h.events_for(s.id).is_empty());
}

#[test]
fn running_out_of_memory_is_recoverable() {
    let mut h = Harness::with_config(small_memory());
    let mut s = h.stream();
    s.writer.command(sw::ALLOC, &[1, 600]).unwrap();
    s.writer.command(sw::ALLOC, &[2, 600]).unwrap();
    s.writer.set_token(7).unwrap();
    h.flush(&mut s);

    let stream = h.channel.stream(s.id).unwrap();
    assert_eq!(stream.state().token, 7);
    assert_eq!(stream.state().error, ErrorState::None);
    assert_eq!(stream.recoverable_errors(), 1);
    assert_eq!(h.channel.stats().snapshot().out_of_memory_errors, 1);
    assert_eq!(h.channel.memory().client_usage(1), 600);
    assert!(h.messages().is_empty());
}

#[test]
fn freed_memory_is_reclaimed_by_idle_work() {
    let mut h = Harness::with_config(small_memory());
    let mut s = h.stream();
    s.writer.command(sw::ALLOC, &[1, 600]).unwrap();
    s.writer.command(sw::FREE, &[1]).unwrap();
    h.flush(&mut s);
    assert_eq!(h.channel.memory().client_usage(1), 600);

    h.run_tasks();
    assert_eq!(h.channel.stats().snapshot().idle_passes, 1);
    assert_eq!(h.channel.memory().client_usage(1), 0);

    s.writer.command(sw::ALLOC, &[2, 900]).unwrap();
    s.writer.set_token(1).unwrap();
    h.flush(&mut s);
    assert_eq!(h.channel.stream(s.id).unwrap().recoverable_errors(), 0);
    assert_eq!(h.channel.memory().client_usage(1), 900);
}

#[test]
fn idle_work_runs_after_staleness_even_when_busy() {
    let mut config = small_memory();
    config.stream.poll_delay_idle_work_ms = 2;
    let mut h = Harness::with_config(config);
    let mut s = h.stream();
    s.writer.command(sw::ALLOC, &[1, 100]).unwrap();
    s.writer.command(sw::FREE, &[1]).unwrap();
    h.flush(&mut s);

    // A message arrives every millisecond, so no poll ever sees a quiet period.
    let mut first_idle_ms = None;
    for ms in 1..=14u64 {
        h.request(s.id, Request::Echo { id: ms as u32 });
        h.advance(1);
        if first_idle_ms.is_none() && h.channel.stats().snapshot().idle_passes > 0 {
            first_idle_ms = Some(ms);
        }
    }
    assert_eq!(first_idle_ms, Some(12));
    assert_eq!(h.channel.memory().client_usage(1), 0);

    let echoes = h
        .events_for(s.id)
        .into_iter()
        .filter(|event| matches!(event, ClientEvent::EchoAck { .. }))
        .count();
    assert_eq!(echoes, 14);
}

#[test]
fn query_signals_wait_for_the_fence() {
    let mut h = Harness::new();
    h.backend.controls().set_hold_fences(true);
    let mut s = h.stream();
    s.writer.begin_query(5).unwrap();
    s.writer.end_query(5).unwrap();
    h.flush(&mut s);

    h.request(
        s.id,
        Request::SignalQuery {
            query_id: 5,
            signal_id: 77,
        },
    );
    h.advance(2);
    h.advance(2);
    assert!(h.events_for(s.id).is_empty());

    h.backend.controls().set_hold_fences(false);
    h.advance(2);
    assert_eq!(
        h.events_for(s.id),
        vec![ClientEvent::SignalAck { signal_id: 77 }]
    );
    assert!(!h.channel.stream(s.id).unwrap().has_more_work());

    // Nothing outstanding for this query any more.
    h.request(
        s.id,
        Request::SignalQuery {
            query_id: 5,
            signal_id: 78,
        },
    );
    assert_eq!(
        h.events_for(s.id),
        vec![ClientEvent::SignalAck { signal_id: 78 }]
    );
}

#[test]
fn query_misuse_is_counted_but_not_fatal() {
    let mut h = Harness::new();
    let mut s = h.stream();
    s.writer.end_query(9).unwrap();
    s.writer.begin_query(3).unwrap();
    s.writer.begin_query(3).unwrap();
    s.writer.set_token(4).unwrap();
    h.flush(&mut s);
    let stream = h.channel.stream(s.id).unwrap();
    assert_eq!(stream.recoverable_errors(), 2);
    assert_eq!(stream.state().token, 4);
    assert_eq!(stream.state().error, ErrorState::None);
}

#[test]
fn shader_blobs_are_forwarded_to_the_client() {
    let mut h = Harness::new();
    let mut s = h.stream();
    s.writer.command(sw::CACHE_SHADER, &[0xab]).unwrap();
    h.flush(&mut s);
    assert_eq!(
        h.events_for(s.id),
        vec![ClientEvent::CacheShader {
            key: "shader-000000ab".to_string(),
            blob: vec![0xab, 0, 0, 0],
        }]
    );
}

#[test]
fn uploads_are_bounds_checked_against_the_transfer_buffer() {
    let mut h = Harness::new();
    let mut s = h.stream();
    let staging = SharedMemory::new(64);
    staging.write_bytes(0, &[7; 64]);
    h.request(
        s.id,
        Request::RegisterTransferBuffer {
            id: 2,
            buffer: staging,
            size: 64,
        },
    );
    assert_eq!(h.channel.stream(s.id).unwrap().transfer_buffer_count(), 2);

    s.writer.command(sw::UPLOAD, &[2, 0, 64]).unwrap();
    s.writer.set_token(1).unwrap();
    h.flush(&mut s);
    assert_eq!(h.channel.stream(s.id).unwrap().state().token, 1);
    assert!(h.messages().is_empty());

    s.writer.command(sw::UPLOAD, &[2, 32, 64]).unwrap();
    h.flush(&mut s);
    assert_eq!(
        h.events_for(s.id),
        vec![ClientEvent::Destroyed {
            error: ErrorState::Parse(ParseError::OutOfBounds)
        }]
    );
}

#[test]
fn transfer_buffer_ids_are_validated() {
    let mut h = Harness::new();
    let s = h.stream();
    for (id, size) in [(0, 4), (common::RING_ID, 4), (3, 128)] {
        let err = h
            .channel
            .handle_message(
                0,
                s.id,
                Request::RegisterTransferBuffer {
                    id,
                    buffer: SharedMemory::new(64),
                    size,
                },
            )
            .unwrap_err();
        assert!(
            matches!(err, aero_cmd_stream::CommandStreamError::InvalidArgument(_)),
            "id {id} size {size}: {err}"
        );
    }
    assert!(h
        .channel
        .handle_message(0, s.id, Request::DestroyTransferBuffer { id: 9 })
        .is_err());
}
