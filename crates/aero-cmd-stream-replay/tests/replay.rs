use aero_cmd_stream::{ChannelConfig, ClientEvent, ErrorState, LossReason, Reply};
use aero_cmd_stream_replay::{
    load_config, load_script, replay_script, LogRecord, ReplayError, Replayer, Script,
};
use pretty_assertions::assert_eq;

const SETUP: &str = r#"
    {"op": "create_channel", "client": 1},
    {"op": "create_stream", "name": "a"},
    {"op": "create_stream", "name": "b"},
    {"op": "initialize", "stream": "a"},
    {"op": "initialize", "stream": "b"},
    {"op": "create_ring", "stream": "a", "entries": 64},
    {"op": "set_get_buffer", "stream": "a"},
    {"op": "create_ring", "stream": "b", "entries": 64},
    {"op": "set_get_buffer", "stream": "b"}
"#;

fn script(steps: &str) -> Script {
    Script::from_json(&format!(r#"{{"steps": [{SETUP}, {steps}]}}"#)).unwrap()
}

fn records_for<'a>(
    log: &'a aero_cmd_stream_replay::ReplayLog,
    stream: &str,
) -> Vec<&'a LogRecord> {
    log.entries
        .iter()
        .filter(|entry| entry.stream == stream)
        .map(|entry| &entry.record)
        .collect()
}

#[test]
fn cross_stream_wait_holds_back_ordered_messages() {
    let log = replay_script(
        ChannelConfig::default(),
        &script(
            r#"
            {"op": "insert_sync_point", "stream": "a", "name": "gate"},
            {"op": "submit", "stream": "b", "commands": [{"wait_sync_point": "gate"}, {"set_token": 5}]},
            {"op": "echo", "stream": "b", "id": 1},
            {"op": "advance", "ms": 5},
            {"op": "retire_sync_point", "stream": "a", "name": "gate"}
            "#,
        ),
    )
    .unwrap();

    let b = records_for(&log, "b");
    let deferred = b
        .iter()
        .position(|r| **r == LogRecord::Deferred { request: "echo".into() })
        .expect("echo deferred");
    let acked = b
        .iter()
        .position(|r| {
            **r == LogRecord::Message {
                event: ClientEvent::EchoAck { id: 1 },
            }
        })
        .expect("echo acked");
    assert!(deferred < acked);
    assert_eq!(log.messages_for("b"), vec![&ClientEvent::EchoAck { id: 1 }]);

    let ack_time = log
        .entries
        .iter()
        .find(|e| e.record == LogRecord::Message { event: ClientEvent::EchoAck { id: 1 } })
        .map(|e| e.time_ns);
    assert_eq!(ack_time, Some(5_000_000));
    assert_eq!(log.stats.commands_processed, 2);
    assert_eq!(log.end_time_ns, 5_000_000);
}

#[test]
fn deferred_sync_point_inserts_still_bind_their_name() {
    let log = replay_script(
        ChannelConfig::default(),
        &script(
            r#"
            {"op": "insert_sync_point", "stream": "a", "name": "gate"},
            {"op": "wait_sync_point", "stream": "b", "name": "gate"},
            {"op": "insert_sync_point", "stream": "b", "name": "later"},
            {"op": "retire_sync_point", "stream": "a", "name": "gate"},
            {"op": "retire_sync_point", "stream": "b", "name": "later"}
            "#,
        ),
    )
    .unwrap();

    let b = records_for(&log, "b");
    assert!(b.contains(&&LogRecord::Deferred {
        request: "insert_sync_point".into()
    }));
    assert!(!b
        .iter()
        .any(|r| matches!(r, LogRecord::Rejected { .. })));
    assert!(matches!(
        log.messages_for("b")[..],
        [ClientEvent::Reply {
            reply: Reply::SyncPoint { .. },
            ..
        }]
    ));
}

#[test]
fn client_misuse_is_logged_not_fatal() {
    let log = replay_script(
        ChannelConfig::default(),
        &script(
            r#"
            {"op": "insert_sync_point", "stream": "a", "name": "gate"},
            {"op": "retire_sync_point", "stream": "b", "name": "gate"},
            {"op": "flush", "stream": "a", "put_offset": 64, "flush_count": 1}
            "#,
        ),
    )
    .unwrap();

    assert!(records_for(&log, "b").iter().any(|r| matches!(
        r,
        LogRecord::Rejected { request, .. } if request == "retire_sync_point"
    )));
    assert_eq!(
        log.messages_for("a"),
        vec![&ClientEvent::Destroyed {
            error: ErrorState::Parse(aero_cmd_stream::ParseError::OutOfBounds)
        }]
    );
}

#[test]
fn lost_streams_are_torn_down_and_later_requests_rejected() {
    let log = replay_script(
        ChannelConfig::default(),
        &script(
            r#"
            {"op": "submit", "stream": "a", "commands": [{"lose_context": "innocent"}]},
            {"op": "echo", "stream": "a", "id": 9}
            "#,
        ),
    )
    .unwrap();

    let a = records_for(&log, "a");
    assert!(a.contains(&&LogRecord::Message {
        event: ClientEvent::Destroyed {
            error: ErrorState::ContextLost(LossReason::Innocent)
        }
    }));
    assert!(matches!(
        a.last(),
        Some(LogRecord::Rejected { request, error }) if request == "echo" && error.contains("unknown stream")
    ));
    assert_eq!(log.stats.contexts_lost, 1);
    assert_eq!(log.stats.streams_destroyed, 1);
}

#[test]
fn script_mistakes_abort_with_the_step_index() {
    let err = replay_script(
        ChannelConfig::default(),
        &Script::from_json(r#"{"steps": [{"op": "initialize", "stream": "ghost"}]}"#).unwrap(),
    )
    .unwrap_err();
    assert!(matches!(err, ReplayError::UnknownStream { step: 0, ref name } if name == "ghost"));

    let err = replay_script(
        ChannelConfig::default(),
        &script(r#"{"op": "wait_sync_point", "stream": "a", "name": "nope"}"#),
    )
    .unwrap_err();
    assert!(matches!(err, ReplayError::UnknownSyncPoint { step: 9, .. }));

    let err = replay_script(
        ChannelConfig::default(),
        &Script::from_json(
            r#"{"steps": [
                {"op": "create_channel", "client": 1},
                {"op": "create_stream", "name": "a"},
                {"op": "submit", "stream": "a", "commands": ["noop"]}
            ]}"#,
        )
        .unwrap(),
    )
    .unwrap_err();
    assert!(matches!(err, ReplayError::NoRing { step: 2, .. }));
}

#[test]
fn failure_injection_reaches_the_log() {
    let mut replayer = Replayer::new(ChannelConfig::default());
    replayer.backend().controls().set_fail_initialize(true);
    replayer
        .run(
            &Script::from_json(
                r#"{"steps": [
                    {"op": "create_channel", "client": 1},
                    {"op": "create_stream", "name": "a"},
                    {"op": "initialize", "stream": "a"}
                ]}"#,
            )
            .unwrap(),
        )
        .unwrap();
    assert!(!replayer.channel().stream(aero_cmd_stream::StreamId(1)).unwrap().is_initialized());
    let log = replayer.finish();
    assert_eq!(
        log.entries.last().map(|e| &e.record),
        Some(&LogRecord::Reply {
            request: "initialize".into(),
            reply: Reply::Initialize {
                success: false,
                capabilities: None
            }
        })
    );
}

#[test]
fn scripts_and_config_load_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("script.json");
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &script_path,
        format!(
            r#"{{"steps": [{SETUP}, {{"op": "submit", "stream": "a", "commands": [{{"cache_shader": {{"key": 1}}}}]}}]}}"#
        ),
    )
    .unwrap();
    std::fs::write(&config_path, r#"{"stream": {"poll_delay_busy_ms": 7}}"#).unwrap();

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.stream.poll_delay_busy_ms, 7);
    let log = replay_script(config, &load_script(&script_path).unwrap()).unwrap();

    let text = log.render_text();
    assert!(text.contains("message  {\"event\":\"cache_shader\""), "{text}");
    assert!(text.lines().last().unwrap().starts_with("stats {"));

    let json = serde_json::to_value(&log).unwrap();
    let last = json["entries"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["kind"], "message");
    assert_eq!(last["stream"], "a");
    assert_eq!(last["event"]["key"], "shader-00000001");

    assert!(matches!(
        load_script(&dir.path().join("missing.json")),
        Err(ReplayError::Io { .. })
    ));
    std::fs::write(&config_path, "{").unwrap();
    assert!(matches!(
        load_config(&config_path),
        Err(ReplayError::Parse { what: "config", .. })
    ));
}
