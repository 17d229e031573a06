mod common;

use std::time::Duration;

use common::{REQUEST_TOPICS, RunningSession, STRING_MD5, TX_STOP, parse_frame, wait_until};
use rosserial_bridge::{SessionEnd, middleware::ParamValue, testing::StaticTypes};
use rosserial_proto::{RequestParamRequest, RequestParamResponse, TimeMsg, TopicInfo, ids};

const WAIT: Duration = Duration::from_secs(3);

fn chatter_info(topic_id: u16) -> TopicInfo {
    TopicInfo {
        topic_id,
        topic_name: "chatter".to_string(),
        message_type: "std_msgs/String".to_string(),
        md5sum: STRING_MD5.to_string(),
        buffer_size: 280,
    }
}

#[test]
fn first_write_is_request_topics_and_last_is_tx_stop() {
    let session = RunningSession::start(StaticTypes::new());

    let writes = session.harness.wait_for_writes(1, WAIT);
    assert_eq!(writes[0], REQUEST_TOPICS);

    let (end, harness) = session.stop();
    assert!(matches!(end, SessionEnd::Shutdown));
    assert_eq!(harness.writes().last().expect("no writes"), &TX_STOP);
}

#[test]
fn announced_publisher_forwards_device_payloads() {
    let session =
        RunningSession::start(StaticTypes::new().with_message("std_msgs/String", STRING_MD5));

    session.harness.push_frame(ids::PUBLISHER, &chatter_info(125).encode());
    let payload = [3, 0, 0, 0, b'h', b'e', b'y'];
    session.harness.push_frame(125, &payload);

    wait_until("publication", WAIT, || !session.host.middleware.published().is_empty());
    assert_eq!(session.host.middleware.published(), [("chatter".to_string(), payload.to_vec())]);
    session.stop();
}

#[test]
fn announced_subscriber_frames_middleware_messages_in_order() {
    let session =
        RunningSession::start(StaticTypes::new().with_message("std_msgs/String", STRING_MD5));

    let info = TopicInfo { topic_name: "cmd".to_string(), ..chatter_info(126) };
    session.harness.push_frame(ids::SUBSCRIBER, &info.encode());
    wait_until("subscription", WAIT, || session.host.middleware.is_subscribed("cmd"));

    for i in 0..5u8 {
        assert!(session.host.middleware.deliver("cmd", &[i]));
    }

    // One write per queued message, in enqueue order, after request-topics.
    let writes = session.harness.wait_for_writes(6, WAIT);
    let frames: Vec<_> = writes[1..6].iter().map(|w| parse_frame(w)).collect();
    let expected: Vec<_> = (0..5u8).map(|i| (126u16, vec![i])).collect();
    assert_eq!(frames, expected);
    session.stop();
}

#[test]
fn unknown_topic_id_triggers_renegotiation() {
    let session = RunningSession::start(StaticTypes::new());

    session.harness.wait_for_writes(1, WAIT);
    session.harness.push_frame(200, &[1, 2]);

    let writes = session.harness.wait_for_writes(2, WAIT);
    assert_eq!(writes[1], REQUEST_TOPICS);
    session.stop();
}

#[test]
fn time_request_is_answered_with_wall_clock() {
    let session = RunningSession::start(StaticTypes::new());

    session.harness.wait_for_writes(1, WAIT);
    session.harness.push_frame(ids::TIME, &[]);

    let writes = session.harness.wait_for_writes(2, WAIT);
    let (topic_id, payload) = parse_frame(&writes[1]);
    assert_eq!(topic_id, ids::TIME);
    let time = TimeMsg::decode(&payload).unwrap();
    assert!(time.sec > 1_500_000_000, "implausible host time: {time:?}");
    session.stop();
}

#[test]
fn parameter_request_is_answered_from_the_store() {
    let session = RunningSession::start(StaticTypes::new());
    session.host.params.set("led_count", ParamValue::Int(5));

    session.harness.wait_for_writes(1, WAIT);
    session
        .harness
        .push_frame(ids::PARAMETER_REQUEST, &RequestParamRequest { name: "led_count".into() }.encode());

    let writes = session.harness.wait_for_writes(2, WAIT);
    let (topic_id, payload) = parse_frame(&writes[1]);
    assert_eq!(topic_id, ids::PARAMETER_REQUEST);
    let response = RequestParamResponse::decode(&payload).unwrap();
    assert_eq!(response.ints, [5]);
    session.stop();
}

#[test]
fn missing_parameter_still_gets_an_empty_answer() {
    let session = RunningSession::start(StaticTypes::new());

    session.harness.wait_for_writes(1, WAIT);
    session
        .harness
        .push_frame(ids::PARAMETER_REQUEST, &RequestParamRequest { name: "nope".into() }.encode());

    let writes = session.harness.wait_for_writes(2, WAIT);
    let (topic_id, payload) = parse_frame(&writes[1]);
    assert_eq!(topic_id, ids::PARAMETER_REQUEST);
    assert_eq!(RequestParamResponse::decode(&payload).unwrap(), RequestParamResponse::default());
    session.stop();
}

#[test]
fn protocol_mismatch_raises_diagnostic_and_later_frames_dispatch() {
    let session =
        RunningSession::start(StaticTypes::new().with_message("std_msgs/String", STRING_MD5));

    // A foreign version byte, then well-formed traffic; a stray 0xFF after
    // the mismatch would read as another sync attempt.
    session.harness.push_bytes([0xFF, 0xFD]);
    session.harness.push_frame(ids::PUBLISHER, &chatter_info(125).encode());
    session.harness.push_frame(125, &[7]);

    wait_until("publication", WAIT, || !session.host.middleware.published().is_empty());
    let statuses = session.host.diagnostics.statuses();
    assert!(
        statuses.iter().any(|s| s.message.starts_with("Mismatched protocol version")),
        "no mismatch diagnostic in {statuses:?}"
    );
    assert!(statuses.iter().all(|s| s.name == "rosserial"));
    session.stop();
}

#[test]
fn corrupted_frame_is_dropped_and_the_next_one_dispatches() {
    let session =
        RunningSession::start(StaticTypes::new().with_message("std_msgs/String", STRING_MD5));

    session.harness.push_frame(ids::PUBLISHER, &chatter_info(125).encode());
    // The install has no observable side effect of its own; give the info
    // frame a moment to be consumed before corrupting the stream.
    std::thread::sleep(Duration::from_millis(50));

    let mut corrupted = rosserial_proto::encode(125, &[1, 2, 3], 0).unwrap();
    let last = corrupted.len() - 1;
    corrupted[last] = corrupted[last].wrapping_add(1);
    session.harness.push_bytes(corrupted);
    session.harness.push_frame(125, &[9]);

    wait_until("publication", WAIT, || !session.host.middleware.published().is_empty());
    assert_eq!(session.host.middleware.published(), [("chatter".to_string(), vec![9])]);
    session.stop();
}

#[test]
fn oversize_outbound_message_is_dropped_not_requeued() {
    let session =
        RunningSession::start(StaticTypes::new().with_message("std_msgs/String", STRING_MD5));

    // buffer_size 64 becomes the negotiated subscribe limit.
    let info = TopicInfo {
        topic_name: "cmd".to_string(),
        buffer_size: 64,
        ..chatter_info(126)
    };
    session.harness.push_frame(ids::SUBSCRIBER, &info.encode());
    wait_until("subscription", WAIT, || session.host.middleware.is_subscribed("cmd"));

    assert!(session.host.middleware.deliver("cmd", &[0u8; 100]));
    assert!(session.host.middleware.deliver("cmd", &[1]));

    let writes = session.harness.wait_for_writes(2, WAIT);
    assert_eq!(parse_frame(&writes[1]), (126, vec![1]));
    session.stop();
}

#[test]
fn config_defaults_match_the_protocol() {
    // Tests run with shrunk timeouts; the deployed defaults stay pinned.
    let defaults = rosserial_bridge::config::SessionConfig::default();
    assert_eq!(defaults.link_timeout, Duration::from_secs(5));
    assert_eq!(defaults.boot_grace, Duration::from_millis(100));
    assert_eq!(defaults.negotiate_delay, Duration::from_secs(2));
    assert_eq!(defaults.service_timeout, Duration::from_secs(30));
}
