//! Session Lifecycle and Key Exchange Tests
//!
//! Drive a session against in-memory signaling and transport doubles with
//! tokio's clock paused.

mod common;

use common::{key_recipients, peer, test_config, Harness};
use serde_json::json;
use sfu_client::{SessionState, SfuClientError};
use sfu_types::TermCode;
use std::time::Duration;

fn users(recipients: &[(u64, String)]) -> Vec<(u64, &str)> {
    recipients.iter().map(|(cid, user)| (*cid, user.as_str())).collect()
}

#[tokio::test(start_paused = true)]
async fn test_join_sends_initial_key_to_listed_participants() {
    let mut h = Harness::start(test_config());
    let (mut server, join) = h.join(7, json!([peer(10, "alice"), peer(11, "bob")])).await;

    assert!(join.get("cid").is_none());
    let ivs = join["ivs"].as_object().unwrap();
    assert_eq!(ivs.len(), 3);
    for mid in ["0", "1", "2"] {
        assert_eq!(ivs[mid].as_str().unwrap().len(), 16);
    }

    let key = server.expect("KEY").await;
    assert_eq!(key["id"], 0);
    assert_eq!(
        users(&key_recipients(&key)),
        vec![(10, "alice"), (11, "bob")]
    );

    h.wait_for_state(SessionState::Joined).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.cid, Some(7));
    let cids: Vec<u32> = snapshot.peers.iter().map(|p| p.cid).collect();
    assert_eq!(cids, vec![10, 11]);

    let transport = h.transports.created.lock().unwrap()[0].clone();
    assert!(transport.remote.lock().unwrap().is_some());

    let events = h.observer.events();
    assert_eq!(&events[..3], &["connecting", "connected", "joined"]);
}

#[tokio::test(start_paused = true)]
async fn test_first_join_resends_newest_key_then_joins_rotate() {
    let mut h = Harness::start(test_config());
    let (mut server, _) = h.join(7, json!([peer(10, "alice")])).await;
    assert_eq!(server.expect("KEY").await["id"], 0);

    server.push(json!({"a": "PEERJOIN", "cid": 11, "userId": "bob", "av": 0}));
    let key = server.expect("KEY").await;
    assert_eq!(key["id"], 0);
    assert_eq!(users(&key_recipients(&key)), vec![(11, "bob")]);

    server.push(json!({"a": "PEERJOIN", "cid": 12, "userId": "carol", "av": 0}));
    let key = server.expect("KEY").await;
    assert_eq!(key["id"], 1);
    assert_eq!(
        users(&key_recipients(&key)),
        vec![(10, "alice"), (11, "bob"), (12, "carol")]
    );
    assert!(h.observer.events().contains(&"peer_joined:12".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_departure_rotates_and_quick_rejoin_resends() {
    let mut h = Harness::start(test_config());
    let (mut server, _) = h.join(7, json!([peer(10, "alice"), peer(11, "bob")])).await;
    assert_eq!(server.expect("KEY").await["id"], 0);

    server.push(json!({"a": "PEERLEFT", "cid": 11}));
    let key = server.expect("KEY").await;
    assert_eq!(key["id"], 1);
    assert_eq!(users(&key_recipients(&key)), vec![(10, "alice")]);

    server.push(json!({"a": "PEERJOIN", "cid": 13, "userId": "bob", "av": 0}));
    let key = server.expect("KEY").await;
    assert_eq!(key["id"], 1);
    assert_eq!(users(&key_recipients(&key)), vec![(13, "bob")]);

    let events = h.observer.events();
    let left = format!("peer_left:11:{}", TermCode::SIGNALING_DISCONNECT.code());
    assert!(events.contains(&left));
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_window_rotates() {
    let mut h = Harness::start(test_config());
    let (mut server, _) = h.join(7, json!([peer(10, "alice"), peer(11, "bob")])).await;
    assert_eq!(server.expect("KEY").await["id"], 0);

    server.push(json!({"a": "PEERLEFT", "cid": 11, "rsn": 0}));
    assert_eq!(server.expect("KEY").await["id"], 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    server.push(json!({"a": "PEERJOIN", "cid": 12, "userId": "bob", "av": 0}));
    let key = server.expect("KEY").await;
    assert_eq!(key["id"], 2);
    assert_eq!(
        users(&key_recipients(&key)),
        vec![(10, "alice"), (12, "bob")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_last_participant_leaving_sends_no_key() {
    let mut h = Harness::start(test_config());
    let (mut server, _) = h.join(7, json!([peer(10, "alice")])).await;
    assert_eq!(server.expect("KEY").await["id"], 0);

    server.push(json!({"a": "PEERLEFT", "cid": 10}));
    server.assert_no("KEY", Duration::from_secs(2)).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.peers.is_empty());
    assert_eq!(snapshot.state, SessionState::Joined);
}

#[tokio::test(start_paused = true)]
async fn test_messages_before_answer_are_held() {
    let mut h = Harness::start(test_config());
    h.handle.connect().await.unwrap();
    let mut server = h.next_server().await;
    let join = server.expect("JOIN").await;

    server.push(json!({"a": "PEERJOIN", "cid": 11, "userId": "bob", "av": 0}));
    server.answer(&join, 7, json!([]));

    let key = server.expect("KEY").await;
    assert_eq!(key["id"], 0);
    assert_eq!(users(&key_recipients(&key)), vec![(11, "bob")]);
    let events = h.observer.events();
    let joined = events.iter().position(|e| e == "joined").unwrap();
    let peer_joined = events.iter().position(|e| e == "peer_joined:11").unwrap();
    assert!(joined < peer_joined);
}

#[tokio::test(start_paused = true)]
async fn test_retriable_termination_reconnects_with_previous_cid() {
    let mut h = Harness::start(test_config());
    let (server, _) = h.join(7, json!([])).await;
    h.wait_for_state(SessionState::Joined).await;

    server.push(json!({"err": TermCode::SIGNALING_DISCONNECT.code()}));
    let mut second = h.next_server().await;
    let join = second.expect("JOIN").await;
    assert_eq!(join["cid"], 7);

    let retry = format!("disconnect:{}:true", TermCode::SIGNALING_DISCONNECT.code());
    assert!(h.observer.events().contains(&retry));
    let first = h.transports.created.lock().unwrap()[0].clone();
    assert!(*first.closed.lock().unwrap());

    second.answer(&join, 8, json!([]));
    h.wait_for_state(SessionState::Joined).await;
    assert_eq!(h.handle.snapshot().await.unwrap().cid, Some(8));
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_reconnects() {
    let mut h = Harness::start(test_config());
    let (_server, _) = h.join(7, json!([])).await;
    h.wait_for_state(SessionState::Joined).await;

    let transport = h.transports.created.lock().unwrap()[0].clone();
    transport.fail();

    let mut second = h.next_server().await;
    assert_eq!(second.expect("JOIN").await["cid"], 7);
    let retry = format!("disconnect:{}:true", TermCode::RTC_DISCONNECT.code());
    assert!(h.observer.events().contains(&retry));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_termination_does_not_reconnect() {
    let mut h = Harness::start(test_config());
    let (server, _) = h.join(7, json!([])).await;
    h.wait_for_state(SessionState::Joined).await;

    server.push(json!({"err": TermCode::SFU_SHUTTING_DOWN.code(), "msg": "maintenance"}));
    h.wait_for_state(SessionState::Disconnected).await;
    h.no_connection_within(Duration::from_secs(3)).await;

    let fatal = format!("disconnect:{}:false", TermCode::SFU_SHUTTING_DOWN.code());
    assert_eq!(h.observer.events().last(), Some(&fatal));
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_sends_bye() {
    let mut h = Harness::start(test_config());
    let (mut server, _) = h.join(7, json!([peer(10, "alice")])).await;
    h.wait_for_state(SessionState::Joined).await;

    h.handle.disconnect(TermCode::USER_HANGUP).await.unwrap();
    let bye = server.expect("BYE").await;
    assert_eq!(bye["rsn"], 0);
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert_eq!(h.observer.events().last(), Some(&"disconnect:0:false".to_string()));
    assert!(h.handle.snapshot().await.unwrap().peers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let mut h = Harness::start(test_config());
    let (server, _) = h.join(7, json!([])).await;
    h.wait_for_state(SessionState::Joined).await;

    h.connector.refuse(true);
    server.push(json!({"err": TermCode::SIGNALING_DISCONNECT.code()}));
    // the immediate retry fails; the next one is due after a step
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle.state(), SessionState::RetryingDisconnected);

    h.handle.disconnect(TermCode::USER_HANGUP).await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    h.connector.refuse(false);
    h.no_connection_within(Duration::from_secs(3)).await;
    assert_eq!(h.observer.events().last(), Some(&"disconnect:0:false".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_server_warning_keeps_session() {
    let mut h = Harness::start(test_config());
    let (server, _) = h.join(7, json!([])).await;
    h.wait_for_state(SessionState::Joined).await;

    server.push(json!({"warn": "bandwidth limited"}));
    server.push(json!({"a": "FUTURE_THING"}));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Joined);
    assert!(h
        .observer
        .events()
        .contains(&"warning:bandwidth limited".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_joined_is_rejected() {
    let mut h = Harness::start(test_config());
    let _server = h.join(7, json!([])).await;
    h.wait_for_state(SessionState::Joined).await;

    let err = h.handle.connect().await.unwrap_err();
    assert!(matches!(err, SfuClientError::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_video_requests_require_joined() {
    let mut h = Harness::start(test_config());
    let err = h.handle.request_thumbnail(10).await.unwrap_err();
    assert!(matches!(err, SfuClientError::InvalidState { .. }));

    let (mut server, _) = h.join(7, json!([peer(10, "alice")])).await;
    h.wait_for_state(SessionState::Joined).await;
    h.handle.request_thumbnail(10).await.unwrap();
    let request = server.expect("GET_VTHUMBS").await;
    assert_eq!(request["cids"], json!([10]));

    let err = h.handle.request_thumbnail(99).await.unwrap_err();
    assert!(matches!(err, SfuClientError::UnknownPeer { cid: 99 }));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_track_keys_are_skipped() {
    let mut h = Harness::start(test_config());
    h.handle.connect().await.unwrap();
    let mut server = h.next_server().await;
    let join = server.expect("JOIN").await;

    server.push(json!({
        "a": "ANSWER",
        "cid": 7,
        "sdp": join["sdp"].clone(),
        "peers": [peer(10, "alice")],
        "vthumbs": {"bogus": {"mid": 0, "iv": "0001020304050607"}},
        "speakers": {
            "bogus": {"audio": {"mid": 2, "iv": "0001020304050607"}},
            "10": {"audio": {"mid": 2, "iv": "1011121314151617"}}
        }
    }));
    h.wait_for_state(SessionState::Joined).await;
    server.push(json!({"a": "VTHUMBS", "tracks": {"x1": {"mid": 1, "iv": "0001020304050607"}}}));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Joined);
    assert!(snapshot.peers[0].is_speaker);
    assert!(!h.observer.events().iter().any(|e| e.starts_with("disconnect")));
}

#[tokio::test(start_paused = true)]
async fn test_superseded_key_is_never_activated() {
    let mut h = Harness::start(test_config());
    let (mut server, _) = h
        .join(7, json!([peer(10, "alice"), peer(11, "bob"), peer(12, "carol")]))
        .await;
    assert_eq!(server.expect("KEY").await["id"], 0);
    let transport = h.transports.created.lock().unwrap()[0].clone();
    assert_eq!(transport.sent_key_id(), Some(0));

    server.push(json!({"a": "PEERLEFT", "cid": 11}));
    assert_eq!(server.expect("KEY").await["id"], 1);
    tokio::time::sleep(Duration::from_millis(60)).await;
    server.push(json!({"a": "PEERLEFT", "cid": 12}));
    assert_eq!(server.expect("KEY").await["id"], 2);

    // the first key's activation time has passed; it was superseded
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(transport.sent_key_id(), Some(0));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent_key_id(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_answer_ends_session_with_sdp_error() {
    let mut h = Harness::start(test_config());
    h.transports.reject_remote(true);
    let _server = h.join(7, json!([])).await;

    h.wait_for_state(SessionState::Disconnected).await;
    h.no_connection_within(Duration::from_secs(3)).await;
    let events = h.observer.events();
    assert!(!events.contains(&"joined".to_string()));
    let fatal = format!("disconnect:{}:false", TermCode::ERR_SDP.code());
    assert_eq!(events.last(), Some(&fatal));
}
