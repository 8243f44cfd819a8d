//! End-to-end session behaviour against the in-memory SFU

mod common;

use common::{connect, connect_with, eventually, test_config};
use serde_json::json;
use std::sync::Arc;

use huddle_session::signaling::message;
use huddle_session::testing::{MockSfu, MockSfuOptions};
use huddle_session::{
    ConsumerHandle, Error, JoinOptions, JoinTarget, MediaKind, MediaSource, ProducerHandle,
    ProducerId, ProducerSlot, QualityAction, Session, SessionEvent, SessionResources,
    SessionState, TransportConnectionState, TransportDirection, TransportStats,
};

#[tokio::test]
async fn test_join_consumes_existing_producer() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    sfu.add_remote_producer("r1", "p1", "u2", "c2", MediaKind::Audio, MediaSource::Audio);

    let mut client = connect(&sfu, "u1").await;
    let report = client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::default())
        .await
        .unwrap();
    assert_eq!(report.room_id.as_str(), "r1");
    assert!(!report.already_joined);
    assert!(report.local_media.audio && report.local_media.video);
    assert_eq!(client.session.state(), SessionState::Joined);

    let SessionEvent::StreamAdded(stream) = client
        .expect_event(|e| matches!(e, SessionEvent::StreamAdded(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(stream.key.as_str(), "c2");
    assert_eq!(stream.user_id.as_str(), "u2");
    assert_eq!(stream.source, MediaSource::Audio);
    assert_eq!(stream.kind(), MediaKind::Audio);
    assert!(stream.stream.audio_track().is_some());

    assert_eq!(sfu.consumed_by(&client.connection_id), vec![ProducerId::from("p1")]);
    assert_eq!(sfu.produced_by(&client.connection_id).len(), 2);
    assert_eq!(
        client.session.resources(),
        SessionResources {
            producers: 2,
            consumers: 1,
            transports: 2,
            local_tracks: 2,
            streams: 1,
        }
    );

    let sent: Vec<String> = sfu
        .received_from(&client.connection_id)
        .into_iter()
        .map(|e| e.message_type)
        .filter(|t| t != message::PING)
        .collect();
    assert_eq!(sent[0], message::JOIN);
    // each transport connects once, on first use
    assert_eq!(sent.iter().filter(|t| *t == message::CONNECT_TRANSPORT).count(), 2);

    client.session.shutdown().await;
}

async fn layout_after_join(announce_before_transports: bool) -> (usize, Vec<(String, usize)>) {
    let sfu = MockSfu::start(MockSfuOptions {
        announce_before_transports,
        ..Default::default()
    });
    sfu.add_remote_producer("r1", "p1", "u2", "c2", MediaKind::Audio, MediaSource::Audio);
    sfu.add_remote_producer("r1", "p2", "u2", "c2", MediaKind::Video, MediaSource::Camera);
    sfu.add_remote_producer("r1", "p3", "u3", "c3", MediaKind::Video, MediaSource::Screen);

    let client = connect(&sfu, "u1").await;
    let report = client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();
    eventually("every producer consumed", || client.session.resources().consumers == 3).await;

    let layout = client
        .session
        .streams()
        .iter()
        .map(|s| (s.key.as_str().to_string(), s.stream.len()))
        .collect();
    client.session.shutdown().await;
    (report.drained_announcements, layout)
}

#[tokio::test]
async fn test_early_announcements_are_replayed_in_order() {
    let (drained, buffered) = layout_after_join(true).await;
    assert_eq!(drained, 3);

    let (_, live) = layout_after_join(false).await;
    assert_eq!(buffered, live);
    assert_eq!(
        buffered,
        vec![("c2".to_string(), 2), ("c3:screen".to_string(), 1)]
    );
}

#[tokio::test]
async fn test_tabs_of_one_user_are_separate_peers() {
    let sfu = MockSfu::start(MockSfuOptions {
        echo_own_producers: true,
        ..Default::default()
    });
    let tab_a = connect(&sfu, "u1").await;
    let tab_b = connect(&sfu, "u1").await;
    assert_ne!(tab_a.connection_id, tab_b.connection_id);

    tab_a
        .session
        .join(JoinTarget::room("r1"), JoinOptions::default())
        .await
        .unwrap();
    assert_eq!(sfu.produced_by(&tab_a.connection_id).len(), 2);

    tab_b
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();
    eventually("second tab consumes the first", || {
        tab_b.session.resources().consumers == 2
    })
    .await;

    let streams = tab_b.session.streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].key.as_str(), tab_a.connection_id.as_str());
    assert_eq!(streams[0].user_id.as_str(), "u1");
    assert_eq!(streams[0].stream.len(), 2);

    // echoes of its own producers never loop back into the producing tab
    assert!(sfu.consumed_by(&tab_a.connection_id).is_empty());
    assert!(tab_a.session.streams().is_empty());

    tab_a.session.shutdown().await;
    tab_b.session.shutdown().await;
}

#[tokio::test]
async fn test_leave_releases_everything_and_is_idempotent() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let mut alice = connect(&sfu, "u1").await;
    let mut bob = connect(&sfu, "u2").await;

    alice.session.leave().await.unwrap();
    assert!(sfu.received_of_type(message::LEAVE).is_empty());

    alice
        .session
        .join(JoinTarget::room("r1"), JoinOptions::default())
        .await
        .unwrap();
    bob.session
        .join(
            JoinTarget::room("r1"),
            JoinOptions {
                audio: true,
                video: false,
            },
        )
        .await
        .unwrap();
    eventually("bob sees alice", || bob.session.resources().consumers == 2).await;
    eventually("alice sees bob", || alice.session.resources().consumers == 1).await;

    // bob talks, so alice has an active speaker when she leaves
    let bob_audio = alice.engine.consumers()[0].track().id().to_string();
    alice.audio.set_level(&bob_audio, 200);
    let bob_key = bob.connection_id.as_str().to_string();
    alice
        .expect_event(|e| {
            matches!(e, SessionEvent::ActiveSpeakerChanged(Some(k)) if k.as_str() == bob_key)
        })
        .await;

    let (first, second) = tokio::join!(alice.session.leave(), alice.session.leave());
    first.unwrap();
    second.unwrap();
    alice.session.leave().await.unwrap();

    assert_eq!(alice.session.state(), SessionState::Idle);
    assert_eq!(alice.session.session(), Session::default());
    assert_eq!(alice.session.resources(), SessionResources::default());
    assert_eq!(alice.engine.open_transports(), 0);
    assert_eq!(alice.devices.live_tracks(), 0);
    assert!(alice.engine.producers().iter().all(|p| p.is_closed()));
    alice
        .expect_event(|e| matches!(e, SessionEvent::ActiveSpeakerChanged(None)))
        .await;
    assert_eq!(alice.session.active_speaker(), None);

    let leaves: Vec<_> = sfu
        .received_of_type(message::LEAVE)
        .into_iter()
        .filter(|(conn, _)| conn == &alice.connection_id)
        .collect();
    assert_eq!(leaves.len(), 1);
    // teardown closes producers locally, the server cleans up on leave
    assert!(sfu.received_of_type(message::PRODUCER_CLOSE).is_empty());

    let alice_key = alice.connection_id.as_str().to_string();
    bob.expect_event(|e| matches!(e, SessionEvent::StreamRemoved(k) if k.as_str() == alice_key))
        .await;
    assert!(bob.session.streams().is_empty());
    assert!(bob.engine.consumers().iter().all(|c| c.is_closed()));

    bob.session.shutdown().await;
    alice.session.shutdown().await;
}

#[tokio::test]
async fn test_mute_and_video_toggle_round_trip() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let client = connect(&sfu, "u1").await;
    assert!(matches!(client.session.toggle_mute(), Err(Error::NotJoined)));

    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::default())
        .await
        .unwrap();
    let producers = client.engine.producers();
    let audio = producers.iter().find(|p| p.kind() == MediaKind::Audio).unwrap();
    let video = producers.iter().find(|p| p.kind() == MediaKind::Video).unwrap();

    assert!(client.session.toggle_mute().unwrap());
    assert!(audio.is_paused());
    assert!(!audio.track().is_enabled());
    assert!(client.session.local_media().unwrap().muted);

    assert!(!client.session.toggle_mute().unwrap());
    assert!(!audio.is_paused());
    assert!(audio.track().is_enabled());

    assert!(!client.session.toggle_video().unwrap());
    assert!(video.is_paused());
    assert!(!client.session.local_media().unwrap().video_enabled);
    assert!(client.session.toggle_video().unwrap());
    assert!(client.session.local_media().unwrap().video_enabled);

    client.session.shutdown().await;
}

#[tokio::test]
async fn test_toggle_without_local_media() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let client = connect(&sfu, "u1").await;
    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();

    assert!(matches!(
        client.session.toggle_mute(),
        Err(Error::NoLocalTrack(ProducerSlot::Audio))
    ));
    assert!(matches!(
        client.session.toggle_video(),
        Err(Error::NoLocalTrack(ProducerSlot::Video))
    ));
    client.session.shutdown().await;
}

#[tokio::test]
async fn test_screen_share_ended_by_the_system() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let mut alice = connect(&sfu, "u1").await;
    let mut bob = connect(&sfu, "u2").await;
    for client in [&alice, &bob] {
        client
            .session
            .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
            .await
            .unwrap();
    }

    let producer_id = alice.session.start_screen_share().await.unwrap();
    assert!(alice.session.local_media().unwrap().screen_sharing);

    let screen_key = format!("{}:screen", alice.connection_id);
    bob.expect_event(|e| matches!(e, SessionEvent::StreamAdded(s) if s.key.as_str() == screen_key))
        .await;

    alice.devices.last_display_track().unwrap().end();
    alice
        .expect_event(|e| matches!(e, SessionEvent::ScreenShareEnded { external: true }))
        .await;

    eventually("producer_close after the system ended the share", || {
        sfu.received_of_type(message::PRODUCER_CLOSE).len() == 1
    })
    .await;
    let closes = sfu.received_of_type(message::PRODUCER_CLOSE);
    assert_eq!(closes[0].1.data["producer_id"], producer_id.as_str());
    assert_eq!(closes[0].1.data["room_id"], "r1");
    assert!(!alice.session.local_media().unwrap().screen_sharing);

    bob.expect_event(|e| matches!(e, SessionEvent::StreamRemoved(k) if k.as_str() == screen_key))
        .await;

    // an explicit stop takes the same path
    alice.session.start_screen_share().await.unwrap();
    alice.session.stop_screen_share().unwrap();
    alice
        .expect_event(|e| matches!(e, SessionEvent::ScreenShareEnded { external: false }))
        .await;
    eventually("producer_close after the explicit stop", || {
        sfu.received_of_type(message::PRODUCER_CLOSE).len() == 2
    })
    .await;

    alice.session.shutdown().await;
    bob.session.shutdown().await;
}

#[tokio::test]
async fn test_join_policy() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let client = connect(&sfu, "u1").await;

    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();
    let again = client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();
    assert!(again.already_joined);
    assert_eq!(sfu.received_of_type(message::JOIN).len(), 1);

    match client
        .session
        .join(JoinTarget::room("r2"), JoinOptions::WITHOUT_MEDIA)
        .await
    {
        Err(Error::AlreadyJoined { current }) => assert_eq!(current.as_str(), "r1"),
        other => panic!("unexpected: {other:?}"),
    }
    client.session.leave().await.unwrap();

    // a join the server never answers
    sfu.ignore(message::JOIN);
    let pending = tokio::spawn({
        let session = client.session.clone();
        async move {
            session
                .join(JoinTarget::room("r2"), JoinOptions::WITHOUT_MEDIA)
                .await
        }
    });
    eventually("join in flight", || client.session.state() == SessionState::Joining).await;
    assert!(matches!(
        client
            .session
            .join(JoinTarget::room("r2"), JoinOptions::WITHOUT_MEDIA)
            .await,
        Err(Error::JoinInProgress)
    ));

    client.session.leave().await.unwrap();
    assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(client.session.state(), SessionState::Idle);
    assert_eq!(client.engine.open_transports(), 0);

    client.session.shutdown().await;
}

#[tokio::test]
async fn test_join_timeout_cleans_up() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    sfu.ignore(message::JOIN);
    let mut config = test_config();
    config.session.join_timeout_ms = 100;
    let client = connect_with(&sfu, "u1", config).await;

    let err = client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SignalingTimeout { .. }));
    assert_eq!(client.session.state(), SessionState::Idle);
    assert_eq!(client.engine.open_transports(), 0);
    assert_eq!(client.devices.user_media_calls(), 0);
    eventually("leave sent after the failed join", || {
        sfu.received_of_type(message::LEAVE).len() == 1
    })
    .await;

    // the failure leaves the coordinator ready for another attempt
    sfu.set_options(MockSfuOptions::default());
    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();
    assert_eq!(client.session.state(), SessionState::Joined);
    client.session.shutdown().await;
}

#[tokio::test]
async fn test_leave_during_device_prompt() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let client = connect(&sfu, "u1").await;
    client.devices.hang_user_media(true);

    let join = {
        let session = Arc::clone(&client.session);
        tokio::spawn(async move {
            session
                .join(JoinTarget::room("r1"), JoinOptions::default())
                .await
        })
    };
    eventually("the device prompt is pending", || {
        client.devices.user_media_calls() == 1
    })
    .await;

    tokio::time::timeout(common::WAIT, client.session.leave())
        .await
        .expect("leave waited on the device prompt")
        .unwrap();
    let joined = tokio::time::timeout(common::WAIT, join).await.unwrap().unwrap();
    assert!(matches!(joined, Err(Error::Cancelled)));

    assert_eq!(client.session.state(), SessionState::Idle);
    assert_eq!(client.session.resources(), SessionResources::default());
    assert_eq!(client.engine.open_transports(), 0);
    assert_eq!(client.devices.live_tracks(), 0);
    eventually("leave reaches the server", || {
        sfu.received_of_type(message::LEAVE).len() == 1
    })
    .await;
    client.session.shutdown().await;
}

#[tokio::test]
async fn test_remote_producer_and_peer_lifecycle() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let mut client = connect(&sfu, "u1").await;
    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();

    sfu.add_remote_producer("r1", "p1", "u2", "c2", MediaKind::Audio, MediaSource::Audio);
    sfu.add_remote_producer("r1", "p2", "u2", "c2", MediaKind::Video, MediaSource::Camera);
    sfu.add_remote_producer("r1", "p3", "u2", "c2", MediaKind::Video, MediaSource::Screen);
    eventually("three consumers", || client.session.resources().consumers == 3).await;
    assert_eq!(client.stream_keys(), vec!["c2", "c2:screen"]);

    sfu.close_remote_producer("p3");
    client
        .expect_event(|e| matches!(e, SessionEvent::StreamRemoved(k) if k.as_str() == "c2:screen"))
        .await;

    sfu.close_remote_producer("p2");
    let SessionEvent::StreamUpdated(updated) = client
        .expect_event(|e| matches!(e, SessionEvent::StreamUpdated(s) if s.key.as_str() == "c2"))
        .await
    else {
        unreachable!()
    };
    assert!(updated.stream.video_track().is_none());
    assert!(updated.stream.audio_track().is_some());
    // the emptied camera stream is kept until the peer leaves
    assert_eq!(client.stream_keys(), vec!["c2"]);

    sfu.remove_remote_peer("r1", "u2", "c2");
    client
        .expect_event(|e| matches!(e, SessionEvent::StreamRemoved(k) if k.as_str() == "c2"))
        .await;
    assert!(client.session.streams().is_empty());
    assert!(client.engine.consumers().iter().all(|c| c.is_closed()));

    client.session.shutdown().await;
}

#[tokio::test]
async fn test_announcements_without_connection_id_key_by_user() {
    let sfu = MockSfu::start(MockSfuOptions {
        omit_connection_ids: true,
        ..Default::default()
    });
    let mut client = connect(&sfu, "u1").await;
    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();

    sfu.add_remote_producer("r1", "p1", "u2", "c2", MediaKind::Audio, MediaSource::Audio);
    eventually("consumed", || client.session.resources().consumers == 1).await;
    assert_eq!(client.stream_keys(), vec!["u2"]);

    sfu.remove_remote_peer("r1", "u2", "c2");
    client
        .expect_event(|e| matches!(e, SessionEvent::StreamRemoved(k) if k.as_str() == "u2"))
        .await;
    client.session.shutdown().await;
}

#[tokio::test]
async fn test_room_closed_by_server_leaves() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let mut client = connect(&sfu, "u1").await;
    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::default())
        .await
        .unwrap();

    // closing some other room is not ours to act on
    sfu.push(&client.connection_id, message::ROOM_CLOSED, json!({ "room_id": "r9" }));
    sfu.close_room("r1");

    let SessionEvent::RoomClosed(room_id) = client
        .expect_event(|e| matches!(e, SessionEvent::RoomClosed(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(room_id.as_str(), "r1");

    eventually("back to idle", || client.session.state() == SessionState::Idle).await;
    assert_eq!(client.engine.open_transports(), 0);
    assert_eq!(client.devices.live_tracks(), 0);
    client.session.shutdown().await;
}

#[tokio::test]
async fn test_failed_transport_is_reported_not_torn_down() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let mut client = connect(&sfu, "u1").await;
    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::default())
        .await
        .unwrap();

    let send = client.engine.transport(TransportDirection::Send).unwrap();
    send.set_stats(TransportStats {
        rtt_ms: Some(350),
        packets_sent: 1000,
        packets_received: 4,
        packets_lost: 300,
        available_bitrate_kbps: Some(250),
        selected_candidate_pair: Some("host/udp -> relay/udp".to_string()),
        ..Default::default()
    });
    send.set_state(TransportConnectionState::Failed);

    let SessionEvent::TransportDegraded { direction, health } = client
        .expect_event(|e| matches!(e, SessionEvent::TransportDegraded { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(direction, TransportDirection::Send);
    assert_eq!(health.state, TransportConnectionState::Failed);
    assert!((health.packet_loss_rate - 0.3).abs() < 1e-6);
    assert_eq!(health.quality_score, 0);
    assert_eq!(health.quality_action, QualityAction::AudioOnly);
    assert_eq!(health.selected_candidate_pair.as_deref(), Some("host/udp -> relay/udp"));

    assert_eq!(client.session.state(), SessionState::Joined);
    assert_eq!(client.session.resources().transports, 2);
    client.session.shutdown().await;
}

#[tokio::test]
async fn test_failed_consume_does_not_block_later_announcements() {
    let sfu = MockSfu::start(MockSfuOptions::default());
    let mut client = connect(&sfu, "u1").await;
    client
        .session
        .join(JoinTarget::room("r1"), JoinOptions::WITHOUT_MEDIA)
        .await
        .unwrap();

    sfu.push(
        &client.connection_id,
        message::NEW_PRODUCER,
        json!({ "producer_id": "ghost", "user_id": "u9", "connection_id": "c9", "kind": "audio" }),
    );
    sfu.add_remote_producer("r1", "p1", "u2", "c2", MediaKind::Audio, MediaSource::Audio);

    let SessionEvent::ServerError(reason) = client
        .expect_event(|e| matches!(e, SessionEvent::ServerError(_)))
        .await
    else {
        unreachable!()
    };
    assert!(reason.contains("not found"));

    eventually("the next producer is consumed", || {
        client.session.resources().consumers == 1
    })
    .await;
    assert_eq!(client.stream_keys(), vec!["c2"]);
    assert_eq!(
        sfu.consumed_by(&client.connection_id),
        vec![ProducerId::from("ghost"), ProducerId::from("p1")]
    );
    client.session.shutdown().await;
}
