// crates/hub-server/tests/hub_test.rs
mod common;

use std::time::Duration;

use bytes::BytesMut;
use common::{connect, eventually, start_hub, start_hub_with, test_config, Peer};
use hub_core::{Envelope, EnvelopeKind, HubError, UserId};
use hub_protocol::{encode_frame, FrameFormat};
use hub_server::{ConnectionHandle, ConnectionState, HubConfig};
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn send_to_user_reaches_only_that_users_connections() {
    let hub = start_hub(test_config());

    let (u1_first, mut u1_a) = connect(&hub, "u1").await;
    let (_u1_second, mut u1_b) = connect(&hub, "u1").await;
    let (_u2, mut u2) = connect(&hub, "u2").await;

    let attempted = hub
        .send_to_user(&UserId::from("u1"), Envelope::application("chat", json!("hi u1")))
        .await;
    assert_eq!(attempted, 2);

    let stats = hub.stats().await;
    assert_eq!(stats.unique_users, 2);
    assert_eq!(stats.total_connections, 3);

    assert_eq!(u1_a.recv().await.payload(), &json!("hi u1"));
    assert_eq!(u1_b.recv().await.payload(), &json!("hi u1"));

    // u2 must not see it: the next thing it gets is the broadcast below.
    hub.broadcast(Envelope::notice("marker")).unwrap();
    assert_eq!(u2.recv().await.kind(), &EnvelopeKind::Notice);

    assert!(hub.close_connection(u1_first.id()).await);
    eventually("u1 down to one connection", || {
        let hub = hub.clone();
        async move { hub.stats().await.connections_for(&UserId::from("u1")) == 1 }
    })
    .await;
    assert_eq!(hub.stats().await.total_connections, 2);

    hub.shutdown().await;
}

#[tokio::test]
async fn send_to_unknown_user_attempts_nothing() {
    let hub = start_hub(test_config());
    let (_conn, _peer) = connect(&hub, "u1").await;

    let attempted = hub
        .send_to_user(&UserId::from("ghost"), Envelope::notice("anyone?"))
        .await;
    assert_eq!(attempted, 0);

    hub.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_every_connection() {
    let hub = start_hub(test_config());

    let mut peers = Vec::new();
    for user in ["a", "a", "b", "c"] {
        peers.push(connect(&hub, user).await);
    }

    hub.broadcast(Envelope::application("news", json!({ "n": 1 })))
        .unwrap();

    for (_, peer) in peers.iter_mut() {
        let envelope = peer.recv().await;
        assert_eq!(envelope.kind(), &EnvelopeKind::Application("news".into()));
        assert_eq!(envelope.payload(), &json!({ "n": 1 }));
    }

    eventually("broadcast counted", || {
        let hub = hub.clone();
        async move { hub.counters().broadcasts == 1 }
    })
    .await;
    assert_eq!(hub.counters().connections_accepted, 4);

    let users: Vec<_> = hub.connected_user_ids().await.into_iter().collect();
    assert_eq!(
        users,
        vec![UserId::from("a"), UserId::from("b"), UserId::from("c")]
    );

    hub.shutdown().await;
}

#[tokio::test]
async fn slow_consumer_does_not_hold_up_others() {
    let config = HubConfig {
        outbound_queue_capacity: 8,
        write_deadline: Duration::from_secs(5),
        ..test_config()
    };
    let hub = start_hub(config);

    // The slow peer's pipe holds a few bytes and is never read, so its
    // write pump stalls and its queue fills up.
    let (server, _slow_client) = tokio::io::duplex(64);
    let slow = hub.accept(server, UserId::from("slow")).await.unwrap();
    let (_fast, mut fast) = connect(&hub, "fast").await;

    for n in 0..100 {
        hub.send_to_user(&UserId::from("slow"), Envelope::application("spam", json!(n)))
            .await;
    }
    assert!(slow.dropped() > 0);
    assert!(hub.counters().messages_dropped >= slow.dropped());
    assert_eq!(slow.state(), ConnectionState::Active);

    let attempted = hub
        .send_to_user(&UserId::from("fast"), Envelope::application("chat", json!("still here")))
        .await;
    assert_eq!(attempted, 1);
    assert_eq!(fast.recv().await.payload(), &json!("still here"));

    hub.shutdown().await;
}

#[tokio::test]
async fn inbound_envelopes_reach_the_handler_stamped_with_the_owner() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let hub = start_hub_with(
        test_config(),
        move |from: &ConnectionHandle, envelope: Envelope| {
            let _ = seen_tx.send((from.id(), envelope));
        },
    );

    let (handle, mut peer) = connect(&hub, "u1").await;
    peer.send(
        &Envelope::application("chat", json!("hello"))
            .with_id("c-1")
            .with_user(UserId::from("someone-else")),
    )
    .await;

    let (from, envelope) = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, handle.id());
    assert_eq!(envelope.kind(), &EnvelopeKind::Application("chat".into()));
    assert_eq!(envelope.id(), Some("c-1"));
    assert_eq!(envelope.user_id(), Some(&UserId::from("u1")));

    hub.shutdown().await;
}

#[tokio::test]
async fn keepalives_are_answered_not_forwarded() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Envelope>();
    let hub = start_hub_with(test_config(), move |_: &ConnectionHandle, envelope: Envelope| {
        let _ = seen_tx.send(envelope);
    });

    let (_handle, mut peer) = connect(&hub, "u1").await;
    peer.send(&Envelope::ping().with_id("k1")).await;

    let pong = peer.try_recv().await.unwrap();
    assert_eq!(pong.kind(), &EnvelopeKind::Pong);
    assert_eq!(pong.id(), Some("k1"));
    assert!(seen_rx.try_recv().is_err());

    hub.shutdown().await;
}

#[tokio::test]
async fn hub_pings_quiet_peers() {
    let config = HubConfig {
        keepalive_interval: Duration::from_millis(100),
        read_idle_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let hub = start_hub(config);
    let (_handle, mut peer) = connect(&hub, "u1").await;

    let ping = peer.try_recv().await.unwrap();
    assert_eq!(ping.kind(), &EnvelopeKind::Ping);

    hub.shutdown().await;
}

#[tokio::test]
async fn idle_peer_is_disconnected() {
    let config = HubConfig {
        keepalive_interval: Duration::from_millis(100),
        read_idle_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let hub = start_hub(config);
    let (handle, mut peer) = connect(&hub, "u1").await;

    // Never answer the pings.
    let seen = peer.drain_until_closed().await;
    assert_eq!(seen.last().map(|e| e.kind()), Some(&EnvelopeKind::Close));

    eventually("idle connection unregistered", || {
        let hub = hub.clone();
        async move { hub.stats().await.total_connections == 0 }
    })
    .await;
    eventually("idle connection closed", || {
        let handle = handle.clone();
        async move { handle.state() == ConnectionState::Closed }
    })
    .await;

    hub.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_closes_only_that_connection() {
    let hub = start_hub(test_config());
    let (bad, mut bad_peer) = connect(&hub, "bad").await;
    let (_good, mut good_peer) = connect(&hub, "good").await;

    let mut frame = BytesMut::new();
    frame.extend_from_slice(&5u32.to_be_bytes());
    frame.extend_from_slice(b"{nope");
    bad_peer.send_raw(&frame).await;
    bad_peer.drain_until_closed().await;

    eventually("bad connection unregistered", || {
        let hub = hub.clone();
        async move {
            let stats = hub.stats().await;
            stats.total_connections == 1 && stats.connections_for(&UserId::from("good")) == 1
        }
    })
    .await;
    assert!(bad.state() >= ConnectionState::Closing);

    hub.broadcast(Envelope::notice("still up")).unwrap();
    assert_eq!(good_peer.recv().await.kind(), &EnvelopeKind::Notice);

    hub.shutdown().await;
}

#[tokio::test]
async fn peer_close_unregisters() {
    let hub = start_hub(test_config());
    let (_handle, peer) = connect(&hub, "u1").await;
    let (_other, mut closing_peer) = connect(&hub, "u2").await;

    drop(peer);
    closing_peer.send(&Envelope::close("bye")).await;

    eventually("both connections gone", || {
        let hub = hub.clone();
        async move { hub.stats().await.total_connections == 0 }
    })
    .await;

    hub.shutdown().await;
}

#[tokio::test]
async fn disconnect_user_notifies_then_closes() {
    let hub = start_hub(test_config());
    let (_a, mut first) = connect(&hub, "kicked").await;
    let (_b, mut second) = connect(&hub, "kicked").await;
    let (_c, _bystander) = connect(&hub, "stays").await;

    let closed = hub
        .disconnect_user(&UserId::from("kicked"), "banned")
        .await;
    assert_eq!(closed, 2);

    for peer in [&mut first, &mut second] {
        let seen = peer.drain_until_closed().await;
        let kinds: Vec<_> = seen
            .iter()
            .map(|e| e.kind().clone())
            .filter(|k| !k.is_keepalive())
            .collect();
        assert_eq!(kinds, vec![EnvelopeKind::Notice, EnvelopeKind::Close]);
        assert_eq!(seen[0].payload(), &json!("banned"));
    }

    eventually("only the bystander is left", || {
        let hub = hub.clone();
        async move {
            let users: Vec<_> = hub.connected_user_ids().await.into_iter().collect();
            users == vec![UserId::from("stays")]
        }
    })
    .await;

    hub.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_everything_and_refuses_new_work() {
    let hub = start_hub(test_config());

    let mut conns = Vec::new();
    for user in ["u1", "u1", "u2"] {
        conns.push(connect(&hub, user).await);
    }

    let started = tokio::time::Instant::now();
    hub.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_eq!(hub.stats().await.total_connections, 0);
    for (handle, peer) in conns.iter_mut() {
        assert_eq!(handle.state(), ConnectionState::Closed);
        let seen = peer.drain_until_closed().await;
        assert_eq!(seen.last().map(|e| e.kind()), Some(&EnvelopeKind::Close));
    }

    let (server, _client) = tokio::io::duplex(1024);
    assert_eq!(
        hub.accept(server, UserId::from("late")).await.unwrap_err(),
        HubError::ShuttingDown
    );
    assert_eq!(
        hub.broadcast(Envelope::notice("late")).unwrap_err(),
        HubError::ShuttingDown
    );
}

#[tokio::test]
async fn dropping_the_last_hub_handle_closes_connections() {
    let hub = start_hub(test_config());
    let (handle, mut peer) = connect(&hub, "u1").await;

    let other = hub.clone();
    drop(hub);
    assert!(!handle.is_closing(), "a live clone keeps the hub running");

    drop(other);
    let seen = peer.drain_until_closed().await;
    assert_eq!(seen.last().map(|e| e.kind()), Some(&EnvelopeKind::Close));

    eventually("connection closed", || {
        let handle = handle.clone();
        async move { handle.state() == ConnectionState::Closed }
    })
    .await;
}

#[tokio::test]
async fn welcome_comes_before_racing_sends() {
    let hub = start_hub(test_config());

    let sender = {
        let hub = hub.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                hub.send_to_user(&UserId::from("racer"), Envelope::notice(&format!("n{}", i)))
                    .await;
                tokio::task::yield_now().await;
            }
        })
    };

    // `connect` asserts the first envelope is the welcome.
    for _ in 0..5 {
        let (handle, _peer) = connect(&hub, "racer").await;
        handle.close();
    }

    sender.await.unwrap();
    hub.shutdown().await;
}

#[tokio::test]
async fn shutdown_abandons_stuck_connections_after_grace() {
    let config = HubConfig {
        write_deadline: Duration::from_secs(10),
        shutdown_grace: Duration::from_millis(300),
        ..test_config()
    };
    let hub = start_hub(config);

    // A peer that never reads: its write pump is stuck mid-write.
    let (server, _stuck_client) = tokio::io::duplex(64);
    let stuck = hub.accept(server, UserId::from("stuck")).await.unwrap();
    for n in 0..20 {
        let _ = stuck.enqueue(Envelope::application("fill", json!(n)));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    hub.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(hub.stats().await.total_connections, 0);
}

#[tokio::test]
async fn pipelined_frames_after_accept_are_processed() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Envelope>();
    let hub = start_hub_with(test_config(), move |_: &ConnectionHandle, envelope: Envelope| {
        let _ = seen_tx.send(envelope);
    });

    let (server, client) = tokio::io::duplex(64 * 1024);
    let mut peer = Peer::new(client);

    // Write before the hub even knows about the connection.
    let mut frames = BytesMut::new();
    for n in 0..3 {
        encode_frame(
            FrameFormat::LengthPrefixed,
            &Envelope::application("early", json!(n)),
            &mut frames,
        )
        .unwrap();
    }
    peer.send_raw(&frames).await;

    hub.accept(server, UserId::from("u1")).await.unwrap();
    for n in 0..3 {
        let envelope = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload(), &json!(n));
    }

    hub.shutdown().await;
}
