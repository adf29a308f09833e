#![allow(unused_doc_comments)]

/**
 * tests/peer_link_e2e.rs
 *
 * Two live peer links pointed at each other: keep-alive exchange, stream
 * negotiation round trip, and return to steady state
 */

use keybridge::peer_link::{LinkConfig, LinkEvent, LinkHandle, PeerLink, SignalCode};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;

const EVENT_DEADLINE: Duration = Duration::from_secs(5);

fn test_config() -> LinkConfig {
    LinkConfig {
        heartbeat_interval: Duration::from_millis(50),
        timeout: Duration::from_secs(10),
    }
}

async fn linked_pair() -> (LinkHandle, LinkHandle) {
    let socket_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let socket_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = socket_a.local_addr().unwrap();
    let addr_b = socket_b.local_addr().unwrap();

    let (link_a, handle_a) = PeerLink::from_socket(socket_a, addr_b, test_config());
    let (link_b, handle_b) = PeerLink::from_socket(socket_b, addr_a, test_config());

    tokio::spawn(link_a.run());
    tokio::spawn(link_b.run());

    (handle_a, handle_b)
}

async fn next_event(handle: &mut LinkHandle) -> LinkEvent {
    time::timeout(EVENT_DEADLINE, handle.next_event())
        .await
        .expect("timed out waiting for a link event")
        .expect("link task ended unexpectedly")
}

/// Wait until `predicate` accepts an event, skipping keep-alive traffic.
async fn wait_for(handle: &mut LinkHandle, predicate: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
    loop {
        let event = next_event(handle).await;
        if predicate(&event) {
            return event;
        }
        assert!(
            matches!(event, LinkEvent::Pong { .. }),
            "unexpected event while waiting: {:?}",
            event
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keep_alive_round_trips() {
    let (mut handle_a, mut handle_b) = linked_pair().await;

    for _ in 0..3 {
        let event = wait_for(&mut handle_a, |e| matches!(e, LinkEvent::Pong { .. })).await;
        match event {
            LinkEvent::Pong { latency } => assert!(latency < EVENT_DEADLINE),
            _ => unreachable!(),
        }
    }
    wait_for(&mut handle_b, |e| matches!(e, LinkEvent::Pong { .. })).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_request_is_acknowledged_on_both_sides() {
    let (mut handle_a, mut handle_b) = linked_pair().await;

    // Let the links settle into the keep-alive exchange first
    wait_for(&mut handle_a, |e| matches!(e, LinkEvent::Pong { .. })).await;

    handle_a.command(SignalCode::StreamRequest).await.unwrap();

    // The responder observes the request and the ack it sent back
    let signal = wait_for(&mut handle_b, |e| matches!(e, LinkEvent::Signal { .. })).await;
    assert_eq!(
        signal,
        LinkEvent::Signal {
            received: SignalCode::StreamRequest,
            acked_with: SignalCode::AckStreamRequest,
        }
    );

    // The requester observes the ack and drops back to steady state
    let acked = wait_for(&mut handle_a, |e| matches!(e, LinkEvent::Acked(_))).await;
    assert_eq!(acked, LinkEvent::Acked(SignalCode::AckStreamRequest));

    // Steady state again: nothing but keep-alive traffic on either side
    for _ in 0..3 {
        wait_for(&mut handle_a, |e| matches!(e, LinkEvent::Pong { .. })).await;
        wait_for(&mut handle_b, |e| matches!(e, LinkEvent::Pong { .. })).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_and_reject_negotiations_complete() {
    let (mut handle_a, mut handle_b) = linked_pair().await;

    handle_b.command(SignalCode::StreamAccept).await.unwrap();
    let signal = wait_for(&mut handle_a, |e| matches!(e, LinkEvent::Signal { .. })).await;
    assert_eq!(
        signal,
        LinkEvent::Signal {
            received: SignalCode::StreamAccept,
            acked_with: SignalCode::AckStreamAccept,
        }
    );
    let acked = wait_for(&mut handle_b, |e| matches!(e, LinkEvent::Acked(_))).await;
    assert_eq!(acked, LinkEvent::Acked(SignalCode::AckStreamAccept));

    handle_b.command(SignalCode::StreamReject).await.unwrap();
    let signal = wait_for(&mut handle_a, |e| matches!(e, LinkEvent::Signal { .. })).await;
    assert_eq!(
        signal,
        LinkEvent::Signal {
            received: SignalCode::StreamReject,
            acked_with: SignalCode::AckStreamReject,
        }
    );
    let acked = wait_for(&mut handle_b, |e| matches!(e, LinkEvent::Acked(_))).await;
    assert_eq!(acked, LinkEvent::Acked(SignalCode::AckStreamReject));
}
