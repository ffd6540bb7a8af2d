// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end endpoint scenarios: loopback echo, backpressure retry, late
// receive posting, expected-send matching in both arrival orderings, and
// disconnect cleanup. Each drives the real send/recv/progress surface
// rather than poking at internal state directly.

#![cfg(unix)]

use shm_endpoint::config::EndpointOptions;
use shm_endpoint::operation::{CompletionResult, OpKind, Operation};
use shm_endpoint::Endpoint;

fn op(kind: OpKind) -> Operation {
    Operation::new(kind)
}

#[test]
fn loopback_echo_completes_self_send_and_self_recv() {
    let ep = Endpoint::open(true, EndpointOptions::default()).unwrap();
    let dest = ep.source;

    let send_op = op(OpKind::SendUnexpected);
    send_op.begin_submit(std::ptr::null_mut(), 0, 7);
    let payload = b"hello world";
    ep.send_unexpected(dest, payload, 7, &send_op).unwrap();
    assert!(send_op.is_completed());
    assert_eq!(send_op.result, Some(CompletionResult::Ok));

    // Nothing is parked for a receive yet, so the message sits in the
    // loopback ring until a progress tick drains it into the
    // unexpected-message queue.
    ep.progress_nonblocking().unwrap();

    let mut buf = [0u8; 32];
    let recv_op = op(OpKind::RecvUnexpected);
    recv_op.begin_submit(buf.as_mut_ptr(), buf.len(), 0);
    ep.recv_unexpected(&recv_op);
    assert!(recv_op.is_completed());
    assert_eq!(recv_op.result, Some(CompletionResult::Ok));
    assert_eq!(recv_op.actual_len, payload.len());
    assert_eq!(recv_op.tag, 7);
    assert_eq!(&buf[..payload.len()], payload);
    assert!(recv_op.peer.is_some());

    ep.close().unwrap();
}

#[test]
fn backpressure_retry_completes_after_listener_drains() {
    let listener = Endpoint::open(true, EndpointOptions::default()).unwrap();
    let sender = Endpoint::open(false, EndpointOptions::default()).unwrap();
    let dest = listener.source;

    let mut saturating_ops = Vec::new();
    for i in 0..64u32 {
        let send_op = Box::new(op(OpKind::SendUnexpected));
        send_op.begin_submit(std::ptr::null_mut(), 0, i);
        sender.send_unexpected(dest, b"x", i, &*send_op).unwrap();
        assert!(send_op.is_completed(), "slot {i} should still be free");
        saturating_ops.push(send_op);
    }

    // All 64 copy-buffer slots on the listener's region are now held; the
    // 65th send must park on the retry queue instead of completing.
    let overflow = op(OpKind::SendUnexpected);
    overflow.begin_submit(std::ptr::null_mut(), 0, 999);
    sender.send_unexpected(dest, b"y", 999, &overflow).unwrap();
    assert!(!overflow.is_completed(), "65th send should not complete while the pool is saturated");
    assert!(overflow.is_queued());

    // One listener progress tick processes the peer's RESERVED command
    // (linking it into the poll list) and then drains all 64 queued
    // messages off the ring in the same pass, releasing their slots.
    listener.progress_nonblocking().unwrap();

    // The sender's own progress tick runs the retry loop against the
    // now-available slots.
    sender.progress_nonblocking().unwrap();
    assert!(overflow.is_completed());
    assert_eq!(overflow.result, Some(CompletionResult::Ok));
}

#[test]
fn late_receive_posting_completes_each_message_in_fifo_order() {
    let listener = Endpoint::open(true, EndpointOptions::default()).unwrap();
    let sender = Endpoint::open(false, EndpointOptions::default()).unwrap();
    let dest = listener.source;

    for tag in 1..=3u32 {
        let send_op = op(OpKind::SendUnexpected);
        send_op.begin_submit(std::ptr::null_mut(), 0, tag);
        sender.send_unexpected(dest, &[tag as u8], tag, &send_op).unwrap();
        assert!(send_op.is_completed());
    }

    // Listener posts no receive before this tick: all 3 messages land in
    // the unexpected-message queue and their buffer slots are released
    // immediately.
    listener.progress_nonblocking().unwrap();

    for expected_tag in 1..=3u32 {
        let mut buf = [0u8; 4];
        let recv_op = op(OpKind::RecvUnexpected);
        recv_op.begin_submit(buf.as_mut_ptr(), buf.len(), 0);
        listener.recv_unexpected(&recv_op);
        assert!(recv_op.is_completed(), "tag {expected_tag} should already be held");
        assert_eq!(recv_op.tag, expected_tag);
        assert_eq!(recv_op.actual_len, 1);
        assert_eq!(buf[0], expected_tag as u8);
    }
}

#[test]
fn expected_match_with_receive_posted_before_peer_contact() {
    let listener = Endpoint::open(true, EndpointOptions::default()).unwrap();
    let sender = Endpoint::open(false, EndpointOptions::default()).unwrap();
    let sender_addr = sender.source;

    // The listener posts a matching receive before the sender has ever
    // contacted it. This creates a placeholder address record reachable
    // by address lookup but not yet linked into the poll list.
    let mut buf = [0u8; 8];
    let recv_op = op(OpKind::RecvExpected);
    recv_op.begin_submit(buf.as_mut_ptr(), buf.len(), 0);
    listener.recv_expected(sender_addr, 42, &recv_op);
    assert!(!recv_op.is_completed());

    let send_op = op(OpKind::SendExpected);
    send_op.begin_submit(std::ptr::null_mut(), 0, 42);
    sender.send_expected(listener.source, b"answer42", 42, &send_op).unwrap();
    assert!(send_op.is_completed());

    // The listener's RESERVED-command handler must reuse the placeholder
    // record (rather than shadow it with a disjoint one) so the parked
    // receive and the ring drain agree on the same handle.
    listener.progress_nonblocking().unwrap();

    assert!(recv_op.is_completed());
    assert_eq!(recv_op.result, Some(CompletionResult::Ok));
    assert_eq!(recv_op.tag, 42);
    assert_eq!(recv_op.actual_len, 8);
    assert_eq!(&buf, b"answer42");
}

#[test]
fn expected_send_with_no_receive_posted_is_not_retroactively_matched() {
    let listener = Endpoint::open(true, EndpointOptions::default()).unwrap();
    let sender = Endpoint::open(false, EndpointOptions::default()).unwrap();

    let send_op = op(OpKind::SendExpected);
    send_op.begin_submit(std::ptr::null_mut(), 0, 7);
    sender.send_expected(listener.source, b"late", 7, &send_op).unwrap();
    assert!(send_op.is_completed());

    // The listener drains the ring before any receive is posted. Expected
    // sends are not held the way unexpected ones are, so the message is
    // simply dropped.
    listener.progress_nonblocking().unwrap();

    let mut buf = [0u8; 8];
    let recv_op = op(OpKind::RecvExpected);
    recv_op.begin_submit(buf.as_mut_ptr(), buf.len(), 0);
    listener.recv_expected(sender.source, 7, &recv_op);
    assert!(!recv_op.is_completed(), "a late receive must not retroactively match an already-drained expected send");
}

#[test]
fn disconnect_cleanup_restores_fd_counts_on_both_sides() {
    let listener = Endpoint::open(true, EndpointOptions::default()).unwrap();
    let sender = Endpoint::open(false, EndpointOptions::default()).unwrap();
    let dest = listener.source;

    assert_eq!(sender.open_fd_count(), 0);
    assert_eq!(listener.open_fd_count(), 0);

    // Resolving the listener pushes the sender's two notifier fds over
    // the control channel as part of the RESERVED handshake.
    let send_op = op(OpKind::SendUnexpected);
    send_op.begin_submit(std::ptr::null_mut(), 0, 1);
    sender.send_unexpected(dest, b"hi", 1, &send_op).unwrap();
    assert_eq!(sender.open_fd_count(), 2);
    let peer_handle = send_op.peer.expect("send completion records the destination handle");

    listener.progress_nonblocking().unwrap();
    assert_eq!(listener.open_fd_count(), 2);

    // The sender tears down its side of the relationship...
    sender.address_free(peer_handle);
    assert_eq!(sender.open_fd_count(), 0);

    // ...and the listener's next tick processes the RELEASED command and
    // releases its own copy of the fds.
    listener.progress_nonblocking().unwrap();
    assert_eq!(listener.open_fd_count(), 0);
}
