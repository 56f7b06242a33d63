// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// End-to-end messaging tests over a loopback SM pair: two classes in one
// process, one listening, connected through the real handshake path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libna::{
    NaAddr, NaCbPayload, NaClass, NaContext, NaInitInfo, NaStatus, ProgressMode,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Drive progress + trigger on every node until `done` reports true.
fn drive<F: FnMut() -> bool>(nodes: &[(&NaClass, &NaContext)], mut done: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if done() {
            return;
        }
        assert!(Instant::now() < deadline, "drive timed out");
        for (class, ctx) in nodes {
            match class.progress(ctx, 10) {
                Ok(()) | Err(NaStatus::Timeout) => {}
                Err(e) => panic!("progress failed: {e}"),
            }
            while matches!(ctx.trigger(0, 16), Ok(n) if n > 0) {}
        }
    }
}

fn server_client() -> (NaClass, NaContext, NaClass, NaContext, String) {
    init_logging();
    let server = NaClass::initialize("sm", true).expect("server init");
    let sctx = server.context_create().unwrap();
    let client = NaClass::initialize("sm", false).expect("client init");
    let cctx = client.context_create().unwrap();

    let self_addr = server.addr_self().unwrap();
    let name = server.addr_to_string(&self_addr).unwrap();
    server.addr_free(self_addr).unwrap();

    (server, sctx, client, cctx, name)
}

/// Look up `name` from the client, driving both sides through the
/// handshake until the lookup completes.
fn lookup(
    client: &NaClass,
    cctx: &NaContext,
    server: &NaClass,
    sctx: &NaContext,
    name: &str,
) -> NaAddr {
    let op = client.op_create();
    let slot: Arc<Mutex<Option<NaAddr>>> = Arc::new(Mutex::new(None));
    let slot2 = Arc::clone(&slot);
    client
        .addr_lookup(
            cctx,
            Box::new(move |info| {
                assert!(info.ret.is_ok(), "lookup failed: {:?}", info.ret);
                if let NaCbPayload::Lookup { addr } = info.payload {
                    *slot2.lock().unwrap() = Some(addr);
                }
                0
            }),
            name,
            &op,
        )
        .expect("addr_lookup");

    drive(&[(server, sctx), (client, cctx)], || {
        slot.lock().unwrap().is_some()
    });
    let addr = slot.lock().unwrap().take().unwrap();
    client.op_destroy(&op).unwrap();
    addr
}

#[test]
fn lookup_and_addr_string_tail() {
    let (server, sctx, client, cctx, name) = server_client();
    assert!(name.starts_with("na+sm://"));

    let peer = lookup(&client, &cctx, &server, &sctx, &name);
    let peer_name = client.addr_to_string(&peer).unwrap();
    // Same pid/id tail as the string we looked up.
    let tail = name.split("sm://").nth(1).unwrap();
    assert!(peer_name.ends_with(tail));
    assert!(!client.addr_is_self(&peer));

    let dup = client.addr_dup(&peer).unwrap();
    assert!(client.addr_cmp(&peer, &dup));
    client.addr_free(dup).unwrap();
    client.addr_free(peer).unwrap();

    client.finalize().unwrap();
    server.finalize().unwrap();
}

#[test]
fn echo_unexpected_4096() {
    let (server, sctx, client, cctx, name) = server_client();
    let peer = lookup(&client, &cctx, &server, &sctx, &name);

    // Server posts one unexpected recv of max size, any tag.
    let recv_op = server.op_create();
    let received: Arc<Mutex<Option<(Vec<u8>, NaAddr, u32)>>> = Arc::new(Mutex::new(None));
    let received2 = Arc::clone(&received);
    server
        .msg_recv_unexpected(
            &sctx,
            Box::new(move |info| {
                assert!(info.ret.is_ok());
                if let NaCbPayload::RecvUnexpected { buf, source, tag } = info.payload {
                    *received2.lock().unwrap() = Some((buf, source.unwrap(), tag));
                }
                0
            }),
            vec![0u8; 4096],
            &recv_op,
        )
        .unwrap();

    let payload: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
    let send_op = client.op_create();
    let sent = Arc::new(AtomicU32::new(0));
    let sent2 = Arc::clone(&sent);
    client
        .msg_send_unexpected(
            &cctx,
            Box::new(move |info| {
                assert!(info.ret.is_ok());
                sent2.fetch_add(1, Ordering::Relaxed);
                0
            }),
            &payload,
            &peer,
            42,
            &send_op,
        )
        .unwrap();

    drive(&[(&server, &sctx), (&client, &cctx)], || {
        sent.load(Ordering::Relaxed) == 1 && received.lock().unwrap().is_some()
    });

    let (buf, source, tag) = received.lock().unwrap().take().unwrap();
    assert_eq!(buf.len(), 4096);
    assert_eq!(buf, payload);
    assert_eq!(tag, 42);
    assert!(server.addr_cmp(&source, &source));

    server.addr_free(source).unwrap();
    client.addr_free(peer).unwrap();
    client.op_destroy(&send_op).unwrap();
    server.op_destroy(&recv_op).unwrap();

    assert!(server.context_destroy(&sctx).is_ok());
    assert!(client.context_destroy(&cctx).is_ok());
    client.finalize().unwrap();
    server.finalize().unwrap();
}

#[test]
fn unexpected_staged_before_recv_posted() {
    let (server, sctx, client, cctx, name) = server_client();
    let peer = lookup(&client, &cctx, &server, &sctx, &name);

    let send_op = client.op_create();
    let sent = Arc::new(AtomicU32::new(0));
    let sent2 = Arc::clone(&sent);
    client
        .msg_send_unexpected(
            &cctx,
            Box::new(move |_| {
                sent2.fetch_add(1, Ordering::Relaxed);
                0
            }),
            b"early bird",
            &peer,
            5,
            &send_op,
        )
        .unwrap();

    // Let the header arrive and get staged with no receive posted.
    drive(&[(&server, &sctx), (&client, &cctx)], || {
        sent.load(Ordering::Relaxed) == 1
    });
    std::thread::sleep(Duration::from_millis(20));
    let _ = server.progress(&sctx, 50);

    // The late receive matches the staged message without further traffic.
    let recv_op = server.op_create();
    let received: Arc<Mutex<Option<(Vec<u8>, NaAddr, u32)>>> = Arc::new(Mutex::new(None));
    let received2 = Arc::clone(&received);
    server
        .msg_recv_unexpected(
            &sctx,
            Box::new(move |info| {
                if let NaCbPayload::RecvUnexpected { buf, source, tag } = info.payload {
                    *received2.lock().unwrap() = Some((buf, source.unwrap(), tag));
                }
                0
            }),
            vec![0u8; 64],
            &recv_op,
        )
        .unwrap();

    drive(&[(&server, &sctx)], || received.lock().unwrap().is_some());
    let (buf, source, tag) = received.lock().unwrap().take().unwrap();
    assert_eq!(buf, b"early bird");
    assert_eq!(tag, 5);

    server.addr_free(source).unwrap();
    client.addr_free(peer).unwrap();
    client.finalize().unwrap();
    server.finalize().unwrap();
}

#[test]
fn expected_matches_source_and_tag() {
    let (server, sctx, client1, cctx1, name) = server_client();
    let client2 = NaClass::initialize("sm", false).unwrap();
    let cctx2 = client2.context_create().unwrap();

    let peer1 = lookup(&client1, &cctx1, &server, &sctx, &name);
    let peer2 = lookup(&client2, &cctx2, &server, &sctx, &name);

    // Identify both clients on the server through one unexpected message
    // each, so the server holds their source addresses.
    let mut sources: Vec<(u32, NaAddr)> = Vec::new();
    for (client, cctx, peer, marker) in
        [(&client1, &cctx1, &peer1, 1u32), (&client2, &cctx2, &peer2, 2u32)]
    {
        let recv_op = server.op_create();
        let slot: Arc<Mutex<Option<(NaAddr, u32)>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        server
            .msg_recv_unexpected(
                &sctx,
                Box::new(move |info| {
                    if let NaCbPayload::RecvUnexpected { source, tag, .. } = info.payload {
                        *slot2.lock().unwrap() = Some((source.unwrap(), tag));
                    }
                    0
                }),
                vec![0u8; 16],
                &recv_op,
            )
            .unwrap();

        let send_op = client.op_create();
        client
            .msg_send_unexpected(
                cctx,
                Box::new(|_| 0),
                b"hi",
                peer,
                marker,
                &send_op,
            )
            .unwrap();

        drive(&[(&server, &sctx), (client, cctx)], || {
            slot.lock().unwrap().is_some()
        });
        let (source, tag) = slot.lock().unwrap().take().unwrap();
        sources.push((tag, source));
    }
    let source1 = &sources.iter().find(|(t, _)| *t == 1).unwrap().1;
    let source2 = &sources.iter().find(|(t, _)| *t == 2).unwrap().1;

    // Two expected receives, tag 7, one per source.
    let recv1 = server.op_create();
    let got1: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got1b = Arc::clone(&got1);
    server
        .msg_recv_expected(
            &sctx,
            Box::new(move |info| {
                assert!(info.ret.is_ok());
                if let NaCbPayload::RecvExpected { buf } = info.payload {
                    *got1b.lock().unwrap() = Some(buf);
                }
                0
            }),
            vec![0u8; 64],
            source1,
            7,
            &recv1,
        )
        .unwrap();

    let recv2 = server.op_create();
    let got2 = Arc::new(AtomicU32::new(0));
    let got2b = Arc::clone(&got2);
    server
        .msg_recv_expected(
            &sctx,
            Box::new(move |info| {
                // Only reachable through cancellation in this test.
                assert_eq!(info.ret, Err(NaStatus::Canceled));
                got2b.fetch_add(1, Ordering::Relaxed);
                0
            }),
            vec![0u8; 64],
            source2,
            7,
            &recv2,
        )
        .unwrap();

    // Client 1 sends expected "hello" with tag 7.
    let send_op = client1.op_create();
    client1
        .msg_send_expected(
            &cctx1,
            Box::new(|info| {
                assert!(info.ret.is_ok());
                0
            }),
            b"hello",
            &peer1,
            7,
            &send_op,
        )
        .unwrap();

    drive(&[(&server, &sctx), (&client1, &cctx1)], || {
        got1.lock().unwrap().is_some()
    });
    assert_eq!(got1.lock().unwrap().take().unwrap(), b"hello");
    // The receive posted for the other client did not match.
    assert_eq!(got2.load(Ordering::Relaxed), 0);

    // Clean up the unmatched receive through cancellation.
    server.cancel(&sctx, &recv2).unwrap();
    drive(&[(&server, &sctx)], || got2.load(Ordering::Relaxed) == 1);

    for source in sources.into_iter().map(|(_, s)| s) {
        server.addr_free(source).unwrap();
    }
    client1.addr_free(peer1).unwrap();
    client2.addr_free(peer2).unwrap();
    client1.finalize().unwrap();
    client2.finalize().unwrap();
    server.finalize().unwrap();
}

#[test]
fn backpressure_queued_sends_complete() {
    let (server, sctx, client, cctx, name) = server_client();
    let peer = lookup(&client, &cctx, &server, &sctx, &name);

    let payload = vec![0x77u8; 4096];
    let completions = Arc::new(AtomicU32::new(0));

    // 65 sends against a non-draining peer: pool and ring hold 64, the
    // last one parks on the retry queue but still returns success.
    let mut send_ops = Vec::new();
    for _ in 0..65 {
        let op = client.op_create();
        let completions2 = Arc::clone(&completions);
        client
            .msg_send_unexpected(
                &cctx,
                Box::new(move |info| {
                    assert!(info.ret.is_ok());
                    completions2.fetch_add(1, Ordering::Relaxed);
                    0
                }),
                &payload,
                &peer,
                9,
                &op,
            )
            .expect("every send posts successfully");
        send_ops.push(op);
    }

    // Now the server drains 65 receives; the retried send goes through.
    let received = Arc::new(AtomicU32::new(0));
    let mut recv_ops = Vec::new();
    let sources: Arc<Mutex<Vec<NaAddr>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..65 {
        let op = server.op_create();
        let received2 = Arc::clone(&received);
        let sources2 = Arc::clone(&sources);
        server
            .msg_recv_unexpected(
                &sctx,
                Box::new(move |info| {
                    assert!(info.ret.is_ok());
                    if let NaCbPayload::RecvUnexpected { buf, source, .. } = info.payload {
                        assert_eq!(buf.len(), 4096);
                        sources2.lock().unwrap().push(source.unwrap());
                    }
                    received2.fetch_add(1, Ordering::Relaxed);
                    0
                }),
                vec![0u8; 4096],
                &op,
            )
            .unwrap();
        recv_ops.push(op);
    }

    drive(&[(&server, &sctx), (&client, &cctx)], || {
        completions.load(Ordering::Relaxed) == 65 && received.load(Ordering::Relaxed) == 65
    });

    for source in sources.lock().unwrap().drain(..) {
        server.addr_free(source).unwrap();
    }
    client.addr_free(peer).unwrap();
    client.finalize().unwrap();
    server.finalize().unwrap();
}

#[test]
fn backpressure_no_retry_surfaces_again() {
    init_logging();
    let server = NaClass::initialize("sm", true).unwrap();
    let sctx = server.context_create().unwrap();
    let init = NaInitInfo {
        progress_mode: ProgressMode::NO_RETRY,
    };
    let client = NaClass::initialize_opt("sm", false, &init).unwrap();
    let cctx = client.context_create().unwrap();

    let self_addr = server.addr_self().unwrap();
    let name = server.addr_to_string(&self_addr).unwrap();
    server.addr_free(self_addr).unwrap();
    let peer = lookup(&client, &cctx, &server, &sctx, &name);

    let payload = vec![0x11u8; 4096];
    let mut send_ops = Vec::new();
    for _ in 0..64 {
        let op = client.op_create();
        client
            .msg_send_unexpected(&cctx, Box::new(|_| 0), &payload, &peer, 1, &op)
            .unwrap();
        send_ops.push(op);
    }

    // Pool exhausted: the 65th fails immediately, and keeps failing while
    // no slot has been released.
    let op = client.op_create();
    assert_eq!(
        client.msg_send_unexpected(&cctx, Box::new(|_| 0), &payload, &peer, 1, &op),
        Err(NaStatus::Again)
    );
    assert_eq!(
        client.msg_send_unexpected(&cctx, Box::new(|_| 0), &payload, &peer, 1, &op),
        Err(NaStatus::Again)
    );

    // Drain the 64 send completions before teardown.
    drive(&[(&client, &cctx)], || {
        client.context_destroy(&cctx).is_ok()
    });

    // Server side: consume everything so its queues are empty too.
    let received = Arc::new(AtomicU32::new(0));
    let sources: Arc<Mutex<Vec<NaAddr>>> = Arc::new(Mutex::new(Vec::new()));
    let mut recv_ops = Vec::new();
    for _ in 0..64 {
        let rop = server.op_create();
        let received2 = Arc::clone(&received);
        let sources2 = Arc::clone(&sources);
        server
            .msg_recv_unexpected(
                &sctx,
                Box::new(move |info| {
                    if let NaCbPayload::RecvUnexpected { source, .. } = info.payload {
                        sources2.lock().unwrap().push(source.unwrap());
                    }
                    received2.fetch_add(1, Ordering::Relaxed);
                    0
                }),
                vec![0u8; 4096],
                &rop,
            )
            .unwrap();
        recv_ops.push(rop);
    }
    drive(&[(&server, &sctx)], || received.load(Ordering::Relaxed) == 64);

    for source in sources.lock().unwrap().drain(..) {
        server.addr_free(source).unwrap();
    }
    client.addr_free(peer).unwrap();
    client.finalize().unwrap();
    server.finalize().unwrap();
}

#[test]
fn lookup_fails_when_peer_disconnects() {
    init_logging();
    let server = NaClass::initialize("sm", true).expect("server init");
    let client = NaClass::initialize("sm", false).expect("client init");
    let cctx = client.context_create().unwrap();

    let self_addr = server.addr_self().unwrap();
    let name = server.addr_to_string(&self_addr).unwrap();
    server.addr_free(self_addr).unwrap();

    // Post the lookup: the connect lands in the listener's backlog and the
    // lookup op parks until the handshake answer arrives.
    let op = client.op_create();
    let outcome: Arc<Mutex<Option<libna::NaResult<()>>>> = Arc::new(Mutex::new(None));
    let outcome2 = Arc::clone(&outcome);
    client
        .addr_lookup(
            &cctx,
            Box::new(move |info| {
                *outcome2.lock().unwrap() = Some(info.ret);
                0
            }),
            &name,
            &op,
        )
        .expect("addr_lookup");

    // Tear the server down before it ever accepts: the queued connection
    // is aborted and the client's session socket reports a hangup.
    server.finalize().unwrap();

    drive(&[(&client, &cctx)], || outcome.lock().unwrap().is_some());
    assert_eq!(
        outcome.lock().unwrap().take().unwrap(),
        Err(NaStatus::ProtocolError)
    );

    // The parked op was removed from the lookup queue and released, so the
    // class shuts down cleanly.
    assert!(client.context_destroy(&cctx).is_ok());
    client.op_destroy(&op).unwrap();
    client.finalize().unwrap();
}

#[test]
fn message_size_limits() {
    let (server, sctx, client, cctx, name) = server_client();
    let peer = lookup(&client, &cctx, &server, &sctx, &name);

    let op = client.op_create();
    // Zero-byte messages are rejected outright.
    assert_eq!(
        client.msg_send_unexpected(&cctx, Box::new(|_| 0), &[], &peer, 0, &op),
        Err(NaStatus::InvalidArg)
    );
    // Anything above one pool slot overflows.
    let oversized = vec![0u8; 4097];
    assert_eq!(
        client.msg_send_unexpected(&cctx, Box::new(|_| 0), &oversized, &peer, 0, &op),
        Err(NaStatus::Overflow)
    );
    assert_eq!(client.msg_max_unexpected_size(), 4096);
    assert_eq!(client.msg_max_expected_size(), 4096);

    client.addr_free(peer).unwrap();
    client.finalize().unwrap();
    server.finalize().unwrap();
}
