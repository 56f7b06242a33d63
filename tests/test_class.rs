// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Front-end behaviour: initialisation and plugin selection, address
// formatting, context lifecycle, progress/trigger timeouts, memory-handle
// plumbing through the class API.

use libna::{MemAccess, NaClass, NaInitInfo, NaStatus, ProgressMode};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn initialize_selects_sm_for_protocol() {
    init_logging();
    let class = NaClass::initialize("sm", false).expect("init");
    assert_eq!(class.protocol_name(), "sm");
    assert_eq!(class.class_name(), "na");
    assert!(!class.is_listening());
    class.finalize().unwrap();
}

#[test]
fn initialize_with_class_name() {
    init_logging();
    let class = NaClass::initialize("na+sm://", true).expect("init");
    assert!(class.is_listening());
    class.finalize().unwrap();
}

#[test]
fn initialize_rejects_unknown() {
    init_logging();
    assert_eq!(
        NaClass::initialize("tcp://localhost:9999", false).err(),
        Some(NaStatus::ProtoNoSupport)
    );
    assert_eq!(
        NaClass::initialize("bmi+sm", false).err(),
        Some(NaStatus::ProtoNoSupport)
    );
    assert_eq!(
        NaClass::initialize("", false).err(),
        Some(NaStatus::InvalidArg)
    );
}

#[test]
fn self_addr_formats_with_class_prefix() {
    init_logging();
    let class = NaClass::initialize("sm", true).unwrap();
    let addr = class.addr_self().unwrap();
    assert!(class.addr_is_self(&addr));

    let s = class.addr_to_string(&addr).unwrap();
    let pid = std::process::id();
    assert!(
        s.starts_with(&format!("na+sm://{pid}/")),
        "unexpected address string {s}"
    );

    class.addr_free(addr).unwrap();
    class.finalize().unwrap();
}

#[test]
fn context_lifecycle_and_trigger_timeout() {
    init_logging();
    let class = NaClass::initialize("sm", false).unwrap();
    let ctx = class.context_create().unwrap();

    // Nothing queued: trigger times out, destroy succeeds.
    assert_eq!(ctx.trigger(5, 1), Err(NaStatus::Timeout));
    assert!(class.context_destroy(&ctx).is_ok());
    drop(ctx);
    class.finalize().unwrap();
}

#[test]
fn progress_times_out_when_idle() {
    init_logging();
    let class = NaClass::initialize("sm", false).unwrap();
    let ctx = class.context_create().unwrap();
    assert_eq!(class.progress(&ctx, 10), Err(NaStatus::Timeout));
    class.finalize().unwrap();
}

#[test]
fn poll_fd_and_try_wait() {
    init_logging();
    let class = NaClass::initialize("sm", true).unwrap();
    let ctx = class.context_create().unwrap();
    assert!(class.poll_get_fd(&ctx).is_some());
    assert!(class.poll_try_wait(&ctx));
    class.finalize().unwrap();

    // NO_BLOCK classes never report that blocking is safe.
    let init = NaInitInfo {
        progress_mode: ProgressMode::NO_BLOCK,
    };
    let class = NaClass::initialize_opt("sm", false, &init).unwrap();
    let ctx = class.context_create().unwrap();
    assert!(!class.poll_try_wait(&ctx));
    class.finalize().unwrap();
}

#[test]
fn lookup_rejects_malformed_names() {
    init_logging();
    let class = NaClass::initialize("sm", false).unwrap();
    let ctx = class.context_create().unwrap();
    let op = class.op_create();

    assert_eq!(
        class.addr_lookup(&ctx, Box::new(|_| 0), "sm://notanumber", &op),
        Err(NaStatus::InvalidArg)
    );
    assert_eq!(
        class.addr_lookup(&ctx, Box::new(|_| 0), "", &op),
        Err(NaStatus::InvalidArg)
    );
    class.finalize().unwrap();
}

#[test]
fn msg_buf_alloc_rounds_to_page() {
    init_logging();
    let class = NaClass::initialize("sm", false).unwrap();
    let buf = class.msg_buf_alloc(100).unwrap();
    assert_eq!(buf.len() % 4096, 0);
    assert!(buf.iter().all(|&b| b == 0));
    assert_eq!(class.msg_buf_alloc(0), Err(NaStatus::InvalidArg));
    class.finalize().unwrap();
}

#[test]
fn mem_handle_through_class_api() {
    init_logging();
    let class = NaClass::initialize("sm", false).unwrap();

    let mut buf = vec![0u8; 1024];
    let handle = class
        .mem_handle_create(buf.as_mut_ptr(), buf.len(), MemAccess::READWRITE)
        .unwrap();
    class.mem_register(&handle).unwrap();
    class.mem_publish(&handle).unwrap();

    let size = class.mem_handle_serialize_size(&handle).unwrap();
    let mut bytes = vec![0u8; size];
    class.mem_handle_serialize(&mut bytes, &handle).unwrap();

    let back = class.mem_handle_deserialize(&bytes).unwrap();
    assert_eq!(class.mem_handle_serialize_size(&back).unwrap(), size);
    let mut bytes2 = vec![0u8; size];
    class.mem_handle_serialize(&mut bytes2, &back).unwrap();
    assert_eq!(bytes, bytes2);

    class.mem_unpublish(&handle).unwrap();
    class.mem_deregister(&handle).unwrap();
    class.mem_handle_free(back).unwrap();
    class.mem_handle_free(handle).unwrap();

    // Degenerate inputs fail fast.
    assert!(class
        .mem_handle_create(std::ptr::null_mut(), 16, MemAccess::READ)
        .is_err());
    assert!(class.mem_handle_deserialize(&[]).is_err());
    class.finalize().unwrap();
}

#[test]
fn addr_serialize_is_optional_for_sm() {
    init_logging();
    let class = NaClass::initialize("sm", false).unwrap();
    let addr = class.addr_self().unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(
        class.addr_serialize(&mut buf, &addr),
        Err(NaStatus::OpNotSupported)
    );
    assert!(matches!(
        class.addr_deserialize(&buf),
        Err(NaStatus::OpNotSupported)
    ));
    class.addr_free(addr).unwrap();
    class.finalize().unwrap();
}

#[test]
fn lookup_of_absent_peer_fails() {
    init_logging();
    let class = NaClass::initialize("sm", false).unwrap();
    let ctx = class.context_create().unwrap();
    let op = class.op_create();

    // No listener ever registered this (pid, id): the shared region does
    // not exist and the lookup fails synchronously.
    assert_eq!(
        class.addr_lookup(&ctx, Box::new(|_| 0), "sm://999999999/4242", &op),
        Err(NaStatus::ProtocolError)
    );
    // The op id was rolled back and stays usable.
    assert_eq!(
        class.addr_lookup(&ctx, Box::new(|_| 0), "sm://999999999/4242", &op),
        Err(NaStatus::ProtocolError)
    );
    class.finalize().unwrap();
}

#[test]
fn max_tag_is_full_range() {
    init_logging();
    let class = NaClass::initialize("sm", false).unwrap();
    assert_eq!(class.msg_max_tag(), u32::MAX);
    class.finalize().unwrap();
}
