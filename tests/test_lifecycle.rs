mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::{Recorder, RecordingAnalytics, config, start};
use temp_dir::TempDir;
use tether::error::HandlerError;

const MEASURE: &str = "app request handler processing";

fn with_recorder() -> (Arc<Recorder>, impl FnOnce(common::Handler) -> common::Handler) {
    let recorder = Arc::new(Recorder::default());
    let analytics = RecordingAnalytics(Arc::clone(&recorder));
    (recorder, move |handler: common::Handler| handler.with_analytics(Arc::new(analytics)))
}

#[test]
fn every_prepared_request_is_finalized_once() {
    let dir = TempDir::new().unwrap();
    let (recorder, customize) = with_recorder();
    let h = start(config(&dir), dir, customize);

    assert_eq!(h.native(&[("REQUEST_METHOD", "GET"), ("TXN_ID", "t1")], b"a"), b"echo:a");
    h.native(&[("X_MODE", "ignore"), ("TXN_ID", "t2")], b"");
    h.native(&[("X_MODE", "broken_pipe"), ("TXN_ID", "t3")], b"");
    assert_eq!(h.ping(), b"pong");

    // The broken pipe is a peer disconnect: logged and swallowed.
    assert!(h.handler.is_running());

    let counters = h.handler.counters();
    assert_eq!(counters.processed_requests, 3);
    assert_eq!(counters.ignored_requests, 1);

    // Only requests carrying a transaction id are measured.
    let finalized = recorder.count("end ");
    assert_eq!(finalized, 3);
    assert_eq!(recorder.count("close "), 3);

    let events = recorder.events();
    assert!(events.contains(&format!("begin requests/t1 {MEASURE}")));
    assert!(events.contains(&format!("end requests/t1 {MEASURE} error=false")));
    assert!(events.contains(&format!("end requests/t2 {MEASURE} error=false")));
    assert!(events.contains(&format!("end requests/t3 {MEASURE} error=true")));
    assert!(events.contains(&"close requests/t1 flush=true".to_string()));
    assert_eq!(recorder.count("message exceptions/"), 0);
}

#[test]
fn dispatcher_sees_transaction_and_open_log() {
    let dir = TempDir::new().unwrap();
    let (recorder, customize) = with_recorder();
    let h = start(config(&dir), dir, customize);

    h.native(&[("REQUEST_METHOD", "GET"), ("TXN_ID", "abc")], b"");
    h.native(&[("REQUEST_METHOD", "GET")], b"");

    let calls = h.handler.dispatcher().calls();
    assert_eq!(calls[0].txn_id.as_deref(), Some("abc"));
    assert!(calls[0].measured);
    assert_eq!(calls[1].txn_id, None);
    assert!(!calls[1].measured);
    assert_eq!(recorder.count("begin "), 1);
}

#[test]
fn dispatch_failure_ends_loop_and_is_reported() {
    let dir = TempDir::new().unwrap();
    let (recorder, customize) = with_recorder();
    let mut h = start(config(&dir), dir, customize);

    let reply = h.native(&[("X_MODE", "fail"), ("TXN_ID", "t9")], b"");
    assert!(reply.is_empty());

    let err = h.join(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, HandlerError::Dispatch(_)));
    assert_eq!(h.handler.counters().processed_requests, 1);

    let events = recorder.events();
    assert!(events.contains(&format!("end requests/t9 {MEASURE} error=true")));
    assert!(events.contains(&"message exceptions/new Request transaction ID: t9".to_string()));

    let message = events
        .iter()
        .find_map(|e| e.strip_prefix("message exceptions/new Message: "))
        .unwrap();
    let message = String::from_utf8(BASE64.decode(message).unwrap()).unwrap();
    assert!(message.contains("application exploded"));

    let class = events
        .iter()
        .find_map(|e| e.strip_prefix("message exceptions/new Class: "))
        .unwrap();
    assert_eq!(BASE64.decode(class).unwrap(), b"DispatchError");
    assert!(events.contains(&"close exceptions/new flush=true".to_string()));
}

#[test]
fn dispatch_failure_without_transaction_is_not_reported() {
    let dir = TempDir::new().unwrap();
    let (recorder, customize) = with_recorder();
    let mut h = start(config(&dir), dir, customize);

    h.native(&[("X_MODE", "fail")], b"");
    assert!(h.join(Duration::from_secs(5)).is_err());
    assert!(recorder.events().is_empty());
}

#[test]
fn deadline_interrupts_a_slow_dispatch() {
    let dir = TempDir::new().unwrap();
    let (recorder, customize) = with_recorder();
    let mut h = start(config(&dir), dir, customize);

    let started = Instant::now();
    let reply = h.native(
        &[("X_MODE", "sleep"), ("MAX_REQUEST_TIME", "0.2"), ("TXN_ID", "slow")],
        b"",
    );
    assert!(reply.is_empty());

    let err = h.join(Duration::from_secs(10)).unwrap_err();
    assert!(matches!(err, HandlerError::DeadlineExceeded(d) if (d.as_secs_f64() - 0.2).abs() < 1e-6));
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(recorder.events().contains(&format!("end requests/slow {MEASURE} error=true")));
    let class = recorder
        .events()
        .iter()
        .find_map(|e| e.strip_prefix("message exceptions/new Class: ").map(str::to_string))
        .unwrap();
    assert_eq!(BASE64.decode(class).unwrap(), b"DeadlineExceeded");
}

#[test]
fn deadline_that_is_not_reached_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let h = start(config(&dir), dir, |handler| handler);

    let reply = h.native(&[("REQUEST_METHOD", "GET"), ("MAX_REQUEST_TIME", "5")], b"quick");
    assert_eq!(reply, b"echo:quick");
    assert!(h.handler.is_running());
}
