//! Request ordering, reply matching, oneway sends, and what callers see when
//! the link fails underneath them.

mod common;

use common::{Calculator, calculator_pair, calculator_pair_with, wait_until, worker_class};
use oxidec_do::coder::{ClassNameMap, DetachedResolver, Encoder, object_tag};
use oxidec_do::connection::wire::{self, Header, MessageKind, status};
use oxidec_do::port::{MemoryTransport, StreamListener, Transport};
use oxidec_do::{Connection, ConnectionConfig, DistantObject, Error, Object, Protocol, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SETTLE: Duration = Duration::from_secs(5);

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_calls_on_one_proxy_are_sent_in_turn() {
    let (pair, calc, proxy) = calculator_pair();

    let first = {
        let proxy = proxy.clone();
        thread::spawn(move || proxy.send_message("hold:", vec![Value::Int(1)]))
    };
    assert!(wait_until(SETTLE, || pair.server.statistics().requests_received == 1));

    let followers: Vec<_> = (2..=3)
        .map(|n| {
            let proxy = proxy.clone();
            thread::spawn(move || proxy.send_message("add:to:", vec![Value::Int(n), Value::Int(0)]))
        })
        .collect();

    // While the first call is unanswered nothing else leaves the client.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(pair.server.statistics().requests_received, 1);

    calc.gate.open();
    assert_eq!(first.join().unwrap().unwrap(), Value::Int(1));
    let mut answers: Vec<_> = followers
        .into_iter()
        .map(|t| t.join().unwrap().unwrap())
        .collect();
    answers.sort_by_key(|v| v.as_i64());
    assert_eq!(answers, vec![Value::Int(2), Value::Int(3)]);
    assert_eq!(pair.server.statistics().requests_received, 3);
}

#[test]
fn test_replies_out_of_order_reach_their_callers() {
    let (pair, calc, proxy) = calculator_pair();
    let slow = proxy.send_message("sibling", vec![]).unwrap();
    let fast = proxy.send_message("sibling", vec![]).unwrap();
    for worker in [&slow, &fast] {
        let distant = worker.as_object().unwrap().as_proxy().unwrap();
        distant.set_protocol(Some(calc.protocol.clone()));
    }

    let started = Instant::now();
    let slow_call = {
        let slow = slow.as_object().unwrap().clone();
        thread::spawn(move || slow.send_message("delay:value:", vec![Value::UInt(300), Value::Int(1)]))
    };
    thread::sleep(Duration::from_millis(20));
    let fast_answer = fast
        .as_object()
        .unwrap()
        .send_message("delay:value:", vec![Value::UInt(0), Value::Int(2)])
        .unwrap();

    assert_eq!(fast_answer, Value::Int(2));
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(slow_call.join().unwrap().unwrap(), Value::Int(1));
    assert_eq!(pair.client.statistics().replies_received, 5); // root, 2 siblings, 2 delays
}

#[test]
fn test_concurrent_callers_share_a_connection() {
    let (pair, _calc, proxy) = calculator_pair();
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let worker = proxy.send_message("spawn", vec![]).unwrap();
            worker.as_object().unwrap().clone()
        })
        .collect();

    let handles: Vec<_> = workers
        .into_iter()
        .map(|worker| thread::spawn(move || worker.send_message("value", vec![])))
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), Value::Int(1));
    }
    assert!(pair.client.is_valid());
}

// ============================================================================
// Oneway
// ============================================================================

#[test]
fn test_oneway_runs_without_a_reply() {
    let (pair, calc, proxy) = calculator_pair();

    let result = proxy.send_message("notify:", vec![Value::Int(5)]).unwrap();

    assert_eq!(result, Value::Void);
    assert!(wait_until(SETTLE, || calc.notified.lock().unwrap().as_slice() == [5]));
    let stats = pair.client.statistics();
    assert_eq!(stats.oneway_sent, 1);
    assert_eq!(pair.server.statistics().replies_sent, 1); // the root request only
}

#[test]
fn test_oneway_to_silent_peer_returns_immediately() {
    let (ours, theirs) = MemoryTransport::pair();
    let client = Connection::new(ours, ConnectionConfig::default()).unwrap();
    let calc = Calculator::new();
    let proxy = DistantObject::with_target(&client, 1).unwrap();
    proxy
        .as_proxy()
        .unwrap()
        .set_protocol(Some(calc.protocol.clone()));

    let started = Instant::now();
    proxy.send_message("notify:", vec![Value::Int(1)]).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let (header, _body) = wire::split(theirs.receive().unwrap()).unwrap();
    assert_eq!(header.kind, MessageKind::Request);
    assert!(header.is_oneway());
    assert!(client.is_valid());
}

// ============================================================================
// Failure
// ============================================================================

#[test]
fn test_reply_timeout_breaks_the_connection() {
    let (ours, _silent) = MemoryTransport::pair();
    let config = ConnectionConfig::default().with_reply_timeout(Duration::from_millis(150));
    let client = Connection::new(ours, config).unwrap();
    let calc = Calculator::new();
    let proxy = DistantObject::with_target(&client, 1).unwrap();
    proxy
        .as_proxy()
        .unwrap()
        .set_protocol(Some(calc.protocol.clone()));

    let err = proxy
        .send_message("add:to:", vec![Value::Int(1), Value::Int(2)])
        .unwrap_err();

    assert!(matches!(err, Error::ConnectionBroken { .. }), "{err:?}");
    assert!(!client.is_valid());
    assert!(!client.local_port().is_valid());
}

#[test]
fn test_transport_closed_mid_call() {
    let (pair, calc, proxy) = calculator_pair();
    let call = {
        let proxy = proxy.clone();
        thread::spawn(move || proxy.send_message("hold:", vec![Value::Int(1)]))
    };
    assert!(wait_until(SETTLE, || pair.server.statistics().requests_received == 1));

    pair.client_transport.close();

    let err = call.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionBroken { .. }), "{err:?}");
    assert!(wait_until(SETTLE, || !pair.server.is_valid()));
    assert!(!pair.client.is_valid());
    calc.gate.open();
}

#[test]
fn test_calls_after_invalidate_fail_fast() {
    let (pair, _calc, proxy) = calculator_pair();
    pair.client.invalidate();
    pair.client.invalidate();

    let err = proxy
        .send_message("add:to:", vec![Value::Int(1), Value::Int(1)])
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionBroken { .. }));
    assert_eq!(pair.client.statistics().remote_objects, 0);
    assert!(pair.client.root_proxy().is_err());
}

#[test]
fn test_garbage_frame_is_a_protocol_violation() {
    let (ours, theirs) = MemoryTransport::pair();
    let server = Connection::new(ours, ConnectionConfig::default()).unwrap();
    let theirs = Arc::new(theirs);

    // A request whose header names an unknown message kind.
    let message = oxidec_do::port::PortMessage::new(
        theirs.local_port(),
        theirs.remote_port(),
        vec![
            oxidec_do::port::Component::Data(vec![0xEE, 0, 0, 0, 1, 0]),
            oxidec_do::port::Component::Data(Vec::new()),
        ],
    );
    theirs.send(&message).unwrap();

    assert!(wait_until(SETTLE, || !server.is_valid()));
}

// ============================================================================
// Hostile peers
// ============================================================================

fn send_raw(transport: &MemoryTransport, kind: MessageKind, seq: u32, body: Vec<u8>) {
    let message = wire::build(
        transport.local_port(),
        transport.remote_port(),
        Header::new(kind, seq, 0),
        body,
    );
    transport.send(&message).unwrap();
}

fn request_body(handle: u32, selector: &[u8], types: &str, args: &[Value]) -> Vec<u8> {
    let names = ClassNameMap::new();
    let mut encoder = Encoder::new(&DetachedResolver, &names);
    encoder.put_u32(handle);
    encoder.put_bytes(selector).unwrap();
    encoder.put_str(types).unwrap();
    for arg in args {
        encoder.encode_value(arg).unwrap();
    }
    encoder.finish()
}

/// A server over one end of a link; the test drives the other end by hand.
fn raw_server() -> (Connection, Calculator, MemoryTransport) {
    let (ours, theirs) = MemoryTransport::pair();
    let server = Connection::new(ours, ConnectionConfig::default()).unwrap();
    let calc = Calculator::new();
    server.set_root_object(Some(calc.object()));
    (server, calc, theirs)
}

fn root_handle(server_end: &MemoryTransport) -> u32 {
    send_raw(server_end, MessageKind::RootRequest, 0, Vec::new());
    let (header, body) = wire::split(server_end.receive().unwrap()).unwrap();
    assert_eq!((header.kind, header.seq), (MessageKind::Reply, 0));
    assert_eq!(&body[..3], &[status::OK, b'@', object_tag::LOCAL_REF]);
    u32::from_be_bytes([body[3], body[4], body[5], body[6]])
}

#[test]
fn test_oversized_argument_type_is_a_protocol_violation() {
    let (server, _calc, theirs) = raw_server();

    let body = request_body(1, b"x:", "v@:[4000000000000c]", &[]);
    send_raw(&theirs, MessageKind::Request, 1, body);

    assert!(wait_until(SETTLE, || !server.is_valid()));
}

#[test]
fn test_argument_types_must_match_the_method() {
    let (server, calc, theirs) = raw_server();
    let handle = root_handle(&theirs);

    // add:to: takes ints; the peer claims doubles.
    let body = request_body(
        handle,
        b"add:to:",
        "i@:dd",
        &[Value::Double(1.0), Value::Double(2.0)],
    );
    send_raw(&theirs, MessageKind::Request, 1, body);
    let (header, reply) = wire::split(theirs.receive().unwrap()).unwrap();
    assert_eq!(header.seq, 1);
    assert_eq!(reply[0], status::EXCEPTION);

    // A selector nothing here implements is refused the same way.
    let body = request_body(handle, b"neverDeclaredAnywhere:", "v@:i", &[Value::Int(1)]);
    send_raw(&theirs, MessageKind::Request, 2, body);
    let (_, reply) = wire::split(theirs.receive().unwrap()).unwrap();
    assert_eq!(reply[0], status::EXCEPTION);

    assert!(server.is_valid());
    assert!(calc.notified.lock().unwrap().is_empty());
}

#[test]
fn test_garbled_selector_invalidates_the_server() {
    let (server, _calc, theirs) = raw_server();
    let handle = root_handle(&theirs);

    let body = request_body(handle, &[0xff, 0xfe], "i@:", &[]);
    send_raw(&theirs, MessageKind::Request, 1, body);

    assert!(wait_until(SETTLE, || !server.is_valid()));
}

#[test]
fn test_garbled_reply_invalidates_the_client() {
    let (ours, theirs) = MemoryTransport::pair();
    let client = Connection::new(ours, ConnectionConfig::default()).unwrap();
    let peer = thread::spawn(move || {
        let (header, _) = wire::split(theirs.receive().unwrap()).unwrap();
        // A selector value whose name is not UTF-8.
        let body = vec![status::OK, b':', 1, 0, 0, 0, 2, 0xff, 0xfe];
        let reply = wire::build(
            theirs.local_port(),
            theirs.remote_port(),
            Header::new(MessageKind::Reply, header.seq, 0),
            body,
        );
        theirs.send(&reply).unwrap();
        theirs
    });

    let err = client.root_proxy().unwrap_err();
    let _theirs = peer.join().unwrap();

    assert!(matches!(err, Error::ConnectionBroken { .. }), "{err:?}");
    assert!(!client.is_valid());
}

#[test]
fn test_failed_encoding_leaves_no_export_behind() {
    let (pair, _calc, proxy) = calculator_pair();
    let protocol = Protocol::new(&common::unique_name("Taker"), None).unwrap();
    protocol.add_method("take:blob:", "v@:@@?").unwrap();
    proxy.as_proxy().unwrap().set_protocol(Some(protocol));

    let gift = Object::new(&worker_class());
    let err = proxy
        .send_message("take:blob:", vec![Value::Object(Some(gift)), Value::Unknown])
        .unwrap_err();

    assert!(matches!(err, Error::NotImplemented { .. }), "{err:?}");
    assert_eq!(pair.client.statistics().local_objects, 0);
    assert_eq!(pair.server.statistics().requests_received, 0);
    assert!(pair.client.is_valid());
}

// ============================================================================
// Over TCP
// ============================================================================

#[test]
fn test_call_over_tcp() {
    let config = ConnectionConfig::default();
    let listener = StreamListener::bind("127.0.0.1:0".parse().unwrap(), config.clone()).unwrap();
    let addr = listener.local_addr().unwrap();
    let calc = Calculator::new();
    let root = calc.object();

    let server = thread::spawn(move || {
        let transport = listener.accept().unwrap();
        let server = Connection::new(transport, ConnectionConfig::default()).unwrap();
        server.set_root_object(Some(root));
        server
    });

    let client = Connection::connect(addr, config).unwrap();
    let server = server.join().unwrap();
    let proxy: Object = client.root_proxy().unwrap();

    let sum = proxy
        .send_message("add:to:", vec![Value::Int(20), Value::Int(22)])
        .unwrap();
    assert_eq!(sum, Value::Int(42));
    assert_eq!(client.remote_port().id().to_socket_addr(), Some(addr));

    client.invalidate();
    assert!(wait_until(SETTLE, || !server.is_valid()));
}

#[test]
fn test_short_timeout_config_is_honored_end_to_end() {
    let config = ConnectionConfig::default().with_reply_timeout(Duration::from_millis(100));
    let (pair, _calc, proxy) = calculator_pair_with(config);

    let err = proxy
        .send_message("delay:value:", vec![Value::UInt(1_000), Value::Int(0)])
        .unwrap_err();

    assert!(matches!(err, Error::ConnectionBroken { .. }));
    assert!(!pair.client.is_valid());
}
