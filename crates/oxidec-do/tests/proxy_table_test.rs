//! Object references across a connection: proxy identity, reference counts,
//! references handed back to their owner, and by-copy archives.

mod common;

use common::{calculator_pair, unique_name, wait_until, worker_class};
use oxidec_do::{Class, DistantObject, Error, Object, Value};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(5);

// ============================================================================
// Identity and counts
// ============================================================================

#[test]
fn test_same_remote_object_yields_same_proxy() {
    let (pair, _calc, proxy) = calculator_pair();

    let first = proxy.send_message("shared", vec![]).unwrap();
    let second = proxy.send_message("shared", vec![]).unwrap();
    let first = first.as_object().unwrap();
    let second = second.as_object().unwrap();

    assert!(first.ptr_eq(second));
    assert!(first.is_proxy());
    assert_eq!(pair.client.proxy_reference_count(first), 2);
    assert_eq!(pair.client.statistics().remote_objects, 2); // root + shared
    assert_eq!(first.send_message("value", vec![]).unwrap(), Value::Int(7));
}

#[test]
fn test_distinct_remote_objects_yield_distinct_proxies() {
    let (pair, _calc, proxy) = calculator_pair();

    let a = proxy.send_message("spawn", vec![]).unwrap();
    let b = proxy.send_message("spawn", vec![]).unwrap();
    let (a, b) = (a.as_object().unwrap(), b.as_object().unwrap());

    assert!(!a.ptr_eq(b));
    assert_ne!(
        a.as_proxy().unwrap().handle(),
        b.as_proxy().unwrap().handle()
    );
    assert_eq!(pair.server.statistics().local_objects, 3);
}

#[test]
fn test_release_to_zero_frees_the_export() {
    let (pair, _calc, proxy) = calculator_pair();
    let shared = proxy.send_message("shared", vec![]).unwrap();
    let shared = shared.as_object().unwrap().clone();
    proxy.send_message("shared", vec![]).unwrap();
    assert_eq!(pair.server.statistics().local_objects, 2);

    pair.client.release_proxy(&shared).unwrap();
    assert_eq!(pair.client.proxy_reference_count(&shared), 1);
    assert_eq!(pair.server.statistics().local_objects, 2);

    pair.client.release_proxy(&shared).unwrap();
    assert_eq!(pair.client.proxy_reference_count(&shared), 0);
    assert_eq!(pair.client.statistics().remote_objects, 1);
    assert!(wait_until(SETTLE, || pair.server.statistics().local_objects == 1));

    assert!(matches!(
        pair.client.release_proxy(&shared),
        Err(Error::InvalidTarget)
    ));
}

#[test]
fn test_reexport_after_release_gets_fresh_proxy() {
    let (pair, _calc, proxy) = calculator_pair();
    let old = proxy.send_message("shared", vec![]).unwrap();
    let old = old.as_object().unwrap().clone();
    pair.client.release_proxy(&old).unwrap();
    assert!(wait_until(SETTLE, || pair.server.statistics().local_objects == 1));

    let new = proxy.send_message("shared", vec![]).unwrap();
    let new = new.as_object().unwrap();
    assert!(!new.ptr_eq(&old));
    assert_eq!(pair.client.proxy_reference_count(new), 1);
    assert_eq!(new.send_message("value", vec![]).unwrap(), Value::Int(7));
}

#[test]
fn test_release_proxy_rejects_plain_objects() {
    let (pair, calc, _proxy) = calculator_pair();
    let plain = Object::new(&calc.worker_class);
    assert!(matches!(
        pair.client.release_proxy(&plain),
        Err(Error::InvalidTarget)
    ));
    assert_eq!(pair.client.proxy_reference_count(&plain), 0);
}

#[test]
fn test_local_proxy_forwards_in_process() {
    let (pair, calc, _proxy) = calculator_pair();
    let worker = Object::new(&calc.worker_class);
    worker.set_ivar("value", 12);

    let local = DistantObject::with_local(&pair.client, &worker).unwrap();
    let distant = local.as_proxy().unwrap();
    assert!(distant.is_local());
    assert!(distant.local_object().unwrap().ptr_eq(&worker));

    let before = pair.client.statistics().requests_sent;
    assert_eq!(local.send_message("value", vec![]).unwrap(), Value::Int(12));
    assert_eq!(pair.client.statistics().requests_sent, before);
}

// ============================================================================
// References going home
// ============================================================================

#[test]
fn test_own_object_comes_back_as_itself() {
    let (pair, calc, proxy) = calculator_pair();
    let mine = Object::new(&calc.worker_class);

    let echoed = proxy
        .send_message("echo:", vec![Value::Object(Some(mine.clone()))])
        .unwrap();

    assert!(echoed.as_object().unwrap().ptr_eq(&mine));
    // The server dropped its proxy once the reply was out.
    assert!(wait_until(SETTLE, || pair.client.statistics().local_objects == 0));
    assert!(wait_until(SETTLE, || pair.server.statistics().remote_objects == 0));
}

#[test]
fn test_server_calls_back_into_client_object() {
    let (pair, _calc, proxy) = calculator_pair();
    let callback = Object::new(&worker_class());
    callback.set_ivar("value", 99);

    let value = proxy
        .send_message("valueOf:", vec![Value::Object(Some(callback))])
        .unwrap();

    assert_eq!(value, Value::Int(99));
    let client = pair.client.statistics();
    assert!(client.requests_received >= 1);
    assert!(wait_until(SETTLE, || pair.client.statistics().local_objects == 0));
}

#[test]
fn test_nil_object_argument() {
    let (_pair, _calc, proxy) = calculator_pair();
    let echoed = proxy
        .send_message("echo:", vec![Value::Object(None)])
        .unwrap();
    assert_eq!(echoed, Value::Object(None));
}

// ============================================================================
// By-copy archives
// ============================================================================

fn node_class() -> Class {
    Class::new_root(&unique_name("Node")).unwrap()
}

#[test]
fn test_bycopy_sends_a_copy_not_a_reference() {
    let (pair, _calc, proxy) = calculator_pair();
    let node = Object::new(&node_class());
    node.set_ivar("value", 3);

    let name = proxy
        .send_message("classNameOf:", vec![Value::Object(Some(node.clone()))])
        .unwrap();

    assert_eq!(name.as_str(), Some(node.class_name().as_str()));
    assert_eq!(pair.client.statistics().local_objects, 0);
}

#[test]
fn test_bycopy_archive_keeps_cycles_and_sharing() {
    let pair = common::connected_pair();
    let class = Class::new_root(&unique_name("Graph")).unwrap();
    class
        .add_method("isLoop:", "B@:O@", |_, inv| {
            let head = inv.argument(2)?.as_object().cloned().ok_or(Error::InvalidTarget)?;
            let next = head.ivar("next").and_then(|v| v.as_object().cloned());
            let other = head.ivar("other").and_then(|v| v.as_object().cloned());
            let looped = next.is_some_and(|n| {
                let back = n.ivar("next").and_then(|v| v.as_object().cloned());
                back.is_some_and(|b| b.ptr_eq(&head))
                    && other.is_some_and(|o| o.ptr_eq(&n))
                    && !head.is_proxy()
            });
            inv.set_return_value(Value::Bool(looped))
        })
        .unwrap();
    pair.server.set_root_object(Some(Object::new(&class)));
    let proxy = pair.client.root_proxy().unwrap();

    let node = node_class();
    let a = Object::new(&node);
    let b = Object::new(&node);
    a.set_ivar("next", b.clone());
    a.set_ivar("other", b.clone());
    b.set_ivar("next", a.clone());

    let looped = proxy
        .send_message("isLoop:", vec![Value::Object(Some(a.clone()))])
        .unwrap();
    assert_eq!(looped, Value::Bool(true));

    // Break the cycle so the test does not leak it.
    a.clear_ivars();
}

#[test]
fn test_class_name_override() {
    let (pair, _calc, proxy) = calculator_pair();
    let local = node_class();
    let wire = node_class();
    let object = Object::new(&local);

    pair.client
        .set_class_name_override(local.name(), wire.name());
    let name = proxy
        .send_message("classNameOf:", vec![Value::Object(Some(object.clone()))])
        .unwrap();
    assert_eq!(name.as_str(), Some(wire.name()));

    pair.client.remove_class_name_override(local.name());
    let name = proxy
        .send_message("classNameOf:", vec![Value::Object(Some(object))])
        .unwrap();
    assert_eq!(name.as_str(), Some(local.name()));
}

#[test]
fn test_unknown_archived_class_is_a_remote_exception() {
    let (pair, _calc, proxy) = calculator_pair();
    let local = node_class();
    pair.client
        .set_class_name_override(local.name(), &unique_name("NowhereClass"));

    let err = proxy
        .send_message("classNameOf:", vec![Value::Object(Some(Object::new(&local)))])
        .unwrap_err();

    assert!(matches!(err, Error::RemoteException { .. }), "{err:?}");
    assert!(pair.client.is_valid());
}
