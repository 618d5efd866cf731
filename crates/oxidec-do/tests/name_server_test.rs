//! Finding a vended object by name: local registration, lookup through a
//! remote daemon, and connecting to what a name resolves to.

mod common;

use common::{Calculator, connected_pair, wait_until};
use oxidec_do::port::{MemoryTransport, StreamListener};
use oxidec_do::{
    Connection, ConnectionConfig, DaemonClient, Error, LocalNameServer, NameDaemonServer, Port,
    PortNameServer, Value,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_registered_connection_is_found_and_forgotten() {
    let names = LocalNameServer::new();
    let pair = connected_pair();

    pair.server.register_name("calculator", &names).unwrap();
    let found = names.port_for_name("calculator").unwrap();
    assert_eq!(found.id(), pair.server.local_port().id());
    assert_eq!(names.names_for_port(&pair.server.local_port()), vec!["calculator"]);

    // A second connection cannot take the name.
    let other = connected_pair();
    assert!(matches!(
        other.server.register_name("calculator", &names),
        Err(Error::NameInUse { .. })
    ));

    pair.server.invalidate();
    assert!(wait_until(Duration::from_secs(5), || names.is_empty()));
    assert!(matches!(
        names.port_for_name("calculator"),
        Err(Error::NameNotFound { .. })
    ));
    other.server.register_name("calculator", &names).unwrap();
}

#[test]
fn test_one_port_many_names() {
    let names = LocalNameServer::new();
    let port = Port::new_local();
    names.register_port(&port, "alpha").unwrap();
    names.register_port(&port, "beta").unwrap();
    names.register_port(&port, "alpha").unwrap();
    assert_eq!(names.len(), 2);

    names.remove_port_for_name("alpha").unwrap();
    assert!(names.port_for_name("beta").is_ok());
    assert!(matches!(
        names.remove_port_for_name("alpha"),
        Err(Error::NameNotFound { .. })
    ));

    names.remove_port(&port);
    assert!(names.is_empty());
}

#[test]
fn test_lookup_falls_through_to_daemon() {
    let remote_names = LocalNameServer::with_daemon("far-host", None);
    let far_port = Port::new_local();
    remote_names.register_port(&far_port, "printer").unwrap();

    let (client_end, server_end) = MemoryTransport::pair();
    let daemon = NameDaemonServer::new(remote_names.clone());
    let server = thread::spawn(move || daemon.serve(&server_end));

    let names = LocalNameServer::with_daemon("near-host", Some(Arc::new(DaemonClient::new(client_end))));
    let near_port = Port::new_local();
    names.register_port(&near_port, "scanner").unwrap();

    // Local names never go to the daemon.
    assert_eq!(names.port_for_name_on_host("scanner", "*").unwrap().id(), near_port.id());
    // A wildcard miss and an explicit host both ask it.
    assert_eq!(names.port_for_name_on_host("printer", "*").unwrap().id(), far_port.id());
    assert_eq!(
        names.port_for_name_on_host("printer", "far-host").unwrap().id(),
        far_port.id()
    );
    assert!(matches!(
        names.port_for_name_on_host("fax", "far-host"),
        Err(Error::NameNotFound { .. })
    ));
    // Plain lookups stay local.
    assert!(names.port_for_name("printer").is_err());

    drop(names);
    server.join().unwrap().unwrap();
}

#[test]
fn test_connect_to_named_tcp_service() {
    let names = LocalNameServer::new();
    let config = ConnectionConfig::default();
    let listener = StreamListener::bind("127.0.0.1:0".parse().unwrap(), config.clone()).unwrap();
    let service_port = Port::with_id(listener.port_id().unwrap());
    names.register_port(&service_port, "adder").unwrap();

    let calc = Calculator::new();
    let root = calc.object();
    let server = thread::spawn(move || {
        let transport = listener.accept().unwrap();
        let connection = Connection::new(transport, ConnectionConfig::default()).unwrap();
        connection.set_root_object(Some(root));
        connection
    });

    let addr = names
        .port_for_name("adder")
        .unwrap()
        .id()
        .to_socket_addr()
        .expect("stream port id carries an address");
    let client = Connection::connect(addr, config).unwrap();
    let _server = server.join().unwrap();

    let adder = client.root_proxy().unwrap();
    let sum = adder
        .send_message("add:to:", vec![Value::Int(1), Value::Int(2)])
        .unwrap();
    assert_eq!(sum, Value::Int(3));
}
