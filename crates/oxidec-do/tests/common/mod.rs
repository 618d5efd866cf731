// Shared fixtures for the integration tests.
//
// Classes and protocols live in process-wide registries, so every fixture
// takes a fresh name from `unique_name`.

#![allow(dead_code)]

use oxidec_do::port::MemoryTransport;
use oxidec_do::{Class, Connection, ConnectionConfig, Error, Object, Protocol, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A registry name no other fixture has used.
pub fn unique_name(prefix: &str) -> String {
    let id = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{id}")
}

/// Two connected ends over an in-memory link, plus the client's transport
/// so tests can cut the link underneath it.
pub struct Pair {
    pub server: Connection,
    pub client: Connection,
    pub client_transport: Arc<MemoryTransport>,
}

pub fn connected_pair() -> Pair {
    connected_pair_with(ConnectionConfig::default())
}

pub fn connected_pair_with(config: ConnectionConfig) -> Pair {
    let (a, b) = MemoryTransport::pair();
    let server = Connection::new(a, config.clone()).expect("server connection");
    let client_transport = Arc::new(b);
    let client = Connection::with_shared_transport(client_transport.clone(), config)
        .expect("client connection");
    Pair {
        server,
        client,
        client_transport,
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn int_arg(inv: &oxidec_do::Invocation, index: usize) -> Result<i64, Error> {
    Ok(inv.argument(index)?.as_i64().unwrap_or_default())
}

/// A one-shot gate a server method can block on.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (lock, cvar) = &*self.state;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

/// Methods of the calculator root object:
///
/// - `add:to:` (`i@:ii`)
/// - `divide:by:remainder:` with an out pointer (`i@:iio^i`)
/// - `increment:` with an inout pointer (`v@:N^i`)
/// - `peek:` with an in pointer (`i@:n^i`)
/// - `scale:` on a struct (`{Point=ii}@:{Point=ii}`)
/// - `sum:` on a fixed array (`i@:[4i]`)
/// - `delay:value:` sleeps then answers (`i@:Ii`)
/// - `hold:` waits for the fixture's gate (`i@:i`)
/// - `fail` always raises (`v@:`)
/// - `echo:` returns its argument (`@@:@`)
/// - `shared` returns the same worker every time (`@@:`)
/// - `spawn` returns a fresh worker (`@@:`)
/// - `sibling` returns a fresh calculator (`@@:`)
/// - `valueOf:` sends `value` back to its argument (`i@:@`)
/// - `classNameOf:` names the class of a copied object (`*@:O@`)
/// - `notify:` records its argument without a reply (`Vv@:i`)
pub struct Calculator {
    pub class: Class,
    pub worker_class: Class,
    pub protocol: Protocol,
    pub gate: Gate,
    pub notified: Arc<Mutex<Vec<i64>>>,
    pub shared: Object,
}

const CALCULATOR_METHODS: &[(&str, &str)] = &[
    ("add:to:", "i@:ii"),
    ("divide:by:remainder:", "i@:iio^i"),
    ("increment:", "v@:N^i"),
    ("peek:", "i@:n^i"),
    ("scale:", "{Point=ii}@:{Point=ii}"),
    ("sum:", "i@:[4i]"),
    ("delay:value:", "i@:Ii"),
    ("hold:", "i@:i"),
    ("fail", "v@:"),
    ("echo:", "@@:@"),
    ("shared", "@@:"),
    ("spawn", "@@:"),
    ("sibling", "@@:"),
    ("valueOf:", "i@:@"),
    ("classNameOf:", "*@:O@"),
    ("notify:", "Vv@:i"),
];

impl Calculator {
    pub fn new() -> Self {
        let worker_class = worker_class();
        let class = Class::new_root(&unique_name("Calculator")).expect("calculator class");
        let protocol =
            Protocol::new(&unique_name("CalculatorProtocol"), None).expect("calculator protocol");
        for (selector, types) in CALCULATOR_METHODS {
            protocol.add_method(selector, types).expect("protocol method");
        }

        let gate = Gate::default();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let shared = Object::new(&worker_class);
        shared.set_ivar("value", 7);

        class
            .add_method("add:to:", "i@:ii", |_, inv| {
                let sum = int_arg(inv, 2)? + int_arg(inv, 3)?;
                inv.set_return_value(Value::Int(sum as i32))
            })
            .unwrap();
        class
            .add_method("divide:by:remainder:", "i@:iio^i", |_, inv| {
                let (a, b) = (int_arg(inv, 2)?, int_arg(inv, 3)?);
                if b == 0 {
                    return Err(Error::RemoteException {
                        reason: "division by zero".into(),
                    });
                }
                inv.set_pointee(4, Value::Int((a % b) as i32))?;
                inv.set_return_value(Value::Int((a / b) as i32))
            })
            .unwrap();
        class
            .add_method("increment:", "v@:N^i", |_, inv| {
                let current = inv
                    .argument(2)?
                    .pointee()
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                inv.set_pointee(2, Value::Int(current as i32 + 1))
            })
            .unwrap();
        class
            .add_method("peek:", "i@:n^i", |_, inv| {
                let seen = inv.argument(2)?.pointee().and_then(Value::as_i64);
                let seen = seen.map_or(-1, |v| v as i32);
                inv.set_pointee(2, Value::Int(0))?;
                inv.set_return_value(Value::Int(seen))
            })
            .unwrap();
        class
            .add_method("scale:", "{Point=ii}@:{Point=ii}", |_, inv| {
                let Value::Struct(fields) = inv.argument(2)?.clone() else {
                    return Err(Error::InvalidTarget);
                };
                let doubled = fields
                    .iter()
                    .map(|f| Value::Int(f.as_i64().unwrap_or_default() as i32 * 2))
                    .collect();
                inv.set_return_value(Value::Struct(doubled))
            })
            .unwrap();
        class
            .add_method("sum:", "i@:[4i]", |_, inv| {
                let Value::Array(items) = inv.argument(2)? else {
                    return Err(Error::InvalidTarget);
                };
                let total: i64 = items.iter().filter_map(Value::as_i64).sum();
                inv.set_return_value(Value::Int(total as i32))
            })
            .unwrap();
        class
            .add_method("delay:value:", "i@:Ii", |_, inv| {
                let millis = int_arg(inv, 2)?;
                thread::sleep(Duration::from_millis(millis as u64));
                let value = int_arg(inv, 3)?;
                inv.set_return_value(Value::Int(value as i32))
            })
            .unwrap();
        let hold_gate = gate.clone();
        class
            .add_method("hold:", "i@:i", move |_, inv| {
                hold_gate.wait();
                let value = int_arg(inv, 2)?;
                inv.set_return_value(Value::Int(value as i32))
            })
            .unwrap();
        class
            .add_method("fail", "v@:", |_, _| {
                Err(Error::RemoteException {
                    reason: "calculator on fire".into(),
                })
            })
            .unwrap();
        class
            .add_method("echo:", "@@:@", |_, inv| {
                let arg = inv.argument(2)?.clone();
                inv.set_return_value(arg)
            })
            .unwrap();
        let shared_worker = shared.clone();
        class
            .add_method("shared", "@@:", move |_, inv| {
                inv.set_return_value(Value::Object(Some(shared_worker.clone())))
            })
            .unwrap();
        let spawn_class = worker_class.clone();
        class
            .add_method("spawn", "@@:", move |_, inv| {
                let worker = Object::new(&spawn_class);
                worker.set_ivar("value", 1);
                inv.set_return_value(Value::Object(Some(worker)))
            })
            .unwrap();
        let sibling_class = class.clone();
        class
            .add_method("sibling", "@@:", move |_, inv| {
                inv.set_return_value(Value::Object(Some(Object::new(&sibling_class))))
            })
            .unwrap();
        class
            .add_method("valueOf:", "i@:@", |_, inv| {
                let target = inv.argument(2)?.as_object().cloned().ok_or(Error::InvalidTarget)?;
                let value = target.send_message("value", vec![])?;
                inv.set_return_value(value)
            })
            .unwrap();
        class
            .add_method("classNameOf:", "*@:O@", |_, inv| {
                let name = match inv.argument(2)?.as_object() {
                    Some(object) if object.is_proxy() => "proxy".to_owned(),
                    Some(object) => object.class_name(),
                    None => "nil".to_owned(),
                };
                inv.set_return_value(Value::CString(Some(name.into_bytes())))
            })
            .unwrap();
        let notify_log = notified.clone();
        class
            .add_method("notify:", "Vv@:i", move |_, inv| {
                notify_log.lock().unwrap().push(int_arg(inv, 2)?);
                Ok(())
            })
            .unwrap();

        Calculator {
            class,
            worker_class,
            protocol,
            gate,
            notified,
            shared,
        }
    }

    pub fn object(&self) -> Object {
        Object::new(&self.class)
    }
}

/// A class whose instances answer `value` (`i@:`) from their `value` ivar.
pub fn worker_class() -> Class {
    let class = Class::new_root(&unique_name("Worker")).expect("worker class");
    class
        .add_method("value", "i@:", |this, inv| {
            let value = this.ivar("value").and_then(|v| v.as_i64()).unwrap_or_default();
            inv.set_return_value(Value::Int(value as i32))
        })
        .unwrap();
    class
}

/// A server with a calculator root and a client proxy for it that already
/// knows the calculator protocol, so calls need no signature round trip.
pub fn calculator_pair() -> (Pair, Calculator, Object) {
    calculator_pair_with(ConnectionConfig::default())
}

pub fn calculator_pair_with(config: ConnectionConfig) -> (Pair, Calculator, Object) {
    let pair = connected_pair_with(config);
    let calculator = Calculator::new();
    pair.server.set_root_object(Some(calculator.object()));
    let proxy = pair.client.root_proxy().expect("root proxy");
    proxy
        .as_proxy()
        .expect("root is a proxy")
        .set_protocol(Some(calculator.protocol.clone()));
    (pair, calculator, proxy)
}
