//! `OxideC` Distributed Objects: remote message sends for the `OxideC`
//! object model.
//!
//! A message sent to a [`DistantObject`] proxy is captured as an
//! [`Invocation`], serialized by the port coder, written to a [`Port`] as a
//! [`PortMessage`](port::PortMessage), executed against the real object in
//! the peer process, and answered with the return value plus any
//! `out`/`inout` values.
//!
//! # Layers
//!
//! - [`runtime`]: selectors, type encodings and [`MethodSignature`],
//!   classes, protocols, objects and invocations
//! - [`port`]: endpoint ids, the message frame format and transports
//! - [`coder`]: self-describing value and object marshaling
//! - [`proxy`] and [`connection`]: proxies, proxy tables, request/reply
//!   matching
//! - [`name_server`]: names for ports, locally or through a daemon
//! - [`lock`]: a cross-process lock
//!
//! # Example
//!
//! ```rust
//! use oxidec_do::{Class, Invocation, MethodSignature, Object, Selector, Value};
//!
//! let class = Class::new_root("LibDocGreeter").unwrap();
//! class
//!     .add_method("greet:", "i@:i", |_, inv| {
//!         let n = inv.argument(2)?.as_i64().unwrap_or(0) as i32;
//!         inv.set_return_value(Value::Int(n + 1))
//!     })
//!     .unwrap();
//!
//! let signature: MethodSignature = "i@:i".parse().unwrap();
//! assert_eq!(signature.number_of_arguments(), 3);
//!
//! let mut inv = Invocation::new(signature);
//! inv.set_selector("greet:".parse::<Selector>().unwrap());
//! inv.set_argument(2, Value::Int(1)).unwrap();
//! inv.invoke_with_target(&Object::new(&class)).unwrap();
//! assert_eq!(inv.return_value().unwrap(), &Value::Int(2));
//! ```

pub mod coder;
pub mod config;
pub mod connection;
pub mod error;
pub mod lock;
pub mod name_server;
pub mod port;
pub mod proxy;
pub mod runtime;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionStatistics};
pub use error::{Error, Result};
pub use lock::DistributedLock;
pub use name_server::{DaemonClient, LocalNameServer, NameDaemon, NameDaemonServer, PortNameServer};
pub use port::{Port, PortId};
pub use proxy::DistantObject;
pub use runtime::{
    ArgumentInfo, Callable, Class, Invocation, Method, MethodSignature, Object, Protocol,
    Qualifiers, Selector, TypeEncoding, Value,
};
