//! The object model remote messages are built on.
//!
//! - [`selector`]: interned method names
//! - [`encoding`]: type encodings and [`MethodSignature`]
//! - [`value`]: typed argument/return [`Value`]s
//! - [`class`], [`protocol`], [`object`]: classes, protocols and objects
//! - [`invocation`]: reified message sends

pub mod class;
pub mod encoding;
pub mod invocation;
pub mod object;
pub mod protocol;
pub mod selector;
pub mod value;

pub use class::{Class, Imp, Method};
pub use encoding::{ArgumentInfo, MethodSignature, Qualifiers, TypeEncoding, TypeKind};
pub use invocation::Invocation;
pub use object::{Callable, Object, WeakObject};
pub use protocol::Protocol;
pub use selector::Selector;
pub use value::Value;
