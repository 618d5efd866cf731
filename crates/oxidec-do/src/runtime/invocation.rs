//! Reified message sends.
//!
//! An [`Invocation`] binds a [`MethodSignature`] to a target, a selector, one
//! typed slot per explicit argument and a return slot. It can be filled in
//! by index, dispatched any number of times, and is what a proxy serializes
//! when it forwards a message.
//!
//! # Argument indices
//!
//! Indices follow the signature: 0 is the receiver and 1 the selector, both
//! set through [`Invocation::set_target`] and [`Invocation::set_selector`].
//! Explicit arguments live at `2..number_of_arguments()`.
//!
//! # Target ownership
//!
//! The target is held weakly until [`Invocation::retain_arguments`] is
//! called, so building an invocation never extends the receiver's life.
//!
//! # Example
//!
//! ```rust
//! use oxidec_do::{Class, Invocation, Object, Selector, Value};
//!
//! let class = Class::new_root("DocDoubler").unwrap();
//! class
//!     .add_method("double:", "i@:i", |_, inv| {
//!         let n = inv.argument(2)?.as_i64().unwrap_or(0) as i32;
//!         inv.set_return_value(Value::Int(n * 2))
//!     })
//!     .unwrap();
//! let obj = Object::new(&class);
//!
//! let sel: Selector = "double:".parse().unwrap();
//! let mut inv = Invocation::new(class.lookup_method(&sel).unwrap().signature);
//! inv.set_target(&obj);
//! inv.set_selector(sel);
//! inv.set_argument(2, Value::Int(21)).unwrap();
//! inv.invoke().unwrap();
//! assert_eq!(inv.return_value().unwrap(), &Value::Int(42));
//! ```

use crate::error::{Error, Result};
use crate::runtime::encoding::TypeKind;
use crate::runtime::{Callable, MethodSignature, Object, Selector, Value, WeakObject};

#[derive(Debug, Clone)]
enum TargetRef {
    Unset,
    Weak(WeakObject),
    Strong(Object),
}

/// A message send with its arguments and result.
#[derive(Debug, Clone)]
pub struct Invocation {
    signature: MethodSignature,
    target: TargetRef,
    selector: Option<Selector>,
    /// Explicit arguments only; slot `i` is argument index `i + 2`.
    arguments: Vec<Value>,
    return_value: Value,
    return_valid: bool,
    retained: bool,
}

impl Invocation {
    /// Creates an invocation with every slot set to its type's zero value.
    #[must_use]
    pub fn new(signature: MethodSignature) -> Self {
        let arguments = signature
            .explicit_arguments()
            .iter()
            .map(|info| Value::zero(info.type_encoding()))
            .collect();
        let return_value = Value::zero(signature.return_info().type_encoding());
        Invocation {
            signature,
            target: TargetRef::Unset,
            selector: None,
            arguments,
            return_value,
            return_valid: false,
            retained: false,
        }
    }

    /// The signature this invocation was built from.
    #[must_use]
    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    /// Sets the receiver. Held weakly unless arguments are retained.
    pub fn set_target(&mut self, target: &Object) {
        self.target = if self.retained {
            TargetRef::Strong(target.clone())
        } else {
            TargetRef::Weak(target.downgrade())
        };
    }

    /// The receiver, if set and still alive.
    #[must_use]
    pub fn target(&self) -> Option<Object> {
        match &self.target {
            TargetRef::Unset => None,
            TargetRef::Weak(weak) => weak.upgrade(),
            TargetRef::Strong(obj) => Some(obj.clone()),
        }
    }

    /// Sets the selector.
    pub fn set_selector(&mut self, selector: Selector) {
        self.selector = Some(selector);
    }

    /// The selector, if set.
    #[must_use]
    pub fn selector(&self) -> Option<Selector> {
        self.selector
    }

    /// Whether the signature is `oneway`.
    #[must_use]
    pub fn is_oneway(&self) -> bool {
        self.signature.is_oneway()
    }

    fn slot_index(&self, index: usize) -> Result<usize> {
        let count = self.signature.number_of_arguments();
        if index < 2 || index >= count {
            return Err(Error::ArgumentIndexOutOfRange { index, count });
        }
        Ok(index - 2)
    }

    /// Stores an explicit argument.
    ///
    /// # Errors
    ///
    /// [`Error::ArgumentIndexOutOfRange`] outside `2..number_of_arguments()`,
    /// [`Error::ArgumentTypeMismatch`] if `value` does not fit the slot.
    pub fn set_argument(&mut self, index: usize, value: Value) -> Result<()> {
        let slot = self.slot_index(index)?;
        let info = self.signature.argument_info(index)?;
        value.check(info.type_encoding(), index)?;
        self.arguments[slot] = value;
        Ok(())
    }

    /// Reads an explicit argument.
    ///
    /// # Errors
    ///
    /// [`Error::ArgumentIndexOutOfRange`] outside `2..number_of_arguments()`.
    pub fn argument(&self, index: usize) -> Result<&Value> {
        let slot = self.slot_index(index)?;
        Ok(&self.arguments[slot])
    }

    /// Mutable access to an explicit argument, used to write through
    /// out-pointers.
    ///
    /// # Errors
    ///
    /// [`Error::ArgumentIndexOutOfRange`] outside `2..number_of_arguments()`.
    pub fn argument_mut(&mut self, index: usize) -> Result<&mut Value> {
        let slot = self.slot_index(index)?;
        Ok(&mut self.arguments[slot])
    }

    /// Writes `value` into the pointee of the pointer argument at `index`,
    /// allocating the pointee if the pointer is NULL.
    ///
    /// # Errors
    ///
    /// Index errors as for [`Invocation::argument`];
    /// [`Error::ArgumentTypeMismatch`] if the argument is not a pointer or the
    /// value does not fit the pointee type.
    pub fn set_pointee(&mut self, index: usize, value: Value) -> Result<()> {
        let slot = self.slot_index(index)?;
        let info = self.signature.argument_info(index)?;
        let TypeKind::Pointer(pointee) = info.type_encoding().kind() else {
            return Err(Error::ArgumentTypeMismatch {
                expected: info.tag(),
                got: crate::runtime::encoding::types::POINTER,
                index,
            });
        };
        if *pointee.kind() != TypeKind::Void {
            value.check(pointee, index)?;
        }
        self.arguments[slot] = Value::Pointer(Some(Box::new(value)));
        Ok(())
    }

    /// Copies exactly the argument's size from `bytes` (native layout).
    ///
    /// # Errors
    ///
    /// Index errors, [`Error::SizeMismatch`] if `bytes` is too short, or
    /// [`Error::NotImplemented`] for reference kinds.
    pub fn set_argument_bytes(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let slot = self.slot_index(index)?;
        let info = self.signature.argument_info(index)?;
        self.arguments[slot] = Value::from_native_bytes(info.type_encoding(), bytes)?;
        Ok(())
    }

    /// The argument in native layout, exactly its size in bytes.
    ///
    /// # Errors
    ///
    /// Index errors or [`Error::NotImplemented`] for reference kinds.
    pub fn argument_bytes(&self, index: usize) -> Result<Vec<u8>> {
        let slot = self.slot_index(index)?;
        let info = self.signature.argument_info(index)?;
        self.arguments[slot].to_native_bytes(info.type_encoding())
    }

    /// Stores the return value and marks it valid.
    ///
    /// # Errors
    ///
    /// [`Error::ArgumentTypeMismatch`] if `value` does not fit the return type.
    pub fn set_return_value(&mut self, value: Value) -> Result<()> {
        value.check(self.signature.return_info().type_encoding(), usize::MAX)?;
        self.return_value = value;
        self.return_valid = true;
        Ok(())
    }

    /// The return value.
    ///
    /// # Errors
    ///
    /// [`Error::ReturnValueUnavailable`] for a non-void return before the
    /// invocation was dispatched or a value was set.
    pub fn return_value(&self) -> Result<&Value> {
        if !self.return_valid && self.signature.method_return_length() > 0 {
            return Err(Error::ReturnValueUnavailable);
        }
        Ok(&self.return_value)
    }

    /// Copies exactly the return size from `bytes` and marks the value valid.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if `bytes` is too short, or
    /// [`Error::NotImplemented`] for reference kinds.
    pub fn set_return_value_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.return_value =
            Value::from_native_bytes(self.signature.return_info().type_encoding(), bytes)?;
        self.return_valid = true;
        Ok(())
    }

    /// The return value in native layout.
    ///
    /// # Errors
    ///
    /// As for [`Invocation::return_value`], plus [`Error::NotImplemented`] for
    /// reference kinds.
    pub fn return_value_bytes(&self) -> Result<Vec<u8>> {
        self.return_value()?
            .to_native_bytes(self.signature.return_info().type_encoding())
    }

    /// Takes ownership of the target so the invocation keeps it alive.
    ///
    /// Argument values are already owned copies. Calling this twice is a
    /// no-op.
    pub fn retain_arguments(&mut self) {
        if self.retained {
            return;
        }
        self.retained = true;
        if let TargetRef::Weak(weak) = &self.target {
            self.target = match weak.upgrade() {
                Some(obj) => TargetRef::Strong(obj),
                None => TargetRef::Unset,
            };
        }
    }

    /// Whether [`Invocation::retain_arguments`] has been called.
    #[must_use]
    pub fn arguments_retained(&self) -> bool {
        self.retained
    }

    /// Dispatches to the current target.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTarget`] if the target is unset or gone, otherwise
    /// whatever the receiver signals.
    pub fn invoke(&mut self) -> Result<()> {
        let target = self.target().ok_or(Error::InvalidTarget)?;
        self.invoke_with_target(&target)
    }

    /// Dispatches to `target` without changing the stored target.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTarget`] if no selector is set, otherwise whatever the
    /// receiver signals.
    pub fn invoke_with_target(&mut self, target: &Object) -> Result<()> {
        if self.selector.is_none() {
            return Err(Error::InvalidTarget);
        }
        target.forward_invocation(self)?;
        self.return_valid = true;
        Ok(())
    }

    /// All explicit argument values in order.
    #[must_use]
    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Replaces the return slot without a type check. Used by decoders that
    /// already validated the value against the signature.
    pub(crate) fn install_return_value(&mut self, value: Value) {
        self.return_value = value;
        self.return_valid = true;
    }

    /// Replaces an argument slot without a type check.
    pub(crate) fn install_argument(&mut self, slot: usize, value: Value) {
        if let Some(arg) = self.arguments.get_mut(slot) {
            *arg = value;
        }
    }
}
