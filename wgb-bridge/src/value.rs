// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Host value model for the guest bridge.
//!
//! The guest names host values through integer handles; on the host side a
//! value is a [`HostValue`] — an explicit sum type covering the kinds the
//! wire format can tag. Reflection over objects goes through the
//! [`HostObject`] capability trait rather than assuming universal reflection:
//! a type exposed to the guest registers an adapter implementing the
//! operations it supports. Reflective failures travel as ordinary host
//! values ([`ReflectResult`]), never as native errors, so the guest's own
//! error path decides what happens next.

use std::rc::Rc;

use core::cell::RefCell;
use core::fmt;

use wgb_error::Error;

use crate::bridge::Bridge;

/// Result type for reflective host operations.
///
/// The error side is itself a host value; the Call Bridge writes it across
/// the boundary together with a `success = 0` flag.
pub type ReflectResult<T> = core::result::Result<T, HostValue>;

/// A host value reachable from the guest.
#[derive(Clone)]
pub enum HostValue {
    /// The absent value; shares the all-zero wire pattern with nothing else.
    Undefined,
    /// A double-precision number.
    Number(f64),
    /// The null object value.
    Null,
    /// A boolean.
    Bool(bool),
    /// An immutable string.
    String(Rc<str>),
    /// A unique symbol; equal content does not imply equal identity.
    Symbol(Rc<str>),
    /// A mutable byte array.
    Bytes(BytesValue),
    /// An object behind a reflection adapter.
    Object(Rc<dyn HostObject>),
    /// A callable host function.
    Function(HostFunc),
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "Undefined"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Symbol(s) => write!(f, "Symbol({s:?})"),
            Self::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            Self::Object(o) => write!(f, "Object({})", o.type_name()),
            Self::Function(_) => write!(f, "Function"),
        }
    }
}

/// Identity key used by the value table to deduplicate host values.
///
/// Strings deduplicate by content; objects, byte arrays, functions and
/// symbols deduplicate by allocation identity. Numbers other than zero and
/// `Undefined` have no key: they never enter the table.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum IdentityKey {
    /// The number zero (reserved constant handle).
    Zero,
    /// The null value.
    Null,
    /// The boolean true.
    True,
    /// The boolean false.
    False,
    /// A string, keyed by content.
    Str(Rc<str>),
    /// An allocation identity.
    Ptr(usize),
}

impl HostValue {
    /// Identity key for table deduplication, if this value is internalizable.
    #[must_use]
    pub fn identity_key(&self) -> Option<IdentityKey> {
        match self {
            Self::Undefined => None,
            Self::Number(n) => (*n == 0.0).then_some(IdentityKey::Zero),
            Self::Null => Some(IdentityKey::Null),
            Self::Bool(true) => Some(IdentityKey::True),
            Self::Bool(false) => Some(IdentityKey::False),
            Self::String(s) => Some(IdentityKey::Str(s.clone())),
            Self::Symbol(s) => Some(IdentityKey::Ptr(Rc::as_ptr(s) as *const u8 as usize)),
            Self::Bytes(b) => Some(IdentityKey::Ptr(b.identity())),
            Self::Object(o) => Some(IdentityKey::Ptr(Rc::as_ptr(o) as *const () as usize)),
            Self::Function(f) => Some(IdentityKey::Ptr(f.identity())),
        }
    }

    /// Whether two values are the same identity (or the same number bits).
    #[must_use]
    pub fn identity_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) => true,
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits(),
            _ => match (self.identity_key(), other.identity_key()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Borrow the string content if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric content if this is a number value.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// A human-readable rendering used by string materialization and debug
    /// logging.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.to_string(),
            Self::Symbol(s) => format!("Symbol({s})"),
            Self::Bytes(b) => format!("[bytes {}]", b.len()),
            Self::Object(o) => format!("[object {}]", o.type_name()),
            Self::Function(_) => "[function]".to_string(),
        }
    }
}

/// Format a number the way the guest expects to see it in strings: integral
/// values without a trailing fraction.
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Capability-scoped reflection over a host object.
///
/// Every operation the Call Bridge can perform on an object has a method
/// here. Adapters implement what their type supports; the defaults reject
/// the operation with an error value. Mutating and getter paths receive the
/// bridge because they may synchronously re-enter guest code.
#[allow(unused_variables)]
pub trait HostObject {
    /// Name reported in error messages and debug output.
    fn type_name(&self) -> &'static str;

    /// Property get by name.
    fn get(&self, bridge: &mut Bridge, key: &str) -> ReflectResult<HostValue> {
        Err(reflect_error("property access is not supported on this value"))
    }

    /// Property set by name.
    fn set(&self, bridge: &mut Bridge, key: &str, value: HostValue) -> ReflectResult<()> {
        Err(reflect_error("property assignment is not supported on this value"))
    }

    /// Property delete by name.
    fn delete(&self, bridge: &mut Bridge, key: &str) -> ReflectResult<()> {
        Err(reflect_error("property deletion is not supported on this value"))
    }

    /// Indexed get.
    fn get_index(&self, bridge: &mut Bridge, index: i64) -> ReflectResult<HostValue> {
        Err(reflect_error("indexed access is not supported on this value"))
    }

    /// Indexed set.
    fn set_index(&self, bridge: &mut Bridge, index: i64, value: HostValue) -> ReflectResult<()> {
        Err(reflect_error("indexed assignment is not supported on this value"))
    }

    /// Constructor call.
    fn construct(&self, bridge: &mut Bridge, args: &[HostValue]) -> ReflectResult<HostValue> {
        Err(reflect_error("this value is not a constructor"))
    }

    /// Structural instance-of test against a candidate constructor value.
    fn instance_of(&self, constructor: &HostValue) -> bool {
        false
    }

    /// Element count, for values with a length.
    fn length(&self) -> ReflectResult<i64> {
        Err(reflect_error("this value has no length"))
    }
}

/// Signature of a callable host function.
///
/// Receives the bridge (host functions may re-enter the guest), the calling
/// context value and the argument list.
pub type HostFnInner = dyn Fn(&mut Bridge, HostValue, &[HostValue]) -> ReflectResult<HostValue>;

/// A cheaply clonable host function value with allocation identity.
#[derive(Clone)]
pub struct HostFunc(Rc<HostFnInner>);

impl HostFunc {
    /// Wrap a closure as a host function value.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Bridge, HostValue, &[HostValue]) -> ReflectResult<HostValue> + 'static,
    {
        Self(Rc::new(f))
    }

    /// Apply the function.
    pub fn call(
        &self,
        bridge: &mut Bridge,
        this: HostValue,
        args: &[HostValue],
    ) -> ReflectResult<HostValue> {
        // Clone keeps the function alive even if the call releases its handle.
        let f = self.0.clone();
        f(bridge, this, args)
    }

    /// Allocation identity for deduplication.
    #[must_use]
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunc({:#x})", self.identity())
    }
}

/// A mutable byte array host value.
#[derive(Clone)]
pub struct BytesValue(Rc<RefCell<Vec<u8>>>);

impl BytesValue {
    /// Wrap a byte vector.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Rc::new(RefCell::new(bytes)))
    }

    /// Zero-filled byte array of the given length.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Current length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Whether the array is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the content.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    /// Overwrite a prefix of the array from `src`, returning the number of
    /// bytes written (clamped to the shorter of the two).
    pub fn write_prefix(&self, src: &[u8]) -> usize {
        let mut dst = self.0.borrow_mut();
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Run a closure over the mutable content.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    /// Allocation identity for deduplication.
    #[must_use]
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    /// Byte at `index`, if in range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u8> {
        self.0.borrow().get(index).copied()
    }
}

impl fmt::Debug for BytesValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BytesValue(len={})", self.len())
    }
}

/// A generic property-bag object.
///
/// Used for the global object, embedder-registered facades and error
/// values. Missing properties read as `Undefined`.
pub struct DictObject {
    name: &'static str,
    entries: RefCell<std::collections::BTreeMap<String, HostValue>>,
}

impl DictObject {
    /// Create an empty object with a debug name.
    #[must_use]
    pub fn new(name: &'static str) -> Rc<Self> {
        Rc::new(Self { name, entries: RefCell::new(std::collections::BTreeMap::new()) })
    }

    /// Insert a property without going through reflection.
    pub fn insert(&self, key: &str, value: HostValue) {
        self.entries.borrow_mut().insert(key.to_string(), value);
    }

    /// Direct property read without going through reflection.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<HostValue> {
        self.entries.borrow().get(key).cloned()
    }
}

impl HostObject for DictObject {
    fn type_name(&self) -> &'static str {
        self.name
    }

    fn get(&self, _bridge: &mut Bridge, key: &str) -> ReflectResult<HostValue> {
        Ok(self.lookup(key).unwrap_or(HostValue::Undefined))
    }

    fn set(&self, _bridge: &mut Bridge, key: &str, value: HostValue) -> ReflectResult<()> {
        self.insert(key, value);
        Ok(())
    }

    fn delete(&self, _bridge: &mut Bridge, key: &str) -> ReflectResult<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    fn length(&self) -> ReflectResult<i64> {
        match self.lookup("length") {
            Some(HostValue::Number(n)) => Ok(n as i64),
            _ => Err(reflect_error("this value has no length")),
        }
    }
}

/// A growable array object with indexed access.
pub struct ArrayObject {
    items: RefCell<Vec<HostValue>>,
}

impl ArrayObject {
    /// Wrap a vector of values.
    #[must_use]
    pub fn new(items: Vec<HostValue>) -> Rc<Self> {
        Rc::new(Self { items: RefCell::new(items) })
    }

    /// Snapshot of the elements.
    #[must_use]
    pub fn to_vec(&self) -> Vec<HostValue> {
        self.items.borrow().clone()
    }
}

impl HostObject for ArrayObject {
    fn type_name(&self) -> &'static str {
        "array"
    }

    fn get(&self, _bridge: &mut Bridge, key: &str) -> ReflectResult<HostValue> {
        match key {
            "length" => Ok(HostValue::Number(self.items.borrow().len() as f64)),
            _ => Ok(HostValue::Undefined),
        }
    }

    fn get_index(&self, _bridge: &mut Bridge, index: i64) -> ReflectResult<HostValue> {
        let items = self.items.borrow();
        usize::try_from(index)
            .ok()
            .and_then(|i| items.get(i).cloned())
            .map_or_else(|| Err(reflect_error("array index out of range")), Ok)
    }

    fn set_index(&self, _bridge: &mut Bridge, index: i64, value: HostValue) -> ReflectResult<()> {
        let mut items = self.items.borrow_mut();
        let i = usize::try_from(index)
            .map_err(|_| reflect_error("array index out of range"))?;
        if i >= items.len() {
            items.resize(i + 1, HostValue::Undefined);
        }
        items[i] = value;
        Ok(())
    }

    fn length(&self) -> ReflectResult<i64> {
        Ok(self.items.borrow().len() as i64)
    }
}

/// Build an error value carrying a message property.
#[must_use]
pub fn reflect_error(message: &str) -> HostValue {
    let err = DictObject::new("error");
    err.insert("message", HostValue::String(Rc::from(message)));
    HostValue::Object(err)
}

/// Convert a bridge protocol error into an error value for the guest-visible
/// failure channel.
#[must_use]
pub fn reflect_error_from(err: Error) -> HostValue {
    reflect_error(err.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_identity_is_by_content() {
        let a = HostValue::String(Rc::from("hello"));
        let b = HostValue::String(Rc::from("hello"));
        assert_eq!(a.identity_key(), b.identity_key());
        assert!(a.identity_eq(&b));
    }

    #[test]
    fn object_identity_is_by_allocation() {
        let a = HostValue::Object(DictObject::new("a"));
        let b = HostValue::Object(DictObject::new("a"));
        assert_ne!(a.identity_key(), b.identity_key());
        let c = a.clone();
        assert!(a.identity_eq(&c));
    }

    #[test]
    fn nonzero_numbers_have_no_identity() {
        assert!(HostValue::Number(1.5).identity_key().is_none());
        assert_eq!(HostValue::Number(0.0).identity_key(), Some(IdentityKey::Zero));
        assert_eq!(HostValue::Number(-0.0).identity_key(), Some(IdentityKey::Zero));
        assert!(HostValue::Undefined.identity_key().is_none());
    }

    #[test]
    fn bytes_prefix_copy_clamps() {
        let b = BytesValue::zeroed(3);
        assert_eq!(b.write_prefix(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(b.to_vec(), vec![1, 2, 3]);
        assert_eq!(b.write_prefix(&[9]), 1);
        assert_eq!(b.to_vec(), vec![9, 2, 3]);
    }

    #[test]
    fn display_strings() {
        assert_eq!(HostValue::Number(3.0).to_display_string(), "3");
        assert_eq!(HostValue::Number(3.5).to_display_string(), "3.5");
        assert_eq!(HostValue::Undefined.to_display_string(), "undefined");
        assert_eq!(HostValue::Bool(true).to_display_string(), "true");
    }
}
