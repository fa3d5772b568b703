// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Reference table mapping host values to guest-visible handles.
//!
//! The guest holds opaque integer handles, not references the host can
//! trace, so collection is an explicit owning map with per-handle reference
//! counts and a free pool of released slots. Invariants:
//!
//! - a handle appears in the identity map if and only if its refcount is
//!   greater than zero;
//! - a handle returns to the pool only when its refcount reaches exactly
//!   zero, never before;
//! - internalizing the same identity twice while a reference is live yields
//!   the same handle.
//!
//! Handles below the reserved boundary name permanent constants and are
//! never recycled; their refcounts saturate.

use crate::prelude::*;
use crate::value::IdentityKey;

/// Guest-visible identifier of a host value.
pub type Handle = u32;

/// Reserved constant handle: the canonical NaN.
pub const HANDLE_NAN: Handle = 0;
/// Reserved constant handle: the number zero.
pub const HANDLE_ZERO: Handle = 1;
/// Reserved constant handle: null.
pub const HANDLE_NULL: Handle = 2;
/// Reserved constant handle: true.
pub const HANDLE_TRUE: Handle = 3;
/// Reserved constant handle: false.
pub const HANDLE_FALSE: Handle = 4;
/// Reserved constant handle: the global object.
pub const HANDLE_GLOBAL: Handle = 5;
/// Reserved constant handle: the bridge instance itself.
pub const HANDLE_BRIDGE: Handle = 6;
/// Reserved constant handle: the optional shared object.
pub const HANDLE_SHARED: Handle = 7;

const INVALID_HANDLE: Error = Error::new(
    ErrorCategory::Resource,
    codes::INVALID_HANDLE,
    "Handle does not name a live host value",
);

const NOT_INTERNALIZABLE: Error = Error::new(
    ErrorCategory::Resource,
    codes::NOT_INTERNALIZABLE,
    "Numbers and undefined never enter the value table",
);

const OVER_RELEASED: Error = Error::new(
    ErrorCategory::Resource,
    codes::OVER_RELEASED_HANDLE,
    "Handle released more times than it was referenced",
);

/// Bidirectional map between host values and handles with reference counts.
pub struct ValueTable {
    values: Vec<Option<HostValue>>,
    ref_counts: Vec<u32>,
    ids: HashMap<IdentityKey, Handle>,
    pool: Vec<Handle>,
    reserved: Handle,
}

impl fmt::Debug for ValueTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueTable")
            .field("slots", &self.values.len())
            .field("live", &self.ids.len())
            .field("pooled", &self.pool.len())
            .finish()
    }
}

impl ValueTable {
    /// Build a table seeded with the reserved constant handles.
    ///
    /// `global` is the host environment's global object (handle 5),
    /// `bridge` the bridge instance value (handle 6). When `shared` is set
    /// it is seeded as handle 7; which constant handles exist is
    /// configuration, not semantics.
    #[must_use]
    pub fn new(global: HostValue, bridge: HostValue, shared: Option<HostValue>) -> Self {
        let mut seeds: Vec<(HostValue, Option<IdentityKey>)> = vec![
            (HostValue::Number(f64::NAN), None),
            (HostValue::Number(0.0), Some(IdentityKey::Zero)),
            (HostValue::Null, Some(IdentityKey::Null)),
            (HostValue::Bool(true), Some(IdentityKey::True)),
            (HostValue::Bool(false), Some(IdentityKey::False)),
        ];
        seeds.push((global.clone(), global.identity_key()));
        seeds.push((bridge.clone(), bridge.identity_key()));
        if let Some(shared) = shared {
            let key = shared.identity_key();
            seeds.push((shared, key));
        }

        let reserved = seeds.len() as Handle;
        let mut values = Vec::with_capacity(seeds.len());
        let mut ids = HashMap::new();
        for (handle, (value, key)) in seeds.into_iter().enumerate() {
            if let Some(key) = key {
                ids.insert(key, handle as Handle);
            }
            values.push(Some(value));
        }
        let ref_counts = vec![u32::MAX; values.len()];

        Self { values, ref_counts, ids, pool: Vec::new(), reserved }
    }

    /// Number of permanently reserved constant handles.
    #[must_use]
    pub fn reserved(&self) -> Handle {
        self.reserved
    }

    /// Look up or allocate the handle for `value`, incrementing its
    /// reference count.
    ///
    /// The same identity always resolves to the same handle while any prior
    /// reference is alive.
    pub fn internalize(&mut self, value: &HostValue) -> Result<Handle> {
        let key = value.identity_key().ok_or(NOT_INTERNALIZABLE)?;

        if let Some(&handle) = self.ids.get(&key) {
            let rc = &mut self.ref_counts[handle as usize];
            *rc = rc.saturating_add(1);
            return Ok(handle);
        }

        let handle = match self.pool.pop() {
            Some(handle) => handle,
            None => {
                self.values.push(None);
                self.ref_counts.push(0);
                (self.values.len() - 1) as Handle
            }
        };
        self.values[handle as usize] = Some(value.clone());
        self.ref_counts[handle as usize] = 1;
        self.ids.insert(key, handle);
        Ok(handle)
    }

    /// Read the value a handle names. Never changes reference counts.
    pub fn externalize(&self, handle: Handle) -> Result<HostValue> {
        self.values
            .get(handle as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(INVALID_HANDLE)
    }

    /// Drop one reference to a handle.
    ///
    /// On reaching zero the slot is cleared, the identity mapping removed
    /// and the handle returned to the pool. Releasing a reserved constant
    /// handle is a no-op.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        if handle < self.reserved {
            return Ok(());
        }
        let idx = handle as usize;
        let key = match self.values.get(idx).and_then(Option::as_ref) {
            Some(value) => value.identity_key(),
            None => return Err(INVALID_HANDLE),
        };
        if self.ref_counts[idx] == 0 {
            return Err(OVER_RELEASED);
        }
        self.ref_counts[idx] -= 1;
        if self.ref_counts[idx] == 0 {
            if let Some(key) = key {
                self.ids.remove(&key);
            }
            self.values[idx] = None;
            self.pool.push(handle);
        }
        Ok(())
    }

    /// Current reference count of a handle (reserved handles saturate).
    pub fn ref_count(&self, handle: Handle) -> Result<u32> {
        self.ref_counts.get(handle as usize).copied().ok_or(INVALID_HANDLE)
    }

    /// Number of live (non-reserved) values.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.ids.len().saturating_sub(self.reserved as usize - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DictObject;

    fn table() -> ValueTable {
        ValueTable::new(
            HostValue::Object(DictObject::new("global")),
            HostValue::Object(DictObject::new("bridge")),
            None,
        )
    }

    #[test]
    fn reserved_constants_are_seeded() {
        let t = table();
        assert_eq!(t.reserved(), 7);
        assert!(matches!(t.externalize(HANDLE_NULL).unwrap(), HostValue::Null));
        assert!(matches!(t.externalize(HANDLE_TRUE).unwrap(), HostValue::Bool(true)));
        assert!(matches!(t.externalize(HANDLE_FALSE).unwrap(), HostValue::Bool(false)));
        let nan = t.externalize(HANDLE_NAN).unwrap().as_number().unwrap();
        assert!(nan.is_nan());
        assert_eq!(t.externalize(HANDLE_ZERO).unwrap().as_number(), Some(0.0));
    }

    #[test]
    fn shared_handle_is_configuration() {
        let t = ValueTable::new(
            HostValue::Object(DictObject::new("global")),
            HostValue::Object(DictObject::new("bridge")),
            Some(HostValue::Object(DictObject::new("shared"))),
        );
        assert_eq!(t.reserved(), 8);
        assert!(matches!(t.externalize(HANDLE_SHARED).unwrap(), HostValue::Object(_)));
    }

    #[test]
    fn internalize_deduplicates_by_identity() {
        let mut t = table();
        let v = HostValue::Object(DictObject::new("x"));
        let h1 = t.internalize(&v).unwrap();
        let h2 = t.internalize(&v).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(t.ref_count(h1).unwrap(), 2);

        // Release twice before the slot is reclaimed.
        t.release(h1).unwrap();
        assert_eq!(t.ref_count(h1).unwrap(), 1);
        assert!(t.externalize(h1).is_ok());
        t.release(h1).unwrap();
        assert!(t.externalize(h1).is_err());
    }

    #[test]
    fn released_handles_are_pooled_and_reused_only_after_zero() {
        let mut t = table();
        let a = HostValue::Object(DictObject::new("a"));
        let b = HostValue::Object(DictObject::new("b"));

        let ha = t.internalize(&a).unwrap();
        let _ = t.internalize(&a).unwrap(); // second live reference

        // A different live value never lands on a's handle.
        let hb = t.internalize(&b).unwrap();
        assert_ne!(ha, hb);

        t.release(ha).unwrap();
        // Still one reference outstanding: another value must not reuse ha.
        let c = HostValue::Object(DictObject::new("c"));
        let hc = t.internalize(&c).unwrap();
        assert_ne!(ha, hc);

        t.release(ha).unwrap();
        // Now the slot is free and may be reused.
        let d = HostValue::Object(DictObject::new("d"));
        let hd = t.internalize(&d).unwrap();
        assert_eq!(hd, ha);
    }

    #[test]
    fn strings_deduplicate_by_content() {
        let mut t = table();
        let h1 = t.internalize(&HostValue::String(Rc::from("abc"))).unwrap();
        let h2 = t.internalize(&HostValue::String(Rc::from("abc"))).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(t.ref_count(h1).unwrap(), 2);
    }

    #[test]
    fn reserved_handles_never_recycle() {
        let mut t = table();
        for _ in 0..3 {
            t.release(HANDLE_TRUE).unwrap();
        }
        assert!(matches!(t.externalize(HANDLE_TRUE).unwrap(), HostValue::Bool(true)));
        let h = t.internalize(&HostValue::Bool(true)).unwrap();
        assert_eq!(h, HANDLE_TRUE);
    }

    #[test]
    fn numbers_are_rejected() {
        let mut t = table();
        assert!(t.internalize(&HostValue::Number(4.5)).is_err());
        assert!(t.internalize(&HostValue::Undefined).is_err());
    }

    #[test]
    fn over_release_is_an_error() {
        let mut t = table();
        let v = HostValue::Object(DictObject::new("x"));
        let h = t.internalize(&v).unwrap();
        t.release(h).unwrap();
        assert!(t.release(h).is_err());
    }
}
