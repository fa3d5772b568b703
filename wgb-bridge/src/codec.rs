// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Wire encoding of values crossing the guest boundary.
//!
//! A value occupies one 8-byte slot laid out as an IEEE-754 double:
//!
//! - all-zero bits mean `undefined` (never the number 0);
//! - any other non-NaN bit pattern is the number itself;
//! - a NaN-boxed pattern carries a handle: the low 32 bits hold the handle,
//!   the high 32 bits hold `0x7FF8_0000 | tag`.
//!
//! The NaN pattern is purely a wire format. Internally the bridge works on
//! the explicit [`WireValue`] sum type and only serializes to the boxed bits
//! at the boundary. Real NaN numbers are canonicalized to handle 0 so
//! numbers never collide with the handle space, and the number 0 travels as
//! the reserved zero handle so the all-zero slot stays unambiguous.

use crate::prelude::*;
use crate::table::{Handle, HANDLE_NAN, HANDLE_ZERO};

/// High word prefix of a NaN-boxed slot.
pub const NAN_HEAD: u32 = 0x7FF8_0000;

/// Type tag: object-like default (also null and booleans).
pub const TAG_NONE: u32 = 0;
/// Type tag: object.
pub const TAG_OBJECT: u32 = 1;
/// Type tag: string.
pub const TAG_STRING: u32 = 2;
/// Type tag: symbol.
pub const TAG_SYMBOL: u32 = 3;
/// Type tag: function.
pub const TAG_FUNCTION: u32 = 4;

/// Decoded form of one 8-byte wire slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireValue {
    /// The all-zero pattern.
    Undefined,
    /// A plain (non-NaN) double.
    Number(f64),
    /// A NaN-boxed handle with its type tag.
    Ref {
        /// Handle into the value table.
        handle: Handle,
        /// 3-bit type tag (informational; decoding resolves by handle).
        tag: u32,
    },
}

impl WireValue {
    /// Serialize to the 8-byte bit pattern.
    #[must_use]
    pub fn to_bits(self) -> u64 {
        match self {
            Self::Undefined => 0,
            Self::Number(n) => n.to_bits(),
            Self::Ref { handle, tag } => (u64::from(NAN_HEAD | tag) << 32) | u64::from(handle),
        }
    }

    /// Deserialize from the 8-byte bit pattern.
    #[must_use]
    pub fn from_bits(bits: u64) -> Self {
        let f = f64::from_bits(bits);
        if f == 0.0 {
            return Self::Undefined;
        }
        if !f.is_nan() {
            return Self::Number(f);
        }
        Self::Ref { handle: bits as u32, tag: ((bits >> 32) as u32) & 0x7 }
    }
}

/// Wire type tag for a host value.
#[must_use]
pub fn type_tag(value: &HostValue) -> u32 {
    match value {
        HostValue::Object(_) | HostValue::Bytes(_) => TAG_OBJECT,
        HostValue::String(_) => TAG_STRING,
        HostValue::Symbol(_) => TAG_SYMBOL,
        HostValue::Function(_) => TAG_FUNCTION,
        // Null, booleans and the reserved numeric constants travel untagged.
        _ => TAG_NONE,
    }
}

/// Compute the wire form of a host value, internalizing into `table` when a
/// handle is needed. Internalizing increments the handle's reference count
/// exactly once, which is the "one increment per store" guarantee.
pub fn encode(table: &mut crate::table::ValueTable, value: &HostValue) -> Result<WireValue> {
    match value {
        HostValue::Undefined => Ok(WireValue::Undefined),
        HostValue::Number(n) => {
            if n.is_nan() {
                // Canonical quiet NaN: reserved handle 0, no refcount churn.
                Ok(WireValue::Ref { handle: HANDLE_NAN, tag: TAG_NONE })
            } else if *n == 0.0 {
                // The number zero travels as its reserved handle so the
                // all-zero slot keeps meaning undefined.
                let handle = table.internalize(value)?;
                debug_assert_eq!(handle, HANDLE_ZERO);
                Ok(WireValue::Ref { handle, tag: TAG_NONE })
            } else {
                Ok(WireValue::Number(*n))
            }
        }
        _ => {
            let handle = table.internalize(value)?;
            Ok(WireValue::Ref { handle, tag: type_tag(value) })
        }
    }
}

/// Resolve a wire slot back to a host value. Never mutates reference
/// counts; releasing is always explicit.
pub fn decode(table: &crate::table::ValueTable, wire: WireValue) -> Result<HostValue> {
    match wire {
        WireValue::Undefined => Ok(HostValue::Undefined),
        WireValue::Number(n) => Ok(HostValue::Number(n)),
        WireValue::Ref { handle, .. } => table.externalize(handle),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::table::{ValueTable, HANDLE_TRUE};
    use crate::value::DictObject;

    fn table() -> ValueTable {
        ValueTable::new(
            HostValue::Object(DictObject::new("global")),
            HostValue::Object(DictObject::new("bridge")),
            None,
        )
    }

    #[test]
    fn undefined_is_all_zero_and_zero_is_not() {
        let mut t = table();
        let undef = encode(&mut t, &HostValue::Undefined).unwrap();
        assert_eq!(undef.to_bits(), 0);

        let zero = encode(&mut t, &HostValue::Number(0.0)).unwrap();
        assert_ne!(zero.to_bits(), 0);
        assert_eq!(zero, WireValue::Ref { handle: HANDLE_ZERO, tag: TAG_NONE });

        // An all-zero slot always decodes as undefined, never the number 0.
        assert!(matches!(
            decode(&t, WireValue::from_bits(0)).unwrap(),
            HostValue::Undefined
        ));
        assert_eq!(decode(&t, zero).unwrap().as_number(), Some(0.0));
    }

    #[test]
    fn nan_canonicalizes_to_handle_zero() {
        let mut t = table();
        let wire = encode(&mut t, &HostValue::Number(f64::NAN)).unwrap();
        assert_eq!(wire.to_bits(), u64::from(NAN_HEAD) << 32);
        let back = decode(&t, WireValue::from_bits(wire.to_bits())).unwrap();
        assert!(back.as_number().unwrap().is_nan());
    }

    #[test]
    fn handle_round_trip_preserves_identity() {
        let mut t = table();
        let obj = HostValue::Object(DictObject::new("x"));
        let wire = encode(&mut t, &obj).unwrap();
        let bits = wire.to_bits();
        assert_eq!((bits >> 32) as u32, NAN_HEAD | TAG_OBJECT);

        let back = decode(&t, WireValue::from_bits(bits)).unwrap();
        assert!(back.identity_eq(&obj));
    }

    #[test]
    fn encode_increments_refcount_once_per_store() {
        let mut t = table();
        let s = HostValue::String(Rc::from("hi"));
        let w1 = encode(&mut t, &s).unwrap();
        let w2 = encode(&mut t, &s).unwrap();
        assert_eq!(w1, w2);
        let WireValue::Ref { handle, tag } = w1 else { panic!("expected a handle") };
        assert_eq!(tag, TAG_STRING);
        assert_eq!(t.ref_count(handle).unwrap(), 2);

        // Decoding never touches the count.
        let _ = decode(&t, w1).unwrap();
        assert_eq!(t.ref_count(handle).unwrap(), 2);
    }

    #[test]
    fn booleans_use_reserved_untagged_handles() {
        let mut t = table();
        let wire = encode(&mut t, &HostValue::Bool(true)).unwrap();
        assert_eq!(wire, WireValue::Ref { handle: HANDLE_TRUE, tag: TAG_NONE });
    }

    #[test]
    fn function_tag() {
        let mut t = table();
        let f = HostValue::Function(crate::value::HostFunc::new(|_, _, _| {
            Ok(HostValue::Undefined)
        }));
        let wire = encode(&mut t, &f).unwrap();
        assert!(matches!(wire, WireValue::Ref { tag: TAG_FUNCTION, .. }));
    }

    proptest! {
        #[test]
        fn numeric_round_trip_is_bit_exact(bits in any::<u64>()) {
            let n = f64::from_bits(bits);
            prop_assume!(!n.is_nan() && n != 0.0);
            let mut t = table();
            let wire = encode(&mut t, &HostValue::Number(n)).unwrap();
            let back = decode(&t, WireValue::from_bits(wire.to_bits())).unwrap();
            prop_assert_eq!(back.as_number().map(f64::to_bits), Some(n.to_bits()));
        }
    }
}
