//! Boxed-any tagged union (L4'): the element type of heterogeneous arrays,
//! and the typed-array ⇄ any-array conversions built on it.
//!
//! Grounded on `original_source/src/runtime/runtime_array_h.h`'s
//! `to_any`/`from_any` family.

use crate::arena::ManagedArena;
use crate::array::TypedArray;
use crate::handle::Handle;

/// Which primitive or string family a boxed value holds (§3: "a tagged
/// union over the primitive and string value families").
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AnyFamily {
    Long,
    Double,
    Bool,
    Byte,
    Char,
    Str,
}

/// A boxed value: a family tag plus its bits, reinterpreted on unbox.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AnyValue {
    family: AnyFamily,
    bits: u64,
}

impl AnyValue {
    pub fn long(v: i64) -> Self {
        Self { family: AnyFamily::Long, bits: v as u64 }
    }
    pub fn double(v: f64) -> Self {
        Self { family: AnyFamily::Double, bits: v.to_bits() }
    }
    pub fn boolean(v: bool) -> Self {
        Self { family: AnyFamily::Bool, bits: v as u64 }
    }
    pub fn byte(v: u8) -> Self {
        Self { family: AnyFamily::Byte, bits: v as u64 }
    }
    pub fn char_value(v: u8) -> Self {
        Self { family: AnyFamily::Char, bits: v as u64 }
    }
    pub fn string(h: Handle) -> Self {
        Self { family: AnyFamily::Str, bits: h as u64 }
    }

    pub fn family(&self) -> AnyFamily {
        self.family
    }

    /// Unbox, checking the family matches. A family mismatch is fatal
    /// (§7 "Cross-family unbox").
    fn expect(&self, want: AnyFamily) {
        assert!(
            self.family == want,
            "from_any: requested {:?} but value holds {:?}",
            want,
            self.family
        );
    }

    pub fn as_long(&self) -> i64 {
        self.expect(AnyFamily::Long);
        self.bits as i64
    }
    pub fn as_double(&self) -> f64 {
        self.expect(AnyFamily::Double);
        f64::from_bits(self.bits)
    }
    pub fn as_bool(&self) -> bool {
        self.expect(AnyFamily::Bool);
        self.bits != 0
    }
    pub fn as_byte(&self) -> u8 {
        self.expect(AnyFamily::Byte);
        self.bits as u8
    }
    pub fn as_char(&self) -> u8 {
        self.expect(AnyFamily::Char);
        self.bits as u8
    }
    pub fn as_string(&self) -> Handle {
        self.expect(AnyFamily::Str);
        self.bits as Handle
    }
}

pub fn to_any_long(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<AnyValue> = (0..TypedArray::<i64>::length(arena, arr))
        .map(|i| AnyValue::long(TypedArray::<i64>::get(arena, arr, i)))
        .collect();
    TypedArray::<AnyValue>::create(arena, &values)
}

pub fn to_any_double(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<AnyValue> = (0..TypedArray::<f64>::length(arena, arr))
        .map(|i| AnyValue::double(TypedArray::<f64>::get(arena, arr, i)))
        .collect();
    TypedArray::<AnyValue>::create(arena, &values)
}

pub fn to_any_bool(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<AnyValue> = (0..TypedArray::<bool>::length(arena, arr))
        .map(|i| AnyValue::boolean(TypedArray::<bool>::get(arena, arr, i)))
        .collect();
    TypedArray::<AnyValue>::create(arena, &values)
}

pub fn to_any_byte(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<AnyValue> = (0..TypedArray::<u8>::length(arena, arr))
        .map(|i| AnyValue::byte(TypedArray::<u8>::get(arena, arr, i)))
        .collect();
    TypedArray::<AnyValue>::create(arena, &values)
}

pub fn to_any_char(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<AnyValue> = (0..TypedArray::<u8>::length(arena, arr))
        .map(|i| AnyValue::char_value(TypedArray::<u8>::get(arena, arr, i)))
        .collect();
    TypedArray::<AnyValue>::create(arena, &values)
}

pub fn to_any_string(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<AnyValue> = (0..TypedArray::<Handle>::length(arena, arr))
        .map(|i| AnyValue::string(TypedArray::<Handle>::get(arena, arr, i)))
        .collect();
    TypedArray::<AnyValue>::create(arena, &values)
}

pub fn from_any_long(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<i64> = (0..TypedArray::<AnyValue>::length(arena, arr))
        .map(|i| TypedArray::<AnyValue>::get(arena, arr, i).as_long())
        .collect();
    TypedArray::<i64>::create(arena, &values)
}

pub fn from_any_double(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<f64> = (0..TypedArray::<AnyValue>::length(arena, arr))
        .map(|i| TypedArray::<AnyValue>::get(arena, arr, i).as_double())
        .collect();
    TypedArray::<f64>::create(arena, &values)
}

pub fn from_any_bool(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<bool> = (0..TypedArray::<AnyValue>::length(arena, arr))
        .map(|i| TypedArray::<AnyValue>::get(arena, arr, i).as_bool())
        .collect();
    TypedArray::<bool>::create(arena, &values)
}

pub fn from_any_byte(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<u8> = (0..TypedArray::<AnyValue>::length(arena, arr))
        .map(|i| TypedArray::<AnyValue>::get(arena, arr, i).as_byte())
        .collect();
    TypedArray::<u8>::create(arena, &values)
}

pub fn from_any_char(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<u8> = (0..TypedArray::<AnyValue>::length(arena, arr))
        .map(|i| TypedArray::<AnyValue>::get(arena, arr, i).as_char())
        .collect();
    TypedArray::<u8>::create(arena, &values)
}

pub fn from_any_string(arena: &ManagedArena, arr: Handle) -> Handle {
    let values: Vec<Handle> = (0..TypedArray::<AnyValue>::length(arena, arr))
        .map(|i| TypedArray::<AnyValue>::get(arena, arr, i).as_string())
        .collect();
    TypedArray::<Handle>::create(arena, &values)
}

/// Box each inner array of a 2D array (outer stores inner-array handles)
/// via `inner_to_any`, producing a fresh outer array of any-boxed inner
/// arrays.
fn to_any_2d(
    arena: &ManagedArena,
    outer: Handle,
    inner_to_any: impl Fn(&ManagedArena, Handle) -> Handle,
) -> Handle {
    let count = TypedArray::<Handle>::length(arena, outer);
    let boxed: Vec<Handle> = (0..count)
        .map(|i| inner_to_any(arena, TypedArray::<Handle>::get(arena, outer, i)))
        .collect();
    TypedArray::<Handle>::create(arena, &boxed)
}

pub fn to_any_array2_long(arena: &ManagedArena, outer: Handle) -> Handle {
    to_any_2d(arena, outer, to_any_long)
}

pub fn to_any_array2_double(arena: &ManagedArena, outer: Handle) -> Handle {
    to_any_2d(arena, outer, to_any_double)
}

pub fn to_any_array2_string(arena: &ManagedArena, outer: Handle) -> Handle {
    to_any_2d(arena, outer, to_any_string)
}

/// 3D any-conversion composes the 2D helper one level deeper.
pub fn to_any_array3_long(arena: &ManagedArena, outer: Handle) -> Handle {
    to_any_2d(arena, outer, to_any_array2_long)
}

pub fn to_any_array3_string(arena: &ManagedArena, outer: Handle) -> Handle {
    to_any_2d(arena, outer, to_any_array2_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_long() {
        let a = ManagedArena::create_root();
        let arr = TypedArray::<i64>::create(&a, &[1, 2, 3]);
        let boxed = to_any_long(&a, arr);
        let back = from_any_long(&a, boxed);
        assert_eq!(TypedArray::<i64>::length(&a, back), 3);
        assert_eq!(TypedArray::<i64>::get(&a, back, 1), 2);
        a.destroy();
    }

    #[test]
    fn round_trip_bool_byte_char() {
        let a = ManagedArena::create_root();

        let bools = TypedArray::<bool>::create(&a, &[true, false, true]);
        let back = from_any_bool(&a, to_any_bool(&a, bools));
        assert_eq!(TypedArray::<bool>::length(&a, back), 3);
        assert_eq!(TypedArray::<bool>::get(&a, back, 1), false);

        let bytes = TypedArray::<u8>::create(&a, &[1, 2, 3]);
        let back = from_any_byte(&a, to_any_byte(&a, bytes));
        assert_eq!(TypedArray::<u8>::get(&a, back, 2), 3);

        let chars = TypedArray::<u8>::create(&a, b"abc");
        let back = from_any_char(&a, to_any_char(&a, chars));
        assert_eq!(TypedArray::<u8>::get(&a, back, 0), b'a');

        a.destroy();
    }

    #[test]
    #[should_panic(expected = "from_any")]
    fn mismatched_family_is_fatal() {
        let a = ManagedArena::create_root();
        let arr = TypedArray::<i64>::create(&a, &[1]);
        let boxed = to_any_long(&a, arr);
        let _ = from_any_double(&a, boxed);
        a.destroy();
    }
}
