//! Mutable strings (L4'): byte arrays with a trailing NUL inside capacity
//! and a logical length that excludes it. Built on the same engine as §4.6
//! arrays (`TypedArray<u8>`), so `length` stays O(1) and growth follows the
//! same doubling policy.
//!
//! Supplemental operations grounded on
//! `original_source/src/runtime/string/runtime_string_h.h`.

use crate::arena::ManagedArena;
use crate::array::TypedArray;
use crate::handle::{Handle, HANDLE_NULL};

/// Logical length, excluding the trailing NUL.
pub fn length(arena: &ManagedArena, h: Handle) -> usize {
    TypedArray::<u8>::length(arena, h).saturating_sub(1)
}

fn read_str(arena: &ManagedArena, h: Handle) -> String {
    let (meta, elems) = TypedArray::<u8>::pin_elements(arena, h);
    let len = meta.size.saturating_sub(1);
    let bytes = unsafe { std::slice::from_raw_parts(elems, len) }.to_vec();
    arena.unpin(h);
    String::from_utf8(bytes).expect("string payload is not valid UTF-8")
}

fn create_nul_terminated(arena: &ManagedArena, s: &[u8], capacity_hint: usize) -> Handle {
    let mut data = Vec::with_capacity(s.len() + 1);
    data.extend_from_slice(s);
    data.push(0);
    TypedArray::<u8>::create_with_capacity(arena, &data, capacity_hint.max(data.len()))
}

/// Duplicate a UTF-8 string into the arena, marking `old` dead if given.
pub fn strdup(arena: &ManagedArena, old: Handle, s: &str) -> Handle {
    strndup(arena, old, s, s.len())
}

/// Duplicate up to `n` bytes of `s`.
pub fn strndup(arena: &ManagedArena, old: Handle, s: &str, n: usize) -> Handle {
    let n = n.min(s.len());
    let h = create_nul_terminated(arena, &s.as_bytes()[..n], 0);
    if old != HANDLE_NULL {
        arena.mark_dead(old);
    }
    h
}

/// `+=`-style append. Mutates in place when the existing capacity has room
/// for the grown string plus NUL; otherwise doubles capacity and marks `h`
/// dead, matching the array growth policy (§4.7).
pub fn append(arena: &ManagedArena, h: Handle, suffix: &str) -> Handle {
    let suffix_bytes = suffix.as_bytes();
    let (meta, elems) = TypedArray::<u8>::pin_elements(arena, h);
    let cur_len = meta.size.saturating_sub(1);
    let needed = cur_len + suffix_bytes.len() + 1;
    if needed <= meta.capacity {
        unsafe {
            std::ptr::copy_nonoverlapping(suffix_bytes.as_ptr(), elems.add(cur_len), suffix_bytes.len());
            *elems.add(cur_len + suffix_bytes.len()) = 0;
        }
        arena.unpin(h);
        TypedArray::<u8>::set_len(arena, h, cur_len + suffix_bytes.len() + 1);
        return h;
    }
    arena.unpin(h);
    let mut data = read_str(arena, h).into_bytes();
    data.extend_from_slice(suffix_bytes);
    let new_capacity = (meta.capacity.max(1) * 2).max(data.len() + 1);
    let new_h = create_nul_terminated(arena, &data, new_capacity);
    arena.mark_dead(h);
    new_h
}

/// Non-mutating two-argument join, distinct from in-place `append`.
pub fn concat(arena: &ManagedArena, old: Handle, a: &str, b: &str) -> Handle {
    let mut s = String::with_capacity(a.len() + b.len());
    s.push_str(a);
    s.push_str(b);
    let h = create_nul_terminated(arena, s.as_bytes(), 0);
    if old != HANDLE_NULL {
        arena.mark_dead(old);
    }
    h
}

fn resolve_index(idx: i64, len: usize) -> usize {
    if idx < 0 {
        (len as i64 + idx).max(0) as usize
    } else {
        (idx as usize).min(len)
    }
}

pub fn substring(arena: &ManagedArena, h: Handle, start: i64, end: i64) -> Handle {
    let s = read_str(arena, h);
    let len = s.len();
    let start = resolve_index(start, len);
    let end = resolve_index(end, len).max(start);
    create_nul_terminated(arena, s[start..end].as_bytes(), 0)
}

pub fn to_upper(arena: &ManagedArena, h: Handle) -> Handle {
    create_nul_terminated(arena, read_str(arena, h).to_uppercase().as_bytes(), 0)
}

pub fn to_lower(arena: &ManagedArena, h: Handle) -> Handle {
    create_nul_terminated(arena, read_str(arena, h).to_lowercase().as_bytes(), 0)
}

pub fn trim(arena: &ManagedArena, h: Handle) -> Handle {
    create_nul_terminated(arena, read_str(arena, h).trim().as_bytes(), 0)
}

pub fn replace(arena: &ManagedArena, h: Handle, old_s: &str, new_s: &str) -> Handle {
    create_nul_terminated(arena, read_str(arena, h).replace(old_s, new_s).as_bytes(), 0)
}

/// Split into a string-element array (each element a handle). `limit`
/// bounds the number of pieces, matching `rt_str_split_n_h`.
pub fn split(arena: &ManagedArena, h: Handle, delimiter: &str, limit: Option<usize>) -> Handle {
    let s = read_str(arena, h);
    let parts: Vec<&str> = match limit {
        Some(n) if n > 0 => s.splitn(n, delimiter).collect(),
        _ => s.split(delimiter).collect(),
    };
    let handles: Vec<Handle> = parts
        .iter()
        .map(|p| create_nul_terminated(arena, p.as_bytes(), 0))
        .collect();
    TypedArray::<Handle>::create(arena, &handles)
}

/// Build a string-element array from a host argv-like slice (§4.6 `args`).
pub fn args_create(arena: &ManagedArena, argv: &[String]) -> Handle {
    let handles: Vec<Handle> = argv
        .iter()
        .map(|a| create_nul_terminated(arena, a.as_bytes(), 0))
        .collect();
    TypedArray::<Handle>::create(arena, &handles)
}

/// Pin each element handle transiently to read its bytes and join them.
pub fn array_join(arena: &ManagedArena, arr: Handle, separator: &str) -> String {
    let count = TypedArray::<Handle>::length(arena, arr);
    let mut out = String::new();
    for i in 0..count {
        if i > 0 {
            out.push_str(separator);
        }
        let elem_h = TypedArray::<Handle>::get(arena, arr, i);
        out.push_str(&read_str(arena, elem_h));
    }
    out
}

/// Handle-aware to-string for a 1D string array: same representation as
/// `array_join` with an empty separator's sibling use-case — exposed
/// separately to match the original's distinct entry point.
pub fn array_to_string(arena: &ManagedArena, arr: Handle) -> String {
    array_join(arena, arr, ", ")
}

pub fn array_index_of(arena: &ManagedArena, arr: Handle, elem: &str) -> Option<usize> {
    let count = TypedArray::<Handle>::length(arena, arr);
    (0..count).find(|&i| read_str(arena, TypedArray::<Handle>::get(arena, arr, i)) == elem)
}

pub fn array_contains(arena: &ManagedArena, arr: Handle, elem: &str) -> bool {
    array_index_of(arena, arr, elem).is_some()
}

/// Element-wise pinned-content comparison of two string arrays.
pub fn array_eq(arena: &ManagedArena, a: Handle, b: Handle) -> bool {
    let len_a = TypedArray::<Handle>::length(arena, a);
    let len_b = TypedArray::<Handle>::length(arena, b);
    if len_a != len_b {
        return false;
    }
    (0..len_a).all(|i| {
        let ea = TypedArray::<Handle>::get(arena, a, i);
        let eb = TypedArray::<Handle>::get(arena, b, i);
        read_str(arena, ea) == read_str(arena, eb)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strdup_and_append_in_place() {
        let a = ManagedArena::create_root();
        let h = strdup(&a, 0, "hello");
        assert_eq!(length(&a, h), 5);
        let h = append(&a, h, ", world");
        assert_eq!(read_str(&a, h), "hello, world");
        a.destroy();
    }

    #[test]
    fn concat_is_non_mutating() {
        let a = ManagedArena::create_root();
        let h = concat(&a, 0, "foo", "bar");
        assert_eq!(read_str(&a, h), "foobar");
        a.destroy();
    }

    #[test]
    fn split_and_join_round_trip() {
        let a = ManagedArena::create_root();
        let h = strdup(&a, 0, "a,b,c");
        let arr = split(&a, h, ",", None);
        assert_eq!(TypedArray::<Handle>::length(&a, arr), 3);
        assert_eq!(array_join(&a, arr, "-"), "a-b-c");
        a.destroy();
    }

    #[test]
    fn case_and_trim_ops() {
        let a = ManagedArena::create_root();
        let h = strdup(&a, 0, "  Mixed Case  ");
        let trimmed = trim(&a, h);
        assert_eq!(read_str(&a, trimmed), "Mixed Case");
        let upper = to_upper(&a, trimmed);
        assert_eq!(read_str(&a, upper), "MIXED CASE");
        a.destroy();
    }
}
