//! C3BT: compact clustered crit-bit tree.
//!
//! An ordered, in-memory index over caller-owned records keyed by arbitrary
//! bit strings. The logical crit-bit tree is flattened into fixed-size cells
//! of up to eight decision nodes, so a contiguous group of nodes shares one
//! cache line and one allocation; push-down, split and merge-up keep every
//! cell inside its occupancy band as the tree changes while the composite
//! tree stays equivalent to a plain crit-bit tree on the same keys.
//!
//! Records are referenced by raw address and never copied, mutated or freed;
//! keys are read at a fixed byte offset inside each record through a per-tree
//! bit-extraction function. Built-in key types cover fixed bit strings,
//! zero-terminated strings and 32/64-bit integers of either signedness; any
//! other key shape plugs in through [`BitopsFn`].
//!
//! All mutating and key-reading operations are `unsafe`: the caller keeps
//! every indexed record alive and unmoved while it is in the tree, and
//! serializes access (a tree is neither `Send` nor `Sync`).

use std::ffi::{c_char, CStr};
use std::ptr;
use std::slice;

pub mod bench;
pub mod bitops;
mod cell;
pub mod cursor;
pub mod stats;
pub mod tree;
#[cfg(test)]
mod tests;

pub use bitops::{BitopsFn, KeyType, CBIT_MAX};
pub use cursor::{Cursor, Iter};
pub use stats::Stats;
pub use tree::C3bt;

/// Allocate a tree for a built-in key type; null on an unsupported
/// configuration. Release with `c3bt_free`.
#[no_mangle]
pub extern "C" fn c3bt_new(key_type: u16, key_offset: u32, key_nbits: u32) -> *mut C3bt {
    let Ok(kdt) = KeyType::try_from(key_type) else {
        return ptr::null_mut();
    };
    match C3bt::new(kdt, key_offset as usize, key_nbits as usize) {
        Some(tree) => Box::into_raw(Box::new(tree)),
        None => ptr::null_mut(),
    }
}

/// Allocate a tree with caller-supplied bit extraction (key offset 0).
#[no_mangle]
pub extern "C" fn c3bt_new_bitops(bitops: Option<BitopsFn>) -> *mut C3bt {
    match bitops {
        Some(f) => Box::into_raw(Box::new(C3bt::with_bitops(f))),
        None => ptr::null_mut(),
    }
}

/// Free the tree and every cell it owns; indexed records are untouched.
#[no_mangle]
pub unsafe extern "C" fn c3bt_free(tree: *mut C3bt) {
    if !tree.is_null() {
        drop(Box::from_raw(tree));
    }
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_count(tree: *const C3bt) -> u32 {
    if tree.is_null() {
        return 0;
    }
    (*tree).len() as u32
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_add(tree: *mut C3bt, uobj: *mut u8) -> bool {
    if tree.is_null() {
        return false;
    }
    (*tree).add(uobj)
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_remove(tree: *mut C3bt, uobj: *const u8) -> bool {
    if tree.is_null() || uobj.is_null() {
        return false;
    }
    (*tree).remove(uobj)
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_find_bits(tree: *const C3bt, key: *const u8) -> *mut u8 {
    if tree.is_null() || key.is_null() {
        return ptr::null_mut();
    }
    let nbytes = ((*tree).key_nbits() + 7) / 8;
    (*tree)
        .find_bits(slice::from_raw_parts(key, nbytes))
        .unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_find_u32(tree: *const C3bt, key: u32) -> *mut u8 {
    if tree.is_null() {
        return ptr::null_mut();
    }
    (*tree).find_u32(key).unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_find_s32(tree: *const C3bt, key: i32) -> *mut u8 {
    if tree.is_null() {
        return ptr::null_mut();
    }
    (*tree).find_s32(key).unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_find_u64(tree: *const C3bt, key: u64) -> *mut u8 {
    if tree.is_null() {
        return ptr::null_mut();
    }
    (*tree).find_u64(key).unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_find_s64(tree: *const C3bt, key: i64) -> *mut u8 {
    if tree.is_null() {
        return ptr::null_mut();
    }
    (*tree).find_s64(key).unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_find_str(tree: *const C3bt, key: *const c_char) -> *mut u8 {
    if tree.is_null() || key.is_null() {
        return ptr::null_mut();
    }
    (*tree)
        .find_str(CStr::from_ptr(key))
        .unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_locate(
    tree: *const C3bt,
    uobj: *const u8,
    cur: *mut Cursor,
) -> *mut u8 {
    if tree.is_null() {
        return ptr::null_mut();
    }
    (*tree).locate(uobj, cur.as_mut()).unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_first(tree: *const C3bt, cur: *mut Cursor) -> *mut u8 {
    if tree.is_null() {
        return ptr::null_mut();
    }
    (*tree).first(cur.as_mut()).unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_last(tree: *const C3bt, cur: *mut Cursor) -> *mut u8 {
    if tree.is_null() {
        return ptr::null_mut();
    }
    (*tree).last(cur.as_mut()).unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_next(tree: *const C3bt, cur: *mut Cursor) -> *mut u8 {
    if tree.is_null() || cur.is_null() {
        return ptr::null_mut();
    }
    (*tree).next(&mut *cur).unwrap_or(ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn c3bt_prev(tree: *const C3bt, cur: *mut Cursor) -> *mut u8 {
    if tree.is_null() || cur.is_null() {
        return ptr::null_mut();
    }
    (*tree).prev(&mut *cur).unwrap_or(ptr::null_mut())
}
