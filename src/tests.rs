use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::ptr;

use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::{C3bt, Cursor, KeyType, Stats};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .without_time()
        .try_init();
});

#[repr(C)]
struct RecU32 {
    pad: u32,
    key: u32,
}

const U32_KEY_OFFSET: usize = 4;

fn u32_rec(key: u32) -> RecU32 {
    RecU32 { pad: 0, key }
}

fn u32_tree() -> C3bt {
    Lazy::force(&TRACING);
    C3bt::new(KeyType::U32, U32_KEY_OFFSET, 0).unwrap()
}

fn rec_ptr<T>(r: &T) -> *mut u8 {
    r as *const T as *mut u8
}

fn key_at(p: *mut u8) -> u32 {
    unsafe { (*(p as *const RecU32)).key }
}

#[test]
fn bulk_u32_cycle() {
    const N: usize = 100_000;
    let recs: Vec<RecU32> = (0..N).map(|i| u32_rec((i * 7) as u32)).collect();
    let mut tree = u32_tree();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        assert_eq!(tree.len(), N);
        tree.check_invariants();

        let mut cur = Cursor::default();
        let first = tree.first(Some(&mut cur)).unwrap();
        assert_eq!(key_at(first), 0);
        let mut walked = 1;
        let mut prev = 0;
        while let Some(p) = tree.next(&mut cur) {
            let k = key_at(p);
            assert!(k > prev);
            prev = k;
            walked += 1;
        }
        assert_eq!(walked, N);
        assert_eq!(prev, 7 * (N as u32 - 1));

        // every other record carries a key that is a multiple of 14
        for r in recs.iter().step_by(2) {
            assert!(tree.remove(rec_ptr(r)));
        }
        assert_eq!(tree.len(), N / 2);
        tree.check_invariants();
        assert_eq!(tree.find_u32(14), None);
        assert_eq!(tree.find_u32(21), Some(rec_ptr(&recs[3])));

        for r in recs.iter().step_by(2) {
            assert!(tree.add(rec_ptr(r)));
        }
        assert_eq!(tree.len(), N);
        tree.check_invariants();
        let keys: Vec<u32> = tree.iter().map(key_at).collect();
        assert_eq!(keys.len(), N);
        assert!(keys.iter().zip(0..N as u32).all(|(&k, i)| k == i * 7));
    }
}

#[test]
fn singleton_behaviour() {
    let rec = u32_rec(99);
    let mut tree = u32_tree();
    unsafe {
        assert!(tree.add(rec_ptr(&rec)));
        assert_eq!(tree.len(), 1);
        tree.check_invariants();
        let mut cur = Cursor::default();
        assert_eq!(tree.first(Some(&mut cur)), Some(rec_ptr(&rec)));
        assert_eq!(tree.next(&mut cur), None);
        assert_eq!(tree.last(Some(&mut cur)), Some(rec_ptr(&rec)));
        assert_eq!(tree.prev(&mut cur), None);
        assert_eq!(tree.find_u32(99), Some(rec_ptr(&rec)));
        assert_eq!(tree.locate(rec_ptr(&rec), None), Some(rec_ptr(&rec)));

        assert!(tree.remove(rec_ptr(&rec)));
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.first(None), None);
        tree.check_invariants();

        // the tree is reusable after draining
        assert!(tree.add(rec_ptr(&rec)));
        assert_eq!(tree.len(), 1);
    }
}

#[test]
fn duplicate_rejected() {
    let a = RecU32 { pad: 1, key: 42 };
    let b = RecU32 { pad: 2, key: 42 };
    let mut tree = u32_tree();
    unsafe {
        assert!(tree.add(rec_ptr(&a)));
        assert!(!tree.add(rec_ptr(&b)));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.find_u32(42), Some(rec_ptr(&a)));

        // rejection must leave a populated tree untouched as well
        let recs: Vec<RecU32> = (0..64).map(|i| u32_rec(i * 3)).collect();
        for r in &recs {
            tree.add(rec_ptr(r));
        }
        let before: Vec<u32> = tree.iter().map(key_at).collect();
        let dup = u32_rec(63);
        assert!(!tree.add(rec_ptr(&dup)));
        assert_eq!(tree.len(), before.len());
        assert_eq!(tree.iter().map(key_at).collect::<Vec<_>>(), before);
        tree.check_invariants();
    }
}

#[test]
fn add_remove_roundtrip() {
    let recs: Vec<RecU32> = (1..=5).map(|i| u32_rec(i * 10)).collect();
    let mut tree = u32_tree();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        let before: Vec<u32> = tree.iter().map(key_at).collect();
        let extra = u32_rec(25);
        assert!(tree.add(rec_ptr(&extra)));
        assert!(tree.remove(rec_ptr(&extra)));
        assert_eq!(tree.len(), before.len());
        assert_eq!(tree.iter().map(key_at).collect::<Vec<_>>(), before);
        tree.check_invariants();
    }
}

#[test]
fn empty_tree_ops() {
    let mut tree = u32_tree();
    unsafe {
        assert_eq!(tree.find_u32(7), None);
        assert_eq!(tree.first(None), None);
        assert_eq!(tree.last(None), None);
        let mut cur = Cursor::default();
        assert_eq!(tree.next(&mut cur), None);
        assert_eq!(tree.prev(&mut cur), None);
        let probe = u32_rec(1);
        assert!(!tree.remove(rec_ptr(&probe)));
        assert_eq!(tree.locate(rec_ptr(&probe), None), None);
        tree.check_invariants();
    }
}

#[test]
fn rejects_bad_config() {
    assert!(C3bt::new(KeyType::Custom, 0, 0).is_none());
    assert!(C3bt::new(KeyType::Bits, 0, 0).is_none());
    assert!(C3bt::new(KeyType::Bits, 0, 300).is_none());
    assert!(C3bt::new(KeyType::Bits, 0, 256).is_some());
}

#[test]
fn string_ordering() {
    #[repr(C)]
    struct RecStr {
        key: [u8; 8],
    }
    fn srec(s: &str) -> RecStr {
        let mut key = [0u8; 8];
        key[..s.len()].copy_from_slice(s.as_bytes());
        RecStr { key }
    }

    let recs = [srec("abc"), srec("abc1"), srec("abcd"), srec("ab")];
    let mut tree = C3bt::new(KeyType::Str, 0, 0).unwrap();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        tree.check_invariants();
        // a shorter string precedes its extensions
        let walked: Vec<&str> = tree
            .iter()
            .map(|p| {
                CStr::from_ptr(p as *const _)
                    .to_str()
                    .unwrap()
            })
            .collect();
        assert_eq!(walked, ["ab", "abc", "abc1", "abcd"]);

        let probe = CStr::from_bytes_with_nul(b"abc1\0").unwrap();
        assert_eq!(tree.find_str(probe), Some(rec_ptr(&recs[1])));
        let miss = CStr::from_bytes_with_nul(b"abz\0").unwrap();
        assert_eq!(tree.find_str(miss), None);
        let shorter = CStr::from_bytes_with_nul(b"abcd1\0").unwrap();
        assert_eq!(tree.find_str(shorter), None);
    }
}

#[test]
fn pstr_keys() {
    #[repr(C)]
    struct RecPStr {
        key: *const u8,
    }

    let storage: Vec<CString> = ["delta", "alpha", "charlie", "bravo"]
        .iter()
        .map(|s| CString::new(*s).unwrap())
        .collect();
    let recs: Vec<RecPStr> = storage
        .iter()
        .map(|c| RecPStr {
            key: c.as_ptr() as *const u8,
        })
        .collect();
    let mut tree = C3bt::new(KeyType::PStr, 0, 0).unwrap();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        let walked: Vec<&str> = tree
            .iter()
            .map(|p| {
                let s = (*(p as *const RecPStr)).key;
                CStr::from_ptr(s as *const _).to_str().unwrap()
            })
            .collect();
        assert_eq!(walked, ["alpha", "bravo", "charlie", "delta"]);
        let probe = CStr::from_bytes_with_nul(b"charlie\0").unwrap();
        assert_eq!(tree.find_str(probe), Some(rec_ptr(&recs[2])));
    }
}

#[test]
fn signed_32_order() {
    #[repr(C)]
    struct RecS32 {
        key: i32,
    }
    let keys = [-2_000_000_000, -77, -1, 0, 1, 42, 2_000_000_000];
    let recs: Vec<RecS32> = keys.iter().rev().map(|&key| RecS32 { key }).collect();
    let mut tree = C3bt::new(KeyType::S32, 0, 0).unwrap();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        let walked: Vec<i32> = tree.iter().map(|p| (*(p as *const RecS32)).key).collect();
        assert_eq!(walked, keys);
        assert_eq!(tree.find_s32(-77), Some(rec_ptr(&recs[5])));
        assert_eq!(tree.find_s32(-78), None);
    }
}

#[test]
fn signed_64_order() {
    #[repr(C)]
    struct RecS64 {
        key: i64,
    }
    let keys = [i64::MIN, -1_234_567_890_123, -2, 0, 7, 1 << 40, i64::MAX];
    let recs: Vec<RecS64> = keys.iter().rev().map(|&key| RecS64 { key }).collect();
    let mut tree = C3bt::new(KeyType::S64, 0, 0).unwrap();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        let walked: Vec<i64> = tree.iter().map(|p| (*(p as *const RecS64)).key).collect();
        assert_eq!(walked, keys);
        assert_eq!(tree.find_s64(-2), Some(rec_ptr(&recs[4])));
    }
}

#[test]
fn unsigned_64_order() {
    #[repr(C)]
    struct RecU64 {
        key: u64,
    }
    let keys = [0, 1, u32::MAX as u64 + 1, 1 << 63, u64::MAX];
    let recs: Vec<RecU64> = keys.iter().rev().map(|&key| RecU64 { key }).collect();
    let mut tree = C3bt::new(KeyType::U64, 0, 0).unwrap();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        let walked: Vec<u64> = tree.iter().map(|p| (*(p as *const RecU64)).key).collect();
        assert_eq!(walked, keys);
        assert_eq!(tree.find_u64(1 << 63), Some(rec_ptr(&recs[1])));
        assert_eq!(tree.find_u64(2), None);
    }
}

#[test]
fn bit_string_keys() {
    #[repr(C)]
    struct RecBits {
        key: [u8; 3],
    }
    // 20-bit keys: the tail nibble of the last byte stays zero
    fn brec(v: u32) -> RecBits {
        RecBits {
            key: [(v >> 12) as u8, (v >> 4) as u8, ((v & 0xf) << 4) as u8],
        }
    }

    let values = [5u32, 999, 0, 0xf_ffff, 123, 77_777];
    let recs: Vec<RecBits> = values.iter().map(|&v| brec(v)).collect();
    let mut tree = C3bt::new(KeyType::Bits, 0, 20).unwrap();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        tree.check_invariants();
        let mut sorted = values;
        sorted.sort_unstable();
        let walked: Vec<[u8; 3]> = tree.iter().map(|p| (*(p as *const RecBits)).key).collect();
        assert_eq!(
            walked,
            sorted.iter().map(|&v| brec(v).key).collect::<Vec<_>>()
        );
        assert_eq!(tree.find_bits(&brec(123).key), Some(rec_ptr(&recs[4])));
        assert_eq!(tree.find_bits(&brec(6).key), None);
    }
}

#[test]
fn custom_bitops() {
    unsafe extern "C" fn bitops_u16(req: i32, key1: *const u8, key2: *const u8) -> i32 {
        let bits = ptr::read_unaligned(key1 as *const u16);
        if req >= 0 {
            (bits & (0x8000u16 >> req) != 0) as i32
        } else {
            let x = bits ^ ptr::read_unaligned(key2 as *const u16);
            if x == 0 {
                -1
            } else {
                x.leading_zeros() as i32
            }
        }
    }

    #[repr(C)]
    struct RecU16 {
        key: u16,
    }
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let mut keys: Vec<u16> = (0..500).collect();
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    let recs: Vec<RecU16> = keys.iter().map(|&key| RecU16 { key }).collect();
    let mut tree = C3bt::with_bitops(bitops_u16);
    assert_eq!(tree.key_type(), KeyType::Custom);
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        assert_eq!(tree.len(), 500);
        tree.check_invariants();
        let walked: Vec<u16> = tree.iter().map(|p| (*(p as *const RecU16)).key).collect();
        assert_eq!(walked, (0..500).collect::<Vec<u16>>());
    }
}

#[test]
fn cursor_stepping() {
    let recs: Vec<RecU32> = (0..100).map(|i| u32_rec(i * 3)).collect();
    let mut tree = u32_tree();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }

        let mut cur = Cursor::default();
        let hit = tree.locate(rec_ptr(&recs[17]), Some(&mut cur)).unwrap();
        assert_eq!(key_at(hit), 51);
        assert_eq!(tree.next(&mut cur).map(key_at), Some(54));
        assert_eq!(tree.next(&mut cur).map(key_at), Some(57));

        let mut cur = Cursor::default();
        tree.locate(rec_ptr(&recs[17]), Some(&mut cur)).unwrap();
        assert_eq!(tree.prev(&mut cur).map(key_at), Some(48));
        assert_eq!(tree.prev(&mut cur).map(key_at), Some(45));

        // both ends are walls
        let mut cur = Cursor::default();
        assert_eq!(tree.first(Some(&mut cur)).map(key_at), Some(0));
        assert_eq!(tree.prev(&mut cur), None);
        let mut cur = Cursor::default();
        assert_eq!(tree.last(Some(&mut cur)).map(key_at), Some(297));
        assert_eq!(tree.next(&mut cur), None);

        // full descending walk
        let mut cur = Cursor::default();
        let mut robj = tree.last(Some(&mut cur));
        let mut expected = 297i64;
        while let Some(p) = robj {
            assert_eq!(key_at(p) as i64, expected);
            expected -= 3;
            robj = tree.prev(&mut cur);
        }
        assert_eq!(expected, -3);
    }
}

#[test]
fn randomized_against_btreemap() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x1234_5678_9abc_def0);
    let mut shadow: BTreeMap<u32, Box<RecU32>> = BTreeMap::new();
    let mut tree = u32_tree();

    for i in 0..40_000usize {
        let key = rng.gen_range(0..2000u32) * 3;
        match rng.gen_range(0..10) {
            0..=4 => {
                let rec = Box::new(u32_rec(key));
                let p = rec_ptr(&*rec);
                let inserted = unsafe { tree.add(p) };
                assert_eq!(inserted, !shadow.contains_key(&key));
                if inserted {
                    shadow.insert(key, rec);
                }
            }
            5..=8 => {
                let probe = u32_rec(key);
                let removed = unsafe { tree.remove(rec_ptr(&probe)) };
                assert_eq!(removed, shadow.remove(&key).is_some());
            }
            _ => {
                let found = unsafe { tree.find_u32(key) };
                match shadow.get(&key) {
                    Some(b) => assert_eq!(found, Some(rec_ptr(&**b))),
                    None => assert_eq!(found, None),
                }
            }
        }
        assert_eq!(tree.len(), shadow.len());
        if i % 2048 == 0 {
            unsafe { tree.check_invariants() };
            let keys: Vec<u32> = tree.iter().map(key_at).collect();
            assert_eq!(keys, shadow.keys().copied().collect::<Vec<_>>());
        }
    }

    // drain and reuse
    let remaining: Vec<u32> = shadow.keys().copied().collect();
    for key in remaining {
        let probe = u32_rec(key);
        assert!(unsafe { tree.remove(rec_ptr(&probe)) });
        shadow.remove(&key);
    }
    assert_eq!(tree.len(), 0);
    unsafe {
        assert_eq!(tree.first(None), None);
        tree.check_invariants();
        let rec = u32_rec(1);
        assert!(tree.add(rec_ptr(&rec)));
        assert_eq!(tree.len(), 1);
    }
}

#[test]
fn c_api_smoke() {
    unsafe {
        let recs: Vec<RecU32> = (0..100).map(|i| u32_rec(i * 33)).collect();
        let tree = crate::c3bt_new(u16::from(KeyType::U32), U32_KEY_OFFSET as u32, 0);
        assert!(!tree.is_null());
        for r in &recs {
            assert!(crate::c3bt_add(tree, rec_ptr(r)));
        }
        assert_eq!(crate::c3bt_count(tree), 100);
        assert_eq!(crate::c3bt_find_u32(tree, 66), rec_ptr(&recs[2]));
        assert!(crate::c3bt_find_u32(tree, 67).is_null());

        let mut cur = Cursor::default();
        let mut p = crate::c3bt_first(tree, &mut cur);
        let mut walked = 0;
        let mut prev = -1i64;
        while !p.is_null() {
            let k = key_at(p) as i64;
            assert!(k > prev);
            prev = k;
            walked += 1;
            p = crate::c3bt_next(tree, &mut cur);
        }
        assert_eq!(walked, 100);

        assert!(crate::c3bt_remove(tree, rec_ptr(&recs[0])));
        assert!(!crate::c3bt_remove(tree, rec_ptr(&recs[0])));
        assert_eq!(crate::c3bt_count(tree), 99);
        crate::c3bt_free(tree);

        assert!(crate::c3bt_new(999, 0, 0).is_null());
        assert!(crate::c3bt_new(u16::from(KeyType::Custom), 0, 0).is_null());
        assert!(crate::c3bt_new_bitops(None).is_null());
        assert_eq!(crate::c3bt_count(ptr::null()), 0);
    }
}

// counters are process-global, so only deltas of monotonic counters are
// asserted; other tests may run concurrently
#[test]
#[cfg(feature = "stats")]
fn stats_counters() {
    let before = Stats::snapshot();
    let recs: Vec<RecU32> = (0..10_000).map(|i| u32_rec(i * 5)).collect();
    let mut tree = u32_tree();
    unsafe {
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
    }
    let populated = Stats::snapshot();
    assert!(populated.splits + populated.pushdowns > before.splits + before.pushdowns);

    unsafe {
        for r in recs.iter().step_by(2) {
            assert!(tree.remove(rec_ptr(r)));
        }
    }
    let shrunk = Stats::snapshot();
    assert!(
        shrunk.mergeups + shrunk.pushups + shrunk.failed_merges
            > populated.mergeups + populated.pushups + populated.failed_merges
    );

    drop(tree);
    let after = Stats::snapshot();
    let died: u32 = after.popdist.iter().sum();
    let died_before: u32 = shrunk.popdist.iter().sum();
    assert!(died > died_before);
}
