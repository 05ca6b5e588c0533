//! Benchmark driver. `SEQ` (default) reproduces the classic sequence: bulk
//! add of `i * 7` keys, remove every other record, re-add them, then a full
//! ordered walk. `MIXED=1` runs a Zipf-skewed mix of lookups, misses,
//! inserts, removes and short walks. One JSON object per line on stdout.

use std::hint::black_box;
use std::process::Command;

use enum_iterator::Sequence;
use once_cell::sync::Lazy;
use rand::distributions::{Distribution, WeightedIndex};
use rand::prelude::SliceRandom;
use rand::SeedableRng;
use rand_distr::Zipf;
use rand_xoshiro::Xoshiro128PlusPlus;
use serde_json::json;

use crate::stats::Stats;
use crate::{C3bt, Cursor, KeyType};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .without_time()
        .try_init();
});

#[repr(C)]
struct Rec {
    key: u32,
}

fn rec_ptr(r: &Rec) -> *mut u8 {
    r as *const Rec as *mut u8
}

fn host_name() -> String {
    let out = Command::new("hostname").output().unwrap().stdout;
    String::from_utf8_lossy(&out).trim().to_string()
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .map(|v| v.parse().unwrap())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .map(|v| v.parse().unwrap())
        .unwrap_or(default)
}

#[repr(usize)]
#[derive(Clone, Copy, Sequence, Debug)]
enum Op {
    Hit,
    Miss,
    Insert,
    Remove,
    Walk,
}

#[derive(Default)]
struct StatAggregator {
    sum: u64,
    count: u64,
}

impl StatAggregator {
    fn submit(&mut self, sample: u64) {
        self.sum += sample;
        self.count += 1;
    }

    fn time_fn<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let t1 = minstant::Instant::now();
        let r = f();
        let t2 = minstant::Instant::now();
        self.submit(t2.duration_since(t1).as_nanos() as u64);
        r
    }
}

pub fn bench_main() {
    Lazy::force(&TRACING);
    assert!(minstant::is_tsc_available());
    if std::env::var("MIXED").as_deref() == Ok("1") {
        Mixed::init().run();
    } else {
        sequential();
    }
}

fn emit_phase(op: &str, n: usize, nanos: u128) {
    let s = Stats::snapshot();
    let line = json!({
        "op": op,
        "count": n,
        "ns_per_op": nanos as f64 / n as f64,
        "cells": s.cells,
        "pushdowns": s.pushdowns,
        "splits": s.splits,
        "pushups": s.pushups,
        "mergeups": s.mergeups,
        "failed_merges": s.failed_merges,
        "shortcuts": s.shortcuts,
        "host": host_name(),
    });
    println!("{}", serde_json::to_string(&line).unwrap());
}

fn sequential() {
    let count = env_usize("COUNT", 100_000);
    let recs: Vec<Rec> = (0..count)
        .map(|i| Rec {
            key: (i * 7) as u32,
        })
        .collect();
    let mut tree = C3bt::new(KeyType::U32, 0, 0).unwrap();
    Stats::reset();

    unsafe {
        let t = minstant::Instant::now();
        for r in &recs {
            assert!(tree.add(rec_ptr(r)));
        }
        emit_phase("add", count, t.elapsed().as_nanos());
        assert_eq!(tree.len(), count);

        Stats::reset();
        let t = minstant::Instant::now();
        for r in recs.iter().step_by(2) {
            assert!(tree.remove(rec_ptr(r)));
        }
        emit_phase("remove", count / 2, t.elapsed().as_nanos());

        Stats::reset();
        let t = minstant::Instant::now();
        for r in recs.iter().step_by(2) {
            assert!(tree.add(rec_ptr(r)));
        }
        emit_phase("re-add", count / 2, t.elapsed().as_nanos());
        assert_eq!(tree.len(), count);

        let t = minstant::Instant::now();
        let mut cur = Cursor::default();
        let mut robj = tree.first(Some(&mut cur));
        let mut walked = 0usize;
        let mut prev_key = 0u32;
        while let Some(r) = robj {
            let key = (*(r as *const Rec)).key;
            assert!(walked == 0 || key > prev_key);
            prev_key = key;
            walked += 1;
            robj = tree.next(&mut cur);
        }
        emit_phase("walk", walked, t.elapsed().as_nanos());
        assert_eq!(walked, count);
    }

    drop(tree);
    let s = Stats::snapshot();
    let line = json!({ "op": "popdist", "popdist": s.popdist.to_vec(), "host": host_name() });
    println!("{}", serde_json::to_string(&line).unwrap());
}

struct Mixed {
    stats: [StatAggregator; Op::CARDINALITY],
    sample_op: WeightedIndex<usize>,
    zipf_exponent: f64,
    walk_len: usize,
    op_count: usize,
    inserted_start: usize,
    inserted_count: usize,
    data: Vec<Rec>,
    rng: Xoshiro128PlusPlus,
    tree: C3bt,
}

impl Mixed {
    fn init() -> Self {
        let count = env_usize("COUNT", 1_000_000);
        let op_count = env_usize("OP_COUNT", 1_000_000);
        let walk_len = env_usize("WALK_LEN", 10);
        let zipf_exponent = env_f64("ZIPF_EXPONENT", 0.15);
        let op_rates: Vec<usize> =
            serde_json::from_str(std::env::var("OP_RATES").as_deref().unwrap_or("[40,40,5,5,10]"))
                .unwrap();
        assert!(op_rates.len() == Op::CARDINALITY);

        let mut rng = Xoshiro128PlusPlus::seed_from_u64(123);
        let mut data: Vec<Rec> = (0..count as u32).map(|key| Rec { key }).collect();
        data.shuffle(&mut rng);
        let initial_size = count / 2;
        let mut tree = C3bt::new(KeyType::U32, 0, 0).unwrap();
        for r in &data[..initial_size] {
            unsafe { assert!(tree.add(rec_ptr(r))) };
        }
        Stats::reset();
        Mixed {
            stats: Default::default(),
            sample_op: WeightedIndex::new(op_rates).unwrap(),
            zipf_exponent,
            walk_len,
            op_count,
            inserted_start: 0,
            inserted_count: initial_size,
            data,
            rng,
            tree,
        }
    }

    fn zipf_sample(&mut self, n: usize) -> usize {
        assert!(n > 0);
        Zipf::new(n as u64, self.zipf_exponent)
            .unwrap()
            .sample(&mut self.rng) as usize
            - 1
    }

    fn op_from_usize(n: usize) -> Op {
        let op = enum_iterator::all::<Op>().nth(n).unwrap();
        assert!(op as usize == n);
        op
    }

    fn run(mut self) {
        for _ in 0..self.op_count {
            let op = Self::op_from_usize(self.sample_op.sample(&mut self.rng));
            let len = self.data.len();
            match op {
                Op::Hit => {
                    if self.inserted_count == 0 {
                        continue;
                    }
                    let i = (self.inserted_start + self.inserted_count
                        - 1
                        - self.zipf_sample(self.inserted_count))
                        % len;
                    let key = self.data[i].key;
                    let found = unsafe {
                        self.stats[op as usize]
                            .time_fn(|| black_box(self.tree.find_u32(black_box(key))))
                    };
                    debug_assert!(found.is_some());
                }
                Op::Miss => {
                    if self.inserted_count == len {
                        continue;
                    }
                    let i = (self.inserted_start
                        + self.inserted_count
                        + self.zipf_sample(len - self.inserted_count))
                        % len;
                    let key = self.data[i].key;
                    let found = unsafe {
                        self.stats[op as usize]
                            .time_fn(|| black_box(self.tree.find_u32(black_box(key))))
                    };
                    debug_assert!(found.is_none());
                }
                Op::Insert => {
                    if self.inserted_count == len {
                        continue;
                    }
                    let i = (self.inserted_start + self.inserted_count) % len;
                    self.inserted_count += 1;
                    let p = rec_ptr(&self.data[i]);
                    let added = unsafe {
                        self.stats[op as usize].time_fn(|| black_box(self.tree.add(black_box(p))))
                    };
                    debug_assert!(added);
                }
                Op::Remove => {
                    if self.inserted_count == 0 {
                        continue;
                    }
                    let i = self.inserted_start;
                    self.inserted_count -= 1;
                    self.inserted_start = (self.inserted_start + 1) % len;
                    let p = rec_ptr(&self.data[i]);
                    let removed = unsafe {
                        self.stats[op as usize]
                            .time_fn(|| black_box(self.tree.remove(black_box(p))))
                    };
                    debug_assert!(removed);
                }
                Op::Walk => {
                    if self.inserted_count == 0 {
                        continue;
                    }
                    let i = (self.inserted_start + self.inserted_count
                        - 1
                        - self.zipf_sample(self.inserted_count))
                        % len;
                    let p = rec_ptr(&self.data[i]);
                    let steps = self.walk_len;
                    let tree = &self.tree;
                    self.stats[op as usize].time_fn(|| unsafe {
                        let mut cur = Cursor::default();
                        let mut robj = tree.locate(p, Some(&mut cur));
                        for _ in 0..steps {
                            if robj.is_none() {
                                break;
                            }
                            robj = black_box(tree.next(&mut cur));
                        }
                    });
                }
            }
        }

        let s = Stats::snapshot();
        for op in enum_iterator::all::<Op>() {
            let stat = &self.stats[op as usize];
            let line = json!({
                "op": format!("{op:?}"),
                "op_count": stat.count,
                "ns_per_op": stat.sum as f64 / stat.count as f64,
                "objects": self.tree.len(),
                "cells": s.cells,
                "host": host_name(),
            });
            println!("{}", serde_json::to_string(&line).unwrap());
        }
    }
}
