use std::ffi::CStr;
use std::ptr;
use std::slice;

use crate::bitops::{self, BitopsFn, KeyType, CBIT_MAX};
use crate::cell::{self, Cell, Child, ChildKind, CELL_MAX_NODES, CELL_MAX_PTRS, CELL_MIN_NODES};
use crate::cursor::Cursor;
use crate::stats;

/// Compact clustered crit-bit tree over caller-owned records.
///
/// The tree stores raw record addresses and reads each record's key at the
/// configured byte offset through the tree's bit-extraction function;
/// records are never copied, mutated or freed. Operations consulting keys
/// dereference those addresses and are unsafe: the caller keeps every
/// indexed record alive and unmoved for as long as it stays in the tree.
pub struct C3bt {
    pub(crate) root: *mut Cell,
    bitops: BitopsFn,
    pub(crate) n_objects: u32,
    key_offset: u32,
    key_type: KeyType,
    key_nbits: u16,
}

impl C3bt {
    /// Configure a tree for a built-in key type. `key_nbits` is meaningful
    /// for `Bits` (required, 1..=256) and the string types (0 means the
    /// 256-bit maximum); integers fix their own width.
    pub fn new(key_type: KeyType, key_offset: usize, key_nbits: usize) -> Option<C3bt> {
        let max = CBIT_MAX as usize + 1;
        let (bitops, nbits): (BitopsFn, usize) = match key_type {
            KeyType::Bits => {
                if key_nbits == 0 || key_nbits > max {
                    return None;
                }
                (bitops::bitops_bits, key_nbits)
            }
            KeyType::PStr => (bitops::bitops_pstr, if key_nbits == 0 { max } else { key_nbits }),
            KeyType::Str => (bitops::bitops_str, if key_nbits == 0 { max } else { key_nbits }),
            KeyType::U32 => (bitops::bitops_u32, 32),
            KeyType::S32 => (bitops::bitops_s32, 32),
            KeyType::U64 => (bitops::bitops_u64, 64),
            KeyType::S64 => (bitops::bitops_s64, 64),
            KeyType::Custom => return None,
        };
        Some(C3bt {
            root: ptr::null_mut(),
            bitops,
            n_objects: 0,
            key_offset: key_offset as u32,
            key_type,
            key_nbits: nbits.min(max) as u16,
        })
    }

    /// Configure with caller-supplied bit extraction; the key is taken to
    /// start at record offset 0 and may span up to 256 bits.
    pub fn with_bitops(bitops: BitopsFn) -> C3bt {
        C3bt {
            root: ptr::null_mut(),
            bitops,
            n_objects: 0,
            key_offset: 0,
            key_type: KeyType::Custom,
            key_nbits: (CBIT_MAX + 1) as u16,
        }
    }

    pub fn len(&self) -> usize {
        self.n_objects as usize
    }

    pub fn is_empty(&self) -> bool {
        self.n_objects == 0
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn key_nbits(&self) -> usize {
        self.key_nbits as usize
    }

    pub(crate) unsafe fn key_of(&self, uobj: *const u8) -> *const u8 {
        uobj.add(self.key_offset as usize)
    }

    pub(crate) unsafe fn bit(&self, cbit: u32, key: *const u8) -> usize {
        let b = (self.bitops)(cbit as i32, key, ptr::null());
        debug_assert!(b == 0 || b == 1);
        b as usize
    }

    unsafe fn diff(&self, key1: *const u8, key2: *const u8) -> i32 {
        (self.bitops)(-(self.key_nbits as i32 + 1), key1, key2)
    }

    /// Key-guided descent. Returns an unverified candidate record and leaves
    /// the cursor on the last visited (cell, node slot, child side). The
    /// singleton tree reports its sole record unconditionally.
    pub(crate) unsafe fn lookup_key(&self, key: *const u8, cur: &mut Cursor) -> Option<*mut u8> {
        cur.cell = self.root;
        cur.nid = 0;
        cur.cid = 0;
        if self.n_objects == 1 {
            return Some((*self.root).ptrs[0]);
        }
        let mut cell = self.root;
        while !cell.is_null() {
            cur.cell = cell;
            let mut child = Child::node(0);
            while child.is_node() {
                let nid = child.index();
                cur.nid = nid as u16;
                let b = self.bit((*cell).nodes[nid].cbit as u32, key);
                child = (*cell).nodes[nid].child[b];
                cur.cid = b as u16;
            }
            if child.is_uobj() {
                return Some((*cell).ptrs[child.index()]);
            }
            cell = (*cell).ptrs[child.index()] as *mut Cell;
        }
        None
    }

    /// Exact lookup in a `Bits` tree. `key` must supply `ceil(key_nbits/8)`
    /// bytes with the tail byte zero-padded.
    pub unsafe fn find_bits(&self, key: &[u8]) -> Option<*mut u8> {
        if self.key_type != KeyType::Bits {
            return None;
        }
        let nbytes = (self.key_nbits as usize + 7) / 8;
        assert!(key.len() >= nbytes);
        let mut cur = Cursor::default();
        let robj = self.lookup_key(key.as_ptr(), &mut cur)?;
        if slice::from_raw_parts(self.key_of(robj), nbytes) == &key[..nbytes] {
            Some(robj)
        } else {
            None
        }
    }

    pub unsafe fn find_u32(&self, key: u32) -> Option<*mut u8> {
        if self.key_type != KeyType::U32 {
            return None;
        }
        let mut cur = Cursor::default();
        let robj = self.lookup_key(&key as *const u32 as *const u8, &mut cur)?;
        // a word compare beats the diff probe
        if ptr::read_unaligned(self.key_of(robj) as *const u32) == key {
            Some(robj)
        } else {
            None
        }
    }

    pub unsafe fn find_s32(&self, key: i32) -> Option<*mut u8> {
        if self.key_type != KeyType::S32 {
            return None;
        }
        let mut cur = Cursor::default();
        let robj = self.lookup_key(&key as *const i32 as *const u8, &mut cur)?;
        if ptr::read_unaligned(self.key_of(robj) as *const i32) == key {
            Some(robj)
        } else {
            None
        }
    }

    pub unsafe fn find_u64(&self, key: u64) -> Option<*mut u8> {
        if self.key_type != KeyType::U64 {
            return None;
        }
        let mut cur = Cursor::default();
        let robj = self.lookup_key(&key as *const u64 as *const u8, &mut cur)?;
        if ptr::read_unaligned(self.key_of(robj) as *const u64) == key {
            Some(robj)
        } else {
            None
        }
    }

    pub unsafe fn find_s64(&self, key: i64) -> Option<*mut u8> {
        if self.key_type != KeyType::S64 {
            return None;
        }
        let mut cur = Cursor::default();
        let robj = self.lookup_key(&key as *const i64 as *const u8, &mut cur)?;
        if ptr::read_unaligned(self.key_of(robj) as *const i64) == key {
            Some(robj)
        } else {
            None
        }
    }

    /// Exact lookup in a `Str` or `PStr` tree.
    pub unsafe fn find_str(&self, key: &CStr) -> Option<*mut u8> {
        let kp = key.as_ptr() as *const u8;
        let mut cur = Cursor::default();
        let robj = match self.key_type {
            KeyType::Str => self.lookup_key(kp, &mut cur),
            KeyType::PStr => self.lookup_key(&kp as *const *const u8 as *const u8, &mut cur),
            _ => None,
        }?;
        let stored = if self.key_type == KeyType::Str {
            self.key_of(robj)
        } else {
            ptr::read_unaligned(self.key_of(robj) as *const *const u8)
        };
        if str_eq_bounded(kp, stored, self.key_nbits as usize / 8) {
            Some(robj)
        } else {
            None
        }
    }

    /// Key-equality lookup against `uobj`'s own key. The cursor, when asked
    /// for, is written even on a miss and can seed `next`/`prev` after a hit.
    pub unsafe fn locate(&self, uobj: *const u8, cur: Option<&mut Cursor>) -> Option<*mut u8> {
        if uobj.is_null() {
            return None;
        }
        let mut loc = Cursor::default();
        let robj = self.lookup_key(self.key_of(uobj), &mut loc);
        if let Some(c) = cur {
            *c = loc;
        }
        let robj = robj?;
        if self.diff(self.key_of(uobj), self.key_of(robj)) == -1 {
            Some(robj)
        } else {
            None
        }
    }

    /// Insert `uobj`. Fails if a record with an equal key is already
    /// indexed; the structure is unchanged on failure.
    #[tracing::instrument(skip_all)]
    pub unsafe fn add(&mut self, uobj: *mut u8) -> bool {
        if uobj.is_null() {
            return false;
        }
        // empty -> singleton
        if self.root.is_null() {
            let root = Cell::alloc();
            (*root).nodes[0].child[0] = Child::uobj(0);
            // pointer slot 1 stays null: the singleton sentinel
            (*root).nodes[0].child[1] = Child::subcell(1);
            (*root).ptrs[0] = uobj;
            self.root = root;
            self.n_objects = 1;
            return true;
        }
        let key = self.key_of(uobj);
        let mut cur = Cursor::default();
        // a non-empty tree always yields a candidate
        let robj = self.lookup_key(key, &mut cur).unwrap();
        let cbit = self.diff(key, self.key_of(robj));
        if cbit == -1 {
            return false;
        }
        let cbit = cbit as u32;
        let bit = self.bit(cbit, key);

        // second record: shape the root node
        if self.n_objects == 1 {
            let root = &mut *self.root;
            root.ptrs[1] = uobj;
            root.nodes[0].cbit = cbit as u8;
            root.nodes[0].child[bit] = Child::uobj(1);
            root.nodes[0].child[1 - bit] = Child::uobj(0);
            self.n_objects = 2;
            return true;
        }

        let mut cell;
        let mut upper: Option<(usize, usize)>;
        let mut lower;
        let mut need_descent;
        if cbit > (*cur.cell).nodes[cur.nid as usize].cbit as u32 {
            // the lookup ended on a deeper crit-bit, so the new node belongs
            // between the cursor node and its child; no descent from the root
            stats::count_shortcut();
            cell = cur.cell;
            upper = Some((cur.nid as usize, cur.cid as usize));
            lower = (*cell).nodes[cur.nid as usize].child[cur.cid as usize];
            need_descent = false;
        } else {
            cell = self.root;
            upper = None;
            lower = Child::node(0);
            need_descent = true;
        }

        loop {
            if need_descent {
                // walk from this cell's root tracking the deepest ancestor
                // with a smaller crit-bit; sub-cell edges restart the walk
                upper = None;
                lower = Child::node(0);
                loop {
                    if lower.is_uobj() {
                        break;
                    }
                    if lower.is_subcell() {
                        cell = (*cell).ptrs[lower.index()] as *mut Cell;
                        upper = None;
                        lower = Child::node(0);
                        continue;
                    }
                    let nid = lower.index();
                    if (*cell).nodes[nid].cbit as u32 > cbit {
                        break;
                    }
                    let d = self.bit((*cell).nodes[nid].cbit as u32, key);
                    upper = Some((nid, d));
                    lower = (*cell).nodes[nid].child[d];
                }
            }
            need_descent = true;
            if (*cell).ncount() < CELL_MAX_NODES {
                break;
            }
            // make room; push-down is cheaper than a split
            if !cell::push_down(cell) && !cell::split(cell) {
                return false;
            }
            // the insertion point may have moved into a sub-cell
        }

        let mut new_node = (*cell).alloc_node();
        let new_ptr = (*cell).alloc_ptr();
        (*cell).inc_ncount(1);
        (*cell).ptrs[new_ptr] = uobj;
        match upper {
            None => {
                // shallowest crit-bit in this cell: the old root moves down a
                // slot and the new node takes slot 0
                (*cell).nodes[new_node] = (*cell).nodes[0];
                lower = Child::node(new_node);
                new_node = 0;
            }
            Some((u, d)) => {
                (*cell).nodes[u].child[d] = Child::node(new_node);
            }
        }
        (*cell).nodes[new_node].cbit = cbit as u8;
        (*cell).nodes[new_node].child[bit] = Child::uobj(new_ptr);
        (*cell).nodes[new_node].child[1 - bit] = lower;
        self.n_objects += 1;
        self.validate();
        true
    }

    /// Remove the record whose key equals `uobj`'s key. Fails without
    /// touching the structure if no such record is indexed.
    #[tracing::instrument(skip_all)]
    pub unsafe fn remove(&mut self, uobj: *const u8) -> bool {
        let mut loc = Cursor::default();
        if self.locate(uobj, Some(&mut loc)).is_none() {
            return false;
        }
        let cell = loc.cell;
        let (nid, cid) = (loc.nid as usize, loc.cid as usize);
        let parent = (*cell).parent();
        (*cell).free_ptr((*cell).nodes[nid].child[cid].index());
        if nid == 0 {
            let sibling = (*cell).nodes[0].child[1 - cid];
            if sibling.is_node() {
                // promote the surviving side to cell root
                (*cell).nodes[0] = (*cell).nodes[sibling.index()];
                (*cell).free_node(sibling.index());
            } else if sibling.is_uobj() && parent.is_null() {
                // back to a singleton; the survivor moves to pointer slot 0
                let spid = sibling.index();
                (*cell).ptrs[0] = (*cell).ptrs[spid];
                if spid != 0 {
                    (*cell).free_ptr(spid);
                }
                (*cell).ptrs[1] = ptr::null_mut();
                (*cell).nodes[0].child[0] = Child::uobj(0);
                (*cell).nodes[0].child[1] = Child::subcell(1);
                self.n_objects -= 1;
                return true;
            } else {
                // one external left; it replaces the cell itself (push-up)
                if parent.is_null() {
                    self.root = (*cell).ptrs[sibling.index()] as *mut Cell;
                    if !self.root.is_null() {
                        (*self.root).set_parent(ptr::null_mut());
                    }
                } else {
                    let (anid, acid) = Cell::find_anchor(cell, parent);
                    let pid = (*parent).nodes[anid].child[acid].index();
                    (*parent).ptrs[pid] = (*cell).ptrs[sibling.index()];
                    if sibling.is_subcell() {
                        (*((*parent).ptrs[pid] as *mut Cell)).set_parent(parent);
                    }
                    (*parent).nodes[anid].child[acid] = sibling.retag(pid);
                }
                Cell::free(cell);
                stats::count_pushup();
                self.n_objects -= 1;
                self.validate();
                return true;
            }
        } else {
            // unlink an interior node; its other child takes its place
            let (p, c) = (*cell).node_parent(nid);
            (*cell).nodes[p].child[c] = (*cell).nodes[nid].child[1 - cid];
            (*cell).free_node(nid);
        }
        (*cell).dec_ncount(1);
        self.n_objects -= 1;

        // only plausibly sparse cells are worth a merge attempt
        if (*cell).ncount() <= CELL_MAX_NODES - CELL_MIN_NODES {
            if !parent.is_null() && (*cell).ncount() + (*parent).ncount() <= CELL_MAX_NODES {
                cell::merge_up(cell, parent);
            } else {
                stats::count_failed_merge();
            }
        }
        self.validate();
        true
    }

    fn validate(&self) {
        #[cfg(debug_assertions)]
        {
            // whole-tree validation after every mutation; very slow for
            // large trees
            const DO_TREE_VALIDATION: bool = false;
            if DO_TREE_VALIDATION {
                unsafe { self.check_invariants() };
            }
        }
    }

    /// Walk the whole structure asserting well-formedness: population
    /// counters, pointer-slot accounting, parent back-references, strictly
    /// increasing crit-bits, and key/bit agreement along every root-to-record
    /// path.
    pub unsafe fn check_invariants(&self) {
        if self.root.is_null() {
            assert_eq!(self.n_objects, 0);
            return;
        }
        let root = &*self.root;
        assert!(root.parent().is_null());
        if self.n_objects == 1 {
            assert_eq!(root.ncount(), 1);
            assert_eq!(root.nodes[0].child[0], Child::uobj(0));
            assert_eq!(root.nodes[0].child[1], Child::subcell(1));
            assert!(!root.ptrs[0].is_null());
            assert!(root.ptrs[1].is_null());
            return;
        }
        let mut path = Vec::new();
        let nodes = self.check_cell(self.root, -1, &mut path);
        assert_eq!(nodes + 1, self.n_objects as usize);
    }

    unsafe fn check_cell(&self, cell: *mut Cell, min_cbit: i32, path: &mut Vec<(u32, usize)>) -> usize {
        let c = &*cell;
        let pop = c.ncount();
        assert!((1..=CELL_MAX_NODES).contains(&pop));
        assert!(!c.node_is_vacant(0));
        let occupied = (0..CELL_MAX_NODES).filter(|&i| !c.node_is_vacant(i)).count();
        assert_eq!(occupied, pop);
        let mut seen = [false; CELL_MAX_NODES];
        let mut ptr_refs = [0u8; CELL_MAX_PTRS];
        let total = pop + self.check_node(cell, 0, min_cbit, path, &mut seen, &mut ptr_refs);
        assert_eq!(seen.iter().filter(|&&s| s).count(), pop);
        for i in 0..CELL_MAX_PTRS {
            assert!(ptr_refs[i] <= 1);
            assert_eq!(!c.ptrs[i].is_null(), ptr_refs[i] == 1);
        }
        total
    }

    unsafe fn check_node(
        &self,
        cell: *mut Cell,
        nid: usize,
        min_cbit: i32,
        path: &mut Vec<(u32, usize)>,
        seen: &mut [bool; CELL_MAX_NODES],
        ptr_refs: &mut [u8; CELL_MAX_PTRS],
    ) -> usize {
        assert!(!seen[nid]);
        seen[nid] = true;
        let node = (*cell).nodes[nid];
        let cbit = node.cbit as i32;
        assert!(cbit > min_cbit);
        assert!(cbit < self.key_nbits as i32);
        let mut sub_nodes = 0;
        for side in 0..2 {
            let child = node.child[side];
            assert_ne!(child, Child::VACANT);
            path.push((cbit as u32, side));
            match child.kind() {
                ChildKind::Node(n) => {
                    assert!(!(*cell).node_is_vacant(n));
                    sub_nodes += self.check_node(cell, n, cbit, path, seen, ptr_refs);
                }
                ChildKind::Uobj(p) => {
                    ptr_refs[p] += 1;
                    let rec = (*cell).ptrs[p];
                    assert!(!rec.is_null());
                    let key = self.key_of(rec);
                    for &(b, s) in path.iter() {
                        assert_eq!(self.bit(b, key), s);
                    }
                }
                ChildKind::SubCell(p) => {
                    ptr_refs[p] += 1;
                    let sub = (*cell).ptrs[p] as *mut Cell;
                    assert!(!sub.is_null());
                    assert_eq!((*sub).parent(), cell);
                    sub_nodes += self.check_cell(sub, cbit, path);
                }
            }
            path.pop();
        }
        sub_nodes
    }
}

impl Drop for C3bt {
    fn drop(&mut self) {
        if !self.root.is_null() {
            unsafe { free_cells(self.root) };
            self.root = ptr::null_mut();
        }
    }
}

/// Post-order release of a cell and all of its sub-cells, taking the
/// occupancy autopsy on the way.
unsafe fn free_cells(cell: *mut Cell) {
    for nid in 0..CELL_MAX_NODES {
        if (*cell).node_is_vacant(nid) {
            continue;
        }
        for cid in 0..2 {
            let child = (*cell).nodes[nid].child[cid];
            if child.is_subcell() {
                let sub = (*cell).ptrs[child.index()] as *mut Cell;
                // the singleton sentinel is a null sub-cell slot
                if !sub.is_null() {
                    free_cells(sub);
                }
            }
        }
    }
    stats::count_popdist((*cell).ncount());
    Cell::free(cell);
}

unsafe fn str_eq_bounded(a: *const u8, b: *const u8, max: usize) -> bool {
    for i in 0..max {
        let (x, y) = (*a.add(i), *b.add(i));
        if x != y {
            return false;
        }
        if x == 0 {
            break;
        }
    }
    true
}
