use smallvec::SmallVec;
use std::ptr;
use tracing::trace;

use crate::stats;

pub(crate) const CELL_MAX_NODES: usize = 8;
pub(crate) const CELL_MAX_PTRS: usize = CELL_MAX_NODES + 1;
pub(crate) const CELL_MIN_NODES: usize = 3;
/// In-cell depth-first traversal stack size.
const DFT_STACK_SIZE: usize = 6;

const CHILD_UOBJ_BIT: u8 = 0x80;
const CHILD_CELL_BIT: u8 = 0x40;
const FLAGS_MASK: u8 = CHILD_UOBJ_BIT | CHILD_CELL_BIT;
const INDEX_MASK: u8 = 0x0f;
const INVALID_NODE: u8 = 0x3f;

/// One-byte tagged child reference.
///
/// - `10xxxxxx`: index into the cell's pointer array, slot holds a record.
/// - `01xxxxxx`: index into the cell's pointer array, slot holds a sub-cell.
/// - both tag bits clear: index of a node within the same cell; `0x3f` marks
///   a vacant node slot.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(transparent)]
pub(crate) struct Child(u8);

#[derive(Copy, Clone, Debug)]
pub(crate) enum ChildKind {
    Node(usize),
    Uobj(usize),
    SubCell(usize),
}

impl Child {
    pub const VACANT: Child = Child(INVALID_NODE);

    pub fn node(nid: usize) -> Child {
        debug_assert!(nid < CELL_MAX_NODES);
        Child(nid as u8)
    }

    pub fn uobj(pid: usize) -> Child {
        debug_assert!(pid < CELL_MAX_PTRS);
        Child(CHILD_UOBJ_BIT | pid as u8)
    }

    pub fn subcell(pid: usize) -> Child {
        debug_assert!(pid < CELL_MAX_PTRS);
        Child(CHILD_CELL_BIT | pid as u8)
    }

    pub fn is_node(self) -> bool {
        self.0 < CELL_MAX_NODES as u8
    }

    pub fn is_uobj(self) -> bool {
        self.0 & CHILD_UOBJ_BIT != 0
    }

    pub fn is_subcell(self) -> bool {
        self.0 & CHILD_CELL_BIT != 0
    }

    /// Index into the node array or the pointer array, depending on the tag.
    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// Keep the tag, point at pointer slot `pid` instead.
    pub fn retag(self, pid: usize) -> Child {
        debug_assert!(!self.is_node());
        Child(self.0 & FLAGS_MASK | pid as u8)
    }

    pub fn kind(self) -> ChildKind {
        debug_assert!(self != Child::VACANT);
        if self.is_uobj() {
            ChildKind::Uobj(self.index())
        } else if self.is_subcell() {
            ChildKind::SubCell(self.index())
        } else {
            ChildKind::Node(self.index())
        }
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
pub(crate) struct CbNode {
    pub cbit: u8,
    pub child: [Child; 2],
}

/// The clustering unit: one contiguous crit-bit subtree of up to 8 nodes
/// plus the 9 external pointers hanging off it (records and sub-cells).
/// Node 0 is always the root of the cell's subtree. The parent pointer is
/// purely navigational; ownership runs strictly downwards through the
/// pointer slots tagged as sub-cells.
#[repr(C, align(8))]
pub(crate) struct Cell {
    parent: *mut Cell,
    ncount: u8,
    pub nodes: [CbNode; CELL_MAX_NODES],
    pub ptrs: [*mut u8; CELL_MAX_PTRS],
}

impl Cell {
    pub fn alloc() -> *mut Cell {
        let cell = Box::into_raw(Box::new(Cell {
            parent: ptr::null_mut(),
            // a cell never holds fewer than one node
            ncount: 1,
            nodes: [CbNode {
                cbit: 0,
                child: [Child::VACANT; 2],
            }; CELL_MAX_NODES],
            ptrs: [ptr::null_mut(); CELL_MAX_PTRS],
        }));
        debug_assert!(cell as usize & 7 == 0);
        stats::count_cell_alloc();
        cell
    }

    pub unsafe fn free(cell: *mut Cell) {
        stats::count_cell_free();
        drop(Box::from_raw(cell));
    }

    pub fn ncount(&self) -> usize {
        self.ncount as usize
    }

    pub fn set_ncount(&mut self, n: usize) {
        self.ncount = n as u8;
    }

    pub fn inc_ncount(&mut self, delta: usize) {
        debug_assert!(self.ncount() + delta <= CELL_MAX_NODES);
        self.ncount += delta as u8;
    }

    pub fn dec_ncount(&mut self, delta: usize) {
        debug_assert!(self.ncount() >= delta);
        self.ncount -= delta as u8;
    }

    pub fn parent(&self) -> *mut Cell {
        self.parent
    }

    pub fn set_parent(&mut self, parent: *mut Cell) {
        self.parent = parent;
    }

    pub fn node_is_vacant(&self, nid: usize) -> bool {
        self.nodes[nid].child[0] == Child::VACANT
    }

    pub fn free_node(&mut self, nid: usize) {
        self.nodes[nid].child[0] = Child::VACANT;
    }

    pub fn free_ptr(&mut self, pid: usize) {
        self.ptrs[pid] = ptr::null_mut();
    }

    /// Claim a vacant node slot. Slot 0 is the cell root and never handed
    /// out; the slot is marked occupied immediately so that allocations
    /// interleaved with a subtree copy stay disjoint.
    pub fn alloc_node(&mut self) -> usize {
        let nid = (1..CELL_MAX_NODES)
            .find(|&i| self.node_is_vacant(i))
            .unwrap();
        self.nodes[nid].child[0] = Child::node(0);
        nid
    }

    pub fn alloc_ptr(&mut self) -> usize {
        let pid = (0..CELL_MAX_PTRS)
            .find(|&i| self.ptrs[i].is_null())
            .unwrap();
        self.ptrs[pid] = 1 as *mut u8;
        pid
    }

    /// Parent slot and child side of in-cell node `nid`; `nid` must not be 0.
    pub fn node_parent(&self, nid: usize) -> (usize, usize) {
        debug_assert!(nid > 0);
        let needle = Child::node(nid);
        for n in 0..CELL_MAX_NODES {
            if self.node_is_vacant(n) {
                continue;
            }
            for c in 0..2 {
                if self.nodes[n].child[c] == needle {
                    return (n, c);
                }
            }
        }
        unreachable!("in-cell node {nid} has no parent");
    }

    /// Anchor (node slot, child side) of `cell` inside `parent`.
    pub unsafe fn find_anchor(cell: *mut Cell, parent: *mut Cell) -> (usize, usize) {
        let parent = &*parent;
        let pid = (0..CELL_MAX_PTRS)
            .find(|&i| parent.ptrs[i] as *mut Cell == cell)
            .unwrap();
        let needle = Child::subcell(pid);
        for nid in 0..CELL_MAX_NODES {
            if parent.node_is_vacant(nid) {
                continue;
            }
            for cid in 0..2 {
                if parent.nodes[nid].child[cid] == needle {
                    return (nid, cid);
                }
            }
        }
        unreachable!("sub-cell is not anchored in its parent");
    }
}

/// Move one edge node of a full `cell` down into the sub-cell hanging off
/// it, freeing a node slot. An edge node has a sub-cell on one side and an
/// external leaf (not an in-cell node) on the other; the sub-cell must keep
/// a slot spare after the move so the pending insertion still fits.
pub(crate) unsafe fn push_down(cell: *mut Cell) -> bool {
    let cellr = &mut *cell;
    for n in 1..CELL_MAX_NODES {
        if cellr.node_is_vacant(n) {
            continue;
        }
        for c in 0..2 {
            let down = cellr.nodes[n].child[c];
            if !down.is_subcell() || cellr.nodes[n].child[1 - c].is_node() {
                continue;
            }
            let sub = cellr.ptrs[down.index()] as *mut Cell;
            if (*sub).ncount() >= CELL_MAX_NODES - 1 {
                continue;
            }
            let subr = &mut *sub;
            let sibling = cellr.nodes[n].child[1 - c];
            let old_root = subr.alloc_node();
            let new_ptr = subr.alloc_ptr();
            subr.inc_ncount(1);
            let (np, npc) = cellr.node_parent(n);
            cellr.nodes[np].child[npc] = down;
            subr.nodes[old_root] = subr.nodes[0];
            subr.ptrs[new_ptr] = cellr.ptrs[sibling.index()];
            subr.nodes[0].cbit = cellr.nodes[n].cbit;
            subr.nodes[0].child[c] = Child::node(old_root);
            subr.nodes[0].child[1 - c] = sibling.retag(new_ptr);
            if sibling.is_subcell() {
                (*(subr.ptrs[new_ptr] as *mut Cell)).set_parent(sub);
            }
            cellr.free_node(n);
            cellr.free_ptr(sibling.index());
            cellr.dec_ncount(1);
            stats::count_pushdown();
            trace!(cell = ?cell, node = n, "push-down");
            return true;
        }
    }
    false
}

/// Pick the root of the subtree to split off, preferring a 4+4 partition
/// over 3+5. Returns the would-be new cell root and a bitmap of the node
/// slots in its in-cell subtree.
fn find_split(cell: &Cell) -> Option<(usize, u8)> {
    let mut alt = None;
    for i in 1..CELL_MAX_NODES {
        if !cell.nodes[i].child[0].is_node() && !cell.nodes[i].child[1].is_node() {
            continue;
        }
        // pre-order walk counting in-cell children below `i`; the cell root
        // and leaves are excluded, so only a handful of nodes get here
        let mut bitmap = 0u8;
        let mut count = 0;
        let mut stack: SmallVec<[u8; DFT_STACK_SIZE]> = SmallVec::new();
        stack.push(i as u8);
        while let Some(n) = stack.pop() {
            bitmap |= 0x80u8 >> n;
            for cid in (0..2).rev() {
                let child = cell.nodes[n as usize].child[cid];
                if child.is_node() {
                    stack.push(child.index() as u8);
                    count += 1;
                }
            }
        }
        if count == 3 {
            return Some((i, bitmap));
        }
        if count == 2 || count == 4 {
            alt = Some((i, bitmap));
        }
    }
    alt
}

/// Split a full cell in two; the new cell becomes one of its sub-cells.
pub(crate) unsafe fn split(cell: *mut Cell) -> bool {
    let cellr = &mut *cell;
    let Some((new_root, bitmap)) = find_split(cellr) else {
        // a full cell always contains a subtree of 3..=5 nodes: walking from
        // the root into the larger child shrinks the subtree by at most half
        // per step, so the walk cannot jump over that window
        debug_assert!(false, "no split point in a full cell");
        return false;
    };
    let new_cell = Cell::alloc();
    let newr = &mut *new_cell;
    let mut count = 0;
    for i in 0..CELL_MAX_NODES {
        if bitmap & (0x80u8 >> i) == 0 {
            continue;
        }
        // the node and its externals keep their slot indices, so the child
        // bytes stay valid as copied
        newr.nodes[i] = cellr.nodes[i];
        for cid in 0..2 {
            let child = cellr.nodes[i].child[cid];
            if child.is_node() {
                continue;
            }
            if child.is_subcell() {
                (*(cellr.ptrs[child.index()] as *mut Cell)).set_parent(new_cell);
            }
            let p = child.index();
            newr.ptrs[p] = cellr.ptrs[p];
            cellr.free_ptr(p);
        }
        count += 1;
        cellr.free_node(i);
    }

    // fix the old cell
    let p = cellr.alloc_ptr();
    cellr.ptrs[p] = new_cell as *mut u8;
    let (n, c) = cellr.node_parent(new_root);
    cellr.nodes[n].child[c] = Child::subcell(p);
    cellr.dec_ncount(count);

    // fix the new cell
    newr.nodes[0] = newr.nodes[new_root];
    newr.free_node(new_root);
    newr.set_ncount(count);
    newr.set_parent(cell);
    stats::count_split();
    trace!(cell = ?cell, moved = count, "split");
    true
}

unsafe fn copy_ptr(src: *mut Cell, dest: *mut Cell, child: Child) -> Child {
    let new_ptr = (*dest).alloc_ptr();
    (*dest).ptrs[new_ptr] = (*src).ptrs[child.index()];
    if child.is_subcell() {
        (*((*dest).ptrs[new_ptr] as *mut Cell)).set_parent(dest);
    }
    child.retag(new_ptr)
}

unsafe fn copy_node(src: *mut Cell, dest: *mut Cell, nid: usize) -> usize {
    let new_node = (*dest).alloc_node();
    (*dest).inc_ncount(1);
    (*dest).nodes[new_node].cbit = (*src).nodes[nid].cbit;
    for c in 0..2 {
        let child = (*src).nodes[nid].child[c];
        (*dest).nodes[new_node].child[c] = if child.is_node() {
            Child::node(copy_node(src, dest, child.index()))
        } else {
            copy_ptr(src, dest, child)
        };
    }
    new_node
}

/// Fold the whole subtree of `cell` into `parent` at its anchor and free
/// `cell`. The caller has checked that the populations fit in one cell.
pub(crate) unsafe fn merge_up(cell: *mut Cell, parent: *mut Cell) {
    debug_assert!((*cell).ncount() + (*parent).ncount() <= CELL_MAX_NODES);
    let (anid, acid) = Cell::find_anchor(cell, parent);
    (*parent).free_ptr((*parent).nodes[anid].child[acid].index());
    let new_node = (*parent).alloc_node();
    (*parent).inc_ncount(1);
    (*parent).nodes[anid].child[acid] = Child::node(new_node);
    (*parent).nodes[new_node].cbit = (*cell).nodes[0].cbit;
    for c in 0..2 {
        let child = (*cell).nodes[0].child[c];
        (*parent).nodes[new_node].child[c] = if child.is_node() {
            Child::node(copy_node(cell, parent, child.index()))
        } else {
            copy_ptr(cell, parent, child)
        };
    }
    Cell::free(cell);
    stats::count_mergeup();
    trace!(parent = ?parent, "merge-up");
}
