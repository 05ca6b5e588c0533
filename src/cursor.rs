use std::ptr;

use crate::cell::{Cell, Child};
use crate::tree::C3bt;

/// Iteration locator: the last visited (cell, node slot, child side).
/// A cursor stays valid until the tree is next modified.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Cursor {
    pub(crate) cell: *mut Cell,
    pub(crate) nid: u16,
    pub(crate) cid: u16,
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor {
            cell: ptr::null_mut(),
            nid: 0,
            cid: 0,
        }
    }
}

/// From `cur`, keep taking child side `dir` through in-cell nodes and
/// sub-cell jumps until a record is reached. The tree must hold at least
/// two records.
pub(crate) unsafe fn rush_down(cur: &mut Cursor, dir: usize) -> Option<*mut u8> {
    cur.cid = dir as u16;
    let mut cell = cur.cell;
    let mut child = Child::node(cur.nid as usize);
    while !cell.is_null() {
        cur.cell = cell;
        while child.is_node() {
            cur.nid = child.index() as u16;
            child = (*cell).nodes[child.index()].child[dir];
        }
        if child.is_uobj() {
            return Some((*cell).ptrs[child.index()]);
        }
        cell = (*cell).ptrs[child.index()] as *mut Cell;
        child = Child::node(0);
    }
    None
}

impl C3bt {
    unsafe fn extreme(&self, cur: Option<&mut Cursor>, dir: usize) -> Option<*mut u8> {
        if self.root.is_null() {
            return None;
        }
        let mut start = Cursor {
            cell: self.root,
            nid: 0,
            cid: 0,
        };
        let robj = if self.n_objects == 1 {
            Some((*self.root).ptrs[0])
        } else {
            rush_down(&mut start, dir)
        };
        if let Some(c) = cur {
            *c = start;
        }
        robj
    }

    /// Smallest-keyed record; the cursor, when asked for, seeds `next`.
    pub unsafe fn first(&self, cur: Option<&mut Cursor>) -> Option<*mut u8> {
        self.extreme(cur, 0)
    }

    /// Largest-keyed record; the cursor, when asked for, seeds `prev`.
    pub unsafe fn last(&self, cur: Option<&mut Cursor>) -> Option<*mut u8> {
        self.extreme(cur, 1)
    }

    unsafe fn step(&self, cur: &mut Cursor, dir: usize) -> Option<*mut u8> {
        // nowhere to step in an empty or singleton tree
        if self.n_objects < 2 || cur.cell.is_null() {
            return None;
        }
        if cur.cid as usize == dir {
            // climb cell by cell; within each cell a key-guided walk finds
            // the deepest ancestor that departs toward `dir`
            let cur_cbit = (*cur.cell).nodes[cur.nid as usize].cbit;
            let here = (*cur.cell).nodes[cur.nid as usize].child[cur.cid as usize];
            let key = self.key_of((*cur.cell).ptrs[here.index()]);
            let mut cell = cur.cell;
            loop {
                if cell.is_null() {
                    return None;
                }
                let mut upper = None;
                let mut child = Child::node(0);
                while child.is_node() {
                    let nid = child.index();
                    if (*cell).nodes[nid].cbit >= cur_cbit {
                        break;
                    }
                    let bit = self.bit((*cell).nodes[nid].cbit as u32, key);
                    if bit != dir {
                        upper = Some(nid);
                    }
                    child = (*cell).nodes[nid].child[bit];
                }
                if let Some(u) = upper {
                    cur.cell = cell;
                    cur.nid = u as u16;
                    break;
                }
                cell = (*cell).parent();
            }
        }
        // step into the `dir` sibling, then run to its near edge
        let lower = (*cur.cell).nodes[cur.nid as usize].child[dir];
        if lower.is_uobj() {
            cur.cid = dir as u16;
            return Some((*cur.cell).ptrs[lower.index()]);
        }
        if lower.is_subcell() {
            cur.cell = (*cur.cell).ptrs[lower.index()] as *mut Cell;
            cur.nid = 0;
        } else {
            cur.nid = lower.index() as u16;
        }
        rush_down(cur, 1 - dir)
    }

    /// Step the cursor to the next record in ascending key order.
    pub unsafe fn next(&self, cur: &mut Cursor) -> Option<*mut u8> {
        self.step(cur, 1)
    }

    /// Step the cursor to the previous record in ascending key order.
    pub unsafe fn prev(&self, cur: &mut Cursor) -> Option<*mut u8> {
        self.step(cur, 0)
    }

    /// Records in ascending key order. Relies on the liveness contract the
    /// caller took on when adding the records.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            cur: Cursor::default(),
            started: false,
        }
    }
}

/// Ascending-order iterator over the indexed records.
pub struct Iter<'a> {
    tree: &'a C3bt,
    cur: Cursor,
    started: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = *mut u8;

    fn next(&mut self) -> Option<*mut u8> {
        unsafe {
            if !self.started {
                self.started = true;
                self.tree.first(Some(&mut self.cur))
            } else {
                self.tree.next(&mut self.cur)
            }
        }
    }
}
