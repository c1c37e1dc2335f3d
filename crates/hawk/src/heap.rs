//! The reference-counted heap (spec §3.2, §3.5). Owns every non-immediate
//! [`Value`]: strings, floats, out-of-range ints, regexes, function refs,
//! references, and the two GC-tracked aggregate kinds, Map and Array.
//!
//! Slots are reused through a single intrusive free list rather than the
//! source's size-bucketed allocator; Rust's global allocator already reuses
//! freed `String`/`Vec` buffers reasonably well, so a second, hand-rolled
//! bucket cache on top of it bought nothing but risk. Recorded in DESIGN.md.

use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexMap;

use crate::error::HawkResult;
use crate::gc::GcState;
use crate::value::{RefTarget, Value};

pub type HawkMap = IndexMap<Rc<str>, Value, RandomState>;

/// Opaque handle into the heap's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct CompiledRegex {
    pub source: Rc<str>,
    pub re: regex::Regex,
}

/// The payload a heap cell owns (spec §3.1's heap-allocated variants).
#[derive(Debug)]
pub enum HeapData {
    Int(i64),
    Float(f64),
    Str(String),
    ByteString(Vec<u8>),
    Regex(CompiledRegex),
    /// Index into the program's function table.
    FunctionRef(u32),
    Map(HawkMap),
    Array(Vec<Value>),
    Reference(RefTarget),
}

impl HeapData {
    fn is_aggregate(&self) -> bool {
        matches!(self, Self::Map(_) | Self::Array(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum GcMark {
    #[default]
    Normal,
    Moved,
    Unreachable,
}

/// Scratch bookkeeping consulted only by [`crate::gc`] during a collection pass.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct GcMeta {
    pub generation: u8,
    pub scratch_refs: i64,
    pub mark: GcMark,
}

#[derive(Debug)]
struct HeapCell {
    data: HeapData,
    rc: u32,
    numeric_string: bool,
    gc: Option<GcMeta>,
}

enum Slot {
    Occupied(HeapCell),
    Free(u32),
}

const NIL_FREE: u32 = u32::MAX;

/// Allocation counters exposed to embedders and tests (spec §3.5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_cells: usize,
    pub free_slots: usize,
    pub total_slots: usize,
    pub gen0: usize,
    pub gen1: usize,
    pub gen2: usize,
}

pub struct Heap {
    slots: Vec<Slot>,
    free_head: u32,
    live_cells: usize,
    pub(crate) gc: GcState,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free_head: NIL_FREE, live_cells: 0, gc: GcState::default() }
    }

    fn insert(&mut self, cell: HeapCell) -> HeapId {
        self.live_cells += 1;
        if self.free_head != NIL_FREE {
            let idx = self.free_head;
            let Slot::Free(next) = self.slots[idx as usize] else {
                unreachable!("free_head does not point at a free slot")
            };
            self.free_head = next;
            self.slots[idx as usize] = Slot::Occupied(cell);
            HeapId(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot::Occupied(cell));
            HeapId(idx)
        }
    }

    fn cell(&self, id: HeapId) -> &HeapCell {
        match &self.slots[id.index()] {
            Slot::Occupied(cell) => cell,
            Slot::Free(_) => panic!("use of freed HeapId"),
        }
    }

    fn cell_mut(&mut self, id: HeapId) -> &mut HeapCell {
        match &mut self.slots[id.index()] {
            Slot::Occupied(cell) => cell,
            Slot::Free(_) => panic!("use of freed HeapId"),
        }
    }

    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.cell(id).data
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.cell_mut(id).data
    }

    pub fn is_numeric_string(&self, id: HeapId) -> bool {
        self.cell(id).numeric_string
    }

    pub fn set_numeric_string(&mut self, id: HeapId, flag: bool) {
        self.cell_mut(id).numeric_string = flag;
    }

    pub fn rc(&self, id: HeapId) -> u32 {
        self.cell(id).rc
    }

    pub fn refup(&mut self, id: HeapId) {
        self.cell_mut(id).rc += 1;
    }

    /// Drops one reference; frees (and cascades into) the cell's own
    /// contents if this was the last one. A cell still part of a reference
    /// cycle never reaches zero through this path alone — that is exactly
    /// what [`crate::gc::collect`] exists for.
    pub fn refdown(&mut self, id: HeapId) {
        let cell = self.cell_mut(id);
        debug_assert!(cell.rc > 0, "refdown on a cell with zero refcount");
        cell.rc -= 1;
        if cell.rc == 0 {
            self.free(id);
        }
    }

    /// Like [`Self::refdown`], but if `id` is already marked unreachable by
    /// an in-progress collection, it is skipped: the collector's sweep will
    /// free it directly, and decrementing here would double-free the shell.
    pub(crate) fn gc_aware_refdown(&mut self, id: HeapId) {
        if let Some(meta) = self.cell(id).gc.as_ref() {
            if meta.mark == GcMark::Unreachable {
                return;
            }
        }
        self.refdown(id);
    }

    fn free(&mut self, id: HeapId) {
        let idx = id.index();
        let Slot::Occupied(cell) = std::mem::replace(&mut self.slots[idx], Slot::Free(self.free_head))
        else {
            unreachable!("double free of HeapId")
        };
        self.free_head = idx as u32;
        self.live_cells -= 1;

        if let Some(meta) = cell.gc.as_ref() {
            self.gc.untrack(id, meta.generation);
        }

        match cell.data {
            HeapData::Map(map) => {
                for (_, v) in map {
                    self.drop_child(v);
                }
            }
            HeapData::Array(arr) => {
                for v in arr {
                    self.drop_child(v);
                }
            }
            HeapData::Reference(_)
            | HeapData::Int(_)
            | HeapData::Float(_)
            | HeapData::Str(_)
            | HeapData::ByteString(_)
            | HeapData::Regex(_)
            | HeapData::FunctionRef(_) => {}
        }
    }

    /// Releases a value owned by an aggregate being freed, respecting the
    /// in-progress collector's unreachable marks (spec §4.4 "dissolve").
    fn drop_child(&mut self, v: Value) {
        if let Value::Ref(child) = v {
            self.gc_aware_refdown(child);
        }
    }

    pub fn alloc_scalar(&mut self, data: HeapData) -> HeapId {
        debug_assert!(!data.is_aggregate());
        self.insert(HeapCell { data, rc: 1, numeric_string: false, gc: None })
    }

    pub fn alloc_string(&mut self, s: String, numeric_string: bool) -> HeapId {
        self.insert(HeapCell { data: HeapData::Str(s), rc: 1, numeric_string, gc: None })
    }

    pub fn alloc_byte_string(&mut self, b: Vec<u8>) -> HeapId {
        self.alloc_scalar(HeapData::ByteString(b))
    }

    pub fn alloc_regex(&mut self, source: impl Into<Rc<str>>) -> HawkResult<HeapId> {
        let source = source.into();
        let re = regex::Regex::new(&source)
            .map_err(|e| crate::error::HawkError::regex(e.to_string(), crate::loc::SourceLoc::synthetic()))?;
        Ok(self.alloc_scalar(HeapData::Regex(CompiledRegex { source, re })))
    }

    pub fn alloc_function_ref(&mut self, idx: u32) -> HeapId {
        self.alloc_scalar(HeapData::FunctionRef(idx))
    }

    pub fn alloc_reference(&mut self, target: RefTarget) -> HeapId {
        self.alloc_scalar(HeapData::Reference(target))
    }

    /// Allocates a GC-tracked aggregate, registering it in generation 0 and
    /// running a collection first if generation 0 is already under pressure
    /// (spec §4.4 "allocation hook").
    fn alloc_aggregate(&mut self, data: HeapData) -> HeapId {
        debug_assert!(data.is_aggregate());
        if self.gc.gen0_over_threshold() {
            crate::gc::collect(self, 0);
        }
        let id = self.insert(HeapCell {
            data,
            rc: 1,
            numeric_string: false,
            gc: Some(GcMeta { generation: 0, scratch_refs: 0, mark: GcMark::Normal }),
        });
        self.gc.track_new(id);
        id
    }

    pub fn alloc_map(&mut self, map: HawkMap) -> HeapId {
        self.alloc_aggregate(HeapData::Map(map))
    }

    pub fn alloc_array(&mut self, arr: Vec<Value>) -> HeapId {
        self.alloc_aggregate(HeapData::Array(arr))
    }

    /// Resolves an in-heap reference target (a slot inside a Map or Array).
    /// Targets rooted in the frame stack (`Global`/`Local`/`Field`) are the
    /// runtime's job, not the heap's, since the heap has no view of frames.
    pub fn resolve(&self, target: &RefTarget) -> Option<&Value> {
        match target {
            RefTarget::MapSlot(id, key) => match self.get(*id) {
                HeapData::Map(m) => m.get(key.as_ref()),
                _ => None,
            },
            RefTarget::ArraySlot(id, idx) => match self.get(*id) {
                HeapData::Array(a) => a.get(idx.checked_sub(1)?),
                _ => None,
            },
            RefTarget::Global(_) | RefTarget::Local(_) | RefTarget::Field(_) | RefTarget::Named(_) => None,
        }
    }

    pub(crate) fn gc_meta(&self, id: HeapId) -> Option<&GcMeta> {
        self.cell(id).gc.as_ref()
    }

    pub(crate) fn gc_meta_mut(&mut self, id: HeapId) -> Option<&mut GcMeta> {
        self.cell_mut(id).gc.as_mut()
    }

    /// Direct Map/Array children of an aggregate cell, the only edges the
    /// collector traces (spec §4.4's GC is scoped to Map/Array alone).
    pub(crate) fn aggregate_children(&self, id: HeapId) -> Vec<HeapId> {
        let mut out = Vec::new();
        match self.get(id) {
            HeapData::Map(m) => {
                for v in m.values() {
                    if let Value::Ref(child) = v {
                        if self.cell(*child).gc.is_some() {
                            out.push(*child);
                        }
                    }
                }
            }
            HeapData::Array(a) => {
                for v in a {
                    if let Value::Ref(child) = v {
                        if self.cell(*child).gc.is_some() {
                            out.push(*child);
                        }
                    }
                }
            }
            _ => {}
        }
        out
    }

    /// Drops the entire contents of an unreachable aggregate without
    /// freeing its own shell yet (the collector frees shells in a final
    /// pass once every unreachable cell in the batch has been marked).
    pub(crate) fn dissolve_unreachable(&mut self, id: HeapId) {
        let data = std::mem::replace(&mut self.cell_mut(id).data, HeapData::Int(0));
        match data {
            HeapData::Map(map) => {
                for (_, v) in map {
                    self.drop_child(v);
                }
            }
            HeapData::Array(arr) => {
                for v in arr {
                    self.drop_child(v);
                }
            }
            other => self.cell_mut(id).data = other,
        }
    }

    /// Frees the now-empty shell of a cell the collector marked unreachable
    /// and already dissolved.
    pub(crate) fn free_shell(&mut self, id: HeapId) {
        let idx = id.index();
        let Slot::Occupied(_) =
            std::mem::replace(&mut self.slots[idx], Slot::Free(self.free_head))
        else {
            unreachable!("double free of HeapId")
        };
        self.free_head = idx as u32;
        self.live_cells -= 1;
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_cells: self.live_cells,
            free_slots: self.slots.len() - self.live_cells,
            total_slots: self.slots.len(),
            gen0: self.gc.len(0),
            gen1: self.gc.len(1),
            gen2: self.gc.len(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_cycle_then_free() {
        let mut heap = Heap::new();
        let id = heap.alloc_scalar(HeapData::Int(99));
        assert_eq!(heap.rc(id), 1);
        heap.refup(id);
        assert_eq!(heap.rc(id), 2);
        heap.refdown(id);
        assert_eq!(heap.rc(id), 1);
        let stats_before = heap.stats();
        heap.refdown(id);
        let stats_after = heap.stats();
        assert_eq!(stats_after.live_cells, stats_before.live_cells - 1);
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc_scalar(HeapData::Int(1));
        heap.refdown(a);
        let b = heap.alloc_scalar(HeapData::Int(2));
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn map_alloc_tracks_generation_zero() {
        let mut heap = Heap::new();
        let id = heap.alloc_map(HawkMap::default());
        assert_eq!(heap.stats().gen0, 1);
        heap.refdown(id);
        assert_eq!(heap.stats().gen0, 0);
    }
}
