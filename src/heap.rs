// File: src/heap.rs
//
// The managed heap: an arena of `Obj`s addressed by `ObjRef`, a weak
// interned-string table, and the tri-color mark-sweep collector that
// reclaims anything unreachable from the VM's roots.

use crate::value::{hash_str, Obj, ObjRef, StringObj, Value};
use std::collections::HashMap;

struct HeapEntry {
    marked: bool,
    size: usize,
    obj: Obj,
}

const GROW_FACTOR: usize = 2;
const DEFAULT_NEXT_GC: usize = 1024 * 1024;

pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<u32>,
    /// Content -> ObjRef. Weak: collection drops entries whose string
    /// didn't survive marking, so interning never roots a dead string.
    strings: HashMap<Box<str>, ObjRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            entries: Vec::new(),
            free_list: Vec::new(),
            strings: HashMap::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
        }
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    fn insert(&mut self, obj: Obj) -> ObjRef {
        let size = obj.heap_size();
        self.bytes_allocated += size;
        let entry = HeapEntry { marked: false, size, obj };
        if let Some(index) = self.free_list.pop() {
            self.entries[index as usize] = Some(entry);
            ObjRef(index)
        } else {
            self.entries.push(Some(entry));
            ObjRef((self.entries.len() - 1) as u32)
        }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.insert(obj)
    }

    /// Interns `s`: returns the existing string object if one with
    /// identical bytes is already live, otherwise allocates and records
    /// it. Pointer equality on the result implies content equality.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(existing) = self.strings.get(s) {
            return *existing;
        }
        let obj = StringObj::new(s);
        let r = self.insert(Obj::String(obj));
        self.strings.insert(s.into(), r);
        r
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.entries[r.0 as usize]
            .as_ref()
            .map(|e| &e.obj)
            .expect("dangling ObjRef: object was swept while still referenced")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.entries[r.0 as usize]
            .as_mut()
            .map(|e| &mut e.obj)
            .expect("dangling ObjRef: object was swept while still referenced")
    }

    pub fn as_string(&self, r: ObjRef) -> &StringObj {
        match self.get(r) {
            Obj::String(s) => s,
            other => panic!("ObjRef did not point to a string: {}", other.kind_name()),
        }
    }

    pub fn string_hash(&self, r: ObjRef) -> u64 {
        self.as_string(r).hash
    }

    /// Looks up a string's identity by content without allocating,
    /// mirroring how the compiler deduplicates repeated string/name
    /// constants before falling back to `intern`.
    pub fn find_string(&self, s: &str) -> Option<ObjRef> {
        self.strings.get(s).copied()
    }

    pub fn hash_of(&self, s: &str) -> u64 {
        hash_str(s)
    }

    // ---- Garbage collection -------------------------------------------------

    fn mark_object(&mut self, r: ObjRef, gray: &mut Vec<ObjRef>) {
        let entry = match self.entries[r.0 as usize].as_mut() {
            Some(e) => e,
            None => return,
        };
        if entry.marked {
            return;
        }
        entry.marked = true;
        gray.push(r);
    }

    pub fn mark_value(&mut self, value: Value, gray: &mut Vec<ObjRef>) {
        if let Value::Obj(r) = value {
            self.mark_object(r, gray);
        }
    }

    /// Blackens one gray object: marks everything it directly
    /// references. Returns nothing; children are pushed back onto
    /// `gray` by `mark_object`/`mark_value`.
    fn blacken(&mut self, r: ObjRef, gray: &mut Vec<ObjRef>) {
        // Obj::heap_size and the match below both need `&self.entries`
        // content; clone out the small set of references we need to mark
        // first so we aren't holding a borrow of `self` while recursing.
        enum Children {
            None,
            Values(Vec<Value>),
            Refs(Vec<ObjRef>),
            Mixed(Vec<ObjRef>, Vec<(ObjRef, Value)>),
        }

        let children = match &self.entries[r.0 as usize].as_ref().unwrap().obj {
            Obj::String(_) => Children::None,
            Obj::Array(values) => Children::Values(values.clone()),
            Obj::Function(f) => {
                Children::Refs(f.constants.iter().filter_map(|v| v.as_obj()).collect())
            }
            Obj::Closure(c) => {
                let mut refs = vec![c.function];
                refs.extend(c.upvalues.iter().copied());
                Children::Refs(refs)
            }
            Obj::Upvalue(u) => match u.state {
                crate::value::UpvalueState::Closed(v) => Children::Values(vec![v]),
                crate::value::UpvalueState::Open(_) => Children::None,
            },
            Obj::Native(n) => Children::Refs(vec![n.name]),
            Obj::Struct(s) => {
                let mut table = Vec::new();
                table.extend(s.methods.iter());
                table.extend(s.static_methods.iter());
                table.extend(s.default_fields.iter());
                Children::Mixed(vec![s.name], table)
            }
            Obj::Instance(i) => Children::Mixed(vec![i.struct_ref], i.fields.iter().collect()),
            Obj::BoundMethod(b) => {
                let mut refs = vec![b.method];
                if let Value::Obj(r) = b.receiver {
                    refs.push(r);
                }
                Children::Refs(refs)
            }
            Obj::Enum(e) => Children::Mixed(vec![e.name], e.values.iter().collect()),
        };

        match children {
            Children::None => {}
            Children::Values(values) => {
                for v in values {
                    self.mark_value(v, gray);
                }
            }
            Children::Refs(refs) => {
                for child in refs {
                    self.mark_object(child, gray);
                }
            }
            Children::Mixed(refs, entries) => {
                for child in refs {
                    self.mark_object(child, gray);
                }
                for (k, v) in entries {
                    self.mark_object(k, gray);
                    self.mark_value(v, gray);
                }
            }
        }
    }

    pub fn process_gray_stack(&mut self, gray: &mut Vec<ObjRef>) {
        while let Some(r) = gray.pop() {
            self.blacken(r, gray);
        }
    }

    /// Drops interned-string entries whose backing object didn't survive
    /// marking. Must run after marking roots/gray-stack processing but
    /// before sweep, per the weak-table contract in the design notes.
    pub fn prune_dead_strings(&mut self) {
        self.strings.retain(|_, r| {
            self.entries[r.0 as usize]
                .as_ref()
                .map(|e| e.marked)
                .unwrap_or(false)
        });
    }

    pub fn sweep(&mut self) {
        for (index, slot) in self.entries.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => {
                    entry.marked = false;
                }
                Some(entry) => {
                    self.bytes_allocated -= entry.size;
                    *slot = None;
                    self.free_list.push(index as u32);
                }
                None => {}
            }
        }
    }

    pub fn finish_collection(&mut self) {
        self.next_gc = self.bytes_allocated * GROW_FACTOR;
        if self.next_gc < DEFAULT_NEXT_GC {
            self.next_gc = DEFAULT_NEXT_GC;
        }
    }
}
