// File: src/value.rs
//
// The tagged `Value` union, heap object kinds, and the open-addressed
// `Table` used for globals, struct method tables, and instance fields.
//
// Every heap object is owned by the `Heap` arena (see heap.rs) and
// referenced elsewhere only by `ObjRef`, a plain index — there are no
// raw pointers into the heap or the value stack.

use crate::bytecode::FunctionChunk;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// An index into `Heap::entries`. `Copy` so it behaves like a pointer
/// without being one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

/// A dynamically-typed value. Numbers are always `f64`; there is no
/// separate integer type.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

impl Value {
    /// Only `nil` and `false` are falsey; `0` and `""` are truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil) || matches!(self, Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }
}

/// Heap object payloads. The `marked`/bookkeeping fields live alongside
/// these in `heap::HeapEntry`, not here.
#[derive(Debug)]
pub enum Obj {
    String(StringObj),
    Array(Vec<Value>),
    Function(FunctionChunk),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Struct(StructObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Enum(EnumObj),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Array(_) => "array",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Native(_) => "native function",
            Obj::Struct(_) => "struct",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
            Obj::Enum(_) => "enum",
        }
    }

    /// Approximate byte footprint, used to drive the GC threshold.
    pub fn heap_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.chars.len(),
            Obj::Array(v) => v.len() * std::mem::size_of::<Value>(),
            Obj::Function(f) => f.code.len() * 32 + f.constants.len() * 16,
            Obj::Closure(c) => c.upvalues.len() * 4,
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct StringObj {
    pub chars: Box<str>,
    pub hash: u64,
}

impl StringObj {
    pub fn new(chars: impl Into<Box<str>>) -> Self {
        let chars = chars.into();
        let hash = hash_str(&chars);
        StringObj { chars, hash }
    }
}

pub fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still live on the shared value stack, at this absolute index.
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

pub type NativeFn = fn(&mut crate::vm::Engine, arg_count: usize);

#[derive(Debug, Clone, Copy)]
pub struct NativeObj {
    pub func: NativeFn,
    /// Declared arity; -1 means variadic.
    pub arity: i32,
    pub name: ObjRef,
}

#[derive(Debug)]
pub struct StructObj {
    pub name: ObjRef,
    pub methods: Table,
    pub static_methods: Table,
    pub default_fields: Table,
}

#[derive(Debug)]
pub struct InstanceObj {
    pub struct_ref: ObjRef,
    pub fields: Table,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug)]
pub struct EnumObj {
    pub name: ObjRef,
    pub values: Table,
}

/// One slot in a `Table`: live, a tombstone (deleted, probing must
/// continue past it), or empty. Live entries carry their key's hash so
/// the table can rehash itself on grow without a `Heap` lookup.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Live(ObjRef, u64, Value),
}

/// Open-addressed hash table from interned-string keys to `Value`s.
/// Linear probing, tombstone deletion, grows once load exceeds 75%.
#[derive(Debug, Clone)]
pub struct Table {
    slots: Vec<Slot>,
    count: usize, // live entries, not counting tombstones
}

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { slots: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn find_slot(slots: &[Slot], capacity: usize, key: ObjRef, hash: u64) -> usize {
        let mut index = (hash as usize) % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match slots[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Live(k, _, _) if k == key => return index,
                Slot::Live(_, _, _) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_slots = vec![Slot::Empty; new_capacity];
        let old = std::mem::take(&mut self.slots);
        self.count = 0;
        for slot in old {
            if let Slot::Live(key, hash, value) = slot {
                let idx = Self::find_slot(&new_slots, new_capacity, key, hash);
                new_slots[idx] = Slot::Live(key, hash, value);
                self.count += 1;
            }
        }
        self.slots = new_slots;
    }

    /// Returns `true` if this created a new key (mirrors `tableSet`'s
    /// return value, which the VM uses to detect redefinition/undefined
    /// globals).
    pub fn set(&mut self, key: ObjRef, hash: u64, value: Value) -> bool {
        if self.slots.is_empty() {
            self.grow(INITIAL_CAPACITY);
        } else if (self.count + 1) as f64 > self.slots.len() as f64 * MAX_LOAD {
            self.grow(self.slots.len() * 2);
        }

        let capacity = self.slots.len();
        let index = Self::find_slot(&self.slots, capacity, key, hash);
        let is_new = !matches!(self.slots[index], Slot::Live(_, _, _));
        if is_new {
            self.count += 1;
        }
        self.slots[index] = Slot::Live(key, hash, value);
        is_new
    }

    pub fn get(&self, key: ObjRef, hash: u64) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let capacity = self.slots.len();
        match self.slots[Self::find_slot(&self.slots, capacity, key, hash)] {
            Slot::Live(_, _, value) => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: ObjRef, hash: u64) -> bool {
        self.get(key, hash).is_some()
    }

    pub fn delete(&mut self, key: ObjRef, hash: u64) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let capacity = self.slots.len();
        let index = Self::find_slot(&self.slots, capacity, key, hash);
        if matches!(self.slots[index], Slot::Live(_, _, _)) {
            self.slots[index] = Slot::Tombstone;
            self.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Live(k, _, v) => Some((*k, *v)),
            _ => None,
        })
    }
}
