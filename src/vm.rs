// File: src/vm.rs
//
// The stack VM: a frame-stack interpreter loop over `OpCode`s, sharing the
// `Heap` with the compiler. Owns the operand stack, the call-frame stack,
// the open-upvalue list, the globals table, and the array-methods table —
// everything the garbage collector must root. `Engine` is the single
// entry point an embedder drives: `interpret` compiles and runs a whole
// program; the push/pop/arg accessors below are what native functions and
// the host use to exchange values with the VM.

use crate::bytecode::{ConstIdx, FunctionChunk, OpCode};
use crate::compiler;
use crate::errors::{print_compile_error, print_runtime_error, InterpretResult, TraceLine};
use crate::heap::Heap;
use crate::value::{
    BoundMethodObj, ClosureObj, EnumObj, InstanceObj, NativeFn, NativeObj, Obj, ObjRef, StructObj,
    Table, UpvalueObj, UpvalueState, Value,
};

/// Operand stack depth never exceeds this (compile-time constant per spec).
const STACK_MAX: usize = 4096;
/// Call frames never exceed this many nested invocations.
const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots_base: usize,
}

/// One entry of the table an embedder passes to `Engine::register_natives`.
#[derive(Clone, Copy)]
pub struct NativeFnDef {
    pub name: &'static str,
    pub func: NativeFn,
    /// -1 means variadic.
    pub arity: i32,
}

/// The engine: heap, stack, frames, and the handful of root tables the
/// collector walks. Not reentrant — exactly one instruction executes at a
/// time, and no object may be shared between two `Engine`s.
pub struct Engine {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    array_methods: Table,
    /// Set while a native function is executing, so `slot`/`arg` resolve
    /// frame-relative indices against the native's call slots instead of
    /// the (unchanged) enclosing bytecode frame.
    native_base: Option<usize>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

enum Control {
    Continue,
    Returned,
    Error,
}

impl Engine {
    pub fn new() -> Self {
        let mut engine = Engine {
            heap: Heap::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            array_methods: Table::new(),
            native_base: None,
        };
        crate::builtins::install(&mut engine);
        engine
    }

    // ---- allocation, rooted against the main loop's GC checkpoint ----------

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.heap.alloc(obj)
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.heap.intern(s)
    }

    /// Runs a full mark-sweep collection if allocation has crossed the
    /// threshold. Only called between fully-completed instructions (see
    /// `run`), so every object allocated by the previous instruction is
    /// already reachable from the stack, a frame, or the open-upvalue list
    /// by the time this runs.
    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let mut gray = Vec::new();
        for &v in &self.stack {
            self.heap.mark_value(v, &mut gray);
        }
        for frame in &self.frames {
            self.heap.mark_value(Value::Obj(frame.closure), &mut gray);
        }
        for &r in &self.open_upvalues {
            self.heap.mark_value(Value::Obj(r), &mut gray);
        }
        for (k, v) in self.globals.iter() {
            self.heap.mark_value(Value::Obj(k), &mut gray);
            self.heap.mark_value(v, &mut gray);
        }
        for (k, v) in self.array_methods.iter() {
            self.heap.mark_value(Value::Obj(k), &mut gray);
            self.heap.mark_value(v, &mut gray);
        }
        self.heap.process_gray_stack(&mut gray);
        self.heap.prune_dead_strings();
        self.heap.sweep();
        self.heap.finish_collection();
    }

    // ---- embedding API -------------------------------------------------------

    pub fn push_nil(&mut self) {
        self.stack.push(Value::Nil);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.stack.push(Value::Bool(b));
    }

    pub fn push_number(&mut self, n: f64) {
        self.stack.push(Value::Number(n));
    }

    /// Interns `s` and pushes it. The C API distinguishes owned vs.
    /// borrowed strings only to avoid a copy on the caller's side; since
    /// interning always copies into the heap's own table, one method
    /// covers both.
    pub fn push_string(&mut self, s: &str) {
        let r = self.intern(s);
        self.stack.push(Value::Obj(r));
    }

    pub fn push_native(&mut self, func: NativeFn, name: &str, arity: i32) {
        let name_ref = self.intern(name);
        let r = self.alloc(Obj::Native(NativeObj { func, arity, name: name_ref }));
        self.stack.push(Value::Obj(r));
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop on empty stack")
    }

    /// Installs a whole table of native globals in one call.
    pub fn register_natives(&mut self, defs: &[NativeFnDef]) {
        for def in defs {
            self.push_native(def.func, def.name, def.arity);
            let value = self.pop();
            let name_ref = self.intern(def.name);
            let hash = self.heap.string_hash(name_ref);
            self.globals.set(name_ref, hash, value);
        }
    }

    fn current_base(&self) -> usize {
        self.native_base.unwrap_or_else(|| self.frames.last().map(|f| f.slots_base).unwrap_or(0))
    }

    /// Frame-relative (`index >= 0`, 0 = callee/receiver slot) or
    /// top-relative (`index < 0`, -1 = top of stack) slot access. Returns
    /// `None` past either end of the stack rather than panicking, mirroring
    /// `getValueAt`'s NULL-on-out-of-range behavior in the original host API.
    pub fn slot(&self, index: i32) -> Option<Value> {
        let base = self.current_base() as i64;
        let resolved = if index >= 0 { base + index as i64 } else { self.stack.len() as i64 + index as i64 };
        if resolved < 0 {
            return None;
        }
        self.stack.get(resolved as usize).copied()
    }

    /// Convenience for native functions: the `i`-th call argument (0-based).
    /// The VM checks arity before dispatching to a native, so this index is
    /// always in range in practice.
    pub fn arg(&self, i: usize) -> Value {
        self.slot(i as i32 + 1).expect("native called with fewer arguments than its declared arity")
    }

    // ---- display / coercion ---------------------------------------------------

    fn format_number(n: f64) -> String {
        if n.is_nan() {
            "NaN".to_string()
        } else if n.is_infinite() {
            if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
        } else {
            format!("{n}")
        }
    }

    /// Coerces any value to its display string: numbers via shortest
    /// round-trip formatting, `true`/`false`, `nil`, `[ v1, v2, ... ]` for
    /// arrays, `<struct Name>` for instances, and so on for every other
    /// heap kind.
    pub fn to_display_string(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
            Value::Number(n) => Self::format_number(n),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String(s) => s.chars.to_string(),
                Obj::Array(items) => {
                    let parts: Vec<String> =
                        items.iter().map(|v| self.to_display_string(*v)).collect();
                    if parts.is_empty() {
                        "[]".to_string()
                    } else {
                        format!("[ {} ]", parts.join(", "))
                    }
                }
                Obj::Function(f) => match &f.name {
                    Some(name) => format!("<fn {name}>"),
                    None => "<script>".to_string(),
                },
                Obj::Closure(c) => self.to_display_string(Value::Obj(c.function)),
                Obj::Upvalue(_) => "<upvalue>".to_string(),
                Obj::Native(n) => format!("<native fn {}>", self.heap.as_string(n.name).chars),
                Obj::Struct(s) => format!("<struct {}>", self.heap.as_string(s.name).chars),
                Obj::Instance(i) => {
                    let name = match self.heap.get(i.struct_ref) {
                        Obj::Struct(s) => self.heap.as_string(s.name).chars.to_string(),
                        _ => unreachable!("instance struct_ref always points to a Struct"),
                    };
                    format!("<struct {name}>")
                }
                Obj::BoundMethod(b) => self.to_display_string(Value::Obj(b.method)),
                Obj::Enum(e) => format!("<enum {}>", self.heap.as_string(e.name).chars),
            },
        }
    }

    /// Identity/content equality per the data-model rule: tags and
    /// payloads must match; interned strings (and every other heap
    /// object) compare by `ObjRef` identity.
    fn values_equal(a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => x == y,
            _ => false,
        }
    }

    // ---- array embedding helpers (array-methods table, see `core.c`'s
    // `H->arrayMethods`) -------------------------------------------------------

    pub fn array_len(&self, v: Value) -> Option<usize> {
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Array(items) => Some(items.len()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn array_push(&mut self, v: Value, item: Value) -> bool {
        match v {
            Value::Obj(r) => match self.heap.get_mut(r) {
                Obj::Array(items) => {
                    items.push(item);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    pub fn array_pop(&mut self, v: Value) -> Option<Value> {
        match v {
            Value::Obj(r) => match self.heap.get_mut(r) {
                Obj::Array(items) => items.pop(),
                _ => None,
            },
            _ => None,
        }
    }

    // ---- top-level entry point -------------------------------------------------

    /// Compiles and runs `source`. Engine integrity is preserved across
    /// both error paths: a later call can still succeed on valid input.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let chunk = match compiler::compile(source, &mut self.heap) {
            Ok(chunk) => chunk,
            Err(errors) => {
                for err in &errors {
                    print_compile_error(err);
                }
                return InterpretResult::CompileError;
            }
        };

        let func_ref = self.alloc(Obj::Function(chunk));
        let closure_ref = self.alloc(Obj::Closure(ClosureObj { function: func_ref, upvalues: Vec::new() }));
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots_base: 0 });

        self.run()
    }

    fn chunk_of(&self, closure_ref: ObjRef) -> &FunctionChunk {
        match self.heap.get(closure_ref) {
            Obj::Closure(c) => match self.heap.get(c.function) {
                Obj::Function(f) => f,
                _ => unreachable!("closure.function always points to a Function"),
            },
            _ => unreachable!("frame.closure always points to a Closure"),
        }
    }

    fn read_string_const(&self, const_idx: ConstIdx) -> ObjRef {
        let frame = self.frames.last().unwrap();
        let chunk = self.chunk_of(frame.closure);
        match chunk.constants[const_idx as usize] {
            Value::Obj(r) => r,
            _ => unreachable!("identifier constants are always interned strings"),
        }
    }

    fn string_hash_of(&self, r: ObjRef) -> u64 {
        self.heap.string_hash(r)
    }

    // ---- runtime errors --------------------------------------------------------

    fn runtime_error(&mut self, message: &str) -> Control {
        let mut trace = Vec::new();
        for frame in &self.frames {
            let chunk = self.chunk_of(frame.closure);
            let line = chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
            trace.push(TraceLine { line, function_name: chunk.name.clone() });
        }
        print_runtime_error(&trace, message);
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        Control::Error
    }

    fn push_checked(&mut self, value: Value) -> Result<(), Control> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    // ---- calls --------------------------------------------------------------

    fn call_closure(&mut self, closure_ref: ObjRef, argc: usize) -> Result<(), Control> {
        let arity = self.chunk_of(closure_ref).arity as usize;
        if arity != argc {
            return Err(self.runtime_error(&format!(
                "Expected {arity} arguments, but got {argc}."
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots_base });
        Ok(())
    }

    fn call_native(&mut self, native: NativeObj, slot0: usize, argc: usize) -> Result<(), Control> {
        if native.arity >= 0 && native.arity as usize != argc {
            return Err(self.runtime_error(&format!(
                "Expected {} arguments, but got {}.",
                native.arity, argc
            )));
        }
        let previous_base = self.native_base.replace(slot0);
        (native.func)(self, argc);
        self.native_base = previous_base;
        let result = self.stack.pop().expect("native function must push exactly one value");
        self.stack.truncate(slot0);
        self.stack.push(result);
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), Control> {
        match callee {
            Value::Obj(r) => {
                let slot0 = self.stack.len() - argc - 1;
                match self.heap.get(r) {
                    Obj::Closure(_) => self.call_closure(r, argc),
                    Obj::BoundMethod(b) => {
                        let (receiver, method) = (b.receiver, b.method);
                        self.stack[slot0] = receiver;
                        self.call_closure(method, argc)
                    }
                    Obj::Native(n) => {
                        let native = *n;
                        self.call_native(native, slot0, argc)
                    }
                    _ => Err(self.runtime_error("Can only call functions.")),
                }
            }
            _ => Err(self.runtime_error("Can only call functions.")),
        }
    }

    fn bind_method(&mut self, struct_ref: ObjRef, name_ref: ObjRef, receiver: Value) -> Option<Value> {
        let hash = self.string_hash_of(name_ref);
        let method = match self.heap.get(struct_ref) {
            Obj::Struct(s) => s.methods.get(name_ref, hash)?,
            _ => unreachable!("struct_ref always points to a Struct"),
        };
        let method_ref = method.as_obj().expect("methods table stores closures");
        let r = self.alloc(Obj::BoundMethod(BoundMethodObj { receiver, method: method_ref }));
        Some(Value::Obj(r))
    }

    fn invoke_from_struct(
        &mut self,
        struct_ref: ObjRef,
        name_ref: ObjRef,
        argc: usize,
    ) -> Result<(), Control> {
        let hash = self.string_hash_of(name_ref);
        let method = match self.heap.get(struct_ref) {
            Obj::Struct(s) => s.methods.get(name_ref, hash),
            _ => unreachable!("struct_ref always points to a Struct"),
        };
        match method {
            Some(Value::Obj(closure_ref)) => self.call_closure(closure_ref, argc),
            _ => Err(self.runtime_error(&format!(
                "Undefined property '{}'.",
                self.heap.as_string(name_ref).chars
            ))),
        }
    }

    fn invoke(&mut self, const_idx: ConstIdx, argc: u8) -> Result<(), Control> {
        let argc = argc as usize;
        let name_ref = self.read_string_const(const_idx);
        let slot0 = self.stack.len() - argc - 1;
        let receiver = self.stack[slot0];
        match receiver {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(inst) => {
                    let struct_ref = inst.struct_ref;
                    let hash = self.string_hash_of(name_ref);
                    if let Some(field_value) = inst.fields.get(name_ref, hash) {
                        self.stack[slot0] = field_value;
                        self.call_value(field_value, argc)
                    } else {
                        self.invoke_from_struct(struct_ref, name_ref, argc)
                    }
                }
                Obj::Array(_) => {
                    let hash = self.string_hash_of(name_ref);
                    match self.array_methods.get(name_ref, hash) {
                        Some(method) => self.call_value(method, argc),
                        None => Err(self.runtime_error(&format!(
                            "Undefined array method '{}'.",
                            self.heap.as_string(name_ref).chars
                        ))),
                    }
                }
                _ => Err(self.runtime_error("Only instances and arrays have methods to invoke.")),
            },
            _ => Err(self.runtime_error("Only instances and arrays have methods to invoke.")),
        }
    }

    // ---- upvalues --------------------------------------------------------------

    fn upvalue_stack_index(&self, r: ObjRef) -> usize {
        match self.heap.get(r) {
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Open(i) => i,
                UpvalueState::Closed(_) => unreachable!("open_upvalues holds only open upvalues"),
            },
            _ => unreachable!("open_upvalues entries always point to Upvalue objects"),
        }
    }

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        if let Some(&existing) =
            self.open_upvalues.iter().find(|&&r| self.upvalue_stack_index(r) == stack_index)
        {
            return existing;
        }
        let r = self.alloc(Obj::Upvalue(UpvalueObj { state: UpvalueState::Open(stack_index) }));
        let pos = self
            .open_upvalues
            .iter()
            .position(|&o| self.upvalue_stack_index(o) < stack_index)
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, r);
        r
    }

    /// Closes every open upvalue whose captured slot is at or above
    /// `from`, copying the stack value into the upvalue's own storage.
    fn close_upvalues_from(&mut self, from: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let idx = self.upvalue_stack_index(r);
            if idx < from {
                break;
            }
            self.open_upvalues.remove(0);
            let value = self.stack[idx];
            if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                u.state = UpvalueState::Closed(value);
            }
        }
    }

    // ---- main loop --------------------------------------------------------------

    fn run(&mut self) -> InterpretResult {
        loop {
            self.collect_if_needed();
            match self.step() {
                Control::Continue => continue,
                Control::Returned => return InterpretResult::Ok,
                Control::Error => return InterpretResult::RuntimeError,
            }
        }
    }

    fn step(&mut self) -> Control {
        let closure_ref = self.frames.last().unwrap().closure;
        let ip = self.frames.last().unwrap().ip;
        let op = self.chunk_of(closure_ref).code[ip].clone();
        self.frames.last_mut().unwrap().ip = ip + 1;

        macro_rules! try_ctl {
            ($e:expr) => {
                match $e {
                    Ok(()) => {}
                    Err(c) => return c,
                }
            };
        }

        match op {
            OpCode::Constant(idx) => {
                let chunk = self.chunk_of(self.frames.last().unwrap().closure);
                let v = chunk.constants[idx as usize];
                try_ctl!(self.push_checked(v));
            }
            OpCode::Nil => try_ctl!(self.push_checked(Value::Nil)),
            OpCode::True => try_ctl!(self.push_checked(Value::Bool(true))),
            OpCode::False => try_ctl!(self.push_checked(Value::Bool(false))),
            OpCode::Pop => {
                self.stack.pop();
            }
            OpCode::Array(count) => {
                let count = count as usize;
                let start = self.stack.len() - count;
                let items: Vec<Value> = self.stack.drain(start..).collect();
                let r = self.alloc(Obj::Array(items));
                try_ctl!(self.push_checked(Value::Obj(r)));
            }
            OpCode::GetSubscript => {
                let index = self.stack.pop().unwrap();
                let receiver = self.stack.pop().unwrap();
                match self.array_get(receiver, index) {
                    Ok(v) => try_ctl!(self.push_checked(v)),
                    Err(msg) => return self.runtime_error(&msg),
                }
            }
            OpCode::SetSubscript => {
                let value = self.stack.pop().unwrap();
                let index = self.stack.pop().unwrap();
                let receiver = self.stack.pop().unwrap();
                match self.array_set(receiver, index, value) {
                    Ok(()) => try_ctl!(self.push_checked(value)),
                    Err(msg) => return self.runtime_error(&msg),
                }
            }
            OpCode::GetGlobal(idx) => {
                let name_ref = self.read_string_const(idx);
                let hash = self.string_hash_of(name_ref);
                match self.globals.get(name_ref, hash) {
                    Some(v) => try_ctl!(self.push_checked(v)),
                    None => {
                        return self.runtime_error(&format!(
                            "Undefined variable '{}'.",
                            self.heap.as_string(name_ref).chars
                        ))
                    }
                }
            }
            OpCode::SetGlobal(idx) => {
                let name_ref = self.read_string_const(idx);
                let hash = self.string_hash_of(name_ref);
                let value = *self.stack.last().unwrap();
                if self.globals.set(name_ref, hash, value) {
                    self.globals.delete(name_ref, hash);
                    return self.runtime_error(&format!(
                        "Undefined variable '{}'.",
                        self.heap.as_string(name_ref).chars
                    ));
                }
            }
            OpCode::DefineGlobal(idx) => {
                let name_ref = self.read_string_const(idx);
                let hash = self.string_hash_of(name_ref);
                let value = self.stack.pop().unwrap();
                if !self.globals.set(name_ref, hash, value) {
                    return self.runtime_error(&format!(
                        "Redefinition of '{}'.",
                        self.heap.as_string(name_ref).chars
                    ));
                }
            }
            OpCode::GetUpvalue(slot) => {
                let frame = self.frames.last().unwrap();
                let up_ref = match self.heap.get(frame.closure) {
                    Obj::Closure(c) => c.upvalues[slot as usize],
                    _ => unreachable!(),
                };
                let value = match self.heap.get(up_ref) {
                    Obj::Upvalue(u) => match u.state {
                        UpvalueState::Open(i) => self.stack[i],
                        UpvalueState::Closed(v) => v,
                    },
                    _ => unreachable!(),
                };
                try_ctl!(self.push_checked(value));
            }
            OpCode::SetUpvalue(slot) => {
                let frame = self.frames.last().unwrap();
                let up_ref = match self.heap.get(frame.closure) {
                    Obj::Closure(c) => c.upvalues[slot as usize],
                    _ => unreachable!(),
                };
                let value = *self.stack.last().unwrap();
                let open_index = match self.heap.get(up_ref) {
                    Obj::Upvalue(u) => match u.state {
                        UpvalueState::Open(i) => Some(i),
                        UpvalueState::Closed(_) => None,
                    },
                    _ => unreachable!(),
                };
                match open_index {
                    Some(i) => self.stack[i] = value,
                    None => {
                        if let Obj::Upvalue(u) = self.heap.get_mut(up_ref) {
                            u.state = UpvalueState::Closed(value);
                        }
                    }
                }
            }
            OpCode::GetLocal(slot) => {
                let base = self.frames.last().unwrap().slots_base;
                let value = self.stack[base + slot as usize];
                try_ctl!(self.push_checked(value));
            }
            OpCode::SetLocal(slot) => {
                let base = self.frames.last().unwrap().slots_base;
                let value = *self.stack.last().unwrap();
                self.stack[base + slot as usize] = value;
            }
            OpCode::InitProperty(idx) => {
                let name_ref = self.read_string_const(idx);
                let value = self.stack.pop().unwrap();
                let instance_ref = match self.stack.last().unwrap() {
                    Value::Obj(r) => *r,
                    _ => return self.runtime_error("INIT_PROPERTY target must be an instance."),
                };
                let struct_ref = match self.heap.get(instance_ref) {
                    Obj::Instance(i) => i.struct_ref,
                    _ => return self.runtime_error("INIT_PROPERTY target must be an instance."),
                };
                let hash = self.string_hash_of(name_ref);
                let declared = match self.heap.get(struct_ref) {
                    Obj::Struct(s) => s.default_fields.contains(name_ref, hash),
                    _ => false,
                };
                if !declared {
                    return self
                        .runtime_error("Cannot create new properties on instances at runtime.");
                }
                if let Obj::Instance(i) = self.heap.get_mut(instance_ref) {
                    i.fields.set(name_ref, hash, value);
                }
            }
            OpCode::GetStatic(idx) => {
                let name_ref = self.read_string_const(idx);
                let receiver = self.stack.pop().unwrap();
                match self.static_access(receiver, name_ref) {
                    Ok(v) => try_ctl!(self.push_checked(v)),
                    Err(msg) => return self.runtime_error(&msg),
                }
            }
            OpCode::GetProperty(idx) => {
                let name_ref = self.read_string_const(idx);
                let receiver = self.stack.pop().unwrap();
                match self.get_property(receiver, name_ref) {
                    Ok(v) => try_ctl!(self.push_checked(v)),
                    Err(msg) => return self.runtime_error(&msg),
                }
            }
            OpCode::PushProperty(idx) => {
                let name_ref = self.read_string_const(idx);
                let receiver = *self.stack.last().unwrap();
                match self.get_property(receiver, name_ref) {
                    Ok(v) => try_ctl!(self.push_checked(v)),
                    Err(msg) => return self.runtime_error(&msg),
                }
            }
            OpCode::SetProperty(idx) => {
                let name_ref = self.read_string_const(idx);
                let value = self.stack.pop().unwrap();
                let receiver = self.stack.pop().unwrap();
                match self.set_property(receiver, name_ref, value) {
                    Ok(()) => try_ctl!(self.push_checked(value)),
                    Err(msg) => return self.runtime_error(&msg),
                }
            }
            OpCode::DestructArray(index) => {
                let top = *self.stack.last().unwrap();
                match top {
                    Value::Obj(r) => {
                        let item = match self.heap.get(r) {
                            Obj::Array(items) => items.get(index as usize).copied(),
                            _ => return self.runtime_error("Can only destructure arrays."),
                        };
                        match item {
                            Some(v) => try_ctl!(self.push_checked(v)),
                            None => {
                                return self.runtime_error(&format!(
                                    "Destructuring index {index} out of bounds."
                                ))
                            }
                        }
                    }
                    _ => return self.runtime_error("Can only destructure arrays."),
                }
            }
            OpCode::Equal => {
                let b = self.stack.pop().unwrap();
                let a = self.stack.pop().unwrap();
                try_ctl!(self.push_checked(Value::Bool(Self::values_equal(a, b))));
            }
            OpCode::NotEqual => {
                let b = self.stack.pop().unwrap();
                let a = self.stack.pop().unwrap();
                try_ctl!(self.push_checked(Value::Bool(!Self::values_equal(a, b))));
            }
            OpCode::Concat => {
                let b = self.stack.pop().unwrap();
                let a = self.stack.pop().unwrap();
                match (self.as_str(a), self.as_str(b)) {
                    (Some(sa), Some(sb)) => {
                        let joined = format!("{sa}{sb}");
                        let r = self.intern(&joined);
                        try_ctl!(self.push_checked(Value::Obj(r)));
                    }
                    _ => return self.runtime_error("Operands must be two strings."),
                }
            }
            OpCode::Greater | OpCode::GreaterEqual | OpCode::Lesser | OpCode::LesserEqual => {
                let b = self.stack.pop().unwrap();
                let a = self.stack.pop().unwrap();
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => {
                        let result = match op {
                            OpCode::Greater => x > y,
                            OpCode::GreaterEqual => x >= y,
                            OpCode::Lesser => x < y,
                            OpCode::LesserEqual => x <= y,
                            _ => unreachable!(),
                        };
                        try_ctl!(self.push_checked(Value::Bool(result)));
                    }
                    _ => return self.runtime_error("Operands must be numbers."),
                }
            }
            OpCode::Add | OpCode::Subtract | OpCode::Multiply | OpCode::Divide => {
                let b = self.stack.pop().unwrap();
                let a = self.stack.pop().unwrap();
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => {
                        let result = match op {
                            OpCode::Add => x + y,
                            OpCode::Subtract => x - y,
                            OpCode::Multiply => x * y,
                            OpCode::Divide => x / y,
                            _ => unreachable!(),
                        };
                        try_ctl!(self.push_checked(Value::Number(result)));
                    }
                    _ => return self.runtime_error("Operands must be numbers."),
                }
            }
            OpCode::Modulo | OpCode::Pow => {
                let b = self.stack.pop().unwrap();
                let a = self.stack.pop().unwrap();
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => {
                        let result =
                            if matches!(op, OpCode::Modulo) { x % y } else { x.powf(y) };
                        try_ctl!(self.push_checked(Value::Number(result)));
                    }
                    _ => return self.runtime_error("Operands must be numbers."),
                }
            }
            OpCode::Negate => {
                let a = self.stack.pop().unwrap();
                match a.as_number() {
                    Some(n) => try_ctl!(self.push_checked(Value::Number(-n))),
                    None => return self.runtime_error("Operand must be a number."),
                }
            }
            OpCode::Not => {
                let a = self.stack.pop().unwrap();
                try_ctl!(self.push_checked(Value::Bool(a.is_falsey())));
            }
            OpCode::Jump(offset) => {
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            OpCode::JumpIfFalse(offset) => {
                if self.stack.last().unwrap().is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            OpCode::InequalityJump(offset) => {
                let b = self.stack.pop().unwrap();
                let a = *self.stack.last().unwrap();
                if !Self::values_equal(a, b) {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            OpCode::Loop(offset) => {
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }
            OpCode::Call(argc) => {
                let argc = argc as usize;
                let callee = self.stack[self.stack.len() - 1 - argc];
                try_ctl!(self.call_value(callee, argc));
            }
            OpCode::Instance => {
                let struct_value = self.stack.pop().unwrap();
                match struct_value {
                    Value::Obj(struct_ref) => {
                        let default_fields = match self.heap.get(struct_ref) {
                            Obj::Struct(s) => s.default_fields.clone(),
                            _ => return self.runtime_error("Can only instantiate structs."),
                        };
                        let r = self
                            .alloc(Obj::Instance(InstanceObj { struct_ref, fields: default_fields }));
                        try_ctl!(self.push_checked(Value::Obj(r)));
                    }
                    _ => return self.runtime_error("Can only instantiate structs."),
                }
            }
            OpCode::Closure(const_idx, descs) => {
                let frame_base = self.frames.last().unwrap().slots_base;
                let current_closure = self.frames.last().unwrap().closure;
                let chunk = self.chunk_of(current_closure);
                let func_ref = match chunk.constants[const_idx as usize] {
                    Value::Obj(r) => r,
                    _ => unreachable!("CLOSURE constant is always a function"),
                };
                let mut upvalues = Vec::with_capacity(descs.len());
                for desc in &descs {
                    if desc.is_local {
                        upvalues.push(self.capture_upvalue(frame_base + desc.index as usize));
                    } else {
                        let parent_upvalues = match self.heap.get(current_closure) {
                            Obj::Closure(c) => &c.upvalues,
                            _ => unreachable!(),
                        };
                        upvalues.push(parent_upvalues[desc.index as usize]);
                    }
                }
                let r = self.alloc(Obj::Closure(ClosureObj { function: func_ref, upvalues }));
                try_ctl!(self.push_checked(Value::Obj(r)));
            }
            OpCode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues_from(top);
                self.stack.pop();
            }
            OpCode::Return => {
                let result = self.stack.pop().unwrap();
                let frame_base = self.frames.last().unwrap().slots_base;
                self.close_upvalues_from(frame_base);
                self.frames.pop();
                self.stack.truncate(frame_base);
                if self.frames.is_empty() {
                    return Control::Returned;
                }
                self.stack.push(result);
            }
            OpCode::Enum(idx) => {
                let name_ref = self.read_string_const(idx);
                let r = self.alloc(Obj::Enum(EnumObj { name: name_ref, values: Table::new() }));
                try_ctl!(self.push_checked(Value::Obj(r)));
            }
            OpCode::EnumValue(idx, ordinal) => {
                let name_ref = self.read_string_const(idx);
                let hash = self.string_hash_of(name_ref);
                let enum_ref = match self.stack.last().unwrap() {
                    Value::Obj(r) => *r,
                    _ => unreachable!("ENUM_VALUE always follows ENUM"),
                };
                if let Obj::Enum(e) = self.heap.get_mut(enum_ref) {
                    e.values.set(name_ref, hash, Value::Number(ordinal as f64));
                }
            }
            OpCode::Struct(idx) => {
                let name_ref = self.read_string_const(idx);
                let r = self.alloc(Obj::Struct(StructObj {
                    name: name_ref,
                    methods: Table::new(),
                    static_methods: Table::new(),
                    default_fields: Table::new(),
                }));
                try_ctl!(self.push_checked(Value::Obj(r)));
            }
            OpCode::Method(idx) => {
                let name_ref = self.read_string_const(idx);
                let hash = self.string_hash_of(name_ref);
                let closure_value = self.stack.pop().unwrap();
                let struct_ref = match self.stack.last().unwrap() {
                    Value::Obj(r) => *r,
                    _ => unreachable!("METHOD always follows a struct value"),
                };
                if let Obj::Struct(s) = self.heap.get_mut(struct_ref) {
                    s.methods.set(name_ref, hash, closure_value);
                }
            }
            OpCode::StaticMethod(idx) => {
                let name_ref = self.read_string_const(idx);
                let hash = self.string_hash_of(name_ref);
                let closure_value = self.stack.pop().unwrap();
                let struct_ref = match self.stack.last().unwrap() {
                    Value::Obj(r) => *r,
                    _ => unreachable!("STATIC_METHOD always follows a struct value"),
                };
                if let Obj::Struct(s) = self.heap.get_mut(struct_ref) {
                    s.static_methods.set(name_ref, hash, closure_value);
                }
            }
            OpCode::Invoke(idx, argc) => {
                try_ctl!(self.invoke(idx, argc));
            }
            OpCode::StructField(idx) => {
                let name_ref = self.read_string_const(idx);
                let hash = self.string_hash_of(name_ref);
                let default_value = self.stack.pop().unwrap();
                let struct_ref = match self.stack.last().unwrap() {
                    Value::Obj(r) => *r,
                    _ => unreachable!("STRUCT_FIELD always follows a struct value"),
                };
                if let Obj::Struct(s) = self.heap.get_mut(struct_ref) {
                    s.default_fields.set(name_ref, hash, default_value);
                }
            }
            OpCode::Break => {
                return self.runtime_error("BREAK opcode must never execute (compiler bug).");
            }
        }
        Control::Continue
    }

    fn as_str(&self, v: Value) -> Option<&str> {
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String(s) => Some(&s.chars),
                _ => None,
            },
            _ => None,
        }
    }

    /// `index < 0 || index >= count` is rejected: the original allows
    /// `index == count` (one past the end) because C simply reads
    /// past-the-count but still-allocated capacity. That's undefined
    /// behavior there and unrepresentable safely here, so this
    /// implementation rejects it strictly rather than replicate it.
    fn array_get(&self, receiver: Value, index: Value) -> Result<Value, String> {
        let idx = index.as_number().ok_or("Can only use subscript operator with numbers.")?;
        let r = match receiver {
            Value::Obj(r) => r,
            _ => return Err("Invalid target for subscript operator.".to_string()),
        };
        match self.heap.get(r) {
            Obj::Array(items) => {
                let idx = idx as i64;
                if idx < 0 || idx as usize >= items.len() {
                    return Err(format!(
                        "Index out of bounds. Array size is {}, but tried accessing {}.",
                        items.len(),
                        idx
                    ));
                }
                Ok(items[idx as usize])
            }
            _ => Err("Invalid target for subscript operator.".to_string()),
        }
    }

    fn array_set(&mut self, receiver: Value, index: Value, value: Value) -> Result<(), String> {
        let idx = index.as_number().ok_or("Can only use subscript operator with numbers.")?;
        let r = match receiver {
            Value::Obj(r) => r,
            _ => return Err("Invalid target for subscript operator.".to_string()),
        };
        match self.heap.get_mut(r) {
            Obj::Array(items) => {
                let idx = idx as i64;
                if idx < 0 || idx as usize >= items.len() {
                    return Err(format!(
                        "Index out of bounds. Array size is {}, but tried accessing {}.",
                        items.len(),
                        idx
                    ));
                }
                items[idx as usize] = value;
                Ok(())
            }
            _ => Err("Invalid target for subscript operator.".to_string()),
        }
    }

    fn static_access(&mut self, receiver: Value, name_ref: ObjRef) -> Result<Value, String> {
        let hash = self.string_hash_of(name_ref);
        match receiver {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Struct(s) => s.static_methods.get(name_ref, hash).ok_or_else(|| {
                    format!("Undefined static method '{}'.", self.heap.as_string(name_ref).chars)
                }),
                Obj::Enum(e) => e.values.get(name_ref, hash).ok_or_else(|| {
                    format!("Undefined enum value '{}'.", self.heap.as_string(name_ref).chars)
                }),
                _ => Err("Only structs and enums support '::' access.".to_string()),
            },
            _ => Err("Only structs and enums support '::' access.".to_string()),
        }
    }

    fn get_property(&mut self, receiver: Value, name_ref: ObjRef) -> Result<Value, String> {
        let hash = self.string_hash_of(name_ref);
        let r = match receiver {
            Value::Obj(r) => r,
            _ => return Err("Only instances have properties.".to_string()),
        };
        let (struct_ref, field) = match self.heap.get(r) {
            Obj::Instance(i) => (i.struct_ref, i.fields.get(name_ref, hash)),
            _ => return Err("Only instances have properties.".to_string()),
        };
        if let Some(value) = field {
            return Ok(value);
        }
        self.bind_method(struct_ref, name_ref, receiver).ok_or_else(|| {
            format!("Undefined property '{}'.", self.heap.as_string(name_ref).chars)
        })
    }

    fn set_property(&mut self, receiver: Value, name_ref: ObjRef, value: Value) -> Result<(), String> {
        let hash = self.string_hash_of(name_ref);
        let r = match receiver {
            Value::Obj(r) => r,
            _ => return Err("Only instances have properties.".to_string()),
        };
        match self.heap.get_mut(r) {
            Obj::Instance(i) => {
                if !i.fields.contains(name_ref, hash) {
                    return Err("Cannot create new properties on instances at runtime.".to_string());
                }
                i.fields.set(name_ref, hash, value);
                Ok(())
            }
            _ => Err("Only instances have properties.".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> InterpretResult {
        Engine::new().interpret(source)
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run("print(1 + 2 * 3);"), InterpretResult::Ok);
    }

    #[test]
    fn undefined_variable_is_runtime_error() {
        assert_eq!(run("print(undefined_name);"), InterpretResult::RuntimeError);
    }

    #[test]
    fn compile_error_on_bad_syntax() {
        assert_eq!(run("var = ;"), InterpretResult::CompileError);
    }

    #[test]
    fn redefinition_of_global_is_runtime_error() {
        assert_eq!(run("var x = 1; var x = 2;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn out_of_bounds_array_index_is_runtime_error() {
        assert_eq!(run("var a = [1, 2, 3]; print(a[5]);"), InterpretResult::RuntimeError);
    }

    #[test]
    fn array_index_equal_to_length_is_rejected() {
        assert_eq!(run("var a = [1, 2, 3]; print(a[3]);"), InterpretResult::RuntimeError);
    }

    #[test]
    fn struct_field_assignment_of_undeclared_name_errors() {
        assert_eq!(
            run("struct P { x = 0; } var p = P { x = 1 }; p.y = 2;"),
            InterpretResult::RuntimeError
        );
    }

    #[test]
    fn closures_share_captured_state_after_enclosing_call_returns() {
        assert_eq!(
            run(
                "func mk(n) { var c = 0; return func() { c = c + n; return c; }; } \
                 var f = mk(10); var a = f(); var b = f(); if (a != 10 || b != 20) { \
                 print(\"bad\"); }"
            ),
            InterpretResult::Ok
        );
    }

    #[test]
    fn engine_recovers_after_runtime_error() {
        let mut engine = Engine::new();
        assert_eq!(engine.interpret("print(nope);"), InterpretResult::RuntimeError);
        assert_eq!(engine.interpret("print(1);"), InterpretResult::Ok);
    }
}
