// File: src/vm.rs
//
// Stack-based bytecode virtual machine. Fetches one instruction at a
// time from the current call frame's chunk, dispatches on it, and
// repeats until the outermost frame returns or a runtime error unwinds
// the whole call stack. Values that must survive a GC-triggering
// allocation are kept reachable either by staying on the VM's value
// stack (peeked, not popped, until the allocation completes) or by a
// take/restore dance around the heap-resident table being mutated —
// the same pattern `gc::Heap::intern` uses for its string-intern table.

use crate::chunk::OpCode;
use crate::errors::{PandaError, TraceFrame};
use crate::gc::Heap;
use crate::object::{
    Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative, ObjRef,
    ObjUpvalue, UpvalueLocation,
};
use crate::table::Table;
use crate::value::{print_value, values_equal, Value};

const FRAMES_MAX: usize = 64;

struct Frame {
    closure: ObjRef,
    ip: usize,
    slot_base: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Table,
    /// Sorted descending by stack index; no two entries name the same slot.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
}

/// Classification of a callable value, decided under a single shared
/// borrow of the heap so the caller is free to take `&mut self` next.
enum Callee {
    Closure(ObjRef),
    Native(crate::object::NativeFn),
    Class(ObjRef),
    Bound { receiver: Value, method: ObjRef },
    NotCallable,
}

impl Vm {
    pub fn new(stress_gc: bool, log_gc: bool) -> Self {
        let mut heap = Heap::new();
        heap.stress_gc = stress_gc;
        heap.log_gc = log_gc;
        let init_string = heap.intern(b"init", |_| {});
        heap.pin(init_string);
        let mut vm = Self {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
        };
        START_TIME.get_or_init(std::time::Instant::now);
        vm.define_native("clock", native_clock);
        vm
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), PandaError> {
        let roots = self.snapshot_roots();
        let function_ref = crate::compiler::compile(source, &mut self.heap, roots)
            .map_err(PandaError::Compile)?;
        self.push(Value::Obj(function_ref));
        let closure_ref = self.alloc(Obj::Closure(ObjClosure { function: function_ref, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::Obj(closure_ref));
        self.call_closure(closure_ref, 0)?;
        self.run()
    }

    // ---- GC plumbing --------------------------------------------------

    fn snapshot_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = Vec::with_capacity(self.stack.len() + self.frames.len() + 1);
        roots.extend(self.stack.iter().copied());
        for frame in &self.frames {
            roots.push(Value::Obj(frame.closure));
        }
        for (key, value) in self.globals.iter() {
            roots.push(Value::Obj(key));
            roots.push(value);
        }
        for &u in &self.open_upvalues {
            roots.push(Value::Obj(u));
        }
        roots
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.needs_collect() {
            let roots = self.snapshot_roots();
            for v in roots {
                self.heap.mark_value(v);
            }
            self.heap.collect();
        }
        self.heap.raw_alloc(obj)
    }

    fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        let roots = self.snapshot_roots();
        self.heap.intern(bytes, move |h| {
            for v in roots {
                h.mark_value(v);
            }
        })
    }

    fn define_native(&mut self, name: &str, function: crate::object::NativeFn) {
        let name_ref = self.intern(name.as_bytes());
        self.push(Value::Obj(name_ref));
        let native_ref = self.alloc(Obj::Native(ObjNative { function }));
        self.push(Value::Obj(native_ref));
        self.globals.set(&self.heap, name_ref, Value::Obj(native_ref));
        self.pop();
        self.pop();
    }

    // ---- stack helpers --------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- bytecode fetch ------------------------------------------------

    fn function_of(&self, closure_ref: ObjRef) -> &ObjFunction {
        match self.heap.get(closure_ref) {
            Obj::Closure(c) => match self.heap.get(c.function) {
                Obj::Function(f) => f,
                _ => unreachable!("closure's function slot did not name a function"),
            },
            _ => unreachable!("expected a closure"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let (closure_ref, ip) = {
            let frame = self.frames.last_mut().expect("no active frame");
            let ip = frame.ip;
            frame.ip += 1;
            (frame.closure, ip)
        };
        self.function_of(closure_ref).chunk.code[ip]
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let closure_ref = self.frames.last().unwrap().closure;
        self.function_of(closure_ref).chunk.constants[idx as usize]
    }

    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj().expect("constant was not a string")
    }

    // ---- errors ---------------------------------------------------------

    fn runtime_error(&mut self, message: impl Into<String>) -> PandaError {
        let message = message.into();
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.function_of(frame.closure);
            let line = function.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
            let name = function.name.map(|n| self.heap.get_string(n).to_string());
            trace.push(TraceFrame { name, line });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        PandaError::Runtime { message, trace }
    }

    /// "Undefined variable 'x'." plus a "did you mean 'y'?" nudge toward
    /// the closest currently-defined global, if one is close enough to
    /// plausibly be a typo.
    fn undefined_variable_message(&self, name: ObjRef) -> String {
        let attempted = self.heap.get_string(name);
        let mut best: Option<(&str, usize)> = None;
        for (key, _) in self.globals.iter() {
            let candidate = self.heap.get_string(key);
            let distance = crate::errors::levenshtein_distance(attempted, candidate);
            if best.is_none_or(|(_, best_distance)| distance < best_distance) {
                best = Some((candidate, distance));
            }
        }
        match best {
            Some((candidate, distance)) if distance > 0 && distance <= 2 => {
                format!("Undefined variable '{attempted}'. Did you mean '{candidate}'?")
            }
            _ => format!("Undefined variable '{attempted}'."),
        }
    }

    // ---- heap-resident table plumbing ------------------------------------

    fn class_find_method(&self, class_ref: ObjRef, name: ObjRef) -> Option<Value> {
        match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(&self.heap, name),
            _ => None,
        }
    }

    fn class_define_method(&mut self, class_ref: ObjRef, name: ObjRef, method: Value) {
        let mut methods = match self.heap.get_mut(class_ref) {
            Obj::Class(c) => std::mem::take(&mut c.methods),
            _ => unreachable!(),
        };
        methods.set(&self.heap, name, method);
        if let Obj::Class(c) = self.heap.get_mut(class_ref) {
            c.methods = methods;
        }
    }

    fn class_inherit(&mut self, superclass_ref: ObjRef, subclass_ref: ObjRef) {
        let super_methods = match self.heap.get(superclass_ref) {
            Obj::Class(c) => c.methods.clone(),
            _ => unreachable!(),
        };
        let mut sub_methods = match self.heap.get_mut(subclass_ref) {
            Obj::Class(c) => std::mem::take(&mut c.methods),
            _ => unreachable!(),
        };
        sub_methods.add_all(&self.heap, &super_methods);
        if let Obj::Class(c) = self.heap.get_mut(subclass_ref) {
            c.methods = sub_methods;
        }
    }

    fn instance_set_field(&mut self, instance_ref: ObjRef, name: ObjRef, value: Value) {
        let mut fields = match self.heap.get_mut(instance_ref) {
            Obj::Instance(i) => std::mem::take(&mut i.fields),
            _ => unreachable!(),
        };
        fields.set(&self.heap, name, value);
        if let Obj::Instance(i) = self.heap.get_mut(instance_ref) {
            i.fields = fields;
        }
    }

    // ---- calling ----------------------------------------------------------

    fn classify_callee(&self, r: ObjRef) -> Callee {
        match self.heap.get(r) {
            Obj::Closure(_) => Callee::Closure(r),
            Obj::Native(n) => Callee::Native(n.function),
            Obj::Class(_) => Callee::Class(r),
            Obj::BoundMethod(b) => Callee::Bound { receiver: b.receiver, method: b.method },
            _ => Callee::NotCallable,
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), PandaError> {
        let r = match callee.as_obj() {
            Some(r) => r,
            None => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match self.classify_callee(r) {
            Callee::Closure(closure_ref) => self.call_closure(closure_ref, arg_count),
            Callee::Native(function) => self.call_native(function, arg_count),
            Callee::Class(class_ref) => self.call_class(class_ref, arg_count),
            Callee::Bound { receiver, method } => {
                let start = self.stack.len() - arg_count as usize - 1;
                self.stack[start] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::NotCallable => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_native(&mut self, function: crate::object::NativeFn, arg_count: u8) -> Result<(), PandaError> {
        let start = self.stack.len() - arg_count as usize - 1;
        let args: Vec<Value> = self.stack[start + 1..].to_vec();
        let result = function(&args);
        self.stack.truncate(start);
        self.push(result);
        Ok(())
    }

    fn call_class(&mut self, class_ref: ObjRef, arg_count: u8) -> Result<(), PandaError> {
        let instance = self.alloc(Obj::Instance(ObjInstance::new(class_ref)));
        let start = self.stack.len() - arg_count as usize - 1;
        self.stack[start] = Value::Obj(instance);
        match self.class_find_method(class_ref, self.init_string) {
            Some(init) => {
                let init_ref = init.as_obj().expect("init method was not a closure");
                self.call_closure(init_ref, arg_count)
            }
            None if arg_count != 0 => {
                Err(self.runtime_error(format!("Expected 0 arguments but got {arg_count}.")))
            }
            None => Ok(()),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, arg_count: u8) -> Result<(), PandaError> {
        let arity = self.function_of(closure_ref).arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {arg_count}."
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(Frame { closure: closure_ref, ip: 0, slot_base });
        Ok(())
    }

    fn bind_method(&mut self, class_ref: ObjRef, name: ObjRef) -> Result<(), PandaError> {
        let method = match self.class_find_method(class_ref, name) {
            Some(v) => v,
            None => {
                return Err(
                    self.runtime_error(format!("Undefined property '{}'.", self.heap.get_string(name)))
                )
            }
        };
        let method_ref = method.as_obj().expect("method was not a closure");
        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method: method_ref }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name: ObjRef, arg_count: u8) -> Result<(), PandaError> {
        let method = match self.class_find_method(class_ref, name) {
            Some(v) => v,
            None => {
                return Err(
                    self.runtime_error(format!("Undefined property '{}'.", self.heap.get_string(name)))
                )
            }
        };
        let method_ref = method.as_obj().expect("method was not a closure");
        self.call_closure(method_ref, arg_count)
    }

    fn invoke(&mut self, name: ObjRef, arg_count: u8) -> Result<(), PandaError> {
        let receiver = self.peek(arg_count as usize);
        let instance_ref = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let field = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.fields.get(&self.heap, name),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let start = self.stack.len() - arg_count as usize - 1;
            self.stack[start] = value;
            return self.call_value(value, arg_count);
        }
        let class_ref = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.class,
            _ => unreachable!(),
        };
        self.invoke_from_class(class_ref, name, arg_count)
    }

    // ---- upvalues -----------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let mut insert_pos = self.open_upvalues.len();
        for (i, &existing) in self.open_upvalues.iter().enumerate() {
            let idx = match self.heap.get(existing) {
                Obj::Upvalue(u) => match u.location {
                    UpvalueLocation::Stack(idx) => idx,
                    UpvalueLocation::Closed => unreachable!("open list held a closed upvalue"),
                },
                _ => unreachable!(),
            };
            if idx == stack_index {
                return existing;
            }
            if idx < stack_index {
                insert_pos = i;
                break;
            }
        }
        let upvalue_ref =
            self.alloc(Obj::Upvalue(ObjUpvalue { location: UpvalueLocation::Stack(stack_index), closed: Value::Nil }));
        self.open_upvalues.insert(insert_pos, upvalue_ref);
        upvalue_ref
    }

    fn close_upvalues(&mut self, from_stack_index: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let idx = match self.heap.get(r) {
                Obj::Upvalue(u) => match u.location {
                    UpvalueLocation::Stack(idx) => idx,
                    UpvalueLocation::Closed => break,
                },
                _ => unreachable!(),
            };
            if idx < from_stack_index {
                break;
            }
            let value = self.stack[idx];
            if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                u.location = UpvalueLocation::Closed;
                u.closed = value;
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- arithmetic helpers ------------------------------------------------

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), PandaError> {
        match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn concatenate(&mut self) -> Result<(), PandaError> {
        // Operands stay on the stack (peeked, not popped) across the
        // allocating `intern` call so the GC's stack scan keeps them rooted.
        let b = self.peek(0).as_obj().unwrap();
        let a = self.peek(1).as_obj().unwrap();
        let mut bytes = self.heap.get_string(a).as_bytes().to_vec();
        bytes.extend_from_slice(self.heap.get_string(b).as_bytes());
        let result = self.intern(&bytes);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
        Ok(())
    }

    // ---- the dispatch loop ------------------------------------------------

    fn run(&mut self) -> Result<(), PandaError> {
        loop {
            let instruction = self.read_byte();
            let op = OpCode::try_from(instruction).expect("corrupt bytecode: invalid opcode");
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&self.heap, name) {
                        Some(v) => self.push(v),
                        None => {
                            let message = self.undefined_variable_message(name);
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let v = self.peek(0);
                    self.globals.set(&self.heap, name, v);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let v = self.peek(0);
                    if self.globals.set(&self.heap, name, v) {
                        self.globals.delete(&self.heap, name);
                        let message = self.undefined_variable_message(name);
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure_ref = self.frames.last().unwrap().closure;
                    let upvalue_ref = match self.heap.get(closure_ref) {
                        Obj::Closure(c) => c.upvalues[slot],
                        _ => unreachable!(),
                    };
                    let v = match self.heap.get(upvalue_ref) {
                        Obj::Upvalue(u) => match u.location {
                            UpvalueLocation::Stack(idx) => self.stack[idx],
                            UpvalueLocation::Closed => u.closed,
                        },
                        _ => unreachable!(),
                    };
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure_ref = self.frames.last().unwrap().closure;
                    let upvalue_ref = match self.heap.get(closure_ref) {
                        Obj::Closure(c) => c.upvalues[slot],
                        _ => unreachable!(),
                    };
                    let v = self.peek(0);
                    let location = match self.heap.get(upvalue_ref) {
                        Obj::Upvalue(u) => u.location,
                        _ => unreachable!(),
                    };
                    match location {
                        UpvalueLocation::Stack(idx) => self.stack[idx] = v,
                        UpvalueLocation::Closed => {
                            if let Obj::Upvalue(u) = self.heap.get_mut(upvalue_ref) {
                                u.closed = v;
                            }
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let instance_ref = match receiver.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let field = match self.heap.get(instance_ref) {
                        Obj::Instance(i) => i.fields.get(&self.heap, name),
                        _ => unreachable!(),
                    };
                    if let Some(v) = field {
                        self.pop();
                        self.push(v);
                    } else {
                        let class_ref = match self.heap.get(instance_ref) {
                            Obj::Instance(i) => i.class,
                            _ => unreachable!(),
                        };
                        self.bind_method(class_ref, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    let instance_ref = match receiver.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    self.instance_set_field(instance_ref, name, value);
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass_ref = self.pop().as_obj().expect("superclass slot held a non-class");
                    self.bind_method(superclass_ref, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(a, b)));
                }
                OpCode::Greater => self.binary_numeric(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_numeric(|a, b| Value::Bool(a < b))?,
                OpCode::Add => {
                    let both_strings = matches!(
                        (self.peek(1).as_obj(), self.peek(0).as_obj()),
                        (Some(a), Some(b))
                            if matches!(self.heap.get(a), Obj::String(_))
                                && matches!(self.heap.get(b), Obj::String(_))
                    );
                    if both_strings {
                        self.concatenate()?;
                    } else if self.peek(1).as_number().is_some() && self.peek(0).as_number().is_some() {
                        self.binary_numeric(|a, b| Value::Number(a + b))?;
                    } else {
                        return Err(self.runtime_error("Operands must be two numbers or two strings."));
                    }
                }
                OpCode::Subtract => self.binary_numeric(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_numeric(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_numeric(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    None => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Print => {
                    let v = self.pop();
                    println!("{}", print_value(v, &self.heap));
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    let superclass_ref = self.pop().as_obj().expect("superclass slot held a non-class");
                    self.invoke_from_class(superclass_ref, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function_val = self.read_constant();
                    let function_ref = function_val.as_obj().expect("constant was not a function");
                    let upvalue_count = match self.heap.get(function_ref) {
                        Obj::Function(f) => f.upvalue_count,
                        _ => unreachable!(),
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte();
                        if is_local {
                            let base = self.frames.last().unwrap().slot_base;
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            let up = match self.heap.get(enclosing) {
                                Obj::Closure(c) => c.upvalues[index as usize],
                                _ => unreachable!(),
                            };
                            upvalues.push(up);
                        }
                    }
                    let closure_ref = self.alloc(Obj::Closure(ObjClosure { function: function_ref, upvalues }));
                    self.push(Value::Obj(closure_ref));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no active frame");
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        self.stack.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class_ref = self.alloc(Obj::Class(ObjClass::new(name)));
                    self.push(Value::Obj(class_ref));
                }
                OpCode::Inherit => {
                    let superclass_ref = match self.peek(1).as_obj() {
                        Some(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass_ref = self.peek(0).as_obj().expect("subclass slot held a non-class");
                    self.class_inherit(superclass_ref, subclass_ref);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method_val = self.peek(0);
                    let class_ref = self.peek(1).as_obj().expect("class slot held a non-class");
                    self.class_define_method(class_ref, name, method_val);
                    self.pop();
                }
            }
        }
    }
}

/// Set once, at the first `Vm::new`, so `clock()` reports elapsed seconds
/// since the interpreter started rather than a wall-clock epoch offset —
/// matching `original_source`'s `clockNative`, which returns
/// `clock() / CLOCKS_PER_SEC` (processor time since program start).
static START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

fn native_clock(_args: &[Value]) -> Value {
    let start = START_TIME.get_or_init(std::time::Instant::now);
    Value::Number(start.elapsed().as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> Vm {
        let mut vm = Vm::new(false, false);
        vm.interpret(source).expect("expected successful interpretation");
        vm
    }

    fn global_number(vm: &Vm, name: ObjRef) -> f64 {
        vm.globals.get(&vm.heap, name).and_then(Value::as_number).expect("expected a number")
    }

    #[test]
    fn arithmetic_precedence() {
        let mut vm = Vm::new(false, false);
        vm.interpret("var x = 1 + 2 * 3 - 4 / 2;").unwrap();
        let name = vm.intern(b"x");
        assert_eq!(global_number(&vm, name), 5.0);
    }

    #[test]
    fn string_concatenation() {
        let mut vm = Vm::new(false, false);
        vm.interpret(r#"var s = "foo" + "bar";"#).unwrap();
        let name = vm.intern(b"s");
        let v = vm.globals.get(&vm.heap, name).unwrap();
        assert_eq!(vm.heap.get_string(v.as_obj().unwrap()), "foobar");
    }

    #[test]
    fn closures_capture_upvalues_across_calls() {
        let mut vm = run_ok(
            r#"
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
            var counter = makeCounter();
            var a = counter();
            var b = counter();
            var total = a + b;
            "#,
        );
        let name = vm.intern(b"total");
        assert_eq!(global_number(&vm, name), 3.0);
    }

    #[test]
    fn single_inheritance_method_lookup_and_init() {
        let mut vm = run_ok(
            r#"
            class Animal {
                init(name) {
                    this.name = name;
                }
                speak() {
                    return this.name;
                }
            }
            class Dog < Animal {}
            var d = Dog("Rex");
            var who = d.speak();
            "#,
        );
        let name = vm.intern(b"who");
        let v = vm.globals.get(&vm.heap, name).unwrap();
        assert_eq!(vm.heap.get_string(v.as_obj().unwrap()), "Rex");
    }

    #[test]
    fn runtime_type_error_on_plus() {
        let mut vm = Vm::new(false, false);
        let err = vm.interpret("var x = 1 + \"two\";").unwrap_err();
        match err {
            PandaError::Runtime { message, .. } => {
                assert!(message.contains("Operands must be"));
            }
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn undefined_property_is_a_runtime_error() {
        let mut vm = Vm::new(false, false);
        let err = vm.interpret("class Foo {} var f = Foo(); f.bar;").unwrap_err();
        assert!(matches!(err, PandaError::Runtime { .. }));
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let mut vm = Vm::new(false, false);
        let err =
            vm.interpret("fun recurse(n) { return recurse(n + 1); } recurse(0);").unwrap_err();
        match err {
            PandaError::Runtime { message, .. } => assert_eq!(message, "Stack overflow."),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn gc_stress_mode_still_produces_correct_results() {
        let mut vm = Vm::new(true, false);
        vm.interpret(
            r#"
            var total = 0;
            for (var i = 0; i < 50; i = i + 1) {
                total = total + i;
            }
            "#,
        )
        .unwrap();
        let name = vm.intern(b"total");
        assert_eq!(global_number(&vm, name), 1225.0);
    }
}
