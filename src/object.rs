// File: src/object.rs
//
// Heap object hierarchy for the Panda VM: strings, functions, native
// functions, closures, upvalues, classes, instances, and bound methods.
// Every variant here lives in the arena owned by `gc::Heap`.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Handle to a heap object. Two handles are equal iff they name the same
/// arena slot, which is exactly object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub type NativeFn = fn(&[Value]) -> Value;

#[derive(Debug, Clone)]
pub struct ObjString {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        // Panda source is scanned as UTF-8; identifiers, keywords and string
        // literals all originate from valid UTF-8 source text.
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf-8>")
    }
}

#[derive(Debug, Clone)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct ObjNative {
    pub function: NativeFn,
}

#[derive(Debug, Clone)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueLocation {
    /// Still points into the live value stack at this absolute index.
    Stack(usize),
    /// Closed: the value has been copied out of the stack.
    Closed,
}

#[derive(Debug, Clone)]
pub struct ObjUpvalue {
    pub location: UpvalueLocation,
    pub closed: Value,
}

#[derive(Debug, Clone)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: ObjRef) -> Self {
        Self { name, methods: Table::new() }
    }
}

#[derive(Debug, Clone)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: ObjRef) -> Self {
        Self { class, fields: Table::new() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug, Clone)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    /// Approximate heap footprint, tracked for the GC's byte-driven trigger.
    pub fn size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.bytes.len(),
            Obj::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>(),
            Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            Obj::Class(c) => c.methods.capacity() * std::mem::size_of::<(Option<ObjRef>, Value)>(),
            Obj::Instance(i) => i.fields.capacity() * std::mem::size_of::<(Option<ObjRef>, Value)>(),
            _ => 0,
        }
    }
}
