// File: src/debug.rs
//
// Bytecode disassembler, wired up behind `--disassemble`. Walks a
// chunk's instruction stream one opcode at a time, printing its offset,
// source line, and operands; nested function constants are
// disassembled recursively so a whole compiled program prints as a
// sequence of labeled listings.

use crate::chunk::{Chunk, OpCode};
use crate::gc::Heap;
use crate::object::Obj;
use crate::value::{print_value, Value};

pub fn disassemble_source(source: &str, name: &str) {
    let mut heap = Heap::new();
    match crate::compiler::compile(source, &mut heap, Vec::new()) {
        Ok(function_ref) => disassemble_function(function_ref, &heap),
        Err(errors) => {
            for e in errors {
                eprintln!("{e}");
            }
            eprintln!("-- {name}: could not disassemble, compilation failed --");
        }
    }
}

fn disassemble_function(function_ref: crate::object::ObjRef, heap: &Heap) {
    let function = match heap.get(function_ref) {
        Obj::Function(f) => f,
        _ => return,
    };
    let label = match function.name {
        Some(n) => heap.get_string(n).to_string(),
        None => "<script>".to_string(),
    };
    disassemble_chunk(&function.chunk, &label, heap);
    for constant in &function.chunk.constants {
        if let Value::Obj(r) = constant {
            if matches!(heap.get(*r), Obj::Function(_)) {
                disassemble_function(*r, heap);
            }
        }
    }
}

pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) {
    println!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, heap);
    }
}

fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    print!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let op = match OpCode::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(byte) => {
            println!("unknown opcode {byte}");
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset, heap),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset, heap),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset, heap),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset, heap),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset),
        OpCode::GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset, heap),
        OpCode::SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset, heap),
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset, heap),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, offset, heap),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset, heap),
        OpCode::Closure => closure_instruction(chunk, offset, heap),
        OpCode::Class => constant_instruction("OP_CLASS", chunk, offset, heap),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, offset, heap),
        simple => simple_instruction(simple_name(simple), offset),
    }
}

fn simple_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Nil => "OP_NIL",
        OpCode::True => "OP_TRUE",
        OpCode::False => "OP_FALSE",
        OpCode::Pop => "OP_POP",
        OpCode::Equal => "OP_EQUAL",
        OpCode::Greater => "OP_GREATER",
        OpCode::Less => "OP_LESS",
        OpCode::Add => "OP_ADD",
        OpCode::Subtract => "OP_SUBTRACT",
        OpCode::Multiply => "OP_MULTIPLY",
        OpCode::Divide => "OP_DIVIDE",
        OpCode::Not => "OP_NOT",
        OpCode::Negate => "OP_NEGATE",
        OpCode::Print => "OP_PRINT",
        OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
        OpCode::Return => "OP_RETURN",
        OpCode::Inherit => "OP_INHERIT",
        _ => "OP_UNKNOWN",
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name}");
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{name:<18} {slot:4}");
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let hi = chunk.code[offset + 1] as u16;
    let lo = chunk.code[offset + 2] as u16;
    let jump = (hi << 8) | lo;
    let target = offset as i32 + 3 + sign * jump as i32;
    println!("{name:<18} {offset:4} -> {target}");
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.code[offset + 1];
    let value = chunk.constants[idx as usize];
    println!("{name:<18} {idx:4} '{}'", print_value(value, heap));
    offset + 2
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let value = chunk.constants[idx as usize];
    println!("{name:<18} ({arg_count} args) {idx:4} '{}'", print_value(value, heap));
    offset + 3
}

fn closure_instruction(chunk: &Chunk, mut offset: usize, heap: &Heap) -> usize {
    offset += 1;
    let idx = chunk.code[offset];
    offset += 1;
    let value = chunk.constants[idx as usize];
    println!("{:<18} {idx:4} '{}'", "OP_CLOSURE", print_value(value, heap));

    let upvalue_count = match value.as_obj().map(|r| heap.get(r)) {
        Some(Obj::Function(f)) => f.upvalue_count,
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        offset += 1;
        let index = chunk.code[offset];
        offset += 1;
        let kind = if is_local != 0 { "local" } else { "upvalue" };
        println!("{offset:04}      |                     {kind} {index}");
    }
    offset
}
