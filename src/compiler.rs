// File: src/compiler.rs
//
// Single-pass Pratt-style compiler for the Panda language. Parses
// directly into bytecode — there is no separate parse tree — resolving
// scopes, upvalues, and class/superclass bindings as it goes. Error
// recovery: entering panic mode on the first error suppresses further
// diagnostics until `synchronize` finds a statement boundary; compilation
// always runs to EOF so every syntax error in a program is collected.

use crate::chunk::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::gc::Heap;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::object::{Obj, ObjFunction, ObjRef};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

fn get_rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use TokenKind as T;
    let none_rule = ParseRule { prefix: None, infix: None, precedence: Precedence::None };
    let prefix: Option<ParseFn<'src, 'h>>;
    let infix: Option<ParseFn<'src, 'h>>;
    let precedence: Precedence;
    match kind {
        T::LeftParen => {
            prefix = Some(Compiler::grouping);
            infix = Some(Compiler::call);
            precedence = Precedence::Call;
        }
        T::Dot => {
            prefix = None;
            infix = Some(Compiler::dot);
            precedence = Precedence::Call;
        }
        T::Minus => {
            prefix = Some(Compiler::unary);
            infix = Some(Compiler::binary);
            precedence = Precedence::Term;
        }
        T::Plus => {
            prefix = None;
            infix = Some(Compiler::binary);
            precedence = Precedence::Term;
        }
        T::Slash | T::Star => {
            prefix = None;
            infix = Some(Compiler::binary);
            precedence = Precedence::Factor;
        }
        T::Bang => {
            prefix = Some(Compiler::unary);
            infix = None;
            precedence = Precedence::None;
        }
        T::BangEqual | T::EqualEqual => {
            prefix = None;
            infix = Some(Compiler::binary);
            precedence = Precedence::Equality;
        }
        T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
            prefix = None;
            infix = Some(Compiler::binary);
            precedence = Precedence::Comparison;
        }
        T::Identifier => {
            prefix = Some(Compiler::variable);
            infix = None;
            precedence = Precedence::None;
        }
        T::String => {
            prefix = Some(Compiler::string);
            infix = None;
            precedence = Precedence::None;
        }
        T::Number => {
            prefix = Some(Compiler::number);
            infix = None;
            precedence = Precedence::None;
        }
        T::And => {
            prefix = None;
            infix = Some(Compiler::and_);
            precedence = Precedence::And;
        }
        T::False | T::Nil | T::True => {
            prefix = Some(Compiler::literal);
            infix = None;
            precedence = Precedence::None;
        }
        T::Or => {
            prefix = None;
            infix = Some(Compiler::or_);
            precedence = Precedence::Or;
        }
        T::Super => {
            prefix = Some(Compiler::super_);
            infix = None;
            precedence = Precedence::None;
        }
        T::This => {
            prefix = Some(Compiler::this_);
            infix = None;
            precedence = Precedence::None;
        }
        _ => return none_rule,
    }
    ParseRule { prefix, infix, precedence }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct CompilerFrame<'src> {
    kind: FunctionKind,
    arity: u8,
    name: Option<ObjRef>,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> CompilerFrame<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 is reserved: "this" for methods/initializers, an unnamed
        // placeholder (the called closure itself) otherwise.
        let slot0_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            kind,
            arity: 0,
            name,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot0_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassFrame {
    has_superclass: bool,
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    frames: Vec<CompilerFrame<'src>>,
    classes: Vec<ClassFrame>,
    heap: &'h mut Heap,
    /// A snapshot of whatever the VM already had reachable (globals,
    /// stack, open upvalues) before this compile started. The compiler
    /// triggers its own collections while interning identifiers, and
    /// has no other way to know those objects are still live.
    external_roots: Vec<Value>,
}

pub fn compile(
    source: &str,
    heap: &mut Heap,
    external_roots: Vec<Value>,
) -> Result<ObjRef, Vec<CompileError>> {
    let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 1 };
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: dummy,
        current: dummy,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        frames: vec![CompilerFrame::new(FunctionKind::Script, None)],
        classes: Vec::new(),
        heap,
        external_roots,
    };
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let function_ref = compiler.end_compiler();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function_ref)
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = if token.kind == TokenKind::Eof { "end".to_string() } else { token.lexeme.to_string() };
        self.errors.push(CompileError { line: token.line, at, message: message.to_string() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- emission -----------------------------------------------------

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.frames.last_mut().unwrap().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let chunk = self.current_chunk();
        let jump = chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let chunk = self.current_chunk();
        let offset = chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.frames.last().unwrap().kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_bytes(OpCode::Constant, idx);
    }

    /// Interns a string during compilation, protecting every in-progress
    /// function's constant pool plus whatever the VM already had live
    /// (`external_roots`) across the allocation.
    fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        let mut roots: Vec<Value> = self.external_roots.clone();
        for frame in &self.frames {
            roots.extend(frame.chunk.constants.iter().copied());
            if let Some(name) = frame.name {
                roots.push(Value::Obj(name));
            }
        }
        self.heap.intern(bytes, move |h| {
            for v in roots {
                h.mark_value(v);
            }
        })
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let name = name.to_string();
        let r = self.intern(name.as_bytes());
        self.make_constant(Value::Obj(r))
    }

    // ---- scopes & locals ------------------------------------------------

    fn begin_scope(&mut self) {
        self.frames.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        frame.scope_depth -= 1;
        let depth = frame.scope_depth;
        loop {
            let frame = self.frames.last().unwrap();
            let Some(local) = frame.locals.last() else { break };
            if local.depth <= depth {
                break;
            }
            let is_captured = local.is_captured;
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.frames.last_mut().unwrap().locals.pop();
        }
    }

    fn identifiers_equal(a: &str, b: &str) -> bool {
        a == b
    }

    fn add_local(&mut self, name: &'src str) {
        let frame = self.frames.last_mut().unwrap();
        if frame.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frames.last_mut().unwrap().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        let frame = self.frames.last().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = frame.scope_depth;
        for local in frame.locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if Self::identifiers_equal(name, local.name) {
                self.error("Already a variable with this name in this scope.");
                break;
            }
        }
        self.add_local(name);
    }

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let frame = &self.frames[frame_idx];
        for (i, local) in frame.locals.iter().enumerate().rev() {
            if Self::identifiers_equal(name, local.name) {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let frame = &mut self.frames[frame_idx];
        for (i, up) in frame.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if frame.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueDesc { index, is_local });
        (frame.upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        if let Some(local_idx) = self.resolve_local(frame_idx - 1, name) {
            self.frames[frame_idx - 1].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local_idx, true));
        }
        if let Some(up_idx) = self.resolve_upvalue(frame_idx - 1, name) {
            return Some(self.add_upvalue(frame_idx, up_idx, false));
        }
        None
    }

    // ---- variables ------------------------------------------------------

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.frames.last().unwrap().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        frame.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.frames.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(idx) = self.resolve_local(frame_idx, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, idx)
        } else if let Some(idx) = self.resolve_upvalue(frame_idx, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, idx)
        } else {
            let idx = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    // ---- expressions ------------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let r = self.intern(text.as_bytes());
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let token = Token { kind: TokenKind::This, lexeme: "this", line: self.previous.line };
        self.named_variable(token, false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_constant = self.identifier_constant(self.previous.lexeme);
        let line = self.previous.line;
        let this_token = Token { kind: TokenKind::This, lexeme: "this", line };
        let super_token = Token { kind: TokenKind::Super, lexeme: "super", line };
        self.named_variable(this_token, false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_bytes(OpCode::SuperInvoke, name_constant);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(super_token, false);
            self.emit_bytes(OpCode::GetSuper, name_constant);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        let rule = get_rule(kind);
        self.parse_precedence(rule.precedence.next());
        match kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(OpCode::GetProperty, name);
        }
    }

    // ---- statements ------------------------------------------------------

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.compile_function(kind);
        self.emit_bytes(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable();

        self.emit_bytes(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassFrame { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_token = self.previous;
            self.variable(false);
            if Self::identifiers_equal(super_token.lexeme, name_token.lexeme) {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(name_token, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(name_token, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.compile_function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frames.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frames.last().unwrap().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    // ---- function compilation plumbing ------------------------------------

    /// Compiles a nested function/method body and emits the enclosing
    /// `CLOSURE` instruction with its upvalue descriptors.
    fn compile_function(&mut self, kind: FunctionKind) {
        let name_lexeme = self.previous.lexeme.to_string();
        let name_ref = self.intern(name_lexeme.as_bytes());
        self.frames.push(CompilerFrame::new(kind, Some(name_ref)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.frames.last_mut().unwrap().arity += 1;
                if self.frames.last().unwrap().arity as usize > MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues: Vec<UpvalueDesc> = self.frames.last().unwrap().upvalues.clone();
        let function_ref = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function_ref));
        self.emit_bytes(OpCode::Closure, constant);
        for up in upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    fn end_compiler(&mut self) -> ObjRef {
        self.emit_return();
        let frame = self.frames.pop().unwrap();
        let mut own_roots: Vec<Value> = frame.chunk.constants.clone();
        if let Some(name) = frame.name {
            own_roots.push(Value::Obj(name));
        }
        let function = ObjFunction {
            arity: frame.arity,
            upvalue_count: frame.upvalues.len() as u8,
            chunk: frame.chunk,
            name: frame.name,
        };
        self.alloc(Obj::Function(function), &own_roots)
    }

    /// `extra_roots` covers values that belong to `obj` itself but
    /// aren't reachable from any live frame yet (e.g. a just-popped
    /// function frame's own constant pool, mid-way through becoming an
    /// `ObjFunction`).
    fn alloc(&mut self, obj: Obj, extra_roots: &[Value]) -> ObjRef {
        let mut roots: Vec<Value> = extra_roots.to_vec();
        roots.extend(self.external_roots.iter().copied());
        for frame in &self.frames {
            roots.extend(frame.chunk.constants.iter().copied());
            if let Some(name) = frame.name {
                roots.push(Value::Obj(name));
            }
        }
        if self.heap.needs_collect() {
            for v in roots {
                self.heap.mark_value(v);
            }
            self.heap.collect();
        }
        self.heap.raw_alloc(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_script(source: &str) -> Chunk {
        let mut heap = Heap::new();
        let function_ref = compile(source, &mut heap, Vec::new()).expect("expected clean compile");
        match heap.get(function_ref) {
            Obj::Function(f) => f.chunk.clone(),
            _ => panic!("top-level compile did not yield a function"),
        }
    }

    /// A forward `JUMP`/`JUMP_IF_FALSE`'s two-byte operand must equal the
    /// number of bytes actually skipped to land just past itself.
    #[test]
    fn if_else_jump_distances_land_exactly_past_each_branch() {
        let chunk = compile_script("if (true) { 1; } else { 2; } 3;");
        let mut i = 0;
        let mut jumps = Vec::new();
        while i < chunk.code.len() {
            let op = OpCode::try_from(chunk.code[i]).unwrap();
            match op {
                OpCode::JumpIfFalse | OpCode::Jump => {
                    let dist = ((chunk.code[i + 1] as usize) << 8) | chunk.code[i + 2] as usize;
                    let target = i + 3 + dist;
                    jumps.push((i, target));
                    i += 3;
                }
                OpCode::Constant | OpCode::Call | OpCode::GetLocal | OpCode::SetLocal => i += 2,
                _ => i += 1,
            }
        }
        assert_eq!(jumps.len(), 2, "expected one JUMP_IF_FALSE and one else-skipping JUMP");
        for (from, target) in jumps {
            assert!(target <= chunk.code.len(), "jump at {from} overruns the chunk ({target})");
        }
    }

    /// `LOOP`'s backward distance must land exactly back on the condition
    /// re-check, not one byte off in either direction.
    #[test]
    fn while_loop_distance_lands_on_the_condition_recheck() {
        let chunk = compile_script("var i = 0; while (i < 3) { i = i + 1; }");
        let loop_pos = chunk
            .code
            .iter()
            .position(|&b| OpCode::try_from(b) == Ok(OpCode::Loop))
            .expect("expected an OP_LOOP");
        let dist = ((chunk.code[loop_pos + 1] as usize) << 8) | chunk.code[loop_pos + 2] as usize;
        let landing = loop_pos + 3 - dist;
        // The condition re-check starts with GET_GLOBAL (loading `i`).
        assert_eq!(chunk.code[landing], OpCode::GetGlobal as u8);
    }

    #[test]
    fn too_many_constants_is_a_compile_error() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        let mut heap = Heap::new();
        let result = compile(&source, &mut heap, Vec::new());
        assert!(result.is_err());
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_is_an_error() {
        let mut heap = Heap::new();
        let result = compile("{ var a = a; }", &mut heap, Vec::new());
        let errors = result.expect_err("expected a compile error");
        assert!(errors.iter().any(|e| e.message.contains("own initializer")));
    }
}
