// File: src/compiler.rs
//
// Single-pass Pratt parser/compiler: turns a token stream directly into a
// `FunctionChunk`, with no intermediate AST. One `FrameState` is pushed per
// nested function literal being compiled (locals, upvalues, loop contexts);
// locals/upvalues resolve by walking that frame stack outward, and forward
// jumps (`if`/`while`/`match`/`break`) are backpatched once their targets
// are known.

use crate::bytecode::{ConstIdx, FunctionChunk, OpCode, Slot, UpvalueDesc};
use crate::errors::CompileError;
use crate::heap::Heap;
use crate::lexer::{tokenize, Token, TokenKind};
use crate::value::{Obj, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Concat,
    Term,
    Factor,
    Power,
    Unary,
    Call,
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Concat,
            Prec::Concat => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Power,
            Prec::Power => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call => Prec::Primary,
            Prec::Primary => Prec::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

struct LoopCtx {
    loop_start: usize,
    break_patches: Vec<usize>,
    locals_at_entry: usize,
}

struct FrameState {
    function: FunctionChunk,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
    loops: Vec<LoopCtx>,
}

impl FrameState {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        let slot0_name = if kind == FunctionKind::Method { "self" } else { "" };
        FrameState {
            function: FunctionChunk::new(name),
            kind,
            locals: vec![Local { name: slot0_name.to_string(), depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

type PrefixFn = fn(&mut Compiler, bool);
type InfixFn = fn(&mut Compiler, bool);

pub struct Compiler<'a> {
    tokens: Vec<Token>,
    pos: usize,
    heap: &'a mut Heap,
    frames: Vec<FrameState>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    allow_struct_literal: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(source: &str, heap: &'a mut Heap) -> Self {
        Compiler {
            tokens: tokenize(source),
            pos: 0,
            heap,
            frames: vec![FrameState::new(FunctionKind::Script, None)],
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            allow_struct_literal: true,
        }
    }

    pub fn compile(mut self) -> Result<FunctionChunk, Vec<CompileError>> {
        while !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.emit(OpCode::Nil);
        self.emit(OpCode::Return);

        if self.had_error {
            Err(self.errors)
        } else {
            Ok(self.frames.pop().unwrap().function)
        }
    }

    // ---- token stream helpers ------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos - 1]
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> &Token {
        if !self.check(&TokenKind::Eof) {
            self.pos += 1;
        }
        if let TokenKind::Error(msg) = self.previous().kind.clone() {
            let line = self.previous().line;
            self.error_at(line, &msg);
        }
        self.previous()
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if self.check(&kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(&kind) {
            self.advance();
        } else {
            let line = self.peek().line;
            self.error_at(line, message);
        }
    }

    fn consume_identifier(&mut self, message: &str) -> String {
        if let TokenKind::Identifier(name) = self.peek().kind.clone() {
            self.advance();
            name
        } else {
            let line = self.peek().line;
            self.error_at(line, message);
            String::new()
        }
    }

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError { line, at: String::new(), message: message.to_string() });
    }

    fn error(&mut self, message: &str) {
        let line = self.previous().line;
        self.error_at(line, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            match self.peek().kind {
                TokenKind::Global
                | TokenKind::Var
                | TokenKind::Func
                | TokenKind::Struct
                | TokenKind::Enum
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Loop
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Match
                | TokenKind::Break
                | TokenKind::Continue => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission ---------------------------------------------------

    fn current(&mut self) -> &mut FunctionChunk {
        &mut self.frames.last_mut().unwrap().function
    }

    fn emit(&mut self, op: OpCode) -> usize {
        let line = self.previous().line;
        self.current().emit(op, line)
    }

    fn emit_jump_placeholder(&mut self, make: fn(u16) -> OpCode) -> usize {
        self.emit(make(0))
    }

    fn patch_jump(&mut self, index: usize) {
        let target = self.current().code.len();
        let offset = target - index - 1;
        if offset > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let offset = offset as u16;
        let code = &mut self.current().code;
        code[index] = match &code[index] {
            OpCode::Jump(_) => OpCode::Jump(offset),
            OpCode::JumpIfFalse(_) => OpCode::JumpIfFalse(offset),
            OpCode::InequalityJump(_) => OpCode::InequalityJump(offset),
            other => other.clone(),
        };
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let here = self.current().code.len();
        let offset = here - loop_start + 1;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        self.emit(OpCode::Loop(offset as u16));
    }

    fn patch_break(&mut self, index: usize) {
        let target = self.current().code.len();
        let offset = target - index - 1;
        self.current().code[index] = OpCode::Jump(offset as u16);
    }

    // ---- constants -------------------------------------------------------------

    fn identifier_constant(&mut self, name: &str) -> ConstIdx {
        if let Some(existing) = self.current().constants.iter().position(|v| match v {
            Value::Obj(r) => matches!(self.heap.get(*r), Obj::String(s) if s.chars.as_ref() == name),
            _ => false,
        }) {
            return existing as ConstIdx;
        }
        let r = self.heap.intern(name);
        self.current().add_constant(Value::Obj(r))
    }

    // ---- scopes & locals --------------------------------------------------------

    fn frame(&self) -> &FrameState {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut FrameState {
        self.frames.last_mut().unwrap()
    }

    fn current_frame_idx(&self) -> usize {
        self.frames.len() - 1
    }

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame_mut().scope_depth -= 1;
        let depth = self.frame().scope_depth as i32;
        while let Some(local) = self.frame().locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
            self.frame_mut().locals.pop();
        }
    }

    fn declare_variable(&mut self, name: &str) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth as i32;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        if self.frame().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame_mut().locals.push(Local { name: name.to_string(), depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth as i32;
        self.frame_mut().locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, name_const: ConstIdx) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(OpCode::DefineGlobal(name_const));
    }

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<Slot> {
        let frame = &self.frames[frame_idx];
        for (i, local) in frame.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as Slot);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<Slot> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local_slot, true));
        }
        if let Some(up_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, up_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: Slot, is_local: bool) -> Slot {
        let frame = &mut self.frames[frame_idx];
        for (i, up) in frame.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as Slot;
            }
        }
        frame.upvalues.push(UpvalueDesc { is_local, index });
        frame.function.upvalue_count = frame.upvalues.len() as u8;
        (frame.upvalues.len() - 1) as Slot
    }

    // ---- declarations ----------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_tok(TokenKind::Global) {
            self.var_declaration(true);
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.match_tok(TokenKind::Func) {
            self.func_declaration();
        } else if self.match_tok(TokenKind::Struct) {
            self.struct_declaration();
        } else if self.match_tok(TokenKind::Enum) {
            self.enum_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, force_global: bool) {
        let name = self.consume_identifier("Expect variable name.");
        if !force_global {
            self.declare_variable(&name);
        }
        let name_const = self.identifier_constant(&name);
        if self.match_tok(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        if force_global || self.frame().scope_depth == 0 {
            self.emit(OpCode::DefineGlobal(name_const));
        } else {
            self.mark_initialized();
        }
    }

    fn func_declaration(&mut self) {
        let name = self.consume_identifier("Expect function name.");
        self.declare_variable(&name);
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
        }
        self.function(FunctionKind::Function, Some(name.clone()));
        if self.frame().scope_depth == 0 {
            let name_const = self.identifier_constant(&name);
            self.emit(OpCode::DefineGlobal(name_const));
        }
    }

    fn function(&mut self, kind: FunctionKind, name: Option<String>) {
        self.frames.push(FrameState::new(kind, name));

        self.consume(TokenKind::LParen, "Expect '(' after function name.");
        if !self.check(&TokenKind::RParen) {
            loop {
                self.frame_mut().function.arity += 1;
                if self.frame().function.arity > 255 {
                    self.error("Can't have more than 255 parameters.");
                }
                let param = self.consume_identifier("Expect parameter name.");
                self.declare_variable(&param);
                self.mark_initialized();
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LBrace, "Expect '{' before function body.");
        self.block();

        self.emit(OpCode::Nil);
        self.emit(OpCode::Return);

        let frame = self.frames.pop().unwrap();
        let upvalues = frame.upvalues;
        let mut chunk = frame.function;
        chunk.upvalue_count = upvalues.len() as u8;
        let func_ref = self.heap.alloc(Obj::Function(chunk));
        let const_idx = self.current().add_constant(Value::Obj(func_ref));
        self.emit(OpCode::Closure(const_idx, upvalues));
    }

    fn struct_declaration(&mut self) {
        let name = self.consume_identifier("Expect struct name.");
        self.declare_variable(&name);
        let name_const = self.identifier_constant(&name);
        self.emit(OpCode::Struct(name_const));
        self.define_variable(name_const);
        self.named_variable(name, false);

        self.consume(TokenKind::LBrace, "Expect '{' before struct body.");
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.match_tok(TokenKind::Static) {
                self.consume(TokenKind::Func, "Expect 'func' after 'static'.");
                self.method(true);
            } else if self.match_tok(TokenKind::Func) {
                self.method(false);
            } else {
                let field_name = self.consume_identifier("Expect field name.");
                let field_const = self.identifier_constant(&field_name);
                self.consume(TokenKind::Equal, "Expect '=' after field name.");
                self.expression();
                self.consume(TokenKind::Semicolon, "Expect ';' after field default.");
                self.emit(OpCode::StructField(field_const));
            }
        }
        self.consume(TokenKind::RBrace, "Expect '}' after struct body.");
        self.emit(OpCode::Pop);
    }

    fn method(&mut self, is_static: bool) {
        let name = self.consume_identifier("Expect method name.");
        let name_const = self.identifier_constant(&name);
        let kind = if is_static { FunctionKind::Function } else { FunctionKind::Method };
        self.function(kind, Some(name));
        if is_static {
            self.emit(OpCode::StaticMethod(name_const));
        } else {
            self.emit(OpCode::Method(name_const));
        }
    }

    fn enum_declaration(&mut self) {
        let name = self.consume_identifier("Expect enum name.");
        self.declare_variable(&name);
        let name_const = self.identifier_constant(&name);
        self.emit(OpCode::Enum(name_const));
        self.define_variable(name_const);
        self.named_variable(name, false);

        self.consume(TokenKind::LBrace, "Expect '{' before enum body.");
        let mut ordinal: u32 = 0;
        if !self.check(&TokenKind::RBrace) {
            loop {
                let variant = self.consume_identifier("Expect enum value name.");
                let variant_const = self.identifier_constant(&variant);
                if ordinal > 255 {
                    self.error("Too many enum values.");
                }
                self.emit(OpCode::EnumValue(variant_const, ordinal as u8));
                ordinal += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
                if self.check(&TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBrace, "Expect '}' after enum body.");
        self.emit(OpCode::Pop);
    }

    // ---- statements --------------------------------------------------------------

    fn statement(&mut self) {
        if self.match_tok(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_tok(TokenKind::If) {
            self.if_statement();
        } else if self.match_tok(TokenKind::While) {
            self.while_statement();
        } else if self.match_tok(TokenKind::Loop) {
            self.loop_statement();
        } else if self.match_tok(TokenKind::For) {
            self.for_statement();
        } else if self.match_tok(TokenKind::Break) {
            self.break_statement();
        } else if self.match_tok(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_tok(TokenKind::Return) {
            self.return_statement();
        } else if self.match_tok(TokenKind::Match) {
            self.match_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(OpCode::Pop);
    }

    fn condition_expression(&mut self) {
        let saved = self.allow_struct_literal;
        self.allow_struct_literal = false;
        self.expression();
        self.allow_struct_literal = saved;
    }

    fn if_statement(&mut self) {
        self.condition_expression();
        let then_jump = self.emit_jump_placeholder(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump_placeholder(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit(OpCode::Pop);

        if self.match_tok(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current().code.len();
        self.condition_expression();
        let exit_jump = self.emit_jump_placeholder(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);

        self.frame_mut().loops.push(LoopCtx {
            loop_start,
            break_patches: Vec::new(),
            locals_at_entry: self.frame().locals.len(),
        });
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(OpCode::Pop);
        let loop_ctx = self.frame_mut().loops.pop().unwrap();
        for patch in loop_ctx.break_patches {
            self.patch_break(patch);
        }
    }

    fn loop_statement(&mut self) {
        let loop_start = self.current().code.len();
        self.frame_mut().loops.push(LoopCtx {
            loop_start,
            break_patches: Vec::new(),
            locals_at_entry: self.frame().locals.len(),
        });
        self.statement();
        self.emit_loop(loop_start);

        let loop_ctx = self.frame_mut().loops.pop().unwrap();
        for patch in loop_ctx.break_patches {
            self.patch_break(patch);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LParen, "Expect '(' after 'for'.");

        if self.match_tok(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration(false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current().code.len();
        let exit_jump = if !self.check(&TokenKind::Semicolon) {
            self.condition_expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            let jump = self.emit_jump_placeholder(OpCode::JumpIfFalse);
            self.emit(OpCode::Pop);
            Some(jump)
        } else {
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            None
        };

        // The increment runs once per iteration but must execute *after* the
        // body, not before it: jump over it into the body first, loop back
        // to the condition from here, then retarget `loop_start` (what
        // `continue` and the body's closing `LOOP` aim at) at the increment.
        if !self.check(&TokenKind::RParen) {
            let body_jump = self.emit_jump_placeholder(OpCode::Jump);
            let increment_start = self.current().code.len();
            self.expression();
            self.emit(OpCode::Pop);
            self.consume(TokenKind::RParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenKind::RParen, "Expect ')' after for clauses.");
        }

        self.frame_mut().loops.push(LoopCtx {
            loop_start,
            break_patches: Vec::new(),
            locals_at_entry: self.frame().locals.len(),
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(jump) = exit_jump {
            self.patch_jump(jump);
            self.emit(OpCode::Pop);
        }
        let loop_ctx = self.frame_mut().loops.pop().unwrap();
        for patch in loop_ctx.break_patches {
            self.patch_break(patch);
        }
        self.end_scope();
    }

    fn close_locals_to(&mut self, target_count: usize) {
        let captured: Vec<bool> =
            self.frame().locals[target_count..].iter().map(|l| l.is_captured).collect();
        for is_captured in captured.into_iter().rev() {
            if is_captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
        }
    }

    fn break_statement(&mut self) {
        if self.frame().loops.is_empty() {
            self.error("Cannot use 'break' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
            return;
        }
        let locals_at_entry = self.frame().loops.last().unwrap().locals_at_entry;
        self.close_locals_to(locals_at_entry);
        let patch = self.emit(OpCode::Break);
        self.frame_mut().loops.last_mut().unwrap().break_patches.push(patch);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        if self.frame().loops.is_empty() {
            self.error("Cannot use 'continue' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return;
        }
        let (loop_start, locals_at_entry) = {
            let ctx = self.frame().loops.last().unwrap();
            (ctx.loop_start, ctx.locals_at_entry)
        };
        self.close_locals_to(locals_at_entry);
        self.emit_loop(loop_start);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    fn return_statement(&mut self) {
        if self.match_tok(TokenKind::Semicolon) {
            self.emit(OpCode::Nil);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        }
        self.emit(OpCode::Return);
    }

    fn match_statement(&mut self) {
        self.condition_expression();
        self.consume(TokenKind::LBrace, "Expect '{' before match body.");
        let mut exit_jumps = Vec::new();
        while self.match_tok(TokenKind::Case) {
            self.expression();
            self.consume(TokenKind::RightArrow, "Expect '=>' after case value.");
            let next_case = self.emit_jump_placeholder(OpCode::InequalityJump);
            self.statement();
            exit_jumps.push(self.emit_jump_placeholder(OpCode::Jump));
            self.patch_jump(next_case);
        }
        self.consume(TokenKind::RBrace, "Expect '}' after match body.");
        for jump in exit_jumps {
            self.patch_jump(jump);
        }
        self.emit(OpCode::Pop);
    }

    // ---- expressions ---------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    fn is_assign_token(kind: &TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::Equal
                | TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::StarEqual
                | TokenKind::SlashEqual
                | TokenKind::PercentEqual
                | TokenKind::StarStarEqual
                | TokenKind::DotDotEqual
        )
    }

    fn parse_precedence(&mut self, prec: Prec) {
        self.advance();
        let can_assign = prec <= Prec::Assignment;
        match Self::prefix_rule(&self.previous().kind) {
            Some(f) => f(self, can_assign),
            None => {
                self.error("Expect expression.");
                return;
            }
        }

        while prec <= Self::rule_precedence(&self.peek().kind) {
            self.advance();
            let infix = Self::infix_rule(&self.previous().kind).expect("rule table inconsistent");
            infix(self, can_assign);
        }

        if can_assign && Self::is_assign_token(&self.peek().kind) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule_precedence(kind: &TokenKind) -> Prec {
        Self::rule(kind).2
    }

    fn prefix_rule(kind: &TokenKind) -> Option<PrefixFn> {
        Self::rule(kind).0
    }

    fn infix_rule(kind: &TokenKind) -> Option<InfixFn> {
        Self::rule(kind).1
    }

    #[allow(clippy::type_complexity)]
    fn rule(kind: &TokenKind) -> (Option<PrefixFn>, Option<InfixFn>, Prec) {
        use TokenKind::*;
        match kind {
            LParen => (Some(Compiler::grouping), Some(Compiler::call), Prec::Call),
            LBracket => (Some(Compiler::array_literal), Some(Compiler::subscript), Prec::Call),
            Dot => (None, Some(Compiler::dot), Prec::Call),
            Colon => (None, Some(Compiler::static_access), Prec::Call),
            Minus => (Some(Compiler::unary), Some(Compiler::binary), Prec::Term),
            Plus => (None, Some(Compiler::binary), Prec::Term),
            Slash | Star | Percent => (None, Some(Compiler::binary), Prec::Factor),
            StarStar => (None, Some(Compiler::binary), Prec::Power),
            Bang => (Some(Compiler::unary), None, Prec::None),
            BangEqual | EqualEqual => (None, Some(Compiler::binary), Prec::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Compiler::binary), Prec::Comparison)
            }
            DotDot => (None, Some(Compiler::concat), Prec::Concat),
            AmpAmp => (None, Some(Compiler::and_), Prec::And),
            PipePipe => (None, Some(Compiler::or_), Prec::Or),
            Identifier(_) => (Some(Compiler::variable), None, Prec::None),
            String(_) => (Some(Compiler::string_literal), None, Prec::None),
            Number(_) => (Some(Compiler::number), None, Prec::None),
            True | False | Nil => (Some(Compiler::literal), None, Prec::None),
            SelfKw => (Some(Compiler::self_expr), None, Prec::None),
            _ => (None, None, Prec::None),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let n = match self.previous().kind {
            TokenKind::Number(n) => n,
            _ => unreachable!(),
        };
        let idx = self.current().add_constant(Value::Number(n));
        self.emit(OpCode::Constant(idx));
    }

    fn string_literal(&mut self, _can_assign: bool) {
        let s = match self.previous().kind.clone() {
            TokenKind::String(s) => s,
            _ => unreachable!(),
        };
        let r = self.heap.intern(&s);
        let idx = self.current().add_constant(Value::Obj(r));
        self.emit(OpCode::Constant(idx));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous().kind {
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            TokenKind::Nil => self.emit(OpCode::Nil),
            _ => unreachable!(),
        };
    }

    fn self_expr(&mut self, _can_assign: bool) {
        if self.frame().kind != FunctionKind::Method {
            self.error("Can't use 'self' outside of a method.");
        }
        self.named_variable("self".to_string(), false);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after expression.");
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(&TokenKind::RBracket) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Too many elements in array literal.");
                }
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
                if self.check(&TokenKind::RBracket) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBracket, "Expect ']' after array elements.");
        self.emit(OpCode::Array(count as u8));
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous().kind.clone();
        self.parse_precedence(Prec::Unary);
        match op {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Bang => self.emit(OpCode::Not),
            _ => unreachable!(),
        };
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous().kind.clone();
        let prec = Self::rule_precedence(&op);
        let next = if op == TokenKind::StarStar { prec } else { prec.next() };
        self.parse_precedence(next);
        match op {
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Star => self.emit(OpCode::Multiply),
            TokenKind::Slash => self.emit(OpCode::Divide),
            TokenKind::Percent => self.emit(OpCode::Modulo),
            TokenKind::StarStar => self.emit(OpCode::Pow),
            TokenKind::BangEqual => self.emit(OpCode::NotEqual),
            TokenKind::EqualEqual => self.emit(OpCode::Equal),
            TokenKind::Greater => self.emit(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit(OpCode::GreaterEqual),
            TokenKind::Less => self.emit(OpCode::Lesser),
            TokenKind::LessEqual => self.emit(OpCode::LesserEqual),
            _ => unreachable!(),
        };
    }

    fn concat(&mut self, _can_assign: bool) {
        self.parse_precedence(Prec::Concat.next());
        self.emit(OpCode::Concat);
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump_placeholder(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Prec::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump_placeholder(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump_placeholder(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit(OpCode::Pop);
        self.parse_precedence(Prec::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list(TokenKind::RParen);
        self.emit(OpCode::Call(argc));
    }

    fn argument_list(&mut self, closing: TokenKind) -> u8 {
        let mut count: u32 = 0;
        if !self.check(&closing) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(closing, "Expect ')' after arguments.");
        count as u8
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RBracket, "Expect ']' after index.");
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.emit(OpCode::SetSubscript);
        } else {
            self.emit(OpCode::GetSubscript);
        }
    }

    fn match_compound_assign(&mut self) -> Option<OpCode> {
        let op = match self.peek().kind {
            TokenKind::PlusEqual => Some(OpCode::Add),
            TokenKind::MinusEqual => Some(OpCode::Subtract),
            TokenKind::StarEqual => Some(OpCode::Multiply),
            TokenKind::SlashEqual => Some(OpCode::Divide),
            TokenKind::PercentEqual => Some(OpCode::Modulo),
            TokenKind::StarStarEqual => Some(OpCode::Pow),
            TokenKind::DotDotEqual => Some(OpCode::Concat),
            _ => None,
        };
        if op.is_some() {
            self.advance();
        }
        op
    }

    fn dot(&mut self, can_assign: bool) {
        let name = self.consume_identifier("Expect property name after '.'.");
        let name_const = self.identifier_constant(&name);

        if self.check(&TokenKind::LParen) {
            self.advance();
            let argc = self.argument_list(TokenKind::RParen);
            self.emit(OpCode::Invoke(name_const, argc));
            return;
        }

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.emit(OpCode::SetProperty(name_const));
            return;
        }
        if can_assign {
            if let Some(op) = self.match_compound_assign() {
                self.emit(OpCode::PushProperty(name_const));
                self.expression();
                self.emit(op);
                self.emit(OpCode::SetProperty(name_const));
                return;
            }
        }
        self.emit(OpCode::GetProperty(name_const));
    }

    fn static_access(&mut self, _can_assign: bool) {
        self.consume(TokenKind::Colon, "Expected ':' to complete '::'.");
        let name = self.consume_identifier("Expect name after '::'.");
        let name_const = self.identifier_constant(&name);
        self.emit(OpCode::GetStatic(name_const));
    }

    fn named_variable(&mut self, name: String, can_assign: bool) {
        enum Kind {
            Local(Slot),
            Upvalue(Slot),
            Global(ConstIdx),
        }
        let frame_idx = self.current_frame_idx();
        let kind = if let Some(slot) = self.resolve_local(frame_idx, &name) {
            Kind::Local(slot)
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, &name) {
            Kind::Upvalue(slot)
        } else {
            Kind::Global(self.identifier_constant(&name))
        };

        let (get_op, set_op, arg): (OpCode, fn(u8) -> OpCode, u8) = match kind {
            Kind::Local(slot) => (OpCode::GetLocal(slot), OpCode::SetLocal, slot),
            Kind::Upvalue(slot) => (OpCode::GetUpvalue(slot), OpCode::SetUpvalue, slot),
            Kind::Global(idx) => (OpCode::GetGlobal(idx), OpCode::SetGlobal, idx),
        };

        if can_assign {
            if self.match_tok(TokenKind::Equal) {
                self.expression();
                self.emit(set_op(arg));
                return;
            }
            if let Some(op) = self.match_compound_assign() {
                self.emit(get_op);
                self.expression();
                self.emit(op);
                self.emit(set_op(arg));
                return;
            }
        }
        self.emit(get_op);
    }

    fn struct_literal(&mut self, name: String) {
        self.named_variable(name, false);
        self.emit(OpCode::Instance);
        self.consume(TokenKind::LBrace, "Expect '{' for struct literal.");
        if !self.check(&TokenKind::RBrace) {
            loop {
                let field_name = self.consume_identifier("Expect field name.");
                let field_const = self.identifier_constant(&field_name);
                self.consume(TokenKind::Equal, "Expect '=' after field name.");
                self.expression();
                self.emit(OpCode::InitProperty(field_const));
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
                if self.check(&TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBrace, "Expect '}' after struct literal.");
    }

    fn variable(&mut self, can_assign: bool) {
        let name = match self.previous().kind.clone() {
            TokenKind::Identifier(s) => s,
            _ => unreachable!(),
        };
        if self.allow_struct_literal && self.check(&TokenKind::LBrace) {
            self.struct_literal(name);
            return;
        }
        self.named_variable(name, can_assign);
    }
}

/// Compiles `source` into the top-level script function. Interned string
/// constants (identifiers, string literals) are allocated into `heap`.
pub fn compile(source: &str, heap: &mut Heap) -> Result<FunctionChunk, Vec<CompileError>> {
    Compiler::new(source, heap).compile()
}
