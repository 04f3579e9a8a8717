//! Single-pass recursive-descent parser and bytecode emitter.
//!
//! There is no AST: every grammar production emits instructions into the
//! function currently being compiled. Jumps are emitted as placeholders and
//! patched once their target position is known. Macro, block, loop-body,
//! filter-body and call-body compilation switch the emission target to a
//! fresh function inside the same template while the token stream continues
//! uninterrupted.
//!
//! Lexical scopes plan the value-stack slots of one function: a symbol
//! declared by `set`, `with` or a loop prototype receives the next
//! base-relative slot, and scope exit pops exactly the slots it introduced.
//! Scopes never cross function boundaries; a name that does not resolve in
//! the current function's scope chain compiles to an upvalue lookup by name.

use std::rc::Rc;

use crate::bytecode::{
    DEREF_KEYVAL, DEREF_VAL, FuncKind, INCLUDE_JSON, INCLUDE_NONE, INCLUDE_UPVALUE, LOOP_BREAK,
    LOOP_CONTINUE, MAX_PARAMS, Op, Param, Program, Template, TemplateFn, UPVALUE_FIX,
    UPVALUE_OVERRIDE, MAIN,
};
use crate::diagnostic::{self, Phase};
use crate::error::{Error, Result};
use crate::heap::{Heap, ROOT_SCOPE};
use crate::lexer::{Lexer, Tok};
use crate::object::{alloc_dict, alloc_list, alloc_str};
use crate::value::Value;

/// Nesting cap for function definitions (macros inside macros, loop bodies
/// inside loop bodies, ...).
const MAX_NESTED_FUNCTIONS: usize = 128;

/// Cap on `if`/`elif` arms in one chain.
const MAX_BRANCH_ARMS: usize = 1024;

/// Cap on consecutive unary operators.
const MAX_UNARY_CHAIN: usize = 1024;

/// Cap on local symbols in one lexical scope.
const MAX_SCOPE_LOCALS: usize = 256;

/// Upvalue name under which the VM publishes the caller stub.
pub const CALLER: &str = "__caller__";

/// Upvalue name of the loop object inside `for` bodies.
pub const LOOP: &str = "loop";

/// A lexical scope: the symbols declared in one `{% with %}`/branch/loop
/// bracket, plus the base-relative slot watermark.
struct LexScope {
    names: Vec<(String, u32)>,
    /// Next free base-relative slot.
    end: u32,
    /// First scope of a function; name lookup stops here.
    func_root: bool,
    /// ENTER-nesting inside the current function; used to compute `move`
    /// lift levels statically.
    gc_depth: u32,
}

/// A function under construction.
struct FnBuild {
    name: Rc<str>,
    kind: FuncKind,
    prg: Program,
    /// Set when this function is a `recursive` loop body: enables the
    /// sentinel form of break/continue and the `loop(...)` re-entry call.
    loop_info: Option<LoopInfo>,
    /// Inline (non-recursive) loops currently open in this function.
    inline_loops: Vec<InlineLoop>,
}

#[derive(Clone)]
struct LoopInfo {
    body_name: Rc<str>,
    deref: u32,
}

/// Book-keeping for an inline-compiled loop: where break/continue jump and
/// how much stack/scope they unwind.
struct InlineLoop {
    /// `(placeholder position, scopes to exit)` patched to the loop exit.
    break_jumps: Vec<(usize, u32)>,
    /// Same, patched to the per-iteration continue point.
    cont_jumps: Vec<(usize, u32)>,
    /// Scope watermark after the hidden iterator slots and loop symbols.
    base_end: u32,
    /// GC depth of the loop's own scope.
    base_gc: u32,
    /// How many values `ITER_DEREF` pushes per iteration.
    deref: u32,
}

pub struct Parser<'a, 'h> {
    lex: Lexer<'a>,
    src: &'a str,
    unit: String,
    heap: &'h mut Heap,
    funcs: Vec<FnBuild>,
    /// Stack of indices into `funcs`: which function receives emissions.
    cur: Vec<usize>,
    scopes: Vec<LexScope>,
    /// Nonzero once `{% extends %}` was seen; switches the top level into
    /// block-definitions-only mode.
    extends: u32,
    /// Counter for generated function names (`@l0`, `@c1`, ...).
    unnamed: u16,
}

/// Compile template source into a [`Template`].
pub fn compile(heap: &mut Heap, name: &str, src: &str) -> Result<Template> {
    let lex = Lexer::new(name, src)?;
    let mut parser = Parser {
        lex,
        src,
        unit: name.to_string(),
        heap,
        funcs: Vec::new(),
        cur: Vec::new(),
        scopes: Vec::new(),
        extends: 0,
        unnamed: 0,
    };
    parser.run()?;
    let mut template = Template::new(name, Rc::from(src));
    template.functions = parser
        .funcs
        .into_iter()
        .map(|f| TemplateFn {
            name: f.name,
            kind: f.kind,
            program: Rc::new(f.prg),
        })
        .collect();
    Ok(template)
}

impl<'a, 'h> Parser<'a, 'h> {
    // -----------------------------------------------------------------------
    // Error and token helpers
    // -----------------------------------------------------------------------

    fn syntax<T>(&self, detail: &str) -> Result<T> {
        Err(Error::Syntax(diagnostic::message(
            Phase::Parse,
            &self.unit,
            self.src,
            self.lex.offset(),
            detail,
        )))
    }

    fn compile_err<T>(&self, detail: &str) -> Result<T> {
        Err(Error::Compile(diagnostic::message(
            Phase::Parse,
            &self.unit,
            self.src,
            self.lex.offset(),
            detail,
        )))
    }

    fn advance(&mut self) -> Result<()> {
        self.lex.advance()
    }

    fn consume(&mut self, expected: &Tok) -> Result<()> {
        if &self.lex.tok == expected {
            self.advance()
        } else {
            self.syntax(&format!(
                "unexpected token {}, expected {}",
                self.lex.tok.name(),
                expected.name()
            ))
        }
    }

    /// Consume an identifier, also accepting keyword tokens in name position
    /// (attribute and parameter names may spell a keyword).
    fn expect_name(&mut self) -> Result<String> {
        let name = match &self.lex.tok {
            Tok::Ident(s) => s.clone(),
            Tok::For => "for".into(),
            Tok::If => "if".into(),
            Tok::In => "in".into(),
            Tok::Is => "is".into(),
            Tok::Do => "do".into(),
            Tok::Set => "set".into(),
            Tok::With => "with".into(),
            Tok::Move => "move".into(),
            Tok::Block => "block".into(),
            Tok::Call => "call".into(),
            Tok::Filter => "filter".into(),
            Tok::Json => "json".into(),
            Tok::Fix => "fix".into(),
            Tok::Override => "override".into(),
            Tok::Recursive => "recursive".into(),
            Tok::Import => "import".into(),
            Tok::Include => "include".into(),
            Tok::From => "from".into(),
            Tok::As => "as".into(),
            // Literal keywords double as test names (`x is true`).
            Tok::True => "true".into(),
            Tok::False => "false".into(),
            Tok::None => "none".into(),
            other => {
                return self.syntax(&format!("expected an identifier, got {}", other.name()));
            }
        };
        self.advance()?;
        Ok(name)
    }

    /// `%}` terminating the current statement tag.
    fn finish_stmt(&mut self) -> Result<()> {
        self.consume(&Tok::RStmt)
    }

    fn gen_name(&mut self, letter: char) -> Result<Rc<str>> {
        if self.unnamed == u16::MAX {
            return self.syntax("too many generated scopes and blocks");
        }
        let name = format!("@{letter}{}", self.unnamed);
        self.unnamed += 1;
        Ok(Rc::from(name.as_str()))
    }

    // -----------------------------------------------------------------------
    // Emission helpers
    // -----------------------------------------------------------------------

    fn prg(&mut self) -> &mut Program {
        let idx = *self.cur.last().expect("no active function");
        &mut self.funcs[idx].prg
    }

    fn emit(&mut self, op: Op) {
        let at = self.lex.offset() as u32;
        let prg = self.prg();
        prg.ops.push(op);
        prg.spans.push(at);
    }

    /// Reserve an instruction slot for later patching.
    fn put(&mut self) -> usize {
        self.emit(Op::Nop0);
        self.prg().len() - 1
    }

    fn emit_at(&mut self, pos: usize, op: Op) {
        self.prg().ops[pos] = op;
    }

    fn label(&mut self) -> u32 {
        self.prg().len() as u32
    }

    fn add_str(&mut self, s: &str) -> Result<u32> {
        match self.prg().add_str(s) {
            Some(idx) => Ok(idx),
            None => self.syntax("too many string literals in one function"),
        }
    }

    fn add_num(&mut self, n: f64) -> Result<u32> {
        match self.prg().add_num(n) {
            Some(idx) => Ok(idx),
            None => self.syntax("too many number literals in one function"),
        }
    }

    // -----------------------------------------------------------------------
    // Lexical scopes
    // -----------------------------------------------------------------------

    /// Enter a nested scope in the current function.
    fn scope_enter(&mut self, enters_gc: bool) {
        let top = self.scopes.last().expect("no scope");
        let (end, depth) = (top.end, top.gc_depth + u32::from(enters_gc));
        self.scopes.push(LexScope {
            names: Vec::new(),
            end,
            func_root: false,
            gc_depth: depth,
        });
    }

    /// Enter the root scope of a new function.
    fn scope_jump(&mut self) -> Result<()> {
        if self.cur.len() >= MAX_NESTED_FUNCTIONS {
            return self.syntax("too many nested function definitions");
        }
        self.scopes.push(LexScope {
            names: Vec::new(),
            end: 0,
            func_root: true,
            gc_depth: 0,
        });
        Ok(())
    }

    /// Leave the top scope, returning how many slots it introduced.
    fn scope_exit(&mut self) -> u32 {
        let scp = self.scopes.pop().expect("scope underflow");
        scp.names.len() as u32
    }

    /// Find-or-declare `name` in the top scope. `Ok(None)` means a fresh
    /// slot was assigned (the value on TOS becomes the slot).
    fn scope_set(&mut self, name: &str) -> Result<Option<u32>> {
        let top = self.scopes.last().expect("no scope");
        if let Some((_, idx)) = top.names.iter().find(|(n, _)| n == name) {
            return Ok(Some(*idx));
        }
        if top.names.len() >= MAX_SCOPE_LOCALS {
            return self.syntax("too many local symbols in one scope");
        }
        let scp = self.scopes.last_mut().expect("no scope");
        let idx = scp.end;
        scp.end += 1;
        scp.names.push((name.to_string(), idx));
        Ok(None)
    }

    /// Resolve `name` in the current function's scope chain. Returns the
    /// slot and the GC depth of the defining scope.
    fn scope_get(&self, name: &str) -> Option<(u32, u32)> {
        for scp in self.scopes.iter().rev() {
            if let Some((_, idx)) = scp.names.iter().find(|(n, _)| n == name) {
                return Some((*idx, scp.gc_depth));
            }
            if scp.func_root {
                break;
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    fn begin_func(&mut self, name: Rc<str>, kind: FuncKind) -> Result<usize> {
        if self.funcs.iter().any(|f| f.name == name) {
            return self.compile_err(&format!("duplicate function '{name}' in template"));
        }
        self.funcs.push(FnBuild {
            name,
            kind,
            prg: Program::new(),
            loop_info: None,
            inline_loops: Vec::new(),
        });
        let idx = self.funcs.len() - 1;
        self.cur.push(idx);
        self.scope_jump()?;
        Ok(idx)
    }

    fn end_func(&mut self) {
        let popped = self.scope_exit();
        debug_assert_eq!(popped, self.active_param_count());
        self.cur.pop();
    }

    fn active_param_count(&self) -> u32 {
        let idx = *self.cur.last().expect("no active function");
        self.funcs[idx].prg.params.len() as u32
    }

    /// Declare the current function's parameters as its first slots.
    fn declare_params(&mut self) -> Result<()> {
        let idx = *self.cur.last().expect("no active function");
        let names: Vec<Rc<str>> = self.funcs[idx].prg.params.iter().map(|p| p.name.clone()).collect();
        for name in names {
            self.scope_set(&name)?;
        }
        Ok(())
    }

    /// The innermost enclosing loop body, if the current function is one.
    fn loop_info(&self) -> Option<LoopInfo> {
        let idx = *self.cur.last()?;
        self.funcs[idx].loop_info.clone()
    }

    // -----------------------------------------------------------------------
    // Entry
    // -----------------------------------------------------------------------

    fn run(&mut self) -> Result<()> {
        self.begin_func(Rc::from(MAIN), FuncKind::Main)?;
        self.parse_func_body_scope()?;
        match &self.lex.tok {
            Tok::Eof => {}
            other => {
                let name = other.name();
                return self.syntax(&format!("unexpected {name} at top level"));
            }
        }
        self.emit(Op::Ret);
        self.end_func();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scope dispatch
    // -----------------------------------------------------------------------

    /// Parse a statement scope bracketed by ENTER/EXIT, popping its locals
    /// on the way out. Stops at (and does not consume) a scope-ending
    /// keyword or EOF.
    fn parse_enclosed_scope(&mut self) -> Result<()> {
        self.scope_enter(true);
        self.emit(Op::Enter);
        self.dispatch_scope_body()?;
        let n = self.scope_exit();
        if n > 0 {
            self.emit(Op::Pop(n));
        }
        self.emit(Op::Exit);
        Ok(())
    }

    /// Parse the body scope of a function. Unlike nested scopes, the locals
    /// stay on the stack and the GC scope stays open: `RET` reclaims both,
    /// and the topmost local (if any) becomes the function's return value.
    fn parse_func_body_scope(&mut self) -> Result<()> {
        self.scope_enter(true);
        self.emit(Op::Enter);
        self.dispatch_scope_body()?;
        self.scope_exit();
        Ok(())
    }

    /// Whether the parser is emitting into the template's main body.
    fn at_top_level(&self) -> bool {
        self.cur.len() == 1
    }

    /// The statement/text dispatch loop. Returns with the tokenizer sitting
    /// on the scope-ending keyword (its `{%` already consumed) or EOF.
    fn dispatch_scope_body(&mut self) -> Result<()> {
        loop {
            match self.lex.tok.clone() {
                Tok::Eof => return Ok(()),
                Tok::Text(text) => {
                    if self.extends > 0 && self.at_top_level() {
                        // Extends mode: top-level text in the child template
                        // is dropped; the parent renders the page.
                        self.advance()?;
                        continue;
                    }
                    let idx = self.add_str(&text)?;
                    self.emit(Op::LStr(idx));
                    self.emit(Op::Print);
                    self.advance()?;
                }
                Tok::LExp => {
                    if self.extends > 0 && self.at_top_level() {
                        return self.compile_err(
                            "only block definitions are allowed after extends",
                        );
                    }
                    self.advance()?;
                    self.parse_expr()?;
                    self.emit(Op::Print);
                    self.consume(&Tok::RExp)?;
                }
                Tok::LStmt => {
                    self.advance()?;
                    if self.extends > 0
                        && self.at_top_level()
                        && !matches!(self.lex.tok, Tok::Block | Tok::Extends)
                        && !self.is_scope_end()
                    {
                        return self.compile_err(
                            "only block definitions are allowed after extends",
                        );
                    }
                    match self.lex.tok.clone() {
                        Tok::If => self.parse_branch()?,
                        Tok::For => self.parse_for()?,
                        Tok::Macro => self.parse_macro()?,
                        Tok::Block => self.parse_block()?,
                        Tok::Call => self.parse_call()?,
                        Tok::Filter => self.parse_filter_stmt()?,
                        Tok::Set => self.parse_set()?,
                        Tok::With => self.parse_with()?,
                        Tok::Do => self.parse_do()?,
                        Tok::Move => self.parse_move()?,
                        Tok::Upvalue => self.parse_upvalue_stmt()?,
                        Tok::Include => self.parse_include()?,
                        Tok::Import => self.parse_import()?,
                        Tok::From => self.parse_from()?,
                        Tok::Extends => self.parse_extends()?,
                        Tok::Continue => self.parse_loop_control(false)?,
                        Tok::Break => self.parse_loop_control(true)?,
                        _ if self.is_scope_end() => return Ok(()),
                        other => {
                            return self.syntax(&format!(
                                "unexpected {} at statement position",
                                other.name()
                            ));
                        }
                    }
                }
                other => {
                    return self.syntax(&format!("unexpected {}", other.name()));
                }
            }
        }
    }

    /// Tokens that end the enclosing scope (left for the caller).
    fn is_scope_end(&self) -> bool {
        matches!(
            self.lex.tok,
            Tok::Elif
                | Tok::Else
                | Tok::EndIf
                | Tok::EndFor
                | Tok::EndMacro
                | Tok::EndBlock
                | Tok::EndCall
                | Tok::EndFilter
                | Tok::EndSet
                | Tok::EndWith
                | Tok::EndUpvalue
                | Tok::EndInclude
                | Tok::EndImport
        )
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    /// `{% if %} ... {% elif %} ... {% else %} ... {% endif %}`
    fn parse_branch(&mut self) -> Result<()> {
        self.consume(&Tok::If)?;
        self.parse_expr()?;
        let mut cond_jmp = Some(self.put());
        self.finish_stmt()?;
        self.parse_enclosed_scope()?;

        let mut end_jmps: Vec<usize> = Vec::new();
        let mut has_else = false;
        loop {
            if end_jmps.len() >= MAX_BRANCH_ARMS {
                return self.syntax("too many branch arms in one if chain");
            }
            if !has_else {
                end_jmps.push(self.put());
            }
            match self.lex.tok.clone() {
                Tok::EndIf => {
                    if let Some(pos) = cond_jmp.take() {
                        let here = self.label();
                        self.emit_at(pos, Op::Jf(here));
                    }
                    self.advance()?;
                    self.finish_stmt()?;
                    break;
                }
                Tok::Elif => {
                    if has_else {
                        return self.syntax("elif after else");
                    }
                    let pos = cond_jmp.take().expect("elif without condition jump");
                    let here = self.label();
                    self.emit_at(pos, Op::Jf(here));
                    self.advance()?;
                    self.parse_expr()?;
                    cond_jmp = Some(self.put());
                    self.finish_stmt()?;
                    self.parse_enclosed_scope()?;
                }
                Tok::Else => {
                    if has_else {
                        return self.syntax("duplicate else");
                    }
                    let pos = cond_jmp.take().expect("else without condition jump");
                    let here = self.label();
                    self.emit_at(pos, Op::Jf(here));
                    self.advance()?;
                    self.finish_stmt()?;
                    has_else = true;
                    self.parse_enclosed_scope()?;
                }
                other => {
                    return self.syntax(&format!("unexpected {} in if chain", other.name()));
                }
            }
        }
        let end = self.label();
        for pos in end_jmps {
            self.emit_at(pos, Op::Jmp(end));
        }
        Ok(())
    }

    /// `{% for [key,] val in expr [if cond] [recursive] %} ... {% else %} ...
    /// {% endfor %}`
    ///
    /// Plain loops compile inline: the iteration protocol runs in the
    /// current function, the loop symbols live in a hidden lexical scope,
    /// and break/continue jump out (unwinding scopes with `JMPC`).
    /// `recursive` loops compile their body as a nested function returning
    /// a continue/break sentinel, so that `loop(...)` can re-enter it; the
    /// body then sees only its own parameters.
    fn parse_for(&mut self) -> Result<()> {
        self.consume(&Tok::For)?;
        let first = self.expect_name()?;
        let (key, val) = if self.lex.tok == Tok::Comma {
            self.advance()?;
            let second = self.expect_name()?;
            (Some(first), second)
        } else {
            (None, first)
        };
        self.consume(&Tok::In)?;

        // A `_` in key position is a placeholder: iterate values only.
        let key = key.filter(|k| k != "_");
        let deref = if key.is_some() { DEREF_KEYVAL } else { DEREF_VAL };

        // The compilation strategy depends on the `recursive` flag, which
        // sits after the loop filter in the tag; peek ahead for it.
        let recursive = self.lex.stmt_ends_with_recursive();

        // The iterable. The ternary operator is not allowed here (its `if`
        // would swallow the loop filter).
        self.parse_logic()?;

        if recursive {
            self.parse_for_recursive(key, val, deref)
        } else {
            self.parse_for_inline(key, val, deref)
        }
    }

    fn parse_for_inline(&mut self, key: Option<String>, val: String, deref: u32) -> Result<()> {
        let loop_idx = self.add_str(LOOP)?;

        // Empty check before anything is set up: the else branch starts
        // with just the iterable on the stack.
        self.emit(Op::TPush(1));
        let empty_jmp = self.put();

        // Hidden loop scope: the iterable and its iterator occupy two
        // anonymous slots, followed by the loop symbols.
        self.scope_enter(true);
        self.emit(Op::Enter);
        let obj_name = self.gen_name('o')?;
        self.scope_set(&obj_name)?;
        self.emit(Op::IterStart);
        let iter_name = self.gen_name('i')?;
        self.scope_set(&iter_name)?;

        let head = self.label();
        self.emit(Op::IterHas);
        let exit_jmp = self.put();
        self.emit(Op::IterDeref(deref));
        for name in key.iter().chain(std::iter::once(&val)) {
            self.scope_set(name)?;
        }

        // Loop filter: a false condition continues with the next element.
        let mut filter_jmp = None;
        if self.lex.tok == Tok::If {
            self.advance()?;
            self.parse_logic()?;
            filter_jmp = Some(self.put());
        }
        self.finish_stmt()?;

        let scope = self.scopes.last().expect("no scope");
        let (base_end, base_gc) = (scope.end, scope.gc_depth);
        let fidx = *self.cur.last().expect("no active function");
        self.funcs[fidx].inline_loops.push(InlineLoop {
            break_jumps: Vec::new(),
            cont_jumps: Vec::new(),
            base_end,
            base_gc,
            deref,
        });

        self.parse_enclosed_scope()?;

        let ctx = self.funcs[fidx]
            .inline_loops
            .pop()
            .expect("inline loop context vanished");

        // Continue point: drop the dereferenced element and advance.
        let cont = self.label();
        if let Some(pos) = filter_jmp {
            self.emit_at(pos, Op::Jf(cont));
        }
        for (pos, scopes) in ctx.cont_jumps {
            let op = if scopes == 0 { Op::Jmp(cont) } else { Op::Jmpc(scopes, cont) };
            self.emit_at(pos, op);
        }
        self.emit(Op::Pop(deref));
        self.emit(Op::IterMove);
        self.emit(Op::Jmp(head));

        // Exit point: the loop upvalue and the (object, iterator) pair go.
        let exit = self.label();
        self.emit_at(exit_jmp, Op::Jf(exit));
        for (pos, scopes) in ctx.break_jumps {
            let op = if scopes == 0 { Op::Jmp(exit) } else { Op::Jmpc(scopes, exit) };
            self.emit_at(pos, op);
        }
        self.emit(Op::UpvalueDel(loop_idx));
        self.emit(Op::Pop(2));
        self.scope_exit();
        self.emit(Op::Exit);

        // Optional else branch, entered only for an empty iterable.
        let done_jmp = self.put();
        let else_label = self.label();
        self.emit_at(empty_jmp, Op::Jept(else_label));
        self.emit(Op::Pop(1));
        self.finish_for_tail()?;
        let done = self.label();
        self.emit_at(done_jmp, Op::Jmp(done));
        Ok(())
    }

    fn parse_for_recursive(&mut self, key: Option<String>, val: String, deref: u32) -> Result<()> {
        let body_name = self.gen_name('l')?;
        let body_idx = self.add_str(&body_name)?;
        let loop_idx = self.add_str(LOOP)?;

        self.emit(Op::TPush(1));
        let empty_jmp = self.put();

        // Compile the body as a nested function. Tokens continue inline;
        // only the emission target changes.
        let fidx = self.begin_func(body_name.clone(), FuncKind::Block)?;
        for name in key.iter().chain(std::iter::once(&val)) {
            if self.funcs[fidx].prg.params.len() >= MAX_PARAMS {
                return self.syntax("too many parameters");
            }
            self.funcs[fidx].prg.params.push(Param {
                name: Rc::from(name.as_str()),
                default: Value::None,
            });
        }
        self.declare_params()?;

        // Loop filter: evaluated inside the body; a false condition skips
        // to the sentinel return.
        let mut filter_jmp = None;
        if self.lex.tok == Tok::If {
            self.advance()?;
            self.parse_logic()?;
            filter_jmp = Some(self.put());
        }
        self.consume(&Tok::Recursive)?;
        self.funcs[fidx].loop_info = Some(LoopInfo {
            body_name: body_name.clone(),
            deref,
        });
        self.finish_stmt()?;

        self.parse_func_body_scope()?;
        if let Some(pos) = filter_jmp {
            let here = self.label();
            self.emit_at(pos, Op::Jf(here));
        }
        self.emit(Op::LImm(LOOP_CONTINUE));
        self.emit(Op::Ret);
        self.end_func();

        // Back in the enclosing function: drive the iteration.
        self.emit_loop_drive(body_idx, loop_idx, deref);

        let done_jmp = self.put();
        let else_label = self.label();
        self.emit_at(empty_jmp, Op::Jept(else_label));
        self.emit(Op::Pop(1));
        self.finish_for_tail()?;
        let done = self.label();
        self.emit_at(done_jmp, Op::Jmp(done));
        Ok(())
    }

    /// The `{% else %} ... {% endfor %}` or `{% endfor %}` tail of a loop.
    fn finish_for_tail(&mut self) -> Result<()> {
        match self.lex.tok.clone() {
            Tok::Else => {
                self.advance()?;
                self.finish_stmt()?;
                self.parse_enclosed_scope()?;
                self.consume(&Tok::EndFor)?;
                self.finish_stmt()
            }
            Tok::EndFor => {
                self.advance()?;
                self.finish_stmt()
            }
            other => self.syntax(&format!("unexpected {} after for body", other.name())),
        }
    }

    /// Emit the iteration-protocol sequence that calls `body` per element.
    /// On entry the iterable sits at TOS; on exit it is consumed.
    fn emit_loop_drive(&mut self, body_idx: u32, loop_idx: u32, deref: u32) {
        self.emit(Op::IterStart);
        let head = self.label();
        self.emit(Op::IterHas);
        let exit_a = self.put();
        self.emit(Op::IterDeref(deref));
        self.emit(Op::Call(body_idx, deref));
        let exit_b = self.put();
        self.emit(Op::IterMove);
        self.emit(Op::Jmp(head));
        let exit = self.label();
        self.emit_at(exit_a, Op::Jf(exit));
        self.emit_at(exit_b, Op::Jt(exit));
        self.emit(Op::UpvalueDel(loop_idx));
        self.emit(Op::Pop(2));
    }

    /// `{% continue %}` / `{% break %}`; only valid inside a loop body.
    ///
    /// Inline loops unwind the stack and GC scopes opened since the loop
    /// head and jump to the continue/exit point; recursive loop bodies
    /// return the matching sentinel.
    fn parse_loop_control(&mut self, is_break: bool) -> Result<()> {
        self.advance()?;
        self.finish_stmt()?;
        let fidx = *self.cur.last().expect("no active function");
        if let Some(ctx) = self.funcs[fidx].inline_loops.last() {
            let (base_end, base_gc, deref) = (ctx.base_end, ctx.base_gc, ctx.deref);
            let scope = self.scopes.last().expect("no scope");
            let extra = scope.end - base_end;
            let scopes_out = scope.gc_depth - base_gc;
            let pops = extra + if is_break { deref } else { 0 };
            if pops > 0 {
                self.emit(Op::Pop(pops));
            }
            let pos = self.put();
            let ctx = self.funcs[fidx]
                .inline_loops
                .last_mut()
                .expect("inline loop context vanished");
            if is_break {
                ctx.break_jumps.push((pos, scopes_out));
            } else {
                ctx.cont_jumps.push((pos, scopes_out));
            }
            return Ok(());
        }
        if self.loop_info().is_some() {
            let sentinel = if is_break { LOOP_BREAK } else { LOOP_CONTINUE };
            self.emit(Op::LImm(sentinel));
            self.emit(Op::Ret);
            return Ok(());
        }
        self.syntax("break/continue outside of a loop body")
    }

    /// `{% macro name(par [= const], ...) %} body {% endmacro %}`
    fn parse_macro(&mut self) -> Result<()> {
        self.consume(&Tok::Macro)?;
        let name = self.expect_name()?;
        let fidx = self.begin_func(Rc::from(name.as_str()), FuncKind::Macro)?;
        if self.lex.tok == Tok::LPar {
            self.parse_prototype(fidx)?;
        }
        self.declare_params()?;
        self.finish_stmt()?;
        self.parse_func_body_scope()?;
        self.emit(Op::Ret);
        self.end_func();
        self.consume(&Tok::EndMacro)?;
        self.finish_stmt()
    }

    /// Parse `(a, b = const, ...)` into the function's parameter prototype.
    fn parse_prototype(&mut self, fidx: usize) -> Result<()> {
        self.consume(&Tok::LPar)?;
        if self.lex.tok == Tok::RPar {
            return self.advance();
        }
        loop {
            let par = self.expect_name()?;
            let default = if self.lex.tok == Tok::Assign {
                self.advance()?;
                self.parse_constexpr()?
            } else {
                Value::None
            };
            if self.funcs[fidx].prg.params.len() >= MAX_PARAMS {
                return self.syntax("too many parameters (max 32)");
            }
            self.funcs[fidx].prg.params.push(Param {
                name: Rc::from(par.as_str()),
                default,
            });
            match self.lex.tok {
                Tok::Comma => self.advance()?,
                Tok::RPar => {
                    self.advance()?;
                    break;
                }
                _ => return self.syntax("expected ',' or ')' in parameter list"),
            }
        }
        Ok(())
    }

    /// `{% block name %} body {% endblock %}`: a zero-argument function;
    /// outside extends mode an inline call renders it in place.
    fn parse_block(&mut self) -> Result<()> {
        self.consume(&Tok::Block)?;
        let name = self.expect_name()?;
        if self.extends == 0 {
            let idx = self.add_str(&name)?;
            self.emit(Op::Call(idx, 0));
            self.emit(Op::Pop(1));
        }
        self.begin_func(Rc::from(name.as_str()), FuncKind::Block)?;
        self.finish_stmt()?;
        self.parse_func_body_scope()?;
        self.emit(Op::Ret);
        self.end_func();
        self.consume(&Tok::EndBlock)?;
        self.finish_stmt()
    }

    /// `{% call[(pars)] target(args) %} body {% endcall %}`
    ///
    /// The body compiles into an anonymous function; `__caller__` names it
    /// for the duration of the target call, and `caller()` inside the target
    /// invokes it.
    fn parse_call(&mut self) -> Result<()> {
        self.consume(&Tok::Call)?;
        let body_name = self.gen_name('c')?;

        // Optional caller parameters: `{% call(a, b) target(...) %}`.
        let mut pars: Vec<(String, Value)> = Vec::new();
        if self.lex.tok == Tok::LPar {
            self.advance()?;
            if self.lex.tok != Tok::RPar {
                loop {
                    let par = self.expect_name()?;
                    let default = if self.lex.tok == Tok::Assign {
                        self.advance()?;
                        self.parse_constexpr()?
                    } else {
                        Value::None
                    };
                    pars.push((par, default));
                    match self.lex.tok {
                        Tok::Comma => self.advance()?,
                        Tok::RPar => break,
                        _ => return self.syntax("expected ',' or ')' in caller parameters"),
                    }
                }
            }
            self.consume(&Tok::RPar)?;
        }

        let target = self.expect_name()?;

        // Publish the caller stub before invoking the target.
        let body_str = self.add_str(&body_name)?;
        let caller_idx = self.add_str(CALLER)?;
        self.emit(Op::LStr(body_str));
        self.emit(Op::UpvalueSet(caller_idx));

        if self.lex.tok != Tok::LPar {
            return self.syntax("call target must be invoked with '(...)'");
        }
        let target_idx = self.add_str(&target)?;
        let argc = self.parse_invoke_args()?;
        self.emit(Op::Call(target_idx, argc));
        self.emit(Op::Pop(1));
        self.emit(Op::UpvalueDel(caller_idx));
        self.finish_stmt()?;

        // The body function itself.
        let fidx = self.begin_func(body_name, FuncKind::Macro)?;
        for (name, default) in pars {
            if self.funcs[fidx].prg.params.len() >= MAX_PARAMS {
                return self.syntax("too many parameters (max 32)");
            }
            self.funcs[fidx].prg.params.push(Param {
                name: Rc::from(name.as_str()),
                default,
            });
        }
        self.declare_params()?;
        self.parse_func_body_scope()?;
        self.emit(Op::Ret);
        self.end_func();
        self.consume(&Tok::EndCall)?;
        self.finish_stmt()
    }

    /// `{% filter name[(args)] %} body {% endfilter %}`
    ///
    /// The body renders into a capture buffer whose text becomes the
    /// filter's first argument; the filtered result is printed.
    fn parse_filter_stmt(&mut self) -> Result<()> {
        self.consume(&Tok::Filter)?;
        let name = self.expect_name()?;
        let name_idx = self.add_str(&name)?;
        let body_name = self.gen_name('f')?;
        let body_idx = self.add_str(&body_name)?;

        // The captured text is the first (piped) argument, so the capture
        // slot precedes the explicit arguments.
        self.emit(Op::Capture(body_idx));
        let argc = if self.lex.tok == Tok::LPar {
            self.parse_invoke_args()?
        } else {
            0
        };
        self.emit(Op::Call(name_idx, argc + 1));
        self.emit(Op::Print);
        self.finish_stmt()?;

        self.begin_func(body_name, FuncKind::Block)?;
        self.parse_func_body_scope()?;
        self.emit(Op::Ret);
        self.end_func();
        self.consume(&Tok::EndFilter)?;
        self.finish_stmt()
    }

    /// `{% set name = expr %}` or `{% set name %} body {% endset %}`
    fn parse_set(&mut self) -> Result<()> {
        self.consume(&Tok::Set)?;
        let name = self.expect_name()?;
        match self.lex.tok {
            Tok::Assign => {
                self.advance()?;
                self.parse_expr()?;
                self.store_symbol(&name)?;
                self.finish_stmt()
            }
            Tok::RStmt => {
                // Scope-based set: the body renders into a capture buffer.
                self.advance()?;
                let body_name = self.gen_name('s')?;
                let body_idx = self.add_str(&body_name)?;
                self.emit(Op::Capture(body_idx));
                self.store_symbol(&name)?;
                self.begin_func(body_name, FuncKind::Block)?;
                self.parse_func_body_scope()?;
                self.emit(Op::Ret);
                self.end_func();
                self.consume(&Tok::EndSet)?;
                self.finish_stmt()
            }
            _ => self.syntax("set expects '=' or a scope-based body"),
        }
    }

    /// Bind TOS to `name`: overwrite a visible local, otherwise declare a
    /// fresh slot (the value stays in place as the new slot).
    fn store_symbol(&mut self, name: &str) -> Result<()> {
        if let Some((idx, _)) = self.scope_get(name) {
            self.emit(Op::Store(idx));
            return Ok(());
        }
        match self.scope_set(name)? {
            Some(idx) => self.emit(Op::Store(idx)),
            None => {} // fresh slot; the value on TOS is the slot
        }
        Ok(())
    }

    /// `{% with [name = expr, ...] %} body {% endwith %}`
    fn parse_with(&mut self) -> Result<()> {
        self.consume(&Tok::With)?;
        self.scope_enter(true);
        self.emit(Op::Enter);
        if self.lex.tok != Tok::RStmt {
            loop {
                let name = self.expect_name()?;
                self.consume(&Tok::Assign)?;
                self.parse_expr()?;
                // Always a fresh binding local to the with scope.
                match self.scope_set(&name)? {
                    Some(idx) => self.emit(Op::Store(idx)),
                    None => {}
                }
                match self.lex.tok {
                    Tok::Comma => self.advance()?,
                    _ => break,
                }
            }
        }
        self.finish_stmt()?;
        self.dispatch_scope_body()?;
        let n = self.scope_exit();
        if n > 0 {
            self.emit(Op::Pop(n));
        }
        self.emit(Op::Exit);
        self.consume(&Tok::EndWith)?;
        self.finish_stmt()
    }

    /// `{% do expr %}`: evaluate and discard.
    fn parse_do(&mut self) -> Result<()> {
        self.consume(&Tok::Do)?;
        self.parse_expr()?;
        self.emit(Op::Pop(1));
        self.finish_stmt()
    }

    /// `{% move dst = src %}`: lift `src`'s object to `dst`'s scope level,
    /// then rebind `dst`.
    fn parse_move(&mut self) -> Result<()> {
        self.consume(&Tok::Move)?;
        let dst = self.expect_name()?;
        self.consume(&Tok::Assign)?;
        let src = self.expect_name()?;
        let Some((dst_idx, dst_depth)) = self.scope_get(&dst) else {
            return self.compile_err(&format!("move destination '{dst}' is not a local symbol"));
        };
        let Some((src_idx, src_depth)) = self.scope_get(&src) else {
            return self.compile_err(&format!("move source '{src}' is not a local symbol"));
        };
        let levels = src_depth.saturating_sub(dst_depth);
        if levels > 0 {
            self.emit(Op::Lift(src_idx, levels));
        }
        self.emit(Op::Move(dst_idx, src_idx));
        self.finish_stmt()
    }

    /// `{% upvalue name = expr %} body {% endupvalue %}`
    fn parse_upvalue_stmt(&mut self) -> Result<()> {
        self.consume(&Tok::Upvalue)?;
        let name = self.expect_name()?;
        let name_idx = self.add_str(&name)?;
        self.consume(&Tok::Assign)?;
        self.parse_expr()?;
        self.emit(Op::UpvalueSet(name_idx));
        self.finish_stmt()?;
        self.parse_enclosed_scope()?;
        self.emit(Op::UpvalueDel(name_idx));
        self.consume(&Tok::EndUpvalue)?;
        self.finish_stmt()
    }

    /// `{% include expr %}`, `{% include expr upvalue %} ... {% endinclude %}`
    /// or `{% include expr json expr %} ... {% endinclude %}`
    fn parse_include(&mut self) -> Result<()> {
        self.consume(&Tok::Include)?;
        self.parse_expr()?;
        let (mode, count) = match self.lex.tok.clone() {
            Tok::RStmt => {
                self.advance()?;
                (INCLUDE_NONE, 0)
            }
            Tok::Upvalue => {
                self.advance()?;
                self.finish_stmt()?;
                let count = self.parse_include_body()?;
                self.consume(&Tok::EndInclude)?;
                self.finish_stmt()?;
                (INCLUDE_UPVALUE, count)
            }
            Tok::Json => {
                self.advance()?;
                self.parse_expr()?;
                self.finish_stmt()?;
                let count = self.parse_include_body()?;
                self.consume(&Tok::EndInclude)?;
                self.finish_stmt()?;
                (INCLUDE_JSON, count)
            }
            other => {
                return self.syntax(&format!("unexpected {} in include", other.name()));
            }
        };
        self.emit(Op::Include(mode, count));
        Ok(())
    }

    /// The `{% upvalue name = expr [fix|override] %}` entries between
    /// `include` and `endinclude`. Each entry pushes (name, value, option).
    fn parse_include_body(&mut self) -> Result<u32> {
        let mut count = 0u32;
        loop {
            // Only whitespace may separate the entries.
            while let Tok::Text(t) = &self.lex.tok {
                if !t.trim().is_empty() {
                    return self.syntax("only upvalue entries are allowed inside include");
                }
                self.advance()?;
            }
            self.consume(&Tok::LStmt)?;
            match self.lex.tok {
                Tok::Upvalue => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    let name_idx = self.add_str(&name)?;
                    self.emit(Op::LStr(name_idx));
                    self.consume(&Tok::Assign)?;
                    self.parse_expr()?;
                    let opt = match self.lex.tok {
                        Tok::Fix => {
                            self.advance()?;
                            UPVALUE_FIX
                        }
                        Tok::Override => {
                            self.advance()?;
                            UPVALUE_OVERRIDE
                        }
                        _ => UPVALUE_OVERRIDE,
                    };
                    self.emit(Op::LImm(opt));
                    self.finish_stmt()?;
                    count += 1;
                }
                _ => return Ok(count),
            }
        }
    }

    /// `{% import expr as name %}`: bind the imported template object.
    fn parse_import(&mut self) -> Result<()> {
        self.consume(&Tok::Import)?;
        self.parse_expr()?;
        self.consume(&Tok::As)?;
        let name = self.expect_name()?;
        let name_idx = self.add_str(&name)?;
        self.emit(Op::Import(name_idx));
        self.finish_stmt()
    }

    /// `{% from expr import a [as x], b, ... %}`: bind selected macros.
    fn parse_from(&mut self) -> Result<()> {
        self.consume(&Tok::From)?;
        self.parse_expr()?;
        self.consume(&Tok::Import)?;
        let mut count = 0u32;
        loop {
            let sym = self.expect_name()?;
            let alias = if self.lex.tok == Tok::As {
                self.advance()?;
                self.expect_name()?
            } else {
                sym.clone()
            };
            let sym_idx = self.add_str(&sym)?;
            let alias_idx = self.add_str(&alias)?;
            self.emit(Op::LStr(sym_idx));
            self.emit(Op::LStr(alias_idx));
            count += 1;
            match self.lex.tok {
                Tok::Comma => self.advance()?,
                Tok::RStmt => {
                    self.advance()?;
                    break;
                }
                _ => return self.syntax("expected ',' or '%}' in from-import"),
            }
        }
        self.emit(Op::ImportSymbol(count));
        Ok(())
    }

    /// `{% extends expr %}`
    fn parse_extends(&mut self) -> Result<()> {
        self.consume(&Tok::Extends)?;
        if !self.at_top_level() {
            return self.compile_err("extends is only allowed at the template top level");
        }
        self.parse_expr()?;
        self.emit(Op::Extends);
        self.finish_stmt()?;
        self.extends += 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    /// Full expression: ternary over the logic chain.
    fn parse_expr(&mut self) -> Result<()> {
        self.parse_logic()?;
        if self.lex.tok == Tok::If {
            // `a if c else b`
            self.advance()?;
            self.parse_logic()?;
            let keep = self.put();
            self.consume(&Tok::Else)?;
            self.emit(Op::Pop(1));
            self.parse_expr()?;
            let here = self.label();
            self.emit_at(keep, Op::Jt(here));
        }
        Ok(())
    }

    /// `or` / `and` with short-circuit jumps.
    fn parse_logic(&mut self) -> Result<()> {
        self.parse_and()?;
        let mut jumps = Vec::new();
        while self.lex.tok == Tok::Or {
            self.advance()?;
            jumps.push(self.put());
            self.parse_and()?;
        }
        let here = self.label();
        for pos in jumps {
            self.emit_at(pos, Op::Jlt(here));
        }
        Ok(())
    }

    fn parse_and(&mut self) -> Result<()> {
        self.parse_not()?;
        let mut jumps = Vec::new();
        while self.lex.tok == Tok::And {
            self.advance()?;
            jumps.push(self.put());
            self.parse_not()?;
        }
        let here = self.label();
        for pos in jumps {
            self.emit_at(pos, Op::Jlf(here));
        }
        Ok(())
    }

    /// `not` binding looser than comparisons (`not a == b` negates the
    /// comparison).
    fn parse_not(&mut self) -> Result<()> {
        if self.lex.tok == Tok::Not {
            self.advance()?;
            self.parse_not()?;
            self.emit(Op::Not);
            return Ok(());
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<()> {
        self.parse_term()?;
        loop {
            let op = match self.lex.tok {
                Tok::EqOp => Op::Eq,
                Tok::NeOp => Op::Ne,
                Tok::Lt => Op::Lt,
                Tok::Le => Op::Le,
                Tok::Gt => Op::Gt,
                Tok::Ge => Op::Ge,
                Tok::In => Op::In,
                Tok::NotIn => Op::Nin,
                Tok::Is => {
                    self.advance()?;
                    self.parse_test(false)?;
                    continue;
                }
                Tok::IsNot => {
                    self.advance()?;
                    self.parse_test(true)?;
                    continue;
                }
                _ => break,
            };
            self.advance()?;
            self.parse_term()?;
            self.emit(op);
        }
        Ok(())
    }

    /// `a is test[(args)]`: the tested value is the test's first argument.
    fn parse_test(&mut self, negate: bool) -> Result<()> {
        let name = self.expect_name()?;
        let name_idx = self.add_str(&name)?;
        let argc = if self.lex.tok == Tok::LPar {
            self.parse_invoke_args()?
        } else {
            0
        };
        self.emit(Op::Call(name_idx, argc + 1));
        if negate {
            self.emit(Op::Not);
        }
        Ok(())
    }

    fn parse_term(&mut self) -> Result<()> {
        self.parse_factor()?;
        loop {
            let op = match self.lex.tok {
                Tok::Add => Op::Add,
                Tok::Sub => Op::Sub,
                Tok::Cat => Op::Cat,
                _ => break,
            };
            self.advance()?;
            self.parse_factor()?;
            self.emit(op);
        }
        Ok(())
    }

    fn parse_factor(&mut self) -> Result<()> {
        self.parse_power()?;
        loop {
            let op = match self.lex.tok {
                Tok::Mul => Op::Mul,
                Tok::Div => Op::Div,
                Tok::DivTrunc => Op::DivTrunc,
                Tok::Mod => Op::Mod,
                _ => break,
            };
            self.advance()?;
            self.parse_power()?;
            self.emit(op);
        }
        Ok(())
    }

    /// `**` is right-associative.
    fn parse_power(&mut self) -> Result<()> {
        self.parse_unary()?;
        if self.lex.tok == Tok::Pow {
            self.advance()?;
            self.parse_power()?;
            self.emit(Op::Pow);
        }
        Ok(())
    }

    fn parse_unary(&mut self) -> Result<()> {
        let mut ops: Vec<Op> = Vec::new();
        loop {
            match self.lex.tok {
                Tok::Not => ops.push(Op::Not),
                Tok::Sub => ops.push(Op::Neg),
                Tok::LenOp => ops.push(Op::Len),
                Tok::Add => {} // unary plus is the identity
                _ => break,
            }
            if ops.len() > MAX_UNARY_CHAIN {
                return self.syntax("too many unary operators");
            }
            self.advance()?;
        }
        self.parse_postfix()?;
        for op in ops.into_iter().rev() {
            self.emit(op);
        }
        Ok(())
    }

    /// Atoms plus the postfix chain: `.name`, `[expr]`, `(args)`, `| filter`.
    fn parse_postfix(&mut self) -> Result<()> {
        match self.lex.tok.clone() {
            Tok::Ident(name) => {
                self.advance()?;
                if self.lex.tok == Tok::LPar {
                    self.parse_free_call(&name)?;
                } else {
                    self.load_symbol(&name)?;
                }
            }
            _ => self.parse_atom()?,
        }
        loop {
            match self.lex.tok.clone() {
                Tok::Dot => {
                    self.advance()?;
                    let attr = self.expect_name()?;
                    if self.lex.tok == Tok::LPar {
                        let idx = self.add_str(&attr)?;
                        let argc = self.parse_invoke_args()?;
                        self.emit(Op::AttrCall(idx, argc));
                    } else {
                        let idx = self.add_str(&attr)?;
                        self.emit(Op::LStr(idx));
                        self.emit(Op::AttrGet);
                    }
                }
                Tok::LSqr => {
                    self.advance()?;
                    self.parse_expr()?;
                    self.consume(&Tok::RSqr)?;
                    self.emit(Op::AttrGet);
                }
                Tok::Pipe => {
                    self.advance()?;
                    let filter = self.expect_name()?;
                    let idx = self.add_str(&filter)?;
                    let argc = if self.lex.tok == Tok::LPar {
                        self.parse_invoke_args()?
                    } else {
                        0
                    };
                    self.emit(Op::Call(idx, argc + 1));
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// A call to a bare name. Inside a recursive loop body, `loop(x)`
    /// re-enters the iteration with the same body function.
    fn parse_free_call(&mut self, name: &str) -> Result<()> {
        if name == LOOP
            && let Some(info) = self.loop_info()
        {
            let argc = self.parse_invoke_args()?;
            if argc != 1 {
                return self.syntax("recursive loop() takes exactly one iterable");
            }
            let body_idx = self.add_str(&info.body_name)?;
            let loop_idx = self.add_str(LOOP)?;
            self.emit(Op::TPush(1));
            let empty_jmp = self.put();
            self.emit_loop_drive(body_idx, loop_idx, info.deref);
            let done_jmp = self.put();
            let empty = self.label();
            self.emit_at(empty_jmp, Op::Jept(empty));
            self.emit(Op::Pop(1));
            let done = self.label();
            self.emit_at(done_jmp, Op::Jmp(done));
            // The expression value of loop() is empty text.
            let empty_str = self.add_str("")?;
            self.emit(Op::LStr(empty_str));
            return Ok(());
        }
        let idx = self.add_str(name)?;
        let argc = self.parse_invoke_args()?;
        self.emit(Op::Call(idx, argc));
        Ok(())
    }

    /// Load a plain name: a local slot or an upvalue lookup.
    fn load_symbol(&mut self, name: &str) -> Result<()> {
        if let Some((idx, _)) = self.scope_get(name) {
            self.emit(Op::BPush(idx));
        } else {
            let idx = self.add_str(name)?;
            self.emit(Op::UpvalueGet(idx));
        }
        Ok(())
    }

    /// `( arg, ... )`: returns the argument count.
    fn parse_invoke_args(&mut self) -> Result<u32> {
        self.consume(&Tok::LPar)?;
        if self.lex.tok == Tok::RPar {
            self.advance()?;
            return Ok(0);
        }
        let mut argc = 0u32;
        loop {
            self.parse_expr()?;
            argc += 1;
            match self.lex.tok {
                Tok::Comma => self.advance()?,
                Tok::RPar => {
                    self.advance()?;
                    break;
                }
                _ => return self.syntax("expected ',' or ')' in argument list"),
            }
        }
        Ok(argc)
    }

    fn parse_atom(&mut self) -> Result<()> {
        match self.lex.tok.clone() {
            Tok::Num(n) => {
                if n == 0.0 {
                    self.emit(Op::LZero);
                } else {
                    let idx = self.add_num(n)?;
                    self.emit(Op::LNum(idx));
                }
                self.advance()
            }
            Tok::Str(s) => {
                let idx = self.add_str(&s)?;
                self.emit(Op::LStr(idx));
                self.advance()
            }
            Tok::True => {
                self.emit(Op::LTrue);
                self.advance()
            }
            Tok::False => {
                self.emit(Op::LFalse);
                self.advance()
            }
            Tok::None => {
                self.emit(Op::LNone);
                self.advance()
            }
            Tok::LSqr => self.parse_list(),
            Tok::LBra => self.parse_dict(),
            Tok::LPar => self.parse_group_or_list(),
            other => self.syntax(&format!("unexpected {} in expression", other.name())),
        }
    }

    /// `[ e, ... ]`
    fn parse_list(&mut self) -> Result<()> {
        self.consume(&Tok::LSqr)?;
        self.emit(Op::LList);
        if self.lex.tok == Tok::RSqr {
            return self.advance();
        }
        loop {
            self.parse_expr()?;
            self.emit(Op::AttrPush);
            match self.lex.tok {
                Tok::Comma => self.advance()?,
                Tok::RSqr => {
                    self.advance()?;
                    break;
                }
                _ => return self.syntax("expected ',' or ']' in list literal"),
            }
        }
        Ok(())
    }

    /// `{ key: value, ... }`
    fn parse_dict(&mut self) -> Result<()> {
        self.consume(&Tok::LBra)?;
        self.emit(Op::LDict);
        if self.lex.tok == Tok::RBra {
            return self.advance();
        }
        loop {
            self.parse_expr()?;
            self.consume(&Tok::Colon)?;
            self.parse_expr()?;
            self.emit(Op::AttrSet);
            match self.lex.tok {
                Tok::Comma => self.advance()?,
                Tok::RBra => {
                    self.advance()?;
                    break;
                }
                _ => return self.syntax("expected ',' or '}' in dict literal"),
            }
        }
        Ok(())
    }

    /// `( e )` is grouping; `( e, ... )` builds a list. An instruction slot
    /// is reserved up front because the decision arrives only at the first
    /// comma.
    fn parse_group_or_list(&mut self) -> Result<()> {
        let reserved = self.put();
        self.consume(&Tok::LPar)?;
        self.parse_expr()?;
        if self.lex.tok == Tok::Comma {
            self.emit_at(reserved, Op::LList);
            self.emit(Op::AttrPush);
            self.advance()?;
            if self.lex.tok == Tok::RPar {
                return self.advance();
            }
            loop {
                self.parse_expr()?;
                self.emit(Op::AttrPush);
                match self.lex.tok {
                    Tok::Comma => self.advance()?,
                    Tok::RPar => {
                        self.advance()?;
                        break;
                    }
                    _ => return self.syntax("expected ',' or ')' in sequence"),
                }
            }
            Ok(())
        } else {
            self.consume(&Tok::RPar)?;
            // Plain grouping: the reserved slot stays a no-op.
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Constant expressions (macro parameter defaults)
    // -----------------------------------------------------------------------

    /// Evaluate a constant expression at compile time. The resulting value
    /// lives in the engine root scope.
    fn parse_constexpr(&mut self) -> Result<Value> {
        let neg = if self.lex.tok == Tok::Sub {
            self.advance()?;
            true
        } else {
            false
        };
        let value = match self.lex.tok.clone() {
            Tok::Num(n) => {
                self.advance()?;
                Value::Number(if neg { -n } else { n })
            }
            Tok::True => {
                self.advance()?;
                Value::Bool(!neg)
            }
            Tok::False => {
                self.advance()?;
                Value::Bool(neg)
            }
            Tok::None => {
                if neg {
                    return self.compile_err("unary '-' cannot apply to none");
                }
                self.advance()?;
                Value::None
            }
            Tok::Str(s) => {
                if neg {
                    return self.compile_err("unary '-' cannot apply to a string literal");
                }
                self.advance()?;
                alloc_str(self.heap, ROOT_SCOPE, s)
            }
            Tok::LSqr => {
                if neg {
                    return self.compile_err("unary '-' cannot apply to a list literal");
                }
                self.parse_constseq(Tok::LSqr, Tok::RSqr)?
            }
            Tok::LPar => {
                if neg {
                    return self.compile_err("unary '-' cannot apply to a sequence literal");
                }
                self.parse_constseq(Tok::LPar, Tok::RPar)?
            }
            Tok::LBra => {
                if neg {
                    return self.compile_err("unary '-' cannot apply to a dict literal");
                }
                self.parse_constdict()?
            }
            other => {
                return self.compile_err(&format!(
                    "a constant expression is required here, got {}",
                    other.name()
                ));
            }
        };
        Ok(value)
    }

    fn parse_constseq(&mut self, open: Tok, close: Tok) -> Result<Value> {
        self.consume(&open)?;
        let mut items = Vec::new();
        if self.lex.tok == close {
            self.advance()?;
            return Ok(alloc_list(self.heap, ROOT_SCOPE, items));
        }
        loop {
            items.push(self.parse_constexpr()?);
            if self.lex.tok == Tok::Comma {
                self.advance()?;
            } else if self.lex.tok == close {
                self.advance()?;
                break;
            } else {
                return self.syntax("expected ',' or a closing bracket in constant sequence");
            }
        }
        Ok(alloc_list(self.heap, ROOT_SCOPE, items))
    }

    fn parse_constdict(&mut self) -> Result<Value> {
        self.consume(&Tok::LBra)?;
        let mut pairs = Vec::new();
        if self.lex.tok == Tok::RBra {
            self.advance()?;
            return Ok(alloc_dict(self.heap, ROOT_SCOPE, pairs));
        }
        loop {
            let key = match self.lex.tok.clone() {
                Tok::Str(s) => {
                    self.advance()?;
                    s
                }
                _ => return self.compile_err("constant dict keys must be string literals"),
            };
            self.consume(&Tok::Colon)?;
            let val = self.parse_constexpr()?;
            pairs.push((key, val));
            if self.lex.tok == Tok::Comma {
                self.advance()?;
            } else if self.lex.tok == Tok::RBra {
                self.advance()?;
                break;
            } else {
                return self.syntax("expected ',' or '}' in constant dict");
            }
        }
        Ok(alloc_dict(self.heap, ROOT_SCOPE, pairs))
    }
}
