//! Stack-based bytecode virtual machine.
//!
//! Executes the programs produced by the parser. All per-render state lives
//! here: the shared value stack, the call frames (`ebp`/`pc`/argument
//! count), the stack of entered GC scopes and the capture-buffer stack.
//! Engine-owned state (heap, environment upvalues, template cache) is
//! borrowed for the duration of one render; a nested render
//! (include/extends/import) runs to completion inside the instruction that
//! started it.

use std::rc::Rc;

use crate::bytecode::{
    DEREF_KEYVAL, FuncKind, INCLUDE_JSON, INCLUDE_NONE, INCLUDE_UPVALUE, MAX_EXTENDS, Op, Program,
    TemplateFn, UPVALUE_FIX, MAIN,
};
use crate::diagnostic::{self, Phase};
use crate::error::{Error, Result};
use crate::heap::{Heap, ObjRef, ScopeId};
use crate::io::Output;
use crate::json;
use crate::object::{
    self, HostCtx, LoopState, Payload, alloc_const_str, alloc_str, with_user_data_mut,
};
use crate::parser::{CALLER, LOOP};
use crate::upvalue::{Upvalue, UpvalueChain, UpvalueSlot};
use crate::value::{Value, to_integer};

/// Engine-configured execution bounds.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum call-frame depth.
    pub call_stack: usize,
    /// Maximum value-stack depth.
    pub value_stack: usize,
    /// Maximum include/import nesting.
    pub include_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            call_stack: 128,
            value_stack: 4096,
            include_depth: 128,
        }
    }
}

/// Loads (and caches) compiled templates and raw files for the VM. The
/// engine implements this over its VFS and template cache.
pub trait Loader {
    /// Load a template by logical name, compiling it if needed. The
    /// returned object lives in the engine root scope.
    fn load_template(&mut self, heap: &mut Heap, path: &str) -> Result<ObjRef>;

    /// Load a raw file (the JSON side of include-with-data).
    fn load_bytes(&mut self, path: &str) -> Result<String>;
}

/// One activation record.
struct Frame {
    program: Rc<Program>,
    name: Rc<str>,
    kind: FuncKind,
    /// Resolution root: the template being rendered. Block lookup starts
    /// here so overridden blocks win under extends.
    template: ObjRef,
    /// The template whose function table owns this function; `super()`
    /// resolves from the next chain entry after it.
    owner: ObjRef,
    source: Rc<str>,
    ebp: usize,
    pc: usize,
    /// Total bound arguments (including pushed defaults).
    argc: usize,
    /// Object sitting below the arguments (AttrCall); popped on return.
    is_method: bool,
    /// Scope-stack depth at entry; Ret unwinds back to it.
    scope_base: usize,
}

/// The virtual machine for one render.
pub struct Vm<'e> {
    heap: &'e mut Heap,
    env: &'e mut UpvalueChain,
    loader: &'e mut dyn Loader,
    sink: &'e mut Output,
    limits: Limits,

    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Entered GC scopes, innermost last. The base render scope sits below
    /// them and is owned by the engine.
    scopes: Vec<ScopeId>,
    base_scope: ScopeId,
    /// Capture buffers; text goes to the innermost buffer, or the sink.
    captures: Vec<String>,
    include_depth: usize,
}

impl<'e> Vm<'e> {
    pub fn new(
        heap: &'e mut Heap,
        env: &'e mut UpvalueChain,
        loader: &'e mut dyn Loader,
        sink: &'e mut Output,
        limits: Limits,
        base_scope: ScopeId,
    ) -> Self {
        Self {
            heap,
            env,
            loader,
            sink,
            limits,
            stack: Vec::new(),
            frames: Vec::new(),
            scopes: Vec::new(),
            base_scope,
            captures: Vec::new(),
            include_depth: 0,
        }
    }

    /// Render a template's main function into the sink.
    pub fn render(&mut self, template: ObjRef) -> Result<()> {
        let result = (|| {
            self.push_jinja_call(template, template, MAIN, 0, false)?;
            self.run_until(0)?;
            // Main's return value is uninteresting.
            self.stack.pop();
            Ok(())
        })();
        // Unwind any scopes left by an aborted render; partial output
        // already written to the sink stays.
        while let Some(s) = self.scopes.pop() {
            self.heap.exit_scope(s);
        }
        self.stack.clear();
        self.frames.clear();
        self.captures.clear();
        result
    }

    // -----------------------------------------------------------------------
    // Small helpers
    // -----------------------------------------------------------------------

    fn cur_scope(&self) -> ScopeId {
        *self.scopes.last().unwrap_or(&self.base_scope)
    }

    fn push(&mut self, v: Value) -> Result<()> {
        if self.stack.len() >= self.limits.value_stack {
            return Err(Error::RuntimeBound(format!(
                "value stack overflow (limit {})",
                self.limits.value_stack
            )));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Uninit)
    }

    /// Value `n` slots below the top (1 = TOS).
    fn top(&self, n: usize) -> Value {
        self.stack[self.stack.len() - n]
    }

    fn write_text(&mut self, text: &str) {
        match self.captures.last_mut() {
            Some(buf) => buf.push_str(text),
            None => self.sink.write_str(text),
        }
    }

    fn host_ctx(&mut self) -> HostCtx<'_> {
        HostCtx {
            heap: self.heap,
            scope: *self.scopes.last().unwrap_or(&self.base_scope),
        }
    }

    fn template(&self, r: ObjRef) -> Result<&crate::bytecode::Template> {
        match self.heap.get(r).map(|o| &o.payload) {
            Some(Payload::Template(t)) => Ok(t),
            _ => Err(Error::RuntimeType("expected a template object".into())),
        }
    }

    /// The extends chain rooted at `root`: the template itself, then its
    /// parents in order.
    fn chain(&self, root: ObjRef) -> Result<Vec<ObjRef>> {
        let t = self.template(root)?;
        let mut out = Vec::with_capacity(1 + t.parents.len());
        out.push(root);
        out.extend(t.parents.iter().copied());
        Ok(out)
    }

    /// Resolve a function by name through the extends chain of `root`.
    fn resolve_in_chain(&self, root: ObjRef, name: &str) -> Result<Option<(ObjRef, TemplateFn)>> {
        for tpl in self.chain(root)? {
            if let Some(f) = self.template(tpl)?.find(name) {
                return Ok(Some((tpl, f.clone())));
            }
        }
        Ok(None)
    }

    fn to_number(&self, v: &Value) -> Result<f64> {
        v.as_number().ok_or_else(|| {
            Error::RuntimeType(format!(
                "cannot convert {} to a number",
                object::type_name(self.heap, v)
            ))
        })
    }

    // -----------------------------------------------------------------------
    // Error context
    // -----------------------------------------------------------------------

    /// Attach function name, source coordinates and a snippet to a raw
    /// error. Errors that already carry a phase tag pass through.
    fn with_context(&self, err: Error, at_pc: usize) -> Error {
        let wrap = |msg: String| -> String {
            if msg.starts_with('[') {
                return msg;
            }
            match self.frames.last() {
                Some(frame) => {
                    let offset = frame
                        .program
                        .spans
                        .get(at_pc)
                        .copied()
                        .unwrap_or(0) as usize;
                    diagnostic::message(Phase::Run, &frame.name, &frame.source, offset, &msg)
                }
                None => diagnostic::bare_message(Phase::Run, "<render>", &msg),
            }
        };
        match err {
            Error::Lex(m) => Error::Lex(wrap(m)),
            Error::Syntax(m) => Error::Syntax(wrap(m)),
            Error::Compile(m) => Error::Compile(wrap(m)),
            Error::Optimize(m) => Error::Optimize(wrap(m)),
            Error::RuntimeType(m) => Error::RuntimeType(wrap(m)),
            Error::RuntimeLookup(m) => Error::RuntimeLookup(wrap(m)),
            Error::RuntimeBound(m) => Error::RuntimeBound(wrap(m)),
            Error::RuntimeArity(m) => Error::RuntimeArity(wrap(m)),
            Error::Io(m) => Error::Io(wrap(m)),
            Error::Json(m) => Error::Json(wrap(m)),
        }
    }

    // -----------------------------------------------------------------------
    // Execution loop
    // -----------------------------------------------------------------------

    /// Execute until the frame stack shrinks back to `barrier`.
    fn run_until(&mut self, barrier: usize) -> Result<()> {
        while self.frames.len() > barrier {
            let frame = self.frames.last().expect("frame underflow");
            let pc = frame.pc;
            if pc >= frame.program.ops.len() {
                // Implicit return with no value.
                self.ret()?;
                continue;
            }
            let op = frame.program.ops[pc];
            self.frames.last_mut().expect("frame underflow").pc = pc + 1;
            if let Err(e) = self.step(op) {
                return Err(self.with_context(e, pc));
            }
        }
        Ok(())
    }

    fn step(&mut self, op: Op) -> Result<()> {
        match op {
            // --- Arithmetic ---
            Op::Add => {
                let r = self.pop();
                let l = self.pop();
                let is_str = matches!(l, Value::Str(_)) || matches!(r, Value::Str(_));
                if is_str {
                    let text = format!(
                        "{}{}",
                        object::display(self.heap, &l),
                        object::display(self.heap, &r)
                    );
                    let v = alloc_str(self.heap, self.cur_scope(), text);
                    self.push(v)?;
                } else {
                    let v = Value::Number(self.to_number(&l)? + self.to_number(&r)?);
                    self.push(v)?;
                }
            }
            Op::Sub => self.numeric_binop(|l, r| Ok(l - r))?,
            Op::Mul => {
                let r = self.pop();
                let l = self.pop();
                let l_str = matches!(l, Value::Str(_));
                let r_str = matches!(r, Value::Str(_));
                match (l_str, r_str) {
                    (true, true) => {
                        return Err(Error::RuntimeType("cannot multiply two strings".into()));
                    }
                    (true, false) | (false, true) => {
                        let (s, n) = if l_str { (l, r) } else { (r, l) };
                        let count = to_integer(self.to_number(&n)?).ok_or_else(|| {
                            Error::RuntimeBound("string repeat count out of range".into())
                        })?;
                        let text = object::str_value(self.heap, &s)
                            .unwrap_or_default()
                            .repeat(count.max(0) as usize);
                        let v = alloc_str(self.heap, self.cur_scope(), text);
                        self.push(v)?;
                    }
                    (false, false) => {
                        let v = Value::Number(self.to_number(&l)? * self.to_number(&r)?);
                        self.push(v)?;
                    }
                }
            }
            Op::Div => self.numeric_binop(|l, r| {
                if r == 0.0 {
                    Err(Error::RuntimeType("division by zero".into()))
                } else {
                    Ok(l / r)
                }
            })?,
            Op::Mod => self.numeric_binop(|l, r| {
                if r == 0.0 {
                    Err(Error::RuntimeType("modulo by zero".into()))
                } else {
                    Ok(l % r)
                }
            })?,
            Op::Pow => self.numeric_binop(|l, r| Ok(l.powf(r)))?,
            Op::DivTrunc => {
                let r = self.pop();
                let l = self.pop();
                let rn = self.to_number(&r)?;
                if rn == 0.0 {
                    return Err(Error::RuntimeType("division by zero".into()));
                }
                let q = self.to_number(&l)? / rn;
                let i = to_integer(q).ok_or_else(|| {
                    Error::RuntimeBound("integer out of range in // division".into())
                })?;
                self.push(Value::Number(i as f64))?;
            }
            Op::Neg => {
                let v = self.pop();
                let n = self.to_number(&v)?;
                self.push(Value::Number(-n))?;
            }

            // --- Comparison ---
            Op::Eq => {
                let r = self.pop();
                let l = self.pop();
                let b = object::values_eq(self.heap, &l, &r);
                self.push(Value::Bool(b))?;
            }
            Op::Ne => {
                let r = self.pop();
                let l = self.pop();
                let b = !object::values_eq(self.heap, &l, &r);
                self.push(Value::Bool(b))?;
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let r = self.pop();
                let l = self.pop();
                let ord = object::values_cmp(self.heap, &l, &r)?;
                use std::cmp::Ordering::{Greater, Less};
                let b = match op {
                    Op::Lt => ord == Less,
                    Op::Le => ord != Greater,
                    Op::Gt => ord == Greater,
                    Op::Ge => ord != Less,
                    _ => unreachable!(),
                };
                self.push(Value::Bool(b))?;
            }
            Op::In => {
                let container = self.pop();
                let item = self.pop();
                let b = object::value_in(self.heap, &item, &container)?;
                self.push(Value::Bool(b))?;
            }
            Op::Nin => {
                let container = self.pop();
                let item = self.pop();
                let b = !object::value_in(self.heap, &item, &container)?;
                self.push(Value::Bool(b))?;
            }

            // --- Logic & coercions ---
            Op::Not => {
                let v = self.pop();
                let b = !object::is_truthy(self.heap, &v);
                self.push(Value::Bool(b))?;
            }
            Op::And => {
                let r = self.pop();
                let l = self.pop();
                let v = if object::is_truthy(self.heap, &l) { r } else { l };
                self.push(v)?;
            }
            Op::Or => {
                let r = self.pop();
                let l = self.pop();
                let v = if object::is_truthy(self.heap, &l) { l } else { r };
                self.push(v)?;
            }
            Op::Bool => {
                let v = self.pop();
                let b = object::is_truthy(self.heap, &v);
                self.push(Value::Bool(b))?;
            }
            Op::Len => {
                let v = self.pop();
                let n = object::len_of(self.heap, &v)?;
                self.push(Value::Number(n as f64))?;
            }
            Op::Cat => {
                let r = self.pop();
                let l = self.pop();
                let text = format!(
                    "{}{}",
                    object::display(self.heap, &l),
                    object::display(self.heap, &r)
                );
                let v = alloc_str(self.heap, self.cur_scope(), text);
                self.push(v)?;
            }

            // --- Calls ---
            Op::Call(name_idx, argc) => {
                let name = self.frame_str(name_idx);
                self.call_free(&name, argc as usize)?;
            }
            Op::AttrCall(name_idx, argc) => {
                let name = self.frame_str(name_idx);
                self.call_attr(&name, argc as usize)?;
            }
            Op::Ret => self.ret()?,
            Op::Print => {
                let v = self.pop();
                let text = object::display(self.heap, &v);
                self.write_text(&text);
            }
            Op::Capture(name_idx) => {
                let name = self.frame_str(name_idx);
                let owner = self.frames.last().expect("no frame").owner;
                let root = self.frames.last().expect("no frame").template;
                let Some(f) = self.template(owner)?.find(&name).cloned() else {
                    return Err(Error::RuntimeLookup(format!(
                        "capture body '{name}' not found"
                    )));
                };
                self.captures.push(String::new());
                let result = self.invoke_jinja_sync(root, owner, &f, 0, false);
                let text = self.captures.pop().unwrap_or_default();
                result?;
                let v = alloc_str(self.heap, self.cur_scope(), text);
                self.push(v)?;
            }

            // --- Stack manipulation ---
            Op::Pop(n) => {
                let len = self.stack.len().saturating_sub(n as usize);
                self.stack.truncate(len);
            }
            Op::TPush(n) => {
                let v = self.top(n as usize);
                self.push(v)?;
            }
            Op::BPush(k) => {
                let ebp = self.frames.last().expect("no frame").ebp;
                let v = self.stack[ebp + k as usize];
                self.push(v)?;
            }
            Op::Store(k) => {
                let ebp = self.frames.last().expect("no frame").ebp;
                let v = self.pop();
                self.stack[ebp + k as usize] = v;
            }
            Op::Move(dst, src) => {
                let ebp = self.frames.last().expect("no frame").ebp;
                self.stack.swap(ebp + dst as usize, ebp + src as usize);
            }
            Op::Lift(pos, levels) => {
                let ebp = self.frames.last().expect("no frame").ebp;
                let v = self.stack[ebp + pos as usize];
                if let Some(r) = v.obj_ref() {
                    self.heap.lift(r, levels);
                }
            }

            // --- Constant loads ---
            Op::LStr(i) => {
                let s = self.frame_str(i);
                let scope = self.cur_scope();
                let v = alloc_const_str(self.heap, scope, s);
                self.push(v)?;
            }
            Op::LNum(i) => {
                let n = self.frames.last().expect("no frame").program.num_at(i);
                self.push(Value::Number(n))?;
            }
            Op::LImm(n) => self.push(Value::Number(n as f64))?,
            Op::LTrue => self.push(Value::TRUE)?,
            Op::LFalse => self.push(Value::FALSE)?,
            Op::LNone => self.push(Value::None)?,
            Op::LZero => self.push(Value::Number(0.0))?,
            Op::LList => {
                let scope = self.cur_scope();
                let v = Value::Object(self.heap.alloc(scope, Payload::List(Vec::new())));
                self.push(v)?;
            }
            Op::LDict => {
                let scope = self.cur_scope();
                let v = Value::Object(self.heap.alloc(scope, Payload::Dict(Vec::new())));
                self.push(v)?;
            }

            // --- Attribute access ---
            Op::AttrSet => {
                let val = self.pop();
                let key = self.pop();
                let obj = self.pop();
                object::attr_set(self.heap, &obj, &key, val)?;
            }
            Op::AttrPush => {
                let val = self.pop();
                let obj = self.pop();
                object::attr_push(self.heap, &obj, val)?;
            }
            Op::AttrGet => {
                let key = self.pop();
                let obj = self.pop();
                let mut ctx = HostCtx {
                    heap: self.heap,
                    scope: *self.scopes.last().unwrap_or(&self.base_scope),
                };
                let v = object::attr_get(&mut ctx, &obj, &key)?;
                self.push(v)?;
            }

            // --- Upvalues ---
            Op::UpvalueSet(i) => {
                let name = self.frame_str(i);
                let v = self.pop();
                self.upvalue_set(&name, v)?;
            }
            Op::UpvalueGet(i) => {
                let name = self.frame_str(i);
                let v = self.upvalue_get(&name)?;
                self.push(v)?;
            }
            Op::UpvalueDel(i) => {
                let name = self.frame_str(i);
                self.env.del(&name);
            }

            // --- Jumps ---
            Op::Jmp(pos) => self.jump(pos),
            Op::Jt(pos) => {
                let v = self.pop();
                if object::is_truthy(self.heap, &v) {
                    self.jump(pos);
                }
            }
            Op::Jf(pos) => {
                let v = self.pop();
                if !object::is_truthy(self.heap, &v) {
                    self.jump(pos);
                }
            }
            Op::Jlt(pos) => {
                let v = self.top(1);
                if object::is_truthy(self.heap, &v) {
                    self.jump(pos);
                } else {
                    self.pop();
                }
            }
            Op::Jlf(pos) => {
                let v = self.top(1);
                if !object::is_truthy(self.heap, &v) {
                    self.jump(pos);
                } else {
                    self.pop();
                }
            }
            Op::Jmpc(nscopes, pos) => {
                for _ in 0..nscopes {
                    let Some(s) = self.scopes.pop() else {
                        return Err(Error::RuntimeBound("scope underflow in jmpc".into()));
                    };
                    self.heap.exit_scope(s);
                }
                self.jump(pos);
            }
            Op::Jept(pos) => {
                let v = self.pop();
                if object::is_empty(self.heap, &v)? {
                    self.jump(pos);
                }
            }

            // --- Iteration ---
            Op::IterStart => {
                let obj = self.top(1);
                let it = object::iter_start(self.heap, &obj)?;
                let length = object::iteration_len(self.heap, &obj)?;
                let scope = self.cur_scope();
                let loop_obj = self
                    .heap
                    .alloc(scope, Payload::Loop(LoopState { index0: 0, length }));
                self.env.add(
                    LOOP,
                    Upvalue {
                        slot: UpvalueSlot::Value(Value::Object(loop_obj)),
                        fixed: false,
                    },
                    true,
                );
                self.push(Value::Iter(it))?;
            }
            Op::IterHas => {
                let it = match self.top(1) {
                    Value::Iter(i) => i,
                    _ => return Err(Error::RuntimeType("iterator expected on stack".into())),
                };
                let obj = self.top(2);
                let has = object::iter_has(self.heap, &obj, it)?;
                self.push(Value::Bool(has))?;
            }
            Op::IterDeref(k) => {
                let it = match self.top(1) {
                    Value::Iter(i) => i,
                    _ => return Err(Error::RuntimeType("iterator expected on stack".into())),
                };
                let obj = self.top(2);
                let mut ctx = HostCtx {
                    heap: self.heap,
                    scope: *self.scopes.last().unwrap_or(&self.base_scope),
                };
                let (key, val) = object::iter_deref(&mut ctx, &obj, it)?;
                if k == DEREF_KEYVAL {
                    self.push(key)?;
                }
                self.push(val)?;
            }
            Op::IterMove => {
                let it = match self.pop() {
                    Value::Iter(i) => i,
                    _ => return Err(Error::RuntimeType("iterator expected on stack".into())),
                };
                let obj = self.top(1);
                let next = object::iter_move(self.heap, &obj, it)?;
                // Advance the published loop object alongside the iterator.
                let loop_ref = match self.env.find(LOOP, None) {
                    Some(Upvalue {
                        slot: UpvalueSlot::Value(Value::Object(r)),
                        ..
                    }) => Some(*r),
                    _ => None,
                };
                if let Some(r) = loop_ref
                    && let Some(o) = self.heap.get_mut(r)
                    && let Payload::Loop(state) = &mut o.payload
                {
                    state.index0 += 1;
                }
                self.push(Value::Iter(next))?;
            }

            // --- GC scopes ---
            Op::Enter => {
                let scope = self.heap.enter_scope(self.cur_scope());
                self.scopes.push(scope);
            }
            Op::Exit => {
                let Some(s) = self.scopes.pop() else {
                    return Err(Error::RuntimeBound("scope underflow in exit".into()));
                };
                self.heap.exit_scope(s);
            }

            // --- Cross-template transfers ---
            Op::Include(mode, count) => self.include(mode, count as usize)?,
            Op::Import(name_idx) => {
                let name = self.frame_str(name_idx);
                let path_v = self.pop();
                let path = object::str_value(self.heap, &path_v)
                    .ok_or_else(|| {
                        Error::RuntimeType("import path must be a string".into())
                    })?
                    .to_string();
                log::debug!("import template {path}");
                let tpl = self.loader.load_template(self.heap, &path)?;
                self.env.add(
                    &name,
                    Upvalue {
                        slot: UpvalueSlot::Value(Value::Object(tpl)),
                        fixed: false,
                    },
                    true,
                );
            }
            Op::ImportSymbol(count) => self.import_symbols(count as usize)?,
            Op::Extends => self.extends()?,

            // --- Misc ---
            Op::Nop0 | Op::Nop1(_) | Op::Nop2(_, _) => {}
            Op::Halt => {
                self.frames.clear();
            }
            Op::Error => {
                return Err(Error::RuntimeBound(
                    "executed an unreachable instruction slot".into(),
                ));
            }
        }
        Ok(())
    }

    fn jump(&mut self, pos: u32) {
        self.frames.last_mut().expect("no frame").pc = pos as usize;
    }

    fn frame_str(&self, idx: u32) -> Rc<str> {
        self.frames
            .last()
            .expect("no frame")
            .program
            .str_at(idx)
            .clone()
    }

    fn numeric_binop(&mut self, f: impl Fn(f64, f64) -> Result<f64>) -> Result<()> {
        let r = self.pop();
        let l = self.pop();
        let v = Value::Number(f(self.to_number(&l)?, self.to_number(&r)?)?);
        self.push(v)
    }

    // -----------------------------------------------------------------------
    // Upvalues
    // -----------------------------------------------------------------------

    fn upvalue_set(&mut self, name: &str, v: Value) -> Result<()> {
        // `__caller__` holds a function of the current template; keep it as
        // a resolvable reference instead of a plain string.
        if name == CALLER {
            let owner = self.frames.last().expect("no frame").owner;
            let fname = object::str_value(self.heap, &v)
                .ok_or_else(|| Error::RuntimeType("caller stub name must be a string".into()))?;
            let fname: Rc<str> = Rc::from(fname);
            self.env.add(
                name,
                Upvalue {
                    slot: UpvalueSlot::Macro {
                        template: owner,
                        name: fname,
                    },
                    fixed: false,
                },
                true,
            );
            return Ok(());
        }
        // The bound value must survive scope exits inside the binding's
        // extent; escape it to the render base scope.
        let v = self.heap.move_value(v, self.base_scope);
        self.env.add(
            name,
            Upvalue {
                slot: UpvalueSlot::Value(v),
                fixed: false,
            },
            true,
        );
        Ok(())
    }

    fn upvalue_get(&mut self, name: &str) -> Result<Value> {
        match self.env.find(name, None).map(|u| u.slot.clone()) {
            Some(UpvalueSlot::Value(v)) => Ok(v),
            Some(UpvalueSlot::Macro { .. }) => Err(Error::RuntimeType(format!(
                "'{name}' is a macro; call it instead of reading it"
            ))),
            Some(UpvalueSlot::HostFn(_)) | Some(UpvalueSlot::ClassCtor(_)) => {
                Err(Error::RuntimeType(format!(
                    "'{name}' is a function; call it instead of reading it"
                )))
            }
            None => Err(Error::RuntimeLookup(format!("'{name}' is not defined"))),
        }
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// `CALL name argc`: caller()/super(), then the current template's
    /// extends chain, then the environment chain.
    fn call_free(&mut self, name: &str, argc: usize) -> Result<()> {
        if name == "caller" {
            return self.call_caller(argc);
        }
        if name == "super" {
            return self.call_super(argc);
        }

        let frame = self.frames.last().expect("no frame");
        let (root, owner) = (frame.template, frame.owner);

        // Generated function names (loop/filter/call bodies) are private to
        // the template that emitted them; everything else resolves through
        // the chain so overridden blocks win.
        let resolved = if name.starts_with('@') {
            self.template(owner)?
                .find(name)
                .cloned()
                .map(|f| (owner, f))
        } else {
            self.resolve_in_chain(root, name)?
        };
        if let Some((owner, f)) = resolved {
            return self.push_jinja_frame(root, owner, &f, argc, false);
        }

        // Environment chain: host functions, class constructors, imported
        // macros.
        match self.env.find(name, None).map(|u| u.slot.clone()) {
            Some(UpvalueSlot::HostFn(f)) => {
                let args = self.pop_args(argc);
                let mut ctx = self.host_ctx();
                let ret = f(&mut ctx, &args)?;
                self.push(ret)
            }
            Some(UpvalueSlot::ClassCtor(class)) => {
                let args = self.pop_args(argc);
                let mut ctx = self.host_ctx();
                let data = (class.ctor)(&mut ctx, &args)?;
                let scope = self.cur_scope();
                let obj = self.heap.alloc(
                    scope,
                    Payload::User(object::UserObject { class, data }),
                );
                self.push(Value::Object(obj))
            }
            Some(UpvalueSlot::Macro { template, name }) => {
                let Some(f) = self.template(template)?.find(&name).cloned() else {
                    return Err(Error::RuntimeLookup(format!(
                        "imported macro '{name}' disappeared from its template"
                    )));
                };
                self.push_jinja_frame(template, template, &f, argc, false)
            }
            Some(UpvalueSlot::Value(_)) => Err(Error::RuntimeType(format!(
                "'{name}' is not callable"
            ))),
            None => Err(Error::RuntimeLookup(format!(
                "cannot find function '{name}'"
            ))),
        }
    }

    /// `caller()`: run the `__caller__` stub published by `{% call %}` and
    /// return its rendered output as a string.
    fn call_caller(&mut self, argc: usize) -> Result<()> {
        match self.env.find(CALLER, None).map(|u| u.slot.clone()) {
            Some(UpvalueSlot::Macro { template, name }) => {
                let Some(f) = self.template(template)?.find(&name).cloned() else {
                    return Err(Error::RuntimeLookup("caller stub not found".into()));
                };
                self.captures.push(String::new());
                let result = self.invoke_jinja_sync(template, template, &f, argc, false);
                let text = self.captures.pop().unwrap_or_default();
                result?;
                let v = alloc_str(self.heap, self.cur_scope(), text);
                self.push(v)
            }
            _ => Err(Error::RuntimeLookup(
                "caller() used outside of a {% call %} body".into(),
            )),
        }
    }

    /// `super()`: the same block one step further along the extends chain.
    fn call_super(&mut self, argc: usize) -> Result<()> {
        if argc != 0 {
            return Err(Error::RuntimeArity("super() takes no arguments".into()));
        }
        let frame = self.frames.last().expect("no frame");
        if frame.kind != FuncKind::Block {
            return Err(Error::RuntimeType(
                "super() is only valid inside a block".into(),
            ));
        }
        let (root, owner, block_name) = (frame.template, frame.owner, frame.name.clone());
        let chain = self.chain(root)?;
        let Some(pos) = chain.iter().position(|&t| t == owner) else {
            return Err(Error::RuntimeLookup(
                "executing block's template is not on the extends chain".into(),
            ));
        };
        for &tpl in &chain[pos + 1..] {
            if let Some(f) = self.template(tpl)?.find(&block_name).cloned() {
                // The parent block's rendered output is super()'s value.
                self.captures.push(String::new());
                let result = self.invoke_jinja_sync(root, tpl, &f, 0, false);
                let text = self.captures.pop().unwrap_or_default();
                result?;
                let v = alloc_str(self.heap, self.cur_scope(), text);
                return self.push(v);
            }
        }
        Err(Error::RuntimeLookup(format!(
            "no parent block '{block_name}' for super()"
        )))
    }

    /// `ATTR_CALL name argc`: method dispatch on the object below the
    /// arguments.
    fn call_attr(&mut self, name: &str, argc: usize) -> Result<()> {
        let obj = self.top(argc + 1);
        let Some(r) = obj.obj_ref() else {
            return Err(Error::RuntimeType(format!(
                "type {} has no methods",
                object::type_name(self.heap, &obj)
            )));
        };
        enum Kind {
            Template,
            List,
            Dict,
            Cycler,
            User,
        }
        let kind = match self.heap.payload(r) {
            Payload::Template(_) => Kind::Template,
            Payload::List(_) => Kind::List,
            Payload::Dict(_) => Kind::Dict,
            Payload::Cycler(_) => Kind::Cycler,
            Payload::User(_) => Kind::User,
            _ => {
                return Err(Error::RuntimeLookup(format!(
                    "type {} has no method '{name}'",
                    object::type_name(self.heap, &obj)
                )));
            }
        };
        match kind {
            Kind::Template => {
                // Macros and blocks of the referenced template, e.g. from
                // `{% import ... as m %}` or `self.blockname()`.
                let Some((owner, f)) = self.resolve_in_chain(r, name)? else {
                    return Err(Error::RuntimeLookup(format!(
                        "template has no function '{name}'"
                    )));
                };
                self.push_jinja_frame(r, owner, &f, argc, true)
            }
            Kind::List => {
                let args = self.pop_args(argc);
                self.pop(); // receiver
                let ret = object::list_method(self.heap, r, name, &args)?;
                self.push(ret)
            }
            Kind::Dict => {
                let args = self.pop_args(argc);
                self.pop(); // receiver
                let ret = object::dict_method(self.heap, r, name, &args)?;
                self.push(ret)
            }
            Kind::Cycler => {
                let args = self.pop_args(argc);
                self.pop(); // the cycler itself
                let ret = self.cycler_method(r, name, &args)?;
                self.push(ret)
            }
            Kind::User => {
                let method = match self.heap.payload(r) {
                    Payload::User(u) => u.class.method(name).cloned(),
                    _ => None,
                };
                let Some(method) = method else {
                    return Err(Error::RuntimeLookup(format!(
                        "object has no method '{name}'"
                    )));
                };
                let args = self.pop_args(argc);
                self.pop(); // receiver
                let scope = self.cur_scope();
                let mut ctx = HostCtx {
                    heap: self.heap,
                    scope,
                };
                let ret = with_user_data_mut(&mut ctx, r, |ctx, data| method(ctx, data, &args))?;
                self.push(ret)
            }
        }
    }

    fn cycler_method(&mut self, r: ObjRef, name: &str, args: &[Value]) -> Result<Value> {
        if !args.is_empty() {
            return Err(Error::RuntimeArity(format!(
                "cycler.{name}() takes no arguments"
            )));
        }
        let Payload::Cycler(c) = self.heap.payload_mut(r) else {
            return Err(Error::RuntimeType("not a cycler".into()));
        };
        match name {
            "reset" => {
                c.pos = 0;
                Ok(Value::None)
            }
            "next" => {
                if c.items.is_empty() {
                    return Ok(Value::None);
                }
                let v = c.items[c.pos % c.items.len()];
                c.pos = (c.pos + 1) % c.items.len();
                Ok(v)
            }
            other => Err(Error::RuntimeLookup(format!(
                "cycler has no method '{other}'"
            ))),
        }
    }

    fn pop_args(&mut self, argc: usize) -> Vec<Value> {
        let start = self.stack.len().saturating_sub(argc);
        self.stack.split_off(start)
    }

    /// Push a frame for a template function by name.
    fn push_jinja_call(
        &mut self,
        root: ObjRef,
        owner: ObjRef,
        name: &str,
        argc: usize,
        is_method: bool,
    ) -> Result<()> {
        let Some(f) = self.template(owner)?.find(name).cloned() else {
            return Err(Error::RuntimeLookup(format!(
                "template has no function '{name}'"
            )));
        };
        self.push_jinja_frame(root, owner, &f, argc, is_method)
    }

    /// Bind arguments (filling defaults) and push an activation record.
    fn push_jinja_frame(
        &mut self,
        root: ObjRef,
        owner: ObjRef,
        f: &TemplateFn,
        argc: usize,
        is_method: bool,
    ) -> Result<()> {
        if self.frames.len() >= self.limits.call_stack {
            return Err(Error::RuntimeBound(format!(
                "call stack overflow (limit {})",
                self.limits.call_stack
            )));
        }
        let params = f.program.params.len();
        if argc > params {
            return Err(Error::RuntimeArity(format!(
                "{} takes at most {} argument(s), {} given",
                f.name, params, argc
            )));
        }
        // Missing parameters take their compile-time defaults.
        for i in argc..params {
            let v = f.program.params[i].default;
            self.push(v)?;
        }
        let total = params;
        let ebp = self.stack.len() - total;
        let source = self.template(owner)?.source.clone();
        let scope = self.cur_scope();

        // Builtin upvalues for the body's duration.
        self.env.add(
            "__argnum__",
            Upvalue {
                slot: UpvalueSlot::Value(Value::Number(argc as f64)),
                fixed: false,
            },
            true,
        );
        let fname_val = alloc_const_str(self.heap, scope, f.name.clone());
        self.env.add(
            "__func__",
            Upvalue {
                slot: UpvalueSlot::Value(fname_val),
                fixed: false,
            },
            true,
        );
        self.env.add(
            "self",
            Upvalue {
                slot: UpvalueSlot::Value(Value::Object(root)),
                fixed: false,
            },
            true,
        );

        self.frames.push(Frame {
            program: f.program.clone(),
            name: f.name.clone(),
            kind: f.kind,
            template: root,
            owner,
            source,
            ebp,
            pc: 0,
            argc: total,
            is_method,
            scope_base: self.scopes.len(),
        });
        Ok(())
    }

    /// Return from the current frame, pushing the return value (or None)
    /// onto the caller's stack.
    ///
    /// The function-body scope is left open by the compiled code; it is
    /// destroyed here, after the return value has been moved to the
    /// innermost scope that survives the call.
    fn ret(&mut self) -> Result<()> {
        let frame = self.frames.pop().expect("ret without a frame");
        let ret = if self.stack.len() > frame.ebp + frame.argc {
            self.pop()
        } else {
            Value::None
        };
        let target = if frame.scope_base == 0 {
            self.base_scope
        } else {
            self.scopes[frame.scope_base - 1]
        };
        let ret = self.heap.move_value(ret, target);
        // Destroy the body scope and anything a break/continue left open.
        while self.scopes.len() > frame.scope_base {
            let s = self.scopes.pop().expect("scope underflow");
            self.heap.exit_scope(s);
        }
        let base = if frame.is_method { frame.ebp - 1 } else { frame.ebp };
        self.stack.truncate(base);
        self.env.del("self");
        self.env.del("__func__");
        self.env.del("__argnum__");
        self.push(ret)
    }

    /// Run a template function to completion and return its value.
    fn invoke_jinja_sync(
        &mut self,
        root: ObjRef,
        owner: ObjRef,
        f: &TemplateFn,
        argc: usize,
        is_method: bool,
    ) -> Result<Value> {
        let barrier = self.frames.len();
        self.push_jinja_frame(root, owner, f, argc, is_method)?;
        self.run_until(barrier)?;
        Ok(self.pop())
    }

    // -----------------------------------------------------------------------
    // Include / import / extends
    // -----------------------------------------------------------------------

    fn include(&mut self, mode: u32, count: usize) -> Result<()> {
        if self.include_depth >= self.limits.include_depth {
            return Err(Error::RuntimeBound(format!(
                "include/import nesting exceeds {}",
                self.limits.include_depth
            )));
        }
        let depth = match mode {
            INCLUDE_NONE => 1,
            INCLUDE_UPVALUE => 3 * count + 1,
            INCLUDE_JSON => 3 * count + 2,
            _ => return Err(Error::RuntimeBound("bad include mode".into())),
        };
        let path_v = self.top(depth);
        let path = object::str_value(self.heap, &path_v)
            .ok_or_else(|| Error::RuntimeType("include path must be a string".into()))?
            .to_string();
        log::debug!("include template {path} (mode {mode})");

        let pushed_env = mode != INCLUDE_NONE;
        if pushed_env {
            self.env.push_table();
        }
        let result = (|| -> Result<()> {
            if mode == INCLUDE_JSON {
                let json_v = self.top(3 * count + 1);
                let json_path = object::str_value(self.heap, &json_v)
                    .ok_or_else(|| {
                        Error::RuntimeType("include json path must be a string".into())
                    })?
                    .to_string();
                let text = self.loader.load_bytes(&json_path)?;
                let data = json::decode(self.heap, self.base_scope, &json_path, &text)?;
                let pairs = match data.obj_ref().map(|r| self.heap.payload(r)) {
                    Some(Payload::Dict(pairs)) => pairs.clone(),
                    _ => {
                        return Err(Error::Json(
                            "include json data must decode to an object".into(),
                        ));
                    }
                };
                for (k, v) in pairs {
                    self.env.add(
                        &k,
                        Upvalue {
                            slot: UpvalueSlot::Value(v),
                            fixed: false,
                        },
                        true,
                    );
                }
            }
            if pushed_env {
                // Entries were pushed as (name, value, option) triples,
                // oldest deepest.
                for j in 0..count {
                    let base = 3 * (count - j);
                    let name_v = self.top(base);
                    let val = self.top(base - 1);
                    let opt = self.top(base - 2);
                    let name = object::str_value(self.heap, &name_v)
                        .ok_or_else(|| {
                            Error::RuntimeType("include upvalue name must be a string".into())
                        })?
                        .to_string();
                    let fix = matches!(opt, Value::Number(n) if n as i32 == UPVALUE_FIX);
                    let val = self.heap.move_value(val, self.base_scope);
                    if fix {
                        // A fixed binding never overrides an existing one.
                        if self.env.find(&name, None).is_none() {
                            self.env.add(
                                &name,
                                Upvalue {
                                    slot: UpvalueSlot::Value(val),
                                    fixed: true,
                                },
                                true,
                            );
                        }
                    } else {
                        self.env.add(
                            &name,
                            Upvalue {
                                slot: UpvalueSlot::Value(val),
                                fixed: false,
                            },
                            true,
                        );
                    }
                }
            }

            let tpl = self.loader.load_template(self.heap, &path)?;
            // The included template is a fresh render root; its extends
            // chain is rebuilt by its own EXTENDS instructions.
            if let Some(o) = self.heap.get_mut(tpl)
                && let Payload::Template(t) = &mut o.payload
            {
                t.parents.clear();
            }

            // Render into a buffer inside a fresh transient scope, then
            // write the buffer to the current sink.
            self.include_depth += 1;
            let scope = self.heap.enter_scope(self.cur_scope());
            self.scopes.push(scope);
            self.captures.push(String::new());
            let main = main_fn(self, tpl)?;
            let render = self.invoke_jinja_sync(tpl, tpl, &main, 0, false);
            let text = self.captures.pop().unwrap_or_default();
            let s = self.scopes.pop().expect("include scope vanished");
            self.heap.exit_scope(s);
            self.include_depth -= 1;
            render?;
            self.write_text(&text);
            Ok(())
        })();
        if pushed_env {
            self.env.pop_table();
        }
        // Drop the operands whether or not the include succeeded.
        let len = self.stack.len().saturating_sub(depth);
        self.stack.truncate(len);
        result
    }

    fn import_symbols(&mut self, count: usize) -> Result<()> {
        // Stack: [path, (sym, alias) * count]
        let path_v = self.top(2 * count + 1);
        let path = object::str_value(self.heap, &path_v)
            .ok_or_else(|| Error::RuntimeType("import path must be a string".into()))?
            .to_string();
        let tpl = self.loader.load_template(self.heap, &path)?;
        for j in 0..count {
            let base = 2 * (count - j);
            let sym_v = self.top(base);
            let alias_v = self.top(base - 1);
            let sym = object::str_value(self.heap, &sym_v)
                .ok_or_else(|| Error::RuntimeType("imported symbol must be a string".into()))?
                .to_string();
            let alias = object::str_value(self.heap, &alias_v)
                .ok_or_else(|| Error::RuntimeType("import alias must be a string".into()))?
                .to_string();
            let found = self
                .template(tpl)?
                .find(&sym)
                .is_some_and(|f| f.kind == FuncKind::Macro);
            if !found {
                return Err(Error::RuntimeLookup(format!(
                    "template '{path}' exports no macro '{sym}'"
                )));
            }
            self.env.add(
                &alias,
                Upvalue {
                    slot: UpvalueSlot::Macro {
                        template: tpl,
                        name: Rc::from(sym.as_str()),
                    },
                    fixed: false,
                },
                true,
            );
        }
        let len = self.stack.len().saturating_sub(2 * count + 1);
        self.stack.truncate(len);
        Ok(())
    }

    /// `EXTENDS`: chain the named template onto the root template's extends
    /// chain and render its main with block resolution rooted at the child.
    fn extends(&mut self) -> Result<()> {
        let path_v = self.pop();
        let path = object::str_value(self.heap, &path_v)
            .ok_or_else(|| Error::RuntimeType("extends path must be a string".into()))?
            .to_string();
        log::debug!("extends template {path}");
        let parent = self.loader.load_template(self.heap, &path)?;
        let root = self.frames.last().expect("no frame").template;

        {
            let Some(o) = self.heap.get_mut(root) else {
                return Err(Error::RuntimeType("render root vanished".into()));
            };
            let Payload::Template(t) = &mut o.payload else {
                return Err(Error::RuntimeType("render root is not a template".into()));
            };
            if t.parents.len() >= MAX_EXTENDS {
                return Err(Error::RuntimeBound(format!(
                    "extends chain longer than {MAX_EXTENDS}"
                )));
            }
            t.parents.push(parent);
        }

        let f = main_fn(self, parent)?;
        // The parent's main writes straight into the current sink.
        self.invoke_jinja_sync(root, parent, &f, 0, false)?;
        Ok(())
    }
}

fn main_fn(vm: &Vm<'_>, tpl: ObjRef) -> Result<TemplateFn> {
    vm.template(tpl)?
        .main()
        .cloned()
        .ok_or_else(|| Error::RuntimeLookup("template has no main function".into()))
}
