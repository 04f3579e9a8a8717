//! The engine: template cache, environment registrations and the render
//! entry points.
//!
//! An [`Engine`] owns everything that outlives a single render: the heap
//! (whose root scope holds compiled templates and registered constant
//! values), the environment upvalue chain (builtins plus host
//! registrations), the class registry and the template cache. One render at
//! a time borrows all of it; per-render state (value stack, call frames,
//! transient scopes) lives in [`crate::vm::Vm`] and is torn down when the
//! render returns.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::SystemTime;

use crate::builtins;
use crate::error::Result;
use crate::heap::{Heap, ObjRef, ROOT_SCOPE, ScopeId};
use crate::io::Output;
use crate::object::{
    ClassDef, ClassSlots, HostCtx, Payload, USER_TYPE_FLOOR, alloc_dict, alloc_list, alloc_str,
};
use crate::optimizer;
use crate::parser;
use crate::upvalue::{Upvalue, UpvalueChain, UpvalueSlot};
use crate::value::Value;
use crate::vfs::{DiskVfs, Vfs};
use crate::vm::{Limits, Loader, Vm};

/// A host-side value description, converted into engine values on
/// registration (the heap is not exposed to hosts for plain data).
#[derive(Debug, Clone)]
pub enum HostValue {
    None,
    Bool(bool),
    Number(f64),
    Str(String),
    List(Vec<HostValue>),
    Dict(Vec<(String, HostValue)>),
}

fn build_value(heap: &mut Heap, scope: ScopeId, hv: &HostValue) -> Value {
    match hv {
        HostValue::None => Value::None,
        HostValue::Bool(b) => Value::Bool(*b),
        HostValue::Number(n) => Value::Number(*n),
        HostValue::Str(s) => alloc_str(heap, scope, s.clone()),
        HostValue::List(items) => {
            let vals = items.iter().map(|i| build_value(heap, scope, i)).collect();
            alloc_list(heap, scope, vals)
        }
        HostValue::Dict(pairs) => {
            let vals = pairs
                .iter()
                .map(|(k, v)| (k.clone(), build_value(heap, scope, v)))
                .collect();
            alloc_dict(heap, scope, vals)
        }
    }
}

struct CacheEntry {
    template: ObjRef,
    timestamp: SystemTime,
}

/// Template cache over the VFS; implements the VM's [`Loader`] seam.
struct TemplateStore {
    vfs: Box<dyn Vfs>,
    cache: HashMap<String, CacheEntry>,
}

impl Loader for TemplateStore {
    fn load_template(&mut self, heap: &mut Heap, path: &str) -> Result<ObjRef> {
        if let Some(entry) = self.cache.get(path) {
            if self.vfs.is_current(path, entry.timestamp).unwrap_or(false) {
                log::trace!("template cache hit: {path}");
                return Ok(entry.template);
            }
            log::debug!("template cache stale: {path}");
        }
        let (source, timestamp) = self.vfs.load(path)?;
        log::debug!("compiling template {path}");
        let template = parser::compile(heap, path, &source)?;
        let template = optimizer::optimize_template(template)?;
        let obj = heap.alloc(ROOT_SCOPE, Payload::Template(template));
        self.cache.insert(
            path.to_string(),
            CacheEntry {
                template: obj,
                timestamp,
            },
        );
        Ok(obj)
    }

    fn load_bytes(&mut self, path: &str) -> Result<String> {
        Ok(self.vfs.load(path)?.0)
    }
}

/// The template engine.
pub struct Engine {
    heap: Heap,
    env: UpvalueChain,
    store: TemplateStore,
    limits: Limits,
    next_tag: u32,
}

impl Engine {
    /// An engine reading templates from the real filesystem.
    pub fn new() -> Self {
        Self::with_vfs(Box::new(DiskVfs::new()))
    }

    /// An engine over a custom virtual filesystem.
    pub fn with_vfs(vfs: Box<dyn Vfs>) -> Self {
        let mut env = UpvalueChain::new();
        builtins::install(&mut env);
        Self {
            heap: Heap::new(),
            env,
            store: TemplateStore {
                vfs,
                cache: HashMap::new(),
            },
            limits: Limits::default(),
            next_tag: USER_TYPE_FLOOR,
        }
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    // -----------------------------------------------------------------------
    // Host registration
    // -----------------------------------------------------------------------

    /// Register a function callable from templates.
    pub fn add_function(
        &mut self,
        name: &str,
        f: impl Fn(&mut HostCtx, &[Value]) -> Result<Value> + 'static,
    ) {
        self.env.add(
            name,
            Upvalue {
                slot: UpvalueSlot::HostFn(Rc::new(f)),
                fixed: false,
            },
            true,
        );
    }

    /// Register a filter. Filters share the function signature; the piped
    /// value arrives as the first argument.
    pub fn add_filter(
        &mut self,
        name: &str,
        f: impl Fn(&mut HostCtx, &[Value]) -> Result<Value> + 'static,
    ) {
        self.add_function(name, f);
    }

    /// Register a test for the `is` operator; it should return a boolean.
    pub fn add_test(
        &mut self,
        name: &str,
        f: impl Fn(&mut HostCtx, &[Value]) -> Result<Value> + 'static,
    ) {
        self.add_function(name, f);
    }

    /// Register a constant value visible to every render.
    pub fn add_value(&mut self, name: &str, value: &HostValue) {
        let v = build_value(&mut self.heap, ROOT_SCOPE, value);
        self.env.add(
            name,
            Upvalue {
                slot: UpvalueSlot::Value(v),
                fixed: false,
            },
            true,
        );
    }

    /// Register a user class: constructor, method table and slot overrides.
    /// Returns the class's stable type tag. Instance teardown happens
    /// through the `Drop` impl of the constructor's data.
    pub fn add_class(
        &mut self,
        name: &str,
        ctor: impl Fn(&mut HostCtx, &[Value]) -> Result<Box<dyn Any>> + 'static,
        methods: Vec<(String, crate::object::MethodFn)>,
        slots: ClassSlots,
    ) -> u32 {
        let tag = self.next_tag;
        self.next_tag += 1;
        let class = Rc::new(ClassDef {
            name: name.to_string(),
            tag,
            ctor: Rc::new(ctor),
            methods,
            slots,
        });
        self.env.add(
            name,
            Upvalue {
                slot: UpvalueSlot::ClassCtor(class),
                fixed: false,
            },
            true,
        );
        tag
    }

    /// Whether the environment has a binding for `name`.
    pub fn env_has(&self, name: &str) -> bool {
        self.env.find(name, None).is_some()
    }

    /// Remove the visible environment binding of `name`.
    pub fn env_del(&mut self, name: &str) -> bool {
        self.env.del(name)
    }

    /// Drop every environment registration, including the builtins.
    pub fn env_clear(&mut self) {
        self.env.clear_head();
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// Render a template loaded through the VFS (compiling on cache miss or
    /// staleness) into `out`.
    pub fn render_file(&mut self, out: &mut Output, path: &str) -> Result<()> {
        self.render_file_with(out, path, &[])
    }

    /// Like [`Engine::render_file`] with additional render-scoped bindings.
    pub fn render_file_with(
        &mut self,
        out: &mut Output,
        path: &str,
        vars: &[(&str, HostValue)],
    ) -> Result<()> {
        let template = {
            let Engine { heap, store, .. } = self;
            store.load_template(heap, path)?
        };
        let base = self.heap.enter_scope(ROOT_SCOPE);
        let result = self.run_render(out, template, base, vars);
        self.heap.exit_scope(base);
        result
    }

    /// Render template source provided inline under a logical name.
    pub fn render_data(&mut self, out: &mut Output, name: &str, source: &str) -> Result<()> {
        self.render_data_with(out, name, source, &[])
    }

    /// Like [`Engine::render_data`] with additional render-scoped bindings.
    pub fn render_data_with(
        &mut self,
        out: &mut Output,
        name: &str,
        source: &str,
        vars: &[(&str, HostValue)],
    ) -> Result<()> {
        let template = parser::compile(&mut self.heap, name, source)?;
        let template = optimizer::optimize_template(template)?;
        let base = self.heap.enter_scope(ROOT_SCOPE);
        let obj = self.heap.alloc(base, Payload::Template(template));
        let result = self.run_render(out, obj, base, vars);
        self.heap.exit_scope(base);
        result
    }

    /// Compile (and optimize) source and return its instruction listing.
    pub fn dump(&mut self, name: &str, source: &str) -> Result<String> {
        let template = parser::compile(&mut self.heap, name, source)?;
        let template = optimizer::optimize_template(template)?;
        Ok(template.dump())
    }

    fn run_render(
        &mut self,
        out: &mut Output,
        template: ObjRef,
        base: ScopeId,
        vars: &[(&str, HostValue)],
    ) -> Result<()> {
        // Render-scoped table: per-render host bindings plus everything the
        // VM binds during execution; dropped wholesale afterwards.
        self.env.push_table();
        for (name, hv) in vars {
            let v = build_value(&mut self.heap, base, hv);
            self.env.add(
                name,
                Upvalue {
                    slot: UpvalueSlot::Value(v),
                    fixed: false,
                },
                true,
            );
        }
        // The extends chain is collected during execution; start clean.
        if let Some(o) = self.heap.get_mut(template)
            && let Payload::Template(t) = &mut o.payload
        {
            t.parents.clear();
        }
        let result = {
            let Engine {
                heap,
                env,
                store,
                limits,
                ..
            } = self;
            let mut vm = Vm::new(heap, env, store, out, *limits, base);
            vm.render(template)
        };
        self.env.pop_table();
        result
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
