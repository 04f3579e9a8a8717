//! Jinjr - a Jinja-style template engine on a bytecode VM
//!
//! Jinjr compiles template source into bytecode in a single parser pass and
//! executes it on a stack-based virtual machine with scoped automatic
//! memory management: every heap value belongs to exactly one GC scope,
//! scopes tear down in bulk, and `{% move %}` re-parents values that must
//! escape outward.
//!
//! # Quick Start
//!
//! ```
//! use jinjr::{Engine, HostValue, Output};
//!
//! let mut engine = Engine::new();
//! let mut out = Output::memory();
//! engine
//!     .render_data_with(
//!         &mut out,
//!         "hello",
//!         "Hello {{ who }}!",
//!         &[("who", HostValue::Str("world".into()))],
//!     )
//!     .unwrap();
//! assert_eq!(out.content(), Some("Hello world!"));
//! ```
//!
//! # Template Language
//!
//! ## Expressions
//! - Literals: numbers, `'strings'`, `true`/`false`, `none`, `[lists]`,
//!   `{'dicts': 1}`
//! - Operators: `+ - * / // % **`, comparisons, `and or not`, `in`,
//!   `a if c else b`, `~` (concat), `#` (length)
//! - Postfix: `obj.attr`, `obj[key]`, `f(args)`, `v | filter(args)`,
//!   `x is test`
//! - Methods: `list.append/extend/pop_back/count/clear`,
//!   `dict.set/get/update/pop/has_key/count/clear`, `cycler.reset/next`
//!
//! ## Statements
//! - `{% if %}` / `{% elif %}` / `{% else %}` / `{% endif %}`
//! - `{% for [k,] v in e [if cond] [recursive] %}` with `{% else %}`,
//!   `{% break %}`, `{% continue %}` and the `loop` variable
//! - `{% macro name(a, b=1) %}`, `{% block name %}`, `{% call %}` with
//!   `caller()`, `{% filter name %}`
//! - `{% set x = e %}` and block form, `{% with x = e %}`, `{% do e %}`,
//!   `{% move dst = src %}`, `{% upvalue name = e %}`
//! - `{% include e %}` (plain, with upvalues, or with JSON data),
//!   `{% import e as m %}`, `{% from e import a, b %}`
//! - `{% extends e %}` with block overriding and `super()`
//! - `{% raw %}` verbatim text, `{# comments #}`
//!
//! ## Host integration
//! - Register functions, filters, tests, classes and values on the
//!   [`Engine`]
//! - Templates load through a [`Vfs`] with timestamp-based cache
//!   invalidation; output goes to an [`Output`] sink
//!
//! # Not Supported
//!
//! - Concurrency inside one render (renders are strictly sequential)
//! - A compiled on-disk template format; templates compile from source on
//!   demand
//! - Tuples: parenthesised sequences are lists

mod builtins;
mod bytecode;
mod diagnostic;
mod engine;
mod error;
mod heap;
mod io;
mod json;
mod lexer;
mod object;
mod optimizer;
mod parser;
mod upvalue;
mod value;
mod vfs;
mod vm;

pub use engine::{Engine, HostValue};
pub use error::{Error, Result};
pub use heap::{Heap, ObjRef, ScopeId};
pub use io::Output;
pub use object::{ClassSlots, CtorFn, HostCtx, HostFn, MethodFn};
pub use value::Value;
pub use vfs::{DiskVfs, MemVfs, Vfs};
pub use vm::Limits;
