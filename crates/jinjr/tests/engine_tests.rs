//! Engine-level tests: registration API, template caching and
//! invalidation, execution limits, user classes, and error formatting.

use std::any::Any;
use std::rc::Rc;

use jinjr::{ClassSlots, Engine, Error, HostValue, Limits, MemVfs, Output, Value};
use pretty_assertions::assert_eq;

fn render_with(engine: &mut Engine, src: &str) -> String {
    let mut out = Output::memory();
    engine
        .render_data(&mut out, "test", src)
        .unwrap_or_else(|e| panic!("render failed: {e}"));
    out.detach().unwrap()
}

#[test]
fn registered_values_are_visible() {
    let mut engine = Engine::new();
    engine.add_value(
        "cfg",
        &HostValue::Dict(vec![
            ("name".into(), HostValue::Str("app".into())),
            ("workers".into(), HostValue::Number(4.0)),
        ]),
    );
    assert_eq!(render_with(&mut engine, "{{ cfg['name'] }}"), "app");
    assert_eq!(render_with(&mut engine, "{{ cfg.workers }}"), "4");
    assert!(engine.env_has("cfg"));
    assert!(engine.env_del("cfg"));
    assert!(!engine.env_has("cfg"));
}

#[test]
fn registered_functions_and_tests() {
    let mut engine = Engine::new();
    engine.add_function("double", |_ctx, args| {
        let n = args
            .first()
            .and_then(Value::as_number)
            .ok_or_else(|| Error::RuntimeType("double() needs a number".into()))?;
        Ok(Value::Number(n * 2.0))
    });
    engine.add_test("big", |_ctx, args| {
        let n = args.first().and_then(Value::as_number).unwrap_or(0.0);
        Ok(Value::Bool(n > 100.0))
    });
    assert_eq!(render_with(&mut engine, "{{ double(21) }}"), "42");
    assert_eq!(render_with(&mut engine, "{{ 200 is big }}"), "True");
    assert_eq!(render_with(&mut engine, "{{ 2 is not big }}"), "True");
}

#[test]
fn per_render_bindings_do_not_leak() {
    let mut engine = Engine::new();
    let mut out = Output::memory();
    engine
        .render_data_with(
            &mut out,
            "t",
            "{{ who }}",
            &[("who", HostValue::Str("render-scoped".into()))],
        )
        .unwrap();
    assert_eq!(out.detach().unwrap(), "render-scoped");

    // The binding disappeared with the render.
    let mut out = Output::memory();
    let err = engine.render_data(&mut out, "t", "{{ who }}").unwrap_err();
    assert!(matches!(err, Error::RuntimeLookup(_)));
}

#[test]
fn user_classes_construct_and_dispatch() {
    let mut engine = Engine::new();
    let slots = ClassSlots {
        attr_get: Some(Rc::new(|_ctx, data, key| {
            let p = data.downcast_ref::<(f64, f64)>().expect("point data");
            Err(Error::RuntimeLookup(format!(
                "point has no attribute (asked for {key:?}, holds {p:?})"
            )))
        })),
        display: Some(Rc::new(|data| {
            let p = data.downcast_ref::<(f64, f64)>().expect("point data");
            format!("({},{})", p.0, p.1)
        })),
        ..ClassSlots::default()
    };
    let tag = engine.add_class(
        "point",
        |_ctx, args| {
            let x = args.first().and_then(Value::as_number).unwrap_or(0.0);
            let y = args.get(1).and_then(Value::as_number).unwrap_or(0.0);
            Ok(Box::new((x, y)) as Box<dyn Any>)
        },
        vec![(
            "sum".to_string(),
            Rc::new(|_ctx: &mut jinjr::HostCtx, data: &mut dyn Any, _args: &[Value]| {
                let p = data.downcast_ref::<(f64, f64)>().expect("point data");
                Ok(Value::Number(p.0 + p.1))
            }) as jinjr::MethodFn,
        )],
        slots,
    );
    assert!(tag >= 100);
    assert_eq!(
        render_with(&mut engine, "{% set p = point(1, 2) %}{{ p }} {{ p.sum() }}"),
        "(1,2) 3"
    );
    assert_eq!(
        render_with(&mut engine, "{{ typeof(point(1, 2)) }}"),
        "point"
    );
}

#[test]
fn template_cache_hits_and_invalidates() {
    let vfs = Rc::new(MemVfs::new());
    vfs.insert("page.tpl", "one");
    let mut engine = Engine::with_vfs(Box::new(vfs.clone()));

    let mut out = Output::memory();
    engine.render_file(&mut out, "page.tpl").unwrap();
    assert_eq!(out.detach().unwrap(), "one");

    // Unchanged timestamp: the cached program is reused.
    let mut out = Output::memory();
    engine.render_file(&mut out, "page.tpl").unwrap();
    assert_eq!(out.detach().unwrap(), "one");

    // A newer version recompiles.
    vfs.insert("page.tpl", "two");
    let mut out = Output::memory();
    engine.render_file(&mut out, "page.tpl").unwrap();
    assert_eq!(out.detach().unwrap(), "two");
}

#[test]
fn call_stack_limit_stops_runaway_recursion() {
    let mut engine = Engine::new();
    engine.set_limits(Limits {
        call_stack: 16,
        ..Limits::default()
    });
    let mut out = Output::memory();
    let err = engine
        .render_data(
            &mut out,
            "t",
            "{% macro r %}{% do r() %}{% endmacro %}{% do r() %}",
        )
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeBound(_)));
    assert!(err.to_string().contains("call stack overflow"), "{err}");
}

#[test]
fn include_depth_limit_stops_include_cycles() {
    let vfs = Rc::new(MemVfs::new());
    vfs.insert("a.tpl", "{% include 'a.tpl' %}");
    let mut engine = Engine::with_vfs(Box::new(vfs));
    engine.set_limits(Limits {
        include_depth: 4,
        ..Limits::default()
    });
    let mut out = Output::memory();
    let err = engine.render_file(&mut out, "a.tpl").unwrap_err();
    assert!(matches!(err, Error::RuntimeBound(_)));
}

#[test]
fn extends_chain_cap_accepts_eight_rejects_nine() {
    // t0 extends t1 extends ...; the root collects every ancestor.
    let build = |depth: usize| -> Engine {
        let vfs = Rc::new(MemVfs::new());
        for i in 0..depth {
            vfs.insert(format!("t{i}.tpl"), format!("{{% extends 't{}.tpl' %}}", i + 1));
        }
        vfs.insert(format!("t{depth}.tpl"), "end");
        Engine::with_vfs(Box::new(vfs))
    };

    // Chain of exactly eight parents renders.
    let mut engine = build(8);
    let mut out = Output::memory();
    engine.render_file(&mut out, "t0.tpl").unwrap();
    assert_eq!(out.detach().unwrap(), "end");

    // One deeper fails cleanly.
    let mut engine = build(9);
    let mut out = Output::memory();
    let err = engine.render_file(&mut out, "t0.tpl").unwrap_err();
    assert!(matches!(err, Error::RuntimeBound(_)));
    assert!(err.to_string().contains("extends chain"), "{err}");
}

#[test]
fn missing_template_file_is_an_io_error() {
    let mut engine = Engine::with_vfs(Box::new(MemVfs::new()));
    let mut out = Output::memory();
    let err = engine.render_file(&mut out, "ghost.tpl").unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn parse_errors_carry_coordinates() {
    let mut engine = Engine::new();
    let mut out = Output::memory();
    let err = engine
        .render_data(&mut out, "bad", "line one\n{{ 1 + }}")
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("[Parse:(bad:2,"), "{msg}");
    assert!(msg.contains("Message:"), "{msg}");
}

#[test]
fn dump_shows_the_folded_program() {
    let mut engine = Engine::new();
    let listing = engine.dump("t", "{{ 1 + 2 * 3 }}").unwrap();
    // After optimization the expression is a single constant load.
    let loads = listing
        .lines()
        .filter(|l| l.contains("lnum") || l.contains("lzero") || l.contains("limm"))
        .count();
    assert_eq!(loads, 1);
    assert!(listing.contains("print"));
    assert!(listing.contains("; 7"));
}

#[test]
fn optimizing_twice_changes_nothing() {
    // Idempotence observed through the listing.
    let mut engine = Engine::new();
    let src = "{% set x = 1 %}{{ x + 2 * 3 }}{% if 1 > 2 %}a{% endif %}";
    let first = engine.dump("t", src).unwrap();
    let second = engine.dump("t", src).unwrap();
    assert_eq!(first, second);
}
