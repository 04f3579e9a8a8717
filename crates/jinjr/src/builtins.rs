//! Builtin functions, filters and tests registered into every engine's
//! environment table.
//!
//! Filters share the plain function signature; the piped value arrives as
//! the first argument (`v | upper` calls `upper(v)`). Tests return a
//! boolean and back the `is` operator (`x is even`).

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::json;
use crate::object::{self, CyclerState, HostCtx, Payload};
use crate::upvalue::{Upvalue, UpvalueChain, UpvalueSlot};
use crate::value::{Value, to_integer};

/// Register every builtin into the chain's head table.
pub fn install(env: &mut UpvalueChain) {
    let mut reg = |name: &str, f: Rc<dyn Fn(&mut HostCtx, &[Value]) -> Result<Value>>| {
        env.add(
            name,
            Upvalue {
                slot: UpvalueSlot::HostFn(f),
                fixed: false,
            },
            true,
        );
    };

    // --- Constructors ---
    reg("xrange", Rc::new(xrange));
    reg("cycler", Rc::new(cycler));

    // --- Filters / functions ---
    reg("abs", Rc::new(abs));
    reg("attr", Rc::new(attr));
    reg("default", Rc::new(default));
    reg("slice", Rc::new(slice));
    reg("bslice", Rc::new(bslice));
    reg("upper", Rc::new(upper));
    reg("lower", Rc::new(lower));
    reg("floor", Rc::new(floor));
    reg("ceil", Rc::new(ceil));
    reg("assert_expr", Rc::new(assert_expr));
    reg("typeof", Rc::new(type_of));
    reg("to_json", Rc::new(to_json));
    reg("to_jsonc", Rc::new(to_jsonc));
    reg("shell", Rc::new(shell));
    reg("lstrip", Rc::new(lstrip));
    reg("rstrip", Rc::new(rstrip));

    // --- Tests ---
    reg("true", Rc::new(test_true));
    reg("false", Rc::new(test_false));
    reg("none", Rc::new(test_none));
    reg("None", Rc::new(test_none));
    reg("undefined", Rc::new(test_none));
    reg("defined", Rc::new(test_defined));
    reg("divisableby", Rc::new(test_divisableby));
    reg("even", Rc::new(test_even));
    reg("odd", Rc::new(test_odd));
    reg("iterable", Rc::new(test_iterable));
    reg("mapping", Rc::new(test_mapping));
    reg("number", Rc::new(test_number));
    reg("object", Rc::new(test_object));
    reg("sameas", Rc::new(test_sameas));
    reg("string", Rc::new(test_string));
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn want(args: &[Value], n: usize, name: &str) -> Result<()> {
    if args.len() != n {
        return Err(Error::RuntimeArity(format!(
            "{name}() takes {n} argument(s), {} given",
            args.len()
        )));
    }
    Ok(())
}

fn num_arg(ctx: &HostCtx, args: &[Value], i: usize, name: &str) -> Result<f64> {
    args[i].as_number().ok_or_else(|| {
        Error::RuntimeType(format!(
            "{name}() argument {} must be a number, got {}",
            i + 1,
            ctx.type_name(&args[i])
        ))
    })
}

fn int_arg(ctx: &HostCtx, args: &[Value], i: usize, name: &str) -> Result<i64> {
    to_integer(num_arg(ctx, args, i, name)?)
        .ok_or_else(|| Error::RuntimeBound(format!("{name}() argument {} out of range", i + 1)))
}

fn str_arg(ctx: &HostCtx, args: &[Value], i: usize, name: &str) -> Result<String> {
    ctx.str_of(&args[i]).map(str::to_string).ok_or_else(|| {
        Error::RuntimeType(format!(
            "{name}() argument {} must be a string, got {}",
            i + 1,
            ctx.type_name(&args[i])
        ))
    })
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

fn xrange(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "xrange")?;
    let n = int_arg(ctx, args, 0, "xrange")?;
    Ok(object::alloc_xrange(ctx.heap, ctx.scope, n.max(0)))
}

fn cycler(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    if args.is_empty() {
        return Err(Error::RuntimeArity(
            "cycler() needs at least one element".into(),
        ));
    }
    Ok(Value::Object(ctx.heap.alloc(
        ctx.scope,
        Payload::Cycler(CyclerState {
            items: args.to_vec(),
            pos: 0,
        }),
    )))
}

// ---------------------------------------------------------------------------
// Filters / functions
// ---------------------------------------------------------------------------

fn abs(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "abs")?;
    Ok(Value::Number(num_arg(ctx, args, 0, "abs")?.abs()))
}

fn attr(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 2, "attr")?;
    object::attr_get(ctx, &args[0], &args[1])
}

fn default(_ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 2, "default")?;
    match args[0] {
        Value::None | Value::Uninit => Ok(args[1]),
        v => Ok(v),
    }
}

/// Rune-indexed substring: `slice(s, lo, hi)`.
fn slice(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 3, "slice")?;
    let s = str_arg(ctx, args, 0, "slice")?;
    let lo = int_arg(ctx, args, 1, "slice")?.max(0) as usize;
    let hi = int_arg(ctx, args, 2, "slice")?.max(0) as usize;
    let out: String = s.chars().skip(lo).take(hi.saturating_sub(lo)).collect();
    Ok(ctx.alloc_str(out))
}

/// Byte-indexed substring: `bslice(s, lo, hi)`.
fn bslice(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 3, "bslice")?;
    let s = str_arg(ctx, args, 0, "bslice")?;
    let lo = (int_arg(ctx, args, 1, "bslice")?.max(0) as usize).min(s.len());
    let hi = (int_arg(ctx, args, 2, "bslice")?.max(0) as usize).min(s.len());
    let bytes = &s.as_bytes()[lo..hi.max(lo)];
    Ok(ctx.alloc_str(String::from_utf8_lossy(bytes).into_owned()))
}

fn upper(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "upper")?;
    let s = str_arg(ctx, args, 0, "upper")?;
    Ok(ctx.alloc_str(s.to_uppercase()))
}

fn lower(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "lower")?;
    let s = str_arg(ctx, args, 0, "lower")?;
    Ok(ctx.alloc_str(s.to_lowercase()))
}

fn floor(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "floor")?;
    Ok(Value::Number(num_arg(ctx, args, 0, "floor")?.floor()))
}

fn ceil(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "ceil")?;
    Ok(Value::Number(num_arg(ctx, args, 0, "ceil")?.ceil()))
}

/// `assert_expr(cond [, message])`: abort the render when falsy.
fn assert_expr(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    if args.is_empty() || args.len() > 2 {
        return Err(Error::RuntimeArity(
            "assert_expr() takes one or two arguments".into(),
        ));
    }
    if !object::is_truthy(ctx.heap, &args[0]) {
        let msg = args
            .get(1)
            .map(|m| ctx.display(m))
            .unwrap_or_else(|| "assertion failed".to_string());
        return Err(Error::RuntimeType(format!("assertion failed: {msg}")));
    }
    Ok(ctx.alloc_str(""))
}

fn type_of(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "typeof")?;
    let name = ctx.type_name(&args[0]);
    Ok(ctx.alloc_str(name))
}

fn to_json(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "to_json")?;
    let text = json::encode(ctx.heap, &args[0])?;
    Ok(ctx.alloc_str(text))
}

fn to_jsonc(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "to_jsonc")?;
    let text = json::encode_pretty(ctx.heap, &args[0])?;
    Ok(ctx.alloc_str(text))
}

/// Run a shell command and return its stdout.
fn shell(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "shell")?;
    let cmd = str_arg(ctx, args, 0, "shell")?;
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .output()
        .map_err(|e| Error::Io(format!("shell command failed to start: {e}")))?;
    Ok(ctx.alloc_str(String::from_utf8_lossy(&output.stdout).into_owned()))
}

fn lstrip(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "lstrip")?;
    let s = str_arg(ctx, args, 0, "lstrip")?;
    Ok(ctx.alloc_str(s.trim_start().to_string()))
}

fn rstrip(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "rstrip")?;
    let s = str_arg(ctx, args, 0, "rstrip")?;
    Ok(ctx.alloc_str(s.trim_end().to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

fn test_true(_ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "true")?;
    Ok(Value::Bool(matches!(args[0], Value::Bool(true))))
}

fn test_false(_ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "false")?;
    Ok(Value::Bool(matches!(args[0], Value::Bool(false))))
}

fn test_none(_ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "none")?;
    Ok(Value::Bool(matches!(args[0], Value::None)))
}

fn test_defined(_ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "defined")?;
    Ok(Value::Bool(!matches!(
        args[0],
        Value::None | Value::Uninit
    )))
}

fn test_divisableby(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 2, "divisableby")?;
    let v = int_arg(ctx, args, 0, "divisableby")?;
    let d = int_arg(ctx, args, 1, "divisableby")?;
    if d == 0 {
        return Err(Error::RuntimeType("divisableby() by zero".into()));
    }
    Ok(Value::Bool(v % d == 0))
}

fn test_even(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "even")?;
    Ok(Value::Bool(int_arg(ctx, args, 0, "even")? % 2 == 0))
}

fn test_odd(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "odd")?;
    Ok(Value::Bool(int_arg(ctx, args, 0, "odd")? % 2 != 0))
}

fn test_iterable(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "iterable")?;
    Ok(Value::Bool(object::is_iterable(ctx.heap, &args[0])))
}

fn test_mapping(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "mapping")?;
    let is_map = args[0]
        .obj_ref()
        .is_some_and(|r| matches!(ctx.heap.payload(r), Payload::Dict(_)));
    Ok(Value::Bool(is_map))
}

fn test_number(_ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "number")?;
    Ok(Value::Bool(matches!(args[0], Value::Number(_))))
}

fn test_object(_ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "object")?;
    Ok(Value::Bool(matches!(args[0], Value::Object(_))))
}

fn test_sameas(ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 2, "sameas")?;
    let same = match (args[0].obj_ref(), args[1].obj_ref()) {
        (Some(a), Some(b)) => a == b,
        (None, None) => object::values_eq(ctx.heap, &args[0], &args[1]),
        _ => false,
    };
    Ok(Value::Bool(same))
}

fn test_string(_ctx: &mut HostCtx, args: &[Value]) -> Result<Value> {
    want(args, 1, "string")?;
    Ok(Value::Bool(matches!(args[0], Value::Str(_))))
}
