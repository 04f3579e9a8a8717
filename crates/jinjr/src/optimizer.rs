//! Peephole optimizer: constant folding and dead-instruction removal.
//!
//! Works per program in two passes. Pass 1 rebuilds the instruction buffer,
//! dropping NOPs and folding windows of constant loads feeding an
//! arithmetic, comparison or logical instruction into a single constant
//! load; every removal is recorded as a shrink offset at its old position.
//! Pass 2 re-maps the target of every jump through the shrink table by
//! binary search.
//!
//! Folding is conservative: a window is only folded when the operation is
//! truly invariant and no jump enters the middle of the window. Fold-time
//! division by zero and multiplying two strings are compile errors; every
//! other non-foldable pairing is left for the runtime to report.

use std::collections::HashSet;
use std::rc::Rc;

use crate::bytecode::{Op, Program, Template, TemplateFn};
use crate::diagnostic::{self, Phase};
use crate::error::{Error, Result};
use crate::value::format_number;

/// Optimize every function of a compiled template.
pub fn optimize_template(template: Template) -> Result<Template> {
    let source = template.source.clone();
    let mut out = Template::new(template.name.clone(), source.clone());
    out.parents = template.parents.clone();
    for f in &template.functions {
        let unit = format!("{}:{}", template.name, f.name);
        let prg = optimize(&f.program, &unit, &source)?;
        out.functions.push(TemplateFn {
            name: f.name.clone(),
            kind: f.kind,
            program: Rc::new(prg),
        });
    }
    Ok(out)
}

/// A constant known at fold time.
#[derive(Debug, Clone, PartialEq)]
enum Const {
    None,
    Bool(bool),
    Num(f64),
    Str(Rc<str>),
}

impl Const {
    fn truthy(&self) -> bool {
        match self {
            Const::None => false,
            Const::Bool(b) => *b,
            Const::Num(n) => *n != 0.0,
            Const::Str(s) => !s.is_empty(),
        }
    }

    fn as_num(&self) -> Option<f64> {
        match self {
            Const::Num(n) => Some(*n),
            Const::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn display(&self) -> String {
        match self {
            Const::None => "None".into(),
            Const::Bool(b) => if *b { "True" } else { "False" }.into(),
            Const::Num(n) => format_number(*n),
            Const::Str(s) => s.to_string(),
        }
    }
}

/// Outcome of a fold attempt.
enum Fold {
    /// Replace the window with this constant.
    Value(Const),
    /// Leave the window alone.
    Skip,
}

/// Optimize one program. Returns a new program sharing the constant-table
/// contents (plus any constants introduced by folding).
pub fn optimize(prg: &Program, unit: &str, src: &str) -> Result<Program> {
    let targets = jump_targets(prg);

    let mut out = Program {
        ops: Vec::with_capacity(prg.ops.len()),
        spans: Vec::with_capacity(prg.spans.len()),
        str_tbl: prg.str_tbl.clone(),
        num_tbl: prg.num_tbl.clone(),
        params: prg.params.clone(),
    };
    // Old position of each instruction in `out`.
    let mut out_old: Vec<u32> = Vec::with_capacity(prg.ops.len());
    // Old positions of removed instructions; sorted after pass 1 and then
    // binary-searched to shrink jump targets.
    let mut removed: Vec<u32> = Vec::new();

    let fail = |at: u32, detail: &str| {
        Error::Optimize(diagnostic::message(
            Phase::Optimize,
            unit,
            src,
            at as usize,
            detail,
        ))
    };

    for (i, op) in prg.ops.iter().enumerate() {
        let i = i as u32;
        let span = prg.spans[i as usize];

        if op.is_nop() {
            removed.push(i);
            continue;
        }

        // Binary fold: [load a, load b, op] → [load r]. Blocked when a jump
        // enters at the second load or at the operation itself; a jump to
        // the first load still observes one value pushed either way.
        if is_binary_fold_op(op) && out.ops.len() >= 2 {
            let b_pos = out.ops.len() - 1;
            let a_pos = out.ops.len() - 2;
            if out.ops[b_pos].is_const_load()
                && out.ops[a_pos].is_const_load()
                && !targets.contains(&out_old[b_pos])
                && !targets.contains(&i)
            {
                let a = read_const(&out, out.ops[a_pos]);
                let b = read_const(&out, out.ops[b_pos]);
                match fold_binary(op, &a, &b).map_err(|msg| fail(span, &msg))? {
                    Fold::Value(v) => {
                        if let Some(load) = make_load(&mut out, &v) {
                            removed.push(out_old[b_pos]);
                            removed.push(i);
                            let old = out_old[a_pos];
                            out.ops.truncate(a_pos);
                            out.spans.truncate(a_pos);
                            out_old.truncate(a_pos);
                            out.ops.push(load);
                            out.spans.push(span);
                            out_old.push(old);
                            continue;
                        }
                        // Constant table full: keep the window as-is.
                    }
                    Fold::Skip => {}
                }
            }
        }

        // Unary fold: [load a, op] → [load r].
        if matches!(op, Op::Not | Op::Neg) && !out.ops.is_empty() {
            let a_pos = out.ops.len() - 1;
            if out.ops[a_pos].is_const_load() && !targets.contains(&i) {
                let a = read_const(&out, out.ops[a_pos]);
                let folded = match op {
                    Op::Not => Some(Const::Bool(!a.truthy())),
                    Op::Neg => a.as_num().map(|n| Const::Num(-n)),
                    _ => unreachable!(),
                };
                if let Some(v) = folded
                    && let Some(load) = make_load(&mut out, &v)
                {
                    removed.push(i);
                    let old = out_old[a_pos];
                    out.ops.truncate(a_pos);
                    out.spans.truncate(a_pos);
                    out_old.truncate(a_pos);
                    out.ops.push(load);
                    out.spans.push(span);
                    out_old.push(old);
                    continue;
                }
            }
        }

        out.ops.push(*op);
        out.spans.push(span);
        out_old.push(i);
    }

    // Pass 2: re-map jump targets through the shrink table.
    removed.sort_unstable();
    for op in out.ops.iter_mut() {
        if let Some(target) = jump_target(op) {
            let mapped = remap(&removed, target);
            set_jump_target(op, mapped);
        }
    }
    Ok(out)
}

/// Map an old instruction position to its post-shrink position: subtract
/// the number of removals recorded strictly before it. Binary search over
/// the sorted removal table.
fn remap(removed: &[u32], old: u32) -> u32 {
    old - removed.partition_point(|&pos| pos < old) as u32
}

fn jump_targets(prg: &Program) -> HashSet<u32> {
    prg.ops.iter().filter_map(jump_target_ref).collect()
}

fn jump_target_ref(op: &Op) -> Option<u32> {
    jump_target(op)
}

fn jump_target(op: &Op) -> Option<u32> {
    match *op {
        Op::Jmp(t)
        | Op::Jt(t)
        | Op::Jf(t)
        | Op::Jlt(t)
        | Op::Jlf(t)
        | Op::Jept(t)
        | Op::Jmpc(_, t) => Some(t),
        _ => None,
    }
}

fn set_jump_target(op: &mut Op, target: u32) {
    match op {
        Op::Jmp(t)
        | Op::Jt(t)
        | Op::Jf(t)
        | Op::Jlt(t)
        | Op::Jlf(t)
        | Op::Jept(t)
        | Op::Jmpc(_, t) => *t = target,
        _ => unreachable!("not a jump"),
    }
}

fn is_binary_fold_op(op: &Op) -> bool {
    matches!(
        op,
        Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Pow
            | Op::DivTrunc
            | Op::Eq
            | Op::Ne
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::And
            | Op::Or
            | Op::Cat
    )
}

/// Decode the constant a load instruction pushes.
fn read_const(prg: &Program, op: Op) -> Const {
    match op {
        Op::LStr(i) => Const::Str(prg.str_tbl[i as usize].clone()),
        Op::LNum(i) => Const::Num(prg.num_tbl[i as usize]),
        Op::LImm(n) => Const::Num(n as f64),
        Op::LTrue => Const::Bool(true),
        Op::LFalse => Const::Bool(false),
        Op::LNone => Const::None,
        Op::LZero => Const::Num(0.0),
        _ => unreachable!("not a constant load"),
    }
}

/// Encode a constant back into a load instruction, interning into the
/// program's tables. `None` when a table is full (the fold is abandoned).
fn make_load(prg: &mut Program, v: &Const) -> Option<Op> {
    match v {
        Const::None => Some(Op::LNone),
        Const::Bool(true) => Some(Op::LTrue),
        Const::Bool(false) => Some(Op::LFalse),
        Const::Num(n) if *n == 0.0 && n.is_sign_positive() => Some(Op::LZero),
        Const::Num(n) => prg.add_num(*n).map(Op::LNum),
        Const::Str(s) => prg.add_str(s).map(Op::LStr),
    }
}

/// Fold a binary operation over two constants. `Err` carries the message
/// for a fold-time compile error.
fn fold_binary(op: &Op, a: &Const, b: &Const) -> std::result::Result<Fold, String> {
    use Const::{Num, Str};
    let fold = |c| Ok(Fold::Value(c));
    match op {
        Op::Add => match (a, b) {
            (Str(_), _) | (_, Str(_)) => fold(Const::Str(Rc::from(
                format!("{}{}", a.display(), b.display()).as_str(),
            ))),
            _ => match (a.as_num(), b.as_num()) {
                (Some(x), Some(y)) => fold(Num(x + y)),
                _ => Ok(Fold::Skip),
            },
        },
        Op::Sub => num_fold(a, b, |x, y| Ok(x - y)),
        Op::Mul => match (a, b) {
            (Str(_), Str(_)) => Err("cannot multiply two strings".into()),
            (Str(s), other) | (other, Str(s)) => match other.as_num() {
                Some(n) => {
                    let count = n.trunc().max(0.0) as usize;
                    fold(Const::Str(Rc::from(s.repeat(count).as_str())))
                }
                None => Ok(Fold::Skip),
            },
            _ => num_fold(a, b, |x, y| Ok(x * y)),
        },
        Op::Div => num_fold(a, b, |x, y| {
            if y == 0.0 {
                Err("division by zero".to_string())
            } else {
                Ok(x / y)
            }
        }),
        Op::DivTrunc => num_fold(a, b, |x, y| {
            if y == 0.0 {
                Err("division by zero".to_string())
            } else {
                Ok((x / y).trunc())
            }
        }),
        Op::Mod => num_fold(a, b, |x, y| {
            if y == 0.0 {
                Err("modulo by zero".to_string())
            } else {
                Ok(x % y)
            }
        }),
        Op::Pow => num_fold(a, b, |x, y| Ok(x.powf(y))),
        Op::Eq => fold(Const::Bool(const_eq(a, b))),
        Op::Ne => fold(Const::Bool(!const_eq(a, b))),
        Op::Lt | Op::Le | Op::Gt | Op::Ge => match (a, b) {
            (Str(x), Str(y)) => {
                let ord = x.as_bytes().cmp(y.as_bytes());
                fold(Const::Bool(ord_matches(op, ord)))
            }
            _ => match (a.as_num(), b.as_num()) {
                (Some(x), Some(y)) => match x.partial_cmp(&y) {
                    Some(ord) => fold(Const::Bool(ord_matches(op, ord))),
                    None => Ok(Fold::Skip),
                },
                _ => Ok(Fold::Skip),
            },
        },
        Op::And => fold(if a.truthy() { b.clone() } else { a.clone() }),
        Op::Or => fold(if a.truthy() { a.clone() } else { b.clone() }),
        Op::Cat => fold(Const::Str(Rc::from(
            format!("{}{}", a.display(), b.display()).as_str(),
        ))),
        _ => Ok(Fold::Skip),
    }
}

fn num_fold(
    a: &Const,
    b: &Const,
    f: impl Fn(f64, f64) -> std::result::Result<f64, String>,
) -> std::result::Result<Fold, String> {
    match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => Ok(Fold::Value(Const::Num(f(x, y)?))),
        _ => Ok(Fold::Skip),
    }
}

fn const_eq(a: &Const, b: &Const) -> bool {
    match (a, b) {
        (Const::Str(x), Const::Str(y)) => x == y,
        (Const::None, Const::None) => true,
        _ => match (a.as_num(), b.as_num()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn ord_matches(op: &Op, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};
    match op {
        Op::Lt => ord == Less,
        Op::Le => ord != Greater,
        Op::Gt => ord == Greater,
        Op::Ge => ord != Less,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prg(ops: Vec<Op>) -> Program {
        let spans = vec![0; ops.len()];
        Program {
            ops,
            spans,
            str_tbl: Vec::new(),
            num_tbl: Vec::new(),
            params: Vec::new(),
        }
    }

    fn num_load(prg: &mut Program, n: f64) -> Op {
        Op::LNum(prg.add_num(n).unwrap())
    }

    #[test]
    fn folds_arithmetic_chains() {
        // 1 + 2 * 3 → 7
        let mut p = prg(vec![]);
        let l1 = num_load(&mut p, 1.0);
        let l2 = num_load(&mut p, 2.0);
        let l3 = num_load(&mut p, 3.0);
        p.ops = vec![l1, l2, l3, Op::Mul, Op::Add, Op::Print, Op::Ret];
        p.spans = vec![0; p.ops.len()];
        let out = optimize(&p, "t", "").unwrap();
        let loads: Vec<&Op> = out.ops.iter().filter(|o| o.is_const_load()).collect();
        assert_eq!(loads.len(), 1);
        match loads[0] {
            Op::LNum(i) => assert_eq!(out.num_tbl[*i as usize], 7.0),
            other => panic!("expected a number load, got {other:?}"),
        }
        assert_eq!(out.ops.len(), 3); // load, print, ret
    }

    #[test]
    fn removes_nops_and_repatches_jumps() {
        let mut p = prg(vec![]);
        let l = num_load(&mut p, 5.0);
        // 0:jmp 3, 1:nop, 2:nop, 3:load, 4:ret
        p.ops = vec![Op::Jmp(3), Op::Nop0, Op::Nop0, l, Op::Ret];
        p.spans = vec![0; p.ops.len()];
        let out = optimize(&p, "t", "").unwrap();
        assert_eq!(out.ops.len(), 3);
        assert_eq!(out.ops[0], Op::Jmp(1));
    }

    #[test]
    fn jump_into_window_blocks_folding() {
        let mut p = prg(vec![]);
        let l2 = num_load(&mut p, 2.0);
        let l3 = num_load(&mut p, 3.0);
        // 0:jmp 2 (into the middle), 1:load 2, 2:load 3, 3:add, 4:ret
        p.ops = vec![Op::Jmp(2), l2, l3, Op::Add, Op::Ret];
        p.spans = vec![0; p.ops.len()];
        let out = optimize(&p, "t", "").unwrap();
        // Nothing folded: the add still exists.
        assert!(out.ops.contains(&Op::Add));
        assert_eq!(out.ops.len(), 5);
    }

    #[test]
    fn fold_time_division_by_zero_is_an_error() {
        let mut p = prg(vec![]);
        let l1 = num_load(&mut p, 1.0);
        p.ops = vec![l1, Op::LZero, Op::Div, Op::Ret];
        p.spans = vec![0; p.ops.len()];
        let err = optimize(&p, "t", "").unwrap_err();
        assert!(matches!(err, Error::Optimize(_)));
    }

    #[test]
    fn string_by_number_repeats_and_string_pair_fails() {
        let mut p = prg(vec![]);
        let s = Op::LStr(p.add_str("ab").unwrap());
        let n = num_load(&mut p, 3.0);
        p.ops = vec![s, n, Op::Mul, Op::Ret];
        p.spans = vec![0; p.ops.len()];
        let out = optimize(&p, "t", "").unwrap();
        match out.ops[0] {
            Op::LStr(i) => assert_eq!(out.str_tbl[i as usize].as_ref(), "ababab"),
            other => panic!("expected a string load, got {other:?}"),
        }

        let mut p2 = prg(vec![]);
        let a = Op::LStr(p2.add_str("a").unwrap());
        let b = Op::LStr(p2.add_str("b").unwrap());
        p2.ops = vec![a, b, Op::Mul, Op::Ret];
        p2.spans = vec![0; p2.ops.len()];
        assert!(matches!(
            optimize(&p2, "t", "").unwrap_err(),
            Error::Optimize(_)
        ));
    }

    #[test]
    fn string_concatenation_folds() {
        let mut p = prg(vec![]);
        let a = Op::LStr(p.add_str("foo").unwrap());
        let b = Op::LStr(p.add_str("bar").unwrap());
        p.ops = vec![a, b, Op::Add, Op::Ret];
        p.spans = vec![0; p.ops.len()];
        let out = optimize(&p, "t", "").unwrap();
        match out.ops[0] {
            Op::LStr(i) => assert_eq!(out.str_tbl[i as usize].as_ref(), "foobar"),
            other => panic!("expected a string load, got {other:?}"),
        }
    }

    #[test]
    fn optimize_is_idempotent() {
        let mut p = prg(vec![]);
        let l1 = num_load(&mut p, 1.0);
        let l2 = num_load(&mut p, 2.0);
        p.ops = vec![
            Op::Nop0,
            l1,
            l2,
            Op::Add,
            Op::Jmp(6),
            Op::Nop0,
            Op::Print,
            Op::Ret,
        ];
        p.spans = vec![0; p.ops.len()];
        let once = optimize(&p, "t", "").unwrap();
        let twice = optimize(&once, "t", "").unwrap();
        assert_eq!(once.ops, twice.ops);
    }

    #[test]
    fn logical_folds_keep_python_semantics() {
        let mut p = prg(vec![]);
        let z = Op::LZero;
        let l5 = num_load(&mut p, 5.0);
        p.ops = vec![z, l5, Op::Or, Op::Ret];
        p.spans = vec![0; p.ops.len()];
        let out = optimize(&p, "t", "").unwrap();
        // 0 or 5 → 5
        match out.ops[0] {
            Op::LNum(i) => assert_eq!(out.num_tbl[i as usize], 5.0),
            other => panic!("expected a number load, got {other:?}"),
        }
    }
}
