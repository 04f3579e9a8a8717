//! End-to-end rendering tests: every statement form, expression operators,
//! the loop protocol, scoped memory moves, and cross-template transfers.

use std::rc::Rc;

use jinjr::{Engine, Error, MemVfs, Output, Value};
use pretty_assertions::assert_eq;

/// Render inline source with a default engine.
fn render(src: &str) -> String {
    let mut engine = Engine::new();
    let mut out = Output::memory();
    engine
        .render_data(&mut out, "test", src)
        .unwrap_or_else(|e| panic!("render failed: {e}\nsource: {src}"));
    out.detach().unwrap()
}

fn render_err(src: &str) -> Error {
    let mut engine = Engine::new();
    let mut out = Output::memory();
    engine
        .render_data(&mut out, "test", src)
        .expect_err("expected the render to fail")
}

/// An engine whose VFS the test can keep writing to.
fn engine_with_files(files: &[(&str, &str)]) -> Engine {
    let vfs = Rc::new(MemVfs::new());
    for (path, content) in files {
        vfs.insert(*path, *content);
    }
    Engine::with_vfs(Box::new(vfs))
}

// ---------------------------------------------------------------------------
// Basics
// ---------------------------------------------------------------------------

#[test]
fn empty_template_renders_nothing() {
    assert_eq!(render(""), "");
}

#[test]
fn plain_text_passes_through() {
    assert_eq!(render("just text"), "just text");
}

#[test]
fn constant_arithmetic() {
    assert_eq!(render("{{ 1 + 2 * 3 }}"), "7");
    assert_eq!(render("{{ 2 ** 3 ** 2 }}"), "512"); // right-assoc
    assert_eq!(render("{{ 7 // 2 }}"), "3");
    assert_eq!(render("{{ 7 % 4 }}"), "3");
    assert_eq!(render("{{ 1.5 + 1 }}"), "2.5");
}

#[test]
fn string_operators() {
    assert_eq!(render("{{ 'a' ~ 1 }}"), "a1");
    assert_eq!(render("{{ 'ab' * 2 }}"), "abab");
    assert_eq!(render("{{ 'x' + 'y' }}"), "xy");
    assert_eq!(render("{{ #'abc' }}"), "3");
    assert_eq!(render("{{ #[1, 2, 3] }}"), "3");
}

#[test]
fn comparisons_and_membership() {
    assert_eq!(render("{{ 1 < 2 }}"), "True");
    assert_eq!(render("{{ 'abc' < 'abd' }}"), "True");
    assert_eq!(render("{{ [1, 2] == [1, 2] }}"), "True");
    assert_eq!(render("{{ 1 == 'one' }}"), "False");
    assert_eq!(render("{{ 2 in [1, 2] }}"), "True");
    assert_eq!(render("{{ 'x' not in 'abc' }}"), "True");
    assert_eq!(render("{{ 'b' in {'a': 1, 'b': 2} }}"), "True");
}

#[test]
fn logic_keeps_operand_values() {
    assert_eq!(render("{{ 0 or 5 }}"), "5");
    assert_eq!(render("{{ none and 1 }}"), "None");
    assert_eq!(render("{{ not 0 }}"), "True");
    assert_eq!(render("{{ 1 and 2 and 3 }}"), "3");
}

#[test]
fn ternary_expression() {
    assert_eq!(render("{{ 'y' if 1 > 0 else 'n' }}"), "y");
    assert_eq!(render("{{ 'y' if 0 else 'n' }}"), "n");
}

#[test]
fn comments_are_dropped() {
    assert_eq!(render("a{# gone #}b"), "ab");
}

#[test]
fn raw_blocks_are_verbatim() {
    assert_eq!(render("{% raw %}{{ not a tag }}{% endraw %}"), "{{ not a tag }}");
}

#[test]
fn escaped_delimiters() {
    assert_eq!(render(r"\{{ literal \}}"), "{{ literal }}");
}

#[test]
fn whitespace_control_trims_standalone_tag_lines() {
    let out = render("Hello\n{% if true %}\nWorld\n{% endif %}\n");
    assert_eq!(out, "Hello\nWorld\n");
}

#[test]
fn inline_tags_preserve_surrounding_text() {
    assert_eq!(render("a {% if true %}b{% endif %} c"), "a b c");
}

// ---------------------------------------------------------------------------
// Variables and scopes
// ---------------------------------------------------------------------------

#[test]
fn set_and_read_locals() {
    assert_eq!(render("{% set x = 5 %}{{ x }}"), "5");
    assert_eq!(render("{% set x = 1 %}{% set x = x + 1 %}{{ x }}"), "2");
}

#[test]
fn set_block_captures_output() {
    assert_eq!(render("{% set x %}hello {{ 1 + 1 }}{% endset %}{{ x }}"), "hello 2");
}

#[test]
fn with_scopes_shadow_and_restore() {
    assert_eq!(
        render("{% set a = 1 %}{% with a = 2, b = a + 1 %}{{ a }}{{ b }}{% endwith %}{{ a }}"),
        "231"
    );
}

#[test]
fn upvalue_statement_binds_over_its_body() {
    assert_eq!(render("{% upvalue g = 42 %}{{ g }}{% endupvalue %}"), "42");
}

#[test]
fn do_discards_its_value() {
    assert_eq!(render("{% do [1, 2] %}ok"), "ok");
}

#[test]
fn move_lifts_a_value_out_of_its_scope() {
    let src = "{% set L = 0 %}{% with %}{% set I = [1,2,3] %}{% move L = I %}{% endwith %}{{ L[2] }}";
    assert_eq!(render(src), "3");
}

#[test]
fn subscripts_and_attributes() {
    assert_eq!(render("{% set l = [10, 20] %}{{ l[1] }}"), "20");
    assert_eq!(render("{% set d = {'k': 'v'} %}{{ d['k'] }}{{ d.k }}"), "vv");
    assert_eq!(render("{{ {'k': 'v'} | attr('k') }}"), "v");
    assert_eq!(render("{{ 'abc'[1] }}"), "b");
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

#[test]
fn if_elif_else_chains() {
    assert_eq!(render("{% if 2 > 3 %}a{% elif 2 > 1 %}b{% else %}c{% endif %}"), "b");
    assert_eq!(render("{% if 1 %}a{% endif %}"), "a");
    assert_eq!(render("{% if 0 %}a{% endif %}"), "");
    assert_eq!(render("{% if 0 %}a{% else %}b{% endif %}"), "b");
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

#[test]
fn for_over_list() {
    assert_eq!(render("{% for x in [1, 2, 3] %}{{ x }}{% endfor %}"), "123");
}

#[test]
fn for_over_dict_yields_keys_and_values() {
    assert_eq!(
        render("{% for k, v in {'a': 1, 'b': 2} %}{{ k }}={{ v }};{% endfor %}"),
        "a=1;b=2;"
    );
}

#[test]
fn for_over_xrange() {
    assert_eq!(render("{% for i in xrange(3) %}{{ i }}{% endfor %}"), "012");
}

#[test]
fn for_else_branches_on_emptiness() {
    assert_eq!(render("{% for x in [] %}A{% else %}B{% endfor %}"), "B");
    assert_eq!(render("{% for x in [1] %}A{% else %}B{% endfor %}"), "A");
}

#[test]
fn loop_variable_tracks_iteration() {
    let src = "{% for x in [10, 20, 30] %}{{ loop.index0 }}:{{ x }}{% if not loop.last %},{% endif %}{% endfor %}";
    assert_eq!(render(src), "0:10,1:20,2:30");
    let src = "{% for x in ['a'] %}{{ loop.first }} {{ loop.last }} {{ loop.length }} {{ loop.index }} {{ loop.revindex }}{% endfor %}";
    assert_eq!(render(src), "True True 1 1 1");
}

#[test]
fn nested_loops_shadow_the_loop_variable() {
    let src = "{% for x in [1, 2] %}{% for y in [1] %}{{ loop.index }}{% endfor %}{{ loop.index }}{% endfor %}";
    assert_eq!(render(src), "1112");
}

#[test]
fn break_and_continue() {
    assert_eq!(
        render("{% for x in [1,2,3,4] %}{% if x == 3 %}{% break %}{% endif %}{{ x }}{% endfor %}"),
        "12"
    );
    assert_eq!(
        render("{% for x in [1,2,3,4] %}{% if x == 2 %}{% continue %}{% endif %}{{ x }}{% endfor %}"),
        "134"
    );
}

#[test]
fn loop_filter_skips_elements() {
    assert_eq!(
        render("{% for x in [1,2,3,4] if x % 2 == 0 %}{{ x }}{% endfor %}"),
        "24"
    );
}

#[test]
fn placeholder_key_iterates_values_only() {
    assert_eq!(
        render("{% for _, v in {'a': 1, 'b': 2} %}{{ v }}{% endfor %}"),
        "12"
    );
}

#[test]
fn recursive_loop_descends_into_children() {
    let src = "{% set t = [[1, [[2, []], [3, []]]]] %}\
               {% for p in t recursive %}{{ p[0] }}{{ loop(p[1]) }}{% endfor %}";
    assert_eq!(render(src), "123");
}

#[test]
fn for_loop_elements_match_indexing() {
    // Every visited element equals L[loop.index0].
    let src = "{% set L = [5, 6, 7] %}{% for x in L %}{{ assert_expr(x == L[loop.index0]) }}{% endfor %}ok";
    assert_eq!(render(src), "ok");
}

// ---------------------------------------------------------------------------
// Macros, blocks, call, filter blocks
// ---------------------------------------------------------------------------

#[test]
fn macro_with_defaults() {
    let src = "{% macro greet(name, greeting = 'hi') %}{{ greeting }} {{ name }}{% endmacro %}\
               {% do greet('bob') %}|{% do greet('ann', 'yo') %}";
    assert_eq!(render(src), "hi bob|yo ann");
}

#[test]
fn macro_returns_its_last_local() {
    let src = "{% macro double(n) %}{% set r = n * 2 %}{% endmacro %}{{ double(21) }}";
    assert_eq!(render(src), "42");
}

#[test]
fn recursive_macro_computes_fibonacci() {
    let src = "{% macro fib(n) %}{% set r = 0 %}\
               {% if n < 2 %}{% set r = n %}\
               {% else %}{% set r = fib(n-1) + fib(n-2) %}{% endif %}\
               {% endmacro %}{{ fib(10) }}";
    assert_eq!(render(src), "55");
}

#[test]
fn blocks_render_in_place() {
    assert_eq!(render("a{% block b %}X{% endblock %}c"), "aXc");
}

#[test]
fn call_body_is_reachable_through_caller() {
    let src = "{% macro wrap() %}<{{ caller() }}>{% endmacro %}{% call wrap() %}body{% endcall %}";
    assert_eq!(render(src), "<body>");
}

#[test]
fn call_with_parameters() {
    let src = "{% macro each(items) %}{% for i in items %}{{ caller(i) }}{% endfor %}{% endmacro %}\
               {% call(n) each([1, 2]) %}[{{ n }}]{% endcall %}";
    assert_eq!(render(src), "[1][2]");
}

#[test]
fn filter_blocks_pipe_their_output() {
    assert_eq!(render("{% filter upper %}abc{% endfilter %}"), "ABC");
    assert_eq!(
        render("{% filter slice(0, 2) %}abcdef{% endfilter %}"),
        "ab"
    );
}

// ---------------------------------------------------------------------------
// Filters and tests
// ---------------------------------------------------------------------------

#[test]
fn builtin_filters() {
    assert_eq!(render("{{ 'aBc' | upper }}"), "ABC");
    assert_eq!(render("{{ 'aBc' | lower }}"), "abc");
    assert_eq!(render("{{ slice('h\u{e9}llo', 1, 3) }}"), "\u{e9}l");
    assert_eq!(render("{{ bslice('abc', 0, 2) }}"), "ab");
    assert_eq!(render("{{ none | default('d') }}"), "d");
    assert_eq!(render("{{ 7 | default('d') }}"), "7");
    assert_eq!(render("{{ abs(0 - 3.5) }}"), "3.5");
    assert_eq!(render("{{ 2.7 | floor }}{{ 2.1 | ceil }}"), "23");
    assert_eq!(render("{{ typeof(1) }} {{ typeof('s') }} {{ typeof([]) }}"), "number string list");
    assert_eq!(render("{{ '  x  ' | lstrip }}"), "x  ");
    assert_eq!(render("{{ '  x  ' | rstrip }}"), "  x");
    assert_eq!(render("{{ [1, 'a'] | to_json }}"), r#"[1,"a"]"#);
}

#[test]
fn builtin_tests() {
    assert_eq!(render("{{ 4 is even }}"), "True");
    assert_eq!(render("{{ 4 is not odd }}"), "True");
    assert_eq!(render("{{ 9 is divisableby(3) }}"), "True");
    assert_eq!(render("{{ none is none }}"), "True");
    assert_eq!(render("{{ true is true }}"), "True");
    assert_eq!(render("{{ 1 is defined }}"), "True");
    assert_eq!(render("{{ [1] is iterable }}"), "True");
    assert_eq!(render("{{ {'a': 1} is mapping }}"), "True");
    assert_eq!(render("{{ 'x' is string }}"), "True");
    assert_eq!(render("{{ 1 is number }}"), "True");
    assert_eq!(
        render("{% set a = [1] %}{% set b = a %}{{ a is sameas(b) }}"),
        "True"
    );
}

#[test]
fn host_registered_filter_composes() {
    let mut engine = Engine::new();
    engine.add_filter("filter_even", |ctx, args| {
        let list = args.first().copied().ok_or_else(|| {
            Error::RuntimeArity("filter_even() takes one argument".into())
        })?;
        let len = ctx.len_of(&list)?;
        let mut kept = Vec::new();
        for i in 0..len {
            let v = ctx.attr_get(&list, &Value::Number(i as f64))?;
            if let Some(n) = v.as_number()
                && (n as i64) % 2 == 0
            {
                kept.push(v);
            }
        }
        Ok(ctx.alloc_list(kept))
    });
    let mut out = Output::memory();
    engine
        .render_data(&mut out, "t", "{{ [1,2,3,4] | filter_even }}")
        .unwrap();
    assert_eq!(out.detach().unwrap(), "[2,4]");
}

#[test]
fn list_methods_mutate_in_place() {
    assert_eq!(
        render("{% set l = [1] %}{% do l.append(2, 3) %}{{ l }} {{ l.count() }}"),
        "[1,2,3] 3"
    );
    assert_eq!(
        render("{% set l = [1] %}{% do l.extend([2, 3]) %}{{ l[2] }}"),
        "3"
    );
    assert_eq!(render("{% set l = [1, 2] %}{% do l.pop_back() %}{{ l }}"), "[1]");
    assert_eq!(render("{% set l = [1] %}{% do l.clear() %}{{ #l }}"), "0");
    // append returns the list, so calls chain
    assert_eq!(
        render("{% set l = [] %}{{ l.append(1).append(2).count() }}"),
        "2"
    );
    let err = render_err("{% set l = [] %}{% do l.pop_back() %}");
    assert!(matches!(err, Error::RuntimeBound(_)));
    let err = render_err("{% set l = [] %}{% do l.extend(1) %}");
    assert!(matches!(err, Error::RuntimeType(_)));
}

#[test]
fn appended_values_move_into_the_list_scope() {
    // A string built inside the with scope outlives it once appended.
    let src = "{% set l = [] %}{% with %}{% do l.append('x' ~ 'y') %}{% endwith %}{{ l[0] }}";
    assert_eq!(render(src), "xy");
}

#[test]
fn dict_methods_mutate_in_place() {
    assert_eq!(
        render("{% set d = {} %}{% do d.set('a', 1) %}{{ d.a }} {{ d.count() }}"),
        "1 1"
    );
    // set only inserts; update only overwrites
    assert_eq!(
        render("{% set d = {'a': 1} %}{{ d.set('a', 2) }} {{ d.a }}"),
        "False 1"
    );
    assert_eq!(
        render("{% set d = {'a': 1} %}{{ d.update('a', 2) }} {{ d.a }}"),
        "True 2"
    );
    assert_eq!(render("{% set d = {'a': 1} %}{{ d.update('b', 2) }}"), "False");
    assert_eq!(
        render("{% set d = {'a': 1} %}{{ d.get('a') }} {{ d.get('zz') }}"),
        "1 None"
    );
    assert_eq!(
        render("{% set d = {'a': 1} %}{{ d.has_key('a') }} {{ d.pop('a') }} {{ d.has_key('a') }}"),
        "True True False"
    );
    assert_eq!(
        render("{% set d = {'a': 1} %}{% do d.clear() %}{{ d.count() }}"),
        "0"
    );
    let err = render_err("{% set d = {} %}{% do d.set(1, 2) %}");
    assert!(matches!(err, Error::RuntimeType(_)));
    let err = render_err("{% set d = {} %}{% do d.flip('a') %}");
    assert!(matches!(err, Error::RuntimeLookup(_)));
}

#[test]
fn cycler_cycles() {
    let src = "{% set c = cycler('a', 'b') %}{{ c.next() }}{{ c.next() }}{{ c.next() }}{{ c.current }}";
    assert_eq!(render(src), "abab");
    let src = "{% set c = cycler(1, 2) %}{% do c.next() %}{% do c.reset() %}{{ c.next() }}";
    assert_eq!(render(src), "1");
}

// ---------------------------------------------------------------------------
// Cross-template transfers
// ---------------------------------------------------------------------------

#[test]
fn include_renders_inline() {
    let mut engine = engine_with_files(&[("inc.tpl", "Hello")]);
    let mut out = Output::memory();
    engine
        .render_data(&mut out, "t", "A{% include 'inc.tpl' %}B")
        .unwrap();
    assert_eq!(out.detach().unwrap(), "AHelloB");
}

#[test]
fn include_with_upvalues() {
    let mut engine = engine_with_files(&[("who.tpl", "{{ who }}")]);
    let src = "{% include 'who.tpl' upvalue %}{% upvalue who = 'world' %}{% endinclude %}";
    let mut out = Output::memory();
    engine.render_data(&mut out, "t", src).unwrap();
    assert_eq!(out.detach().unwrap(), "world");
}

#[test]
fn include_with_json_environment() {
    let mut engine = engine_with_files(&[
        ("hello.tpl", "{{ Hello_World }}"),
        ("hello_world.json", r#"{"Hello_World": "hi"}"#),
    ]);
    let src = "{% include 'hello.tpl' json 'hello_world.json' %}{% endinclude %}";
    let mut out = Output::memory();
    engine.render_data(&mut out, "t", src).unwrap();
    assert_eq!(out.detach().unwrap(), "hi");
}

#[test]
fn import_exposes_macros_as_attributes() {
    let mut engine =
        engine_with_files(&[("m.tpl", "{% macro title(t) %}[{{ t }}]{% endmacro %}")]);
    let mut out = Output::memory();
    engine
        .render_data(&mut out, "t", "{% import 'm.tpl' as m %}{% do m.title('x') %}")
        .unwrap();
    assert_eq!(out.detach().unwrap(), "[x]");
}

#[test]
fn from_import_binds_selected_macros() {
    let mut engine =
        engine_with_files(&[("m.tpl", "{% macro title(t) %}[{{ t }}]{% endmacro %}")]);
    let mut out = Output::memory();
    engine
        .render_data(
            &mut out,
            "t",
            "{% from 'm.tpl' import title as t2 %}{% do t2('y') %}",
        )
        .unwrap();
    assert_eq!(out.detach().unwrap(), "[y]");
}

#[test]
fn extends_overrides_blocks_and_super_chains() {
    let mut engine = engine_with_files(&[(
        "base.tpl",
        "{% block b1 %}base{% endblock %}",
    )]);
    let child = "{% extends 'base.tpl' %}{% block b1 %}{{ super() }}child{% endblock %}";
    let mut out = Output::memory();
    engine.render_data(&mut out, "child", child).unwrap();
    assert_eq!(out.detach().unwrap(), "basechild");
}

#[test]
fn extends_without_override_renders_parent() {
    let mut engine = engine_with_files(&[(
        "base.tpl",
        "A{% block b %}parent{% endblock %}B",
    )]);
    let mut out = Output::memory();
    engine
        .render_data(&mut out, "child", "{% extends 'base.tpl' %}")
        .unwrap();
    assert_eq!(out.detach().unwrap(), "AparentB");
}

// ---------------------------------------------------------------------------
// Failure semantics
// ---------------------------------------------------------------------------

#[test]
fn runtime_division_by_zero() {
    let err = render_err("{% set d = 0 %}{{ 1 / d }}");
    assert!(matches!(err, Error::RuntimeType(_)));
    assert!(err.to_string().starts_with("[Run:(__main__:"), "{err}");
}

#[test]
fn fold_time_division_by_zero_fails_at_compile() {
    let err = render_err("{{ 1 / 0 }}");
    assert!(matches!(err, Error::Optimize(_)));
}

#[test]
fn string_times_string_fails() {
    assert!(matches!(render_err("{{ 'a' * 'b' }}"), Error::Optimize(_)));
    let err = render_err("{% set a = 'x' %}{{ a * a }}");
    assert!(matches!(err, Error::RuntimeType(_)));
}

#[test]
fn undefined_variable_is_a_lookup_error() {
    assert!(matches!(render_err("{{ nope }}"), Error::RuntimeLookup(_)));
}

#[test]
fn too_many_arguments_is_an_arity_error() {
    let err = render_err("{% macro one(a) %}{% endmacro %}{% do one(1, 2) %}");
    assert!(matches!(err, Error::RuntimeArity(_)));
}

#[test]
fn assert_expr_aborts_on_failure() {
    assert_eq!(render("{{ assert_expr(1 == 1) }}ok"), "ok");
    let err = render_err("{{ assert_expr(1 == 2, 'broken') }}");
    assert!(err.to_string().contains("broken"), "{err}");
}

#[test]
fn index_out_of_range_is_a_bound_error() {
    let err = render_err("{% set l = [1] %}{{ l[5] }}");
    assert!(matches!(err, Error::RuntimeBound(_)));
}

#[test]
fn partial_output_is_kept_on_failure() {
    let mut engine = Engine::new();
    let mut out = Output::memory();
    let result = engine.render_data(&mut out, "t", "before{{ nope }}after");
    assert!(result.is_err());
    assert_eq!(out.content(), Some("before"));
}
