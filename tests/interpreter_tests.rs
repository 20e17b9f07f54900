// Integration tests for the Ember interpreter: compile+run whole programs
// end to end and check the outcome. Since `print` writes straight to the
// process's stdout rather than through an injectable sink, scripts assert
// their own expectations by calling an undefined global (`fail()`) on the
// failing branch — that deterministically surfaces as a runtime error the
// test can check for, without needing to capture stdout.

use ember::errors::InterpretResult;
use ember::vm::Engine;

fn assert_ok(src: &str) {
    let mut engine = Engine::new();
    assert_eq!(engine.interpret(src), InterpretResult::Ok, "expected Ok for: {src}");
}

fn assert_runtime_error(src: &str) {
    let mut engine = Engine::new();
    assert_eq!(engine.interpret(src), InterpretResult::RuntimeError, "expected RuntimeError for: {src}");
}

fn assert_compile_error(src: &str) {
    let mut engine = Engine::new();
    assert_eq!(engine.interpret(src), InterpretResult::CompileError, "expected CompileError for: {src}");
}

/// Wraps `check` so that a false assertion reaches an undefined global and
/// fails as a runtime error; a true assertion runs to a clean `Ok` exit.
fn assert_script(check_expr: &str) -> String {
    format!("if (!({check_expr})) {{ fail(); }}")
}

#[test]
fn arithmetic_precedence() {
    assert_ok(&assert_script("1 + 2 * 3 == 7"));
    assert_ok(&assert_script("(1 + 2) * 3 == 9"));
    assert_ok(&assert_script("2 ** 3 ** 2 == 512")); // right-assoc: 2 ** (3 ** 2)
}

#[test]
fn modulo_and_pow_check_both_operands() {
    assert_runtime_error("print(1 % \"x\");");
    assert_runtime_error("print(\"x\" % 1);");
    assert_runtime_error("print(1 ** \"x\");");
    assert_runtime_error("print(\"x\" ** 1);");
}

#[test]
fn division_by_zero_follows_ieee754() {
    assert_ok(&assert_script("1 / 0 == 1 / 0"));
    assert_ok("var x = 0 / 0; if (x == x) { fail(); }"); // NaN != NaN
}

#[test]
fn string_concat() {
    assert_ok(&assert_script("\"hi\" .. \" \" .. \"there\" == \"hi there\""));
}

#[test]
fn concat_rejects_mixed_types() {
    assert_runtime_error("print(\"x\" .. 1);");
}

#[test]
fn string_interning_means_equal_content_is_equal() {
    assert_ok(&assert_script("(\"a\" .. \"b\") == \"ab\""));
}

#[test]
fn truthiness_only_nil_and_false_are_falsey() {
    assert_ok("if (0) {} else { fail(); }");
    assert_ok("if (\"\") {} else { fail(); }");
    assert_ok("if (nil) { fail(); }");
    assert_ok("if (false) { fail(); }");
}

#[test]
fn closures_capture_by_reference_until_closed() {
    assert_ok(
        "func mk(n) { var c = 0; return func() { c = c + n; return c; }; } \
         var f = mk(10); var a = f(); var b = f(); \
         if (a != 10 || b != 20) { fail(); }",
    );
}

#[test]
fn two_closures_over_one_local_share_updates() {
    assert_ok(
        "func mk() { var n = 0; var inc = func() { n = n + 1; }; var get = func() { return n; }; \
         return [inc, get]; } \
         var pair = mk(); var inc = pair[0]; var get = pair[1]; \
         inc(); inc(); if (get() != 2) { fail(); }",
    );
}

#[test]
fn struct_fields_methods_and_self() {
    assert_ok(
        "struct P { x = 0; y = 0; func sum() { return self.x + self.y; } } \
         var p = P { x = 3, y = 4 }; if (p.sum() != 7) { fail(); }",
    );
}

#[test]
fn struct_static_methods_via_double_colon() {
    assert_ok(
        "struct Math { static func square(n) { return n * n; } } \
         if (Math::square(5) != 25) { fail(); }",
    );
}

#[test]
fn struct_field_set_on_undeclared_name_is_runtime_error() {
    assert_runtime_error("struct P { x = 0; } var p = P { x = 1 }; p.y = 2;");
}

#[test]
fn struct_field_init_on_undeclared_name_is_runtime_error() {
    assert_runtime_error("struct P { x = 0; } var p = P { z = 1 };");
}

#[test]
fn enum_values_are_ordinals() {
    assert_ok(
        "enum Color { Red, Green, Blue } \
         if (Color::Red != 0 || Color::Green != 1 || Color::Blue != 2) { fail(); }",
    );
}

#[test]
fn arrays_subscript_get_and_set() {
    assert_ok("var a = [10, 20, 30]; a[1] = 99; if (a[0] != 10 || a[1] != 99) { fail(); }");
}

#[test]
fn array_index_out_of_bounds_is_runtime_error() {
    assert_runtime_error("var a = [10, 20, 30]; print(a[5]);");
}

#[test]
fn array_index_equal_to_length_is_rejected() {
    assert_runtime_error("var a = [10, 20, 30]; print(a[3]);");
}

#[test]
fn match_selects_first_equal_arm() {
    assert_ok(
        "var n = 2; var label = \"\"; match n { case 1 => label = \"one\"; case 2 => label = \"two\"; } \
         if (label != \"two\") { fail(); }",
    );
}

#[test]
fn break_exits_nearest_loop_only() {
    assert_ok(
        "var count = 0; for (var i = 0; i < 5; i = i + 1) { if (i == 3) { break; } count = count + 1; } \
         if (count != 3) { fail(); }",
    );
}

#[test]
fn continue_skips_to_next_iteration() {
    assert_ok(
        "var sum = 0; for (var i = 0; i < 5; i = i + 1) { if (i == 2) { continue; } sum = sum + i; } \
         if (sum != 8) { fail(); }", // 0+1+3+4
    );
}

#[test]
fn loop_with_break_runs_at_least_once_as_needed() {
    assert_ok("var i = 0; loop { i = i + 1; if (i >= 3) { break; } } if (i != 3) { fail(); }");
}

#[test]
fn while_loop_condition() {
    assert_ok("var i = 0; while (i < 5) { i = i + 1; } if (i != 5) { fail(); }");
}

#[test]
fn for_loop_increment_runs_after_the_body_not_before() {
    assert_ok(
        "var seen = \"\"; for (var i = 0; i < 3; i = i + 1) { seen = seen .. toString(i); } \
         if (seen != \"012\") { fail(); }",
    );
}

#[test]
fn recursive_function_calls() {
    assert_ok(
        "func fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } \
         if (fib(10) != 55) { fail(); }",
    );
}

#[test]
fn arity_mismatch_is_runtime_error() {
    assert_runtime_error("func f(a, b) { return a + b; } f(1);");
}

#[test]
fn redefinition_of_global_is_runtime_error() {
    assert_runtime_error("var x = 1; var x = 2;");
}

#[test]
fn undefined_global_is_runtime_error() {
    assert_runtime_error("print(nope);");
}

#[test]
fn call_of_non_callable_is_runtime_error() {
    assert_runtime_error("var x = 1; x();");
}

#[test]
fn bitwise_operators_are_rejected_at_compile_time() {
    assert_compile_error("var x = 1 & 2;");
    assert_compile_error("var x = 1 | 2;");
}

#[test]
fn unterminated_string_is_compile_error() {
    assert_compile_error("var x = \"unterminated;");
}

#[test]
fn invalid_assignment_target_is_compile_error() {
    assert_compile_error("1 + 1 = 2;");
}

#[test]
fn engine_recovers_after_compile_error() {
    let mut engine = Engine::new();
    assert_eq!(engine.interpret("var = ;"), InterpretResult::CompileError);
    assert_eq!(engine.interpret("print(1);"), InterpretResult::Ok);
}

#[test]
fn engine_recovers_after_runtime_error() {
    let mut engine = Engine::new();
    assert_eq!(engine.interpret("print(nope);"), InterpretResult::RuntimeError);
    assert_eq!(engine.interpret("var y = 1; print(y);"), InterpretResult::Ok);
}

#[test]
fn globals_persist_across_separate_interpret_calls() {
    let mut engine = Engine::new();
    assert_eq!(engine.interpret("global counter = 0;"), InterpretResult::Ok);
    assert_eq!(engine.interpret("counter = counter + 1;"), InterpretResult::Ok);
    assert_eq!(engine.interpret("if (counter != 1) { fail(); }"), InterpretResult::Ok);
}

#[test]
fn source_bom_is_skipped() {
    assert_ok("\u{FEFF}print(1);");
}

#[test]
fn bound_method_chain_retains_receiver() {
    assert_ok(
        "struct Counter { n = 0; func inc() { self.n = self.n + 1; return self; } \
         func get() { return self.n; } } \
         var c = Counter { n = 0 }; var bound = c.inc; bound(); bound(); \
         if (c.get() != 2) { fail(); }",
    );
}
