// File: src/builtins.rs
//
// The engine's entire standard library: `print`, `input`, `toString`,
// `clock`. Mirrors hobby-script's `core.c`/`openCore` — those four
// natives are all the original registers, and the spec names no others.

use crate::vm::{Engine, NativeFnDef};
use once_cell::sync::Lazy;
use std::io::{self, BufRead, Write};
use std::time::Instant;

/// Process start, used by `clock()`. `once_cell` gives us a safe
/// one-time global without reaching for `lazy_static` or unsafe statics.
static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Variadic: writes each argument's display coercion, tab-separated,
/// followed by a newline.
fn native_print(engine: &mut Engine, argc: usize) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for i in 0..argc {
        let v = engine.arg(i);
        let _ = write!(out, "{}", engine.to_display_string(v));
        if i + 1 != argc {
            let _ = write!(out, "\t");
        }
    }
    let _ = writeln!(out);
    engine.push_nil();
}

/// Reads one line from stdin, up to but not including `\n` or EOF.
fn native_input(engine: &mut Engine, _argc: usize) {
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => engine.push_string(""),
        Ok(_) => {
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            engine.push_string(&line);
        }
    }
}

fn native_to_string(engine: &mut Engine, _argc: usize) {
    let v = engine.arg(0);
    let s = engine.to_display_string(v);
    engine.push_string(&s);
}

/// CPU time since process start, in seconds.
fn native_clock(engine: &mut Engine, _argc: usize) {
    engine.push_number(START.elapsed().as_secs_f64());
}

const NATIVES: &[NativeFnDef] = &[
    NativeFnDef { name: "print", func: native_print, arity: -1 },
    NativeFnDef { name: "input", func: native_input, arity: 0 },
    NativeFnDef { name: "toString", func: native_to_string, arity: 1 },
    NativeFnDef { name: "clock", func: native_clock, arity: 0 },
];

/// Installs the standard library as globals on a freshly constructed engine.
pub fn install(engine: &mut Engine) {
    engine.register_natives(NATIVES);
}

#[cfg(test)]
mod tests {
    use crate::errors::InterpretResult;
    use crate::vm::Engine;

    #[test]
    fn to_string_round_trips_numbers() {
        let mut engine = Engine::new();
        assert_eq!(
            engine.interpret("if (toString(42) != \"42\") { print(\"bad\"); }"),
            InterpretResult::Ok
        );
    }

    #[test]
    fn clock_returns_a_number() {
        let mut engine = Engine::new();
        assert_eq!(
            engine.interpret("var t = clock(); if (t < 0) { print(\"bad\"); }"),
            InterpretResult::Ok
        );
    }

    #[test]
    fn print_is_variadic() {
        let mut engine = Engine::new();
        assert_eq!(engine.interpret("print(1, 2, 3);"), InterpretResult::Ok);
        assert_eq!(engine.interpret("print();"), InterpretResult::Ok);
    }
}
