// File: src/errors.rs
//
// Error reporting for the Ember scripting engine. Two kinds surface to the
// embedder: compile errors (collected during a single compile pass, with
// panic-mode recovery) and runtime errors (reported by the VM as a
// traceback plus a message).

use colored::Colorize;
use std::fmt;

/// Outcome of `Engine::interpret`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    /// The process exit code the host should use, per the common
    /// sysexits convention (0 / 65 / 70).
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError => 65,
            InterpretResult::RuntimeError => 70,
        }
    }
}

/// A single compile-time diagnostic: `[line N] Error <where>: <message>`.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub at: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.line, self.at, self.message)
    }
}

pub fn print_compile_error(err: &CompileError) {
    eprintln!("{}", err.to_string().red());
}

/// One stack frame as it should appear in a runtime traceback, oldest to
/// newest: `[line #N] in <script|name>`.
pub struct TraceLine {
    pub line: u32,
    pub function_name: Option<String>,
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function_name {
            Some(name) => write!(f, "[line #{}] in {}", self.line, name),
            None => write!(f, "[line #{}] in script", self.line),
        }
    }
}

/// Prints a runtime error traceback, oldest frame first, then the message.
pub fn print_runtime_error(trace: &[TraceLine], message: &str) {
    for line in trace {
        eprintln!("{}", line.to_string().yellow());
    }
    eprintln!("{}", message.red());
}
