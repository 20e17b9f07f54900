// File: src/repl.rs
//
// Interactive REPL. One `Engine` persists for the whole session — globals
// declared on one line stay visible to the next, matching how the VM's
// globals table already survives across separate `interpret` calls. Each
// accepted chunk is compiled and run as its own top-level script.

use crate::vm::Engine;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    engine: Engine,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Self {
        let editor = DefaultEditor::new().expect("failed to initialize line editor");
        Repl { engine: Engine::new(), editor }
    }

    fn show_banner(&self) {
        println!("{}", "Ember REPL".bright_cyan().bold());
        println!(
            "  {} leave braces/brackets/parens unclosed to continue a line",
            "tip:".dimmed()
        );
        println!("  {} or :quit to exit, Ctrl+D also works", ":help".bright_yellow());
        println!();
    }

    pub fn run(&mut self) {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt =
                if buffer.is_empty() { "ember> ".bright_green() } else { "....> ".bright_blue() };

            match self.editor.readline(&prompt.to_string()) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if !self.handle_command(line.trim()) {
                            break;
                        }
                        continue;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if Self::is_balanced(&buffer) {
                        self.eval(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "goodbye".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "error:".bright_red(), err);
                    break;
                }
            }
        }
    }

    /// `true` if `:command` was recognized (continue); `false` on `:quit`.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                println!("  :help   show this message");
                println!("  :reset  discard all globals and start a fresh engine");
                println!("  :quit   exit the REPL");
                true
            }
            ":quit" | ":q" => {
                println!("{}", "goodbye".bright_cyan());
                false
            }
            ":reset" | ":r" => {
                self.engine = Engine::new();
                println!("{}", "environment reset".bright_green());
                true
            }
            _ => {
                println!("{} unknown command {}", "error:".bright_red(), cmd.bright_yellow());
                true
            }
        }
    }

    /// A chunk is ready to run once every brace/bracket/paren it opened is
    /// closed again, ignoring delimiters inside strings or `//` comments.
    fn is_balanced(input: &str) -> bool {
        let mut depth: i32 = 0;
        let mut in_string: Option<char> = None;
        let mut escape_next = false;
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            if let Some(quote) = in_string {
                if escape_next {
                    escape_next = false;
                } else if c == '\\' {
                    escape_next = true;
                } else if c == quote {
                    in_string = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => in_string = Some(c),
                '/' if chars.peek() == Some(&'/') => {
                    while let Some(&n) = chars.peek() {
                        if n == '\n' {
                            break;
                        }
                        chars.next();
                    }
                }
                '{' | '(' | '[' => depth += 1,
                '}' | ')' | ']' => depth -= 1,
                _ => {}
            }
        }
        in_string.is_none() && depth <= 0
    }

    fn eval(&mut self, source: &str) {
        if source.trim().is_empty() {
            return;
        }
        // Errors are already reported by `Engine::interpret` (compile
        // diagnostics and runtime tracebacks print themselves); the REPL
        // just needs the engine to keep running afterward.
        self.engine.interpret(source);
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}
