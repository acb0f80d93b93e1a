// File: src/repl.rs
//
// Interactive REPL for the Panda language. A single `Vm` persists across
// lines so top-level `var` declarations and function/class definitions
// from one line are visible to the next. Input is considered complete
// once braces/parens/brackets balance, so multi-statement function and
// class bodies can be typed across several lines before being executed.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::errors::PandaError;
use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new(stress_gc: bool, log_gc: bool) -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(stress_gc, log_gc), editor })
    }

    fn show_banner(&self) {
        println!("{}", "Panda REPL".bright_cyan().bold());
        println!("  {} Ctrl+D to exit.", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "panda> ".bright_green().to_string()
            } else {
                "   ...> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_balanced(&buffer) {
                        if let Err(err) = self.vm.interpret(&buffer) {
                            report(&err);
                        }
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }
}

fn report(err: &PandaError) {
    eprintln!("{err}");
}

/// All of `()`, `{}`, `[]` close and no string literal is left open.
fn is_balanced(source: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '{' | '[' => depth += 1,
            ')' | '}' | ']' => depth -= 1,
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    depth <= 0 && !in_string
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_statement_is_balanced() {
        assert!(is_balanced("print 1 + 2;\n"));
    }

    #[test]
    fn open_brace_is_not_balanced() {
        assert!(!is_balanced("fun f() {\n"));
    }

    #[test]
    fn closed_function_is_balanced() {
        assert!(is_balanced("fun f() {\n  return 1;\n}\n"));
    }

    #[test]
    fn unterminated_string_is_not_balanced() {
        assert!(!is_balanced("print \"oops\n"));
    }
}
