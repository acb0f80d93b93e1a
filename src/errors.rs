// File: src/errors.rs
//
// Error handling and reporting for the Panda programming language.
// Two families only, per the language's error model: compile errors
// (collected while parsing, reported once compilation reaches EOF) and
// a single runtime error (reported with a frame-by-frame stack trace).
// There is no user-catchable exception mechanism.

use colored::Colorize;
use std::fmt;

/// One `[line N] Error at 'lexeme': message` diagnostic.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub at: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Error at '{}': {}",
            format!("[line {}]", self.line).bright_blue(),
            self.at.yellow(),
            self.message
        )
    }
}

/// One call-frame entry in a runtime stack trace.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub name: Option<String>,
    pub line: u32,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

#[derive(Debug)]
pub enum PandaError {
    Compile(Vec<CompileError>),
    Runtime { message: String, trace: Vec<TraceFrame> },
}

impl fmt::Display for PandaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PandaError::Compile(errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            PandaError::Runtime { message, trace } => {
                writeln!(f, "{}", message.red().bold())?;
                for frame in trace {
                    writeln!(f, "{}", frame.to_string().bright_blue())?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for PandaError {}

/// Computes the Levenshtein distance between two strings, used by the
/// compiler for "did you mean?" suggestions on undefined-name errors.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let (len1, len2) = (s1_chars.len(), s2_chars.len());

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for (j, cell) in matrix[0].iter_mut().enumerate().take(len2 + 1) {
        *cell = j;
    }

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = (matrix[i - 1][j] + 1)
                .min(matrix[i][j - 1] + 1)
                .min(matrix[i - 1][j - 1] + cost);
        }
    }

    matrix[len1][len2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_identical_is_zero() {
        assert_eq!(levenshtein_distance("clock", "clock"), 0);
    }

    #[test]
    fn levenshtein_counts_edits() {
        assert_eq!(levenshtein_distance("clock", "clocl"), 1);
    }
}
