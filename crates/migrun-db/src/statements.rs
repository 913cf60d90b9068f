use std::sync::LazyLock;

use migrun_common::{Error, Result};
use regex::Regex;

use crate::migrations::Migration;

static TRIGGER_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*CREATE\s+(?:TEMP\s+|TEMPORARY\s+)?TRIGGER\b").expect("valid regex")
});

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    SingleQuote,
    DoubleQuote,
    Backtick,
    Bracket,
    LineComment,
    BlockComment,
}

/// Incremental splitter state for one pass over a file.
#[derive(Default)]
struct Splitter {
    statements: Vec<String>,
    current: String,
    // `current` with comments stripped and quoted contents blanked; used to
    // decide whether a fragment has any code and whether it is a trigger.
    code: String,
    word: String,
    // open `BEGIN`/`CASE` blocks awaiting their `END`
    depth: usize,
}

impl Splitter {
    fn end_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        if self.word.eq_ignore_ascii_case("CASE") {
            self.depth += 1;
        } else if self.word.eq_ignore_ascii_case("BEGIN") && TRIGGER_HEAD.is_match(&self.code) {
            // outside a trigger, BEGIN starts a transaction and has no END
            self.depth += 1;
        } else if self.word.eq_ignore_ascii_case("END") && self.depth > 0 {
            self.depth -= 1;
        }
        self.word.clear();
    }

    fn flush(&mut self) {
        if !self.code.trim().is_empty() {
            self.statements.push(self.current.trim().to_string());
        }
        self.current.clear();
        self.code.clear();
        self.depth = 0;
    }
}

/// Split SQL text into individual statements on `;` terminators.
///
/// Semicolons inside quoted strings, quoted or bracketed identifiers and
/// comments do not terminate a statement, nor do those inside a `CASE ...
/// END` expression or a `CREATE TRIGGER ... BEGIN ... END` body. Fragments
/// containing only whitespace or comments are dropped. Returned statements
/// do not include the trailing `;`.
pub fn split_statements(sql: &str) -> std::result::Result<Vec<String>, String> {
    let mut sp = Splitter::default();
    let mut state = State::Code;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if state == State::Code {
            if c.is_alphanumeric() || c == '_' {
                sp.word.push(c);
            } else {
                sp.end_word();
            }
        }

        match state {
            State::Code => match c {
                ';' if sp.depth == 0 => {
                    sp.flush();
                    continue;
                }
                '\'' => state = State::SingleQuote,
                '"' => state = State::DoubleQuote,
                '`' => state = State::Backtick,
                '[' => state = State::Bracket,
                '-' if chars.peek() == Some(&'-') => {
                    sp.current.push(c);
                    sp.current.push('-');
                    chars.next();
                    sp.code.push(' ');
                    state = State::LineComment;
                    continue;
                }
                '/' if chars.peek() == Some(&'*') => {
                    sp.current.push(c);
                    sp.current.push('*');
                    chars.next();
                    sp.code.push(' ');
                    state = State::BlockComment;
                    continue;
                }
                _ => {}
            },
            State::SingleQuote if c == '\'' => state = State::Code,
            State::DoubleQuote if c == '"' => state = State::Code,
            State::Backtick if c == '`' => state = State::Code,
            State::Bracket if c == ']' => state = State::Code,
            State::LineComment if c == '\n' => state = State::Code,
            State::BlockComment if c == '*' && chars.peek() == Some(&'/') => {
                sp.current.push(c);
                sp.current.push('/');
                chars.next();
                state = State::Code;
                continue;
            }
            _ => {}
        }

        sp.current.push(c);
        match state {
            State::LineComment | State::BlockComment => {}
            State::SingleQuote | State::DoubleQuote | State::Backtick | State::Bracket
                if !is_delimiter(c) =>
            {
                sp.code.push('x')
            }
            _ => sp.code.push(c),
        }
    }

    match state {
        State::SingleQuote => return Err("unterminated string literal".into()),
        State::DoubleQuote | State::Backtick | State::Bracket => {
            return Err("unterminated quoted identifier".into());
        }
        State::BlockComment => return Err("unterminated block comment".into()),
        State::Code | State::LineComment => {}
    }

    sp.end_word();
    if sp.depth > 0 {
        return Err("BEGIN or CASE block is missing its END".into());
    }
    sp.flush();
    Ok(sp.statements)
}

/// Turn a migration's text into the list of statements to execute.
///
/// With `allow_multi_statement` on, each statement found by
/// [`split_statements`] runs separately. With it off the file is checked
/// for well-formedness and must hold at most one statement; the trimmed file
/// then runs as written.
pub fn prepare(migration: &Migration, allow_multi_statement: bool) -> Result<Vec<String>> {
    let statements =
        split_statements(&migration.sql).map_err(|reason| Error::MalformedStatement {
            file: migration.file_name.clone(),
            reason,
        })?;

    if allow_multi_statement || statements.is_empty() {
        return Ok(statements);
    }
    if statements.len() > 1 {
        return Err(Error::MultipleStatements {
            file: migration.file_name.clone(),
            count: statements.len(),
        });
    }
    Ok(vec![migration.sql.trim().to_string()])
}

fn is_delimiter(c: char) -> bool {
    matches!(c, '\'' | '"' | '`' | '[' | ']')
}
