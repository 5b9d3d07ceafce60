use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Helper, Result};

/// Command words with their argument usage, used for completion and hints.
const COMMANDS: &[(&str, &str)] = &[
    ("add", "<key> <value>"),
    ("try-add", "<key> <value>"),
    ("get", "<key>"),
    ("contains", "<key>"),
    ("remove", "<key>"),
    ("update", "<key> <value>"),
    ("try-update", "<key> <value> <expected>"),
    ("upsert", "<key> <value>"),
    ("get-or-add", "<key> <value>"),
    ("replace", "<existing> <new-key> [value]"),
    ("add-all", "<key> <value> ..."),
    ("remove-all", "<key> ..."),
    ("clear", ""),
    ("count", ""),
    ("scan", "[isolation] [prefix]"),
    ("range", "<start> <end>"),
    ("begin", ""),
    ("commit", ""),
    ("rollback", ""),
    ("log", ""),
    ("stats", ""),
];

const META_COMMANDS: &[&str] = &[
    ".help", ".exit", ".quit", ".clear", ".timing", ".color", ".timeout", ".mode", ".width",
    ".history",
];

const ISOLATION_LEVELS: &[&str] = &[
    "serializable",
    "repeatable",
    "committed",
    "uncommitted",
    "unprotected",
];

const OUTPUT_MODES: &[&str] = &["table", "json", "plain"];

pub struct ShellHelper;

impl ShellHelper {
    pub fn new() -> Self {
        Self
    }

    fn candidates(&self, line: &str, pos: usize) -> (usize, Vec<Pair>) {
        let before = &line[..pos];
        let start = before
            .rfind(char::is_whitespace)
            .map(|i| i + 1)
            .unwrap_or(0);
        let partial = &before[start..];
        let previous: Vec<&str> = before[..start].split_whitespace().collect();

        let words: Vec<&str> = match previous.as_slice() {
            [] if partial.starts_with('.') => META_COMMANDS.to_vec(),
            [] => COMMANDS.iter().map(|(name, _)| *name).collect(),
            ["scan"] => ISOLATION_LEVELS.to_vec(),
            [".mode"] => OUTPUT_MODES.to_vec(),
            _ => Vec::new(),
        };

        let pairs = words
            .into_iter()
            .filter(|w| w.starts_with(partial))
            .map(|w| Pair {
                display: w.to_string(),
                replacement: w.to_string(),
            })
            .collect();
        (start, pairs)
    }
}

impl Completer for ShellHelper {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>)> {
        Ok(self.candidates(line, pos))
    }
}

impl Hinter for ShellHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Option<String> {
        if pos < line.len() {
            return None;
        }
        let word = line.trim_end();
        if word.contains(char::is_whitespace) {
            return None;
        }
        COMMANDS
            .iter()
            .find(|(name, usage)| *name == word && !usage.is_empty())
            .map(|(_, usage)| format!(" {}", usage))
    }
}

impl Highlighter for ShellHelper {
    fn highlight_hint<'h>(&self, hint: &'h str) -> std::borrow::Cow<'h, str> {
        std::borrow::Cow::Owned(format!("\x1b[2m{}\x1b[0m", hint))
    }
}

impl Validator for ShellHelper {}

impl Helper for ShellHelper {}
