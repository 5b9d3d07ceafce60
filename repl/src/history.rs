use crate::completer::ShellHelper;
use rustyline::history::{DefaultHistory, History, SearchDirection};
use rustyline::{Editor, Result};
use std::path::PathBuf;

pub type ShellEditor = Editor<ShellHelper, DefaultHistory>;

/// Persists command history between sessions. Disabled managers never touch
/// the file.
pub struct HistoryManager {
    history_file: Option<PathBuf>,
}

impl HistoryManager {
    pub fn new(history_file: impl Into<PathBuf>) -> Self {
        Self {
            history_file: Some(history_file.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { history_file: None }
    }

    pub fn load(&self, editor: &mut ShellEditor) {
        if let Some(path) = &self.history_file {
            // Missing file on first run
            let _ = editor.load_history(path);
        }
    }

    pub fn save(&self, editor: &mut ShellEditor) -> Result<()> {
        match &self.history_file {
            Some(path) => editor.save_history(path),
            None => Ok(()),
        }
    }

    pub fn display(&self, editor: &ShellEditor) {
        let history_len = editor.history().len();

        if history_len == 0 {
            println!("No history available");
            return;
        }

        println!("\nCommand History:");
        println!("{}", "─".repeat(60));

        let start = history_len.saturating_sub(20);

        for i in start..history_len {
            if let Ok(Some(search_result)) = editor.history().get(i, SearchDirection::Forward) {
                let entry: &str = &search_result.entry;
                let display_entry = if entry.chars().count() > 60 {
                    format!("{}...", entry.chars().take(57).collect::<String>())
                } else {
                    entry.to_string()
                };

                println!("{:4} │ {}", i + 1, display_entry);
            }
        }

        println!("{}", "─".repeat(60));
        println!("Use .history <n> to execute entry n");
    }

    pub fn get_entry(&self, editor: &ShellEditor, n: usize) -> Option<String> {
        if n > 0 && n <= editor.history().len() {
            editor
                .history()
                .get(n - 1, SearchDirection::Forward)
                .ok()
                .flatten()
                .map(|search_result| search_result.entry.to_string())
        } else {
            None
        }
    }
}
