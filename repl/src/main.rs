//! Tandem Shell
//!
//! Interactive shell over an in-process primary replica.

mod commands;
mod completer;
pub mod display;
mod history;
mod prompt;

use anyhow::Context as _;
use clap::Parser;
use commands::{CommandHandler, CommandResult, Session};
use display::DisplayConfig;
use history::{HistoryManager, ShellEditor};
use rustyline::Config;
use rustyline::error::ReadlineError;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Instant;
use tandem_core::{LocalReplica, ProviderConfig};
use tracing_subscriber::{filter::EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "tandem", version, about = "Shell for a local Tandem replica")]
struct Args {
	/// Provider configuration file
	#[arg(short, long, default_value = "tandem.toml")]
	config: PathBuf,

	/// Run a command and exit (repeatable)
	#[arg(short, long = "execute")]
	execute: Vec<String>,

	/// Run commands from a file, one per line
	#[arg(short, long)]
	file: Option<PathBuf>,

	/// Do not read or write the history file
	#[arg(long)]
	no_history: bool,

	/// Suppress banners and timing
	#[arg(short, long)]
	quiet: bool,

	/// Stop at the first failing command
	#[arg(long)]
	exit_on_error: bool,
}

#[derive(Debug, Clone)]
pub enum InputSource {
	Interactive,
	File(PathBuf),
	Stdin,
	CommandLine(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ReplOptions {
	pub input_source: InputSource,
	pub quiet: bool,
	pub exit_on_error: bool,
	pub no_history: bool,
}

impl ReplOptions {
	fn from_args(args: &Args) -> Self {
		let input_source = if !args.execute.is_empty() {
			InputSource::CommandLine(args.execute.clone())
		} else if let Some(path) = &args.file {
			InputSource::File(path.clone())
		} else if !io::IsTerminal::is_terminal(&io::stdin()) {
			InputSource::Stdin
		} else {
			InputSource::Interactive
		};
		Self {
			input_source,
			quiet: args.quiet,
			exit_on_error: args.exit_on_error,
			no_history: args.no_history,
		}
	}
}

pub struct Repl {
	editor: ShellEditor,
	command_handler: CommandHandler,
	display_config: DisplayConfig,
	session: Session,
	history: HistoryManager,
	options: ReplOptions,
	command_count: usize,
	start_time: Instant,
}

impl Repl {
	pub fn new(session: Session, options: ReplOptions) -> anyhow::Result<Self> {
		let config = Config::builder()
			.history_ignore_space(true)
			.completion_type(rustyline::CompletionType::List)
			.edit_mode(rustyline::EditMode::Emacs)
			.build();

		let mut editor = ShellEditor::with_config(config)?;
		editor.set_helper(Some(completer::ShellHelper::new()));

		let history = if options.no_history {
			HistoryManager::disabled()
		} else {
			HistoryManager::new(".tandem_history")
		};
		history.load(&mut editor);

		let mut display_config = DisplayConfig::default();
		if options.quiet {
			display_config.show_timing = false;
		}

		Ok(Self {
			editor,
			command_handler: CommandHandler::new(),
			display_config,
			session,
			history,
			options,
			command_count: 0,
			start_time: Instant::now(),
		})
	}

	pub fn run(&mut self) -> anyhow::Result<()> {
		let result = match self.options.input_source.clone() {
			InputSource::Interactive => self.run_interactive(),
			InputSource::File(path) => {
				let content = fs::read_to_string(&path)
					.with_context(|| format!("reading {}", path.display()))?;
				self.run_script(&content)
			}
			InputSource::Stdin => {
				let mut content = String::new();
				io::stdin().read_to_string(&mut content)?;
				self.run_script(&content)
			}
			InputSource::CommandLine(commands) => self.run_commands(&commands),
		};
		self.cleanup()?;
		result
	}

	fn run_interactive(&mut self) -> anyhow::Result<()> {
		if !self.options.quiet {
			display::print_welcome();
			display::print_replica(self.session.replica());
		}

		loop {
			let prompt_str = prompt::generate_prompt(
				self.session.group(),
				self.command_count,
				&self.display_config,
			);

			match self.editor.readline(&prompt_str) {
				Ok(line) => {
					if !line.trim().is_empty() {
						self.editor.add_history_entry(line.as_str())?;
					}
					if !self.execute_line(&line)? {
						break;
					}
				}
				Err(ReadlineError::Interrupted) => {
					display::print_hint("Use .exit or Ctrl+D to quit");
				}
				Err(ReadlineError::Eof) => {
					println!();
					display::print_goodbye(self.command_count, self.start_time.elapsed());
					break;
				}
				Err(err) => {
					display::print_error(&format!("Error: {:?}", err));
					break;
				}
			}
		}
		Ok(())
	}

	fn run_commands(&mut self, commands: &[String]) -> anyhow::Result<()> {
		for (i, command) in commands.iter().enumerate() {
			if !self.options.quiet && commands.len() > 1 {
				display::print_info(&format!("Command {}/{}: {}", i + 1, commands.len(), command));
			}
			if !self.execute_line(command)? {
				break;
			}
		}
		Ok(())
	}

	fn run_script(&mut self, content: &str) -> anyhow::Result<()> {
		for (line_num, line) in content.lines().enumerate() {
			let trimmed = line.trim();
			if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("--") {
				continue;
			}
			tracing::trace!(line = line_num + 1, command = trimmed, "script command");
			if !self.execute_line(trimmed)? {
				break;
			}
		}
		Ok(())
	}

	/// Returns false when the shell should stop.
	fn execute_line(&mut self, line: &str) -> anyhow::Result<bool> {
		if line.trim().is_empty() {
			return Ok(true);
		}

		let start = Instant::now();
		let result = self
			.command_handler
			.handle(line, &mut self.display_config, &mut self.session);
		let duration = start.elapsed();

		match result {
			CommandResult::Continue => Ok(true),
			CommandResult::Output(outcome) => {
				self.command_count += 1;
				display::print_outcome(&outcome, duration, &self.display_config);
				Ok(true)
			}
			CommandResult::Exit => {
				if !self.options.quiet {
					display::print_goodbye(self.command_count, self.start_time.elapsed());
				}
				Ok(false)
			}
			CommandResult::Error(msg) => {
				self.command_count += 1;
				display::print_error(&msg);
				if self.options.exit_on_error {
					anyhow::bail!("command failed: {}", line.trim());
				}
				Ok(true)
			}
			CommandResult::ClearScreen => {
				display::clear_screen();
				if !self.options.quiet {
					display::print_welcome();
				}
				Ok(true)
			}
			CommandResult::ShowHistory => {
				self.history.display(&self.editor);
				Ok(true)
			}
			CommandResult::ExecuteFromHistory(n) => match self.history.get_entry(&self.editor, n) {
				Some(entry) if entry.trim_start().starts_with(".history") => {
					display::print_error("History entries cannot replay .history");
					Ok(true)
				}
				Some(entry) => self.execute_line(&entry),
				None => {
					display::print_error(&format!("History entry {} not found", n));
					Ok(true)
				}
			},
		}
	}

	fn cleanup(&mut self) -> anyhow::Result<()> {
		self.history.save(&mut self.editor)?;
		if let Err(e) = self.session.shutdown() {
			display::print_warning(&format!("Replica did not close cleanly: {}", e));
		}
		Ok(())
	}
}

fn main() -> anyhow::Result<()> {
	fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
		)
		.with_writer(io::stderr)
		.init();

	let args = Args::parse();
	let config = ProviderConfig::load_from_path(&args.config)?;
	let options = ReplOptions::from_args(&args);
	colored::control::set_override(io::IsTerminal::is_terminal(&io::stdout()));

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?;
	let replica = runtime
		.block_on(LocalReplica::start_primary(config))
		.context("starting replica")?;
	tracing::info!(provider = %replica.provider.name(), "replica started");

	let session = Session::new(runtime, replica);
	let mut repl = Repl::new(session, options)?;
	repl.run()
}
