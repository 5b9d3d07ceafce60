use super::display::{self, DisplayConfig, Outcome, StatusReport};
use bytes::Bytes;
use colored::Colorize;
use std::time::Duration;
use tandem_core::{
	CallOptions, EnumerationOptions, GroupId, IsolationLevel, LocalReplica, StoreError, StoreResult,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

pub enum CommandResult {
	Continue,
	Exit,
	Error(String),
	ClearScreen,
	ShowHistory,
	ExecuteFromHistory(usize),
	Output(Outcome),
}

/// Data commands understood by the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Add { key: String, value: String },
	TryAdd { key: String, value: String },
	Get { key: String },
	Contains { key: String },
	Remove { key: String },
	Update { key: String, value: String },
	TryUpdate { key: String, value: String, expected: String },
	Upsert { key: String, value: String },
	GetOrAdd { key: String, value: String },
	Replace { existing: String, new_key: String, value: Option<String> },
	AddAll(Vec<(String, String)>),
	RemoveAll(Vec<String>),
	Clear,
	Count,
	Scan { isolation: IsolationLevel, prefix: Option<String> },
	Range { start: String, end: String },
	Begin,
	Commit,
	Rollback,
	Log,
	Stats,
}

/// Split a line into words. Double quotes group words and may be empty.
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
	let mut words = Vec::new();
	let mut current = String::new();
	let mut quoted = false;
	let mut started = false;

	for ch in line.chars() {
		match ch {
			'"' => {
				quoted = !quoted;
				started = true;
			}
			c if c.is_whitespace() && !quoted => {
				if started {
					words.push(std::mem::take(&mut current));
					started = false;
				}
			}
			c => {
				current.push(c);
				started = true;
			}
		}
	}

	if quoted {
		return Err("Unterminated quote".to_string());
	}
	if started {
		words.push(current);
	}
	Ok(words)
}

fn parse_isolation(word: &str) -> Option<IsolationLevel> {
	match word {
		"serializable" | "strict" => Some(IsolationLevel::StrictSerializable),
		"repeatable" => Some(IsolationLevel::Repeatable),
		"committed" => Some(IsolationLevel::Committed),
		"uncommitted" => Some(IsolationLevel::Uncommitted),
		"unprotected" | "none" => Some(IsolationLevel::Unprotected),
		_ => None,
	}
}

fn arity(name: &str, args: &[String], expected: usize, usage: &str) -> Result<(), String> {
	if args.len() == expected {
		Ok(())
	} else {
		Err(format!("Usage: {} {}", name, usage))
	}
}

impl Command {
	pub fn parse(words: &[String]) -> Result<Command, String> {
		let Some((name, args)) = words.split_first() else {
			return Err("Empty command".to_string());
		};
		let name = name.to_lowercase();
		let pair = |usage: &str| -> Result<(String, String), String> {
			arity(&name, args, 2, usage)?;
			Ok((args[0].clone(), args[1].clone()))
		};
		let single = |usage: &str| -> Result<String, String> {
			arity(&name, args, 1, usage)?;
			Ok(args[0].clone())
		};
		let bare = |cmd: Command| -> Result<Command, String> {
			arity(&name, args, 0, "")?;
			Ok(cmd)
		};

		match name.as_str() {
			"add" => pair("<key> <value>").map(|(key, value)| Command::Add { key, value }),
			"try-add" => pair("<key> <value>").map(|(key, value)| Command::TryAdd { key, value }),
			"get" => single("<key>").map(|key| Command::Get { key }),
			"contains" => single("<key>").map(|key| Command::Contains { key }),
			"remove" | "rm" => single("<key>").map(|key| Command::Remove { key }),
			"update" => pair("<key> <value>").map(|(key, value)| Command::Update { key, value }),
			"try-update" => {
				arity(&name, args, 3, "<key> <value> <expected>")?;
				Ok(Command::TryUpdate {
					key: args[0].clone(),
					value: args[1].clone(),
					expected: args[2].clone(),
				})
			}
			"upsert" => pair("<key> <value>").map(|(key, value)| Command::Upsert { key, value }),
			"get-or-add" => pair("<key> <value>").map(|(key, value)| Command::GetOrAdd { key, value }),
			"replace" => match args {
				[existing, new_key] => Ok(Command::Replace {
					existing: existing.clone(),
					new_key: new_key.clone(),
					value: None,
				}),
				[existing, new_key, value] => Ok(Command::Replace {
					existing: existing.clone(),
					new_key: new_key.clone(),
					value: Some(value.clone()),
				}),
				_ => Err("Usage: replace <existing> <new-key> [value]".to_string()),
			},
			"add-all" => {
				if args.is_empty() || args.len() % 2 != 0 {
					return Err("Usage: add-all <key> <value> [<key> <value> ...]".to_string());
				}
				Ok(Command::AddAll(
					args.chunks(2).map(|kv| (kv[0].clone(), kv[1].clone())).collect(),
				))
			}
			"remove-all" => {
				if args.is_empty() {
					return Err("Usage: remove-all <key> [<key> ...]".to_string());
				}
				Ok(Command::RemoveAll(args.to_vec()))
			}
			"clear" => bare(Command::Clear),
			"count" => bare(Command::Count),
			"scan" => {
				let mut isolation = IsolationLevel::default();
				let mut rest = args;
				if let Some(level) = rest.first().and_then(|w| parse_isolation(w)) {
					isolation = level;
					rest = &rest[1..];
				}
				match rest {
					[] => Ok(Command::Scan { isolation, prefix: None }),
					[prefix] => Ok(Command::Scan {
						isolation,
						prefix: Some(prefix.clone()),
					}),
					_ => Err("Usage: scan [isolation] [prefix]".to_string()),
				}
			}
			"range" => pair("<start> <end>").map(|(start, end)| Command::Range { start, end }),
			"begin" => bare(Command::Begin),
			"commit" => bare(Command::Commit),
			"rollback" => bare(Command::Rollback),
			"log" => bare(Command::Log),
			"stats" | "status" => bare(Command::Stats),
			other => Err(format!("Unknown command: {}. Type .help for help.", other)),
		}
	}
}

/// A started primary replica plus the atomic group the shell has open.
pub struct Session {
	runtime: Runtime,
	replica: LocalReplica,
	group: Option<GroupId>,
	timeout: Duration,
}

impl Session {
	pub fn new(runtime: Runtime, replica: LocalReplica) -> Self {
		let timeout = replica.provider.config().default_timeout();
		Self {
			runtime,
			replica,
			group: None,
			timeout,
		}
	}

	pub fn group(&self) -> Option<GroupId> {
		self.group
	}

	pub fn replica(&self) -> &LocalReplica {
		&self.replica
	}

	pub fn set_timeout(&mut self, timeout: Duration) {
		self.timeout = timeout;
	}

	fn call_options(&self) -> CallOptions {
		CallOptions::in_group(self.group.unwrap_or(GroupId::AD_HOC)).with_timeout(self.timeout)
	}

	/// Roll back an open group and close the provider.
	pub fn shutdown(&mut self) -> StoreResult<()> {
		let cancel = CancellationToken::new();
		let provider = self.replica.provider.clone();
		let group = self.group.take();
		self.runtime.block_on(async move {
			if let Some(group) = group {
				provider.rollback_group(group, &cancel).await?;
			}
			provider.close(&cancel).await
		})
	}

	pub fn execute(&mut self, command: Command) -> StoreResult<Outcome> {
		let provider = self.replica.provider.clone();
		let opts = self.call_options();
		let cancel = opts.cancel.clone();
		let b = |s: &str| Bytes::copy_from_slice(s.as_bytes());

		match command {
			Command::Add { key, value } => {
				self.runtime.block_on(provider.add(&b(&key), &b(&value), &opts))?;
				Ok(Outcome::Done(format!("Added {}", key)))
			}
			Command::TryAdd { key, value } => self
				.runtime
				.block_on(provider.try_add(&b(&key), &b(&value), &opts))
				.map(Outcome::Flag),
			Command::Get { key } => self
				.runtime
				.block_on(provider.get(&b(&key), &opts))
				.map(Outcome::Value),
			Command::Contains { key } => self
				.runtime
				.block_on(provider.contains_key(&b(&key), &opts))
				.map(Outcome::Flag),
			Command::Remove { key } => self
				.runtime
				.block_on(provider.remove(&b(&key), &opts))
				.map(Outcome::Value),
			Command::Update { key, value } => self
				.runtime
				.block_on(provider.update(&b(&key), &b(&value), &opts))
				.map(|prior| Outcome::Value(Some(prior))),
			Command::TryUpdate { key, value, expected } => self
				.runtime
				.block_on(provider.try_update(&b(&key), &b(&value), &b(&expected), &opts))
				.map(Outcome::Flag),
			Command::Upsert { key, value } => self
				.runtime
				.block_on(provider.add_or_update(&b(&key), &b(&value), &opts))
				.map(Outcome::Value),
			Command::GetOrAdd { key, value } => self
				.runtime
				.block_on(provider.get_or_add(&b(&key), &b(&value), &opts))
				.map(|v| Outcome::Value(Some(v))),
			Command::Replace {
				existing,
				new_key,
				value,
			} => {
				let value = value.as_deref().map(b);
				self.runtime
					.block_on(provider.replace(&b(&existing), &b(&new_key), value.as_ref(), &opts))
					.map(Outcome::Flag)
			}
			Command::AddAll(items) => {
				let items: Vec<(Bytes, Bytes)> = items.iter().map(|(k, v)| (b(k), b(v))).collect();
				self.runtime.block_on(provider.add_all(&items, &opts))?;
				Ok(Outcome::Done(format!("Added {} record(s)", items.len())))
			}
			Command::RemoveAll(keys) => {
				let keys: Vec<Bytes> = keys.iter().map(|k| b(k)).collect();
				let summary = self.runtime.block_on(provider.remove_all(&keys, &opts))?;
				Ok(Outcome::Done(format!(
					"Removed {} of {} key(s)",
					summary.removed, summary.requested
				)))
			}
			Command::Clear => {
				self.runtime.block_on(provider.clear(&opts))?;
				Ok(Outcome::Done("Cleared".to_string()))
			}
			Command::Count => self.runtime.block_on(provider.count()).map(Outcome::Number),
			Command::Scan { isolation, prefix } => {
				let mut scan = EnumerationOptions::default().with_isolation(isolation);
				if let Some(prefix) = prefix {
					scan = scan.with_prefix(b(&prefix));
				}
				self.enumerate(scan)
			}
			Command::Range { start, end } => {
				let scan = EnumerationOptions::default().with_range(Some(b(&start)), Some(b(&end)));
				self.enumerate(scan)
			}
			Command::Begin => {
				if let Some(group) = self.group {
					return Err(StoreError::InvalidArgument(format!(
						"group {} is already open",
						group
					)));
				}
				let group = self.runtime.block_on(provider.create_group(&cancel))?;
				self.group = Some(group);
				Ok(Outcome::Done(format!("Started group {}", group)))
			}
			Command::Commit => {
				let group = self.open_group()?;
				let seq = self.runtime.block_on(provider.commit_group(group, &cancel))?;
				self.group = None;
				Ok(Outcome::Done(format!("Committed group {} at {}", group, seq)))
			}
			Command::Rollback => {
				let group = self.open_group()?;
				let result = self.runtime.block_on(provider.rollback_group(group, &cancel));
				self.group = None;
				result?;
				Ok(Outcome::Done(format!("Rolled back group {}", group)))
			}
			Command::Log => Ok(Outcome::Log(self.replica.replicator.entries())),
			Command::Stats => Ok(Outcome::Status(StatusReport::capture(&self.replica))),
		}
	}

	fn open_group(&self) -> StoreResult<GroupId> {
		self.group
			.ok_or_else(|| StoreError::InvalidArgument("no group is open; use begin".to_string()))
	}

	fn enumerate(&mut self, mut scan: EnumerationOptions) -> StoreResult<Outcome> {
		let provider = self.replica.provider.clone();
		scan.step_timeout = Some(self.timeout);
		self.runtime.block_on(async move {
			let mut enumerator = provider.create_enumerator(scan).await?;
			let mut rows = Vec::new();
			while let Some((key, value)) = enumerator.next().await? {
				rows.push((key, value));
			}
			enumerator.close();
			Ok::<_, StoreError>(Outcome::Rows(rows))
		})
	}
}

pub struct CommandHandler {}

impl CommandHandler {
	pub fn new() -> Self {
		CommandHandler {}
	}

	pub fn handle(
		&self,
		line: &str,
		display_config: &mut DisplayConfig,
		session: &mut Session,
	) -> CommandResult {
		let words = match tokenize(line) {
			Ok(words) => words,
			Err(e) => return CommandResult::Error(e),
		};
		if words.is_empty() {
			return CommandResult::Continue;
		}

		if words[0].starts_with('.') {
			return self.handle_meta(&words, display_config, session);
		}
		match words[0].to_lowercase().as_str() {
			"help" => return self.handle_meta(&[".help".to_string()], display_config, session),
			"exit" | "quit" => return CommandResult::Exit,
			_ => {}
		}

		let command = match Command::parse(&words) {
			Ok(command) => command,
			Err(e) => return CommandResult::Error(e),
		};
		match session.execute(command) {
			Ok(outcome) => CommandResult::Output(outcome),
			Err(e) => CommandResult::Error(e.to_string()),
		}
	}

	fn handle_meta(
		&self,
		parts: &[String],
		display_config: &mut DisplayConfig,
		session: &mut Session,
	) -> CommandResult {
		match parts[0].as_str() {
			".help" | ".h" | ".?" => {
				self.show_help();
				CommandResult::Continue
			}
			".exit" | ".quit" | ".q" => CommandResult::Exit,
			".clear" | ".cls" => CommandResult::ClearScreen,
			".timing" | ".time" => {
				display_config.show_timing = !display_config.show_timing;
				display::print_toggle("Command timing", display_config.show_timing);
				CommandResult::Continue
			}
			".color" | ".colors" => {
				display_config.use_colors = !display_config.use_colors;
				colored::control::set_override(display_config.use_colors);
				display::print_toggle("Colors", display_config.use_colors);
				CommandResult::Continue
			}
			".timeout" => {
				if parts.len() > 1 {
					match parts[1].parse::<u64>() {
						Ok(ms) => {
							session.set_timeout(Duration::from_millis(ms));
							display::print_info(&format!("Call timeout set to {}ms", ms));
						}
						Err(_) => {
							return CommandResult::Error(format!("Invalid timeout: {}", parts[1]));
						}
					}
				} else {
					display::print_info(&format!("Current call timeout: {:?}", session.timeout));
				}
				CommandResult::Continue
			}
			".history" | ".hist" => {
				if parts.len() > 1 {
					if let Ok(n) = parts[1].parse::<usize>() {
						CommandResult::ExecuteFromHistory(n)
					} else {
						CommandResult::Error(format!("Invalid history number: {}", parts[1]))
					}
				} else {
					CommandResult::ShowHistory
				}
			}
			".mode" => {
				if parts.len() > 1 {
					match parts[1].as_str() {
						"table" => display_config.output_mode = display::OutputMode::Table,
						"json" => display_config.output_mode = display::OutputMode::Json,
						"plain" => display_config.output_mode = display::OutputMode::Plain,
						_ => {
							return CommandResult::Error(format!("Unknown mode: {}", parts[1]));
						}
					}
					display::print_info(&format!("Output mode set to: {}", parts[1]));
				} else {
					display::print_info(&format!(
						"Current output mode: {:?}",
						display_config.output_mode
					));
				}
				CommandResult::Continue
			}
			".width" => {
				if parts.len() > 1 {
					if let Ok(width) = parts[1].parse::<usize>() {
						display_config.max_column_width = width;
						display::print_info(&format!("Max column width set to: {}", width));
					} else {
						return CommandResult::Error(format!("Invalid width: {}", parts[1]));
					}
				} else {
					display::print_info(&format!(
						"Current max column width: {}",
						display_config.max_column_width
					));
				}
				CommandResult::Continue
			}
			_ => CommandResult::Error(format!(
				"Unknown command: {}. Type .help for help.",
				parts[0]
			)),
		}
	}

	fn show_help(&self) {
		println!("\n{}", "Tandem Shell Commands".bright_cyan().bold());
		println!("{}", "─".repeat(60).bright_black());

		let commands = [
			("Records:", ""),
			("add <k> <v>", "Insert; fails if the key exists"),
			("try-add <k> <v>", "Insert if absent"),
			("get <k>", "Read a value"),
			("contains <k>", "Check whether a key exists"),
			("remove <k>", "Remove and show the old value"),
			("update <k> <v>", "Overwrite; fails if the key is absent"),
			("try-update <k> <v> <old>", "Overwrite only if the value is <old>"),
			("upsert <k> <v>", "Insert or overwrite"),
			("get-or-add <k> <v>", "Read, inserting <v> first if absent"),
			("replace <k> <new> [v]", "Move a record to a new key"),
			("add-all <k> <v> ...", "Insert many records atomically"),
			("remove-all <k> ...", "Remove many keys atomically"),
			("clear", "Remove every record"),
			("", ""),
			("Reading:", ""),
			("count", "Number of records"),
			("scan [level] [prefix]", "Enumerate keys in order"),
			("range <start> <end>", "Enumerate keys in [start, end)"),
			("", ""),
			("Atomic Groups:", ""),
			("begin", "Open a group; later writes join it"),
			("commit", "Commit the open group"),
			("rollback", "Roll back the open group"),
			("", ""),
			("Replica:", ""),
			("log", "Show the replication log"),
			("stats", "Show role, fault state, and statistics"),
			("", ""),
			("Shell:", ""),
			(".help, .h, .?", "Show this help message"),
			(".exit, .quit, .q", "Exit the shell"),
			(".clear, .cls", "Clear the screen"),
			(".timing, .time", "Toggle command timing"),
			(".color, .colors", "Toggle colors"),
			(".timeout [ms]", "Show or set the per-call timeout"),
			(".mode <format>", "Set output format (table/json/plain)"),
			(".width <n>", "Set maximum column width"),
			(".history, .hist", "Show command history"),
			(".history <n>", "Execute history entry n"),
		];

		for (cmd, desc) in commands {
			if cmd.is_empty() {
				println!();
			} else if desc.is_empty() {
				println!("{}", cmd.bright_yellow());
			} else {
				println!("  {:26} {}", cmd.bright_green(), desc.bright_white());
			}
		}

		println!("\n{}", "Isolation levels:".bright_yellow());
		println!("  serializable, repeatable, committed (default), uncommitted, unprotected");
		println!("  Use double quotes for values with spaces");
		println!();
	}
}
