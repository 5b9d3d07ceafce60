use bytes::Bytes;
use colored::Colorize;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use serde_json::json;
use std::time::Duration;
use tandem_core::record::LogEntry;
use tandem_core::storage::OrderedStore;
use tandem_core::{FaultType, GroupId, LocalReplica, ReplicaRole, SequenceNumber};

#[derive(Debug, Clone)]
pub enum OutputMode {
	Table,
	Json,
	Plain,
}

#[derive(Debug, Clone)]
pub struct DisplayConfig {
	pub show_timing: bool,
	pub use_colors: bool,
	pub output_mode: OutputMode,
	pub max_column_width: usize,
}

impl Default for DisplayConfig {
	fn default() -> Self {
		Self {
			show_timing: true,
			use_colors: true,
			output_mode: OutputMode::Table,
			max_column_width: 30,
		}
	}
}

/// Result of a data command, ready to print.
pub enum Outcome {
	Done(String),
	Value(Option<Bytes>),
	Flag(bool),
	Number(u64),
	Rows(Vec<(Bytes, Bytes)>),
	Log(Vec<LogEntry>),
	Status(StatusReport),
}

pub struct StatusReport {
	pub name: String,
	pub role: ReplicaRole,
	pub fault: Option<FaultType>,
	pub readable: bool,
	pub writable: bool,
	pub records: u64,
	pub memory_bytes: u64,
	pub committed: SequenceNumber,
	pub stable: SequenceNumber,
	pub log_entries: usize,
	pub epoch: Option<String>,
}

impl StatusReport {
	pub fn capture(replica: &LocalReplica) -> Self {
		let provider = &replica.provider;
		let stats = replica.store.statistics();
		Self {
			name: provider.name().to_string(),
			role: provider.role(),
			fault: provider.fault(),
			readable: provider.is_readable(),
			writable: provider.is_writable(),
			records: stats.record_count,
			memory_bytes: stats.memory_bytes,
			committed: provider.last_committed_sequence_number(),
			stable: replica.replicator.stable_watermark(),
			log_entries: replica.replicator.entries().len(),
			epoch: provider
				.current_epoch()
				.map(|e| format!("{}.{}", e.data_loss_number, e.configuration_number)),
		}
	}

	fn fields(&self) -> Vec<(&'static str, String)> {
		vec![
			("name", self.name.clone()),
			("role", self.role.to_string()),
			(
				"fault",
				self.fault.map_or("none".to_string(), |f| format!("{:?}", f)),
			),
			("readable", self.readable.to_string()),
			("writable", self.writable.to_string()),
			("records", self.records.to_string()),
			("memory bytes", self.memory_bytes.to_string()),
			("last committed", self.committed.to_string()),
			("stable", self.stable.to_string()),
			("log entries", self.log_entries.to_string()),
			("epoch", self.epoch.clone().unwrap_or_else(|| "-".to_string())),
		]
	}
}

fn text(bytes: &Bytes) -> String {
	String::from_utf8_lossy(bytes).into_owned()
}

fn clip(s: String, width: usize) -> String {
	if width > 3 && s.chars().count() > width {
		let kept: String = s.chars().take(width - 3).collect();
		format!("{}...", kept)
	} else {
		s
	}
}

fn entry_group(entry: &LogEntry) -> Option<GroupId> {
	match entry {
		LogEntry::CreateAtomicGroup { group, .. }
		| LogEntry::CommitAtomicGroup { group, .. }
		| LogEntry::RollbackAtomicGroup { group, .. }
		| LogEntry::AbortAtomicGroup { group, .. }
		| LogEntry::Redo { group, .. }
		| LogEntry::Undo { group, .. } => Some(*group),
		_ => None,
	}
}

fn entry_size(entry: &LogEntry) -> usize {
	match entry {
		LogEntry::Redo { payload, .. }
		| LogEntry::Undo { payload, .. }
		| LogEntry::SingleOperation { payload, .. }
		| LogEntry::Copy { payload } => payload.len(),
		_ => 0,
	}
}

fn new_table(header: Vec<&str>) -> Table {
	let mut table = Table::new();
	table
		.load_preset(UTF8_FULL)
		.set_content_arrangement(ContentArrangement::Dynamic)
		.set_header(header);
	table
}

pub fn print_outcome(outcome: &Outcome, duration: Duration, config: &DisplayConfig) {
	match (&config.output_mode, outcome) {
		(OutputMode::Json, _) => println!("{}", outcome_json(outcome)),
		(_, Outcome::Done(msg)) => print_success(msg),
		(_, Outcome::Value(None)) => println!("{}", "(absent)".dimmed()),
		(_, Outcome::Value(Some(v))) => println!("{}", text(v)),
		(_, Outcome::Flag(flag)) => println!("{}", flag),
		(_, Outcome::Number(n)) => println!("{}", n),
		(OutputMode::Plain, Outcome::Rows(rows)) => {
			for (k, v) in rows {
				println!("{}\t{}", text(k), text(v));
			}
		}
		(_, Outcome::Rows(rows)) => {
			let mut table = new_table(vec!["key", "value"]);
			for (k, v) in rows {
				table.add_row(vec![
					clip(text(k), config.max_column_width),
					clip(text(v), config.max_column_width),
				]);
			}
			println!("{}", table);
			println!("  {} row(s)", rows.len().to_string().bright_white());
		}
		(OutputMode::Plain, Outcome::Log(entries)) => {
			for entry in entries {
				println!(
					"{}\t{}\t{}",
					entry.sequence_number().map_or("-".to_string(), |s| s.to_string()),
					entry.name(),
					entry_group(entry).map_or("-".to_string(), |g| g.to_string())
				);
			}
		}
		(_, Outcome::Log(entries)) => {
			let mut table = new_table(vec!["seq", "entry", "group", "bytes"]);
			for entry in entries {
				table.add_row(vec![
					entry.sequence_number().map_or("-".to_string(), |s| s.to_string()),
					entry.name().to_string(),
					entry_group(entry).map_or("-".to_string(), |g| g.to_string()),
					entry_size(entry).to_string(),
				]);
			}
			println!("{}", table);
		}
		(OutputMode::Plain, Outcome::Status(report)) => {
			for (field, value) in report.fields() {
				println!("{}: {}", field, value);
			}
		}
		(_, Outcome::Status(report)) => {
			let mut table = new_table(vec!["field", "value"]);
			for (field, value) in report.fields() {
				table.add_row(vec![field.to_string(), value]);
			}
			println!("{}", table);
		}
	}

	if config.show_timing {
		println!(
			"  {} {:.3}ms",
			"Time:".bright_black(),
			duration.as_secs_f64() * 1000.0
		);
	}
}

fn outcome_json(outcome: &Outcome) -> serde_json::Value {
	match outcome {
		Outcome::Done(msg) => json!({ "ok": msg }),
		Outcome::Value(v) => json!({ "value": v.as_ref().map(text) }),
		Outcome::Flag(flag) => json!({ "result": flag }),
		Outcome::Number(n) => json!({ "count": n }),
		Outcome::Rows(rows) => serde_json::Value::Array(
			rows.iter()
				.map(|(k, v)| json!({ "key": text(k), "value": text(v) }))
				.collect(),
		),
		Outcome::Log(entries) => serde_json::Value::Array(
			entries
				.iter()
				.map(|e| {
					json!({
						"seq": e.sequence_number().map(|s| s.0),
						"entry": e.name(),
						"group": entry_group(e).map(|g| g.0),
						"bytes": entry_size(e),
					})
				})
				.collect(),
		),
		Outcome::Status(report) => serde_json::Value::Object(
			report
				.fields()
				.into_iter()
				.map(|(field, value)| (field.to_string(), json!(value)))
				.collect(),
		),
	}
}

pub fn print_welcome() {
	println!(
		"\n{}",
		"╔═══════════════════════════════════════╗".bright_cyan()
	);
	println!(
		"{}",
		"║          Tandem Replica Shell         ║"
			.bright_cyan()
			.bold()
	);
	println!(
		"{}",
		"╚═══════════════════════════════════════╝".bright_cyan()
	);
	println!();
	println!(
		"Type {} for help, {} to exit",
		".help".bright_green(),
		".exit".bright_green()
	);
	println!();
}

pub fn print_replica(replica: &LocalReplica) {
	let provider = &replica.provider;
	print_success(&format!(
		"Replica {} is {} ({} record(s))",
		provider.name(),
		provider.role(),
		replica.store.statistics().record_count
	));
	if let Some(path) = &provider.config().store.log_path {
		print_info(&format!("Replication log: {}", path.display()));
	} else {
		print_hint("Replication log is in memory; set store.log_path to keep it");
	}
}

pub fn print_goodbye(command_count: usize, duration: Duration) {
	println!();
	println!("{}", "─".repeat(40).bright_black());
	println!("   Executed {} commands in {:.1?}", command_count, duration);
	println!();
}

pub fn clear_screen() {
	print!("\x1B[2J\x1B[1;1H");
}

pub fn print_error(msg: &str) {
	println!("{} {}", "✗".bright_red().bold(), msg.bright_red());
}

pub fn print_warning(msg: &str) {
	println!("{} {}", "⚠".bright_yellow(), msg.bright_yellow());
}

pub fn print_info(msg: &str) {
	println!("{} {}", "ℹ".bright_blue(), msg.bright_white());
}

pub fn print_success(msg: &str) {
	println!("{} {}", "✓".bright_green().bold(), msg.bright_green());
}

pub fn print_hint(msg: &str) {
	println!("{} {}", "💡".bright_white(), msg.bright_white().dimmed());
}

pub fn print_toggle(feature: &str, enabled: bool) {
	let status = if enabled {
		"ON".bright_green().bold()
	} else {
		"OFF".bright_red()
	};
	println!("{}: {}", feature, status);
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn clip_shortens_long_cells() {
		assert_eq!(clip("abcdefgh".to_string(), 6), "abc...");
		assert_eq!(clip("abc".to_string(), 6), "abc");
	}

	#[test]
	fn json_for_rows_and_absent_values() {
		let rows = Outcome::Rows(vec![(Bytes::from_static(b"a"), Bytes::from_static(b"1"))]);
		assert_eq!(
			outcome_json(&rows),
			json!([{ "key": "a", "value": "1" }])
		);
		assert_eq!(
			outcome_json(&Outcome::Value(None)),
			json!({ "value": null })
		);
	}

	#[test]
	fn log_entries_report_their_group() {
		let entry = LogEntry::CommitAtomicGroup {
			group: GroupId(4),
			sequence_number: SequenceNumber(9),
		};
		assert_eq!(entry_group(&entry), Some(GroupId(4)));
		assert_eq!(entry_group(&LogEntry::EndOfStream), None);
	}
}
