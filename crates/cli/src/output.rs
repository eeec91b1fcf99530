//! CLI output formatting utilities.
//!
//! Colored status lines, human-readable sizes and durations, and JSON output
//! for scripted use.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use deriva_lib::build::{BuildDiagnostic, DiagnosticLevel};
use deriva_lib::request::Status;
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const CANCELED: &str = "⊘";
}

pub fn truncate_hash(hash: &str) -> &str {
  &hash[..hash.len().min(12)]
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [(&str, u64); 3] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];
  UNITS
    .iter()
    .find(|(_, size)| bytes >= *size)
    .map(|(unit, size)| format!("{:.1} {}", bytes as f64 / *size as f64, unit))
    .unwrap_or_else(|| format!("{} B", bytes))
}

/// Millisecond precision, e.g. `1m 5s` or `340ms`.
pub fn format_duration(duration: Duration) -> String {
  let millis = Duration::from_millis(duration.as_millis().try_into().unwrap_or(u64::MAX));
  if millis.is_zero() {
    return "0ms".to_string();
  }
  humantime::format_duration(millis).to_string()
}

/// `NONE` for an empty set, otherwise the flag names joined by `|`.
pub fn format_flags(names: &[&str]) -> String {
  if names.is_empty() {
    "NONE".to_string()
  } else {
    names.join(" | ")
  }
}

#[derive(Clone, Copy)]
enum Tone {
  Success,
  Info,
  Warning,
  Error,
  Canceled,
}

/// Problems go to stderr with the whole line colored; everything else goes to
/// stdout with only the symbol colored.
fn print_line(tone: Tone, message: &str) {
  match tone {
    Tone::Success => println!("{} {}", symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()), message),
    Tone::Info => println!("{} {}", symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()), message),
    Tone::Canceled => eprintln!("{} {}", symbols::CANCELED.if_supports_color(Stream::Stderr, |s| s.yellow()), message),
    Tone::Warning => {
      let line = format!("{} {}", symbols::WARNING, message);
      eprintln!("{}", line.if_supports_color(Stream::Stderr, |s| s.yellow()));
    }
    Tone::Error => {
      let line = format!("{} {}", symbols::ERROR, message);
      eprintln!("{}", line.if_supports_color(Stream::Stderr, |s| s.red()));
    }
  }
}

pub fn print_info(message: &str) {
  print_line(Tone::Info, message);
}

/// Headline for a finished build.
pub fn print_status(status: Status, message: &str) {
  let tone = match status {
    Status::Ok => Tone::Success,
    Status::Error => Tone::Error,
    Status::Canceled => Tone::Canceled,
  };
  print_line(tone, message);
}

pub fn print_diagnostic(diagnostic: &BuildDiagnostic) {
  let tone = match diagnostic.level {
    DiagnosticLevel::Error => Tone::Error,
    DiagnosticLevel::Warning => Tone::Warning,
  };
  print_line(tone, &format!("[{}] {}", diagnostic.category, diagnostic.message));
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
