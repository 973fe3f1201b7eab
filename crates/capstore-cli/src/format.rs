//! Output formatting for the capstore CLI
//!
//! Supports three output formats, picked with `--output`:
//! - Table: bordered tables (default)
//! - JSON: machine-readable; the full registry or read result
//! - Text: one row per line, no borders

use anyhow::Result;
use capstore_agent::RefreshReport;
use capstore_core::{ApplicantRecord, ShardDescriptor, ShardRole};
use capstore_registry::RegistrySnapshot;
use capstore_router::{ReadResult, RoutedRecord};
use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Text,
}

/// One registry entry as shown by `status`.
#[derive(Debug, Serialize, Tabled)]
#[serde(rename_all = "camelCase")]
pub struct ShardRow {
    #[tabled(rename = "SHARD")]
    pub shard: String,
    #[tabled(rename = "ROLE")]
    pub role: String,
    #[tabled(rename = "USED")]
    pub used: String,
    #[tabled(rename = "SIZE")]
    pub size: String,
    #[tabled(rename = "LAST CHECKED")]
    pub last_checked: String,
    #[tabled(rename = "ALERT")]
    pub alert: String,
}

impl ShardRow {
    pub fn new(shard: &ShardDescriptor, high_water_mark: f64) -> Self {
        let capacity = &shard.capacity;
        let alert = if shard.role == ShardRole::WriteTarget
            && capacity.is_at_or_above(high_water_mark)
        {
            "⚠️ at high-water mark".to_string()
        } else {
            String::new()
        };
        Self {
            shard: shard.id.clone(),
            role: shard.role.as_str().to_string(),
            used: format!("{:.1}%", capacity.percent_used),
            size: format!(
                "{} / {}",
                format_bytes(capacity.used_bytes),
                format_bytes(capacity.total_bytes)
            ),
            last_checked: format_timestamp(capacity.observed_at),
            alert,
        }
    }
}

/// One applicant row of a read result.
#[derive(Debug, Serialize, Tabled)]
#[serde(rename_all = "camelCase")]
pub struct RecordRow {
    #[tabled(rename = "CANDIDATE")]
    pub candidate_id: String,
    #[tabled(rename = "NAME")]
    pub name: String,
    #[tabled(rename = "EMAIL")]
    pub email: String,
    #[tabled(rename = "SHARD")]
    pub shard: String,
    #[tabled(rename = "UPDATED")]
    pub updated: String,
}

impl From<&RoutedRecord> for RecordRow {
    fn from(row: &RoutedRecord) -> Self {
        Self {
            candidate_id: row.record.candidate_id.clone(),
            name: row.record.name.clone(),
            email: row.record.email.clone().unwrap_or_default(),
            shard: row.shard_id.clone(),
            updated: format_timestamp(row.record.updated_at),
        }
    }
}

/// Per-shard outcome of one `refresh`.
#[derive(Debug, Serialize, Tabled)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRow {
    #[tabled(rename = "SHARD")]
    pub shard: String,
    #[tabled(rename = "RESULT")]
    pub result: String,
    #[tabled(rename = "USED")]
    pub used: String,
}

impl RefreshRow {
    pub fn from_report(report: &RefreshReport) -> Vec<Self> {
        let mut rows: Vec<Self> = report
            .observed
            .iter()
            .map(|(shard_id, capacity)| Self {
                shard: shard_id.clone(),
                result: if report.recovered.contains(shard_id) {
                    "recovered".to_string()
                } else {
                    "ok".to_string()
                },
                used: format!(
                    "{:.1}% ({})",
                    capacity.percent_used,
                    format_bytes(capacity.used_bytes)
                ),
            })
            .collect();

        rows.extend(report.failed.iter().map(|(shard_id, error)| Self {
            shard: shard_id.clone(),
            result: if report.newly_unreachable.contains(shard_id) {
                format!("UNREACHABLE: {}", error)
            } else {
                format!("probe failed: {}", error)
            },
            used: "-".to_string(),
        }));
        rows
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshSummary<'a> {
    version: u64,
    shards: &'a [RefreshRow],
    high_water_mark_crossed: bool,
    write_target_lost: bool,
}

/// Format and print output based on the configured format
pub struct Formatter {
    format: OutputFormat,
    colored: bool,
}

impl Formatter {
    pub fn new(format: OutputFormat, colored: bool) -> Self {
        Self { format, colored }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Print a list of items
    pub fn print_list<T: Serialize + Tabled>(&self, items: Vec<T>) -> Result<()> {
        match self.format {
            OutputFormat::Table => self.print_table(items),
            OutputFormat::Json => self.print_json(&items),
            OutputFormat::Text => self.print_text(items),
        }
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub fn print_registry(&self, snapshot: &RegistrySnapshot, high_water_mark: f64) -> Result<()> {
        if self.is_json() {
            return self.print_json(snapshot);
        }
        if self.format == OutputFormat::Table {
            self.print_info(&format!(
                "Registry version {} ({} shard(s), high-water mark {}%)",
                snapshot.version,
                snapshot.len(),
                high_water_mark
            ));
        }
        self.print_list(
            snapshot
                .shards
                .iter()
                .map(|shard| ShardRow::new(shard, high_water_mark))
                .collect(),
        )
    }

    pub fn print_refresh(&self, report: &RefreshReport) -> Result<()> {
        let rows = RefreshRow::from_report(report);
        if self.is_json() {
            return self.print_json(&RefreshSummary {
                version: report.version,
                shards: &rows,
                high_water_mark_crossed: report.crossing.is_some(),
                write_target_lost: report.write_target_lost.is_some(),
            });
        }
        self.print_success(&format!(
            "Refresh committed registry version {}",
            report.version
        ));
        self.print_list(rows)
    }

    pub fn print_read_result(&self, result: &ReadResult) -> Result<()> {
        if self.is_json() {
            return self.print_json(result);
        }
        if !result.is_empty() {
            self.print_list(result.rows.iter().map(RecordRow::from).collect())?;
        }
        self.print_result_footer(result);
        Ok(())
    }

    /// Every field of one record; JSON prints the whole read result.
    pub fn print_record_detail(&self, result: &ReadResult) -> Result<()> {
        if self.is_json() {
            return self.print_json(result);
        }
        for row in &result.rows {
            if self.colored {
                println!("{} [{}]", row.record.candidate_id.bold(), row.shard_id);
            } else {
                println!("{} [{}]", row.record.candidate_id, row.shard_id);
            }
            print_key_value(record_fields(&row.record), self.colored);
        }
        self.print_result_footer(result);
        Ok(())
    }

    fn print_result_footer(&self, result: &ReadResult) {
        if result.is_empty() {
            println!("No records found");
        } else {
            println!("{} record(s)", result.len());
        }
        if result.partial {
            self.print_warning(&format!(
                "PARTIAL RESULT: shards did not answer: {}",
                result.unreachable_shards.join(", ")
            ));
        }
    }

    /// Print a success message
    pub fn print_success(&self, message: &str) {
        if self.colored {
            println!("{} {}", "✅".green(), message);
        } else {
            println!("✅ {}", message);
        }
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) {
        if self.colored {
            eprintln!("{} {}", "❌".red(), message.red());
        } else {
            eprintln!("❌ {}", message);
        }
    }

    /// Print an info message
    pub fn print_info(&self, message: &str) {
        if self.colored {
            println!("{} {}", "ℹ️".blue(), message);
        } else {
            println!("ℹ️  {}", message);
        }
    }

    /// Print a warning message
    pub fn print_warning(&self, message: &str) {
        if self.colored {
            println!("{} {}", "⚠️".yellow(), message.yellow());
        } else {
            println!("⚠️  {}", message);
        }
    }

    fn print_table<T: Tabled>(&self, items: Vec<T>) -> Result<()> {
        if items.is_empty() {
            println!("No items found");
            return Ok(());
        }
        println!("{}", render_table(items));
        Ok(())
    }

    fn print_text<T: Tabled>(&self, items: Vec<T>) -> Result<()> {
        if items.is_empty() {
            println!("No items found");
            return Ok(());
        }
        for line in render_text(&items) {
            println!("{}", line);
        }
        Ok(())
    }
}

pub fn render_table<T: Tabled>(items: Vec<T>) -> String {
    let mut table = Table::new(items);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    table.to_string()
}

/// Non-empty cells of each row, two spaces apart.
pub fn render_text<T: Tabled>(items: &[T]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            item.fields()
                .iter()
                .filter(|cell| !cell.is_empty())
                .map(|cell| &**cell)
                .collect::<Vec<&str>>()
                .join("  ")
        })
        .collect()
}

fn record_fields(record: &ApplicantRecord) -> Vec<(String, String)> {
    let mut pairs = vec![("Name".to_string(), record.name.clone())];
    let optional = [
        ("Email", &record.email),
        ("Phone", &record.phone),
        ("Resume", &record.resume_link),
        ("Created by", &record.created_by),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            pairs.push((key.to_string(), value.clone()));
        }
    }
    if record
        .form_data
        .as_object()
        .map(|fields| !fields.is_empty())
        .unwrap_or(false)
    {
        pairs.push(("Form".to_string(), record.form_data.to_string()));
    }
    pairs.push(("Can edit".to_string(), record.can_edit.to_string()));
    pairs.push(("Updated".to_string(), format_timestamp(record.updated_at)));
    pairs
}

/// Display key-value pairs
pub fn print_key_value(pairs: Vec<(String, String)>, colored: bool) {
    for (key, value) in pairs {
        if colored {
            println!("  {}: {}", key.bold(), value);
        } else {
            println!("  {}: {}", key, value);
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Millisecond epoch timestamp as UTC; `0` means never observed.
pub fn format_timestamp(millis: i64) -> String {
    if millis <= 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}
