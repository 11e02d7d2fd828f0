//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use serde::Serialize;

use fieldcache::{
    EntityRef, FieldDescriptor, FieldSummary, Sample, SampleStatus, SummaryKind, SummaryValue,
};

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Get the current format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => value.write_table(writer)?,
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

/// The field catalog.
#[derive(Debug, Clone, Serialize)]
pub struct FieldCatalog {
    /// Registered fields in id order.
    pub fields: Vec<FieldDescriptor>,
}

impl TableDisplay for FieldCatalog {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(
            writer,
            "{:>5}  {:<28}  {:<8}  {:<7}  SUMMARIES",
            "ID", "TAG", "TYPE", "SCOPE"
        )?;
        writeln!(writer, "{}", "─".repeat(72))?;
        for field in &self.fields {
            let summaries: Vec<_> = field.summaries.kinds().map(SummaryKind::as_str).collect();
            writeln!(
                writer,
                "{:>5}  {:<28}  {:<8}  {:<7}  {}",
                field.id,
                field.tag,
                lower_debug(&field.field_type),
                lower_debug(&field.scope),
                if summaries.is_empty() { "-".to_string() } else { summaries.join(",") }
            )?;
        }
        writeln!(writer)?;
        writeln!(writer, "Total: {} field(s)", self.fields.len())?;
        Ok(())
    }
}

/// One latest-value row.
#[derive(Debug, Clone, Serialize)]
pub struct LatestRow {
    /// The entity read.
    pub entity: EntityRef,
    /// Field tag.
    pub field: String,
    /// The latest sample.
    pub sample: Sample,
}

/// Latest values of every watched key.
#[derive(Debug, Clone, Serialize)]
pub struct LatestReport {
    /// Driver ticks that ran.
    pub ticks: u64,
    /// Samples recorded over the run.
    pub recorded: u64,
    /// Policy violations raised over the run.
    pub violations: u64,
    /// One row per watched key.
    pub rows: Vec<LatestRow>,
}

impl TableDisplay for LatestReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.rows.is_empty() {
            writeln!(writer, "No watched fields")?;
            return Ok(());
        }

        writeln!(
            writer,
            "{:<12}  {:<24}  {:<16}  {:>18}",
            "ENTITY", "FIELD", "STATUS", "VALUE"
        )?;
        writeln!(writer, "{}", "─".repeat(76))?;
        for row in &self.rows {
            let value = row
                .sample
                .value
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string);
            writeln!(
                writer,
                "{:<12}  {:<24}  {:<16}  {:>18}",
                row.entity.to_string(),
                truncate(&row.field, 24),
                row.sample.status.to_string(),
                truncate(&value, 18)
            )?;
        }
        writeln!(writer)?;
        writeln!(
            writer,
            "{} tick(s), {} sample(s) recorded",
            self.ticks, self.recorded
        )?;
        if self.violations > 0 {
            writeln!(writer, "{} policy violation(s)", self.violations)?;
        }
        Ok(())
    }
}

/// Summaries of one field across entities.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    /// Field tag.
    pub field: String,
    /// Requested kinds, in column order.
    pub kinds: Vec<SummaryKind>,
    /// One summary per entity.
    pub summaries: Vec<FieldSummary>,
}

impl TableDisplay for SummaryReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Summary: {}", self.field)?;
        write!(writer, "{:<12}  {:>7}", "ENTITY", "SAMPLES")?;
        for kind in &self.kinds {
            write!(writer, "  {:>14}", kind.as_str().to_uppercase())?;
        }
        writeln!(writer)?;
        writeln!(writer, "{}", "─".repeat(21 + 16 * self.kinds.len()))?;

        for summary in &self.summaries {
            write!(
                writer,
                "{:<12}  {:>7}",
                summary.key.entity.to_string(),
                summary.sample_count
            )?;
            if summary.status == SampleStatus::Ok {
                for kind in &self.kinds {
                    let value = summary.get(*kind).unwrap_or(SummaryValue::NoData);
                    write!(writer, "  {:>14}", value.to_string())?;
                }
            } else {
                write!(writer, "  {}", summary.status)?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }
}

/// Result of writing a config file.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigWritten {
    /// Where the config was written.
    pub path: String,
}

impl TableDisplay for ConfigWritten {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Wrote default configuration to {}", self.path)?;
        Ok(())
    }
}

fn lower_debug<T: std::fmt::Debug>(value: &T) -> String {
    format!("{value:?}").to_lowercase()
}

/// Truncate a string to a maximum length, adding ellipsis if needed.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}
