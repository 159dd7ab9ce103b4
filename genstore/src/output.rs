//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use genstore_core::{DeferredDelete, GcReport, GenerationInfo, Hash, ObjectMetadata, StoreStats};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// The `data` parameter must be a serializable struct that includes
    /// `success: bool` and `result_code: u8` fields.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub algorithm: String,
    pub keep_last: usize,
    pub link_strategies: Vec<String>,
}

/// Object stored during `ingest` command.
#[derive(Debug, Clone, Serialize)]
pub struct IngestedObject {
    pub hash: Hash,
    pub kind: String,
    pub path: String,
    pub objects: usize,
}

#[derive(Debug, Serialize)]
pub struct IngestOutput {
    pub success: bool,
    pub result_code: u8,
    pub objects: Vec<IngestedObject>,
}

#[derive(Debug, Serialize)]
pub struct MaterializeOutput {
    pub success: bool,
    pub result_code: u8,
    pub hash: Hash,
    pub destination: String,
}

/// Output for `query` command.
#[derive(Debug, Serialize)]
pub struct QueryOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub object: ObjectMetadata,
    pub created_at_human: String,
}

/// Output for `stats` command.
#[derive(Debug, Serialize)]
pub struct StatsOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub stats: StoreStats,
}

impl StatsOutput {
    pub fn text(&self) -> String {
        let stats = &self.stats;
        format!(
            "Objects: {} ({} files, {} trees, {} symlinks)\n\
             Generations: {}\n\
             Stored: {} bytes\n\
             Saved by deduplication: {} bytes ({:.1}%)\n",
            stats.objects,
            stats.files,
            stats.trees,
            stats.symlinks,
            stats.generations,
            stats.total_bytes,
            stats.dedup_savings_bytes,
            stats.dedup_ratio * 100.0
        )
    }
}

/// Output for `build` command.
#[derive(Debug, Serialize)]
pub struct BuildOutput {
    pub success: bool,
    pub result_code: u8,
    pub generation: u64,
    pub fingerprint: Hash,
    pub roots: usize,
    pub activated: bool,
}

/// Output for `switch` and `rollback` commands.
#[derive(Debug, Serialize)]
pub struct SwitchOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<u64>,
    pub active: u64,
}

/// One row of the `generations` listing.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationEntry {
    pub id: u64,
    pub created_at: i64,
    pub created_at_human: String,
    pub fingerprint: Hash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<Hash>,
    pub active: bool,
    pub pinned: bool,
}

impl From<GenerationInfo> for GenerationEntry {
    fn from(info: GenerationInfo) -> Self {
        Self {
            created_at_human: format_timestamp(info.created_at),
            id: info.id,
            created_at: info.created_at,
            fingerprint: info.fingerprint,
            manifest_hash: info.manifest_hash,
            active: info.active,
            pinned: info.pinned,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GenerationsOutput {
    pub success: bool,
    pub result_code: u8,
    pub generations: Vec<GenerationEntry>,
}

/// Output for `pin`, `unpin`, `delete-generation` and `verify`.
#[derive(Debug, Serialize)]
pub struct GenerationActionOutput {
    pub success: bool,
    pub result_code: u8,
    pub generation: u64,
    pub action: String,
}

/// Output for `gc` command.
#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub report: GcReport,
}

impl GcOutput {
    pub fn text(&self) -> String {
        let report = &self.report;
        let mut text = String::new();
        if report.dry_run {
            text.push_str("Dry run - nothing deleted\n");
            text.push_str(&format!(
                "Would collect {} generation(s)\n",
                report.generations_collected.len()
            ));
            text.push_str(&format!(
                "Would delete {} objects\n",
                report.objects_collected
            ));
            text.push_str(&format!("Would free {} bytes\n", report.bytes_reclaimed));
            return text;
        }

        text.push_str(&format!(
            "Collected {} generation(s)\n",
            report.generations_collected.len()
        ));
        text.push_str(&format!("Deleted {} objects\n", report.objects_collected));
        text.push_str(&format!("Freed {} bytes\n", report.bytes_reclaimed));
        if report.strays_collected + report.temporaries_collected > 0 {
            text.push_str(&format!(
                "Swept {} stray file(s) and {} temporary file(s)\n",
                report.strays_collected, report.temporaries_collected
            ));
        }
        if report.stale_drafts_released > 0 {
            text.push_str(&format!(
                "Released {} abandoned build(s)\n",
                report.stale_drafts_released
            ));
        }
        for DeferredDelete {
            path,
            error,
            attempts,
        } in &report.deferred
        {
            text.push_str(&format!(
                "Deferred {} after {} attempt(s): {}\n",
                path.display(),
                attempts,
                error
            ));
        }
        text
    }
}

pub fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_timestamp(1_700_000_000), "2023-11-14 22:13:20 UTC");
    }

    #[test]
    fn test_gc_text_dry_run() {
        let output = GcOutput {
            success: true,
            result_code: 0,
            report: GcReport {
                dry_run: true,
                objects_collected: 3,
                bytes_reclaimed: 42,
                ..GcReport::default()
            },
        };
        let text = output.text();
        assert!(text.contains("Would delete 3 objects"));
        assert!(text.contains("Would free 42 bytes"));
    }

    #[test]
    fn test_stats_text() {
        let output = StatsOutput {
            success: true,
            result_code: 0,
            stats: StoreStats {
                objects: 3,
                files: 2,
                trees: 1,
                total_bytes: 300,
                dedup_savings_bytes: 100,
                dedup_ratio: 0.25,
                ..StoreStats::default()
            },
        };
        let text = output.text();
        assert!(text.contains("Objects: 3 (2 files, 1 trees, 0 symlinks)"));
        assert!(text.contains("Saved by deduplication: 100 bytes (25.0%)"));

        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["dedup_savings_bytes"], 100);
    }

    #[test]
    fn test_gc_json_is_flat() {
        let output = GcOutput {
            success: true,
            result_code: 0,
            report: GcReport::default(),
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["objects_collected"], 0);
        assert!(value["deferred"].as_array().unwrap().is_empty());
    }
}
