use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Settings;
use crate::render::OutputFormat;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest one or more books into rendered artifacts.
    Ingest(IngestArgs),
    Manifest {
        #[command(subcommand)]
        command: ManifestCommand,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ManifestCommand {
    /// List every document recorded in the manifest.
    List(StoreArgs),
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Drop cached chapters for a book.
    Clear(CacheClearArgs),
}

/// Options shared by every command that touches the data directory.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// YAML settings file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root for cache, checkpoints, output and the manifest.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl StoreArgs {
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(data_dir) = &self.data_dir {
            settings.data_dir = data_dir.clone();
        }
        Ok(settings)
    }
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Book root URL (must be http/https). Repeat to ingest several books in order.
    #[arg(long = "url", required = true)]
    pub urls: Vec<String>,

    /// Artifact format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
    pub format: OutputFormat,

    /// Re-run books the manifest already records as complete.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Keep discovering until at least this many chapters are known.
    #[arg(long)]
    pub expected_chapters: Option<usize>,

    /// Relative chapter pattern probed when no table of contents is found, e.g. `ch{n}.html`.
    #[arg(long)]
    pub probe_template: Option<String>,

    /// Highest sequence number to probe.
    #[arg(long)]
    pub probe_max: Option<u32>,

    /// Delay after each chapter request (politeness).
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Attempts per chapter, including the first.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Base of the exponential backoff between attempts.
    #[arg(long)]
    pub backoff_base: Option<f64>,

    /// Per-request timeout.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[command(flatten)]
    pub store: StoreArgs,
}

impl IngestArgs {
    /// Settings from file and environment with this command's flags on top.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = self.store.settings()?;
        if let Some(value) = self.expected_chapters {
            settings.expected_chapters = Some(value);
        }
        if let Some(value) = &self.probe_template {
            settings.probe_template = value.clone();
        }
        if let Some(value) = self.probe_max {
            settings.probe_max = value;
        }
        if let Some(value) = self.delay_ms {
            settings.delay_ms = value;
        }
        if let Some(value) = self.max_attempts {
            settings.max_attempts = value;
        }
        if let Some(value) = self.backoff_base {
            settings.backoff_base = value;
        }
        if let Some(value) = self.timeout_ms {
            settings.timeout_ms = value;
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Args)]
pub struct CacheClearArgs {
    /// Book root URL whose cached chapters should be removed.
    #[arg(long)]
    pub url: String,

    #[command(flatten)]
    pub store: StoreArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "bookharvest",
            "ingest",
            "--url",
            "https://example.com/a/",
            "--url",
            "https://example.com/b/",
            "--format",
            "epub",
            "--delay-ms",
            "0",
            "--data-dir",
            "/tmp/harvest",
        ])
        .unwrap();
        let Command::Ingest(args) = cli.command else {
            panic!("expected ingest command");
        };
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.format, OutputFormat::Epub);

        let settings = args.settings().unwrap();
        assert_eq!(settings.delay_ms, 0);
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/harvest"));
    }

    #[test]
    fn md_is_accepted_as_format_alias() {
        let cli = Cli::try_parse_from([
            "bookharvest",
            "ingest",
            "--url",
            "https://example.com/",
            "--format",
            "md",
        ])
        .unwrap();
        let Command::Ingest(args) = cli.command else {
            panic!("expected ingest command");
        };
        assert_eq!(args.format, OutputFormat::Markdown);
    }

    #[test]
    fn ingest_requires_a_url() {
        assert!(Cli::try_parse_from(["bookharvest", "ingest"]).is_err());
    }
}
