use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::ChapterCache;
use crate::checkpoint::CheckpointStore;
use crate::cli::{CacheClearArgs, IngestArgs, StoreArgs};
use crate::fetch::HttpFetcher;
use crate::formats::document_id;
use crate::ingest::{BatchReport, IngestOptions, Ingestor, IngestorParts};
use crate::logging::{EventSink, TracingSink};
use crate::manifest::ManifestRegistry;
use crate::render::renderer_for;
use crate::throttle::RequestPacer;

/// Runs the batch and prints one line per book. Returns whether every book
/// ended up complete.
pub async fn ingest(args: IngestArgs, cancel: CancellationToken) -> anyhow::Result<bool> {
    let settings = args.settings().context("load settings")?;
    tracing::debug!(?settings, "effective settings");

    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let fetcher = HttpFetcher::new(settings.user_agent.clone()).context("build http client")?;
    let renderer = renderer_for(args.format, settings.output_dir());

    let ingestor = Ingestor::new(IngestorParts {
        fetcher: Arc::new(fetcher),
        renderer: Arc::from(renderer),
        cache: ChapterCache::new(settings.cache_dir(), events.clone()),
        checkpoints: CheckpointStore::new(settings.checkpoint_dir()),
        manifest: ManifestRegistry::new(settings.manifest_path()),
        retry: settings.retry_policy(),
        pacer: Arc::new(RequestPacer::new(settings.delay())),
        discovery: settings.discovery_options(),
        options: IngestOptions {
            fetch_timeout: settings.timeout(),
            force: args.force,
        },
        events,
    })
    .with_cancellation(cancel);

    let report = ingestor.run_batch(&args.urls).await;
    print_report(&report);
    if let Some(err) = report.aborted {
        return Err(anyhow::Error::new(err).context("ingest aborted"));
    }
    Ok(report.all_complete())
}

fn print_report(report: &BatchReport) {
    for entry in &report.entries {
        match &entry.result {
            Ok(outcome) => {
                let mut line = format!("{}\t{}\t{}", outcome.status, outcome.doc_id, entry.locator);
                if let Some(path) = &outcome.artifact_path {
                    line.push_str(&format!("\t{}", path.display()));
                }
                if !outcome.failed.is_empty() {
                    let failed = outcome
                        .failed
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(",");
                    line.push_str(&format!("\tfailed={failed}"));
                }
                println!("{line}");
            }
            Err(err) => println!("failed\t-\t{}\t{err}", entry.locator),
        }
    }
}

pub async fn manifest_list(args: StoreArgs) -> anyhow::Result<()> {
    let settings = args.settings().context("load settings")?;
    let registry = ManifestRegistry::new(settings.manifest_path());
    let entries = registry
        .list()
        .await
        .with_context(|| format!("read manifest: {}", registry.path().display()))?;

    for entry in entries {
        let artifact = entry
            .artifact_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}\t{} chapters\t{}",
            entry.status, entry.doc_id, entry.title, entry.chapter_count, artifact
        );
    }
    Ok(())
}

/// Removes a book's cached chapters and checkpoint so the next run starts fresh.
pub async fn cache_clear(args: CacheClearArgs) -> anyhow::Result<()> {
    let settings = args.store.settings().context("load settings")?;
    let url = Url::parse(&args.url).with_context(|| format!("parse url: {}", args.url))?;
    let doc_id = document_id(&url);

    let cache = ChapterCache::new(settings.cache_dir(), Arc::new(TracingSink));
    cache
        .invalidate(&doc_id)
        .await
        .with_context(|| format!("clear cache for {doc_id}"))?;
    CheckpointStore::new(settings.checkpoint_dir())
        .delete(&doc_id)
        .await
        .with_context(|| format!("delete checkpoint for {doc_id}"))?;

    println!("cleared\t{doc_id}\t{}", args.url);
    Ok(())
}
