use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bookharvest::cache::ChapterCache;
use bookharvest::checkpoint::CheckpointStore;
use bookharvest::discover::DiscoveryOptions;
use bookharvest::error::FetchError;
use bookharvest::fetch::{FetchResponse, Fetcher};
use bookharvest::formats::{ManifestStatus, document_id};
use bookharvest::ingest::{IngestOptions, Ingestor, IngestorParts};
use bookharvest::logging::{IngestEvent, MemorySink};
use bookharvest::manifest::ManifestRegistry;
use bookharvest::render::MarkdownRenderer;
use bookharvest::retry::RetryPolicy;
use bookharvest::throttle::RequestPacer;
use url::Url;

const ROOT: &str = "https://library.example/novel/";

/// In-memory source. Each locator replays its queue; the final response repeats.
#[derive(Default)]
struct FakeSource {
    queues: Mutex<HashMap<String, Vec<Outcome>>>,
    log: Mutex<Vec<String>>,
}

#[derive(Clone)]
enum Outcome {
    Page(u16, String),
    Timeout,
}

impl FakeSource {
    fn page(&self, url: &str, body: impl Into<String>) {
        self.queue(url, vec![Outcome::Page(200, body.into())]);
    }

    fn queue(&self, url: &str, outcomes: Vec<Outcome>) {
        self.queues
            .lock()
            .unwrap()
            .insert(url.to_string(), outcomes);
    }

    fn requests_for(&self, url: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    fn total_requests(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for FakeSource {
    async fn fetch(&self, locator: &Url, _timeout: Duration) -> Result<FetchResponse, FetchError> {
        self.log.lock().unwrap().push(locator.to_string());
        let mut queues = self.queues.lock().unwrap();
        let next = match queues.get_mut(locator.as_str()) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue[0].clone(),
            None => Outcome::Page(404, "404 Not Found".to_string()),
        };
        match next {
            Outcome::Page(status, content) => Ok(FetchResponse { status, content }),
            Outcome::Timeout => Err(FetchError::timeout(locator.as_str())),
        }
    }
}

fn chapter_body(n: usize) -> String {
    let sentence = format!("The river carried chapter {n} further downstream tonight. ");
    format!(
        "<html><head><title>Chapter {n}</title></head><body><h1>Chapter {n}</h1><p>{}</p></body></html>",
        sentence.repeat(15)
    )
}

fn novel(chapters: usize) -> FakeSource {
    let source = FakeSource::default();
    let links = (1..=chapters)
        .map(|n| format!("<li><a href=\"chapter-{n}.html\">Chapter {n}</a></li>"))
        .collect::<String>();
    source.page(
        ROOT,
        format!(
            "<html><head><meta property=\"og:title\" content=\"River Tales\"><meta name=\"author\" content=\"A. Writer\"></head>\
             <body><div id=\"toc\"><ul>{links}</ul></div></body></html>"
        ),
    );
    for n in 1..=chapters {
        source.page(&format!("{ROOT}chapter-{n}.html"), chapter_body(n));
    }
    source
}

fn ingestor(data: &Path, source: Arc<FakeSource>, events: Arc<MemorySink>) -> Ingestor {
    Ingestor::new(IngestorParts {
        fetcher: source,
        renderer: Arc::new(MarkdownRenderer::new(data.join("output"))),
        cache: ChapterCache::new(data.join("cache"), events.clone()),
        checkpoints: CheckpointStore::new(data.join("checkpoints")),
        manifest: ManifestRegistry::new(data.join("manifest.json")),
        retry: RetryPolicy::new(3, 2.0).with_unit(Duration::from_millis(1)),
        pacer: Arc::new(RequestPacer::new(Duration::ZERO)),
        discovery: DiscoveryOptions::default(),
        options: IngestOptions::default(),
        events,
    })
}

#[tokio::test]
async fn complete_run_writes_markdown_and_manifest() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let source = Arc::new(novel(3));
    let events = Arc::new(MemorySink::new());

    let outcome = ingestor(temp.path(), source.clone(), events)
        .ingest(ROOT)
        .await?;
    assert_eq!(outcome.status, ManifestStatus::Complete);

    let artifact = outcome.artifact_path.clone().expect("artifact path");
    let book = std::fs::read_to_string(&artifact)?;
    assert!(book.starts_with("# River Tales"));
    assert!(book.contains("A. Writer"));
    let first = book.find("chapter 1 further").expect("chapter 1 text");
    let third = book.find("chapter 3 further").expect("chapter 3 text");
    assert!(first < third);

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(temp.path().join("manifest.json"))?)?;
    assert_eq!(manifest["version"], 1);
    let entry = &manifest["documents"][outcome.doc_id.as_str()];
    assert_eq!(entry["status"], "complete");
    assert_eq!(entry["chapter_count"], 3);

    let checkpoint = temp
        .path()
        .join("checkpoints")
        .join(format!("{}.json", outcome.doc_id));
    assert!(!checkpoint.exists());
    Ok(())
}

#[tokio::test]
async fn rerun_of_complete_document_makes_no_requests() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let source = Arc::new(novel(2));

    ingestor(temp.path(), source.clone(), Arc::new(MemorySink::new()))
        .ingest(ROOT)
        .await?;
    let before = source.total_requests();

    let events = Arc::new(MemorySink::new());
    let again = ingestor(temp.path(), source.clone(), events.clone())
        .ingest(ROOT)
        .await?;
    assert!(again.skipped);
    assert_eq!(source.total_requests(), before);
    assert!(events.events().contains(&IngestEvent::AlreadyComplete {
        doc_id: again.doc_id.clone(),
    }));
    Ok(())
}

#[tokio::test]
async fn chapter_recovers_after_two_timeouts() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let source = novel(3);
    let flaky = format!("{ROOT}chapter-3.html");
    source.queue(
        &flaky,
        vec![
            Outcome::Timeout,
            Outcome::Timeout,
            Outcome::Page(200, chapter_body(3)),
        ],
    );
    let source = Arc::new(source);
    let events = Arc::new(MemorySink::new());

    let outcome = ingestor(temp.path(), source.clone(), events.clone())
        .ingest(ROOT)
        .await?;
    assert_eq!(outcome.status, ManifestStatus::Complete);
    assert_eq!(source.requests_for(&flaky), 3);

    let retries = events
        .events()
        .into_iter()
        .filter(|event| matches!(event, IngestEvent::Retrying { .. }))
        .count();
    assert_eq!(retries, 2);
    Ok(())
}

#[tokio::test]
async fn exhausted_timeouts_fail_only_that_chapter() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let source = novel(3);
    let dead = format!("{ROOT}chapter-3.html");
    source.queue(&dead, vec![Outcome::Timeout]);
    let source = Arc::new(source);

    let outcome = ingestor(temp.path(), source.clone(), Arc::new(MemorySink::new()))
        .ingest(ROOT)
        .await?;
    assert_eq!(outcome.status, ManifestStatus::Partial);
    assert_eq!(outcome.failed, vec![2]);
    assert_eq!(source.requests_for(&dead), 3);

    // the next run resumes and only retries the failed chapter
    source.page(&dead, chapter_body(3));
    let resumed = ingestor(temp.path(), source.clone(), Arc::new(MemorySink::new()))
        .ingest(ROOT)
        .await?;
    assert_eq!(resumed.status, ManifestStatus::Complete);
    assert_eq!(resumed.fetched, 1);
    assert_eq!(source.requests_for(&format!("{ROOT}chapter-1.html")), 1);
    Ok(())
}

#[tokio::test]
async fn captcha_page_marks_chapter_failed() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let source = novel(3);
    source.page(
        &format!("{ROOT}chapter-2.html"),
        "<html><body><h1>Are you a robot?</h1><p>Please complete the CAPTCHA.</p></body></html>",
    );
    let source = Arc::new(source);

    let outcome = ingestor(temp.path(), source, Arc::new(MemorySink::new()))
        .ingest(ROOT)
        .await?;
    assert_eq!(outcome.status, ManifestStatus::Partial);
    assert_eq!(outcome.failed, vec![1]);

    let registry = ManifestRegistry::new(temp.path().join("manifest.json"));
    let entry = registry.get(&outcome.doc_id).await?.expect("manifest entry");
    assert_eq!(entry.status, ManifestStatus::Partial);
    assert_eq!(entry.failed_chapters, vec![1]);
    assert!(entry.artifact_path.is_none());
    Ok(())
}

#[tokio::test]
async fn sequential_probe_finds_chapters_without_toc() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let source = FakeSource::default();
    // an index page without links is itself the opening chapter
    source.page(ROOT, chapter_body(0));
    for n in 1..=2 {
        source.page(&format!("{ROOT}ch{n:02}.html"), chapter_body(n));
    }
    let source = Arc::new(source);

    let outcome = ingestor(temp.path(), source.clone(), Arc::new(MemorySink::new()))
        .ingest(ROOT)
        .await?;
    assert_eq!(outcome.status, ManifestStatus::Complete);
    assert_eq!(outcome.fetched, 3);
    let book = std::fs::read_to_string(outcome.artifact_path.as_ref().expect("artifact"))?;
    let opening = book.find("chapter 0 further").expect("root chapter");
    let second = book.find("chapter 2 further").expect("probed chapter");
    assert!(opening < second);
    // probing stops at the first missing chapter
    assert_eq!(source.requests_for(&format!("{ROOT}ch03.html")), 1);
    assert_eq!(
        outcome.doc_id,
        document_id(&Url::parse("https://library.example/novel/#top")?)
    );
    Ok(())
}
