//! Resolves the ordered chapter list of a document.
//!
//! Strategies run left to right and accumulate chapters until the result is
//! non-empty and meets the expected chapter count. The ordering policy then
//! decides the final index of every chapter, independent of discovery order.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{DiscoveryError, FetchError};
use crate::extract::{Field, FieldExtractor, TocRule};
use crate::fetch::Fetcher;
use crate::formats::{Chapter, Document, document_id, normalize_locator};
use crate::logging::{EventSink, IngestEvent};
use crate::retry::RetryExecutor;
use crate::throttle::RequestPacer;

pub const DEFAULT_PROBE_PATTERN: &str = "ch{n}.html";
pub const DEFAULT_PROBE_WIDTH: usize = 2;
pub const DEFAULT_PROBE_MAX: u32 = 200;

static SEQUENTIAL_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^a-z])(?:chapter|chap|ch|part|section|sec|page)[-_ ]?0*(\d+)")
        .expect("valid sequential marker regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTemplate {
    /// Relative locator with a `{n}` placeholder for the sequence number.
    pub pattern: String,
    /// Zero padding applied to the number.
    pub width: usize,
    pub start: u32,
    /// Inclusive upper bound; probing never goes past it.
    pub max: u32,
}

impl Default for ProbeTemplate {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PROBE_PATTERN.to_string(),
            width: DEFAULT_PROBE_WIDTH,
            start: 1,
            max: DEFAULT_PROBE_MAX,
        }
    }
}

impl ProbeTemplate {
    pub fn relative(&self, n: u32) -> String {
        let number = format!("{n:0width$}", width = self.width);
        self.pattern.replace("{n}", &number)
    }

    pub fn locator(&self, base_dir: &Url, n: u32) -> Result<Url, url::ParseError> {
        base_dir.join(&self.relative(n))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    TableOfContents { rules: Vec<TocRule> },
    SequentialProbe(ProbeTemplate),
}

impl DiscoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TableOfContents { .. } => "table-of-contents",
            Self::SequentialProbe(_) => "sequential-probe",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub strategies: Vec<DiscoveryStrategy>,
    pub expected_chapters: Option<usize>,
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            strategies: vec![
                DiscoveryStrategy::TableOfContents {
                    rules: TocRule::DEFAULT_ORDER.to_vec(),
                },
                DiscoveryStrategy::SequentialProbe(ProbeTemplate::default()),
            ],
            expected_chapters: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Maps a chapter locator to a sort priority; lower sorts first.
pub trait OrderingPolicy: Send + Sync {
    fn priority(&self, locator: &Url) -> u32;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityBand {
    pub tokens: Vec<String>,
    pub priority: u32,
}

impl PriorityBand {
    pub fn new(tokens: &[&str], priority: u32) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            priority,
        }
    }
}

/// Front matter, numbered body and back matter bands keyed on file-name tokens.
#[derive(Debug, Clone)]
pub struct StructuralBands {
    pub front: Vec<PriorityBand>,
    pub body_base: u32,
    pub back: Vec<PriorityBand>,
    pub unknown: u32,
}

impl Default for StructuralBands {
    fn default() -> Self {
        Self {
            front: vec![
                PriorityBand::new(&["index"], 0),
                PriorityBand::new(&["cover"], 10),
                PriorityBand::new(&["titlepage", "halftitle"], 20),
                PriorityBand::new(&["copyright"], 30),
                PriorityBand::new(&["toc", "contents"], 40),
                PriorityBand::new(&["dedication"], 50),
                PriorityBand::new(&["foreword"], 60),
                PriorityBand::new(&["preface"], 70),
                PriorityBand::new(&["intro", "introduction", "prologue"], 80),
            ],
            body_base: 1_000,
            back: vec![
                PriorityBand::new(&["epilogue", "afterword", "conclusion"], 1_000_000),
                PriorityBand::new(&["appendix"], 1_000_100),
                PriorityBand::new(&["acknowledgments", "acknowledgements"], 1_000_200),
                PriorityBand::new(&["glossary"], 1_000_300),
                PriorityBand::new(&["bibliography", "references"], 1_000_400),
                PriorityBand::new(&["about"], 1_000_500),
                PriorityBand::new(&["colophon"], 1_000_600),
            ],
            unknown: u32::MAX,
        }
    }
}

impl OrderingPolicy for StructuralBands {
    fn priority(&self, locator: &Url) -> u32 {
        let stem = file_stem(locator);
        if let Some(number) = SEQUENTIAL_MARKER
            .captures(&stem)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            return self.body_base.saturating_add(number.min(900_000));
        }

        let words = stem
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>();
        self.front
            .iter()
            .chain(self.back.iter())
            .find(|band| {
                band.tokens
                    .iter()
                    .any(|token| words.iter().any(|word| word.starts_with(token.as_str())))
            })
            .map(|band| band.priority)
            .unwrap_or(self.unknown)
    }
}

/// Lowercased last path segment without extension; `index` for directory locators.
fn file_stem(locator: &Url) -> String {
    let last = locator
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    if last.is_empty() {
        return "index".to_string();
    }
    let stem = match last.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => last,
    };
    stem.to_ascii_lowercase()
}

#[derive(Debug, Clone)]
struct Candidate {
    locator: Url,
    title: String,
}

pub struct Discoverer {
    fetcher: Arc<dyn Fetcher>,
    retry: RetryExecutor,
    pacer: Arc<RequestPacer>,
    fields: FieldExtractor,
    ordering: Arc<dyn OrderingPolicy>,
    options: DiscoveryOptions,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Discoverer {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        retry: RetryExecutor,
        pacer: Arc<RequestPacer>,
        options: DiscoveryOptions,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            fetcher,
            retry,
            pacer,
            fields: FieldExtractor::default(),
            ordering: Arc::new(StructuralBands::default()),
            options,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Probing stops early once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_ordering(mut self, ordering: Arc<dyn OrderingPolicy>) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_fields(mut self, fields: FieldExtractor) -> Self {
        self.fields = fields;
        self
    }

    pub async fn discover(&self, locator: &str) -> Result<Document, DiscoveryError> {
        let root = Url::parse(locator).map_err(|source| DiscoveryError::InvalidLocator {
            locator: locator.to_string(),
            source,
        })?;
        let root = normalize_locator(&root);

        let html = self
            .fetch_root(&root)
            .await
            .map_err(|source| DiscoveryError::RootUnavailable {
                locator: root.to_string(),
                source,
            })?;

        let title = self
            .fields
            .extract(Field::Title, &html)
            .unwrap_or_else(|| fallback_title(&root));
        let author = self.fields.extract(Field::Author, &html);

        let mut found: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for strategy in &self.options.strategies {
            if self.is_satisfied(found.len()) {
                break;
            }
            let before = found.len();
            match strategy {
                DiscoveryStrategy::TableOfContents { rules } => {
                    for candidate in table_of_contents(&root, &html, rules) {
                        push_unique(&mut found, &mut seen, candidate);
                    }
                }
                DiscoveryStrategy::SequentialProbe(template) => {
                    if found.is_empty() {
                        push_unique(
                            &mut found,
                            &mut seen,
                            Candidate {
                                locator: root.clone(),
                                title: title.clone(),
                            },
                        );
                    }
                    self.probe_sequence(&root, template, &mut found, &mut seen)
                        .await;
                }
            }
            self.events.record(IngestEvent::DiscoveryPass {
                locator: root.to_string(),
                strategy: strategy.name(),
                found: found.len() - before,
            });
        }

        if found.is_empty() {
            return Err(DiscoveryError::NoChapters {
                locator: root.to_string(),
            });
        }

        found.sort_by_key(|candidate| self.ordering.priority(&candidate.locator));
        let chapters = found
            .into_iter()
            .enumerate()
            .map(|(index, candidate)| Chapter {
                index,
                title: candidate.title,
                locator: candidate.locator.to_string(),
            })
            .collect();

        Ok(Document {
            id: document_id(&root),
            title,
            author,
            locator: root.to_string(),
            chapters,
        })
    }

    fn is_satisfied(&self, found: usize) -> bool {
        found > 0 && self.options.expected_chapters.is_none_or(|expected| found >= expected)
    }

    async fn fetch_root(&self, root: &Url) -> Result<String, FetchError> {
        let timeout = self.options.timeout;
        self.retry
            .run(
                |_| async move {
                    self.pacer.wait().await;
                    self.fetcher.fetch(root, timeout).await?.into_content(root)
                },
                FetchError::is_retryable,
            )
            .await
    }

    async fn probe_sequence(
        &self,
        root: &Url,
        template: &ProbeTemplate,
        found: &mut Vec<Candidate>,
        seen: &mut HashSet<String>,
    ) {
        let base_dir = match root.join("./") {
            Ok(dir) => dir,
            Err(err) => {
                tracing::debug!(%root, ?err, "cannot derive probe directory");
                return;
            }
        };

        for n in template.start..=template.max {
            let Ok(candidate) = template.locator(&base_dir, n) else {
                break;
            };
            let candidate = normalize_locator(&candidate);
            if seen.contains(candidate.as_str()) {
                continue;
            }
            if self.cancel.is_cancelled() {
                tracing::debug!(url = %candidate, "probing cancelled");
                break;
            }

            self.pacer.wait().await;
            match self.fetcher.probe(&candidate, self.options.timeout).await {
                Ok(status) if (200..300).contains(&status) => {
                    push_unique(
                        found,
                        seen,
                        Candidate {
                            locator: candidate,
                            title: format!("Chapter {n}"),
                        },
                    );
                }
                Ok(status) => {
                    tracing::debug!(url = %candidate, status, "probe ended sequence");
                    break;
                }
                Err(err) => {
                    tracing::debug!(url = %candidate, %err, "probe failed; ending sequence");
                    break;
                }
            }
        }
    }
}

fn push_unique(found: &mut Vec<Candidate>, seen: &mut HashSet<String>, candidate: Candidate) {
    if seen.insert(candidate.locator.to_string()) {
        found.push(candidate);
    }
}

/// First table-of-contents rule that yields in-scope links wins.
fn table_of_contents(root: &Url, html: &str, rules: &[TocRule]) -> Vec<Candidate> {
    for rule in rules {
        let mut seen = HashSet::new();
        let candidates = rule
            .apply(html)
            .into_iter()
            .filter_map(|link| {
                let resolved = normalize_locator(&root.join(&link.href).ok()?);
                if !is_same_origin(root, &resolved) || is_same_document(root, &resolved) {
                    return None;
                }
                if *rule == TocRule::AllAnchors && !is_chapter_like(root, &resolved) {
                    return None;
                }
                if !seen.insert(resolved.to_string()) {
                    return None;
                }
                let title = if link.text.is_empty() {
                    file_stem(&resolved)
                } else {
                    link.text
                };
                Some(Candidate {
                    locator: resolved,
                    title,
                })
            })
            .collect::<Vec<_>>();

        tracing::debug!(rule = rule.name(), found = candidates.len(), "toc rule");
        if !candidates.is_empty() {
            return candidates;
        }
    }
    Vec::new()
}

fn is_same_origin(root: &Url, url: &Url) -> bool {
    url.scheme() == root.scheme()
        && url.host_str() == root.host_str()
        && url.port_or_known_default() == root.port_or_known_default()
}

fn is_same_document(root: &Url, url: &Url) -> bool {
    fn trimmed(url: &Url) -> String {
        let mut url = url.clone();
        url.set_query(None);
        url.as_str().trim_end_matches('/').to_string()
    }
    trimmed(root) == trimmed(url)
}

/// Document-like links that live in the root's directory.
fn is_chapter_like(root: &Url, url: &Url) -> bool {
    let Ok(dir) = root.join("./") else {
        return false;
    };
    if !url.path().starts_with(dir.path()) {
        return false;
    }
    let last = url.path().rsplit('/').next().unwrap_or_default();
    if last.is_empty() {
        return false;
    }
    match last.rsplit_once('.') {
        Some((_, ext)) => matches!(
            ext.to_ascii_lowercase().as_str(),
            "html" | "htm" | "xhtml"
        ),
        None => true,
    }
}

fn fallback_title(root: &Url) -> String {
    root.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .map(ToString::to_string)
        .or_else(|| root.host_str().map(ToString::to_string))
        .unwrap_or_else(|| root.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn probe_template_pads_numbers() {
        let template = ProbeTemplate::default();
        assert_eq!(template.relative(3), "ch03.html");
        let base = url("https://example.com/book/");
        assert_eq!(
            template.locator(&base, 12).unwrap().as_str(),
            "https://example.com/book/ch12.html"
        );
    }

    #[test]
    fn structural_bands_order_front_body_back() {
        let bands = StructuralBands::default();
        let p = |s: &str| bands.priority(&url(s));
        assert!(p("https://e.com/b/index.html") < p("https://e.com/b/titlepage.xhtml"));
        assert!(p("https://e.com/b/titlepage.xhtml") < p("https://e.com/b/foreword.html"));
        assert!(p("https://e.com/b/foreword.html") < p("https://e.com/b/ch01.html"));
        assert!(p("https://e.com/b/ch02.html") < p("https://e.com/b/ch10.html"));
        assert!(p("https://e.com/b/chapter-10.html") < p("https://e.com/b/colophon.html"));
        assert!(p("https://e.com/b/colophon.html") < p("https://e.com/b/mystery.html"));
        assert_eq!(p("https://e.com/b/mystery.html"), u32::MAX);
        assert_eq!(p("https://e.com/b/"), 0);
    }

    #[test]
    fn sequential_marker_needs_word_boundary() {
        let bands = StructuralBands::default();
        assert_eq!(bands.priority(&url("https://e.com/b/part_3.html")), 1_003);
        assert_eq!(bands.priority(&url("https://e.com/b/book-ch07.html")), 1_007);
        assert_eq!(bands.priority(&url("https://e.com/b/epoch5.html")), u32::MAX);
    }

    #[test]
    fn toc_links_are_resolved_scoped_and_deduplicated() {
        let root = url("https://example.com/book/index.html");
        let html = r#"<nav epub:type="toc"><ol>
<li><a href="ch01.html">One</a></li>
<li><a href="ch01.html#part-b">One again</a></li>
<li><a href="https://elsewhere.com/ch02.html">Offsite</a></li>
<li><a href="index.html#top">Self</a></li>
<li><a href="/book/ch02.html">Two</a></li>
</ol></nav>"#;
        let found = table_of_contents(&root, html, &TocRule::DEFAULT_ORDER);
        let locators = found
            .iter()
            .map(|c| c.locator.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            locators,
            vec![
                "https://example.com/book/ch01.html",
                "https://example.com/book/ch02.html"
            ]
        );
        assert_eq!(found[0].title, "One");
    }

    #[test]
    fn all_anchors_rule_keeps_only_chapter_like_links() {
        let root = url("https://example.com/book/");
        let html = r#"<a href="ch01.html">One</a>
<a href="style.css">Style</a>
<a href="/other/ch09.html">Elsewhere</a>
<a href="notes">Notes</a>"#;
        let found = table_of_contents(&root, html, &[TocRule::AllAnchors]);
        let locators = found
            .iter()
            .map(|c| c.locator.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            locators,
            vec![
                "https://example.com/book/ch01.html",
                "https://example.com/book/notes"
            ]
        );
    }

    struct StaticSite(std::collections::HashMap<String, String>);

    #[async_trait::async_trait]
    impl Fetcher for StaticSite {
        async fn fetch(
            &self,
            locator: &Url,
            _timeout: Duration,
        ) -> Result<crate::fetch::FetchResponse, FetchError> {
            Ok(match self.0.get(locator.as_str()) {
                Some(body) => crate::fetch::FetchResponse {
                    status: 200,
                    content: body.clone(),
                },
                None => crate::fetch::FetchResponse {
                    status: 404,
                    content: String::new(),
                },
            })
        }
    }

    fn discoverer(pages: &[(&str, &str)], expected: Option<usize>) -> Discoverer {
        let site = StaticSite(
            pages
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
        );
        let events: Arc<dyn EventSink> = Arc::new(crate::logging::MemorySink::new());
        let retry = RetryExecutor::new(
            crate::retry::RetryPolicy::new(1, 2.0).with_unit(Duration::from_millis(1)),
            events.clone(),
        );
        Discoverer::new(
            Arc::new(site),
            retry,
            Arc::new(RequestPacer::new(Duration::ZERO)),
            DiscoveryOptions {
                expected_chapters: expected,
                ..DiscoveryOptions::default()
            },
            events,
        )
    }

    #[tokio::test]
    async fn probing_tops_up_a_short_table_of_contents() {
        let index = r#"<html><head><title>Short Toc</title></head><body>
<nav class="toc"><a href="ch02.html">Two</a><a href="ch01.html">One</a></nav></body></html>"#;
        let discoverer = discoverer(
            &[
                ("https://e.com/b/", index),
                ("https://e.com/b/ch01.html", "one"),
                ("https://e.com/b/ch02.html", "two"),
                ("https://e.com/b/ch03.html", "three"),
            ],
            Some(3),
        );

        let document = discoverer.discover("https://e.com/b/#start").await.unwrap();
        assert_eq!(document.title, "Short Toc");
        assert_eq!(document.locator, "https://e.com/b/");
        let locators = document
            .chapters
            .iter()
            .map(|c| (c.index, c.locator.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            locators,
            vec![
                (0, "https://e.com/b/ch01.html"),
                (1, "https://e.com/b/ch02.html"),
                (2, "https://e.com/b/ch03.html"),
            ]
        );
        assert_eq!(document.chapters[2].title, "Chapter 3");
    }

    #[tokio::test]
    async fn unreachable_root_is_a_discovery_error() {
        let discoverer = discoverer(&[], None);
        let err = discoverer.discover("https://e.com/missing/").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::RootUnavailable { .. }));

        let err = discoverer.discover("not a url").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidLocator { .. }));
    }

    #[tokio::test]
    async fn cancelled_discovery_stops_probing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let discoverer = discoverer(
            &[
                ("https://e.com/b/", "<p>opening pages</p>"),
                ("https://e.com/b/ch01.html", "one"),
                ("https://e.com/b/ch02.html", "two"),
            ],
            None,
        )
        .with_cancellation(cancel);

        let document = discoverer.discover("https://e.com/b/").await.unwrap();
        let locators = document
            .chapters
            .iter()
            .map(|c| c.locator.as_str())
            .collect::<Vec<_>>();
        assert_eq!(locators, vec!["https://e.com/b/"]);
    }

    #[test]
    fn fallback_title_uses_last_segment() {
        assert_eq!(fallback_title(&url("https://e.com/books/rust/")), "rust");
        assert_eq!(fallback_title(&url("https://e.com/")), "e.com");
    }
}
