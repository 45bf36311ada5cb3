//! Field and link extraction over heterogeneous chapter markup.
//!
//! Each semantic field maps to an ordered list of rules; the first rule that
//! yields non-empty text wins. Rules are pure functions over a markup string.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid meta regex"));
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid attribute regex")
});
static ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a\s*>").expect("valid anchor regex"));
static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<([a-z][a-z0-9]*)\b([^>]*)>").expect("valid open tag regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Title,
    Author,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionRule {
    /// `<meta property="..." content="...">`
    MetaProperty(String),
    /// `<meta name="..." content="...">`
    MetaName(String),
    /// Text of the first element with this tag name.
    ElementText(String),
    /// Text of the first element whose class list mentions this fragment.
    ClassText(String),
}

impl ExtractionRule {
    pub fn apply(&self, markup: &str) -> Option<String> {
        let raw = match self {
            Self::MetaProperty(property) => meta_content(markup, "property", property),
            Self::MetaName(name) => meta_content(markup, "name", name),
            Self::ElementText(tag) => first_element_inner(markup, |name, _| {
                name.eq_ignore_ascii_case(tag)
            }),
            Self::ClassText(fragment) => first_element_inner(markup, |_, attrs| {
                attribute(attrs, "class").is_some_and(|class| {
                    class
                        .to_ascii_lowercase()
                        .contains(&fragment.to_ascii_lowercase())
                })
            }),
        }?;
        let text = clean_text(&raw);
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Clone)]
pub struct FieldExtractor {
    rules: BTreeMap<Field, Vec<ExtractionRule>>,
}

impl Default for FieldExtractor {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(
            Field::Title,
            vec![
                ExtractionRule::MetaProperty("og:title".to_string()),
                ExtractionRule::MetaName("dc.title".to_string()),
                ExtractionRule::ElementText("title".to_string()),
                ExtractionRule::ElementText("h1".to_string()),
            ],
        );
        rules.insert(
            Field::Author,
            vec![
                ExtractionRule::MetaName("author".to_string()),
                ExtractionRule::MetaName("dc.creator".to_string()),
                ExtractionRule::MetaProperty("book:author".to_string()),
                ExtractionRule::ClassText("author".to_string()),
            ],
        );
        Self { rules }
    }
}

impl FieldExtractor {
    pub fn with_rules(field: Field, rules: Vec<ExtractionRule>) -> Self {
        let mut extractor = Self::default();
        extractor.rules.insert(field, rules);
        extractor
    }

    pub fn rules(&self, field: Field) -> &[ExtractionRule] {
        self.rules.get(&field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn extract(&self, field: Field, markup: &str) -> Option<String> {
        self.rules(field).iter().find_map(|rule| rule.apply(markup))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLink {
    pub href: String,
    pub text: String,
}

/// Where a table of contents may live in a root page, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocRule {
    /// `<nav>` landmark, preferring one marked as a table of contents.
    NavLandmark,
    /// Any element whose id or class mentions "toc" or "contents".
    TocContainer,
    /// Every anchor on the page; callers narrow these to chapter-like links.
    AllAnchors,
}

impl TocRule {
    pub const DEFAULT_ORDER: [TocRule; 3] = [Self::NavLandmark, Self::TocContainer, Self::AllAnchors];

    pub fn name(self) -> &'static str {
        match self {
            Self::NavLandmark => "nav-landmark",
            Self::TocContainer => "toc-container",
            Self::AllAnchors => "all-anchors",
        }
    }

    pub fn apply(self, markup: &str) -> Vec<RawLink> {
        match self {
            Self::NavLandmark => {
                let navs = element_blocks(markup, |name, _| name.eq_ignore_ascii_case("nav"));
                let toc_nav = navs.iter().find(|(attrs, _)| {
                    let attrs = attrs.to_ascii_lowercase();
                    attrs.contains("toc")
                });
                match toc_nav.or(navs.first()) {
                    Some((_, block)) => anchors(block),
                    None => Vec::new(),
                }
            }
            Self::TocContainer => element_blocks(markup, |_, attrs| {
                ["id", "class"].iter().any(|key| {
                    attribute(attrs, key).is_some_and(|value| {
                        let value = value.to_ascii_lowercase();
                        value.contains("toc") || value.contains("contents")
                    })
                })
            })
            .first()
            .map(|(_, block)| anchors(block))
            .unwrap_or_default(),
            Self::AllAnchors => anchors(markup),
        }
    }
}

pub fn anchors(markup: &str) -> Vec<RawLink> {
    ANCHOR
        .captures_iter(markup)
        .filter_map(|caps| {
            let attrs = caps.get(1)?.as_str();
            let href = attribute(attrs, "href")?;
            let href = decode_entities(href.trim());
            if href.is_empty() {
                return None;
            }
            let text = clean_text(caps.get(2).map(|m| m.as_str()).unwrap_or_default());
            Some(RawLink { href, text })
        })
        .collect()
}

pub fn clean_text(markup: &str) -> String {
    let text = TAG.replace_all(markup, " ");
    let text = decode_entities(&text);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn decode_entities(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn attribute<'a>(attrs: &'a str, key: &str) -> Option<&'a str> {
    ATTRIBUTE.captures_iter(attrs).find_map(|caps| {
        let name = caps.get(1)?.as_str();
        if !name.eq_ignore_ascii_case(key) {
            return None;
        }
        caps.get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str())
    })
}

fn meta_content(markup: &str, key: &str, expected: &str) -> Option<String> {
    META_TAG.find_iter(markup).find_map(|tag| {
        let attrs = tag.as_str();
        let value = attribute(attrs, key)?;
        if !value.trim().eq_ignore_ascii_case(expected) {
            return None;
        }
        attribute(attrs, "content").map(ToString::to_string)
    })
}

fn first_element_inner<F>(markup: &str, matches: F) -> Option<String>
where
    F: Fn(&str, &str) -> bool,
{
    element_blocks(markup, matches)
        .into_iter()
        .next()
        .map(|(_, inner)| inner.to_string())
}

/// Inner markup of every element accepted by `matches`, with its attribute
/// string. Nested elements of the same name are balanced by depth counting.
fn element_blocks<F>(markup: &str, matches: F) -> Vec<(&str, &str)>
where
    F: Fn(&str, &str) -> bool,
{
    let mut blocks = Vec::new();
    let mut cursor = 0;
    while let Some(caps) = OPEN_TAG.captures_at(markup, cursor) {
        let (Some(whole), Some(name), Some(attrs)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            break;
        };
        cursor = whole.end();
        if !matches(name.as_str(), attrs.as_str()) {
            continue;
        }
        let Some(inner_end) = closing_tag_offset(markup, whole.end(), name.as_str()) else {
            continue;
        };
        blocks.push((attrs.as_str(), &markup[whole.end()..inner_end]));
        cursor = inner_end;
    }
    blocks
}

fn closing_tag_offset(markup: &str, from: usize, name: &str) -> Option<usize> {
    let pattern = format!(r"(?is)<(/?){}\b[^>]*>", regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    let mut depth = 1_usize;
    for caps in re.captures_iter(&markup[from..]) {
        let whole = caps.get(0)?;
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        if closing {
            depth -= 1;
            if depth == 0 {
                return Some(from + whole.start());
            }
        } else if !whole.as_str().ends_with("/>") {
            depth += 1;
        }
    }
    None
}
