//! Classifies fetched chapter content as usable or not.
//!
//! Pure and deterministic: no I/O, no state. Rules fire in a fixed precedence
//! and the first fatal rule ends evaluation. Quality metadata is always
//! computed so callers can log it even for rejected content.

use std::sync::LazyLock;

use regex::Regex;

pub const MIN_WORDS: usize = 50;
pub const SOFT_MIN_WORDS: usize = 100;

const ERROR_PAGE_WINDOW: usize = 1000;

const ERROR_PAGE_SIGNATURES: &[&str] = &[
    "404 not found",
    "page not found",
    "403 forbidden",
    "access denied",
    "too many requests",
    "rate limit exceeded",
    "you have been rate limited",
    "service unavailable",
];

const CHALLENGE_SIGNATURES: &[&str] = &[
    "captcha",
    "are you a robot",
    "verify you are human",
    "verify that you are human",
    "checking your browser",
    "unusual traffic",
    "enable javascript and cookies to continue",
    "press and hold",
    "cf-challenge",
    "attention required! | cloudflare",
];

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b.*?</(script|style)\s*>").expect("valid script regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static PARAGRAPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<p[\s>]").expect("valid paragraph regex"));
static IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<img[\s>/]|!\[[^\]]*\]\(").expect("valid image regex"));
static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)<pre[\s>]|^```").expect("valid code regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    Empty,
    ErrorPage { signature: &'static str },
    AntiAutomation { signature: &'static str },
    TooShort { words: usize, minimum: usize },
    Short { words: usize, recommended: usize },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("content is empty"),
            Self::ErrorPage { signature } => write!(f, "error page detected ({signature:?})"),
            Self::AntiAutomation { signature } => {
                write!(f, "anti-automation challenge detected ({signature:?})")
            }
            Self::TooShort { words, minimum } => {
                write!(f, "content too short: {words} words (minimum {minimum})")
            }
            Self::Short { words, recommended } => {
                write!(f, "content is short: {words} words (recommended {recommended})")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentMetadata {
    pub word_count: usize,
    pub paragraph_count: usize,
    pub image_count: usize,
    pub code_block_count: usize,
    pub has_images: bool,
    pub has_code_blocks: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub metadata: ContentMetadata,
}

impl ValidationReport {
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }
}

pub fn validate(content: &str, title: &str) -> ValidationReport {
    let metadata = measure(content);
    let mut report = ValidationReport {
        is_valid: true,
        errors: Vec::new(),
        warnings: Vec::new(),
        metadata,
    };

    if let Some(issue) = fatal_issue(content, report.metadata.word_count) {
        tracing::debug!(title, %issue, "content rejected");
        report.is_valid = false;
        report.errors.push(issue);
        return report;
    }

    let words = report.metadata.word_count;
    if words < SOFT_MIN_WORDS {
        report.warnings.push(ValidationIssue::Short {
            words,
            recommended: SOFT_MIN_WORDS,
        });
    }
    report
}

fn fatal_issue(content: &str, word_count: usize) -> Option<ValidationIssue> {
    if content.trim().is_empty() {
        return Some(ValidationIssue::Empty);
    }

    let head = lowercase_prefix(content, ERROR_PAGE_WINDOW);
    if let Some(signature) = ERROR_PAGE_SIGNATURES
        .iter()
        .copied()
        .find(|signature| head.contains(signature))
    {
        return Some(ValidationIssue::ErrorPage { signature });
    }

    let lower = content.to_lowercase();
    if let Some(signature) = CHALLENGE_SIGNATURES
        .iter()
        .copied()
        .find(|signature| lower.contains(signature))
    {
        return Some(ValidationIssue::AntiAutomation { signature });
    }

    if word_count < MIN_WORDS {
        return Some(ValidationIssue::TooShort {
            words: word_count,
            minimum: MIN_WORDS,
        });
    }

    None
}

fn lowercase_prefix(content: &str, max_chars: usize) -> String {
    content.chars().take(max_chars).collect::<String>().to_lowercase()
}

pub fn measure(content: &str) -> ContentMetadata {
    let text = strip_markup(content);
    let word_count = count_words(&text);
    let paragraph_count = match PARAGRAPH.find_iter(content).count() {
        0 => text
            .split("\n\n")
            .filter(|block| !block.trim().is_empty())
            .count(),
        n => n,
    };
    let image_count = IMAGE.find_iter(content).count();
    let code_block_count = CODE_BLOCK.find_iter(content).count();

    ContentMetadata {
        word_count,
        paragraph_count,
        image_count,
        code_block_count,
        has_images: image_count > 0,
        has_code_blocks: code_block_count > 0,
    }
}

pub fn strip_markup(content: &str) -> String {
    let without_scripts = SCRIPT_OR_STYLE.replace_all(content, " ");
    TAG.replace_all(&without_scripts, " ").into_owned()
}

/// Whitespace tokens longer than one character.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace()
        .filter(|token| token.chars().count() > 1)
        .count()
}
