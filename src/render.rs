use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::RenderError;
use crate::formats::DocumentMeta;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledChapter {
    pub index: usize,
    pub title: String,
    pub content: String,
}

/// Turns validated chapter content into the final artifact.
///
/// Rendering is terminal and never retried; a failure fails the document.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        document: &DocumentMeta,
        chapters: &[AssembledChapter],
    ) -> Result<PathBuf, RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    #[value(alias = "md")]
    Markdown,
    Epub,
}

pub fn renderer_for(format: OutputFormat, out_dir: impl Into<PathBuf>) -> Box<dyn Renderer> {
    match format {
        OutputFormat::Markdown => Box::new(MarkdownRenderer::new(out_dir)),
        OutputFormat::Epub => Box::new(crate::epub::EpubRenderer::new(out_dir)),
    }
}

/// Bundles every chapter into `<out_dir>/<doc_id>/book.md`.
#[derive(Debug, Clone)]
pub struct MarkdownRenderer {
    out_dir: PathBuf,
}

impl MarkdownRenderer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

#[async_trait]
impl Renderer for MarkdownRenderer {
    async fn render(
        &self,
        document: &DocumentMeta,
        chapters: &[AssembledChapter],
    ) -> Result<PathBuf, RenderError> {
        let out_path = self.out_dir.join(&document.id).join("book.md");
        let bundled = bundle_markdown(document, chapters);
        write_atomic(&out_path, bundled.as_bytes())
            .await
            .map_err(|err| RenderError::new(&document.id, format!("{}: {err}", out_path.display())))?;
        Ok(out_path)
    }
}

pub fn bundle_markdown(document: &DocumentMeta, chapters: &[AssembledChapter]) -> String {
    let mut bundled = format!("# {}\n\n", document.title);
    if let Some(author) = &document.author {
        bundled.push_str(&format!("_{author}_\n\n"));
    }
    bundled.push_str(&format!("Source: <{}>\n", document.locator));

    for chapter in chapters {
        let body = chapter_markdown(&chapter.content);
        bundled.push('\n');
        if !body.trim_start().starts_with('#') {
            bundled.push_str(&format!("## {}\n\n", chapter.title));
        }
        bundled.push_str(body.trim());
        bundled.push('\n');
    }

    bundled
}

/// Chapter content as Markdown; HTML is converted, anything else is kept.
pub fn chapter_markdown(content: &str) -> String {
    if looks_like_html(content) {
        html2md::parse_html(&body_fragment(content))
    } else {
        content.to_string()
    }
}

fn looks_like_html(content: &str) -> bool {
    let lower = content.trim_start().to_ascii_lowercase();
    lower.starts_with('<') || lower.contains("<p>") || lower.contains("<p ")
}

/// Inner `<body>` markup when present, so head metadata never leaks into text.
fn body_fragment(content: &str) -> String {
    let lower = content.to_ascii_lowercase();
    let Some(open) = lower.find("<body") else {
        return content.to_string();
    };
    let Some(start) = lower[open..].find('>').map(|offset| open + offset + 1) else {
        return content.to_string();
    };
    let end = lower.rfind("</body").filter(|end| *end >= start).unwrap_or(content.len());
    content[start..end].to_string()
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp_path, bytes).await?;
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> DocumentMeta {
        DocumentMeta {
            id: "d_test".to_string(),
            title: "Field Guide".to_string(),
            author: Some("Ferris".to_string()),
            locator: "https://example.com/book/".to_string(),
        }
    }

    #[test]
    fn bundle_keeps_chapter_order_and_adds_missing_headings() {
        let chapters = vec![
            AssembledChapter {
                index: 0,
                title: "Preface".into(),
                content: "<html><head><title>ignored</title></head><body><p>Hello there.</p></body></html>".into(),
            },
            AssembledChapter {
                index: 1,
                title: "One".into(),
                content: "<h1>Chapter One</h1><p>Body text.</p>".into(),
            },
        ];
        let md = bundle_markdown(&meta(), &chapters);

        assert!(md.starts_with("# Field Guide\n\n_Ferris_\n"));
        let preface = md.find("## Preface").expect("preface heading");
        let one = md.find("Chapter One").expect("chapter one heading");
        assert!(preface < one);
        assert!(md.contains("Hello there."));
        assert!(!md.contains("ignored"));
    }

    #[test]
    fn plain_text_is_kept_verbatim() {
        assert_eq!(chapter_markdown("just words"), "just words");
    }

    #[tokio::test]
    async fn markdown_renderer_writes_under_document_id() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let renderer = MarkdownRenderer::new(temp.path());
        let path = renderer
            .render(
                &meta(),
                &[AssembledChapter {
                    index: 0,
                    title: "Only".into(),
                    content: "text".into(),
                }],
            )
            .await?;
        assert_eq!(path, temp.path().join("d_test").join("book.md"));
        assert!(std::fs::read_to_string(&path)?.contains("## Only"));
        Ok(())
    }
}
