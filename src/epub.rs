use std::io::{Cursor, Write as _};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use pulldown_cmark::{Options, Parser};
use zip::write::SimpleFileOptions;

use crate::error::RenderError;
use crate::formats::DocumentMeta;
use crate::render::{AssembledChapter, Renderer, chapter_markdown, write_atomic};

/// Packs chapters into `<out_dir>/<doc_id>/book.epub` (EPUB 3 with an NCX fallback).
#[derive(Debug, Clone)]
pub struct EpubRenderer {
    out_dir: PathBuf,
    /// BCP-47 language tag used for EPUB metadata and XHTML documents.
    lang: String,
}

impl EpubRenderer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            lang: "und".to_string(),
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        let lang = lang.into();
        if !lang.trim().is_empty() {
            self.lang = lang.trim().to_string();
        }
        self
    }
}

#[async_trait]
impl Renderer for EpubRenderer {
    async fn render(
        &self,
        document: &DocumentMeta,
        chapters: &[AssembledChapter],
    ) -> Result<PathBuf, RenderError> {
        let out_path = self.out_dir.join(&document.id).join("book.epub");
        let book = BookSpec::new(document, chapters, &self.lang);

        let bytes = tokio::task::spawn_blocking(move || package(&book))
            .await
            .map_err(|err| RenderError::new(&document.id, format!("epub task: {err}")))?
            .map_err(|err| RenderError::new(&document.id, format!("epub zip: {err}")))?;

        write_atomic(&out_path, &bytes)
            .await
            .map_err(|err| RenderError::new(&document.id, format!("{}: {err}", out_path.display())))?;
        Ok(out_path)
    }
}

#[derive(Debug)]
struct BookSpec {
    id: String,
    title: String,
    author: Option<String>,
    lang: String,
    chapters: Vec<ChapterSpec>,
}

#[derive(Debug)]
struct ChapterSpec {
    stem: String,
    title: String,
    md: String,
}

impl BookSpec {
    fn new(document: &DocumentMeta, chapters: &[AssembledChapter], lang: &str) -> Self {
        Self {
            id: document.id.clone(),
            title: document.title.clone(),
            author: document.author.clone(),
            lang: lang.to_string(),
            chapters: chapters
                .iter()
                .map(|chapter| ChapterSpec {
                    stem: format!("ch{:03}", chapter.index),
                    title: chapter.title.clone(),
                    md: chapter_markdown(&chapter.content),
                })
                .collect(),
        }
    }
}

fn package(book: &BookSpec) -> zip::result::ZipResult<Vec<u8>> {
    let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));

    // `mimetype` must be the first entry and stored uncompressed.
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", mimetype_options)?;
    zip.write_all(b"application/epub+zip")?;

    let deflated = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let entries = [
        ("META-INF/container.xml", render_container_xml()),
        ("OEBPS/content.opf", render_content_opf(book, &modified)),
        ("OEBPS/nav.xhtml", render_nav_xhtml(book)),
        ("OEBPS/toc.ncx", render_toc_ncx(book)),
        ("OEBPS/style.css", default_style_css()),
    ];
    for (name, body) in entries {
        zip.start_file(name, deflated)?;
        zip.write_all(body.as_bytes())?;
    }

    for chapter in &book.chapters {
        let html = markdown_to_html_fragment(&chapter.md);
        let html = ensure_xhtml_void_tags(&html);
        let xhtml = wrap_xhtml_document(&chapter.title, &book.lang, &html);
        zip.start_file(format!("OEBPS/{}.xhtml", chapter.stem), deflated)?;
        zip.write_all(xhtml.as_bytes())?;
    }

    Ok(zip.finish()?.into_inner())
}

fn book_identifier(book: &BookSpec) -> String {
    format!("urn:bookharvest:{}", book.id)
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css() -> String {
    r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.6; }
img { max-width: 100%; height: auto; }
pre, code { font-family: ui-monospace, Menlo, Consolas, monospace; }
pre { overflow-x: auto; padding: 0.75em; background: #f6f8fa; border-radius: 6px; }
"#
    .to_string()
}

fn render_nav_xhtml(book: &BookSpec) -> String {
    let lang = xml_escape(&book.lang);
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{lang}\" xml:lang=\"{lang}\">\n"
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(&book.title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(&book.title)));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    out.push_str("    <ol>\n");
    for ch in &book.chapters {
        out.push_str(&format!(
            "      <li><a href=\"{}.xhtml\">{}</a></li>\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.title)
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn render_toc_ncx(book: &BookSpec) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"{}\" />\n",
        xml_escape(&book_identifier(book))
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str("  <docTitle><text>");
    out.push_str(&xml_escape(&book.title));
    out.push_str("</text></docTitle>\n");
    if let Some(author) = &book.author {
        out.push_str("  <docAuthor><text>");
        out.push_str(&xml_escape(author));
        out.push_str("</text></docAuthor>\n");
    }
    out.push_str("  <navMap>\n");
    for (idx, ch) in book.chapters.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str("      <navLabel><text>");
        out.push_str(&xml_escape(&ch.title));
        out.push_str("</text></navLabel>\n");
        out.push_str(&format!(
            "      <content src=\"{}.xhtml\" />\n",
            xml_escape(&ch.stem)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn render_content_opf(book: &BookSpec, modified: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
        xml_escape(&book.lang)
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">{}</dc:identifier>\n",
        xml_escape(&book_identifier(book))
    ));
    out.push_str(&format!("    <dc:title>{}</dc:title>\n", xml_escape(&book.title)));
    if let Some(author) = &book.author {
        out.push_str(&format!("    <dc:creator>{}</dc:creator>\n", xml_escape(author)));
    }
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(&book.lang)
    ));
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(modified)
    ));
    out.push_str("  </metadata>\n");
    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");
    for ch in &book.chapters {
        out.push_str(&format!(
            "    <item id=\"{0}\" href=\"{0}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            xml_escape(&ch.stem)
        ));
    }
    out.push_str("  </manifest>\n");
    out.push_str("  <spine toc=\"ncx\">\n");
    for ch in &book.chapters {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            xml_escape(&ch.stem)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn wrap_xhtml_document(title: &str, lang: &str, body_html: &str) -> String {
    let lang = xml_escape(lang);
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{lang}\" xml:lang=\"{lang}\">\n"
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn markdown_to_html_fragment(md: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);

    let parser = Parser::new_ext(md, options);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

/// Rewrites void tags like `<br>` as `<br />` so chapters stay well-formed XHTML.
fn ensure_xhtml_void_tags(html: &str) -> String {
    const VOID_TAGS: &[&str] = &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ];

    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(rel_lt) = html[cursor..].find('<') {
        let lt = cursor + rel_lt;
        out.push_str(&html[cursor..lt]);

        let Some(gt) = tag_end(bytes, lt + 1) else {
            // Unterminated tag; keep the remainder untouched.
            out.push_str(&html[lt..]);
            return out;
        };
        let raw_tag = &html[lt..=gt];

        if raw_tag
            .as_bytes()
            .get(1)
            .is_some_and(|b| matches!(b, b'!' | b'?' | b'/'))
        {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let name_start = lt + 1;
        let mut name_end = name_start;
        while name_end < gt && bytes[name_end].is_ascii_alphabetic() {
            name_end += 1;
        }
        let tag_name = html[name_start..name_end].to_ascii_lowercase();
        if tag_name.is_empty() || !VOID_TAGS.contains(&tag_name.as_str()) {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let tag_without_gt = &html[lt..gt];
        if tag_without_gt.trim_end().ends_with('/') {
            out.push_str(raw_tag);
        } else {
            out.push_str(tag_without_gt);
            out.push_str(" />");
        }
        cursor = gt + 1;
    }

    out.push_str(&html[cursor..]);
    out
}

/// Offset of the `>` closing a tag, skipping quoted attribute values.
fn tag_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut in_quote: Option<u8> = None;
    for (offset, &b) in bytes.iter().enumerate().skip(from) {
        match in_quote {
            Some(q) if b == q => in_quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => in_quote = Some(b),
            None if b == b'>' => return Some(offset),
            None => {}
        }
    }
    None
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
