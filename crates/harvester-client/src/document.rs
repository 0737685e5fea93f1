//! Site-agnostic field extraction from rendered HTML.

use std::sync::Arc;

use harvester_core::error::AppError;
use harvester_core::models::PageSnapshot;
use harvester_core::traits::FieldExtractor;
use htmd::HtmlToMarkdown;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

const DEFAULT_MAX_MARKDOWN_CHARS: usize = 20_000;

/// Page chrome and inert markup left out of the Markdown body.
const NON_CONTENT_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "iframe", "svg", "nav", "header", "footer",
    "aside", "form",
];

/// Fields pulled from any HTML document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentFields {
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub canonical_url: Option<String>,
    pub headings: Vec<String>,
    pub markdown: String,
    /// Present when the task carried an auxiliary identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<DocumentItem>,
}

/// The element addressed by an auxiliary identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentItem {
    pub id: String,
    pub text: String,
}

/// Generic [`FieldExtractor`] used when no site-specific logic is plugged in.
///
/// A page without a `<title>` is treated as "data absent". With an
/// auxiliary identity the element whose `id` or `data-id` matches it must
/// also exist, and the Markdown body is taken from that element only.
#[derive(Clone)]
pub struct DocumentExtractor {
    markdown: Arc<HtmlToMarkdown>,
    max_markdown_chars: usize,
}

impl DocumentExtractor {
    pub fn new() -> Self {
        let markdown = HtmlToMarkdown::builder()
            .skip_tags(NON_CONTENT_TAGS.to_vec())
            .build();
        Self {
            markdown: Arc::new(markdown),
            max_markdown_chars: DEFAULT_MAX_MARKDOWN_CHARS,
        }
    }

    pub fn with_max_markdown_chars(mut self, max: usize) -> Self {
        self.max_markdown_chars = max;
        self
    }

    pub fn fields(
        &self,
        page: &PageSnapshot,
        auxiliary: Option<&str>,
    ) -> Result<DocumentFields, AppError> {
        let document = Html::parse_document(&page.content);

        let title = first_text(&document, "title")
            .or_else(|| meta_content(&document, r#"meta[property="og:title"]"#))
            .ok_or_else(|| {
                AppError::ExtractionError(format!("no title found on {}", page.final_url))
            })?;

        let description = meta_content(&document, r#"meta[name="description"]"#)
            .or_else(|| meta_content(&document, r#"meta[property="og:description"]"#));

        let canonical_url = Selector::parse(r#"link[rel="canonical"]"#)
            .ok()
            .and_then(|sel| {
                document
                    .select(&sel)
                    .next()
                    .and_then(|el| el.value().attr("href"))
                    .map(|href| href.trim().to_string())
            })
            .filter(|href| !href.is_empty());

        let headings = match Selector::parse("h1, h2, h3") {
            Ok(sel) => document
                .select(&sel)
                .map(element_text)
                .filter(|t| !t.is_empty())
                .collect(),
            Err(_) => Vec::new(),
        };

        let (item, body_html) = match auxiliary {
            Some(id) => {
                let element = find_item(&document, id).ok_or_else(|| {
                    AppError::ExtractionError(format!(
                        "item '{id}' not found on {}",
                        page.final_url
                    ))
                })?;
                let item = DocumentItem {
                    id: id.to_string(),
                    text: element_text(element),
                };
                (Some(item), element.html())
            }
            None => (None, page.content.clone()),
        };

        let markdown = self
            .markdown
            .convert(&body_html)
            .map_err(|e| AppError::ExtractionError(format!("Markdown conversion failed: {e}")))?;
        let markdown = truncate(markdown.trim().to_string(), self.max_markdown_chars);

        Ok(DocumentFields {
            url: page.final_url.clone(),
            title,
            description,
            canonical_url,
            headings,
            markdown,
            item,
        })
    }
}

impl Default for DocumentExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldExtractor for DocumentExtractor {
    fn extract(
        &self,
        page: &PageSnapshot,
        auxiliary: Option<&str>,
    ) -> Result<serde_json::Value, AppError> {
        let fields = self.fields(page, auxiliary)?;
        serde_json::to_value(fields)
            .map_err(|e| AppError::ExtractionError(format!("Failed to serialize fields: {e}")))
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    let raw: Vec<&str> = element.text().collect();
    raw.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    document
        .select(&sel)
        .map(element_text)
        .find(|t| !t.is_empty())
}

fn meta_content(document: &Html, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    document
        .select(&sel)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(str::to_string)
}

fn find_item<'a>(document: &'a Html, id: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse("[id], [data-id]").ok()?;
    document.select(&sel).find(|el| {
        let value = el.value();
        value.attr("id") == Some(id) || value.attr("data-id") == Some(id)
    })
}

fn truncate(mut text: String, max_chars: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(idx);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_core::error::ErrorKind;

    const PAGE: &str = r#"<html><head>
        <title> Blue Kettle | Shop </title>
        <meta name="description" content="A kettle that is blue.">
        <link rel="canonical" href="https://shop.example.com/p/kettle">
        </head><body>
        <nav>Home / Kitchen</nav>
        <h1>Blue Kettle</h1>
        <h2>Specs</h2>
        <ul>
          <li id="sku-1"><h3>1.5 litre</h3> in stock</li>
          <li data-id="sku-2"><h3>2 litre</h3> sold out</li>
        </ul>
        <script>track()</script>
        </body></html>"#;

    fn page(content: &str) -> PageSnapshot {
        PageSnapshot::new("https://shop.example.com/p/kettle?ref=x", Some(200), content)
    }

    #[test]
    fn test_extracts_document_fields() {
        let fields = DocumentExtractor::new().fields(&page(PAGE), None).unwrap();
        assert_eq!(fields.title, "Blue Kettle | Shop");
        assert_eq!(fields.description.as_deref(), Some("A kettle that is blue."));
        assert_eq!(
            fields.canonical_url.as_deref(),
            Some("https://shop.example.com/p/kettle")
        );
        assert_eq!(
            fields.headings,
            vec!["Blue Kettle", "Specs", "1.5 litre", "2 litre"]
        );
        assert!(fields.markdown.contains("Blue Kettle"));
        assert!(!fields.markdown.contains("track()"));
        assert!(!fields.markdown.contains("Home / Kitchen"));
        assert!(fields.item.is_none());
    }

    #[test]
    fn test_missing_title_is_extraction_error() {
        let err = DocumentExtractor::new()
            .extract(&page("<html><body><p>hi</p></body></html>"), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extraction);
    }

    #[test]
    fn test_auxiliary_identity_selects_item() {
        let extractor = DocumentExtractor::new();
        let value = extractor.extract(&page(PAGE), Some("sku-2")).unwrap();
        assert_eq!(value["item"]["id"], "sku-2");
        assert_eq!(value["item"]["text"], "2 litre sold out");
        assert!(!value["markdown"].as_str().unwrap().contains("1.5 litre"));

        let err = extractor.extract(&page(PAGE), Some("sku-9")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extraction);
    }

    #[test]
    fn test_markdown_skips_scripts_and_forms() {
        let html = "<title>t</title><p>Content</p><script>alert('x')</script>\
                    <form><input value=login><button>Sign in</button></form>";
        let fields = DocumentExtractor::new().fields(&page(html), None).unwrap();
        assert!(fields.markdown.contains("Content"));
        assert!(!fields.markdown.contains("alert"));
        assert!(!fields.markdown.contains("login"));
        assert!(!fields.markdown.contains("Sign in"));
    }

    #[test]
    fn test_markdown_is_truncated_on_char_boundary() {
        let html = format!("<title>t</title><p>{}</p>", "é".repeat(50));
        let fields = DocumentExtractor::new()
            .with_max_markdown_chars(10)
            .fields(&page(&html), None)
            .unwrap();
        assert_eq!(fields.markdown.chars().count(), 10);
    }
}
