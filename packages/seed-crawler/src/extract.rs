//! CSS-selector extraction over fetched pages.
//!
//! All functions here are synchronous: `scraper::Html` is not `Send`, so
//! documents are parsed, read, and dropped without crossing an await
//! point.

use std::collections::{HashMap, HashSet};

use scraper::{Html, Selector};
use serde_json::{Map, Value};

use crate::config::{FieldSelector, ListSelectors};
use crate::error::CrawlError;
use crate::urlnorm::resolve_href;

/// A detail URL discovered on a list page, with any row-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredUrl {
    pub url: String,
    pub metadata: Value,
}

fn parse_selector(selector: &str) -> Result<Selector, CrawlError> {
    Selector::parse(selector)
        .map_err(|e| CrawlError::InvalidConfig(format!("invalid selector '{selector}': {e:?}")))
}

fn element_text(element: scraper::ElementRef) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn field_value(row: scraper::ElementRef, field: &FieldSelector) -> Result<Option<String>, CrawlError> {
    let selector = parse_selector(&field.selector)?;
    let Some(element) = row.select(&selector).next() else {
        return Ok(None);
    };
    let value = match &field.attr {
        Some(attr) => element.value().attr(attr).unwrap_or_default().to_string(),
        None => element_text(element),
    };
    Ok(Some(value))
}

/// Extract detail URLs from a list page.
///
/// Flat mode selects anchors directly; container mode selects rows and then
/// the link plus metadata fields within each row. Relative hrefs resolve
/// against `final_url` (the post-redirect page URL). Intra-page duplicates
/// are dropped, first occurrence wins.
pub fn extract_detail_urls(
    html: &str,
    final_url: &str,
    selectors: &ListSelectors,
) -> Result<Vec<DiscoveredUrl>, CrawlError> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    if let (Some(container), Some(link_within)) =
        (selectors.container.as_deref(), selectors.link_within.as_deref())
    {
        let container_sel = parse_selector(container)?;
        let link_sel = parse_selector(link_within)?;
        for row in doc.select(&container_sel) {
            let Some(anchor) = row.select(&link_sel).next() else {
                continue;
            };
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(url) = resolve_href(final_url, href) else {
                continue;
            };
            if !seen.insert(url.clone()) {
                continue;
            }
            let mut metadata = Map::new();
            for (name, field) in &selectors.fields {
                if let Some(value) = field_value(row, field)? {
                    metadata.insert(name.clone(), Value::String(value));
                }
            }
            out.push(DiscoveredUrl {
                url,
                metadata: if metadata.is_empty() {
                    Value::Null
                } else {
                    Value::Object(metadata)
                },
            });
        }
        return Ok(out);
    }

    if let Some(link) = selectors.link.as_deref() {
        let link_sel = parse_selector(link)?;
        for anchor in doc.select(&link_sel) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(url) = resolve_href(final_url, href) else {
                continue;
            };
            if seen.insert(url.clone()) {
                out.push(DiscoveredUrl {
                    url,
                    metadata: Value::Null,
                });
            }
        }
    }

    Ok(out)
}

/// Extract the configured fields from a detail page into a JSON object.
pub fn extract_fields(
    html: &str,
    fields: &HashMap<String, FieldSelector>,
) -> Result<Value, CrawlError> {
    let doc = Html::parse_document(html);
    let mut out = Map::new();
    for (name, field) in fields {
        let selector = parse_selector(&field.selector)?;
        if let Some(element) = doc.select(&selector).next() {
            let value = match &field.attr {
                Some(attr) => element.value().attr(attr).unwrap_or_default().to_string(),
                None => element_text(element),
            };
            out.insert(name.clone(), Value::String(value));
        }
    }
    Ok(Value::Object(out))
}

/// `<title>`, falling back to the first `<h1>`.
pub fn page_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    for selector in ["title", "h1"] {
        let sel = Selector::parse(selector).ok()?;
        if let Some(element) = doc.select(&sel).next() {
            let text = element_text(element);
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// First matching href, resolved against the page URL. Used by the
/// next-button pagination strategy.
pub fn first_href(html: &str, selector: &str, final_url: &str) -> Result<Option<String>, CrawlError> {
    let doc = Html::parse_document(html);
    let sel = parse_selector(selector)?;
    Ok(doc
        .select(&sel)
        .find_map(|el| el.value().attr("href"))
        .and_then(|href| resolve_href(final_url, href)))
}

/// Every anchor href on the page, resolved against the page URL. Used by
/// heuristic pagination detection.
pub fn all_hrefs(html: &str, final_url: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Ok(sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    doc.select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| resolve_href(final_url, href))
        .collect()
}

/// Whether any element matches the selector.
pub fn selector_matches(html: &str, selector: &str) -> Result<bool, CrawlError> {
    let doc = Html::parse_document(html);
    let sel = parse_selector(selector)?;
    Ok(doc.select(&sel).next().is_some())
}

/// Visible text with `<script>`/`<style>` and configured boilerplate
/// subtrees removed, whitespace collapsed. Input to content hashing.
pub fn visible_text(html: &str, boilerplate_selectors: &[String]) -> String {
    let doc = Html::parse_document(html);

    let mut excluded = HashSet::new();
    let mut selectors = vec!["script".to_string(), "style".to_string(), "noscript".to_string()];
    selectors.extend(boilerplate_selectors.iter().cloned());
    for raw in &selectors {
        if let Ok(sel) = Selector::parse(raw) {
            for element in doc.select(&sel) {
                excluded.insert(element.id());
            }
        }
    }

    let mut out = String::new();
    for node in doc.tree.nodes() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        if node.ancestors().any(|a| excluded.contains(&a.id())) {
            continue;
        }
        out.push_str(text);
        out.push(' ');
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListSelectors;

    const LIST_PAGE: &str = r#"
        <html><body>
          <ul>
            <li class="result"><a class="result-link" href="/item/1">One</a><span class="price">10</span></li>
            <li class="result"><a class="result-link" href="/item/2">Two</a><span class="price">20</span></li>
            <li class="result"><a class="result-link" href="/item/1">One again</a><span class="price">10</span></li>
          </ul>
          <a class="next-page" href="/list?page=2">Next</a>
        </body></html>
    "#;

    fn flat_selectors() -> ListSelectors {
        ListSelectors {
            link: Some("a.result-link".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn flat_mode_extracts_and_resolves_anchors() {
        let urls =
            extract_detail_urls(LIST_PAGE, "https://example.test/list", &flat_selectors()).unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].url, "https://example.test/item/1");
        assert_eq!(urls[1].url, "https://example.test/item/2");
    }

    #[test]
    fn intra_page_duplicates_are_dropped_first_wins() {
        let urls =
            extract_detail_urls(LIST_PAGE, "https://example.test/list", &flat_selectors()).unwrap();
        let distinct: HashSet<_> = urls.iter().map(|u| u.url.as_str()).collect();
        assert_eq!(distinct.len(), urls.len());
    }

    #[test]
    fn container_mode_collects_row_metadata() {
        let selectors = ListSelectors {
            container: Some("li.result".to_string()),
            link_within: Some("a".to_string()),
            fields: HashMap::from([("price".to_string(), FieldSelector::text("span.price"))]),
            ..Default::default()
        };
        let urls =
            extract_detail_urls(LIST_PAGE, "https://example.test/list", &selectors).unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].metadata["price"], "10");
        assert_eq!(urls[1].metadata["price"], "20");
    }

    #[test]
    fn fields_extract_text_and_attributes() {
        let html = r#"<html><body>
            <h1>  The   Title </h1>
            <div class="content">Body text</div>
            <time datetime="2026-01-05">Jan 5</time>
        </body></html>"#;
        let fields = HashMap::from([
            ("title".to_string(), FieldSelector::text("h1")),
            ("body".to_string(), FieldSelector::text("div.content")),
            (
                "published".to_string(),
                FieldSelector {
                    selector: "time".to_string(),
                    attr: Some("datetime".to_string()),
                },
            ),
        ]);
        let out = extract_fields(html, &fields).unwrap();
        assert_eq!(out["title"], "The Title");
        assert_eq!(out["body"], "Body text");
        assert_eq!(out["published"], "2026-01-05");
    }

    #[test]
    fn missing_fields_are_omitted() {
        let fields = HashMap::from([("missing".to_string(), FieldSelector::text("div.nope"))]);
        let out = extract_fields("<html><body></body></html>", &fields).unwrap();
        assert!(out.as_object().unwrap().is_empty());
    }

    #[test]
    fn title_falls_back_to_h1() {
        assert_eq!(
            page_title("<html><head><title>Doc</title></head></html>").as_deref(),
            Some("Doc")
        );
        assert_eq!(
            page_title("<html><body><h1>Heading</h1></body></html>").as_deref(),
            Some("Heading")
        );
        assert_eq!(page_title("<html><body></body></html>"), None);
    }

    #[test]
    fn next_button_href_resolves() {
        let next = first_href(LIST_PAGE, "a.next-page", "https://example.test/list").unwrap();
        assert_eq!(next.as_deref(), Some("https://example.test/list?page=2"));
    }

    #[test]
    fn visible_text_skips_scripts_and_boilerplate() {
        let html = r#"<html><body>
            <nav class="menu">Home About</nav>
            <script>var x = "hidden";</script>
            <style>.a { color: red }</style>
            <p>Real   content here</p>
        </body></html>"#;
        let text = visible_text(html, &["nav.menu".to_string()]);
        assert_eq!(text, "Real content here");
    }
}
