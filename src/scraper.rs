use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Node, Selector};

use crate::models::SourceDocument;

pub const BULLETIN_URL: &str = "https://bulletin.miamioh.edu/farmer-business/";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

lazy_static! {
    static ref PROGRAM_LINKS: Selector =
        Selector::parse("#degreesandprogramstextcontainer > ul > li > a").unwrap();
    static ref TITLE: Selector = Selector::parse("title").unwrap();
    static ref BODY: Selector = Selector::parse("body").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Elements whose text never reaches the reader.
const HIDDEN_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Elements that start a new line. Everything else flows inline.
const BLOCK_ELEMENTS: [&str; 36] = [
    "address", "article", "aside", "blockquote", "br", "caption", "dd", "details", "div", "dl",
    "dt", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header",
    "hr", "li", "main", "nav", "ol", "p", "pre", "section", "summary", "table", "td", "th", "tr",
    "ul",
];

#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub documents: Vec<SourceDocument>,
    pub failures: Vec<(String, String)>,
}

pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")
}

/// One URL per line; blank lines and `#` comments are ignored.
pub fn parse_url_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn load_curated_urls(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read URL list {}", path.display()))?;
    Ok(parse_url_list(&text))
}

/// Curated URLs first, then every program page linked from the bulletin.
pub async fn collect_urls(client: &reqwest::Client, curated_path: &Path) -> Result<Vec<String>> {
    let mut urls = load_curated_urls(curated_path)?;
    tracing::info!("Loaded {} curated URLs", urls.len());

    let programs = fetch_bulletin_program_urls(client, BULLETIN_URL).await?;
    tracing::info!("Found {} program pages on the bulletin", programs.len());

    urls.extend(programs);
    Ok(urls)
}

pub async fn fetch_bulletin_program_urls(client: &reqwest::Client, bulletin_url: &str) -> Result<Vec<String>> {
    let response = client
        .get(bulletin_url)
        .send()
        .await
        .context("Failed to fetch bulletin page")?;

    if !response.status().is_success() {
        anyhow::bail!("HTTP error {}: Failed to fetch bulletin page", response.status());
    }

    let html = response.text().await?;
    extract_program_links(&html, bulletin_url)
}

pub fn extract_program_links(html: &str, base: &str) -> Result<Vec<String>> {
    let base = Url::parse(base).with_context(|| format!("Invalid base URL {}", base))?;
    let document = Html::parse_document(html);

    let links = document
        .select(&PROGRAM_LINKS)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| match base.join(href) {
            Ok(url) => Some(url.to_string()),
            Err(e) => {
                tracing::debug!("Skipping unparsable link {:?}: {}", href, e);
                None
            }
        })
        .collect();

    Ok(links)
}

/// Fetches every URL in order. Pages that fail are logged and reported, never fatal.
pub async fn scrape_pages(client: &reqwest::Client, urls: &[String]) -> ScrapeReport {
    let mut report = ScrapeReport::default();

    for (i, url) in urls.iter().enumerate() {
        tracing::debug!("[{}/{}] Fetching {}", i + 1, urls.len(), url);
        match fetch_page(client, url).await {
            Ok(doc) => report.documents.push(doc),
            Err(e) => {
                tracing::warn!("Skipping {}: {:#}", url, e);
                report.failures.push((url.clone(), format!("{:#}", e)));
            }
        }
    }

    tracing::info!(
        "Scraped {} of {} pages ({} failed)",
        report.documents.len(),
        urls.len(),
        report.failures.len()
    );
    report
}

pub async fn fetch_page(client: &reqwest::Client, url: &str) -> Result<SourceDocument> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("HTTP error {}", response.status());
    }

    let source = response.url().to_string();
    let html = response.text().await?;
    Ok(extract_page(&html, &source))
}

/// Pulls the title and the visible body text out of a page.
pub fn extract_page(html: &str, source: &str) -> SourceDocument {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE)
        .next()
        .map(|t| normalize_line(&t.text().collect::<String>()))
        .unwrap_or_default();

    let mut lines: Vec<String> = Vec::new();
    if let Some(body) = document.select(&BODY).next() {
        let mut pending = String::new();
        collect_lines(body, &mut pending, &mut lines);
        flush_line(&mut pending, &mut lines);
    }

    SourceDocument::new(source.to_string(), title, lines.join("\n"))
}

/// Text of inline siblings accumulates in `pending` until a block boundary.
fn collect_lines(element: ElementRef, pending: &mut String, lines: &mut Vec<String>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => pending.push_str(text),
            Node::Element(e) => {
                let name = e.name();
                if HIDDEN_ELEMENTS.contains(&name) {
                    continue;
                }
                let block = BLOCK_ELEMENTS.contains(&name);
                if block {
                    flush_line(pending, lines);
                }
                if let Some(child) = ElementRef::wrap(child) {
                    collect_lines(child, pending, lines);
                }
                if block {
                    flush_line(pending, lines);
                }
            }
            _ => {}
        }
    }
}

fn flush_line(pending: &mut String, lines: &mut Vec<String>) {
    let line = normalize_line(pending);
    if !line.is_empty() {
        lines.push(line);
    }
    pending.clear();
}

fn normalize_line(line: &str) -> String {
    WHITESPACE.replace_all(line, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    const BULLETIN_HTML: &str = r#"
        <html><body>
          <div id="degreesandprogramstextcontainer">
            <ul>
              <li><a href="/farmer-business/finance-bsb/">Finance</a></li>
              <li><a href="accountancy-bsb/">Accountancy</a></li>
              <li><a href="https://bulletin.miamioh.edu/farmer-business/isa-bsb/">ISA</a></li>
            </ul>
            <p><a href="/not-a-program/">Ignored</a></p>
          </div>
        </body></html>"#;

    #[test]
    fn test_extract_program_links_resolves_relative_urls() {
        let links = extract_program_links(BULLETIN_HTML, BULLETIN_URL).unwrap();
        assert_eq!(
            links,
            vec![
                "https://bulletin.miamioh.edu/farmer-business/finance-bsb/",
                "https://bulletin.miamioh.edu/farmer-business/accountancy-bsb/",
                "https://bulletin.miamioh.edu/farmer-business/isa-bsb/",
            ]
        );
    }

    #[test]
    fn test_extract_page_skips_scripts_and_normalizes_space() {
        let html = r#"<html><head><title>  ISA Courses  </title></head>
            <body>
              <h1>ISA   401</h1>
              <script>var tracking = true;</script>
              <p>Prerequisite:&nbsp;ISA 245 or CSE 385.</p>
              <style>.x { color: red; }</style>
            </body></html>"#;
        let doc = extract_page(html, "https://bulletin.miamioh.edu/courses-instruction/isa/");

        assert_eq!(doc.title, "ISA Courses");
        assert_eq!(doc.content, "ISA 401\nPrerequisite: ISA 245 or CSE 385.");
        assert_eq!(doc.source, "https://bulletin.miamioh.edu/courses-instruction/isa/");
    }

    #[test]
    fn test_inline_links_stay_in_sentence() {
        let html = r#"<html><body>
            <div class="courseblock">
              <p class="courseblocktitle"><strong>ISA 401. Business Intelligence and Data Visualization.</strong></p>
              <p>Prerequisite: <a href="/search/?P=ISA%20245">ISA 245</a> or
                 <a href="/search/?P=CSE%20385">CSE 385</a>.</p>
              <ul><li>Fall</li><li><b>Spring</b> only</li></ul>
              Offered at <span>Oxford</span><br>campus.
            </div>
            </body></html>"#;
        let doc = extract_page(html, "https://x/");

        assert_eq!(
            doc.content,
            "ISA 401. Business Intelligence and Data Visualization.\n\
             Prerequisite: ISA 245 or CSE 385.\n\
             Fall\n\
             Spring only\n\
             Offered at Oxford\n\
             campus."
        );
    }

    #[test]
    fn test_extract_page_without_title() {
        let doc = extract_page("<html><body><p>Hello</p></body></html>", "https://x/");
        assert_eq!(doc.title, "");
        assert_eq!(doc.content, "Hello");
    }

    #[test]
    fn test_parse_url_list() {
        let text = "# Majors\nhttps://a.edu/one\n\n  https://a.edu/two  \n# end\nhttps://a.edu/one\n";
        assert_eq!(
            parse_url_list(text),
            vec!["https://a.edu/one", "https://a.edu/two", "https://a.edu/one"]
        );
    }

    #[tokio::test]
    async fn test_scrape_skips_failed_pages_and_keeps_order() {
        let app = Router::new()
            .route(
                "/one",
                get(|| async { "<html><head><title>One</title></head><body>first page</body></html>" }),
            )
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route(
                "/two",
                get(|| async { "<html><head><title>Two</title></head><body>second page</body></html>" }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let urls = vec![
            format!("http://{}/one", addr),
            format!("http://{}/broken", addr),
            format!("http://{}/two", addr),
        ];
        let client = build_client().unwrap();
        let report = scrape_pages(&client, &urls).await;

        let titles: Vec<_> = report.documents.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["One", "Two"]);
        assert_eq!(report.documents[1].content, "second page");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, urls[1]);
        assert!(report.failures[0].1.contains("500"));
    }

    #[tokio::test]
    #[ignore] // Requires network access to the live bulletin
    async fn test_live_bulletin_has_programs() {
        let client = build_client().unwrap();
        let links = fetch_bulletin_program_urls(&client, BULLETIN_URL).await.unwrap();
        assert!(!links.is_empty());
    }
}
