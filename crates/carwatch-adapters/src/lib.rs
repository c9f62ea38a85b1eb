//! Listing source contract + the classifieds-site search adapter.

use async_trait::async_trait;
use carwatch_core::{fold_eq, ScrapedListing, WatchDefinition};
use carwatch_storage::{FetchedPage, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

pub const CRATE_NAME: &str = "carwatch-adapters";

pub const DEFAULT_SEARCH_BASE_URL: &str = "https://www.bilbasen.dk/brugt/bil";

/// Result pages requested per watch before paging stops.
pub const MAX_SEARCH_PAGES: u32 = 9;

const ROW_SELECTOR: &str = "div.bb-listing-clickable";
const HEADING_SELECTOR: &str = "a.listing-heading";
const DATA_SELECTOR: &str = "div.listing-data";
const PRICE_SELECTOR: &str = "div.listing-price";
const DESCRIPTION_SELECTOR: &str = "div.listing-description";
const REGION_SELECTOR: &str = "div.listing-region";

const KM_DATA_INDEX: usize = 2;
const YEAR_DATA_INDEX: usize = 3;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport failure for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("invalid search url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: &'static str, message: String },
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Every live listing for the watch's model, across all result pages.
    async fn search(&self, watch: &WatchDefinition) -> Result<Vec<ScrapedListing>, SourceError>;
}

/// Transport used by page-based sources. Any status is a successful response here.
#[async_trait]
pub trait PageClient: Send + Sync {
    async fn get_page(&self, url: &Url) -> Result<FetchedPage, SourceError>;
}

#[async_trait]
impl PageClient for HttpFetcher {
    async fn get_page(&self, url: &Url) -> Result<FetchedPage, SourceError> {
        self.fetch_page(url.as_str())
            .await
            .map_err(|source| SourceError::Transport {
                url: url.to_string(),
                source: Box::new(source),
            })
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub base_url: String,
    pub max_pages: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SEARCH_BASE_URL.to_string(),
            max_pages: MAX_SEARCH_PAGES,
        }
    }
}

#[derive(Debug)]
pub struct BilbasenSource<C = HttpFetcher> {
    client: C,
    config: SearchConfig,
}

impl<C: PageClient> BilbasenSource<C> {
    pub fn new(client: C, config: SearchConfig) -> Self {
        Self { client, config }
    }

    pub fn page_url(&self, watch: &WatchDefinition, page: u32) -> Result<Url, SourceError> {
        let mut params: Vec<(&str, String)> = vec![
            ("IncludeEngrosCVR", "true".to_string()),
            ("PriceFrom", "0".to_string()),
            ("includeLeasing", "false".to_string()),
            ("free", watch.search_phrase()),
            ("page", page.to_string()),
        ];
        if let Some(year) = watch.earliest_year {
            params.push(("YearFrom", year.to_string()));
        }
        if let Some(km) = watch.max_km_driven {
            params.push(("MileageTo", km.to_string()));
        }
        Ok(Url::parse_with_params(&self.config.base_url, &params)?)
    }
}

#[async_trait]
impl<C: PageClient> ListingSource for BilbasenSource<C> {
    fn source_id(&self) -> &'static str {
        "bilbasen"
    }

    async fn search(&self, watch: &WatchDefinition) -> Result<Vec<ScrapedListing>, SourceError> {
        let span = info_span!("search", model = %watch.model, trim = %watch.trim);
        async {
            let mut matches = Vec::new();
            let mut pages = 0u32;

            for page in 1..=self.config.max_pages {
                let url = self.page_url(watch, page)?;
                let response = self.client.get_page(&url).await?;
                if !response.status.is_success() {
                    debug!(page, status = %response.status, "stopping at non-success page");
                    break;
                }
                pages += 1;

                let rows = parse_listing_page(&response.body)?;
                let row_count = rows.len();
                matches.extend(rows.into_iter().filter(|row| fold_eq(&row.model, &watch.model)));
                debug!(page, rows = row_count, "page parsed");
            }

            info!(pages, matches = matches.len(), "search finished");
            Ok(matches)
        }
        .instrument(span)
        .await
    }
}

fn selector(css: &'static str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn text_or_none(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parses a whole-number field such as `"189.900 kr."` or `"85.000"`. Unparseable input
/// yields 0 and a warning.
pub fn parse_number(raw: &str, field: &'static str) -> i64 {
    let cleaned: String = raw
        .replace("kr.", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .collect();
    match cleaned.parse::<i64>() {
        Ok(value) => value,
        Err(_) => {
            warn!(field, raw, "unable to parse listing field");
            0
        }
    }
}

/// Splits the heading text into model and trim on the first double space.
fn split_heading(text: &str) -> (String, String) {
    let mut parts = text
        .split("  ")
        .map(str::trim)
        .filter(|part| !part.is_empty());
    let model = parts.next().unwrap_or_default().to_string();
    let trim = parts.next().unwrap_or_default().to_string();
    (model, trim)
}

fn listing_id(href: &str) -> Option<String> {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Parses one result page. A page with no listing rows is an empty result.
pub fn parse_listing_page(html: &str) -> Result<Vec<ScrapedListing>, SourceError> {
    let document = Html::parse_document(html);
    let rows = selector(ROW_SELECTOR)?;
    let heading = selector(HEADING_SELECTOR)?;
    let data = selector(DATA_SELECTOR)?;
    let price = selector(PRICE_SELECTOR)?;
    let description = selector(DESCRIPTION_SELECTOR)?;
    let region = selector(REGION_SELECTOR)?;

    let mut listings = Vec::new();
    for row in document.select(&rows) {
        let Some(link) = row.select(&heading).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href").map(str::trim) else {
            continue;
        };
        let Some(id) = listing_id(href) else {
            warn!(href, "listing link without id");
            continue;
        };

        let (model, trim) = split_heading(&link.text().collect::<String>());
        let data_values: Vec<String> = row.select(&data).map(element_text).collect();
        let numeric_at = |index: usize, field: &'static str| match data_values.get(index) {
            Some(raw) => parse_number(raw, field),
            None => {
                warn!(field, id = %id, "listing field missing");
                0
            }
        };
        let km_driven = numeric_at(KM_DATA_INDEX, "km_driven");
        let year = numeric_at(YEAR_DATA_INDEX, "year");
        let year = i32::try_from(year).unwrap_or_else(|_| {
            warn!(year, id = %id, "year out of range");
            0
        });
        let price = match row.select(&price).next() {
            Some(node) => parse_number(&element_text(node), "price"),
            None => {
                warn!(field = "price", id = %id, "listing field missing");
                0
            }
        };

        listings.push(ScrapedListing {
            id,
            model,
            trim,
            href: href.to_string(),
            km_driven,
            year,
            price,
            description: row.select(&description).next().map(element_text).and_then(text_or_none),
            region: row.select(&region).next().map(element_text).and_then(text_or_none),
        });
    }
    Ok(listings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carwatch_storage::StatusCode;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    fn row(id: &str, heading: &str, km: &str, year: &str, price: &str) -> String {
        format!(
            r#"<div class="bb-listing-clickable">
                 <a class="listing-heading darkLink" href="/brugt/bil/vw/golf/{id}">{heading}</a>
                 <div class="listing-description">Velholdt bil</div>
                 <div class="listing-data">Benzin</div>
                 <div class="listing-data">Manuel</div>
                 <div class="listing-data">{km}</div>
                 <div class="listing-data">{year}</div>
                 <div class="listing-region">Sjælland</div>
                 <div class="listing-price">{price}</div>
               </div>"#
        )
    }

    fn page(rows: &[String]) -> String {
        format!("<html><body><div id=\"results\">{}</div></body></html>", rows.join("\n"))
    }

    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<FetchedPage, SourceError>>>,
        requested: Mutex<Vec<Url>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<FetchedPage, SourceError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageClient for ScriptedClient {
        async fn get_page(&self, url: &Url) -> Result<FetchedPage, SourceError> {
            self.requested.lock().await.push(url.clone());
            self.responses.lock().await.pop_front().unwrap_or_else(|| {
                Ok(FetchedPage {
                    status: StatusCode::OK,
                    body: page(&[]),
                })
            })
        }
    }

    fn ok(body: String) -> Result<FetchedPage, SourceError> {
        Ok(FetchedPage {
            status: StatusCode::OK,
            body,
        })
    }

    fn status(code: StatusCode) -> Result<FetchedPage, SourceError> {
        Ok(FetchedPage {
            status: code,
            body: String::new(),
        })
    }

    #[test]
    fn parses_listing_rows() {
        let html = page(&[row("5512345", "Golf  GTI 2,0 TSI", "85.000", "2018", "189.900 kr.")]);
        let listings = parse_listing_page(&html).unwrap();

        assert_eq!(listings.len(), 1);
        let listing = &listings[0];
        assert_eq!(listing.id, "5512345");
        assert_eq!(listing.model, "Golf");
        assert_eq!(listing.trim, "GTI 2,0 TSI");
        assert_eq!(listing.href, "/brugt/bil/vw/golf/5512345");
        assert_eq!(listing.km_driven, 85_000);
        assert_eq!(listing.year, 2018);
        assert_eq!(listing.price, 189_900);
        assert_eq!(listing.description.as_deref(), Some("Velholdt bil"));
        assert_eq!(listing.region.as_deref(), Some("Sjælland"));
    }

    #[test]
    fn page_without_rows_is_empty_not_an_error() {
        let listings = parse_listing_page("<html><body><p>Ingen resultater</p></body></html>").unwrap();
        assert!(listings.is_empty());
    }

    #[test]
    fn unparseable_numbers_degrade_to_zero() {
        let html = page(&[row("1", "Golf  GTI", "-", "ukendt", "Ring for pris")]);
        let listings = parse_listing_page(&html).unwrap();

        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].km_driven, 0);
        assert_eq!(listings[0].year, 0);
        assert_eq!(listings[0].price, 0);
    }

    #[test]
    fn rows_without_heading_link_are_skipped() {
        let html = page(&[
            r#"<div class="bb-listing-clickable"><div class="listing-price">1 kr.</div></div>"#.to_string(),
            row("2", "Golf  GTD", "10.000", "2020", "200.000 kr."),
        ]);
        let listings = parse_listing_page(&html).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "2");
    }

    #[test]
    fn page_url_carries_search_filters() {
        let source = BilbasenSource::new(ScriptedClient::new(vec![]), SearchConfig::default());
        let mut watch = WatchDefinition::new("Golf");
        watch.trim = "GTI".into();
        watch.earliest_year = Some(2016);
        watch.max_km_driven = Some(120_000);

        let url = source.page_url(&watch, 3).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert!(url.as_str().starts_with(DEFAULT_SEARCH_BASE_URL));
        assert!(pairs.contains(&("free".into(), "Golf GTI".into())));
        assert!(pairs.contains(&("PriceFrom".into(), "0".into())));
        assert!(pairs.contains(&("includeLeasing".into(), "false".into())));
        assert!(pairs.contains(&("page".into(), "3".into())));
        assert!(pairs.contains(&("YearFrom".into(), "2016".into())));
        assert!(pairs.contains(&("MileageTo".into(), "120000".into())));
    }

    #[tokio::test]
    async fn search_pages_until_cap_even_through_empty_pages() {
        let client = ScriptedClient::new(vec![
            ok(page(&[row("1", "Golf  GTI", "10.000", "2019", "150.000 kr.")])),
            ok(page(&[])),
            ok(page(&[row("2", "GOLF  Variant", "20.000", "2018", "140.000 kr.")])),
        ]);
        let source = BilbasenSource::new(client, SearchConfig::default());

        let listings = source.search(&WatchDefinition::new("Golf")).await.unwrap();

        let ids: Vec<&str> = listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(source.client.requested.lock().await.len(), MAX_SEARCH_PAGES as usize);
    }

    #[tokio::test]
    async fn search_stops_at_first_non_success_status() {
        let client = ScriptedClient::new(vec![
            ok(page(&[row("1", "Golf  GTI", "10.000", "2019", "150.000 kr.")])),
            status(StatusCode::FOUND),
            ok(page(&[row("2", "Golf  GTI", "10.000", "2019", "150.000 kr.")])),
        ]);
        let source = BilbasenSource::new(client, SearchConfig::default());

        let listings = source.search(&WatchDefinition::new("Golf")).await.unwrap();

        assert_eq!(listings.len(), 1);
        assert_eq!(source.client.requested.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn search_filters_other_models() {
        let client = ScriptedClient::new(vec![ok(page(&[
            row("1", "Golf  GTI", "10.000", "2019", "150.000 kr."),
            row("2", "Golf Sportsvan  1,5", "10.000", "2019", "150.000 kr."),
        ]))]);
        let source = BilbasenSource::new(client, SearchConfig::default());

        let listings = source.search(&WatchDefinition::new("golf")).await.unwrap();

        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "1");
        assert_eq!(listings[0].model, "Golf");
    }

    #[tokio::test]
    async fn transport_failure_aborts_search() {
        let client = ScriptedClient::new(vec![
            ok(page(&[])),
            Err(SourceError::Transport {
                url: "https://example.test/?page=2".into(),
                source: "connection reset".into(),
            }),
        ]);
        let source = BilbasenSource::new(client, SearchConfig::default());

        let err = source.search(&WatchDefinition::new("Golf")).await.unwrap_err();
        assert!(matches!(err, SourceError::Transport { ref url, .. } if url.ends_with("page=2")));
    }
}
