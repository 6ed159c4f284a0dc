use regex::Regex;
use rust_decimal::Decimal;
use scraper::Html;
use std::str::FromStr;
use url::Url;

pub mod generic;
pub mod sites;

/// Hard cap on emitted titles; the repository column is unbounded TEXT but
/// downstream chat messages are not.
pub const MAX_TITLE_LEN: usize = 200;

/// Outcome of turning one fetched page into a price record. Never partially
/// populated: either both title and price are usable, or neither is.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResult {
    Success { title: String, price: Decimal },
    Failure { reason: String },
}

/// What a strategy pulls out of the markup before normalization.
#[derive(Debug, Clone)]
pub struct RawProduct {
    pub title: Option<String>,
    pub price_text: String,
}

/// A site-specific parser: a domain predicate plus a structural lookup.
/// Strategies are tried in registry order; the generic scan runs only when
/// no domain predicate matched.
pub struct SiteStrategy {
    pub name: &'static str,
    pub matches: fn(host: &str) -> bool,
    pub parse: fn(doc: &Html) -> Option<RawProduct>,
}

pub struct Extractor {
    strategies: Vec<SiteStrategy>,
    money_re: Regex,
    amount_re: Regex,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            strategies: sites::strategies(),
            // Currency symbol or ISO code adjacent to a decimal amount with
            // optional thousands separators, on either side.
            money_re: Regex::new(
                r"(?i)(?:[$£€¥₹]|\b(?:USD|AUD|EUR|GBP|CAD|NZD)\b)\s*(\d{1,3}(?:,\d{3})*(?:\.\d+)?|\d+(?:\.\d+)?)|(\d{1,3}(?:,\d{3})*(?:\.\d+)?|\d+(?:\.\d+)?)\s*(?:[$£€¥₹]|\b(?:USD|AUD|EUR|GBP|CAD|NZD)\b)",
            )
            .unwrap(),
            amount_re: Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?").unwrap(),
        }
    }

    /// Pure transformation: already-fetched page content in, normalized
    /// record out. Fetching and rendering are the caller's problem.
    pub fn extract(&self, url: &str, page_content: &str) -> ExtractionResult {
        let host = match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_owned)) {
            Some(host) => host,
            None => {
                return ExtractionResult::Failure {
                    reason: format!("invalid url: {}", url),
                };
            }
        };

        let doc = Html::parse_document(page_content);

        for strategy in &self.strategies {
            if (strategy.matches)(&host) {
                tracing::debug!(strategy = strategy.name, host = %host, "using site strategy");
                return match (strategy.parse)(&doc) {
                    Some(raw) => self.finish(raw, &doc),
                    None => ExtractionResult::Failure {
                        reason: format!("{}: expected elements not found", strategy.name),
                    },
                };
            }
        }

        match generic::parse(&doc, &self.money_re) {
            Some(raw) => self.finish(raw, &doc),
            None => ExtractionResult::Failure {
                reason: "no price found".to_string(),
            },
        }
    }

    fn finish(&self, raw: RawProduct, doc: &Html) -> ExtractionResult {
        let price = match self.normalize_price(&raw.price_text) {
            Some(price) => price,
            None => {
                return ExtractionResult::Failure {
                    reason: format!("unparseable price: {:?}", raw.price_text),
                };
            }
        };

        let title = raw
            .title
            .as_deref()
            .map(normalize_title)
            .filter(|t| !t.is_empty())
            .or_else(|| generic::fallback_title(doc))
            .unwrap_or_else(|| "Unknown Product".to_string());

        ExtractionResult::Success { title, price }
    }

    /// Strip currency decoration and thousands separators and parse a
    /// fixed-precision decimal. Zero, negative and non-numeric values are
    /// rejected outright.
    pub fn normalize_price(&self, text: &str) -> Option<Decimal> {
        let m = self.amount_re.find(text)?;
        let cleaned = m.as_str().replace(',', "");
        let price = Decimal::from_str(&cleaned).ok()?;
        if price <= Decimal::ZERO {
            return None;
        }
        Some(price)
    }
}

/// Trim, collapse internal whitespace and bound the length.
pub fn normalize_title(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_TITLE_LEN {
        collapsed
    } else {
        collapsed.chars().take(MAX_TITLE_LEN).collect::<String>().trim_end().to_string()
    }
}
