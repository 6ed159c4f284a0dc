use regex::Regex;
use scraper::{Html, Selector};

use super::{RawProduct, normalize_title};

/// Fallback for sites without a dedicated strategy: take the first
/// currency-amount match anywhere in the page text, and the nearest
/// heading-like text as the title.
pub(crate) fn parse(doc: &Html, money_re: &Regex) -> Option<RawProduct> {
    let text = doc.root_element().text().collect::<Vec<_>>().join(" ");

    let captures = money_re.captures(&text)?;
    let amount = captures.get(1).or_else(|| captures.get(2))?;

    Some(RawProduct {
        title: fallback_title(doc),
        price_text: amount.as_str().to_string(),
    })
}

/// First `<h1>` if the page has one, else the document `<title>`.
pub(crate) fn fallback_title(doc: &Html) -> Option<String> {
    for selector in ["h1", "title"] {
        let sel = Selector::parse(selector).ok()?;
        if let Some(element) = doc.select(&sel).next() {
            let text = normalize_title(&element.text().collect::<Vec<_>>().join(" "));
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}
