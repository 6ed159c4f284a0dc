use scraper::{Html, Selector};

use super::{RawProduct, SiteStrategy};

/// The closed strategy registry, in match order. Adding support for a new
/// site is a pure addition here.
pub(crate) fn strategies() -> Vec<SiteStrategy> {
    vec![
        SiteStrategy {
            name: "amazon",
            matches: |host| host_has_registrable_label(host, "amazon"),
            parse: parse_amazon,
        },
        SiteStrategy {
            name: "ebay",
            matches: |host| host_has_registrable_label(host, "ebay"),
            parse: parse_ebay,
        },
    ]
}

// Suffix labels that may follow a registrable label ("amazon" in
// www.amazon.co.uk). Keeps amazon.evil.com from matching the amazon
// strategy while amazon.com.au still does.
const DOMAIN_SUFFIXES: &[&str] = &[
    "com", "co", "net", "org", "uk", "au", "de", "fr", "it", "es", "ca", "jp", "in", "nz", "us",
];

pub(crate) fn host_has_registrable_label(host: &str, label: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    for (i, candidate) in labels.iter().enumerate() {
        if candidate.eq_ignore_ascii_case(label) {
            return i + 1 < labels.len()
                && labels[i + 1..]
                    .iter()
                    .all(|s| DOMAIN_SUFFIXES.contains(&s.to_ascii_lowercase().as_str()));
        }
    }
    false
}

fn parse_amazon(doc: &Html) -> Option<RawProduct> {
    let title = select_text(doc, "span#productTitle");

    // Price block ids vary by listing type; first hit wins.
    let price_text = [
        "span#priceblock_ourprice",
        "span#priceblock_dealprice",
        "span.priceToPay",
        "span.a-price span.a-offscreen",
    ]
    .iter()
    .find_map(|selector| select_text(doc, selector))?;

    Some(RawProduct { title, price_text })
}

fn parse_ebay(doc: &Html) -> Option<RawProduct> {
    let title = select_text(doc, "h1.x-item-title__mainTitle span.ux-textspans")
        .or_else(|| select_text(doc, "h1#itemTitle"));

    let price_text = select_text(doc, "div.x-price-primary span.ux-textspans")
        .or_else(|| select_text(doc, "span#prcIsum"))?;

    Some(RawProduct { title, price_text })
}

fn select_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let element = doc.select(&sel).next()?;
    let text = element.text().collect::<Vec<_>>().join(" ").trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}
