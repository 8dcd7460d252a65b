//! Industry and headquarters extraction from company detail pages.
//!
//! Detail pages carry no stable class or id around these two values; only the
//! label text (`業種`, `本社`) is reliable. Each field is found by taking the
//! first `div` whose text holds the label, reading its parent's text, cutting
//! it at the label and at the next known label, and keeping the result only
//! if its length looks plausible. The result is best-effort and lossy.

use std::sync::OnceLock;

use scraper::{ElementRef, Html, Selector};

use super::text::{after_marker, collapse_whitespace, contains_text, cut_at, stripped_text};
use crate::model::DetailFields;

pub const INDUSTRY_MARKER: &str = "業種";
pub const HQ_MARKER: &str = "本社";
pub const LOCATION_STOP_MARKERS: [&str; 2] = ["残り採用", "直近の"];
pub const DESCRIPTION_LABEL: &str = "業種: ";
pub const MIN_INDUSTRY_CHARS: usize = 5;
pub const MAX_LOCATION_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct ExtractionRules {
    pub industry_marker: &'static str,
    pub hq_marker: &'static str,
    pub location_stop_markers: &'static [&'static str],
    pub description_label: &'static str,
    /// Industry text must be strictly longer than this.
    pub min_industry_chars: usize,
    /// Location text must be strictly shorter than this.
    pub max_location_chars: usize,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        ExtractionRules {
            industry_marker: INDUSTRY_MARKER,
            hq_marker: HQ_MARKER,
            location_stop_markers: &LOCATION_STOP_MARKERS,
            description_label: DESCRIPTION_LABEL,
            min_industry_chars: MIN_INDUSTRY_CHARS,
            max_location_chars: MAX_LOCATION_CHARS,
        }
    }
}

impl ExtractionRules {
    pub fn industry(&self, block_text: &str) -> Option<String> {
        let after = after_marker(block_text, self.industry_marker)?;
        let part = collapse_whitespace(cut_at(after, self.hq_marker));
        if part.chars().count() > self.min_industry_chars {
            Some(format!("{}{}", self.description_label, part))
        } else {
            None
        }
    }

    pub fn location(&self, block_text: &str) -> Option<String> {
        let after = after_marker(block_text, self.hq_marker)?;
        let cut = self
            .location_stop_markers
            .iter()
            .fold(after, |acc, marker| cut_at(acc, marker));
        let part = collapse_whitespace(cut);
        let len = part.chars().count();
        if len > 0 && len < self.max_location_chars {
            Some(part)
        } else {
            None
        }
    }
}

fn div_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("div").unwrap())
}

pub fn extract_fields(html: &str) -> DetailFields {
    let doc = Html::parse_document(html);
    extract_with(&doc, &ExtractionRules::default())
}

pub fn extract_with(doc: &Html, rules: &ExtractionRules) -> DetailFields {
    DetailFields {
        description: first_accepted(doc, rules.industry_marker, |t| rules.industry(t)),
        location: first_accepted(doc, rules.hq_marker, |t| rules.location(t)),
    }
}

/// Scan `div`s in document order; the first parent block whose text the
/// `accept` rule keeps wins. Rejected candidates do not end the scan.
fn first_accepted<F>(doc: &Html, marker: &str, accept: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    doc.select(div_selector())
        .filter(|div| contains_text(*div, marker))
        .filter_map(|div| div.parent().and_then(ElementRef::wrap))
        .find_map(|parent| accept(&stripped_text(parent)))
}
