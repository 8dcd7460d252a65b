use std::sync::OnceLock;

use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::text::stripped_text;
use crate::config::Settings;
use crate::model::CompanyStub;

/// Which anchors on a listing page point at company detail pages.
#[derive(Debug, Clone)]
pub struct LinkRules {
    pub detail_marker: String,
    pub excluded_segments: Vec<String>,
    pub search_label: String,
}

impl LinkRules {
    pub fn from_settings(settings: &Settings) -> Self {
        LinkRules {
            detail_marker: settings.detail_path_marker.clone(),
            excluded_segments: settings.excluded_segments.clone(),
            search_label: settings.search_label.clone(),
        }
    }

    pub fn is_company_href(&self, href: &str) -> bool {
        href.contains(&self.detail_marker)
            && !self.excluded_segments.iter().any(|seg| href.contains(seg.as_str()))
    }
}

impl Default for LinkRules {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

fn anchor_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("a[href]").unwrap())
}

/// Company stubs in document order. Duplicates are kept; the store dedups by name.
pub fn company_links(html: &str, page_url: &Url, rules: &LinkRules) -> Vec<CompanyStub> {
    let doc = Html::parse_document(html);
    let mut stubs = Vec::new();

    for a in doc.select(anchor_selector()) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        if !rules.is_company_href(href) {
            continue;
        }

        let name = stripped_text(a);
        if name.is_empty() || name == rules.search_label {
            continue;
        }

        match page_url.join(href) {
            Ok(resolved) => stubs.push(CompanyStub {
                name,
                source_url: resolved.to_string(),
            }),
            Err(e) => debug!("Skipping unresolvable href {:?}: {}", href, e),
        }
    }

    stubs
}
