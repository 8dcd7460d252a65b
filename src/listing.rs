use tracing::{info, warn};
use url::Url;

use crate::config::Settings;
use crate::error::FetchError;
use crate::fetch::HttpFetcher;
use crate::model::CompanyStub;
use crate::parser::{company_links, LinkRules};

/// Fetches one listing page and returns the company stubs found on it.
pub struct Paginator {
    fetcher: HttpFetcher,
    listing_url: String,
    page_param: String,
    rules: LinkRules,
}

impl Paginator {
    pub fn new(fetcher: HttpFetcher, settings: &Settings) -> Self {
        Paginator {
            fetcher,
            listing_url: settings.listing_url.clone(),
            page_param: settings.page_param.clone(),
            rules: LinkRules::from_settings(settings),
        }
    }

    pub fn page_url(&self, page: u32) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.listing_url)
            .map_err(|e| FetchError::Url(self.listing_url.clone(), e))?;
        url.query_pairs_mut()
            .append_pair(&self.page_param, &page.to_string());
        Ok(url)
    }

    /// `page` is 1-based.
    pub async fn fetch_page(&self, page: u32) -> Result<Vec<CompanyStub>, FetchError> {
        let url = self.page_url(page)?;
        let html = self
            .fetcher
            .get_text(&self.listing_url, &[(self.page_param.as_str(), page.to_string())])
            .await?;
        Ok(company_links(&html, &url, &self.rules))
    }

    /// Compare two consecutive pages. If they list the same companies the
    /// pagination parameter is probably being ignored by the site.
    pub async fn check_pagination(&self, page: u32) -> Result<PaginationCheck, FetchError> {
        let first = self.fetch_page(page).await?;
        let second = self.fetch_page(page + 1).await?;
        let check = PaginationCheck {
            page,
            first_count: first.len(),
            second_count: second.len(),
            distinct: first != second,
        };
        if check.distinct {
            info!(
                "{}={} and {}={} list different companies ({} / {})",
                self.page_param, page, self.page_param, page + 1, check.first_count, check.second_count
            );
        } else {
            warn!(
                "{}={} and {}={} returned identical listings; the parameter may be ignored",
                self.page_param, page, self.page_param, page + 1
            );
        }
        Ok(check)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationCheck {
    pub page: u32,
    pub first_count: usize,
    pub second_count: usize,
    pub distinct: bool,
}
