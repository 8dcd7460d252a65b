use tracing::warn;

use crate::error::FetchError;
use crate::fetch::HttpFetcher;
use crate::model::DetailFields;
use crate::parser::extract_fields;

pub struct DetailFetcher {
    fetcher: HttpFetcher,
}

impl DetailFetcher {
    pub fn new(fetcher: HttpFetcher) -> Self {
        DetailFetcher { fetcher }
    }

    pub async fn try_fetch_details(&self, source_url: &str) -> Result<DetailFields, FetchError> {
        let html = self.fetcher.get_text(source_url, &[]).await?;
        Ok(extract_fields(&html))
    }

    /// Never fails: a fetch error is logged and yields empty fields.
    pub async fn fetch_details(&self, source_url: &str) -> DetailFields {
        match self.try_fetch_details(source_url).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Error fetching company details: {}", e);
                DetailFields::default()
            }
        }
    }
}
