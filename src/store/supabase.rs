use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use serde_json::Value;

use super::{Filter, TableStore};
use crate::config::StoreCredentials;
use crate::error::StoreError;
use crate::model::CompanyRecord;

const TABLE: &str = "companies";
const COLUMNS: &str = "name,source_url,description,location";

/// The `companies` table behind Supabase's PostgREST endpoint.
pub struct SupabaseStore {
    client: reqwest::Client,
    endpoint: String,
}

impl SupabaseStore {
    pub fn new(creds: &StoreCredentials, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(&creds.key)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", creds.key))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(SupabaseStore {
            client,
            endpoint: format!("{}/rest/v1/{}", creds.url.trim_end_matches('/'), TABLE),
        })
    }
}

/// PostgREST query pairs for a filter.
fn filter_query(filter: &Filter) -> Vec<(String, String)> {
    match filter {
        Filter::All => vec![],
        Filter::NameEq(name) => vec![("name".into(), format!("eq.{}", name))],
        Filter::NotNull(col) => vec![(col.as_str().into(), "not.is.null".into())],
    }
}

/// Total from a PostgREST `Content-Range` value such as `0-999/11976` or `*/0`.
fn total_from_content_range(value: &str) -> Option<usize> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

impl TableStore for SupabaseStore {
    async fn select(
        &self,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<CompanyRecord>, StoreError> {
        let mut query = filter_query(filter);
        query.push(("select".into(), COLUMNS.into()));
        if let Some(n) = limit {
            query.push(("limit".into(), n.to_string()));
        }

        let response = self.client.get(&self.endpoint).query(&query).send().await?;
        let rows = check(response).await?.json::<Vec<CompanyRecord>>().await?;
        Ok(rows)
    }

    async fn insert(&self, row: &CompanyRecord) -> Result<(), StoreError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Responses are capped at the server's max-rows, so the total comes
    /// from `Content-Range` with `Prefer: count=exact`, not from the body.
    async fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        let mut query = filter_query(filter);
        query.push(("select".into(), "name".into()));
        query.push(("limit".into(), "1".into()));

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = check(response).await?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(total_from_content_range)
            .ok_or(StoreError::MissingCount)
    }

    async fn delete(&self, filter: &Filter) -> Result<usize, StoreError> {
        let response = self
            .client
            .delete(&self.endpoint)
            .query(&filter_query(filter))
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let removed: Value = check(response).await?.json().await?;
        Ok(removed.as_array().map_or(0, Vec::len))
    }
}
