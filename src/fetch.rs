use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{RetryPolicy, Settings};
use crate::error::FetchError;

/// Shared HTTP client for listing and detail pages.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout())
            .build()?;
        Ok(HttpFetcher {
            client,
            retry: settings.retry_policy(),
        })
    }

    /// GET `url` with query pairs and return the body, retrying transient failures.
    pub async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self.get_once(url, query).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        "{} (attempt {}/{}), backing off {:.1}s",
                        e,
                        attempt + 1,
                        self.retry.max_retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &str, query: &[(&str, String)]) -> Result<String, FetchError> {
        let start = Instant::now();
        let transport = |source| FetchError::Transport { url: url.to_string(), source };

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        debug!("GET {} -> {} bytes in {}ms", url, body.len(), start.elapsed().as_millis());
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_settings() -> Settings {
        Settings {
            max_retries: 2,
            base_backoff_ms: 1,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn sends_query_and_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .and(query_param("pn", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&quick_settings()).unwrap();
        let body = fetcher
            .get_text(&format!("{}/list", server.uri()), &[("pn", "3".to_string())])
            .await
            .unwrap();
        assert_eq!(body, "ok");

        let requests = server.received_requests().await.unwrap();
        let ua = requests[0].headers.get("user-agent").unwrap().to_str().unwrap();
        assert!(ua.starts_with("Mozilla/5.0"));
    }

    #[tokio::test]
    async fn retries_server_errors_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&quick_settings()).unwrap();
        let err = fetcher.get_text(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn does_not_retry_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&quick_settings()).unwrap();
        let err = fetcher.get_text(&server.uri(), &[]).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
