//! HTTP page source backed by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, RETRY_AFTER, USER_AGENT};
use tracing::debug;

use crate::error::{FetchError, FetchResult, HarvestError, Result};
use crate::traits::source::PageSource;
use crate::types::config::HarvestConfig;
use crate::types::page::{PageRequest, RawResponse};

/// Fetches pages from the upstream API over HTTP.
///
/// # Example
///
/// ```rust,ignore
/// use harvester::sources::HttpPageSource;
///
/// let source = HttpPageSource::new("https://api.example.gov.br")?
///     .with_user_agent("MirrorBot/2.0");
/// let raw = source.fetch(&request).await?;
/// ```
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl HttpPageSource {
    /// Create a source with a 30 second request timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            user_agent: "HarvesterBot/1.0".to_string(),
        })
    }

    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        Ok(Self::with_timeout(&config.base_url, config.request_timeout)?
            .with_user_agent(&config.user_agent))
    }

    /// Set a custom user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set a custom HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn url_for(&self, request: &PageRequest) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, request: &PageRequest) -> FetchResult<RawResponse> {
        let url = self.url_for(request);
        debug!(url = %url, page = request.page_number, "HTTP fetch starting");

        let response = self
            .client
            .get(&url)
            .query(&request.query)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(RawResponse {
            status,
            body: body.to_vec(),
            retry_after,
        })
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    value?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::task::TaskId;
    use chrono::NaiveDate;
    use mockito::Matcher;

    fn request(page: u32) -> PageRequest {
        PageRequest {
            task_id: TaskId::from_raw("t1"),
            endpoint: "contratos".into(),
            path: "/v1/contratos".into(),
            page_number: page,
            data_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            query: vec![
                ("pagina".into(), page.to_string()),
                ("dataInicial".into(), "20240115".into()),
            ],
        }
    }

    #[tokio::test]
    async fn test_fetch_sends_query_and_returns_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/contratos")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("pagina".into(), "2".into()),
                Matcher::UrlEncoded("dataInicial".into(), "20240115".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"data":[],"totalRegistros":0,"totalPaginas":0}"#)
            .create_async()
            .await;

        let source = HttpPageSource::new(server.url()).unwrap();
        let raw = source.fetch(&request(2)).await.unwrap();

        assert_eq!(raw.status, 200);
        assert!(raw.body.starts_with(b"{\"data\""));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_reads_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/contratos")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("Retry-After", "7")
            .create_async()
            .await;

        let source = HttpPageSource::new(format!("{}/", server.url())).unwrap();
        let raw = source.fetch(&request(1)).await.unwrap();

        assert_eq!(raw.status, 429);
        assert_eq!(raw.retry_after, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_error_statuses_are_not_transport_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/contratos")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let source = HttpPageSource::new(server.url()).unwrap();
        let raw = source.fetch(&request(1)).await.unwrap();
        assert_eq!(raw.status, 404);
    }

    #[test]
    fn test_parse_retry_after() {
        let secs = HeaderValue::from_static("12");
        let date = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&secs)), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(Some(&date)), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
