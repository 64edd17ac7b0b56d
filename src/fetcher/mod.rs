//! Process-wide HTTP client
//!
//! Every upstream request goes through one shared [`Fetcher`], configured once
//! at startup from [`ProxyConfig`]. Besides plain requests it implements the
//! transparent-refresh retry used by the proxy path: a bounded retry schedule
//! that invokes the caller's [`Refresher`] once at the midpoint attempt so an
//! expired stream token is renewed without the player noticing.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Client, Method, Proxy, Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::errors::StreamError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts made by [`Fetcher::fetch_with_refresh`] before giving up
pub const REFRESH_ATTEMPTS: usize = 6;
const RETRY_DELAY: Duration = Duration::from_millis(200);
const POST_REFRESH_DELAY: Duration = Duration::from_secs(2);

/// Renews upstream authorization state (a fresh signed stream URL).
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, cancel: &CancellationToken) -> Result<(), StreamError>;
}

pub struct Fetcher {
    client: Client,
    /// Redirects disabled; used to read `Location` headers hop by hop
    bare_client: Client,
}

impl Fetcher {
    pub fn new(proxy: &ProxyConfig) -> Result<Self, StreamError> {
        Ok(Self {
            client: Self::build_client(proxy, true)?,
            bare_client: Self::build_client(proxy, false)?,
        })
    }

    fn build_client(proxy: &ProxyConfig, follow_redirects: bool) -> Result<Client, StreamError> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);

        if !follow_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }

        let protocol = if proxy.protocol.is_empty() {
            "http"
        } else {
            proxy.protocol.as_str()
        };

        if proxy.enabled && proxy.system_proxy {
            // reqwest picks up HTTP_PROXY/HTTPS_PROXY/ALL_PROXY on its own
            info!("using system environment proxy");
        } else if proxy.enabled && !proxy.host.is_empty() && (1024..=65535).contains(&proxy.port) {
            let address = format!("{}://{}:{}", protocol, proxy.host, proxy.port);
            let mut upstream = Proxy::all(&address)?;
            if !proxy.username.is_empty() && !proxy.password.is_empty() {
                upstream = upstream.basic_auth(&proxy.username, &proxy.password);
            }
            builder = builder.proxy(upstream);
            info!("using proxy: {}", address);
        } else {
            builder = builder.no_proxy();
        }

        Ok(builder.build()?)
    }

    /// Perform one HTTP request. `query` pairs are appended to any query
    /// already present on `url`; a caller-set `Host` header rides as the
    /// request's virtual host. Non-success statuses are the caller's problem,
    /// only transport failures error here.
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        headers: Option<&HeaderMap>,
    ) -> Result<Response, StreamError> {
        let mut request = self.client.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(headers) = headers {
            request = request.headers(headers.clone());
        }
        Ok(request.send().await?)
    }

    /// GET a URL and read the body, treating anything but 200/304 as failure.
    pub async fn fetch_body(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: Option<&HeaderMap>,
    ) -> Result<Bytes, StreamError> {
        let response = self.fetch(Method::GET, url, query, headers).await?;
        if !is_success(response.status()) {
            return Err(StreamError::Status(response.status().as_u16()));
        }
        Ok(response.bytes().await?)
    }

    /// Run `executor` with a bounded retry schedule, renewing upstream state
    /// once at the midpoint attempt.
    ///
    /// A 200/304 response wins immediately. After the midpoint attempt fails,
    /// `refresher.refresh` runs exactly once; a refresh failure aborts the
    /// whole loop with that error. The executor is expected to re-read any
    /// state the refresh may have replaced (URL, headers) on every call.
    pub async fn fetch_with_refresh<F, Fut>(
        &self,
        cancel: &CancellationToken,
        refresher: &dyn Refresher,
        executor: F,
    ) -> Result<Response, StreamError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Response, StreamError>>,
    {
        let mut last_status = 0u16;

        for attempt in 0..REFRESH_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }

            let response = executor().await?;
            let status = response.status();
            if is_success(status) {
                return Ok(response);
            }

            last_status = status.as_u16();
            warn!(
                "upstream request failed with status {} (attempt {}/{})",
                last_status,
                attempt + 1,
                REFRESH_ATTEMPTS
            );

            if attempt + 1 == REFRESH_ATTEMPTS {
                break;
            }

            // Renew the signed URL once, halfway through the schedule. The
            // later attempts then run against the refreshed state.
            let delay = if attempt == REFRESH_ATTEMPTS / 2 - 1 {
                refresher.refresh(cancel).await?;
                POST_REFRESH_DELAY
            } else {
                RETRY_DELAY
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(StreamError::Status(last_status))
    }

    /// Single no-redirect GET; returns the `Location` target of a 3xx
    /// response, `None` when the URL is already final.
    pub async fn resolve_redirect(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<Option<String>, StreamError> {
        let mut request = self.bare_client.get(url);
        if let Some(headers) = headers {
            request = request.headers(headers.clone());
        }
        let response = request.send().await?;

        if !response.status().is_redirection() {
            return Ok(None);
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        match location {
            Some(location) => Ok(Some(location)),
            None => Err(StreamError::parse("redirect without Location header")),
        }
    }
}

fn is_success(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    impl CountingRefresher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Refresher for CountingRefresher {
        async fn refresh(&self, _cancel: &CancellationToken) -> Result<(), StreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fetcher() -> Fetcher {
        Fetcher::new(&ProxyConfig::default()).expect("client")
    }

    #[tokio::test]
    async fn fetch_body_rejects_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch_body(&format!("{}/missing", server.uri()), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Status(500)));
    }

    #[tokio::test]
    async fn fetch_merges_query_into_existing_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .and(wiremock::matchers::query_param("a", "1"))
            .and(wiremock::matchers::query_param("b", "2"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let response = fetcher()
            .fetch(
                Method::GET,
                &format!("{}/api?a=1", server.uri()),
                &[("b".to_string(), "2".to_string())],
                None,
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn refresh_runs_once_at_midpoint_and_retry_recovers() {
        let server = MockServer::start().await;
        // Three auth failures, then the refreshed token works.
        Mock::given(method("GET"))
            .and(path("/stream.m3u8"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stream.m3u8"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let refresher = CountingRefresher::new();
        let cancel = CancellationToken::new();
        let url = format!("{}/stream.m3u8", server.uri());

        let response = fetcher
            .fetch_with_refresh(&cancel, &refresher, || {
                fetcher.fetch(Method::GET, &url, &[], None)
            })
            .await
            .expect("retry should recover");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream.m3u8"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let refresher = CountingRefresher::new();
        let cancel = CancellationToken::new();
        let url = format!("{}/stream.m3u8", server.uri());

        let err = fetcher
            .fetch_with_refresh(&cancel, &refresher, || {
                fetcher.fetch(Method::GET, &url, &[], None)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Status(403)));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_between_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream.m3u8"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let refresher = CountingRefresher::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let url = format!("{}/stream.m3u8", server.uri());

        let err = fetcher
            .fetch_with_refresh(&cancel, &refresher, || {
                fetcher.fetch(Method::GET, &url, &[], None)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Cancelled));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }
}
