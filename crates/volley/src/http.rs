//! A ready-made [`Executor`] issuing HTTP `GET` requests through `reqwest`.
//!
//! Enabled with the `http` feature.
//!
//! A response is a success whatever its status code, unless the executor was
//! built with [`HttpExecutor::with_error_for_status`]. The task token is
//! honored for the whole exchange: a fired token drops the request and the
//! connection with it, including while the body is still streaming in.

use crate::{
    cancel::{CancelCause, CancelSource, TaskToken, compose},
    dispatcher::{DispatchOptions, dispatch},
    error::Result,
    executor::Executor,
};
use bytes::Bytes;
use core::time::Duration;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The final URL, after redirects.
    pub url: String,
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    /// The body as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{url} responded with {status}")]
    Status { url: String, status: StatusCode },

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request to {url} cancelled ({cause})")]
    Cancelled { url: String, cause: CancelCause },
}

/// Issues one `GET` per input URL.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: Client,
    error_for_status: bool,
}

impl HttpExecutor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            error_for_status: false,
        }
    }

    /// Treat non-2xx responses as [`HttpError::Status`] failures.
    #[must_use]
    pub fn with_error_for_status(mut self, error_for_status: bool) -> Self {
        self.error_for_status = error_for_status;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn get(&self, url: &str) -> core::result::Result<HttpResponse, HttpError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if self.error_for_status && !status.is_success() {
            return Err(HttpError::Status {
                url: url.to_owned(),
                status,
            });
        }
        let url = response.url().to_string();
        let body = response.bytes().await?;
        Ok(HttpResponse { url, status, body })
    }
}

fn parse_url(url: &str) -> core::result::Result<Url, String> {
    let parsed = Url::parse(url).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(format!("unsupported scheme {scheme:?}")),
    }
}

impl Executor for HttpExecutor {
    type Input = String;
    type Output = HttpResponse;
    type Error = HttpError;

    async fn execute(
        &self,
        url: &String,
        token: TaskToken,
    ) -> core::result::Result<HttpResponse, HttpError> {
        #[cfg(feature = "tracing")]
        tracing::trace!("GET {url}");

        tokio::select! {
            biased;
            outcome = self.get(url) => outcome,
            cause = token.cancelled() => Err(HttpError::Cancelled {
                url: url.clone(),
                cause,
            }),
        }
    }

    fn validate(&self, url: &String) -> core::result::Result<(), String> {
        parse_url(url).map(drop)
    }
}

/// Fetches every URL with at most `max_concurrency` requests in flight and
/// returns the responses in input order.
///
/// # Errors
///
/// See [`dispatch`]. Transport failures surface as
/// [`DispatchError::Task`](crate::DispatchError::Task) carrying an
/// [`HttpError`].
pub async fn fetch_all<I, T>(
    urls: I,
    max_concurrency: usize,
    options: DispatchOptions<HttpExecutor>,
) -> Result<Vec<HttpResponse>, HttpError>
where
    I: IntoIterator<Item = T>,
    T: Into<Option<String>>,
{
    dispatch(urls, max_concurrency, options).await
}

/// Fetches a single URL, giving up after `timeout`.
///
/// # Errors
///
/// - [`HttpError::InvalidUrl`] if `url` is not an absolute http(s) URL.
/// - [`HttpError::Cancelled`] once `timeout` elapsed.
/// - [`HttpError::Request`] for transport failures.
pub async fn fetch_with_timeout(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> core::result::Result<HttpResponse, HttpError> {
    parse_url(url).map_err(|reason| HttpError::InvalidUrl {
        url: url.to_owned(),
        reason,
    })?;

    let executor = HttpExecutor::new(client.clone());
    let composed = compose([CancelSource::timeout(timeout)]);
    executor.execute(&url.to_owned(), composed.token().clone()).await
}
