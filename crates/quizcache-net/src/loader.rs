//! reqwest-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::{Origin, Url};

use crate::{Fetcher, NetError, Request, RequestMode, Response, ResponseType};

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Origin of the page the requests are made for. Responses from any
    /// other origin are typed `Cors` or `Opaque`.
    pub origin: Option<Url>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("quizcache/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "ja,en-US;q=0.8,en;q=0.6".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            origin: None,
        }
    }
}

/// Resource loader for fetching URLs over the real network.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = ?config.origin.as_ref().map(Url::as_str), "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn page_origin(&self) -> Option<Origin> {
        self.config.origin.as_ref().map(Url::origin)
    }

    /// Classify a response from `final_url` for a request made in `mode`.
    fn response_type(&self, final_url: &Url, mode: RequestMode) -> ResponseType {
        match self.page_origin() {
            None => ResponseType::Basic,
            Some(origin) if origin == final_url.origin() => ResponseType::Basic,
            Some(_) if mode == RequestMode::NoCors => ResponseType::Opaque,
            Some(_) => ResponseType::Cors,
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if !request.has_network_scheme() {
            return Err(NetError::UnsupportedScheme(request.url.scheme().to_string()));
        }

        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        req_builder = req_builder.timeout(timeout);

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let redirected = url != request.url;
        let response_type = self.response_type(&url, request.mode);

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            response_type = ?response_type,
            body_len = body.len(),
            "Response received"
        );

        if response_type == ResponseType::Opaque {
            let mut opaque = Response::opaque(url, body);
            opaque.redirected = redirected;
            return Ok(opaque);
        }

        let mut result = Response::new(url, status.as_u16(), body).with_type(response_type);
        result.headers = headers;
        result.redirected = redirected;
        Ok(result)
    }
}
