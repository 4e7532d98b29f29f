//! Network access behind a trait so the policy engine can be driven offline.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::http::{Headers, Request, Response, ResponseKind};

/// Anything that can turn a request into a response snapshot.
///
/// An `Err` means the request never produced a response (DNS, connection,
/// TLS, timeout). HTTP error statuses are `Ok` responses.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

impl<T: Network> Network for Arc<T> {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    (**self).fetch(request).await
  }
}

/// reqwest-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(secs) = config.request_timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin.clone(),
    })
  }

  /// Same-origin responses are `basic`, everything else readable is `cors`.
  fn kind_for(&self, url: &Url) -> ResponseKind {
    if url.origin() == self.origin.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    }
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let resp = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request, e))?;

    let status = resp.status();
    let kind = self.kind_for(resp.url());
    let headers: Headers = resp
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = resp
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request, e))?;

    let mut response = Response::new(status.as_u16(), body.to_vec()).with_kind(kind);
    response.headers = headers;
    if let Some(reason) = status.canonical_reason() {
      response.status_text = reason.to_string();
    }

    Ok(response)
  }
}
