//! REST client for the proxy core's controller.
//!
//! The controller serves the snapshot stream and the REST API on the same
//! address, so the base URL is derived from the configured stream URL.

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Url;
use tracing::debug;

use crate::config::SourceConfig;

/// Callback receiving (operation, status, duration) for each request.
pub type MetricsCallback = Box<dyn Fn(&str, &str, std::time::Duration) + Send + Sync>;

/// HTTP client for connection actions on the core.
pub struct ControllerClient {
    http: reqwest::Client,
    base: Url,
    metrics: Option<MetricsCallback>,
}

impl ControllerClient {
    pub fn new(cfg: &SourceConfig) -> Result<Self> {
        let base = controller_base(&cfg.url)?;

        let http = reqwest::Client::builder()
            .timeout(cfg.connect_timeout)
            .no_proxy()
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Ask the core to terminate one connection.
    pub async fn close_connection(&self, id: &str) -> Result<()> {
        let start = Instant::now();
        let url = self.connection_url(id)?;

        let response = self
            .http
            .delete(url.clone())
            .send()
            .await
            .with_context(|| format!("requesting DELETE {url}"));

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.record_request("close_connection", "error", start.elapsed());
                return Err(e);
            }
        };

        let status_code = response.status();
        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request("close_connection", "error", start.elapsed());
            bail!("unexpected status {} closing connection {}: {}", status_code, id, body);
        }

        self.record_request("close_connection", "success", start.elapsed());
        debug!(id, "connection closed on core");

        Ok(())
    }

    fn connection_url(&self, id: &str) -> Result<Url> {
        if id.is_empty() {
            bail!("connection id is required");
        }

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("controller URL {} cannot carry a path", self.base))?
            .clear()
            .extend(["connections", id]);
        Ok(url)
    }

    fn record_request(&self, operation: &str, status: &str, duration: std::time::Duration) {
        if let Some(ref cb) = self.metrics {
            cb(operation, status, duration);
        }
    }
}

/// `ws://host:port/connections` -> `http://host:port/`.
fn controller_base(stream_url: &str) -> Result<Url> {
    let mut url =
        Url::parse(stream_url).with_context(|| format!("parsing source URL {stream_url}"))?;

    if url.scheme() != "ws" {
        bail!("source URL {stream_url} is not a ws:// URL");
    }

    url.set_scheme("http")
        .map_err(|()| anyhow!("cannot derive controller URL from {stream_url}"))?;
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}
