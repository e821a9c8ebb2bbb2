//! Remote JSON probe
//!
//! GETs one URL and hands back the JSON body. The host must be on the
//! probe's domain allowlist, so a misconfigured URL can't reach anywhere
//! the operator didn't intend. Redirects are followed only to allowed hosts.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{redirect, Url};
use vigil_core::{Probe, ProbeContext, ProbeOutput};

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum HttpProbeError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Domain not allowed: {0}")]
    DomainNotAllowed(String),
    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

/// `example.com` admits itself and `api.example.com`, not `badexample.com`
fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|domain| {
        host == domain
            || host
                .strip_suffix(domain.as_str())
                .map_or(false, |prefix| prefix.ends_with('.'))
    })
}

pub struct HttpJsonProbe {
    kind: String,
    url: Url,
    client: reqwest::Client,
}

impl HttpJsonProbe {
    /// `allowed_domains` admit the domain itself and its subdomains
    pub fn new<S: AsRef<str>>(kind: impl Into<String>, url: &str, allowed_domains: &[S]) -> Result<Self, HttpProbeError> {
        let allowed: Vec<String> = allowed_domains.iter().map(|d| d.as_ref().to_string()).collect();
        let url = Url::parse(url).map_err(|e| HttpProbeError::InvalidUrl(format!("{}: {}", url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| HttpProbeError::InvalidUrl(format!("{}: no host", url)))?;
        if !domain_allowed(host, &allowed) {
            return Err(HttpProbeError::DomainNotAllowed(host.to_string()));
        }

        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            match attempt.url().host_str().map(str::to_string) {
                Some(host) if domain_allowed(&host, &allowed) => attempt.follow(),
                Some(host) => attempt.error(HttpProbeError::DomainNotAllowed(host)),
                None => attempt.error("redirect without a host"),
            }
        });
        let client = reqwest::Client::builder()
            .redirect(policy)
            .build()
            .map_err(|e| HttpProbeError::Client(e.to_string()))?;

        Ok(Self {
            kind: kind.into(),
            url,
            client,
        })
    }
}

#[async_trait]
impl Probe for HttpJsonProbe {
    async fn sample(&self, ctx: &ProbeContext) -> anyhow::Result<ProbeOutput> {
        tracing::debug!(url = %self.url, query_id = %ctx.query_id, "fetching remote probe");
        let resp = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .with_context(|| format!("GET {}", self.url))?
            .error_for_status()?;
        let body = resp.json().await.context("response body is not JSON")?;
        Ok(ProbeOutput::new(self.kind.clone(), body))
    }

    fn describe(&self) -> &str {
        self.url.as_str()
    }
}
