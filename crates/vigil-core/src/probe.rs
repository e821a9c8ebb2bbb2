//! Probe abstraction and the adapter that makes probes safe to call
//!
//! A probe is anything that can produce one named perception signal: an OS
//! metric reader, a remote API, a heuristic classifier. The manager only ever
//! talks to probes through `ProbeAdapter::invoke`, which turns timeouts,
//! errors and panics into a `ProbeFailure` value.

use crate::context::ProbeContext;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::borrow::Borrow;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use vigil_cache::Aborted;

/// Stable probe identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeKey(String);

impl ProbeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys end up inside cache keys as `<probe>@<scope>`
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains('@')
    }

    pub(crate) fn cache_key(&self, scope: Option<&str>) -> String {
        match scope {
            Some(scope) => format!("{}@{}", self.0, scope),
            None => self.0.clone(),
        }
    }
}

impl From<&str> for ProbeKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ProbeKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl Borrow<str> for ProbeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProbeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A probe's payload: a kind tag plus opaque structured data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutput {
    pub kind: String,
    pub data: Value,
}

impl ProbeOutput {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Look up a top-level field of an object payload
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(Value::as_f64)
    }
}

/// Why a probe produced no value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailure {
    #[error("Probe timed out")]
    Timeout,

    #[error("Probe failed: {0}")]
    Error(String),
}

impl From<Aborted> for ProbeFailure {
    fn from(aborted: Aborted) -> Self {
        ProbeFailure::Error(aborted.to_string())
    }
}

/// A value or the reason there isn't one
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    Value(ProbeOutput),
    Failure(ProbeFailure),
}

impl ProbeResult {
    pub fn value(&self) -> Option<&ProbeOutput> {
        match self {
            ProbeResult::Value(output) => Some(output),
            ProbeResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ProbeFailure> {
        match self {
            ProbeResult::Value(_) => None,
            ProbeResult::Failure(failure) => Some(failure),
        }
    }
}

/// A source of one perception signal.
///
/// Implementations should be pure reads of external state. They may block on
/// I/O; the adapter bounds how long that can take.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn sample(&self, ctx: &ProbeContext) -> anyhow::Result<ProbeOutput>;

    /// One-line description for listings
    fn describe(&self) -> &str {
        ""
    }
}

/// Wraps a probe with a time budget and fault containment
#[derive(Clone)]
pub struct ProbeAdapter {
    probe: Arc<dyn Probe>,
    timeout: Duration,
}

impl ProbeAdapter {
    pub fn new(probe: Arc<dyn Probe>, timeout: Duration) -> Self {
        Self { probe, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn describe(&self) -> &str {
        self.probe.describe()
    }

    pub fn probe(&self) -> Arc<dyn Probe> {
        Arc::clone(&self.probe)
    }

    /// Run the probe once. Never panics and never outlives its budget.
    pub async fn invoke(&self, ctx: &ProbeContext) -> Result<ProbeOutput, ProbeFailure> {
        let sample = AssertUnwindSafe(self.probe.sample(ctx)).catch_unwind();
        match tokio::time::timeout(self.timeout, sample).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(ProbeFailure::Error(format!("{:#}", e))),
            Ok(Err(panic)) => Err(ProbeFailure::Error(format!(
                "probe panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(ProbeFailure::Timeout),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Probe built from an async closure returning the payload
pub struct FnProbe<F> {
    kind: String,
    f: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn(ProbeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    pub fn new(kind: impl Into<String>, f: F) -> Self {
        Self { kind: kind.into(), f }
    }
}

#[async_trait]
impl<F, Fut> Probe for FnProbe<F>
where
    F: Fn(ProbeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn sample(&self, ctx: &ProbeContext) -> anyhow::Result<ProbeOutput> {
        let data = (self.f)(ctx.clone()).await?;
        Ok(ProbeOutput::new(self.kind.clone(), data))
    }

    fn describe(&self) -> &str {
        &self.kind
    }
}

/// Probe built from a synchronous reader.
///
/// The reader runs on the blocking pool so slow syscalls never stall the
/// runtime's worker threads.
pub struct BlockingProbe<F> {
    kind: String,
    f: Arc<F>,
}

impl<F> BlockingProbe<F>
where
    F: Fn(&ProbeContext) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    pub fn new(kind: impl Into<String>, f: F) -> Self {
        Self {
            kind: kind.into(),
            f: Arc::new(f),
        }
    }
}

#[async_trait]
impl<F> Probe for BlockingProbe<F>
where
    F: Fn(&ProbeContext) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn sample(&self, ctx: &ProbeContext) -> anyhow::Result<ProbeOutput> {
        let f = Arc::clone(&self.f);
        let ctx = ctx.clone();
        let data = tokio::task::spawn_blocking(move || f(&ctx))
            .await
            .map_err(|e| anyhow::anyhow!("blocking reader did not complete: {}", e))??;
        Ok(ProbeOutput::new(self.kind.clone(), data))
    }

    fn describe(&self) -> &str {
        &self.kind
    }
}
