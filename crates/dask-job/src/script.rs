//! Job script classification
//!
//! `spec.script` is one of:
//! - notebook JSON, shipped inline as `app.ipynb`
//! - Python source starting with `#!/usr/bin/env python`, shipped as `app.py`
//! - an http(s) URL to a `.py` or `.ipynb`, fetched now and shipped inline
//! - any other URL or a plain path, run from the container filesystem
//!
//! Anything else can never run, so it is a validation error.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use regex::Regex;
use tracing::{debug, info};
use url::Url;

use dask_common::Error;
use dask_render::{JobScript, ScriptKind};

/// Timeout for fetching a remote script
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

static PYTHON_SHEBANG: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?m)^#!/usr/bin/env python\n"));

fn is_python_source(script: &str) -> Result<bool, Error> {
    PYTHON_SHEBANG
        .as_ref()
        .map(|re| re.is_match(script))
        .map_err(|e| Error::internal_with_context("script", e.to_string()))
}

/// Downloads remote script bodies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    /// GET `url` and return the body; non-2xx responses are errors
    async fn fetch(&self, url: &Url) -> Result<String, Error>;
}

/// [`ScriptFetcher`] over reqwest
pub struct HttpScriptFetcher {
    client: reqwest::Client,
}

impl HttpScriptFetcher {
    /// Create a fetcher with [`FETCH_TIMEOUT`]
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("script fetcher", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ScriptFetcher for HttpScriptFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, Error> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::script_fetch(url.as_str(), e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::script_fetch(url.as_str(), e.to_string()))?;
        debug!(url = %url, bytes = body.len(), "fetched job script");
        Ok(body)
    }
}

fn extension(path: &str) -> Option<&str> {
    Path::new(path).extension().and_then(|e| e.to_str())
}

fn unrecognised(script: &str, detail: &str) -> Error {
    Error::validation_for_field(
        script,
        "spec.script",
        format!(
            "cannot determine script ({}): expected notebook JSON, Python source, URL or file path",
            detail
        ),
    )
}

/// A plain path the job container can open
fn mounted_path(script: &str) -> Option<JobScript> {
    let clean = !script.is_empty()
        && !script
            .chars()
            .any(|c| c.is_whitespace() || c == '#' || c == '?');
    if !clean {
        return None;
    }
    let kind = ScriptKind::from_extension(extension(script)?)?;
    Some(JobScript::mounted(kind, script))
}

/// Classify `script`, fetching it when it is a remote URL
pub async fn resolve_script(
    script: &str,
    fetcher: &dyn ScriptFetcher,
) -> Result<JobScript, Error> {
    if serde_json::from_str::<serde_json::Value>(script).is_ok() {
        return Ok(JobScript::inline(ScriptKind::Notebook, script));
    }
    if is_python_source(script)? {
        return Ok(JobScript::inline(ScriptKind::Python, script));
    }

    match Url::parse(script) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            let kind = match extension(url.path()) {
                Some("py") => ScriptKind::Python,
                Some("ipynb") => ScriptKind::Notebook,
                other => {
                    return Err(unrecognised(
                        script,
                        &format!("remote suffix {:?}", other.unwrap_or_default()),
                    ))
                }
            };
            info!(url = %url, "fetching remote job script");
            let body = fetcher.fetch(&url).await?;
            Ok(JobScript::inline(kind, body))
        }
        Ok(url) => mounted_path(url.path()).ok_or_else(|| unrecognised(script, "file suffix")),
        Err(_) => mounted_path(script).ok_or_else(|| unrecognised(script, "not a path")),
    }
}
