use anyhow::{bail, Context, Result};
use serde_json::Value;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; FtdbDump/1.0)";

/// Raw image body together with the reported content type
#[derive(Debug, Clone)]
pub struct ImageDownload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// The two kinds of requests the pipeline makes against FTDB
pub trait Fetch {
    fn fetch_json(&self, url: &str) -> Result<Value>;
    fn fetch_image(&self, url: &str) -> Result<ImageDownload>;
}

pub struct FtdbClient {
    client: reqwest::blocking::Client,
}

impl FtdbClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for FtdbClient {
    fn fetch_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("Failed to fetch: {}", url))?
            .error_for_status()
            .with_context(|| format!("Bad status: {}", url))?;

        response
            .json()
            .with_context(|| format!("Failed to parse JSON: {}", url))
    }

    fn fetch_image(&self, url: &str) -> Result<ImageDownload> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("Failed to fetch: {}", url))?
            .error_for_status()
            .with_context(|| format!("Bad status: {}", url))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = response
            .bytes()
            .with_context(|| format!("Failed to read response: {}", url))?;

        Ok(ImageDownload {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Fetch a JSON document and require the FTDB envelope status to be "OK"
pub fn fetch_ok(fetcher: &dyn Fetch, url: &str) -> Result<Value> {
    let value = fetcher.fetch_json(url)?;
    match value.get("status").and_then(Value::as_str) {
        Some("OK") => Ok(value),
        Some(other) => bail!("Unexpected result \"{}\" from {}", other, url),
        None => bail!("Missing status in response from {}", url),
    }
}
