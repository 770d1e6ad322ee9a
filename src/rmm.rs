use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::distrib::{is_retryable_error, is_retryable_status};
use crate::error::PrepError;
use crate::fs_util::ensure_dir;
use crate::nerdm::write_json;

/// The public metadata service (resource metadata manager).
pub trait MetadataClient: Send + Sync {
    /// The published NERDm record for an identifier, or `Ok(None)` if the
    /// identifier is unknown.
    fn describe(&self, aipid: &str) -> Result<Option<Value>, PrepError>;
}

#[derive(Clone)]
pub struct MetadataHttpClient {
    client: Client,
    base_url: String,
}

impl MetadataHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PrepError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pdr-prepupd/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PrepError::Config(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| PrepError::MetadataHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn record_url(&self, aipid: &str) -> String {
        format!("{}/records/{aipid}", self.base_url)
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, PrepError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    if attempt < MAX_RETRIES && is_retryable_status(resp.status().as_u16()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(PrepError::MetadataHttp(err.to_string()));
                }
            }
        }
    }
}

impl MetadataClient for MetadataHttpClient {
    fn describe(&self, aipid: &str) -> Result<Option<Value>, PrepError> {
        let url = self.record_url(aipid);
        tracing::debug!(%url, "describing dataset");
        let response = self.send_with_retries(&url)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "metadata request failed".to_string());
            return Err(PrepError::MetadataStatus { status, message });
        }
        let record: Value = response
            .json()
            .map_err(|err| PrepError::MetadataHttp(format!("{url}: {err}")))?;
        Ok(Some(record))
    }
}

/// Local copies of published NERDm records, one `<aipid>.json` per dataset.
pub struct RecordCache<M: MetadataClient> {
    dir: Utf8PathBuf,
    client: Option<Arc<M>>,
}

impl<M: MetadataClient> RecordCache<M> {
    pub fn new(dir: &Utf8Path, client: Option<Arc<M>>) -> Result<Self, PrepError> {
        ensure_dir(dir, "RecordCache")?;
        Ok(Self {
            dir: dir.to_path_buf(),
            client,
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn record_file(&self, aipid: &str) -> Utf8PathBuf {
        self.dir.join(format!("{aipid}.json"))
    }

    /// The cached record file, if one is present; never consults the service.
    pub fn cached(&self, aipid: &str) -> Option<Utf8PathBuf> {
        let path = self.record_file(aipid);
        path.as_std_path().is_file().then_some(path)
    }

    /// The cached record file, fetching it first if it is not yet cached.
    pub fn cache_record(&self, aipid: &str) -> Result<Option<Utf8PathBuf>, PrepError> {
        if let Some(path) = self.cached(aipid) {
            return Ok(Some(path));
        }
        Ok(self.refresh(aipid)?.map(|_| self.record_file(aipid)))
    }

    /// Fetch the published record and replace the cached copy with it.
    pub fn refresh(&self, aipid: &str) -> Result<Option<Value>, PrepError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let Some(record) = client.describe(aipid)? else {
            return Ok(None);
        };
        write_json(&self.record_file(aipid), &record)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_url_joins_cleanly() {
        let client =
            MetadataHttpClient::new("https://data.nist.gov/rmm/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.record_url("mds2-2106"),
            "https://data.nist.gov/rmm/records/mds2-2106"
        );
    }
}
