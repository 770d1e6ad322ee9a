use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::HeadBagInfo;
use crate::error::PrepError;

/// The service that holds preserved bags for distribution.
pub trait DistribClient: Send + Sync {
    /// Describe the head bag for a version of a dataset (`None` meaning the
    /// latest). Returns `Ok(None)` if the service knows no such bag.
    fn describe_head_for_version(
        &self,
        aipid: &str,
        version: Option<&str>,
    ) -> Result<Option<HeadBagInfo>, PrepError>;

    /// Download the named bag into `dest_dir` under the same name.
    fn save_bag(&self, name: &str, dest_dir: &Utf8Path) -> Result<(), PrepError>;
}

#[derive(Clone)]
pub struct DistribHttpClient {
    client: Client,
    base_url: String,
}

impl DistribHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PrepError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pdr-prepupd/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PrepError::Config(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| PrepError::DistribHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn head_url(&self, aipid: &str, version: Option<&str>) -> String {
        let version = version.filter(|v| !v.is_empty()).unwrap_or("latest");
        format!("{}/_aip/{aipid}/_v/{version}/_head", self.base_url)
    }

    fn bag_url(&self, name: &str) -> String {
        format!("{}/_aip/_bag/{name}", self.base_url)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, PrepError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "distribution request failed".to_string());
        Err(PrepError::DistribStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, PrepError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
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
                    return Err(PrepError::DistribHttp(err.to_string()));
                }
            }
        }
    }
}

impl DistribClient for DistribHttpClient {
    fn describe_head_for_version(
        &self,
        aipid: &str,
        version: Option<&str>,
    ) -> Result<Option<HeadBagInfo>, PrepError> {
        let url = self.head_url(aipid, version);
        tracing::debug!(%url, "describing head bag");
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::handle_status(response)?;
        let info = response
            .json::<HeadBagInfo>()
            .map_err(|err| PrepError::DistribHttp(format!("{url}: {err}")))?;
        Ok(Some(info))
    }

    fn save_bag(&self, name: &str, dest_dir: &Utf8Path) -> Result<(), PrepError> {
        let url = self.bag_url(name);
        let destination = dest_dir.join(name);
        tracing::info!(%url, %destination, "fetching head bag");
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let mut response = Self::handle_status(response)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(dest_dir.as_std_path())
            .map_err(|err| PrepError::fs(format!("create temp file in {dest_dir}"), err))?;
        std::io::copy(&mut response, temp.as_file_mut())
            .map_err(|err| PrepError::fs(format!("write {destination}"), err))?;
        temp.persist(destination.as_std_path())
            .map_err(|err| PrepError::fs(format!("persist {destination}"), err.error))?;
        Ok(())
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub(crate) fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
