use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::domain::FetchUnit;
use crate::error::CatalogError;

pub const DEFAULT_URL: &str = "https://cds.climate.copernicus.eu/api";
const REQUEST_TIMEOUT_SECS: u64 = 500;
const MAX_POLL_DELAY_SECS: u64 = 30;

/// Remote data service. One call retrieves one fetch unit into `target`.
pub trait Retriever: Send + Sync {
    fn retrieve(
        &self,
        catalogue_id: &str,
        request: &Value,
        target: &Path,
    ) -> Result<(), CatalogError>;
}

/// Build the request body for one unit from a row's `cds_*` parameters.
pub fn build_request(params: &BTreeMap<String, String>, unit: &FetchUnit) -> Value {
    let mut request = Map::new();
    for (key, value) in params {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let expanded = match (key.as_str(), value) {
            ("day", "all") => string_list((1..=31).map(|day| format!("{day:02}"))),
            ("month", "all") => string_list((1..=12).map(|month| format!("{month:02}"))),
            ("time", "all") => string_list((0..24).map(|hour| format!("{hour:02}:00"))),
            ("variable" | "product_type", _) => string_list(split_list(value)),
            (_, value) if value.contains(',') => string_list(split_list(value)),
            (_, value) => Value::String(value.to_string()),
        };
        request.insert(key.clone(), expanded);
    }

    request.insert("year".to_string(), Value::String(unit.year.to_string()));
    if let Some(month) = unit.month {
        request.insert("month".to_string(), Value::String(format!("{month:02}")));
    }
    Value::Object(request)
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
}

fn string_list(values: impl Iterator<Item = String>) -> Value {
    Value::Array(values.map(Value::String).collect())
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(rename = "jobID")]
    job_id: String,
    status: String,
}

#[derive(Clone)]
pub struct CdsHttpClient {
    client: Client,
    base_url: String,
    poll_delay: Duration,
}

impl CdsHttpClient {
    /// Reads `CDSAPI_URL` and `CDSAPI_KEY` from the environment.
    pub fn from_env() -> Result<Self, CatalogError> {
        let url = std::env::var("CDSAPI_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
        let key = std::env::var("CDSAPI_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());
        if key.is_none() {
            warn!("CDSAPI_KEY is not set; retrievals will be rejected");
        }
        Self::new(&url, key.as_deref())
    }

    pub fn new(base_url: &str, key: Option<&str>) -> Result<Self, CatalogError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("climdata/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CatalogError::CdsRequest(err.to_string()))?,
        );
        if let Some(key) = key {
            headers.insert(
                "PRIVATE-TOKEN",
                HeaderValue::from_str(key.trim())
                    .map_err(|err| CatalogError::CdsRequest(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|err| CatalogError::CdsHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_delay: Duration::from_secs(1),
        })
    }

    fn submit(&self, catalogue_id: &str, request: &Value) -> Result<JobStatus, CatalogError> {
        let url = format!(
            "{}/retrieve/v1/processes/{catalogue_id}/execution",
            self.base_url
        );
        let body = json!({ "inputs": request });
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| CatalogError::CdsHttp(err.to_string()))
    }

    fn wait(&self, mut job: JobStatus) -> Result<String, CatalogError> {
        let url = format!("{}/retrieve/v1/jobs/{}", self.base_url, job.job_id);
        let mut delay = self.poll_delay;
        loop {
            match job.status.as_str() {
                "successful" => return Ok(job.job_id),
                "failed" | "rejected" | "dismissed" => {
                    return Err(CatalogError::CdsRequest(format!(
                        "job {} {}",
                        job.job_id, job.status
                    )));
                }
                other => debug!("job {} is {other}", job.job_id),
            }
            thread::sleep(delay);
            delay = (delay * 2).min(Duration::from_secs(MAX_POLL_DELAY_SECS));

            let response = self.send_with_retries(|| self.client.get(&url))?;
            let response = Self::handle_status(response)?;
            job = response
                .json()
                .map_err(|err| CatalogError::CdsHttp(err.to_string()))?;
        }
    }

    fn download(&self, job_id: &str, target: &Path) -> Result<(), CatalogError> {
        let url = format!("{}/retrieve/v1/jobs/{job_id}/results", self.base_url);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let results: Value = Self::handle_status(response)?
            .json()
            .map_err(|err| CatalogError::CdsHttp(err.to_string()))?;
        let href = results
            .pointer("/asset/value/href")
            .and_then(Value::as_str)
            .ok_or_else(|| CatalogError::CdsRequest(format!("job {job_id} has no asset")))?
            .to_string();

        let response = self.send_with_retries(|| self.client.get(&href))?;
        let mut response = Self::handle_status(response)?;
        let mut file = File::create(target).map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, CatalogError>
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
                    return Err(CatalogError::CdsHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, CatalogError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "CDS request failed".to_string());
        Err(CatalogError::CdsStatus { status, message })
    }
}

impl Retriever for CdsHttpClient {
    fn retrieve(
        &self,
        catalogue_id: &str,
        request: &Value,
        target: &Path,
    ) -> Result<(), CatalogError> {
        let job = self.submit(catalogue_id, request)?;
        let job_id = self.wait(job)?;
        self.download(&job_id, target)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn expands_all_and_lists() {
        let request = build_request(
            &params(&[
                ("variable", "2m_temperature"),
                ("day", "all"),
                ("month", "all"),
                ("time", "all"),
                ("product_type", "reanalysis"),
                ("area", "44, -10, 35, 5"),
                ("data_format", "netcdf"),
            ]),
            &FetchUnit {
                year: 1995,
                month: None,
            },
        );

        assert_eq!(request["variable"], json!(["2m_temperature"]));
        assert_eq!(request["day"].as_array().unwrap().len(), 31);
        assert_eq!(request["month"][11], "12");
        assert_eq!(request["time"][23], "23:00");
        assert_eq!(request["area"], json!(["44", "-10", "35", "5"]));
        assert_eq!(request["data_format"], "netcdf");
        assert_eq!(request["year"], "1995");
    }

    #[test]
    fn monthly_unit_pins_month() {
        let request = build_request(
            &params(&[("month", "all"), ("level", "")]),
            &FetchUnit {
                year: 2001,
                month: Some(3),
            },
        );
        assert_eq!(request["month"], "03");
        assert!(request.get("level").is_none());
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
    }
}
