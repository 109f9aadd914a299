use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;

use crate::{BatchgateError, Result};

pub(crate) const USER_AGENT: &str = concat!("batchgate/", env!("CARGO_PKG_VERSION"));

const MAX_ATTEMPTS: u32 = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Retrying transport shared by every upstream call. Transport failures and
/// retriable statuses (408, 429, 5xx) back off exponentially with factor 1.5
/// from a one-second base; any other non-2xx status fails immediately with
/// the status and body attached.
#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub(crate) fn new() -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    pub(crate) async fn execute<F>(&self, build: F) -> Result<Bytes>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            let response = match build(&self.http).send().await {
                Ok(response) => response,
                Err(err) => {
                    last_error = Some(BatchgateError::Http(err));
                    continue;
                }
            };

            let status = response.status();
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    last_error = Some(BatchgateError::Http(err));
                    continue;
                }
            };

            if is_retriable(status) {
                last_error = Some(BatchgateError::Api {
                    status,
                    body: String::from_utf8_lossy(&bytes).to_string(),
                });
                continue;
            }
            if !status.is_success() {
                return Err(BatchgateError::Api {
                    status,
                    body: String::from_utf8_lossy(&bytes).to_string(),
                });
            }
            return Ok(bytes);
        }

        Err(last_error.unwrap_or_else(|| {
            BatchgateError::Upstream("request failed with no recorded error".to_string())
        }))
    }
}

fn is_retriable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429) || status.is_server_error()
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs_f64(1.5f64.powi(attempt as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_statuses() {
        for code in [408u16, 429, 500, 502, 503, 504, 599] {
            assert!(is_retriable(StatusCode::from_u16(code).unwrap()), "{code}");
        }
        for code in [200u16, 201, 400, 401, 404, 422] {
            assert!(!is_retriable(StatusCode::from_u16(code).unwrap()), "{code}");
        }
    }

    #[test]
    fn backoff_grows_by_half() {
        assert_eq!(backoff(1), Duration::from_secs_f64(1.5));
        assert_eq!(backoff(2), Duration::from_secs_f64(2.25));
    }
}
