use std::time::Duration;

use carve_core::callback::CallbackPayload;
use carve_core::error::AppError;
use carve_core::traits::Notifier;
use reqwest::Client;

use crate::fetcher::validate_url;

/// Posts terminal-status callbacks as JSON.
///
/// Any non-2xx answer is an error; retries are the caller's business.
/// Callback URLs get the same SSRF check as fetched pages unless
/// [`allow_private_urls`](Self::allow_private_urls) is set.
#[derive(Clone)]
pub struct ReqwestNotifier {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestNotifier {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("Carve/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    /// Allow callbacks to private/reserved addresses.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl Notifier for ReqwestNotifier {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<(), AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else {
                    AppError::NetworkError(format!("Callback to {url} failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}
