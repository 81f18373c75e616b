//! RouterOS v7 REST driver: HTTP Basic authentication probed against the
//! JSON resource endpoint.

use async_trait::async_trait;
use log::trace;
use std::time::Duration;

use super::webfig::classify_reqwest_error;
use super::{ModuleCommon, ModuleOptions, ProtocolError, RouterModule};

const DEFAULT_PORT: u16 = 80;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct RestV7Module {
    common: ModuleCommon,
    client: Option<reqwest::Client>,
    base_url: String,
    use_https: bool,
    port: u16,
    timeout: Duration,
}

impl RestV7Module {
    pub(crate) fn new() -> Self {
        Self {
            common: ModuleCommon::default(),
            client: None,
            base_url: String::new(),
            use_https: false,
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl RouterModule for RestV7Module {
    fn initialize(
        &mut self,
        target: &str,
        username: &str,
        options: &ModuleOptions,
    ) -> Result<(), ProtocolError> {
        if let Some(port) = options.port {
            self.port = port;
        }
        if let Some(t) = options.timeout {
            self.timeout = t;
        }
        self.use_https = options.https;
        if self.use_https && self.port == DEFAULT_PORT {
            self.port = 443;
        }

        let scheme = if self.use_https { "https" } else { "http" };
        let target = target.trim_end_matches('/');
        self.base_url = format!("{scheme}://{target}:{}/rest", self.port);

        self.client = Some(
            reqwest::Client::builder()
                .build()
                .map_err(|e| ProtocolError::Config(e.to_string()))?,
        );

        self.common.initialize(target, username);
        trace!("REST base URL {}", self.base_url);
        Ok(())
    }

    /// Stateless transport; the client pool connects on first request.
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.common.set_connected(true);
        Ok(())
    }

    async fn authenticate(&mut self, password: &str) -> Result<bool, ProtocolError> {
        // Fresh logical connection per attempt; there is no session to
        // carry over.
        if self.common.is_connected() {
            self.close().await?;
        }
        self.connect().await?;

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ProtocolError::Config("module not initialized".to_string()))?;
        let target = self.common.target().to_string();
        let url = format!("{}/system/resource", self.base_url);

        let response = match client
            .get(&url)
            .basic_auth(self.common.username(), Some(password))
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Some transports surface the auth failure as an error
                // rather than a status code.
                let text = e.to_string();
                if text.contains("401") || text.contains("Unauthorized") {
                    return Ok(false);
                }
                return Err(classify_reqwest_error(&target, &e));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(false);
        }
        if status != reqwest::StatusCode::OK {
            return Err(ProtocolError::Protocol(format!(
                "REST request failed with status {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&target, &e))?;
        if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
            return Err(ProtocolError::Protocol(
                "invalid REST response format".to_string(),
            ));
        }
        Ok(true)
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.common.set_connected(false);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn protocol_name(&self) -> &'static str {
        "rest-v7"
    }

    fn target(&self) -> &str {
        self.common.target()
    }

    fn username(&self) -> &str {
        self.common.username()
    }

    fn is_connected(&self) -> bool {
        self.common.is_connected()
    }
}
