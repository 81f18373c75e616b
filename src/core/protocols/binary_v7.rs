//! RouterOS v7 WebFig driver: encrypted session over HTTP against
//! `/jsproxy`. Each authentication attempt negotiates a fresh session; the
//! heavy lifting lives in the `webfig` module.

use async_trait::async_trait;
use log::trace;
use std::time::Duration;

use super::webfig;
use super::{ModuleCommon, ModuleOptions, ProtocolError, RouterModule};

const DEFAULT_PORT: u16 = 8729;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct BinaryV7Module {
    common: ModuleCommon,
    client: Option<reqwest::Client>,
    url: String,
    port: u16,
    timeout: Duration,
}

impl BinaryV7Module {
    pub(crate) fn new() -> Self {
        Self {
            common: ModuleCommon::default(),
            client: None,
            url: String::new(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl RouterModule for BinaryV7Module {
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

        let scheme = if self.port == 443 { "https" } else { "http" };
        self.url = format!("{scheme}://{target}:{}/jsproxy", self.port);

        self.client = Some(
            reqwest::Client::builder()
                .build()
                .map_err(|e| ProtocolError::Config(e.to_string()))?,
        );

        self.common.initialize(target, username);
        trace!("session endpoint {}", self.url);
        Ok(())
    }

    /// The session is negotiated per attempt; connecting only marks the
    /// module ready.
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.common.set_connected(true);
        Ok(())
    }

    async fn authenticate(&mut self, password: &str) -> Result<bool, ProtocolError> {
        if !self.common.is_connected() {
            self.connect().await?;
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ProtocolError::Config("module not initialized".to_string()))?;
        let target = self.common.target().to_string();

        let session = webfig::negotiate(client, &self.url, &target, self.timeout).await?;
        let Some(mut session) = session else {
            // The peer answered but not with a valid handshake; counts as a
            // rejected attempt, not a fault.
            return Ok(false);
        };

        webfig::login(
            client,
            &self.url,
            &target,
            self.timeout,
            &mut session,
            self.common.username(),
            password,
        )
        .await
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.common.set_connected(false);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn protocol_name(&self) -> &'static str {
        "binary-v7"
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
