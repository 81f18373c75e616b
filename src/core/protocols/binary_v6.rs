//! RouterOS v6 binary API driver: plaintext length-prefixed login sentences
//! over TCP.

use async_trait::async_trait;
use log::{debug, trace};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::encoding;
use super::{classify_io_error, ModuleCommon, ModuleOptions, ProtocolError, RouterModule};

const DEFAULT_PORT: u16 = 8728;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The device drops the connection with `!fatal too many commands before
/// login` after the 5th failed attempt, so the driver reconnects once a
/// connection has served this many.
const MAX_ATTEMPTS_PER_CONN: u32 = 4;

pub(crate) struct BinaryV6Module {
    common: ModuleCommon,
    conn: Option<TcpStream>,
    port: u16,
    timeout: Duration,
    attempts_on_conn: u32,
}

impl BinaryV6Module {
    pub(crate) fn new() -> Self {
        Self {
            common: ModuleCommon::default(),
            conn: None,
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            attempts_on_conn: 0,
        }
    }

    async fn send_login(&mut self, password: &str) -> Result<bool, ProtocolError> {
        let command = build_login_sentence(self.common.username(), password);
        let target = self.common.target().to_string();

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ProtocolError::Protocol("not connected".to_string()))?;

        match timeout(self.timeout, conn.write_all(&command)).await {
            Err(_) => return Err(ProtocolError::Timeout),
            Ok(Err(e)) => return Err(classify_io_error(&target, &e)),
            Ok(Ok(())) => {}
        }

        let mut buf = [0u8; 4096];
        let n = match timeout(self.timeout, conn.read(&mut buf)).await {
            Err(_) => return Err(ProtocolError::Timeout),
            Ok(Err(e)) => return Err(classify_io_error(&target, &e)),
            Ok(Ok(0)) => {
                return Err(ProtocolError::Transient("EOF".to_string()));
            }
            Ok(Ok(n)) => n,
        };

        let words = encoding::decode_words(&buf[..n])?;
        trace!("login response words: {words:?}");
        evaluate_response(&words)
    }
}

fn build_login_sentence(username: &str, password: &str) -> Vec<u8> {
    encoding::encode_sentence(&[
        "/login",
        &format!("=name={username}"),
        &format!("=password={password}"),
    ])
}

/// `Ok(true)` on `!done`/`=ret=`, `Ok(false)` on `!trap`/`!fatal`, protocol
/// error on anything else.
fn evaluate_response(words: &[String]) -> Result<bool, ProtocolError> {
    if words.is_empty() {
        return Err(ProtocolError::Protocol("empty response".to_string()));
    }

    if words.iter().any(|w| w == "!trap" || w == "!fatal") {
        if let Some(message) = words
            .iter()
            .find_map(|w| w.strip_prefix("=message="))
        {
            trace!("authentication rejected: {message}");
        }
        return Ok(false);
    }

    if words
        .iter()
        .any(|w| w == "!done" || w.starts_with("=ret="))
    {
        return Ok(true);
    }

    Err(ProtocolError::Protocol(format!(
        "unexpected response: {words:?}"
    )))
}

#[async_trait]
impl RouterModule for BinaryV6Module {
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
        self.common.initialize(target, username);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.common.is_connected() {
            return Ok(());
        }

        let address = format!("{}:{}", self.common.target(), self.port);
        let conn = match timeout(self.timeout, TcpStream::connect(&address)).await {
            Err(_) => return Err(ProtocolError::Timeout),
            Ok(Err(e)) => {
                return Err(ProtocolError::Connection {
                    target: self.common.target().to_string(),
                    detail: e.to_string(),
                })
            }
            Ok(Ok(conn)) => conn,
        };

        self.conn = Some(conn);
        self.common.set_connected(true);
        self.attempts_on_conn = 0;
        Ok(())
    }

    async fn authenticate(&mut self, password: &str) -> Result<bool, ProtocolError> {
        // Reconnect before the device's per-connection attempt limit hits.
        if self.common.is_connected() && self.attempts_on_conn >= MAX_ATTEMPTS_PER_CONN {
            debug!(
                "reconnecting to {} after {} attempts on this connection",
                self.common.target(),
                self.attempts_on_conn
            );
            self.close().await?;
        }

        if !self.common.is_connected() {
            self.connect().await?;
        }

        self.attempts_on_conn += 1;

        match self.send_login(password).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Whatever went wrong, the connection state is suspect.
                self.close().await?;
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.shutdown().await;
        }
        self.common.set_connected(false);
        self.attempts_on_conn = 0;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn protocol_name(&self) -> &'static str {
        "binary-v6"
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
