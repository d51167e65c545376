//! Control channel client
//!
//! The anonymizing network exposes an administrative line protocol over a
//! local socket: commands out, coded replies back. The channel is only
//! usable after authentication, so the authenticated state is modeled as
//! an explicit [`ControlSession`] value. Collaborators receive a
//! session, never a raw link.
//!
//! The [`ControlLink`] trait is the seam for tests: production speaks TCP,
//! tests use the in-memory link from [`crate::memory`].

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Error, Debug)]
pub enum ControlError {
    /// Authentication rejected. Fatal: the process cannot provision
    /// network identities without an authenticated control channel.
    #[error("control channel authentication rejected")]
    AuthRejected,

    /// The channel answered with a failure code. Retryable with backoff;
    /// exhaustion fails the current launch attempt only.
    #[error("control channel error {code}: {message}")]
    Channel { code: u16, message: String },

    #[error("control channel i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control operation timed out")]
    Timeout,

    #[error("malformed control reply: {0}")]
    Malformed(String),
}

impl ControlError {
    /// Whether retrying the command can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ControlError::Io(_) | ControlError::Timeout => true,
            // 550/551: unspecified or internal failure, worth retrying.
            // Everything else (syntax, bad key, unknown entity) is not.
            ControlError::Channel { code, .. } => matches!(code, 550 | 551),
            ControlError::AuthRejected | ControlError::Malformed(_) => false,
        }
    }
}

const STATUS_OK: u16 = 250;
const STATUS_AUTH_REQUIRED: u16 = 514;
const STATUS_AUTH_REJECTED: u16 = 515;
const STATUS_UNKNOWN_SERVICE: u16 = 552;

/// A parsed control reply: final status code plus all data lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.code == STATUS_OK
    }

    pub fn is_auth_failure(&self) -> bool {
        self.code == STATUS_AUTH_REQUIRED || self.code == STATUS_AUTH_REJECTED
    }

    pub fn is_unknown_service(&self) -> bool {
        self.code == STATUS_UNKNOWN_SERVICE
    }

    /// Value of a `KEY=value` data line, if present.
    pub fn field(&self, key: &str) -> Option<&str> {
        let prefix = format!("{key}=");
        self.lines
            .iter()
            .find_map(|line| line.strip_prefix(&prefix))
    }

    fn failure(&self) -> ControlError {
        if self.is_auth_failure() {
            ControlError::AuthRejected
        } else {
            ControlError::Channel {
                code: self.code,
                message: self.lines.join("; "),
            }
        }
    }
}

/// One command/reply exchange on the control channel.
#[async_trait::async_trait]
pub trait ControlLink: Send {
    async fn send_command(&mut self, command: &str) -> Result<Reply, ControlError>;
}

/// Production control link over a local TCP socket.
pub struct TcpControlLink {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TcpControlLink {
    pub async fn connect(addr: &str) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
        })
    }

    async fn read_reply(&mut self) -> Result<Reply, ControlError> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(ControlError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "control channel closed",
                )));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 4 {
                return Err(ControlError::Malformed(line.to_string()));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| ControlError::Malformed(line.to_string()))?;
            let separator = &line[3..4];
            let body = &line[4..];
            if !body.is_empty() {
                lines.push(body.to_string());
            }
            match separator {
                // Mid-reply lines.
                "-" | "+" => continue,
                // Final line carries the status code.
                " " => return Ok(Reply { code, lines }),
                _ => return Err(ControlError::Malformed(line.to_string())),
            }
        }
    }
}

#[async_trait::async_trait]
impl ControlLink for TcpControlLink {
    async fn send_command(&mut self, command: &str) -> Result<Reply, ControlError> {
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.writer.flush().await?;
        self.read_reply().await
    }
}

/// An authenticated control session.
pub struct ControlSession<L: ControlLink> {
    link: L,
}

impl<L: ControlLink> ControlSession<L> {
    /// Authenticate with the process-scoped credential. Rejection is
    /// fatal; there is no retry for a wrong credential.
    pub async fn authenticate(mut link: L, password: &str) -> Result<Self, ControlError> {
        let reply = link
            .send_command(&format!("AUTHENTICATE \"{password}\""))
            .await?;
        if !reply.is_ok() {
            return Err(reply.failure());
        }
        Ok(Self { link })
    }

    /// Provision an onion service, returning `(service id, key blob)`.
    /// With `Some(key)` the service (and thus its address) is
    /// re-created deterministically; with `None` a fresh key is minted
    /// and its blob returned for persistence.
    pub async fn add_onion(
        &mut self,
        key_blob: Option<&str>,
        virt_port: u16,
        target_port: u16,
    ) -> Result<(String, String), ControlError> {
        let key_spec = match key_blob {
            Some(blob) => format!("ED25519-V3:{blob}"),
            None => "NEW:ED25519-V3".to_string(),
        };
        let command =
            format!("ADD_ONION {key_spec} Flags=Detach Port={virt_port},127.0.0.1:{target_port}");
        let reply = self.link.send_command(&command).await?;
        if !reply.is_ok() {
            return Err(reply.failure());
        }

        let service_id = reply
            .field("ServiceID")
            .ok_or_else(|| ControlError::Malformed("reply missing ServiceID".into()))?
            .to_string();
        // The channel omits the key when the caller supplied it.
        let returned_key = reply
            .field("PrivateKey")
            .map(|k| k.trim_start_matches("ED25519-V3:").to_string());
        let blob = match (returned_key, key_blob) {
            (Some(blob), _) => blob,
            (None, Some(blob)) => blob.to_string(),
            (None, None) => {
                return Err(ControlError::Malformed("reply missing PrivateKey".into()))
            }
        };
        Ok((service_id, blob))
    }

    /// Tear down an onion service. Returns whether it existed; "already
    /// absent" counts as success.
    pub async fn del_onion(&mut self, service_id: &str) -> Result<bool, ControlError> {
        let reply = self
            .link
            .send_command(&format!("DEL_ONION {service_id}"))
            .await?;
        if reply.is_ok() {
            return Ok(true);
        }
        if reply.is_unknown_service() {
            return Ok(false);
        }
        Err(reply.failure())
    }
}
