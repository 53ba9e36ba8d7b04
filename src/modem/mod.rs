//! # AT channel
//!
//! One [`AtChannel`] owns one open serial endpoint and runs strictly sequential
//! request/response exchanges over it. An exchange writes the command followed by a
//! carriage return, then polls the link and accumulates bytes in a
//! [`framer::ResponseFramer`] until a terminal token shows up or the deadline passes.
//!
//! The protocol carries no length and no guaranteed terminator, so completion is a
//! substring match over the accumulated text. A token occurring inside message content
//! (an SMS body reading "OK") ends the exchange early; decoders tolerate the noise.
//!
//! Callers serialise access per port (see `fleet::ports::PortLocks`); the channel has no
//! queue of its own.

pub mod decode;
pub mod framer;
pub mod link;
pub mod mock;
pub mod sms;
#[cfg(feature = "serial")]
pub mod system;
pub mod ussd;

use std::time::Duration;

use log::{debug, trace, warn};
use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::logutil::escape_log;
use crate::metrics;
use crate::retry::{self, RetryError, RetryPolicy, Transient};
use framer::ResponseFramer;
use link::{LinkProvider, OpenError, SerialLink};

pub const AT: &str = "AT";
pub const CPIN: &str = "AT+CPIN?";
pub const CREG: &str = "AT+CREG?";
pub const COPS: &str = "AT+COPS?";
pub const CCID: &str = "AT+CCID";
pub const CSQ: &str = "AT+CSQ";
pub const CIMI: &str = "AT+CIMI";
pub const CSCS_QUERY: &str = "AT+CSCS?";
pub const CSCS_GSM: &str = "AT+CSCS=\"GSM\"";
pub const CMGF_TEXT: &str = "AT+CMGF=1";
pub const CPMS_SIM: &str = "AT+CPMS=\"SM\"";
pub const CMGL_ALL: &str = "AT+CMGL=\"ALL\"";

/// Terminal tokens of an ordinary command.
pub const DEFAULT_TERMINALS: &[&str] = &["OK", "ERROR"];

/// Pause between empty reads while waiting for a response.
const IDLE_POLL: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 512;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The device node does not exist; the port should be forgotten.
    #[error("port {0} not found")]
    NotFound(String),
    #[error("could not open {port} after {attempts} attempt(s): {last}")]
    ConnectFailed {
        port: String,
        attempts: u32,
        last: OpenError,
    },
}

impl ChannelError {
    /// The underlying open error, for readiness reporting.
    pub fn open_error(&self) -> Option<&OpenError> {
        match self {
            ChannelError::NotFound(_) => None,
            ChannelError::ConnectFailed { last, .. } => Some(last),
        }
    }
}

impl Transient for OpenError {
    fn is_transient(&self) -> bool {
        !matches!(self, OpenError::NotFound(_))
    }
}

/// Outcome of one exchange. `response` is `None` when no terminal token arrived in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub response: Option<String>,
    pub elapsed: Duration,
}

impl Exchange {
    fn silent(elapsed: Duration) -> Self {
        Self {
            response: None,
            elapsed,
        }
    }

    /// True when the modem answered with `OK` somewhere in the response.
    pub fn is_ok(&self) -> bool {
        self.response.as_deref().is_some_and(|r| r.contains("OK"))
    }

    pub fn text(&self) -> Option<&str> {
        self.response.as_deref()
    }
}

pub struct AtChannel {
    port_id: String,
    link: Option<Box<dyn SerialLink>>,
    command_timeout: Duration,
}

impl std::fmt::Debug for AtChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtChannel")
            .field("port_id", &self.port_id)
            .field("open", &self.link.is_some())
            .finish()
    }
}

impl AtChannel {
    /// Open `port_id`, retrying transient failures under `policy`.
    ///
    /// `NotFound` is returned at once. Any other failure is retried until the policy is
    /// exhausted, which yields [`ChannelError::ConnectFailed`].
    pub async fn open(
        provider: &dyn LinkProvider,
        port_id: &str,
        baud_rate: u32,
        policy: &RetryPolicy,
        command_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let label = format!("open {}", port_id);
        let result = retry::run(policy, &label, |_| async move {
            provider.open(port_id, baud_rate)
        })
        .await;
        match result {
            Ok(link) => {
                debug!("{}: channel open", port_id);
                Ok(Self {
                    port_id: port_id.to_string(),
                    link: Some(link),
                    command_timeout,
                })
            }
            Err(RetryError::Fatal(_)) => {
                metrics::inc_open_failures();
                Err(ChannelError::NotFound(port_id.to_string()))
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                metrics::inc_open_failures();
                warn!("{}: giving up after {} attempt(s): {}", port_id, attempts, last);
                Err(ChannelError::ConnectFailed {
                    port: port_id.to_string(),
                    attempts,
                    last,
                })
            }
        }
    }

    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Run an ordinary command with the default deadline and terminal tokens.
    pub async fn command(&mut self, command: &str) -> Exchange {
        let timeout = self.command_timeout;
        self.execute(command, timeout, DEFAULT_TERMINALS).await
    }

    /// Send `command` and collect the response until a token in `terminals` appears or
    /// `timeout` elapses. A timeout, a closed channel and an I/O failure all yield an
    /// exchange without a response.
    pub async fn execute(&mut self, command: &str, timeout: Duration, terminals: &[&str]) -> Exchange {
        let started = Instant::now();
        let deadline = started + timeout;
        let Some(link) = self.link.as_mut() else {
            warn!("{}: {} on closed channel", self.port_id, command);
            return Exchange::silent(Duration::ZERO);
        };

        if let Err(e) = link.clear_input() {
            debug!("{}: could not clear input: {}", self.port_id, e);
        }
        trace!("{} >> {}", self.port_id, command);
        if let Err(e) = link.send(format!("{}\r", command).as_bytes()) {
            warn!("{}: write of {} failed: {}", self.port_id, command, e);
            metrics::observe_exchange(started.elapsed(), false);
            return Exchange::silent(started.elapsed());
        }

        let mut framer = ResponseFramer::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let (done, idle) = match link.receive(&mut buf) {
                // Quiet link: a bare token on an unterminated last line also ends it.
                Ok(0) => (framer.is_complete_when_quiet(terminals), true),
                Ok(n) => {
                    framer.push(&buf[..n]);
                    (framer.is_complete(terminals), false)
                }
                Err(e) => {
                    warn!("{}: read during {} failed: {}", self.port_id, command, e);
                    break;
                }
            };
            if done {
                let elapsed = started.elapsed();
                let response = framer.take();
                trace!("{} << {} ({:?})", self.port_id, escape_log(&response), elapsed);
                metrics::observe_exchange(elapsed, true);
                return Exchange {
                    response: Some(response),
                    elapsed,
                };
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if idle {
                sleep(IDLE_POLL.min(deadline - now)).await;
            } else {
                tokio::task::yield_now().await;
            }
        }

        let elapsed = started.elapsed();
        if framer.is_empty() {
            debug!("{}: no response to {} within {:?}", self.port_id, command, timeout);
        } else {
            debug!(
                "{}: {} unterminated after {:?}: {}",
                self.port_id,
                command,
                timeout,
                escape_log(&framer.text())
            );
        }
        metrics::observe_exchange(elapsed, false);
        Exchange::silent(elapsed)
    }

    /// Release the handle. Calling it again, or dropping afterwards, is a no-op.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!("{}: channel closed", self.port_id);
        }
    }
}

impl Drop for AtChannel {
    fn drop(&mut self) {
        self.close();
    }
}
