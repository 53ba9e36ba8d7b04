//! Local request endpoint of a running bridge.
//!
//! One JSON request per line in, one JSON reply per line out, over TCP on the
//! configured (loopback) address. Requests are served by the same [`Gateway`] as the
//! loops use, so an SMS retrieval waits on the same port locks instead of racing the
//! telemetry poller from another process.
//!
//! ```text
//! > {"op":"sms","iccid":"89840480001111111111"}
//! < {"ok":{"iccid":"89840480001111111111","phone_number":null,"messages":[...],"rejected":0}}
//! > {"op":"sim","iccid":"0000"}
//! < {"error":"not_found"}
//! ```

use std::io;
use std::net::SocketAddr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::gateway::{Gateway, GatewayError, SimQuery};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Sim {
        iccid: String,
    },
    Sims {
        #[serde(default)]
        com_port: Option<String>,
        #[serde(default)]
        skip: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
    Sms {
        iccid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Error(GatewayError),
}

fn to_value<T: Serialize>(value: T) -> Result<Value, GatewayError> {
    serde_json::to_value(value).map_err(|e| {
        warn!("reply encoding failed: {}", e);
        GatewayError::Failed
    })
}

/// Serve one request through `gateway`.
pub async fn handle(gateway: &Gateway, request: Request) -> Reply {
    let result = match request {
        Request::Sim { iccid } => gateway.sim(&iccid).await.and_then(to_value),
        Request::Sims {
            com_port,
            skip,
            limit,
        } => {
            let query = SimQuery {
                com_port,
                skip,
                limit,
            };
            gateway.sims(&query).await.and_then(to_value)
        }
        Request::Sms { iccid } => gateway.sms(&iccid).await.and_then(to_value),
    };
    match result {
        Ok(value) => Reply::Ok(value),
        Err(e) => Reply::Error(e),
    }
}

pub struct ControlServer {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControlServer {
    pub async fn bind(addr: &str, gateway: Gateway) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (stop, mut stopped) = watch::channel(false);
        info!("Control endpoint listening on {}", local_addr);
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            connections.spawn(serve_connection(stream, peer, gateway.clone()));
                        }
                        Err(e) => warn!("control accept failed: {}", e),
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                    _ = stopped.changed() => break,
                }
            }
            // Abort requests in flight; their port sessions close on drop.
            connections.shutdown().await;
            info!("Control endpoint stopped");
        });
        Ok(Self {
            local_addr,
            stop,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("control endpoint ended abnormally: {}", e);
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, gateway: Gateway) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("{}: read failed: {}", peer, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!("{}: {:?}", peer, request);
                handle(&gateway, request).await
            }
            Err(e) => {
                warn!("{}: bad request: {}", peer, e);
                Reply::Error(GatewayError::BadRequest)
            }
        };
        let mut out = match serde_json::to_string(&reply) {
            Ok(out) => out,
            Err(e) => {
                warn!("{}: reply encoding failed: {}", peer, e);
                break;
            }
        };
        out.push('\n');
        if let Err(e) = write.write_all(out.as_bytes()).await {
            debug!("{}: write failed: {}", peer, e);
            break;
        }
    }
}

/// Client side, used by the CLI to reach a running bridge.
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let (read, write) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    pub async fn call(&mut self, request: &Request) -> io::Result<Reply> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.write.write_all(line.as_bytes()).await?;
        match self.lines.next_line().await? {
            Some(reply) => Ok(serde_json::from_str(&reply)?),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control endpoint closed the connection",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lines_use_an_op_tag() {
        let req: Request = serde_json::from_str(r#"{"op":"sims","com_port":"/dev/ttyUSB0"}"#).unwrap();
        assert_eq!(
            req,
            Request::Sims {
                com_port: Some("/dev/ttyUSB0".into()),
                skip: 0,
                limit: None
            }
        );
        let reply = serde_json::to_string(&Reply::Error(GatewayError::NotFound)).unwrap();
        assert_eq!(reply, r#"{"error":"not_found"}"#);
    }
}
