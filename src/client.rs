// src/client.rs - One request/response exchange with a BF-2300 box
use crate::error::{MonitorError, Result};
use crate::protocols::{AutoReport, Bf2300Codec, Command, Frame};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::Framed;
use tracing::{trace, warn};

/// Reads the current input levels of a box.
///
/// Implementations never retry; the poller owns that policy.
#[async_trait]
pub trait BoxClient: Send + Sync {
    async fn poll(&self, addr: SocketAddr) -> Result<AutoReport>;
}

/// TCP client opening a fresh connection per exchange.
///
/// The socket is closed as soon as the response arrives or the exchange fails,
/// so an unreachable box never holds an idle connection.
#[derive(Debug, Clone)]
pub struct TcpBoxClient {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpBoxClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => return Err(MonitorError::ConnectTimeout { addr }),
            Ok(Err(e)) => return Err(io_error(addr, e)),
            Ok(Ok(stream)) => stream,
        };
        if let Err(e) = stream.set_nodelay(true) {
            trace!(%addr, "set_nodelay failed: {}", e);
        }
        Ok(stream)
    }
}

#[async_trait]
impl BoxClient for TcpBoxClient {
    async fn poll(&self, addr: SocketAddr) -> Result<AutoReport> {
        let stream = self.connect(addr).await?;
        let mut framed = Framed::new(stream, Bf2300Codec);

        let deadline = Instant::now() + self.read_timeout;
        match timeout_at(deadline, framed.send(Frame::read_digital_io())).await {
            Err(_) => return Err(MonitorError::ReadTimeout { addr }),
            Ok(result) => result.map_err(|e| transport_error(addr, e))?,
        }
        trace!(%addr, "request sent");

        loop {
            let frame = match timeout_at(deadline, framed.next()).await {
                Err(_) => return Err(MonitorError::ReadTimeout { addr }),
                Ok(None) => {
                    return Err(MonitorError::Network {
                        addr,
                        message: "connection closed before a response arrived".into(),
                    })
                }
                Ok(Some(result)) => result.map_err(|e| transport_error(addr, e))?,
            };

            match frame.command {
                Command::AutoReport => return AutoReport::from_frame(&frame),
                other => {
                    warn!(%addr, "{}; frame discarded", MonitorError::UnknownCommand(other.code()));
                }
            }
        }
    }
}

fn io_error(addr: SocketAddr, e: io::Error) -> MonitorError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => MonitorError::ConnectionRefused { addr },
        io::ErrorKind::TimedOut => MonitorError::ConnectTimeout { addr },
        _ => MonitorError::Network {
            addr,
            message: e.to_string(),
        },
    }
}

/// Codec errors keep frame problems typed; socket errors become `Network`.
fn transport_error(addr: SocketAddr, e: MonitorError) -> MonitorError {
    match e {
        MonitorError::Io(io) => MonitorError::Network {
            addr,
            message: io.to_string(),
        },
        other => other,
    }
}
