// src/simulator.rs - BF-2300 box simulator
//!
//! The box side of the protocol: accepts connections, answers each Read
//! Digital I/O request with an Auto Report of the current levels. Used by the
//! `bf2300_sim` binary and by integration tests.

use crate::error::{MonitorError, Result};
use crate::protocols::{Bf2300Codec, Command, Frame, BLOCK_LEN};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the simulator answers requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimMode {
    #[default]
    Normal,
    /// Accept and read requests, never answer
    Mute,
    /// Send a frame with an unassigned command before every Auto Report
    UnknownCommandFirst,
    /// Answer with an Auto Report whose checksum is off by one
    CorruptChecksum,
}

#[derive(Debug, Default)]
struct SimState {
    inputs: RwLock<[bool; BLOCK_LEN]>,
    outputs: RwLock<[bool; BLOCK_LEN]>,
    mode: RwLock<SimMode>,
    requests: AtomicU64,
}

impl SimState {
    fn report(&self) -> Frame {
        Frame::auto_report(&*self.inputs.read(), &*self.outputs.read())
    }
}

pub struct BoxSimulator {
    local_addr: SocketAddr,
    state: Arc<SimState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BoxSimulator {
    /// Bind and start serving. Use port 0 for an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(SimState::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, state.clone(), cancel.clone()));
        info!(%local_addr, "BF-2300 simulator listening");
        Ok(Self {
            local_addr,
            state,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Set the level of a 1-based input pin
    pub fn set_input(&self, pin: u8, level: bool) -> Result<()> {
        let index = pin_index(pin)?;
        self.state.inputs.write()[index] = level;
        debug!(pin, level, "simulator input set");
        Ok(())
    }

    pub fn input(&self, pin: u8) -> Option<bool> {
        pin_index(pin).ok().map(|i| self.state.inputs.read()[i])
    }

    pub fn set_output(&self, pin: u8, level: bool) -> Result<()> {
        let index = pin_index(pin)?;
        self.state.outputs.write()[index] = level;
        Ok(())
    }

    pub fn set_mode(&self, mode: SimMode) {
        *self.state.mode.write() = mode;
    }

    pub fn mode(&self) -> SimMode {
        *self.state.mode.read()
    }

    /// Read Digital I/O requests received so far
    pub fn requests(&self) -> u64 {
        self.state.requests.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Simulator task ended abnormally: {}", e);
        }
    }
}

fn pin_index(pin: u8) -> Result<usize> {
    match usize::from(pin) {
        p @ 1..=BLOCK_LEN => Ok(p - 1),
        _ => Err(MonitorError::Config(format!("pin {} outside 1..={}", pin, BLOCK_LEN))),
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<SimState>, cancel: CancellationToken) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Simulator accept failed: {}", e);
                    continue;
                }
            },
        };
        debug!(%peer, "simulator connection");
        let state = state.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = serve(socket, state) => {
                    if let Err(e) = result {
                        debug!(%peer, "simulator connection closed: {}", e);
                    }
                }
            }
        });
    }
}

async fn serve(socket: TcpStream, state: Arc<SimState>) -> Result<()> {
    let mut framed = Framed::new(socket, Bf2300Codec);

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        if frame.command != Command::ReadDigitalIo {
            warn!(command = frame.command.code(), "simulator ignoring unexpected command");
            continue;
        }
        state.requests.fetch_add(1, Ordering::Relaxed);

        let mode = *state.mode.read();
        match mode {
            SimMode::Normal => framed.send(state.report()).await?,
            SimMode::Mute => {}
            SimMode::UnknownCommandFirst => {
                framed.send(Frame::new(Command::Other(0x00FE), b"sim", &[])?).await?;
                framed.send(state.report()).await?;
            }
            SimMode::CorruptChecksum => {
                let mut bytes = state.report().to_bytes();
                let last = bytes.len() - 1;
                bytes[last] = bytes[last].wrapping_add(1);
                framed.get_mut().write_all(&bytes).await?;
            }
        }
    }
    Ok(())
}
