// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unix-domain-socket transport, used against simulators.
//!
//! Writes are fire-and-ack; reads block until the matching
//! read-response is dequeued. Asynchronous IRQ frames may arrive
//! interleaved with responses at any time — they accumulate into a
//! pending mask consumed by `wait_irq`. A shutdown frame marks the
//! peer gone; every later operation fails with `NotConnected`.

use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use log::{debug, info};

use emu_proto::{msg, Frame, FRAME_LEN};

use crate::{HostError, Result, Transport};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SocketTransport {
    stream: Option<UnixStream>,
    pending_irq: u32,
    shutdown: bool,
    timeout: Duration,
}

impl SocketTransport {
    pub fn new() -> Self {
        SocketTransport {
            stream: None,
            pending_irq: 0,
            shutdown: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// True once the emulator has sent a shutdown frame.
    pub fn shutdown_received(&self) -> bool {
        self.shutdown
    }

    fn stream(&mut self) -> Result<&mut UnixStream> {
        if self.shutdown {
            return Err(HostError::NotConnected);
        }
        self.stream.as_mut().ok_or(HostError::NotConnected)
    }

    fn send(&mut self, frame: Frame) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(&frame.to_bytes()).map_err(HostError::from)
    }

    /// Read exactly one frame, honoring `timeout` (`None` blocks
    /// forever). EINTR propagates as `Interrupted`.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Frame> {
        let stream = self.stream()?;
        stream.set_read_timeout(timeout).map_err(HostError::from)?;

        let mut buf = [0u8; FRAME_LEN];
        let mut filled = 0;
        while filled < FRAME_LEN {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(HostError::NotConnected),
                Ok(n) => filled += n,
                Err(e) => return Err(HostError::from(e)),
            }
        }
        Frame::parse(&buf).ok_or_else(|| HostError::Protocol("unparseable frame".to_string()))
    }

    /// Wait for a response of type `want`, absorbing interleaved IRQ
    /// frames into the pending mask.
    fn recv_response(&mut self, want: u8) -> Result<Frame> {
        loop {
            let frame = self.recv(Some(self.timeout))?;
            match frame.ty {
                t if t == want => return Ok(frame),
                msg::IRQ => {
                    self.pending_irq |= frame.word1.get();
                    debug!("irq frame, pending mask now {:#x}", self.pending_irq);
                }
                msg::SHUTDOWN => {
                    info!("shutdown frame from emulator");
                    self.shutdown = true;
                    self.stream = None;
                    return Err(HostError::NotConnected);
                }
                other => {
                    return Err(HostError::Protocol(format!(
                        "unexpected frame type {other} while waiting for {want}"
                    )))
                }
            }
        }
    }
}

impl Default for SocketTransport {
    fn default() -> Self {
        SocketTransport::new()
    }
}

impl Transport for SocketTransport {
    fn connect(&mut self, target: &str) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = UnixStream::connect(target).map_err(HostError::Transport)?;
        info!("connected to {target}");
        self.stream = Some(stream);
        self.shutdown = false;
        self.pending_irq = 0;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.shutdown
    }

    fn read32(&mut self, addr: u32) -> Result<u32> {
        self.send(Frame::read_req(addr))?;
        let resp = self.recv_response(msg::READ_RESP)?;
        Ok(resp.word0.get())
    }

    fn write32(&mut self, addr: u32, data: u32) -> Result<()> {
        self.send(Frame::write_req(addr, data))?;
        self.recv_response(msg::WRITE_ACK)?;
        Ok(())
    }

    fn wait_irq(&mut self, timeout: Option<Duration>) -> Result<u32> {
        if self.pending_irq != 0 {
            return Ok(std::mem::take(&mut self.pending_irq));
        }
        loop {
            let frame = self.recv(timeout)?;
            match frame.ty {
                msg::IRQ => return Ok(frame.word1.get()),
                msg::SHUTDOWN => {
                    self.shutdown = true;
                    self.stream = None;
                    return Err(HostError::NotConnected);
                }
                other => {
                    return Err(HostError::Protocol(format!(
                        "unexpected frame type {other} while waiting for irq"
                    )))
                }
            }
        }
    }

    fn has_irq_support(&self) -> bool {
        true
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
