// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side runtime for emulated designs.
//!
//! A transport-agnostic, register-level driver over the mailbox
//! protocol: emulator control (reset, start, stop, step, state and
//! cycle polling), the scan subsystem (capture, inject, initial-image
//! construction from the scan map), shadow-memory access and preload,
//! and the DPI service loop that executes native call-outs while the
//! design is paused.
//!
//! Two transports exist: [`SocketTransport`] speaks the 12-byte framed
//! protocol to a simulator over a Unix domain socket;
//! [`MmapTransport`] maps a PCIe BAR (or drives a character device) for
//! real FPGA targets. A transport handle is exclusively owned by its
//! [`Emulator`] context.

use std::fmt;
use std::io;
use std::time::Duration;

mod dpi;
mod emulator;
mod image;
mod meta;
mod mmap;
mod socket;

pub use dpi::{DpiExit, DpiService, DpiTable, ExitFlag};
pub use emulator::Emulator;
pub use image::ScanImage;
pub use meta::{DpiFunctionMeta, DpiMetadata};
pub use mmap::MmapTransport;
pub use socket::SocketTransport;

pub use emu_proto::memmap::MemMap;
pub use emu_proto::scanmap::ScanMap;
pub use emu_proto::EmuState;

/// Runtime errors. Transport and protocol failures are fatal to the
/// context; per-call DPI errors are counted and survived.
#[derive(Debug)]
pub enum HostError {
    /// I/O error or short read/write on the transport.
    Transport(io::Error),
    /// Unexpected frame or register contents.
    Protocol(String),
    Timeout,
    Interrupted,
    InvalidArg(String),
    NotConnected,
    /// Feature not available on this transport (e.g. IRQ without an
    /// events device).
    NotSupported,
    /// The emulator reported an error state.
    Emulator(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Transport(e) => write!(f, "transport failure: {e}"),
            HostError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            HostError::Timeout => write!(f, "timed out"),
            HostError::Interrupted => write!(f, "interrupted"),
            HostError::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            HostError::NotConnected => write!(f, "not connected"),
            HostError::NotSupported => write!(f, "not supported on this transport"),
            HostError::Emulator(msg) => write!(f, "emulator error: {msg}"),
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HostError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => HostError::Timeout,
            io::ErrorKind::Interrupted => HostError::Interrupted,
            _ => HostError::Transport(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;

/// A register-access channel to the emulator. Implementations own their
/// handle exclusively; blocking calls honor the configured timeout.
pub trait Transport: Send {
    fn connect(&mut self, target: &str) -> Result<()>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    /// Blocks until the matching response arrives (socket) or the bus
    /// read completes (mmap).
    fn read32(&mut self, addr: u32) -> Result<u32>;
    fn write32(&mut self, addr: u32, data: u32) -> Result<()>;

    /// Block until an asynchronous interrupt fires; returns the IRQ
    /// bits. `None` waits forever.
    fn wait_irq(&mut self, timeout: Option<Duration>) -> Result<u32>;

    fn has_irq_support(&self) -> bool {
        false
    }

    /// Timeout applied to blocking register operations.
    fn set_timeout(&mut self, _timeout: Duration) {}
}
