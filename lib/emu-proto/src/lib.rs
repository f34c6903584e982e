// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host↔emulator wire protocol and mailbox register map.
//!
//! Both transports move 32-bit register reads and writes; the socket
//! transport additionally frames them as fixed 12-byte little-endian
//! messages:
//!
//! ```text
//! request  (host → emulator): [type:1][reserved:3][addr:4][wdata:4]
//! response (emulator → host): [type:1][reserved:3][rdata:4][irq:4]
//! ```
//!
//! Request types: 0 = read, 1 = write. Response types: 0 = read
//! response, 1 = write ack, 2 = async IRQ, 3 = shutdown. A read's
//! response is the next read-response on the wire; IRQ and shutdown
//! frames may interleave but are never reordered relative to each other.
//!
//! The register map itself is transport-independent: a mailbox block at
//! address 0 carrying emulator control and status, and one 64-byte block
//! per DPI function starting at [`DPI_BASE`].

use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub mod memmap;
pub mod scanmap;
mod wire;

/// Size of every socket-transport message.
pub const FRAME_LEN: usize = 12;

/// Message type codes, shared by requests and responses.
pub mod msg {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const READ_RESP: u8 = 0;
    pub const WRITE_ACK: u8 = 1;
    pub const IRQ: u8 = 2;
    pub const SHUTDOWN: u8 = 3;
}

/// One 12-byte message. Field meaning depends on direction: `word0` is
/// the address in requests and the read data in responses; `word1` is
/// the write data in requests and the IRQ bits in responses.
#[derive(
    FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Copy, Clone, Debug, PartialEq, Eq,
)]
#[repr(C)]
pub struct Frame {
    pub ty: u8,
    pub reserved: [u8; 3],
    pub word0: U32,
    pub word1: U32,
}

const_assert_eq!(core::mem::size_of::<Frame>(), FRAME_LEN);

impl Frame {
    fn new(ty: u8, word0: u32, word1: u32) -> Self {
        Frame {
            ty,
            reserved: [0; 3],
            word0: U32::new(word0),
            word1: U32::new(word1),
        }
    }

    pub fn read_req(addr: u32) -> Self {
        Frame::new(msg::READ, addr, 0)
    }

    pub fn write_req(addr: u32, data: u32) -> Self {
        Frame::new(msg::WRITE, addr, data)
    }

    pub fn read_resp(data: u32) -> Self {
        Frame::new(msg::READ_RESP, data, 0)
    }

    pub fn write_ack() -> Self {
        Frame::new(msg::WRITE_ACK, 0, 0)
    }

    pub fn irq(bits: u32) -> Self {
        Frame::new(msg::IRQ, 0, bits)
    }

    pub fn shutdown() -> Self {
        Frame::new(msg::SHUTDOWN, 0, 0)
    }

    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out.copy_from_slice(zerocopy::IntoBytes::as_bytes(self));
        out
    }

    /// Decode a frame from exactly [`FRAME_LEN`] bytes.
    pub fn parse(bytes: &[u8]) -> Option<Frame> {
        zerocopy::FromBytes::read_from_bytes(bytes).ok()
    }
}

/// Base of the mailbox register block.
pub const MAILBOX_BASE: u32 = 0x000;

/// Base of the per-function DPI block region.
pub const DPI_BASE: u32 = 0x100;

/// Bytes reserved per DPI function.
pub const DPI_BLOCK_SIZE: u32 = 64;

/// Mailbox registers (byte addresses relative to [`MAILBOX_BASE`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Addr {
    DesignId = 0x00,
    Version = 0x04,
    NDpiFuncs = 0x08,
    State = 0x0c,
    CyclesLo = 0x10,
    CyclesHi = 0x14,
    Reset = 0x18,
    Ctrl = 0x1c,
    DpiPending = 0x20,
    ScanCtrl = 0x24,
    ScanShift = 0x28,
    MemAddr = 0x2c,
    MemWdata = 0x30,
    MemRdata = 0x34,
    MemCtrl = 0x38,
}

impl From<Addr> for u32 {
    fn from(a: Addr) -> Self {
        MAILBOX_BASE + a as u32
    }
}

/// `Ctrl` register bits. All self-clearing pulses.
pub mod ctrl {
    pub const START: u32 = 1 << 0;
    pub const STOP: u32 = 1 << 1;
    pub const STEP: u32 = 1 << 2;
}

/// `Reset` register bits.
pub mod reset {
    pub const ASSERT: u32 = 1 << 0;
}

/// `ScanCtrl` register bits. Setting `ENABLE` also clears the shift
/// counter, so a scan pass always starts word-aligned at chain offset 0.
pub mod scan_ctrl {
    pub const ENABLE: u32 = 1 << 0;
}

/// `MemCtrl` register bits. Write pulses a single shadow access.
pub mod mem_ctrl {
    pub const WEN: u32 = 1 << 0;
    pub const REN: u32 = 1 << 1;
}

/// Per-function status register bits (offset 0 of each DPI block).
pub mod dpi_status {
    /// Read: the design is blocked on this call.
    pub const PENDING: u32 = 1 << 0;
    /// Write: result words are valid, release the call.
    pub const DONE: u32 = 1 << 1;
    /// Write: acknowledge the call with an error.
    pub const ERROR: u32 = 1 << 2;
}

/// Emulator state as reported by the `State` register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum EmuState {
    Idle = 0,
    Running = 1,
    Frozen = 2,
    Error = 3,
}

/// Base address of a DPI function block.
pub fn dpi_func_base(func_id: u8) -> u32 {
    DPI_BASE + u32::from(func_id) * DPI_BLOCK_SIZE
}

/// Address of argument word `word` of a function block.
pub fn dpi_arg_addr(func_id: u8, word: u32) -> u32 {
    dpi_func_base(func_id) + 4 + 4 * word
}

/// Address of return word `word`, given the packed argument width.
pub fn dpi_ret_addr(func_id: u8, arg_width_bits: u32, word: u32) -> u32 {
    let arg_words = arg_width_bits.div_ceil(32);
    dpi_func_base(func_id) + 4 + 4 * arg_words + 4 * word
}
