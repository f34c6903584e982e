// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The register-level emulator context: identity, control, scan and
//! shadow-memory operations over an owned transport.

use std::time::Duration;

use log::{debug, info};
use num_traits::FromPrimitive;

use emu_proto::memmap::MemMap;
use emu_proto::{ctrl, dpi_status, mem_ctrl, reset, scan_ctrl};
use emu_proto::{dpi_arg_addr, dpi_func_base, dpi_ret_addr, Addr, EmuState};

use crate::image::{stream_to_image, image_to_stream};
use crate::{HostError, Result, Transport};

pub struct Emulator {
    transport: Box<dyn Transport>,
}

impl Emulator {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Emulator { transport }
    }

    pub fn connect(&mut self, target: &str) -> Result<()> {
        self.transport.connect(target)
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.transport.set_timeout(timeout);
    }

    pub fn read32(&mut self, addr: u32) -> Result<u32> {
        self.transport.read32(addr)
    }

    pub fn write32(&mut self, addr: u32, data: u32) -> Result<()> {
        self.transport.write32(addr, data)
    }

    fn read_reg(&mut self, reg: Addr) -> Result<u32> {
        self.transport.read32(u32::from(reg))
    }

    fn write_reg(&mut self, reg: Addr, data: u32) -> Result<()> {
        self.transport.write32(u32::from(reg), data)
    }

    // ---- identity and state ----

    pub fn design_id(&mut self) -> Result<u32> {
        self.read_reg(Addr::DesignId)
    }

    pub fn version(&mut self) -> Result<u32> {
        self.read_reg(Addr::Version)
    }

    pub fn n_dpi_funcs(&mut self) -> Result<u32> {
        self.read_reg(Addr::NDpiFuncs)
    }

    pub fn state(&mut self) -> Result<EmuState> {
        let raw = self.read_reg(Addr::State)?;
        EmuState::from_u32(raw)
            .ok_or_else(|| HostError::Protocol(format!("bad emulator state {raw}")))
    }

    /// 64-bit cycle counter; the high half is re-read to guard against
    /// a carry between the two register reads.
    pub fn cycle_count(&mut self) -> Result<u64> {
        loop {
            let hi = self.read_reg(Addr::CyclesHi)?;
            let lo = self.read_reg(Addr::CyclesLo)?;
            if self.read_reg(Addr::CyclesHi)? == hi {
                return Ok((u64::from(hi) << 32) | u64::from(lo));
            }
        }
    }

    // ---- control ----

    pub fn set_reset(&mut self, asserted: bool) -> Result<()> {
        debug!("reset {}", if asserted { "assert" } else { "release" });
        self.write_reg(Addr::Reset, if asserted { reset::ASSERT } else { 0 })
    }

    pub fn start(&mut self) -> Result<()> {
        info!("start");
        self.write_reg(Addr::Ctrl, ctrl::START)
    }

    pub fn stop(&mut self) -> Result<()> {
        info!("stop");
        self.write_reg(Addr::Ctrl, ctrl::STOP)
    }

    pub fn step(&mut self) -> Result<()> {
        self.write_reg(Addr::Ctrl, ctrl::STEP)
    }

    pub fn wait_irq(&mut self, timeout: Option<Duration>) -> Result<u32> {
        self.transport.wait_irq(timeout)
    }

    // ---- scan subsystem ----
    //
    // Enabling scan clears the emulator's shift counter; each ScanShift
    // write moves up to 32 bits and latches the bits that fell out for
    // the following read. The stream direction is reverse chain order,
    // so images are bit-reversed on the way in and out (the chain head
    // shifts first and travels furthest).

    pub fn scan_begin(&mut self) -> Result<()> {
        self.write_reg(Addr::ScanCtrl, scan_ctrl::ENABLE)
    }

    pub fn scan_end(&mut self) -> Result<()> {
        self.write_reg(Addr::ScanCtrl, 0)
    }

    /// Shift a full image into the chain. `scan_begin` must have run.
    pub fn scan_inject(&mut self, image: &[u32], len_bits: u32) -> Result<()> {
        let stream = image_to_stream(image, len_bits);
        for word in stream {
            self.write_reg(Addr::ScanShift, word)?;
        }
        Ok(())
    }

    /// Shift the chain out and return the image. Destructive: the chain
    /// fills with zeros; inject afterwards to restore.
    pub fn scan_capture(&mut self, len_bits: u32) -> Result<Vec<u32>> {
        let words = len_bits.div_ceil(32);
        let mut stream = Vec::with_capacity(words as usize);
        for _ in 0..words {
            self.write_reg(Addr::ScanShift, 0)?;
            stream.push(self.read_reg(Addr::ScanShift)?);
        }
        Ok(stream_to_image(&stream, len_bits))
    }

    // ---- shadow memory ----

    pub fn mem_write32(&mut self, addr: u32, data: u32) -> Result<()> {
        self.write_reg(Addr::MemAddr, addr)?;
        self.write_reg(Addr::MemWdata, data)?;
        self.write_reg(Addr::MemCtrl, mem_ctrl::WEN)
    }

    pub fn mem_read32(&mut self, addr: u32) -> Result<u32> {
        self.write_reg(Addr::MemAddr, addr)?;
        self.write_reg(Addr::MemCtrl, mem_ctrl::REN)?;
        self.read_reg(Addr::MemRdata)
    }

    /// Write every memory's static initial contents through the shadow
    /// interface. Returns the number of words written.
    pub fn mem_preload(&mut self, map: &MemMap) -> Result<usize> {
        let mut written = 0;
        for mem in &map.memories {
            let Some(bytes) = &mem.initial else {
                continue;
            };
            let bytes_per_entry = (mem.width as usize).div_ceil(8);
            for entry in 0..mem.depth {
                let chunk = &bytes[entry as usize * bytes_per_entry..][..bytes_per_entry];
                for word in 0..mem.words_per_entry() {
                    let mut le = [0u8; 4];
                    let start = word as usize * 4;
                    for (i, b) in chunk.iter().skip(start).take(4).enumerate() {
                        le[i] = *b;
                    }
                    self.mem_write32(mem.entry_addr(entry, word), u32::from_le_bytes(le))?;
                    written += 1;
                }
            }
            info!(
                "preloaded {} ({} entries, {} bytes)",
                mem.name,
                mem.depth,
                bytes.len()
            );
        }
        Ok(written)
    }

    // ---- DPI function blocks ----

    /// Bitmask of functions currently blocked on the host.
    pub fn dpi_pending(&mut self) -> Result<u32> {
        self.read_reg(Addr::DpiPending)
    }

    pub fn dpi_call_pending(&mut self, func_id: u8) -> Result<bool> {
        let status = self.read32(dpi_func_base(func_id))?;
        Ok(status & dpi_status::PENDING != 0)
    }

    /// Fetch the packed argument words of a pending call.
    pub fn dpi_get_args(&mut self, func_id: u8, arg_words: u32) -> Result<Vec<u32>> {
        let mut args = Vec::with_capacity(arg_words as usize);
        for word in 0..arg_words {
            args.push(self.read32(dpi_arg_addr(func_id, word))?);
        }
        Ok(args)
    }

    /// Write the return value and release the call.
    pub fn dpi_complete(
        &mut self,
        func_id: u8,
        arg_width_bits: u32,
        ret_width_bits: u32,
        value: u64,
    ) -> Result<()> {
        let ret_words = ret_width_bits.div_ceil(32);
        for word in 0..ret_words {
            self.write32(
                dpi_ret_addr(func_id, arg_width_bits, word),
                (value >> (32 * word)) as u32,
            )?;
        }
        self.write32(dpi_func_base(func_id), dpi_status::DONE)
    }

    /// Acknowledge a call with an error status.
    pub fn dpi_ack_error(&mut self, func_id: u8) -> Result<()> {
        self.write32(dpi_func_base(func_id), dpi_status::ERROR)
    }
}
