// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCIe transport for FPGA targets.
//!
//! Two modes, selected by the target string:
//!
//! - a sysfs resource path (or a bare `0000:BB:DD.F` BDF, which is
//!   expanded to `/sys/bus/pci/devices/<bdf>/resource0`) is mapped
//!   directly — no kernel driver needed;
//! - a DMA-driver character device (`/dev/*_user`) is driven with
//!   positioned reads and writes, with the sibling `*_events_0` device
//!   (when present) providing blocking MSI waits.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::time::Duration;

use log::{info, warn};

use crate::{HostError, Result, Transport};

struct Bar {
    ptr: *mut u32,
    size: usize,
}

// The mapping is plain device memory; the raw pointer is only ever used
// through &mut self.
unsafe impl Send for Bar {}

impl Drop for Bar {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
        }
    }
}

pub struct MmapTransport {
    file: Option<File>,
    bar: Option<Bar>,
    events: Option<File>,
}

impl MmapTransport {
    pub fn new() -> Self {
        MmapTransport {
            file: None,
            bar: None,
            events: None,
        }
    }

    fn check_range(&self, addr: u32) -> Result<()> {
        let bar = self.bar.as_ref().ok_or(HostError::NotConnected)?;
        if addr as usize + 4 > bar.size {
            return Err(HostError::InvalidArg(format!(
                "address {addr:#x} outside BAR of {:#x} bytes",
                bar.size
            )));
        }
        Ok(())
    }
}

impl Default for MmapTransport {
    fn default() -> Self {
        MmapTransport::new()
    }
}

/// `0000:17:00.0` and friends.
fn looks_like_bdf(target: &str) -> bool {
    let b = target.as_bytes();
    b.len() >= 10 && b[4] == b':' && b[7] == b':'
}

impl Transport for MmapTransport {
    fn connect(&mut self, target: &str) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let path = if looks_like_bdf(target) {
            format!("/sys/bus/pci/devices/{target}/resource0")
        } else {
            target.to_string()
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(HostError::Transport)?;

        if path.starts_with("/sys/") || path.contains("resource") {
            // Direct BAR mapping.
            let size = match file.metadata().map(|m| m.len()).unwrap_or(0) {
                0 => 1 << 20,
                n => n as usize,
            };
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(HostError::Transport(std::io::Error::last_os_error()));
            }
            info!("mapped {path} ({size:#x} bytes)");
            self.bar = Some(Bar {
                ptr: ptr.cast(),
                size,
            });
            self.file = Some(file);
        } else {
            info!("opened {path} (positioned I/O)");
            // MSI support comes from the driver's events device.
            if let Some(stem) = path.strip_suffix("_user") {
                let events_path = format!("{stem}_events_0");
                match File::open(&events_path) {
                    Ok(ev) => {
                        info!("opened {events_path} for interrupts");
                        self.events = Some(ev);
                    }
                    Err(e) => warn!("no events device at {events_path}: {e}"),
                }
            }
            self.file = Some(file);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.bar = None;
        self.events = None;
        self.file = None;
    }

    fn is_connected(&self) -> bool {
        self.file.is_some()
    }

    fn read32(&mut self, addr: u32) -> Result<u32> {
        if self.bar.is_some() {
            self.check_range(addr)?;
            let bar = self.bar.as_ref().unwrap();
            let value = unsafe { bar.ptr.add(addr as usize / 4).read_volatile() };
            Ok(value)
        } else {
            let file = self.file.as_ref().ok_or(HostError::NotConnected)?;
            let mut buf = [0u8; 4];
            let n = file.read_at(&mut buf, addr as u64).map_err(HostError::from)?;
            if n != 4 {
                return Err(HostError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("short read at {addr:#x}"),
                )));
            }
            Ok(u32::from_le_bytes(buf))
        }
    }

    fn write32(&mut self, addr: u32, data: u32) -> Result<()> {
        if self.bar.is_some() {
            self.check_range(addr)?;
            let bar = self.bar.as_ref().unwrap();
            unsafe { bar.ptr.add(addr as usize / 4).write_volatile(data) };
            Ok(())
        } else {
            let file = self.file.as_ref().ok_or(HostError::NotConnected)?;
            let n = file
                .write_at(&data.to_le_bytes(), addr as u64)
                .map_err(HostError::from)?;
            if n != 4 {
                return Err(HostError::Transport(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write at {addr:#x}"),
                )));
            }
            Ok(())
        }
    }

    fn wait_irq(&mut self, timeout: Option<Duration>) -> Result<u32> {
        use std::io::Read;

        let Some(events) = self.events.as_mut() else {
            return Err(HostError::NotSupported);
        };

        let mut pfd = libc::pollfd {
            fd: events.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.map(|t| t.as_millis() as libc::c_int).unwrap_or(-1);
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            return Err(HostError::from(e));
        }
        if rc == 0 {
            return Err(HostError::Timeout);
        }

        // The driver blocks readers until an MSI fires, then returns the
        // event count and auto-acknowledges.
        let mut buf = [0u8; 4];
        match events.read(&mut buf) {
            Ok(4) => Ok(u32::from_le_bytes(buf)),
            Ok(n) => Err(HostError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short events read ({n} bytes)"),
            ))),
            Err(e) => Err(HostError::from(e)),
        }
    }

    fn has_irq_support(&self) -> bool {
        self.events.is_some()
    }
}
