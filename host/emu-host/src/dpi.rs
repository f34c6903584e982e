// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DPI dispatch: the registered function table and the service loop.
//!
//! The table is registered once before the loop starts and read-only
//! thereafter (callbacks may carry their own state). The loop polls the
//! pending mask, fetches each pending call's argument words, invokes
//! the callback and completes the call with the 64-bit return value.
//! Unknown or unregistered ids are acknowledged with the error status
//! and counted; the loop continues.
//!
//! Termination: a callback requesting exit via its [`ExitFlag`], the
//! emulator reporting an error state, the emulator freezing, or a
//! configurable idle timeout after the first successful call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::meta::DpiMetadata;
use crate::{Emulator, EmuState, Result};

/// Cancellation token shared with callbacks: a callback that decides
/// the test is over (e.g. a verification hook) requests exit and the
/// loop stops after the current round.
#[derive(Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        ExitFlag::default()
    }

    pub fn request_exit(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

type Callback = Box<dyn FnMut(&[u32]) -> u64 + Send>;

struct DpiFunc {
    func_id: u8,
    name: String,
    arg_width: u32,
    ret_width: u32,
    callback: Callback,
}

/// The registered function table.
#[derive(Default)]
pub struct DpiTable {
    funcs: Vec<DpiFunc>,
}

impl DpiTable {
    pub fn new() -> Self {
        DpiTable::default()
    }

    pub fn register(
        &mut self,
        func_id: u8,
        name: impl Into<String>,
        arg_width: u32,
        ret_width: u32,
        callback: impl FnMut(&[u32]) -> u64 + Send + 'static,
    ) {
        self.funcs.push(DpiFunc {
            func_id,
            name: name.into(),
            arg_width,
            ret_width,
            callback: Box::new(callback),
        });
    }

    /// Register printf-style handlers for the generated `__display_*`
    /// functions described in the metadata.
    pub fn register_displays(&mut self, meta: &DpiMetadata) {
        for func in meta.bridged() {
            if !func.name.starts_with("__display_") {
                continue;
            }
            let spec = DisplaySpec::from_meta(func);
            self.register(func.id, func.name.clone(), func.arg_width(), 0, move |args| {
                print!("{}", spec.render(args));
                0
            });
        }
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    fn find(&mut self, func_id: u8) -> Option<&mut DpiFunc> {
        self.funcs.iter_mut().find(|f| f.func_id == func_id)
    }

    /// Invoke a registered function by name with explicit argument
    /// words; used for reset-time calls.
    pub fn invoke_by_name(&mut self, name: &str, args: &[u32]) -> Option<u64> {
        let func = self.funcs.iter_mut().find(|f| f.name == name)?;
        Some((func.callback)(args))
    }
}

/// Why the service loop returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DpiExit {
    /// Normal completion: requested exit, frozen emulator, or idle
    /// after servicing at least one call.
    Complete,
    /// The emulator reported an error state.
    EmuError,
    /// Host-side failure (transport or protocol).
    Error,
}

pub struct DpiService {
    table: DpiTable,
    exit: ExitFlag,
    calls: u64,
    errors: u64,
}

impl DpiService {
    pub fn new(table: DpiTable) -> Self {
        DpiService {
            table,
            exit: ExitFlag::new(),
            calls: 0,
            errors: 0,
        }
    }

    pub fn exit_flag(&self) -> ExitFlag {
        self.exit.clone()
    }

    pub fn call_count(&self) -> u64 {
        self.calls
    }

    pub fn error_count(&self) -> u64 {
        self.errors
    }

    /// Service one round of pending calls. Non-blocking; returns the
    /// number of calls serviced.
    pub fn service_once(&mut self, emu: &mut Emulator) -> Result<usize> {
        let pending = emu.dpi_pending()?;
        if pending == 0 {
            return Ok(0);
        }
        if pending.count_ones() > 1 {
            // The bridge serialises by priority, but two hot valid
            // conditions on one cycle is a design bug worth reporting.
            error!("multiple DPI calls pending simultaneously ({pending:#x})");
        }

        let mut serviced = 0;
        for func_id in 0..32u8 {
            if pending & (1 << func_id) == 0 {
                continue;
            }
            let Some(func) = self.table.find(func_id) else {
                error!("unknown DPI function id {func_id}");
                emu.dpi_ack_error(func_id)?;
                self.errors += 1;
                continue;
            };

            let args = emu.dpi_get_args(func_id, func.arg_width.div_ceil(32))?;
            debug!("dpi call {} (id {func_id}), {} arg word(s)", func.name, args.len());
            let result = (func.callback)(&args);
            emu.dpi_complete(func_id, func.arg_width, func.ret_width, result)?;
            serviced += 1;
            self.calls += 1;
        }
        Ok(serviced)
    }

    /// Run until a termination condition holds. `idle_timeout` arms
    /// after the first successful call.
    pub fn run(&mut self, emu: &mut Emulator, idle_timeout: Duration) -> DpiExit {
        info!("entering DPI service loop ({} function(s))", self.table.len());
        let mut last_activity = Instant::now();

        loop {
            match self.service_once(emu) {
                Ok(0) => {}
                Ok(_) => last_activity = Instant::now(),
                Err(e) => {
                    error!("service failure: {e}");
                    return DpiExit::Error;
                }
            }

            if self.exit.is_set() {
                info!("exit requested by callback");
                return DpiExit::Complete;
            }

            match emu.state() {
                Ok(EmuState::Error) => {
                    warn!("emulator entered error state");
                    return DpiExit::EmuError;
                }
                Ok(EmuState::Frozen) => {
                    info!("emulator frozen, run complete");
                    return DpiExit::Complete;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("state poll failed: {e}");
                    return DpiExit::Error;
                }
            }

            if self.calls > 0 && last_activity.elapsed() >= idle_timeout {
                info!("no DPI activity for {idle_timeout:?}, assuming completion");
                return DpiExit::Complete;
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Issue every reset-time call and patch the initial image with the
    /// returned values. Runs once, at first reset release.
    pub fn apply_reset_calls(
        &mut self,
        meta: &DpiMetadata,
        map: &crate::ScanMap,
        image: &mut crate::ScanImage,
    ) {
        for var in &map.variables {
            let Some(func_name) = &var.reset_dpi_func else {
                continue;
            };
            let Some(func) = meta.find(func_name) else {
                warn!("reset DPI function '{func_name}' not in metadata");
                continue;
            };
            let args = func.constant_args_packed();
            match self.table.invoke_by_name(func_name, &args) {
                Some(value) => {
                    debug!("reset call {func_name} -> {value:#x} ({} bits)", var.width);
                    image.patch(var.offset, var.width, value);
                }
                None => warn!("reset DPI function '{func_name}' not registered"),
            }
        }
    }
}

/// A parsed display format: the escaped C format string from the
/// metadata plus the argument layout, enough to reproduce the printf
/// on the host side.
struct DisplaySpec {
    fmt: String,
    arg_widths: Vec<u32>,
}

impl DisplaySpec {
    fn from_meta(func: &crate::meta::DpiFunctionMeta) -> Self {
        let fmt = func
            .args
            .iter()
            .find(|a| a.ty == "string")
            .and_then(|a| a.value.clone())
            .unwrap_or_default();
        DisplaySpec {
            fmt: unescape(&fmt),
            arg_widths: func
                .args
                .iter()
                .filter(|a| a.value.is_none())
                .map(|a| a.width)
                .collect(),
        }
    }

    /// Advance to the next argument, returning its value and moving the
    /// word cursor past it.
    fn take_value(&self, args: &[u32], arg_idx: &mut usize, word: &mut usize) -> u64 {
        let width = self.arg_widths.get(*arg_idx).copied().unwrap_or(32);
        *arg_idx += 1;
        let words = width.div_ceil(32) as usize;
        let mut v = 0u64;
        for i in 0..words.min(2) {
            v |= u64::from(args.get(*word + i).copied().unwrap_or(0)) << (32 * i);
        }
        *word += words;
        if width < 64 {
            v &= (1u64 << width) - 1;
        }
        v
    }

    fn take_string(&self, args: &[u32], arg_idx: &mut usize, word: &mut usize) -> String {
        let width = self.arg_widths.get(*arg_idx).copied().unwrap_or(0);
        *arg_idx += 1;
        let words = width.div_ceil(32) as usize;
        let mut bytes = Vec::new();
        for i in 0..words {
            bytes.extend_from_slice(&args.get(*word + i).copied().unwrap_or(0).to_le_bytes());
        }
        *word += words;
        bytes.truncate((width as usize).div_ceil(8));
        bytes.reverse();
        bytes.into_iter().filter(|b| *b != 0).map(char::from).collect()
    }

    fn render(&self, args: &[u32]) -> String {
        let mut out = String::new();
        let mut arg_idx = 0usize;
        let mut word = 0usize;
        let mut chars = self.fmt.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('d') | Some('u') => {
                    out.push_str(&self.take_value(args, &mut arg_idx, &mut word).to_string())
                }
                Some('x') => {
                    out.push_str(&format!("{:x}", self.take_value(args, &mut arg_idx, &mut word)))
                }
                Some('X') => {
                    out.push_str(&format!("{:X}", self.take_value(args, &mut arg_idx, &mut word)))
                }
                Some('o') => {
                    out.push_str(&format!("{:o}", self.take_value(args, &mut arg_idx, &mut word)))
                }
                Some('s') => {
                    let text = self.take_string(args, &mut arg_idx, &mut word);
                    out.push_str(&text);
                }
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}

/// Undo the C-string escaping applied when the format string was stored
/// in the metadata.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DpiMetadata;

    #[test]
    fn exit_flag_is_shared() {
        let flag = ExitFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_set());
        clone.request_exit();
        assert!(flag.is_set());
    }

    #[test]
    fn display_rendering() {
        let meta = DpiMetadata::from_str(
            r#"{
            "mailbox_base": "0x0",
            "dpi_base": "0x100",
            "func_block_size": 64,
            "dpi_functions": [{
                "id": 0,
                "name": "__display_0",
                "base_addr": "0x100",
                "return": null,
                "args": [
                    { "name": "fmt", "direction": "input", "type": "string",
                      "width": 0, "value": "x=%d y=%x\\n" },
                    { "name": "arg0", "direction": "input", "type": "bit", "width": 8 },
                    { "name": "arg1", "direction": "input", "type": "bit", "width": 16 }
                ]
            }]
        }"#,
        )
        .unwrap();

        let spec = DisplaySpec::from_meta(&meta.dpi_functions[0]);
        assert_eq!(spec.render(&[66, 0xbeef]), "x=66 y=beef\n");
    }

    #[test]
    fn unescape_rules() {
        assert_eq!(unescape("a\\nb\\t\\\"c\\\\"), "a\nb\t\"c\\");
        assert_eq!(unescape("plain"), "plain");
    }
}
