// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The DPI metadata file (`dpi.json`) produced by the instrumentation
//! pass: function ids, block addresses, argument records, and the
//! reset-time calls with their compile-time constant arguments.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::{HostError, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct DpiMetadata {
    pub mailbox_base: String,
    pub dpi_base: String,
    pub func_block_size: u32,
    pub dpi_functions: Vec<DpiFunctionMeta>,
    #[serde(default)]
    pub finish_exit_codes: Vec<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DpiFunctionMeta {
    pub id: u8,
    pub name: String,
    pub base_addr: String,
    #[serde(default)]
    pub reset: bool,
    #[serde(rename = "return")]
    pub ret: Option<ReturnMeta>,
    pub args: Vec<ArgMeta>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReturnMeta {
    #[serde(rename = "type")]
    pub ty: String,
    pub width: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ArgMeta {
    pub name: String,
    pub direction: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub width: u32,
    /// Compile-time constant: the literal for string arguments, the
    /// decimal value for constant integers (reset-time calls).
    #[serde(default)]
    pub value: Option<String>,
}

impl DpiFunctionMeta {
    /// Packed hardware argument width: constants never travel through
    /// the argument registers.
    pub fn arg_width(&self) -> u32 {
        self.args
            .iter()
            .filter(|a| a.value.is_none())
            .map(|a| a.width)
            .sum()
    }

    pub fn ret_width(&self) -> u32 {
        self.ret.as_ref().map(|r| r.width).unwrap_or(0)
    }

    /// The constant arguments of a reset-time call, packed into 32-bit
    /// words the way the hardware would have packed them.
    pub fn constant_args_packed(&self) -> Vec<u32> {
        let mut words = Vec::new();
        let mut word = 0u32;
        let mut count = 0u32;
        for arg in &self.args {
            if arg.ty == "string" {
                continue;
            }
            let value: u64 = arg
                .value
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            for i in 0..arg.width {
                let bit = if i < 64 { value >> i & 1 } else { 0 };
                word |= (bit as u32) << (count % 32);
                count += 1;
                if count % 32 == 0 {
                    words.push(word);
                    word = 0;
                }
            }
        }
        if count % 32 != 0 {
            words.push(word);
        }
        words
    }
}

impl DpiMetadata {
    pub fn from_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| HostError::InvalidArg(format!("dpi metadata: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut text = String::new();
        File::open(path)
            .map_err(HostError::Transport)?
            .read_to_string(&mut text)
            .map_err(HostError::Transport)?;
        Self::from_str(&text)
    }

    /// Functions wired into the hardware bridge (reset-time calls are
    /// host-only).
    pub fn bridged(&self) -> impl Iterator<Item = &DpiFunctionMeta> {
        self.dpi_functions.iter().filter(|f| !f.reset)
    }

    pub fn bridged_count(&self) -> u32 {
        self.bridged().count() as u32
    }

    pub fn find(&self, name: &str) -> Option<&DpiFunctionMeta> {
        self.dpi_functions.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "mailbox_base": "0x0",
        "dpi_base": "0x100",
        "func_block_size": 64,
        "dpi_functions": [
            {
                "id": 0,
                "name": "add",
                "base_addr": "0x100",
                "return": { "type": "int", "width": 32 },
                "args": [
                    { "name": "a", "direction": "input", "type": "int", "width": 32 },
                    { "name": "b", "direction": "input", "type": "int", "width": 32 }
                ]
            },
            {
                "id": 1,
                "name": "boot_value",
                "base_addr": "0x140",
                "reset": true,
                "return": { "type": "int", "width": 32 },
                "args": [
                    { "name": "seed", "direction": "input", "type": "int", "width": 32, "value": "7" }
                ]
            }
        ],
        "finish_exit_codes": [7]
    }"#;

    #[test]
    fn parses_and_classifies() {
        let meta = DpiMetadata::from_str(SAMPLE).unwrap();
        assert_eq!(meta.dpi_functions.len(), 2);
        assert_eq!(meta.bridged_count(), 1);
        assert_eq!(meta.finish_exit_codes, vec![7]);

        let add = meta.find("add").unwrap();
        assert!(!add.reset);
        assert_eq!(add.arg_width(), 64);
        assert_eq!(add.ret_width(), 32);

        let boot = meta.find("boot_value").unwrap();
        assert!(boot.reset);
        // The constant never occupies argument registers…
        assert_eq!(boot.arg_width(), 0);
        // …but can be packed for the callback invocation.
        assert_eq!(boot.constant_args_packed(), vec![7]);
    }
}
