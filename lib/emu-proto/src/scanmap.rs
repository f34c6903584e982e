// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scan map: chain bit positions → source-level variables.
//!
//! Written by the scan-insertion pass and read by the host runtime to
//! decode captured images and to build the initial (reset) image.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::wire::{check_magic, read_string, write_string};

pub const SCAN_MAP_MAGIC: &[u8; 4] = b"ESM1";

const FLAG_RESET_VALUE: u8 = 1 << 0;
const FLAG_RESET_DPI: u8 = 1 << 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanMap {
    /// Total chain bits.
    pub chain_length: u32,
    /// In chain order; offsets are cumulative bit positions.
    pub variables: Vec<ScanVariable>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanVariable {
    /// Hierarchical source name, `module.path.var`.
    pub name: String,
    pub width: u32,
    pub offset: u32,
    /// Reset value, `ceil(width/32)` words, little-endian.
    pub reset_value: Option<Vec<u32>>,
    /// Host function producing the reset value at first reset release.
    pub reset_dpi_func: Option<String>,
    pub enum_members: Vec<EnumMember>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumMember {
    pub name: String,
    pub value: u64,
}

impl ScanVariable {
    pub fn words(&self) -> u32 {
        self.width.div_ceil(32)
    }
}

impl ScanMap {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(SCAN_MAP_MAGIC)?;
        w.write_u32::<LittleEndian>(self.chain_length)?;
        w.write_u32::<LittleEndian>(self.variables.len() as u32)?;
        for var in &self.variables {
            write_string(w, &var.name)?;
            w.write_u32::<LittleEndian>(var.width)?;
            w.write_u32::<LittleEndian>(var.offset)?;
            let mut flags = 0u8;
            if var.reset_value.is_some() {
                flags |= FLAG_RESET_VALUE;
            }
            if var.reset_dpi_func.is_some() {
                flags |= FLAG_RESET_DPI;
            }
            w.write_u8(flags)?;
            if let Some(words) = &var.reset_value {
                debug_assert_eq!(words.len() as u32, var.words());
                for word in words {
                    w.write_u32::<LittleEndian>(*word)?;
                }
            }
            if let Some(func) = &var.reset_dpi_func {
                write_string(w, func)?;
            }
            w.write_u32::<LittleEndian>(var.enum_members.len() as u32)?;
            for member in &var.enum_members {
                write_string(w, &member.name)?;
                w.write_u64::<LittleEndian>(member.value)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        check_magic(r, SCAN_MAP_MAGIC, "scan map")?;
        let chain_length = r.read_u32::<LittleEndian>()?;
        let n_vars = r.read_u32::<LittleEndian>()?;
        let mut variables = Vec::with_capacity(n_vars as usize);
        for _ in 0..n_vars {
            let name = read_string(r)?;
            let width = r.read_u32::<LittleEndian>()?;
            let offset = r.read_u32::<LittleEndian>()?;
            let flags = r.read_u8()?;
            let mut var = ScanVariable {
                name,
                width,
                offset,
                ..ScanVariable::default()
            };
            if flags & FLAG_RESET_VALUE != 0 {
                let mut words = Vec::with_capacity(var.words() as usize);
                for _ in 0..var.words() {
                    words.push(r.read_u32::<LittleEndian>()?);
                }
                var.reset_value = Some(words);
            }
            if flags & FLAG_RESET_DPI != 0 {
                var.reset_dpi_func = Some(read_string(r)?);
            }
            let n_members = r.read_u32::<LittleEndian>()?;
            for _ in 0..n_members {
                var.enum_members.push(EnumMember {
                    name: read_string(r)?,
                    value: r.read_u64::<LittleEndian>()?,
                });
            }
            variables.push(var);
        }
        Ok(ScanMap {
            chain_length,
            variables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let map = ScanMap {
            chain_length: 11,
            variables: vec![
                ScanVariable {
                    name: "top.counter.q".to_string(),
                    width: 8,
                    offset: 0,
                    reset_value: Some(vec![0x42]),
                    reset_dpi_func: None,
                    enum_members: Vec::new(),
                },
                ScanVariable {
                    name: "top.fsm.state".to_string(),
                    width: 3,
                    offset: 8,
                    reset_value: Some(vec![0]),
                    reset_dpi_func: Some("boot_state".to_string()),
                    enum_members: vec![
                        EnumMember {
                            name: "Idle".to_string(),
                            value: 0,
                        },
                        EnumMember {
                            name: "Busy".to_string(),
                            value: 1,
                        },
                    ],
                },
            ],
        };

        let mut buf = Vec::new();
        map.write_to(&mut buf).unwrap();
        assert_eq!(&buf[..4], SCAN_MAP_MAGIC);
        let back = ScanMap::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn bad_magic_rejected() {
        let buf = b"XXXX\x00\x00\x00\x00\x00\x00\x00\x00";
        assert!(ScanMap::read_from(&mut buf.as_slice()).is_err());
    }
}
