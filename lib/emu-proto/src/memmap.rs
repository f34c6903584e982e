// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The memory map: shadow address space → logical memories.
//!
//! Written by the shadow-port pass and read by the host runtime to
//! address individual memories and preload initial contents.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::wire::{check_magic, read_bytes, read_string, write_bytes, write_string};

pub const MEM_MAP_MAGIC: &[u8; 4] = b"EMM1";

const FLAG_INITIAL: u8 = 1 << 0;
const FLAG_INIT_FILE: u8 = 1 << 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemMap {
    /// Size of the byte-addressed shadow space.
    pub total_bytes: u32,
    /// Width of the unified address bus.
    pub addr_bits: u32,
    /// Width of the unified data bus (max memory width).
    pub data_bits: u32,
    pub memories: Vec<MemRegion>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemRegion {
    pub name: String,
    pub depth: u32,
    pub width: u32,
    /// Address bits of the memory itself (entry index width).
    pub addr_bits: u32,
    /// First byte address, 4-byte aligned.
    pub base: u32,
    /// One past the last byte address.
    pub end: u32,
    /// Static initial contents, `ceil(width/8) * depth` little-endian
    /// bytes, when the netlist carried an init.
    pub initial: Option<Vec<u8>>,
    /// `$readmem`-style init file and its hex (true) / binary flag.
    pub init_file: Option<(String, bool)>,
}

impl MemRegion {
    /// 32-bit words per entry in the shadow space.
    pub fn words_per_entry(&self) -> u32 {
        self.width.div_ceil(32).max(1)
    }

    /// Shadow byte address of entry `index`, word `word`.
    pub fn entry_addr(&self, index: u32, word: u32) -> u32 {
        self.base + (index * self.words_per_entry() + word) * 4
    }
}

impl MemMap {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(MEM_MAP_MAGIC)?;
        w.write_u32::<LittleEndian>(self.total_bytes)?;
        w.write_u32::<LittleEndian>(self.addr_bits)?;
        w.write_u32::<LittleEndian>(self.data_bits)?;
        w.write_u32::<LittleEndian>(self.memories.len() as u32)?;
        for mem in &self.memories {
            write_string(w, &mem.name)?;
            w.write_u32::<LittleEndian>(mem.depth)?;
            w.write_u32::<LittleEndian>(mem.width)?;
            w.write_u32::<LittleEndian>(mem.addr_bits)?;
            w.write_u32::<LittleEndian>(mem.base)?;
            w.write_u32::<LittleEndian>(mem.end)?;
            let mut flags = 0u8;
            if mem.initial.is_some() {
                flags |= FLAG_INITIAL;
            }
            if mem.init_file.is_some() {
                flags |= FLAG_INIT_FILE;
            }
            w.write_u8(flags)?;
            if let Some(bytes) = &mem.initial {
                write_bytes(w, bytes)?;
            }
            if let Some((path, hex)) = &mem.init_file {
                write_string(w, path)?;
                w.write_u8(*hex as u8)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        check_magic(r, MEM_MAP_MAGIC, "memory map")?;
        let total_bytes = r.read_u32::<LittleEndian>()?;
        let addr_bits = r.read_u32::<LittleEndian>()?;
        let data_bits = r.read_u32::<LittleEndian>()?;
        let n_mems = r.read_u32::<LittleEndian>()?;
        let mut memories = Vec::with_capacity(n_mems as usize);
        for _ in 0..n_mems {
            let name = read_string(r)?;
            let depth = r.read_u32::<LittleEndian>()?;
            let width = r.read_u32::<LittleEndian>()?;
            let addr_bits = r.read_u32::<LittleEndian>()?;
            let base = r.read_u32::<LittleEndian>()?;
            let end = r.read_u32::<LittleEndian>()?;
            let flags = r.read_u8()?;
            let initial = if flags & FLAG_INITIAL != 0 {
                Some(read_bytes(r)?)
            } else {
                None
            };
            let init_file = if flags & FLAG_INIT_FILE != 0 {
                let path = read_string(r)?;
                let hex = r.read_u8()? != 0;
                Some((path, hex))
            } else {
                None
            };
            memories.push(MemRegion {
                name,
                depth,
                width,
                addr_bits,
                base,
                end,
                initial,
                init_file,
            });
        }
        Ok(MemMap {
            total_bytes,
            addr_bits,
            data_bits,
            memories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let map = MemMap {
            total_bytes: 0x50,
            addr_bits: 7,
            data_bits: 32,
            memories: vec![
                MemRegion {
                    name: "scratch".to_string(),
                    depth: 16,
                    width: 8,
                    addr_bits: 4,
                    base: 0x00,
                    end: 0x40,
                    initial: Some(vec![0xaa; 16]),
                    init_file: None,
                },
                MemRegion {
                    name: "table".to_string(),
                    depth: 4,
                    width: 32,
                    addr_bits: 2,
                    base: 0x40,
                    end: 0x50,
                    initial: None,
                    init_file: Some(("boot.hex".to_string(), true)),
                },
            ],
        };

        let mut buf = Vec::new();
        map.write_to(&mut buf).unwrap();
        let back = MemMap::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn entry_addressing() {
        let mem = MemRegion {
            name: "m".to_string(),
            depth: 4,
            width: 32,
            addr_bits: 2,
            base: 0x40,
            end: 0x50,
            initial: None,
            init_file: None,
        };
        assert_eq!(mem.words_per_entry(), 1);
        assert_eq!(mem.entry_addr(1, 0), 0x44);

        let wide = MemRegion {
            name: "w".to_string(),
            depth: 2,
            width: 48,
            addr_bits: 1,
            base: 0,
            end: 16,
            initial: None,
            init_file: None,
        };
        assert_eq!(wide.words_per_entry(), 2);
        assert_eq!(wide.entry_addr(1, 1), 12);
    }
}
