// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logical memories: width × depth arrays with read/write port
//! descriptors, owned by a module.

use indexmap::IndexMap;

use crate::sigspec::SigSpec;
use crate::value::{AttrValue, Const};
use crate::ceil_log2;

/// A memory read port.
#[derive(Clone, Debug)]
pub struct MemRdPort {
    pub clk: SigSpec,
    pub en: SigSpec,
    pub addr: SigSpec,
    pub data: SigSpec,
    /// Synchronous (clocked) read when true, combinational otherwise.
    pub clk_enable: bool,
    pub clk_polarity: bool,
    pub init_value: Const,
    pub arst_value: Const,
    pub srst_value: Const,
    /// Per write port: reads see same-cycle writes from that port.
    pub transparency_mask: Vec<bool>,
    /// Per write port: same-address collisions yield undefined data.
    pub collision_x_mask: Vec<bool>,
}

impl MemRdPort {
    /// A synchronous, enable-gated read port with no reset behavior and
    /// no transparency, for `n_wr` existing write ports.
    pub fn sync(clk: SigSpec, en: SigSpec, addr: SigSpec, data: SigSpec, n_wr: usize) -> Self {
        let width = data.len();
        MemRdPort {
            clk,
            en,
            addr,
            data,
            clk_enable: true,
            clk_polarity: true,
            init_value: Const::undef(width),
            arst_value: Const::undef(width),
            srst_value: Const::undef(width),
            transparency_mask: vec![false; n_wr],
            collision_x_mask: vec![false; n_wr],
        }
    }
}

/// A memory write port. `en` carries one enable bit per data lane.
#[derive(Clone, Debug)]
pub struct MemWrPort {
    pub clk: SigSpec,
    pub en: SigSpec,
    pub addr: SigSpec,
    pub data: SigSpec,
    pub clk_enable: bool,
    pub clk_polarity: bool,
    /// Per earlier write port: this port wins same-address collisions.
    pub priority_mask: Vec<bool>,
}

/// A logical memory.
#[derive(Clone, Debug)]
pub struct Memory {
    pub name: String,
    pub width: usize,
    pub depth: usize,
    pub rd_ports: Vec<MemRdPort>,
    pub wr_ports: Vec<MemWrPort>,
    /// Static initial contents, `width * depth` bits (entry 0 first),
    /// empty when the memory has no init.
    pub init: Const,
    pub attributes: IndexMap<String, AttrValue>,
}

impl Memory {
    pub fn new(name: impl Into<String>, width: usize, depth: usize) -> Self {
        Memory {
            name: name.into(),
            width,
            depth,
            rd_ports: Vec::new(),
            wr_ports: Vec::new(),
            init: Const::default(),
            attributes: IndexMap::new(),
        }
    }

    /// Address width needed to index this memory.
    pub fn abits(&self) -> usize {
        ceil_log2(self.depth)
    }

    /// True if any init bit is a defined 0 or 1.
    pub fn has_init(&self) -> bool {
        self.init.has_def_bit()
    }

    pub fn clear_init(&mut self) {
        self.init = Const::default();
    }

    /// Resize every per-port mask to the current write port count. Must
    /// be called after appending a port.
    pub fn fixup_port_masks(&mut self) {
        let n_wr = self.wr_ports.len();
        for rd in &mut self.rd_ports {
            rd.transparency_mask.resize(n_wr, false);
            rd.collision_x_mask.resize(n_wr, false);
        }
        for wr in &mut self.wr_ports {
            wr.priority_mask.resize(n_wr, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abits() {
        assert_eq!(Memory::new("m", 8, 16).abits(), 4);
        assert_eq!(Memory::new("m", 8, 17).abits(), 5);
        assert_eq!(Memory::new("m", 8, 1).abits(), 1);
    }

    #[test]
    fn mask_fixup_covers_new_ports() {
        let mut m = Memory::new("m", 8, 4);
        m.rd_ports.push(MemRdPort::sync(
            SigSpec::new(),
            SigSpec::new(),
            SigSpec::new(),
            SigSpec::zeros(8),
            0,
        ));
        m.wr_ports.push(MemWrPort {
            clk: SigSpec::new(),
            en: SigSpec::zeros(8),
            addr: SigSpec::new(),
            data: SigSpec::zeros(8),
            clk_enable: true,
            clk_polarity: true,
            priority_mask: Vec::new(),
        });
        m.fixup_port_masks();
        assert_eq!(m.rd_ports[0].transparency_mask.len(), 1);
        assert_eq!(m.wr_ports[0].priority_mask.len(), 1);
    }
}
