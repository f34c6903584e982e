// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shadow access ports for embedded memories.
//!
//! Serial scan is far too slow for large memories, so each logical
//! memory gets a second read/write port pair reachable from a unified
//! byte-addressed interface. The pass:
//!
//! 1. appends a synchronous shadow read and write port to every memory
//!    (internal wires only; the DUT clock is reused since shadows are
//!    accessed while the DUT is frozen),
//! 2. assigns each memory a 4-byte-aligned base in a growing address
//!    space — every entry occupies `ceil(width/32)` words,
//! 3. extracts static initial contents into the memory map and clears
//!    the netlist inits (the runtime preload replaces them; `initial`
//!    blocks are wrong for FPGA synthesis anyway),
//! 4. synthesizes an address-decoding controller module, instantiates
//!    it and lifts the unified interface to the module ports.

use log::{debug, info};
use netir::memory::{MemRdPort, MemWrPort};
use netir::{ceil_log2, Const, Design, IrError, Module, SigSpec, State, WireId};

use emu_proto::memmap::{MemMap, MemRegion};

/// Unified shadow interface ports on the DUT.
pub const SHADOW_ADDR: &str = "emu_shadow_addr";
pub const SHADOW_WDATA: &str = "emu_shadow_wdata";
pub const SHADOW_RDATA: &str = "emu_shadow_rdata";
pub const SHADOW_WEN: &str = "emu_shadow_wen";
pub const SHADOW_REN: &str = "emu_shadow_ren";

/// Controller instance name inside the DUT.
pub const CTRL_INSTANCE: &str = "emu_mem_ctrl_inst";

/// Module stamps read by the wrapper pass and the host.
pub const N_MEMORIES_ATTR: &str = "emu_n_memories";
pub const ADDR_BITS_ATTR: &str = "emu_shadow_addr_bits";
pub const DATA_BITS_ATTR: &str = "emu_shadow_data_bits";
pub const TOTAL_BYTES_ATTR: &str = "emu_shadow_total_bytes";

#[derive(Clone, Debug)]
pub struct Options {
    /// Name for the generated controller module.
    pub ctrl_name: String,
    /// DUT clock input.
    pub clk_name: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            ctrl_name: "emu_mem_ctrl".to_string(),
            clk_name: "clk_i".to_string(),
        }
    }
}

struct MemInfo {
    name: String,
    width: usize,
    depth: usize,
    abits: usize,
    base: u32,
    addr: WireId,
    rdata: WireId,
    wdata: WireId,
    wen: WireId,
    ren: WireId,
    initial: Option<Vec<u8>>,
    init_file: Option<(String, bool)>,
}

impl MemInfo {
    fn words_per_entry(&self) -> u32 {
        (self.width as u32).div_ceil(32).max(1)
    }

    fn end(&self) -> u32 {
        self.base + self.depth as u32 * self.words_per_entry() * 4
    }
}

/// Attribute naming a `$readmem`-style init file for memory `name`.
pub fn readmem_file_attr(name: &str) -> String {
    format!("emu_readmem_file_{name}")
}

/// Companion flag: init file is hex (true) or binary.
pub fn readmem_hex_attr(name: &str) -> String {
    format!("emu_readmem_hex_{name}")
}

pub fn run(design: &mut Design, top: &str, opts: &Options) -> Result<Option<MemMap>, IrError> {
    let module = design
        .module_mut(top)
        .ok_or_else(|| IrError::InvalidArgument(format!("no module named {top}")))?;
    module.check()?;

    if module.memory_ids().is_empty() {
        debug!("{top}: no memories");
        return Ok(None);
    }

    let memories = add_shadow_ports(module, &opts.clk_name)?;

    let total_bytes = memories.last().map(|m| m.end()).unwrap_or(0);
    let addr_bits = ceil_log2(total_bytes as usize).max(2);
    let data_bits = memories.iter().map(|m| m.width).max().unwrap_or(1);

    module.set_attr(N_MEMORIES_ATTR, memories.len());
    module.set_attr(ADDR_BITS_ATTR, addr_bits);
    module.set_attr(DATA_BITS_ATTR, data_bits);
    module.set_attr(TOTAL_BYTES_ATTR, total_bytes as i64);

    let ctrl = generate_controller(&opts.ctrl_name, &memories, addr_bits, data_bits)?;
    design.add_module(ctrl);

    let module = design.module_mut(top).unwrap();
    instantiate_controller(module, opts, &memories, addr_bits, data_bits)?;
    module.check()?;

    info!(
        "{top}: {} memories shadowed, {total_bytes} bytes of address space",
        memories.len()
    );

    Ok(Some(build_map(&memories, total_bytes, addr_bits, data_bits)))
}

fn add_shadow_ports(module: &mut Module, clk_name: &str) -> Result<Vec<MemInfo>, IrError> {
    let clk = module.find_wire(clk_name).ok_or_else(|| {
        IrError::InvalidArgument(format!(
            "{}: clock '{clk_name}' not found; shadow ports need the DUT clock",
            module.name
        ))
    })?;
    let clk_sig = module.sig(clk);

    let mut memories = Vec::new();
    let mut next_addr = 0u32;

    for id in module.memory_ids() {
        let (name, width, depth, abits) = {
            let mem = module.memory(id);
            (mem.name.clone(), mem.width, mem.depth, mem.abits())
        };

        let init_file = module
            .attr_str(&readmem_file_attr(&name))
            .map(|f| f.to_string())
            .map(|f| {
                let hex = module
                    .attributes
                    .get(&readmem_hex_attr(&name))
                    .map(|v| v.as_bool())
                    .unwrap_or(true);
                (f, hex)
            });

        let prefix = format!("emu_shadow_{name}");
        let addr = module.add_wire(format!("{prefix}_addr"), abits);
        let rdata = module.add_wire(format!("{prefix}_rdata"), width);
        let wdata = module.add_wire(format!("{prefix}_wdata"), width);
        let wen = module.add_wire(format!("{prefix}_wen"), 1);
        let ren = module.add_wire(format!("{prefix}_ren"), 1);

        let (addr_sig, rdata_sig, wdata_sig, wen_sig, ren_sig) = (
            module.sig(addr),
            module.sig(rdata),
            module.sig(wdata),
            module.sig(wen),
            module.sig(ren),
        );

        // Broadcast the single write enable across all data lanes.
        let mut wen_lanes = SigSpec::new();
        for _ in 0..width {
            wen_lanes.push(wen_sig[0]);
        }

        let initial = {
            let mem = module.memory_mut(id);
            let n_wr = mem.wr_ports.len();
            mem.rd_ports.push(MemRdPort::sync(
                clk_sig.clone(),
                ren_sig,
                addr_sig.clone(),
                rdata_sig,
                n_wr,
            ));
            mem.wr_ports.push(MemWrPort {
                clk: clk_sig.clone(),
                en: wen_lanes,
                addr: addr_sig,
                data: wdata_sig,
                clk_enable: true,
                clk_polarity: true,
                priority_mask: Vec::new(),
            });
            mem.fixup_port_masks();

            let initial = extract_init(mem.width, mem.depth, &mem.init);
            if initial.is_some() {
                mem.clear_init();
            }
            initial
        };

        let info = MemInfo {
            name,
            width,
            depth,
            abits,
            base: next_addr,
            addr,
            rdata,
            wdata,
            wen,
            ren,
            initial,
            init_file,
        };
        next_addr = info.end();

        debug!(
            "{}: memory {} depth={} width={} base={:#x} end={:#x}",
            module.name,
            info.name,
            info.depth,
            info.width,
            info.base,
            info.end()
        );
        memories.push(info);
    }

    Ok(memories)
}

/// Pack defined init bits into little-endian bytes; `None` when the
/// memory has no defined init bit at all.
fn extract_init(width: usize, depth: usize, init: &Const) -> Option<Vec<u8>> {
    if !init.has_def_bit() {
        return None;
    }
    let bytes_per_entry = width.div_ceil(8);
    let mut bytes = vec![0u8; bytes_per_entry * depth];
    for entry in 0..depth {
        for bit in 0..width {
            let idx = entry * width + bit;
            if idx < init.len() && init.bit(idx) == State::S1 {
                bytes[entry * bytes_per_entry + bit / 8] |= 1 << (bit % 8);
            }
        }
    }
    Some(bytes)
}

/// The address-decoding controller: range comparators select a memory,
/// the local word address is a bit-slice of the offset, and read data
/// cascades through a mux chain that prefers lower-indexed memories.
fn generate_controller(
    ctrl_name: &str,
    memories: &[MemInfo],
    addr_bits: usize,
    data_bits: usize,
) -> Result<Module, IrError> {
    let mut ctrl = Module::new(ctrl_name);

    let clk = ctrl.add_wire("clk_i", 1);
    ctrl.wire_mut(clk).port_input = true;
    let addr = ctrl.add_wire("addr_i", addr_bits);
    ctrl.wire_mut(addr).port_input = true;
    let wdata = ctrl.add_wire("wdata_i", data_bits);
    ctrl.wire_mut(wdata).port_input = true;
    let rdata = ctrl.add_wire("rdata_o", data_bits);
    ctrl.wire_mut(rdata).port_output = true;
    let wen = ctrl.add_wire("wen_i", 1);
    ctrl.wire_mut(wen).port_input = true;
    let ren = ctrl.add_wire("ren_i", 1);
    ctrl.wire_mut(ren).port_input = true;

    let mut mem_ports = Vec::new();
    for (i, mem) in memories.iter().enumerate() {
        let a = ctrl.add_wire(format!("mem{i}_addr_o"), mem.abits);
        ctrl.wire_mut(a).port_output = true;
        let r = ctrl.add_wire(format!("mem{i}_rdata_i"), mem.width);
        ctrl.wire_mut(r).port_input = true;
        let w = ctrl.add_wire(format!("mem{i}_wdata_o"), mem.width);
        ctrl.wire_mut(w).port_output = true;
        let we = ctrl.add_wire(format!("mem{i}_wen_o"), 1);
        ctrl.wire_mut(we).port_output = true;
        let re = ctrl.add_wire(format!("mem{i}_ren_o"), 1);
        ctrl.wire_mut(re).port_output = true;
        mem_ports.push((a, r, w, we, re));
    }
    ctrl.fixup_ports();

    let addr_sig = ctrl.sig(addr);
    let mut sels = Vec::new();

    for (i, mem) in memories.iter().enumerate() {
        let (m_addr, _, m_wdata, m_wen, m_ren) = mem_ports[i];

        // sel = (addr >= base) && (addr < end), unsigned.
        let ge = ctrl.add_wire_auto(1);
        let ge_sig = ctrl.sig(ge);
        ctrl.add_ge(
            addr_sig.clone(),
            SigSpec::from_const(&Const::from_u64(mem.base as u64, addr_bits)),
            ge_sig.clone(),
        );
        let lt = ctrl.add_wire_auto(1);
        let lt_sig = ctrl.sig(lt);
        ctrl.add_lt(
            addr_sig.clone(),
            SigSpec::from_const(&Const::from_u64(mem.end() as u64, addr_bits)),
            lt_sig.clone(),
        );
        let sel = ctrl.add_wire_auto(1);
        let sel_sig = ctrl.sig(sel);
        ctrl.add_and(ge_sig, lt_sig, sel_sig.clone());
        sels.push(sel_sig.clone());

        // Local word address: bits [2 .. 2+abits) of (addr - base).
        // Tiny memories can have more index bits than the offset holds
        // (a depth-1 memory still indexes with one bit); pad with zeros.
        let offset = ctrl.add_wire_auto(addr_bits);
        let offset_sig = ctrl.sig(offset);
        ctrl.add_sub(
            addr_sig.clone(),
            SigSpec::from_const(&Const::from_u64(mem.base as u64, addr_bits)),
            offset_sig.clone(),
        );
        let avail = addr_bits.saturating_sub(2).min(mem.abits);
        let local = offset_sig.extract(2, avail).zero_padded(mem.abits);
        let m_addr_sig = ctrl.sig(m_addr);
        ctrl.connect(m_addr_sig, local);

        // Write data is a right-truncation of the unified bus.
        let wdata_sig = ctrl.sig(wdata).extract(0, mem.width);
        let m_wdata_sig = ctrl.sig(m_wdata);
        ctrl.connect(m_wdata_sig, wdata_sig);

        let (wen_sig, m_wen_sig) = (ctrl.sig(wen), ctrl.sig(m_wen));
        ctrl.add_and(wen_sig, sel_sig.clone(), m_wen_sig);
        let (ren_sig, m_ren_sig) = (ctrl.sig(ren), ctrl.sig(m_ren));
        ctrl.add_and(ren_sig, sel_sig, m_ren_sig);
    }

    // rdata = sel0 ? pad(rdata0) : sel1 ? pad(rdata1) : … : 0
    let mut acc = SigSpec::from_const(&Const::zeros(data_bits));
    for (i, _mem) in memories.iter().enumerate().rev() {
        let (_, m_rdata, ..) = mem_ports[i];
        let padded = ctrl.sig(m_rdata).zero_padded(data_bits);
        let out = ctrl.add_wire_auto(data_bits);
        let out_sig = ctrl.sig(out);
        ctrl.add_mux(acc, padded, sels[i].clone(), out_sig.clone());
        acc = out_sig;
    }
    let rdata_sig = ctrl.sig(rdata);
    ctrl.connect(rdata_sig, acc);

    ctrl.check()?;
    info!(
        "{ctrl_name}: {} memories, {addr_bits} addr bits, {data_bits} data bits",
        memories.len()
    );
    Ok(ctrl)
}

fn instantiate_controller(
    module: &mut Module,
    opts: &Options,
    memories: &[MemInfo],
    addr_bits: usize,
    data_bits: usize,
) -> Result<(), IrError> {
    let clk = module
        .find_wire(&opts.clk_name)
        .ok_or_else(|| IrError::InvalidIr(format!("clock '{}' vanished", opts.clk_name)))?;

    let addr = module.add_wire(SHADOW_ADDR, addr_bits);
    module.wire_mut(addr).port_input = true;
    let wdata = module.add_wire(SHADOW_WDATA, data_bits);
    module.wire_mut(wdata).port_input = true;
    let rdata = module.add_wire(SHADOW_RDATA, data_bits);
    module.wire_mut(rdata).port_output = true;
    let wen = module.add_wire(SHADOW_WEN, 1);
    module.wire_mut(wen).port_input = true;
    let ren = module.add_wire(SHADOW_REN, 1);
    module.wire_mut(ren).port_input = true;
    module.fixup_ports();

    let inst = module.add_cell(
        CTRL_INSTANCE,
        netir::CellType::User(opts.ctrl_name.clone()),
    );
    let clk_sig = module.sig(clk);
    let (addr_sig, wdata_sig, rdata_sig, wen_sig, ren_sig) = (
        module.sig(addr),
        module.sig(wdata),
        module.sig(rdata),
        module.sig(wen),
        module.sig(ren),
    );
    let mut mem_conns = Vec::new();
    for (i, mem) in memories.iter().enumerate() {
        mem_conns.push((
            format!("mem{i}_addr_o"),
            module.sig(mem.addr),
        ));
        mem_conns.push((format!("mem{i}_rdata_i"), module.sig(mem.rdata)));
        mem_conns.push((format!("mem{i}_wdata_o"), module.sig(mem.wdata)));
        mem_conns.push((format!("mem{i}_wen_o"), module.sig(mem.wen)));
        mem_conns.push((format!("mem{i}_ren_o"), module.sig(mem.ren)));
    }

    let cell = module.cell_mut(inst);
    cell.set_port("clk_i", clk_sig);
    cell.set_port("addr_i", addr_sig);
    cell.set_port("wdata_i", wdata_sig);
    cell.set_port("rdata_o", rdata_sig);
    cell.set_port("wen_i", wen_sig);
    cell.set_port("ren_i", ren_sig);
    for (port, sig) in mem_conns {
        cell.set_port(&port, sig);
    }

    Ok(())
}

fn build_map(
    memories: &[MemInfo],
    total_bytes: u32,
    addr_bits: usize,
    data_bits: usize,
) -> MemMap {
    MemMap {
        total_bytes,
        addr_bits: addr_bits as u32,
        data_bits: data_bits as u32,
        memories: memories
            .iter()
            .map(|m| MemRegion {
                name: m.name.clone(),
                depth: m.depth as u32,
                width: m.width as u32,
                addr_bits: m.abits as u32,
                base: m.base,
                end: m.end(),
                initial: m.initial.clone(),
                init_file: m.init_file.clone(),
            })
            .collect(),
    }
}
