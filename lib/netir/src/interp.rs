// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small cycle-level interpreter over the IR.
//!
//! Supports the primitives the passes read and emit: the combinational
//! cells, the flip-flop family and logical memories with synchronous
//! ports. One [`Interp::step`] models a posedge of the single design
//! clock; combinational logic settles by bounded fixpoint iteration.
//! Undefined (`x`) values propagate pessimistically.
//!
//! This exists for the test suites: scan round-trips, the gating
//! behavior of the instrument pass, shadow-controller routing and the
//! bounded equivalence check of scan insertion all run on it. It is not
//! a simulator for end users.

use indexmap::IndexMap;

use crate::module::{CellType, Module};
use crate::sigspec::{Bit, CellId, MemoryId, SigSpec, WireId};
use crate::value::{Const, State};

pub struct Interp<'a> {
    module: &'a Module,
    values: IndexMap<WireId, Vec<State>>,
    mems: IndexMap<MemoryId, Vec<State>>,
}

impl<'a> Interp<'a> {
    pub fn new(module: &'a Module) -> Self {
        let mut values = IndexMap::new();
        for (id, wire) in module.wires() {
            values.insert(id, vec![State::Sx; wire.width]);
        }
        let mut interp = Interp {
            module,
            values,
            mems: IndexMap::new(),
        };

        // Sequential elements power up at zero; memory read registers too.
        for (_, cell) in module.cells() {
            if cell.ty.is_ff() {
                if let Some(q) = cell.port("Q") {
                    let zeros = vec![State::S0; q.len()];
                    interp.write_sig(q, &zeros);
                }
            }
        }
        for (id, mem) in module.memories() {
            let mut contents = vec![State::Sx; mem.width * mem.depth];
            for (i, s) in mem.init.bits().iter().enumerate() {
                contents[i] = *s;
            }
            interp.mems.insert(id, contents);
            for rd in &mem.rd_ports {
                if rd.clk_enable {
                    let zeros = vec![State::S0; rd.data.len()];
                    interp.write_sig(&rd.data, &zeros);
                }
            }
        }
        interp.settle();
        interp
    }

    pub fn set_input(&mut self, name: &str, value: u64) {
        let id = self
            .module
            .find_wire(name)
            .unwrap_or_else(|| panic!("no wire named {name}"));
        let width = self.module.wire(id).width;
        let c = Const::from_u64(value, width);
        self.values.insert(id, c.bits().to_vec());
        self.settle();
    }

    pub fn set_input_bits(&mut self, name: &str, value: &Const) {
        let id = self
            .module
            .find_wire(name)
            .unwrap_or_else(|| panic!("no wire named {name}"));
        assert_eq!(self.module.wire(id).width, value.len());
        self.values.insert(id, value.bits().to_vec());
        self.settle();
    }

    pub fn get(&self, name: &str) -> Const {
        let id = self
            .module
            .find_wire(name)
            .unwrap_or_else(|| panic!("no wire named {name}"));
        Const::new(self.values[&id].clone())
    }

    pub fn peek(&self, sig: &SigSpec) -> Const {
        Const::new(self.read_sig(sig))
    }

    /// Raw memory contents, entry-major LSB first.
    pub fn memory_contents(&self, id: MemoryId) -> Const {
        Const::new(self.mems[&id].clone())
    }

    fn bit_value(&self, bit: &Bit) -> State {
        match bit {
            Bit::Const(s) => *s,
            Bit::Wire(id, off) => self.values[id][*off],
        }
    }

    fn read_sig(&self, sig: &SigSpec) -> Vec<State> {
        sig.iter().map(|b| self.bit_value(b)).collect()
    }

    fn write_sig(&mut self, sig: &SigSpec, values: &[State]) -> bool {
        let mut changed = false;
        for (bit, v) in sig.iter().zip(values.iter()) {
            if let Bit::Wire(id, off) = bit {
                let slot = &mut self.values.get_mut(id).expect("stale wire")[*off];
                if *slot != *v {
                    *slot = *v;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Propagate connections and combinational cells to a fixpoint.
    pub fn settle(&mut self) {
        let max_iters = self.module.cell_ids().len() + self.module.connections.len() + 2;
        for _ in 0..max_iters {
            let mut changed = false;

            for conn in &self.module.connections {
                let vals = self.read_sig(&conn.rhs);
                let lhs = conn.lhs.clone();
                if self.write_sig(&lhs, &vals) {
                    changed = true;
                }
            }

            for id in self.module.cell_ids() {
                if self.eval_comb_cell(id) {
                    changed = true;
                }
            }

            for mid in self.module.memory_ids() {
                for rd in &self.module.memory(mid).rd_ports {
                    if rd.clk_enable {
                        continue;
                    }
                    let data = self.mem_read(mid, &rd.addr, rd.data.len());
                    if self.write_sig(&rd.data, &data) {
                        changed = true;
                    }
                }
            }

            if !changed {
                return;
            }
        }
        log::warn!(
            "{}: combinational evaluation did not settle",
            self.module.name
        );
    }

    /// Advance one posedge of the design clock.
    pub fn step(&mut self) {
        self.settle();

        // Sample everything before committing any state.
        let mut ff_updates: Vec<(SigSpec, Vec<State>)> = Vec::new();
        for id in self.module.cell_ids() {
            if let Some(update) = self.ff_next(id) {
                ff_updates.push(update);
            }
        }

        let mut mem_writes: Vec<(MemoryId, u64, Vec<State>, Vec<State>)> = Vec::new();
        let mut mem_reads: Vec<(SigSpec, Vec<State>)> = Vec::new();
        for mid in self.module.memory_ids() {
            let mem = self.module.memory(mid);
            for rd in &mem.rd_ports {
                if !rd.clk_enable {
                    continue;
                }
                if self.active(&rd.en, true) != Some(true) {
                    continue;
                }
                let data = self.mem_read(mid, &rd.addr, rd.data.len());
                mem_reads.push((rd.data.clone(), data));
            }
            for wr in &mem.wr_ports {
                if !wr.clk_enable {
                    continue;
                }
                let lanes = self.read_sig(&wr.en);
                if !lanes.iter().any(|l| *l != State::S0) {
                    continue;
                }
                let addr = match Const::new(self.read_sig(&wr.addr)).as_u64() {
                    Some(a) if (a as usize) < mem.depth => a,
                    _ => continue,
                };
                let data = self.read_sig(&wr.data);
                mem_writes.push((mid, addr, lanes, data));
            }
        }

        for (sig, vals) in ff_updates {
            self.write_sig(&sig, &vals);
        }
        for (mid, addr, lanes, data) in mem_writes {
            let width = self.module.memory(mid).width;
            let contents = self.mems.get_mut(&mid).expect("stale memory");
            let base = addr as usize * width;
            for (lane, (en, d)) in lanes.iter().zip(data.iter()).enumerate() {
                match en {
                    State::S1 => contents[base + lane] = *d,
                    State::S0 => {}
                    _ => contents[base + lane] = State::Sx,
                }
            }
        }
        for (sig, vals) in mem_reads {
            self.write_sig(&sig, &vals);
        }

        self.settle();
    }

    fn mem_read(&self, mid: MemoryId, addr: &SigSpec, width: usize) -> Vec<State> {
        let mem = self.module.memory(mid);
        match Const::new(self.read_sig(addr)).as_u64() {
            Some(a) if (a as usize) < mem.depth => {
                let base = a as usize * mem.width;
                self.mems[&mid][base..base + width].to_vec()
            }
            _ => vec![State::Sx; width],
        }
    }

    /// Sample a 1-bit control with the given active polarity.
    /// `None` means undefined.
    fn active(&self, sig: &SigSpec, polarity: bool) -> Option<bool> {
        if sig.is_empty() {
            return Some(true);
        }
        match self.bit_value(&sig[0]) {
            State::S0 => Some(!polarity),
            State::S1 => Some(polarity),
            _ => None,
        }
    }

    fn ff_next(&self, id: CellId) -> Option<(SigSpec, Vec<State>)> {
        let cell = self.module.cell(id);
        if !cell.ty.is_ff() {
            return None;
        }
        let q = cell.port("Q")?.clone();
        let width = q.len();
        let cur = self.read_sig(&q);
        let d = cell.port("D").map(|s| self.read_sig(s)).unwrap_or_default();

        let pol = |name: &str| cell.param_int(name).unwrap_or(1) != 0;
        let en_active = || match cell.port("EN") {
            Some(en) => self.active(en, pol("EN_POLARITY")),
            None => Some(true),
        };
        let value_param = |name: &str| {
            cell.param_const(name)
                .unwrap_or_else(|| Const::zeros(width))
                .bits()
                .to_vec()
        };
        let undef = vec![State::Sx; width];

        let next = match &cell.ty {
            CellType::Dff => d,
            CellType::Dffe => match en_active() {
                Some(true) => d,
                Some(false) => cur,
                None => undef,
            },
            CellType::Sdff => match self.active(cell.port("SRST")?, pol("SRST_POLARITY")) {
                Some(true) => value_param("SRST_VALUE"),
                Some(false) => d,
                None => undef,
            },
            // Reset overrides enable.
            CellType::Sdffe => match self.active(cell.port("SRST")?, pol("SRST_POLARITY")) {
                Some(true) => value_param("SRST_VALUE"),
                Some(false) => match en_active() {
                    Some(true) => d,
                    Some(false) => cur,
                    None => undef,
                },
                None => undef,
            },
            // Enable overrides reset.
            CellType::Sdffce => match en_active() {
                Some(true) => match self.active(cell.port("SRST")?, pol("SRST_POLARITY")) {
                    Some(true) => value_param("SRST_VALUE"),
                    Some(false) => d,
                    None => undef,
                },
                Some(false) => cur,
                None => undef,
            },
            CellType::Adff | CellType::Adffe => {
                match self.active(cell.port("ARST")?, pol("ARST_POLARITY")) {
                    Some(true) => value_param("ARST_VALUE"),
                    Some(false) => match en_active() {
                        Some(true) => d,
                        Some(false) => cur,
                        None => undef,
                    },
                    None => undef,
                }
            }
            CellType::Aldff | CellType::Aldffe => {
                match self.active(cell.port("ALOAD")?, pol("ALOAD_POLARITY")) {
                    Some(true) => cell.port("AD").map(|s| self.read_sig(s))?,
                    Some(false) => match en_active() {
                        Some(true) => d,
                        Some(false) => cur,
                        None => undef,
                    },
                    None => undef,
                }
            }
            CellType::Dffsr | CellType::Dffsre => {
                let set = cell.port("SET").map(|s| self.read_sig(s))?;
                let clr = cell.port("CLR").map(|s| self.read_sig(s))?;
                let set_pol = pol("SET_POLARITY");
                let clr_pol = pol("CLR_POLARITY");
                let base = match en_active() {
                    Some(true) => d,
                    Some(false) => cur,
                    None => undef.clone(),
                };
                base.iter()
                    .enumerate()
                    .map(|(i, b)| {
                        let s = set[i] == State::from_bool(set_pol);
                        let c = clr[i] == State::from_bool(clr_pol);
                        if c {
                            State::S0
                        } else if s {
                            State::S1
                        } else {
                            *b
                        }
                    })
                    .collect()
            }
            _ => return None,
        };
        Some((q, next))
    }

    fn eval_comb_cell(&mut self, id: CellId) -> bool {
        let cell = self.module.cell(id);
        let y_sig = match cell.port("Y") {
            Some(y) => y.clone(),
            None => return false,
        };
        let a = cell.port("A").map(|s| self.read_sig(s)).unwrap_or_default();
        let b = cell.port("B").map(|s| self.read_sig(s)).unwrap_or_default();
        let width = y_sig.len();

        let out = match &cell.ty {
            CellType::And => bitwise(&a, &b, width, |x, y| match (x, y) {
                (State::S0, _) | (_, State::S0) => State::S0,
                (State::S1, State::S1) => State::S1,
                _ => State::Sx,
            }),
            CellType::Or => bitwise(&a, &b, width, |x, y| match (x, y) {
                (State::S1, _) | (_, State::S1) => State::S1,
                (State::S0, State::S0) => State::S0,
                _ => State::Sx,
            }),
            CellType::Not => (0..width)
                .map(|i| match a.get(i).copied().unwrap_or(State::S0) {
                    State::S0 => State::S1,
                    State::S1 => State::S0,
                    _ => State::Sx,
                })
                .collect(),
            CellType::Mux => {
                let s = cell.port("S").map(|s| self.read_sig(s)).unwrap_or_default();
                match s.first() {
                    Some(State::S0) => a,
                    Some(State::S1) => b,
                    _ => a
                        .iter()
                        .zip(b.iter())
                        .map(|(x, y)| if x == y { *x } else { State::Sx })
                        .collect(),
                }
            }
            CellType::Pmux => {
                let s = cell.port("S").map(|s| self.read_sig(s)).unwrap_or_default();
                if s.iter().any(|b| !b.is_def()) {
                    vec![State::Sx; width]
                } else {
                    let hot: Vec<usize> = s
                        .iter()
                        .enumerate()
                        .filter(|(_, b)| **b == State::S1)
                        .map(|(i, _)| i)
                        .collect();
                    match hot.as_slice() {
                        [] => a,
                        [case] => b[case * width..(case + 1) * width].to_vec(),
                        _ => vec![State::Sx; width],
                    }
                }
            }
            CellType::ReduceOr => {
                let v = if a.iter().any(|b| *b == State::S1) {
                    State::S1
                } else if a.iter().all(|b| *b == State::S0) {
                    State::S0
                } else {
                    State::Sx
                };
                let mut out = vec![State::S0; width];
                out[0] = v;
                out
            }
            CellType::Eq => {
                let n = a.len().max(b.len());
                let mut known_mismatch = false;
                let mut any_undef = false;
                for i in 0..n {
                    let x = a.get(i).copied().unwrap_or(State::S0);
                    let y = b.get(i).copied().unwrap_or(State::S0);
                    if !x.is_def() || !y.is_def() {
                        any_undef = true;
                    } else if x != y {
                        known_mismatch = true;
                    }
                }
                let v = if known_mismatch {
                    State::S0
                } else if any_undef {
                    State::Sx
                } else {
                    State::S1
                };
                let mut out = vec![State::S0; width];
                out[0] = v;
                out
            }
            CellType::Ge | CellType::Lt => {
                let v = match unsigned_cmp(&a, &b) {
                    Some(ord) => {
                        let r = if cell.ty == CellType::Ge {
                            ord != std::cmp::Ordering::Less
                        } else {
                            ord == std::cmp::Ordering::Less
                        };
                        State::from_bool(r)
                    }
                    None => State::Sx,
                };
                let mut out = vec![State::S0; width];
                out[0] = v;
                out
            }
            CellType::Sub => {
                if a.iter().any(|b| !b.is_def()) || b.iter().any(|x| !x.is_def()) {
                    vec![State::Sx; width]
                } else {
                    let mut out = Vec::with_capacity(width);
                    let mut borrow = false;
                    for i in 0..width {
                        let x = a.get(i) == Some(&State::S1);
                        let y = b.get(i) == Some(&State::S1);
                        let diff = x ^ y ^ borrow;
                        borrow = (!x & y) | (!x & borrow) | (y & borrow);
                        out.push(State::from_bool(diff));
                    }
                    out
                }
            }
            _ => return false,
        };

        self.write_sig(&y_sig, &out)
    }
}

fn bitwise(a: &[State], b: &[State], width: usize, f: impl Fn(State, State) -> State) -> Vec<State> {
    (0..width)
        .map(|i| {
            f(
                a.get(i).copied().unwrap_or(State::S0),
                b.get(i).copied().unwrap_or(State::S0),
            )
        })
        .collect()
}

fn unsigned_cmp(a: &[State], b: &[State]) -> Option<std::cmp::Ordering> {
    let n = a.len().max(b.len());
    for i in (0..n).rev() {
        let x = a.get(i).copied().unwrap_or(State::S0);
        let y = b.get(i).copied().unwrap_or(State::S0);
        if !x.is_def() || !y.is_def() {
            return None;
        }
        if x != y {
            return Some(if x == State::S1 {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Less
            });
        }
    }
    Some(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::CellType;

    /// An 8-bit counter: q <= q + 1 built from sub (q - (-1)) would be
    /// contrived; use an explicit adder-free model: q <= d where
    /// d = mux(q, q_plus). For interp tests a simple passthrough FF and
    /// gate mix is enough.
    #[test]
    fn dff_steps_and_holds() {
        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let d = m.add_wire("d", 4);
        m.wire_mut(d).port_input = true;
        let q = m.add_wire("q", 4);
        m.wire_mut(q).port_output = true;
        let ff = m.add_cell("ff", CellType::Dff);
        let (cs, ds, qs) = (m.sig(clk), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 4usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_port("CLK", cs);
            cell.set_port("D", ds);
            cell.set_port("Q", qs);
        }
        m.fixup_ports();
        m.check().unwrap();

        let mut sim = Interp::new(&m);
        assert_eq!(sim.get("q").as_u64(), Some(0));
        sim.set_input("d", 9);
        assert_eq!(sim.get("q").as_u64(), Some(0));
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(9));
    }

    #[test]
    fn dffe_respects_enable() {
        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let en = m.add_wire("en", 1);
        m.wire_mut(en).port_input = true;
        let d = m.add_wire("d", 2);
        m.wire_mut(d).port_input = true;
        let q = m.add_wire("q", 2);
        m.wire_mut(q).port_output = true;
        let ff = m.add_cell("ff", CellType::Dffe);
        let (cs, es, ds, qs) = (m.sig(clk), m.sig(en), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 2usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_param("EN_POLARITY", 1i64);
            cell.set_port("CLK", cs);
            cell.set_port("EN", es);
            cell.set_port("D", ds);
            cell.set_port("Q", qs);
        }
        m.fixup_ports();

        let mut sim = Interp::new(&m);
        sim.set_input("d", 3);
        sim.set_input("en", 0);
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(0));
        sim.set_input("en", 1);
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(3));
    }

    #[test]
    fn mux_and_gates_settle_through_connections() {
        let mut m = Module::new("t");
        let a = m.add_wire("a", 1);
        m.wire_mut(a).port_input = true;
        let b = m.add_wire("b", 1);
        m.wire_mut(b).port_input = true;
        let s = m.add_wire("s", 1);
        m.wire_mut(s).port_input = true;
        let y = m.add_wire("y", 1);
        let out = m.add_wire("out", 1);
        m.wire_mut(out).port_output = true;
        let (sa, sb, ss, sy, so) = (m.sig(a), m.sig(b), m.sig(s), m.sig(y), m.sig(out));
        m.add_mux(sa, sb, ss, sy.clone());
        m.connect(so, sy);
        m.fixup_ports();

        let mut sim = Interp::new(&m);
        sim.set_input("a", 0);
        sim.set_input("b", 1);
        sim.set_input("s", 1);
        assert_eq!(sim.get("out").as_u64(), Some(1));
        sim.set_input("s", 0);
        assert_eq!(sim.get("out").as_u64(), Some(0));
    }

    #[test]
    fn memory_write_then_read() {
        use crate::memory::{MemRdPort, MemWrPort, Memory};

        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let addr = m.add_wire("addr", 2);
        m.wire_mut(addr).port_input = true;
        let wdata = m.add_wire("wdata", 8);
        m.wire_mut(wdata).port_input = true;
        let wen = m.add_wire("wen", 1);
        m.wire_mut(wen).port_input = true;
        let ren = m.add_wire("ren", 1);
        m.wire_mut(ren).port_input = true;
        let rdata = m.add_wire("rdata", 8);
        m.wire_mut(rdata).port_output = true;

        let mut mem = Memory::new("ram", 8, 4);
        let clk_s = m.sig(clk);
        let mut wen_lanes = SigSpec::new();
        for _ in 0..8 {
            wen_lanes.push(m.sig(wen)[0]);
        }
        mem.wr_ports.push(MemWrPort {
            clk: clk_s.clone(),
            en: wen_lanes,
            addr: m.sig(addr),
            data: m.sig(wdata),
            clk_enable: true,
            clk_polarity: true,
            priority_mask: Vec::new(),
        });
        mem.rd_ports.push(MemRdPort::sync(
            clk_s,
            m.sig(ren),
            m.sig(addr),
            m.sig(rdata),
            1,
        ));
        mem.fixup_port_masks();
        m.add_memory(mem);
        m.fixup_ports();

        let mut sim = Interp::new(&m);
        sim.set_input("addr", 2);
        sim.set_input("wdata", 0xAB);
        sim.set_input("wen", 1);
        sim.set_input("ren", 0);
        sim.step();
        sim.set_input("wen", 0);
        sim.set_input("ren", 1);
        sim.step();
        assert_eq!(sim.get("rdata").as_u64(), Some(0xAB));
    }
}
