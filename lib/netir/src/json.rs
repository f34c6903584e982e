// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The stable JSON netlist form.
//!
//! This is both the input format of the pipeline driver and the
//! "transformed design" artefact downstream tools consume. Wires become
//! per-module net numbers (starting at 2; the strings `"0"`, `"1"`,
//! `"x"`, `"z"` are constant bits), cells carry their parameters and
//! per-port bit lists, and logical memories are serialized with their
//! full port descriptors.
//!
//! String-typed parameters are written with a single trailing space so a
//! reader can tell them apart from `[01xz]` bit-vector constants; the
//! space is stripped on read.

use std::io;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::IrError;
use crate::memory::{Memory, MemRdPort, MemWrPort};
use crate::module::{CellType, Connection, Design, Module};
use crate::sigspec::{Bit, SigSpec, WireId};
use crate::value::{AttrValue, Const, State};

#[derive(Serialize, Deserialize)]
struct JDesign {
    modules: IndexMap<String, JModule>,
}

#[derive(Serialize, Deserialize, Default)]
struct JModule {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    attributes: IndexMap<String, JValue>,
    #[serde(default)]
    ports: IndexMap<String, JPort>,
    #[serde(default)]
    cells: IndexMap<String, JCell>,
    #[serde(default)]
    netnames: IndexMap<String, JNet>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    memories: IndexMap<String, JMemory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    connections: Vec<(Vec<JBit>, Vec<JBit>)>,
}

#[derive(Serialize, Deserialize)]
struct JPort {
    direction: String,
    bits: Vec<JBit>,
}

#[derive(Serialize, Deserialize)]
struct JCell {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    parameters: IndexMap<String, JValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    attributes: IndexMap<String, JValue>,
    #[serde(default)]
    connections: IndexMap<String, Vec<JBit>>,
}

#[derive(Serialize, Deserialize)]
struct JNet {
    bits: Vec<JBit>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    attributes: IndexMap<String, JValue>,
}

#[derive(Serialize, Deserialize)]
struct JMemory {
    width: usize,
    size: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    init: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    attributes: IndexMap<String, JValue>,
    #[serde(default)]
    rd_ports: Vec<JMemRd>,
    #[serde(default)]
    wr_ports: Vec<JMemWr>,
}

#[derive(Serialize, Deserialize)]
struct JMemRd {
    clk: Vec<JBit>,
    en: Vec<JBit>,
    addr: Vec<JBit>,
    data: Vec<JBit>,
    clk_enable: bool,
    clk_polarity: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    init_value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    arst_value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    srst_value: String,
    #[serde(default)]
    transparency_mask: Vec<bool>,
    #[serde(default)]
    collision_x_mask: Vec<bool>,
}

#[derive(Serialize, Deserialize)]
struct JMemWr {
    clk: Vec<JBit>,
    en: Vec<JBit>,
    addr: Vec<JBit>,
    data: Vec<JBit>,
    clk_enable: bool,
    clk_polarity: bool,
    #[serde(default)]
    priority_mask: Vec<bool>,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum JBit {
    Net(u64),
    Const(String),
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum JValue {
    Int(i64),
    Str(String),
}

// ---- writing ----

struct BitNumbering {
    base: IndexMap<WireId, u64>,
}

impl BitNumbering {
    fn new(module: &Module) -> Self {
        let mut base = IndexMap::new();
        let mut next = 2u64;
        for (id, wire) in module.wires() {
            base.insert(id, next);
            next += wire.width as u64;
        }
        BitNumbering { base }
    }

    fn bit(&self, bit: &Bit) -> JBit {
        match bit {
            Bit::Const(s) => JBit::Const(s.to_char().to_string()),
            Bit::Wire(id, off) => JBit::Net(self.base[id] + *off as u64),
        }
    }

    fn sig(&self, sig: &SigSpec) -> Vec<JBit> {
        sig.iter().map(|b| self.bit(b)).collect()
    }
}

fn value_to_json(v: &AttrValue) -> JValue {
    match v {
        AttrValue::Int(i) => JValue::Int(*i),
        AttrValue::Str(s) => JValue::Str(format!("{s} ")),
        AttrValue::Bits(c) => JValue::Str(c.to_bin_string()),
    }
}

fn attrs_to_json(attrs: &IndexMap<String, AttrValue>) -> IndexMap<String, JValue> {
    attrs.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect()
}

fn module_to_json(module: &Module) -> JModule {
    let nums = BitNumbering::new(module);
    let mut out = JModule {
        attributes: attrs_to_json(&module.attributes),
        ..JModule::default()
    };

    for (id, wire) in module.wires() {
        let bits: Vec<JBit> = (0..wire.width)
            .map(|i| nums.bit(&Bit::Wire(id, i)))
            .collect();
        if wire.is_port() {
            let direction = match (wire.port_input, wire.port_output) {
                (true, true) => "inout",
                (true, false) => "input",
                _ => "output",
            };
            out.ports.insert(
                wire.name.clone(),
                JPort {
                    direction: direction.to_string(),
                    bits: bits.clone(),
                },
            );
        }
        out.netnames.insert(
            wire.name.clone(),
            JNet {
                bits,
                attributes: attrs_to_json(&wire.attributes),
            },
        );
    }

    for (_, cell) in module.cells() {
        out.cells.insert(
            cell.name.clone(),
            JCell {
                ty: cell.ty.as_str().to_string(),
                parameters: attrs_to_json(&cell.params),
                attributes: attrs_to_json(&cell.attributes),
                connections: cell
                    .ports
                    .iter()
                    .map(|(p, s)| (p.clone(), nums.sig(s)))
                    .collect(),
            },
        );
    }

    for (_, mem) in module.memories() {
        out.memories.insert(
            mem.name.clone(),
            JMemory {
                width: mem.width,
                size: mem.depth,
                init: mem.init.to_bin_string(),
                attributes: attrs_to_json(&mem.attributes),
                rd_ports: mem
                    .rd_ports
                    .iter()
                    .map(|p| JMemRd {
                        clk: nums.sig(&p.clk),
                        en: nums.sig(&p.en),
                        addr: nums.sig(&p.addr),
                        data: nums.sig(&p.data),
                        clk_enable: p.clk_enable,
                        clk_polarity: p.clk_polarity,
                        init_value: p.init_value.to_bin_string(),
                        arst_value: p.arst_value.to_bin_string(),
                        srst_value: p.srst_value.to_bin_string(),
                        transparency_mask: p.transparency_mask.clone(),
                        collision_x_mask: p.collision_x_mask.clone(),
                    })
                    .collect(),
                wr_ports: mem
                    .wr_ports
                    .iter()
                    .map(|p| JMemWr {
                        clk: nums.sig(&p.clk),
                        en: nums.sig(&p.en),
                        addr: nums.sig(&p.addr),
                        data: nums.sig(&p.data),
                        clk_enable: p.clk_enable,
                        clk_polarity: p.clk_polarity,
                        priority_mask: p.priority_mask.clone(),
                    })
                    .collect(),
            },
        );
    }

    for conn in &module.connections {
        out.connections.push((nums.sig(&conn.lhs), nums.sig(&conn.rhs)));
    }

    out
}

pub fn to_string_pretty(design: &Design) -> String {
    let j = JDesign {
        modules: design
            .modules
            .iter()
            .map(|(name, m)| (name.clone(), module_to_json(m)))
            .collect(),
    };
    serde_json::to_string_pretty(&j).expect("netlist serialization cannot fail")
}

pub fn to_writer<W: io::Write>(design: &Design, writer: W) -> io::Result<()> {
    let j = JDesign {
        modules: design
            .modules
            .iter()
            .map(|(name, m)| (name.clone(), module_to_json(m)))
            .collect(),
    };
    serde_json::to_writer_pretty(writer, &j).map_err(io::Error::from)
}

// ---- reading ----

fn value_from_json(v: &JValue) -> AttrValue {
    match v {
        JValue::Int(i) => AttrValue::Int(*i),
        JValue::Str(s) => {
            if let Some(stripped) = s.strip_suffix(' ') {
                AttrValue::Str(stripped.to_string())
            } else if !s.is_empty() && s.chars().all(|c| matches!(c, '0' | '1' | 'x' | 'z')) {
                AttrValue::Bits(Const::from_bin_str(s).unwrap())
            } else {
                AttrValue::Str(s.clone())
            }
        }
    }
}

fn attrs_from_json(attrs: &IndexMap<String, JValue>) -> IndexMap<String, AttrValue> {
    attrs.iter().map(|(k, v)| (k.clone(), value_from_json(v))).collect()
}

fn const_from_field(name: &str, s: &str, fallback_width: usize) -> Result<Const, IrError> {
    if s.is_empty() {
        return Ok(Const::undef(fallback_width));
    }
    Const::from_bin_str(s)
        .ok_or_else(|| IrError::InvalidIr(format!("bad {name} constant: {s:?}")))
}

struct BitResolver {
    map: IndexMap<u64, Bit>,
}

impl BitResolver {
    fn resolve(&self, module: &str, bits: &[JBit]) -> Result<SigSpec, IrError> {
        let mut sig = SigSpec::new();
        for b in bits {
            match b {
                JBit::Const(s) => {
                    let mut chars = s.chars();
                    let (Some(c), None) = (chars.next(), chars.next()) else {
                        return Err(IrError::InvalidIr(format!(
                            "{module}: bad constant bit {s:?}"
                        )));
                    };
                    let state = State::from_char(c).ok_or_else(|| {
                        IrError::InvalidIr(format!("{module}: bad constant bit {s:?}"))
                    })?;
                    sig.push(Bit::Const(state));
                }
                JBit::Net(n) => {
                    let bit = self.map.get(n).ok_or_else(|| {
                        IrError::InvalidIr(format!("{module}: undeclared net bit {n}"))
                    })?;
                    sig.push(*bit);
                }
            }
        }
        Ok(sig)
    }
}

fn module_from_json(name: &str, j: &JModule) -> Result<Module, IrError> {
    let mut module = Module::new(name);
    module.attributes = attrs_from_json(&j.attributes);

    // Wires come from netnames; each net number may be claimed once.
    let mut map: IndexMap<u64, Bit> = IndexMap::new();
    for (wname, net) in &j.netnames {
        if net.bits.is_empty() {
            return Err(IrError::InvalidIr(format!(
                "{name}: netname {wname} has zero width"
            )));
        }
        let id = module.add_wire(wname.clone(), net.bits.len());
        module.wire_mut(id).attributes = attrs_from_json(&net.attributes);
        for (off, b) in net.bits.iter().enumerate() {
            if let JBit::Net(n) = b {
                if map.insert(*n, Bit::Wire(id, off)).is_some() {
                    return Err(IrError::InvalidIr(format!(
                        "{name}: net bit {n} appears in more than one netname"
                    )));
                }
            }
        }
    }
    let resolver = BitResolver { map };

    for (pname, port) in &j.ports {
        let id = module.find_wire(pname).ok_or_else(|| {
            IrError::InvalidIr(format!("{name}: port {pname} has no netname entry"))
        })?;
        let wire = module.wire_mut(id);
        match port.direction.as_str() {
            "input" => wire.port_input = true,
            "output" => wire.port_output = true,
            "inout" => {
                wire.port_input = true;
                wire.port_output = true;
            }
            other => {
                return Err(IrError::InvalidIr(format!(
                    "{name}: port {pname} has bad direction {other:?}"
                )))
            }
        }
    }

    for (cname, cell) in &j.cells {
        let id = module.add_cell(cname.clone(), CellType::parse(&cell.ty));
        let mut ports = IndexMap::new();
        for (port, bits) in &cell.connections {
            ports.insert(port.clone(), resolver.resolve(name, bits)?);
        }
        let c = module.cell_mut(id);
        c.params = attrs_from_json(&cell.parameters);
        c.attributes = attrs_from_json(&cell.attributes);
        c.ports = ports;
    }

    for (mname, jm) in &j.memories {
        let mut mem = Memory::new(mname.clone(), jm.width, jm.size);
        mem.attributes = attrs_from_json(&jm.attributes);
        if !jm.init.is_empty() {
            mem.init = const_from_field("init", &jm.init, 0)?;
            if mem.init.len() != jm.width * jm.size {
                return Err(IrError::InvalidIr(format!(
                    "{name}: memory {mname} init is {} bits, expected {}",
                    mem.init.len(),
                    jm.width * jm.size
                )));
            }
        }
        for rd in &jm.rd_ports {
            mem.rd_ports.push(MemRdPort {
                clk: resolver.resolve(name, &rd.clk)?,
                en: resolver.resolve(name, &rd.en)?,
                addr: resolver.resolve(name, &rd.addr)?,
                data: resolver.resolve(name, &rd.data)?,
                clk_enable: rd.clk_enable,
                clk_polarity: rd.clk_polarity,
                init_value: const_from_field("init_value", &rd.init_value, jm.width)?,
                arst_value: const_from_field("arst_value", &rd.arst_value, jm.width)?,
                srst_value: const_from_field("srst_value", &rd.srst_value, jm.width)?,
                transparency_mask: rd.transparency_mask.clone(),
                collision_x_mask: rd.collision_x_mask.clone(),
            });
        }
        for wr in &jm.wr_ports {
            mem.wr_ports.push(MemWrPort {
                clk: resolver.resolve(name, &wr.clk)?,
                en: resolver.resolve(name, &wr.en)?,
                addr: resolver.resolve(name, &wr.addr)?,
                data: resolver.resolve(name, &wr.data)?,
                clk_enable: wr.clk_enable,
                clk_polarity: wr.clk_polarity,
                priority_mask: wr.priority_mask.clone(),
            });
        }
        mem.fixup_port_masks();
        module.add_memory(mem);
    }

    for (i, (lhs, rhs)) in j.connections.iter().enumerate() {
        let lhs = resolver.resolve(name, lhs)?;
        let rhs = resolver.resolve(name, rhs)?;
        if lhs.len() != rhs.len() {
            return Err(IrError::InvalidIr(format!(
                "{name}: connection {i} width mismatch"
            )));
        }
        module.connections.push(Connection { lhs, rhs });
    }

    module.fixup_ports();
    Ok(module)
}

pub fn from_str(s: &str) -> Result<Design, IrError> {
    let j: JDesign = serde_json::from_str(s)
        .map_err(|e| IrError::InvalidIr(format!("netlist JSON: {e}")))?;
    let mut design = Design::new();
    for (name, jm) in &j.modules {
        design.add_module(module_from_json(name, jm)?);
    }
    Ok(design)
}

pub fn from_reader<R: io::Read>(mut reader: R) -> Result<Design, IrError> {
    let mut buf = String::new();
    reader
        .read_to_string(&mut buf)
        .map_err(|e| IrError::InvalidIr(format!("netlist JSON: {e}")))?;
    from_str(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::CellType;

    fn sample() -> Design {
        let mut m = Module::new("top");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let d = m.add_wire("d", 8);
        m.wire_mut(d).port_input = true;
        let q = m.add_wire("q", 8);
        m.wire_mut(q).port_output = true;
        m.wire_mut(q).set_attr("hdlname", "top q");
        let ff = m.add_cell("ff", CellType::Dff);
        let (cs, ds, qs) = (m.sig(clk), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 8usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_param("ARST_VALUE", Const::from_u64(0x42, 8));
            cell.set_port("CLK", cs);
            cell.set_port("D", ds);
            cell.set_port("Q", qs);
        }
        m.fixup_ports();
        let mut d = Design::new();
        d.add_module(m);
        d
    }

    #[test]
    fn round_trip_preserves_structure() {
        let design = sample();
        let text = to_string_pretty(&design);
        let back = from_str(&text).unwrap();
        let m = back.module("top").unwrap();
        m.check().unwrap();
        assert_eq!(m.ports.len(), 3);
        let (_, cell) = m.cells().next().unwrap();
        assert_eq!(cell.ty, CellType::Dff);
        assert_eq!(cell.param_const("ARST_VALUE").unwrap().as_u64(), Some(0x42));
        let q = m.wire(m.find_wire("q").unwrap());
        assert_eq!(q.attr_str("hdlname"), Some("top q"));
        assert_eq!(q.hdl_name(), "top.q");
    }

    #[test]
    fn string_and_bits_parameters_are_distinguished() {
        // "101 " (trailing space) is the string "101"; "101" is 3 bits.
        let v = value_from_json(&JValue::Str("101 ".to_string()));
        assert_eq!(v.as_str(), Some("101"));
        let v = value_from_json(&JValue::Str("101".to_string()));
        assert_eq!(v.as_const().unwrap().as_u64(), Some(5));
    }

    #[test]
    fn duplicate_net_bits_rejected() {
        let text = r#"{"modules":{"m":{"netnames":{
            "a":{"bits":[2]},
            "b":{"bits":[2]}
        }}}}"#;
        assert!(from_str(text).is_err());
    }

    #[test]
    fn memory_round_trip() {
        let mut m = Module::new("top");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let mut mem = Memory::new("ram", 8, 4);
        mem.init = Const::from_u64(0xDEAD_BEEF, 32);
        m.add_memory(mem);
        m.fixup_ports();
        let mut d = Design::new();
        d.add_module(m);

        let back = from_str(&to_string_pretty(&d)).unwrap();
        let (_, mem) = back.module("top").unwrap().memories().next().unwrap();
        assert_eq!(mem.width, 8);
        assert_eq!(mem.depth, 4);
        assert_eq!(mem.init.as_u64(), Some(0xDEAD_BEEF));
    }
}
