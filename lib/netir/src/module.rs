// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Modules and the entities they own.

use indexmap::IndexMap;

use crate::memory::Memory;
use crate::sigspec::{Bit, CellId, MemoryId, SigSpec, WireId};
use crate::value::{AttrValue, Const};

/// Cell type tag: a built-in primitive the passes understand, or an
/// opaque user type (module instance or technology cell).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CellType {
    // Combinational
    And,
    Or,
    Not,
    Mux,
    Pmux,
    ReduceOr,
    Eq,
    Ge,
    Lt,
    Sub,
    // Flip-flops
    Dff,
    Dffe,
    Adff,
    Adffe,
    Sdff,
    Sdffe,
    Sdffce,
    Dffsr,
    Dffsre,
    Aldff,
    Aldffe,
    // Simulation placeholders
    DpiCall,
    Finish,
    Print,
    // Anything else
    User(String),
}

impl CellType {
    pub fn is_ff(&self) -> bool {
        matches!(
            self,
            CellType::Dff
                | CellType::Dffe
                | CellType::Adff
                | CellType::Adffe
                | CellType::Sdff
                | CellType::Sdffe
                | CellType::Sdffce
                | CellType::Dffsr
                | CellType::Dffsre
                | CellType::Aldff
                | CellType::Aldffe
        )
    }

    /// FF variants that carry an `EN` port.
    pub fn has_enable(&self) -> bool {
        matches!(
            self,
            CellType::Dffe
                | CellType::Adffe
                | CellType::Sdffe
                | CellType::Sdffce
                | CellType::Dffsre
                | CellType::Aldffe
        )
    }

    /// The enable-carrying variant of a plain FF type.
    pub fn enabled_variant(&self) -> Option<CellType> {
        match self {
            CellType::Dff => Some(CellType::Dffe),
            CellType::Adff => Some(CellType::Adffe),
            CellType::Sdff => Some(CellType::Sdffe),
            CellType::Dffsr => Some(CellType::Dffsre),
            CellType::Aldff => Some(CellType::Aldffe),
            _ => None,
        }
    }

    /// Ports driven by this cell, for driver analysis. User cells report
    /// none; they are resolved against their module definition (or
    /// skipped for blackboxes).
    pub fn output_ports(&self) -> &'static [&'static str] {
        match self {
            CellType::And
            | CellType::Or
            | CellType::Not
            | CellType::Mux
            | CellType::Pmux
            | CellType::ReduceOr
            | CellType::Eq
            | CellType::Ge
            | CellType::Lt
            | CellType::Sub => &["Y"],
            t if t.is_ff() => &["Q"],
            CellType::DpiCall => &["RESULT"],
            _ => &[],
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CellType::And => "and",
            CellType::Or => "or",
            CellType::Not => "not",
            CellType::Mux => "mux",
            CellType::Pmux => "pmux",
            CellType::ReduceOr => "reduce_or",
            CellType::Eq => "eq",
            CellType::Ge => "ge",
            CellType::Lt => "lt",
            CellType::Sub => "sub",
            CellType::Dff => "dff",
            CellType::Dffe => "dffe",
            CellType::Adff => "adff",
            CellType::Adffe => "adffe",
            CellType::Sdff => "sdff",
            CellType::Sdffe => "sdffe",
            CellType::Sdffce => "sdffce",
            CellType::Dffsr => "dffsr",
            CellType::Dffsre => "dffsre",
            CellType::Aldff => "aldff",
            CellType::Aldffe => "aldffe",
            CellType::DpiCall => "__dpi_call",
            CellType::Finish => "__finish",
            CellType::Print => "print",
            CellType::User(name) => name,
        }
    }

    pub fn parse(s: &str) -> CellType {
        match s {
            "and" => CellType::And,
            "or" => CellType::Or,
            "not" => CellType::Not,
            "mux" => CellType::Mux,
            "pmux" => CellType::Pmux,
            "reduce_or" => CellType::ReduceOr,
            "eq" => CellType::Eq,
            "ge" => CellType::Ge,
            "lt" => CellType::Lt,
            "sub" => CellType::Sub,
            "dff" => CellType::Dff,
            "dffe" => CellType::Dffe,
            "adff" => CellType::Adff,
            "adffe" => CellType::Adffe,
            "sdff" => CellType::Sdff,
            "sdffe" => CellType::Sdffe,
            "sdffce" => CellType::Sdffce,
            "dffsr" => CellType::Dffsr,
            "dffsre" => CellType::Dffsre,
            "aldff" => CellType::Aldff,
            "aldffe" => CellType::Aldffe,
            "__dpi_call" => CellType::DpiCall,
            "__finish" => CellType::Finish,
            "print" => CellType::Print,
            other => CellType::User(other.to_string()),
        }
    }
}

/// A named bit-vector, possibly a module port.
#[derive(Clone, Debug)]
pub struct Wire {
    pub name: String,
    pub width: usize,
    pub port_input: bool,
    pub port_output: bool,
    pub attributes: IndexMap<String, AttrValue>,
}

impl Wire {
    pub fn is_port(&self) -> bool {
        self.port_input || self.port_output
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attr_bool(&self, key: &str) -> bool {
        self.attributes.get(key).map(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// Source-level hierarchical path: the `hdlname` attribute with its
    /// space separators turned into dots, falling back to the wire name.
    pub fn hdl_name(&self) -> String {
        match self.attr_str("hdlname") {
            Some(h) => h.split(' ').collect::<Vec<_>>().join("."),
            None => self.name.clone(),
        }
    }
}

/// A parameterised primitive or module instance.
#[derive(Clone, Debug)]
pub struct Cell {
    pub name: String,
    pub ty: CellType,
    pub params: IndexMap<String, AttrValue>,
    pub ports: IndexMap<String, SigSpec>,
    pub attributes: IndexMap<String, AttrValue>,
}

impl Cell {
    pub fn param_int(&self, name: &str) -> Option<i64> {
        self.params.get(name).and_then(|v| v.as_int())
    }

    pub fn param_const(&self, name: &str) -> Option<Const> {
        self.params.get(name).and_then(|v| v.as_const())
    }

    pub fn set_param(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.params.insert(name.to_string(), value.into());
    }

    pub fn has_port(&self, name: &str) -> bool {
        self.ports.contains_key(name)
    }

    pub fn port(&self, name: &str) -> Option<&SigSpec> {
        self.ports.get(name)
    }

    pub fn set_port(&mut self, name: &str, sig: SigSpec) {
        self.ports.insert(name.to_string(), sig);
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attr_bool(&self, key: &str) -> bool {
        self.attributes.get(key).map(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }
}

/// A driven/driver bit equality: `lhs` is driven by `rhs`, bitwise.
#[derive(Clone, Debug)]
pub struct Connection {
    pub lhs: SigSpec,
    pub rhs: SigSpec,
}

/// A module: the unit every pass operates on.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub name: String,
    pub attributes: IndexMap<String, AttrValue>,
    wires: IndexMap<WireId, Wire>,
    wire_names: IndexMap<String, WireId>,
    cells: IndexMap<CellId, Cell>,
    memories: IndexMap<MemoryId, Memory>,
    pub connections: Vec<Connection>,
    /// Ordered port list, derived from the wire flags by
    /// [`Module::fixup_ports`].
    pub ports: Vec<WireId>,
    next_wire: u32,
    next_cell: u32,
    next_mem: u32,
    next_auto: u32,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            ..Module::default()
        }
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(|v| v.as_int())
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    // ---- wires ----

    pub fn add_wire(&mut self, name: impl Into<String>, width: usize) -> WireId {
        let name = name.into();
        assert!(width >= 1, "wire {name} must have width >= 1");
        assert!(
            !self.wire_names.contains_key(&name),
            "duplicate wire name {name} in module {}",
            self.name
        );
        let id = WireId(self.next_wire);
        self.next_wire += 1;
        self.wire_names.insert(name.clone(), id);
        self.wires.insert(
            id,
            Wire {
                name,
                width,
                port_input: false,
                port_output: false,
                attributes: IndexMap::new(),
            },
        );
        id
    }

    /// Add an internal wire with a generated unique name.
    pub fn add_wire_auto(&mut self, width: usize) -> WireId {
        let name = self.fresh_name("");
        self.add_wire(name, width)
    }

    /// Generate a unique `$auto$` name, optionally tagged.
    pub fn fresh_name(&mut self, tag: &str) -> String {
        loop {
            let n = self.next_auto;
            self.next_auto += 1;
            let name = if tag.is_empty() {
                format!("$auto${n}")
            } else {
                format!("$auto${tag}${n}")
            };
            if !self.wire_names.contains_key(&name) {
                return name;
            }
        }
    }

    pub fn wire(&self, id: WireId) -> &Wire {
        &self.wires[&id]
    }

    pub fn try_wire(&self, id: WireId) -> Option<&Wire> {
        self.wires.get(&id)
    }

    pub fn wire_mut(&mut self, id: WireId) -> &mut Wire {
        self.wires.get_mut(&id).expect("stale wire id")
    }

    pub fn find_wire(&self, name: &str) -> Option<WireId> {
        self.wire_names.get(name).copied()
    }

    pub fn wires(&self) -> impl Iterator<Item = (WireId, &Wire)> {
        self.wires.iter().map(|(id, w)| (*id, w))
    }

    pub fn wire_ids(&self) -> Vec<WireId> {
        self.wires.keys().copied().collect()
    }

    /// Full-width signal for a wire.
    pub fn sig(&self, id: WireId) -> SigSpec {
        SigSpec::from_wire(id, self.wire(id).width)
    }

    // ---- cells ----

    pub fn add_cell(&mut self, name: impl Into<String>, ty: CellType) -> CellId {
        let id = CellId(self.next_cell);
        self.next_cell += 1;
        self.cells.insert(
            id,
            Cell {
                name: name.into(),
                ty,
                params: IndexMap::new(),
                ports: IndexMap::new(),
                attributes: IndexMap::new(),
            },
        );
        id
    }

    pub fn add_cell_auto(&mut self, ty: CellType) -> CellId {
        let name = self.fresh_name(ty.as_str());
        self.add_cell(name, ty)
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[&id]
    }

    pub fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        self.cells.get_mut(&id).expect("stale cell id")
    }

    pub fn cells(&self) -> impl Iterator<Item = (CellId, &Cell)> {
        self.cells.iter().map(|(id, c)| (*id, c))
    }

    pub fn cell_ids(&self) -> Vec<CellId> {
        self.cells.keys().copied().collect()
    }

    pub fn remove_cell(&mut self, id: CellId) {
        // shift_remove keeps the iteration order of the survivors
        self.cells.shift_remove(&id);
    }

    // ---- memories ----

    pub fn add_memory(&mut self, mem: Memory) -> MemoryId {
        let id = MemoryId(self.next_mem);
        self.next_mem += 1;
        self.memories.insert(id, mem);
        id
    }

    pub fn memory(&self, id: MemoryId) -> &Memory {
        &self.memories[&id]
    }

    pub fn memory_mut(&mut self, id: MemoryId) -> &mut Memory {
        self.memories.get_mut(&id).expect("stale memory id")
    }

    pub fn memories(&self) -> impl Iterator<Item = (MemoryId, &Memory)> {
        self.memories.iter().map(|(id, m)| (*id, m))
    }

    pub fn memory_ids(&self) -> Vec<MemoryId> {
        self.memories.keys().copied().collect()
    }

    // ---- connections and ports ----

    /// Record that `lhs` is driven by `rhs`.
    pub fn connect(&mut self, lhs: SigSpec, rhs: SigSpec) {
        assert_eq!(
            lhs.len(),
            rhs.len(),
            "connection width mismatch in module {}",
            self.name
        );
        self.connections.push(Connection { lhs, rhs });
    }

    /// Rebuild the ordered port list from the wire flags, preserving wire
    /// creation order.
    pub fn fixup_ports(&mut self) {
        self.ports = self
            .wires
            .iter()
            .filter(|(_, w)| w.is_port())
            .map(|(id, _)| *id)
            .collect();
    }

    // ---- gate builders ----
    //
    // These keep the width parameters consistent with the connected
    // signals so the invariant checker stays happy.

    fn add_binary(&mut self, ty: CellType, a: SigSpec, b: SigSpec, y: SigSpec) -> CellId {
        let id = self.add_cell_auto(ty);
        let cell = self.cell_mut(id);
        cell.set_param("A_SIGNED", 0i64);
        cell.set_param("B_SIGNED", 0i64);
        cell.set_param("A_WIDTH", a.len());
        cell.set_param("B_WIDTH", b.len());
        cell.set_param("Y_WIDTH", y.len());
        cell.set_port("A", a);
        cell.set_port("B", b);
        cell.set_port("Y", y);
        id
    }

    pub fn add_and(&mut self, a: SigSpec, b: SigSpec, y: SigSpec) -> CellId {
        self.add_binary(CellType::And, a, b, y)
    }

    pub fn add_or(&mut self, a: SigSpec, b: SigSpec, y: SigSpec) -> CellId {
        self.add_binary(CellType::Or, a, b, y)
    }

    pub fn add_sub(&mut self, a: SigSpec, b: SigSpec, y: SigSpec) -> CellId {
        self.add_binary(CellType::Sub, a, b, y)
    }

    pub fn add_eq(&mut self, a: SigSpec, b: SigSpec, y: SigSpec) -> CellId {
        self.add_binary(CellType::Eq, a, b, y)
    }

    pub fn add_ge(&mut self, a: SigSpec, b: SigSpec, y: SigSpec) -> CellId {
        self.add_binary(CellType::Ge, a, b, y)
    }

    pub fn add_lt(&mut self, a: SigSpec, b: SigSpec, y: SigSpec) -> CellId {
        self.add_binary(CellType::Lt, a, b, y)
    }

    pub fn add_not(&mut self, a: SigSpec, y: SigSpec) -> CellId {
        let id = self.add_cell_auto(CellType::Not);
        let cell = self.cell_mut(id);
        cell.set_param("A_SIGNED", 0i64);
        cell.set_param("A_WIDTH", a.len());
        cell.set_param("Y_WIDTH", y.len());
        cell.set_port("A", a);
        cell.set_port("Y", y);
        id
    }

    pub fn add_reduce_or(&mut self, a: SigSpec, y: SigSpec) -> CellId {
        let id = self.add_cell_auto(CellType::ReduceOr);
        let cell = self.cell_mut(id);
        cell.set_param("A_SIGNED", 0i64);
        cell.set_param("A_WIDTH", a.len());
        cell.set_param("Y_WIDTH", y.len());
        cell.set_port("A", a);
        cell.set_port("Y", y);
        id
    }

    /// 2:1 multiplexer: `y = s ? b : a`.
    pub fn add_mux(&mut self, a: SigSpec, b: SigSpec, s: SigSpec, y: SigSpec) -> CellId {
        assert_eq!(a.len(), b.len());
        assert_eq!(a.len(), y.len());
        assert_eq!(s.len(), 1);
        let id = self.add_cell_auto(CellType::Mux);
        let cell = self.cell_mut(id);
        cell.set_param("WIDTH", a.len());
        cell.set_port("A", a);
        cell.set_port("B", b);
        cell.set_port("S", s);
        cell.set_port("Y", y);
        id
    }

    /// Find the wire ids a signal touches.
    pub fn sig_wires(&self, sig: &SigSpec) -> Vec<WireId> {
        let mut out = Vec::new();
        for bit in sig.iter() {
            if let Bit::Wire(id, _) = bit {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        }
        out
    }
}

/// A design: the root container handed through the pipeline.
#[derive(Clone, Debug, Default)]
pub struct Design {
    pub modules: IndexMap<String, Module>,
}

impl Design {
    pub fn new() -> Self {
        Design::default()
    }

    pub fn add_module(&mut self, module: Module) {
        assert!(
            !self.modules.contains_key(&module.name),
            "duplicate module {}",
            module.name
        );
        self.modules.insert(module.name.clone(), module);
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn module_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.modules.get_mut(name)
    }

    pub fn remove_module(&mut self, name: &str) -> Option<Module> {
        self.modules.shift_remove(name)
    }
}
