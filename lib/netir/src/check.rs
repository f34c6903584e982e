// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module invariant validation.
//!
//! Passes call [`Module::check`] on entry (reject bad input before any
//! mutation) and may call it again before returning. The checks cover the
//! structural invariants every pass relies on: resolvable bit references,
//! port-width consistency on the built-in primitives, flag/port-list
//! agreement, connection widths, the single-driver rule, and parameter
//! value widths on flip-flops.

use std::collections::HashMap;

use crate::error::IrError;
use crate::module::{Cell, CellType, Module};
use crate::sigspec::{Bit, SigSpec};

impl Module {
    pub fn check(&self) -> Result<(), IrError> {
        self.check_references()?;
        self.check_port_list()?;
        self.check_cell_widths()?;
        self.check_connections()?;
        self.check_single_driver()?;
        Ok(())
    }

    fn check_sig(&self, owner: &str, sig: &SigSpec) -> Result<(), IrError> {
        for bit in sig.iter() {
            if let Bit::Wire(id, off) = bit {
                let wire = match self.try_wire(*id) {
                    Some(w) => w,
                    None => {
                        return Err(IrError::InvalidIr(format!(
                            "{}: {owner} references unknown wire {id}",
                            self.name
                        )))
                    }
                };
                if *off >= wire.width {
                    return Err(IrError::InvalidIr(format!(
                        "{}: {owner} references bit {off} of {} (width {})",
                        self.name, wire.name, wire.width
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_references(&self) -> Result<(), IrError> {
        for (_, cell) in self.cells() {
            for (port, sig) in &cell.ports {
                self.check_sig(&format!("cell {} port {port}", cell.name), sig)?;
            }
        }
        for (i, conn) in self.connections.iter().enumerate() {
            self.check_sig(&format!("connection {i} lhs"), &conn.lhs)?;
            self.check_sig(&format!("connection {i} rhs"), &conn.rhs)?;
        }
        for (_, mem) in self.memories() {
            for (i, rd) in mem.rd_ports.iter().enumerate() {
                let owner = format!("memory {} rd port {i}", mem.name);
                self.check_sig(&owner, &rd.clk)?;
                self.check_sig(&owner, &rd.en)?;
                self.check_sig(&owner, &rd.addr)?;
                self.check_sig(&owner, &rd.data)?;
            }
            for (i, wr) in mem.wr_ports.iter().enumerate() {
                let owner = format!("memory {} wr port {i}", mem.name);
                self.check_sig(&owner, &wr.clk)?;
                self.check_sig(&owner, &wr.en)?;
                self.check_sig(&owner, &wr.addr)?;
                self.check_sig(&owner, &wr.data)?;
            }
        }
        Ok(())
    }

    fn check_port_list(&self) -> Result<(), IrError> {
        let flagged: Vec<_> = self
            .wires()
            .filter(|(_, w)| w.is_port())
            .map(|(id, _)| id)
            .collect();
        if flagged != self.ports {
            return Err(IrError::InvalidIr(format!(
                "{}: port list is stale (run fixup_ports)",
                self.name
            )));
        }
        Ok(())
    }

    fn check_connections(&self) -> Result<(), IrError> {
        for (i, conn) in self.connections.iter().enumerate() {
            if conn.lhs.len() != conn.rhs.len() {
                return Err(IrError::InvalidIr(format!(
                    "{}: connection {i} equates {} bits with {}",
                    self.name,
                    conn.lhs.len(),
                    conn.rhs.len()
                )));
            }
        }
        Ok(())
    }

    fn check_cell_widths(&self) -> Result<(), IrError> {
        for (_, cell) in self.cells() {
            for (port, sig) in &cell.ports {
                if let Some(want) = expected_port_width(cell, port) {
                    if sig.len() != want {
                        return Err(IrError::InvalidIr(format!(
                            "{}: cell {} ({}) port {port} is {} bits, expected {want}",
                            self.name,
                            cell.name,
                            cell.ty.as_str(),
                            sig.len()
                        )));
                    }
                }
            }
            if cell.ty.is_ff() {
                let width = cell.param_int("WIDTH").unwrap_or(0) as usize;
                for value_param in ["ARST_VALUE", "SRST_VALUE"] {
                    if let Some(v) = cell.param_const(value_param) {
                        if v.len() != width {
                            return Err(IrError::InvalidIr(format!(
                                "{}: cell {} {value_param} is {} bits, WIDTH is {width}",
                                self.name,
                                cell.name,
                                v.len()
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_single_driver(&self) -> Result<(), IrError> {
        for (bit, count) in self.bit_driver_counts() {
            if count > 1 {
                let (id, off) = bit.as_wire().unwrap();
                return Err(IrError::InvalidIr(format!(
                    "{}: bit {off} of {} has {count} drivers",
                    self.name,
                    self.wire(id).name
                )));
            }
        }
        Ok(())
    }

    /// Count drivers per wire bit: module inputs, cell output ports,
    /// connection left-hand sides and memory read data.
    pub fn bit_driver_counts(&self) -> HashMap<Bit, usize> {
        let mut counts: HashMap<Bit, usize> = HashMap::new();
        let mut bump = |counts: &mut HashMap<Bit, usize>, sig: &SigSpec| {
            for bit in sig.iter() {
                if !bit.is_const() {
                    *counts.entry(*bit).or_insert(0) += 1;
                }
            }
        };

        for (id, wire) in self.wires() {
            if wire.port_input {
                bump(&mut counts, &SigSpec::from_wire(id, wire.width));
            }
        }
        for (_, cell) in self.cells() {
            for out in cell.ty.output_ports() {
                if let Some(sig) = cell.port(out) {
                    bump(&mut counts, sig);
                }
            }
        }
        for conn in &self.connections {
            bump(&mut counts, &conn.lhs);
        }
        for (_, mem) in self.memories() {
            for rd in &mem.rd_ports {
                bump(&mut counts, &rd.data);
            }
        }
        counts
    }
}

/// Declared width of a built-in cell port, `None` when unconstrained.
fn expected_port_width(cell: &Cell, port: &str) -> Option<usize> {
    let param = |name: &str| cell.param_int(name).map(|v| v as usize);
    match &cell.ty {
        CellType::And | CellType::Or | CellType::Eq | CellType::Ge | CellType::Lt | CellType::Sub => {
            match port {
                "A" => param("A_WIDTH"),
                "B" => param("B_WIDTH"),
                "Y" => param("Y_WIDTH"),
                _ => None,
            }
        }
        CellType::Not | CellType::ReduceOr => match port {
            "A" => param("A_WIDTH"),
            "Y" => param("Y_WIDTH"),
            _ => None,
        },
        CellType::Mux => match port {
            "A" | "B" | "Y" => param("WIDTH"),
            "S" => Some(1),
            _ => None,
        },
        CellType::Pmux => match port {
            "A" | "Y" => param("WIDTH"),
            "B" => Some(param("WIDTH")? * param("S_WIDTH")?),
            "S" => param("S_WIDTH"),
            _ => None,
        },
        t if t.is_ff() => match port {
            "D" | "Q" | "AD" | "SET" | "CLR" => param("WIDTH"),
            "CLK" | "EN" | "ARST" | "SRST" | "ALOAD" => Some(1),
            _ => None,
        },
        CellType::DpiCall => match port {
            "ARGS" => param("ARG_WIDTH"),
            "RESULT" => param("RET_WIDTH"),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigspec::SigSpec;
    use crate::value::Const;

    fn ff_module() -> Module {
        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let d = m.add_wire("d", 4);
        m.wire_mut(d).port_input = true;
        let q = m.add_wire("q", 4);
        m.wire_mut(q).port_output = true;
        let ff = m.add_cell("ff", CellType::Dff);
        let (clk_s, d_s, q_s) = (m.sig(clk), m.sig(d), m.sig(q));
        let cell = m.cell_mut(ff);
        cell.set_param("WIDTH", 4usize);
        cell.set_param("CLK_POLARITY", 1i64);
        cell.set_port("CLK", clk_s);
        cell.set_port("D", d_s);
        cell.set_port("Q", q_s);
        m.fixup_ports();
        m
    }

    #[test]
    fn valid_module_passes() {
        ff_module().check().unwrap();
    }

    #[test]
    fn port_width_mismatch_detected() {
        let mut m = ff_module();
        let ff = m.cell_ids()[0];
        let narrow = m.add_wire("narrow", 2);
        let sig = m.sig(narrow);
        m.cell_mut(ff).set_port("D", sig);
        assert!(matches!(m.check(), Err(IrError::InvalidIr(_))));
    }

    #[test]
    fn double_driver_detected() {
        let mut m = ff_module();
        let q = m.find_wire("q").unwrap();
        let sig = m.sig(q);
        m.connect(sig, SigSpec::from_const(&Const::zeros(4)));
        let err = m.check().unwrap_err();
        assert!(format!("{err}").contains("drivers"));
    }

    #[test]
    fn stale_port_list_detected() {
        let mut m = ff_module();
        let w = m.add_wire("late", 1);
        m.wire_mut(w).port_input = true;
        assert!(m.check().is_err());
        m.fixup_ports();
        m.check().unwrap();
    }

    #[test]
    fn ff_value_param_width_checked() {
        let mut m = ff_module();
        let ff = m.cell_ids()[0];
        m.cell_mut(ff).set_param("SRST_VALUE", Const::zeros(3));
        assert!(m.check().is_err());
    }
}
