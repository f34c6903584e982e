// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flip-flop gating: an `emu_en` input that freezes the whole DUT.
//!
//! With `emu_en` low and scan disabled every FF holds its value; the
//! gated clock in the wrapper can then run freely while the design is
//! logically frozen. `emu_scan_enable` overrides the gate so the chain
//! still shifts on a frozen design:
//!
//! - FFs without an enable are promoted to their enabled variant with
//!   `EN = emu_en | emu_scan_enable`.
//! - FFs with an enable of polarity p get
//!   `EN = (active(p) & emu_en) | emu_scan_enable`, active-high.

use log::info;
use netir::{CellId, IrError, Module};

use crate::{EN_INPUT, SCAN_ENABLE};

const MEM_FF_MARKER: &str = "ffmerge_disconnected";

fn is_memory_output_ff(module: &Module, id: CellId) -> bool {
    let Some(q) = module.cell(id).port("Q") else {
        return false;
    };
    q.iter().any(|b| match b.as_wire() {
        Some((wire, _)) => module.wire(wire).name.contains(MEM_FF_MARKER),
        None => false,
    })
}

pub fn add_flop_enable(module: &mut Module) -> Result<(), IrError> {
    let ffs: Vec<_> = module
        .cell_ids()
        .into_iter()
        .filter(|id| module.cell(*id).ty.is_ff() && !is_memory_output_ff(module, *id))
        .collect();
    if ffs.is_empty() {
        info!("{}: no flip-flops to gate", module.name);
        return Ok(());
    }

    let en = module.add_wire(EN_INPUT, 1);
    module.wire_mut(en).port_input = true;
    let en_sig = module.sig(en);

    let scan_sig = module.find_wire(SCAN_ENABLE).map(|id| module.sig(id));

    // combined = emu_en | scan_enable, used by FFs without their own
    // enable.
    let combined = match &scan_sig {
        Some(scan) => {
            let w = module.add_wire_auto(1);
            let w_sig = module.sig(w);
            module.add_or(en_sig.clone(), scan.clone(), w_sig.clone());
            w_sig
        }
        None => en_sig.clone(),
    };

    for id in &ffs {
        let cell = module.cell(*id);
        if !cell.ty.has_enable() {
            let new_ty = cell
                .ty
                .enabled_variant()
                .ok_or_else(|| {
                    IrError::InvalidIr(format!(
                        "FF {} ({}) has no enabled variant",
                        cell.name,
                        cell.ty.as_str()
                    ))
                })?;
            let cell = module.cell_mut(*id);
            cell.ty = new_ty;
            cell.set_port("EN", combined.clone());
            cell.set_param("EN_POLARITY", 1i64);
            continue;
        }

        let orig_en = cell.port("EN").cloned().unwrap_or_default();
        let polarity = cell.param_int("EN_POLARITY").unwrap_or(1);

        let active = if polarity != 0 {
            orig_en
        } else {
            let w = module.add_wire_auto(1);
            let w_sig = module.sig(w);
            module.add_not(orig_en, w_sig.clone());
            w_sig
        };

        let gated = module.add_wire_auto(1);
        let gated_sig = module.sig(gated);
        module.add_and(active, en_sig.clone(), gated_sig.clone());

        let new_en = match &scan_sig {
            Some(scan) => {
                let w = module.add_wire_auto(1);
                let w_sig = module.sig(w);
                module.add_or(gated_sig, scan.clone(), w_sig.clone());
                w_sig
            }
            None => gated_sig,
        };

        let cell = module.cell_mut(*id);
        cell.set_port("EN", new_en);
        cell.set_param("EN_POLARITY", 1i64);
    }

    module.fixup_ports();
    info!("{}: gated {} FF(s) with {EN_INPUT}", module.name, ffs.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netir::interp::Interp;
    use netir::CellType;

    fn module_with_ff(en_polarity: Option<i64>) -> Module {
        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let d = m.add_wire("d", 4);
        m.wire_mut(d).port_input = true;
        let q = m.add_wire("q", 4);
        m.wire_mut(q).port_output = true;
        let ty = if en_polarity.is_some() {
            CellType::Dffe
        } else {
            CellType::Dff
        };
        let ff = m.add_cell("ff", ty);
        let (clk_s, d_s, q_s) = (m.sig(clk), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 4usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_port("CLK", clk_s);
            cell.set_port("D", d_s);
            cell.set_port("Q", q_s);
        }
        if let Some(pol) = en_polarity {
            let en = m.add_wire("user_en", 1);
            m.wire_mut(en).port_input = true;
            let en_s = m.sig(en);
            let cell = m.cell_mut(ff);
            cell.set_param("EN_POLARITY", pol);
            cell.set_port("EN", en_s);
        }
        m.fixup_ports();
        m
    }

    #[test]
    fn plain_ff_promoted_and_frozen() {
        let mut m = module_with_ff(None);
        add_flop_enable(&mut m).unwrap();
        m.check().unwrap();

        let (_, ff) = m.cells().find(|(_, c)| c.ty.is_ff()).unwrap();
        assert_eq!(ff.ty, CellType::Dffe);

        let mut sim = Interp::new(&m);
        sim.set_input("d", 5);
        sim.set_input(EN_INPUT, 0);
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(0), "frozen FF must hold");
        sim.set_input(EN_INPUT, 1);
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(5));
    }

    #[test]
    fn active_low_enable_normalized() {
        let mut m = module_with_ff(Some(0));
        add_flop_enable(&mut m).unwrap();
        m.check().unwrap();

        let (_, ff) = m.cells().find(|(_, c)| c.ty.is_ff()).unwrap();
        assert_eq!(ff.param_int("EN_POLARITY"), Some(1));

        let mut sim = Interp::new(&m);
        sim.set_input("d", 9);
        sim.set_input(EN_INPUT, 1);
        sim.set_input("user_en", 1); // inactive (active-low)
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(0));
        sim.set_input("user_en", 0); // active
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(9));
        // emu_en low freezes regardless of the user enable.
        sim.set_input("d", 3);
        sim.set_input(EN_INPUT, 0);
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(9));
    }

    #[test]
    fn scan_enable_overrides_the_freeze() {
        let mut m = module_with_ff(None);
        let scan = m.add_wire(SCAN_ENABLE, 1);
        m.wire_mut(scan).port_input = true;
        m.fixup_ports();
        add_flop_enable(&mut m).unwrap();

        let mut sim = Interp::new(&m);
        sim.set_input("d", 7);
        sim.set_input(EN_INPUT, 0);
        sim.set_input(SCAN_ENABLE, 0);
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(0));
        sim.set_input(SCAN_ENABLE, 1);
        sim.step();
        assert_eq!(sim.get("q").as_u64(), Some(7));
    }
}
