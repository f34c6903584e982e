// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `__finish` lowering: the enables of every finish cell OR together
//! into a single `emu_finish_o` output the wrapper exposes to the host.
//! Exit codes are compile-time parameters and travel in the metadata,
//! not through hardware.

use log::{info, warn};
use netir::{Bit, CellType, IrError, Module, SigSpec, State};

use crate::FINISH_OUT;

pub fn lower_finish(module: &mut Module) -> Result<Vec<i64>, IrError> {
    let finishes: Vec<_> = module
        .cells()
        .filter(|(_, c)| c.ty == CellType::Finish)
        .map(|(id, _)| id)
        .collect();
    if finishes.is_empty() {
        return Ok(Vec::new());
    }

    let out = module.add_wire(FINISH_OUT, 1);
    module.wire_mut(out).port_output = true;

    let mut enables = SigSpec::new();
    let mut exit_codes = Vec::new();
    for id in &finishes {
        let cell = module.cell(*id);
        match cell.port("EN") {
            Some(en) if !en.is_empty() => enables.append(en),
            _ => {
                warn!(
                    "{}: finish cell {} has no EN port, treating as always-on",
                    module.name, cell.name
                );
                enables.push(Bit::Const(State::S1));
            }
        }
        exit_codes.push(cell.param_int("EXIT_CODE").unwrap_or(0));
    }
    for id in finishes {
        module.remove_cell(id);
    }

    let out_sig = module.sig(out);
    if enables.len() == 1 {
        module.connect(out_sig, enables);
    } else {
        let mut acc = SigSpec::from_bit(enables[0]);
        for i in 1..enables.len() {
            let next = module.add_wire_auto(1);
            let next_sig = module.sig(next);
            module.add_or(acc, SigSpec::from_bit(enables[i]), next_sig.clone());
            acc = next_sig;
        }
        module.connect(out_sig, acc);
    }

    module.fixup_ports();
    info!(
        "{}: {} finish cell(s) → {FINISH_OUT} (exit codes {exit_codes:?})",
        module.name,
        exit_codes.len()
    );
    Ok(exit_codes)
}
