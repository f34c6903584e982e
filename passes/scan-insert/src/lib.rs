// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scan chain insertion.
//!
//! Splices a 1-bit serial shift path through every flip-flop's D input:
//!
//! ```text
//! emu_scan_in → FF0.bit0 → FF0.bit1 → … → FFn.msb → emu_scan_out
//! ```
//!
//! With `emu_scan_enable` low the inserted muxes pass the original D
//! inputs through and the design is untouched functionally; high, each
//! posedge moves the chain one position toward `emu_scan_out`. The pass
//! returns (and optionally writes) a [`ScanMap`] giving each variable's
//! chain offset, reset value and enum metadata — the host needs the bit
//! positions to match exactly, so the chain order is the module's cell
//! iteration order and nothing else.
//!
//! Memory-output registers merged into BRAM read paths are skipped to
//! keep BRAM inference intact downstream; they are recognized by the
//! merge marker in their Q wire names.

use log::{debug, info, warn};
use netir::{CellId, Const, IrError, Module, SigSpec};

use emu_proto::scanmap::{EnumMember, ScanMap, ScanVariable};

pub const SCAN_ENABLE: &str = "emu_scan_enable";
pub const SCAN_IN: &str = "emu_scan_in";
pub const SCAN_OUT: &str = "emu_scan_out";
/// Module stamp: total chain bits.
pub const CHAIN_LENGTH_ATTR: &str = "emu_scan_chain_length";
/// Wire attribute carrying `Name:Value,...` enum metadata.
pub const ENUM_MEMBERS_ATTR: &str = "emu_enum_members";
/// Q wire attribute written by reset extraction.
pub const RESET_VALUE_ATTR: &str = "emu_reset_value";
/// Q wire attribute naming a reset-time DPI function.
pub const RESET_DPI_ATTR: &str = "emu_reset_dpi_func";
/// Wire-name marker left on FFs merged into memory read paths.
pub const MEM_FF_MARKER: &str = "ffmerge_disconnected";

#[derive(Clone, Debug)]
pub struct Options {
    /// Verify that the module with scan disabled behaves like the
    /// original, by bounded random co-simulation.
    pub check_equiv: bool,
    pub equiv_runs: usize,
    pub equiv_cycles: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            check_equiv: false,
            equiv_runs: 8,
            equiv_cycles: 24,
        }
    }
}

pub fn run(module: &mut Module, opts: &Options) -> Result<ScanMap, IrError> {
    module.check()?;

    let gold = if opts.check_equiv {
        Some(module.clone())
    } else {
        None
    };

    let map = insert_chain(module)?;

    if let Some(gold) = gold {
        let mut gate = module.clone();
        tie_off_scan(&mut gate);
        equiv::check(&gold, &gate, opts.equiv_runs, opts.equiv_cycles)?;
        info!("{}: scan equivalence check passed", module.name);
    }

    module.check()?;
    Ok(map)
}

fn is_memory_output_ff(module: &Module, id: CellId) -> bool {
    let Some(q) = module.cell(id).port("Q") else {
        return false;
    };
    q.iter().any(|b| match b.as_wire() {
        Some((wire, _)) => module.wire(wire).name.contains(MEM_FF_MARKER),
        None => false,
    })
}

fn insert_chain(module: &mut Module) -> Result<ScanMap, IrError> {
    let mut ffs = Vec::new();
    let mut skipped = 0usize;
    for id in module.cell_ids() {
        if !module.cell(id).ty.is_ff() {
            continue;
        }
        if is_memory_output_ff(module, id) {
            debug!("{}: skipping memory output FF {}", module.name, module.cell(id).name);
            skipped += 1;
            continue;
        }
        ffs.push(id);
    }

    if ffs.is_empty() {
        info!(
            "{}: no flip-flops to scan ({skipped} memory output FFs skipped)",
            module.name
        );
        return Ok(ScanMap::default());
    }

    let scan_en = module.add_wire(SCAN_ENABLE, 1);
    module.wire_mut(scan_en).port_input = true;
    let scan_in = module.add_wire(SCAN_IN, 1);
    module.wire_mut(scan_in).port_input = true;
    let scan_out = module.add_wire(SCAN_OUT, 1);
    module.wire_mut(scan_out).port_output = true;

    let scan_en_sig = module.sig(scan_en);
    let mut prev: SigSpec = module.sig(scan_in);
    let mut map = ScanMap::default();
    let mut chain_pos = 0u32;

    for id in ffs.iter().copied() {
        let (orig_d, q) = {
            let cell = module.cell(id);
            let d = cell.port("D").cloned().ok_or_else(|| {
                IrError::InvalidIr(format!("FF {} has no D port", cell.name))
            })?;
            let q = cell.port("Q").cloned().ok_or_else(|| {
                IrError::InvalidIr(format!("FF {} has no Q port", cell.name))
            })?;
            (d, q)
        };
        let width = orig_d.len();

        map.variables.push(variable_record(module, id, &q, chain_pos));
        chain_pos += width as u32;

        // Shift input: bit 0 continues the chain from the previous FF's
        // top bit, bit i>0 takes this FF's own bit i-1.
        let mut scan_data = SigSpec::new();
        scan_data.push(prev.msb());
        for i in 1..width {
            scan_data.push(q[i - 1]);
        }

        let mux_out = module.add_wire_auto(width);
        let mux_sig = module.sig(mux_out);
        module.add_mux(orig_d, scan_data, scan_en_sig.clone(), mux_sig.clone());
        module.cell_mut(id).set_port("D", mux_sig);

        prev = q;
    }

    // End of the chain: the last FF's top bit.
    let out_sig = module.sig(scan_out);
    module.connect(out_sig, SigSpec::from_bit(prev.msb()));

    module.fixup_ports();
    module.set_attr(CHAIN_LENGTH_ATTR, chain_pos as i64);
    map.chain_length = chain_pos;

    info!(
        "{}: scan chain through {} FF(s), {} bits ({} memory output FFs skipped)",
        module.name,
        ffs.len(),
        chain_pos,
        skipped
    );
    Ok(map)
}

/// Build the map record for one FF. Name resolution prefers the Q
/// wire's source-level path and falls back to the cell name; reset
/// metadata recorded by reset extraction rides along.
fn variable_record(module: &Module, id: CellId, q: &SigSpec, offset: u32) -> ScanVariable {
    let cell = module.cell(id);
    let width = q.len() as u32;

    let q_wire = q.iter().find_map(|b| b.as_wire()).map(|(w, _)| w);
    let name = match q_wire {
        Some(w) => module.wire(w).hdl_name(),
        None => cell.name.clone(),
    };

    let mut var = ScanVariable {
        name: format!("{}.{}", module.name, name),
        width,
        offset,
        ..ScanVariable::default()
    };

    if let Some(w) = q_wire {
        let wire = module.wire(w);
        if let Some(value) = wire.attr(RESET_VALUE_ATTR).and_then(|v| v.as_const()) {
            var.reset_value = Some(const_to_words(&value, width as usize));
        }
        if let Some(func) = wire.attr_str(RESET_DPI_ATTR) {
            var.reset_dpi_func = Some(func.to_string());
        }
        if let Some(members) = wire.attr_str(ENUM_MEMBERS_ATTR) {
            for token in members.split(',') {
                let Some((name, value)) = token.split_once(':') else {
                    continue;
                };
                match value.parse::<u64>() {
                    Ok(value) => var.enum_members.push(EnumMember {
                        name: name.to_string(),
                        value,
                    }),
                    Err(_) => warn!(
                        "{}: bad enum member {token:?} on {}",
                        module.name,
                        module.wire(w).name
                    ),
                }
            }
        }
    }

    var
}

/// Pack a constant into `ceil(width/32)` little-endian words, truncating
/// or zero-extending to `width`; undefined bits read as zero.
fn const_to_words(value: &Const, width: usize) -> Vec<u32> {
    let mut words = vec![0u32; width.div_ceil(32)];
    for i in 0..width.min(value.len()) {
        if value.bit(i) == netir::State::S1 {
            words[i / 32] |= 1 << (i % 32);
        }
    }
    words
}

/// Remove the scan interface from a cloned module: demote the ports and
/// drive enable and input low.
fn tie_off_scan(module: &mut Module) {
    for name in [SCAN_ENABLE, SCAN_IN] {
        if let Some(id) = module.find_wire(name) {
            module.wire_mut(id).port_input = false;
            let sig = module.sig(id);
            module.connect(sig, SigSpec::zeros(1));
        }
    }
    if let Some(id) = module.find_wire(SCAN_OUT) {
        module.wire_mut(id).port_output = false;
    }
    module.fixup_ports();
}

mod equiv {
    //! Bounded random co-simulation of the original module against the
    //! rewritten one with scan tied off. Both start from the all-zero
    //! register state and see identical input streams; every output must
    //! match on every cycle.

    use netir::interp::Interp;
    use netir::{Const, IrError, Module};
    use rand::{RngExt, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    pub fn check(
        gold: &Module,
        gate: &Module,
        runs: usize,
        cycles: usize,
    ) -> Result<(), IrError> {
        let inputs: Vec<(String, usize)> = gold
            .wires()
            .filter(|(_, w)| w.port_input)
            .map(|(_, w)| (w.name.clone(), w.width))
            .collect();
        let outputs: Vec<String> = gold
            .wires()
            .filter(|(_, w)| w.port_output)
            .map(|(_, w)| w.name.clone())
            .collect();

        for run in 0..runs {
            let mut rng = ChaCha8Rng::seed_from_u64(run as u64);
            let mut sim_gold = Interp::new(gold);
            let mut sim_gate = Interp::new(gate);

            for cycle in 0..cycles {
                for (name, width) in &inputs {
                    let value = Const::from_u64(rng.random(), *width);
                    sim_gold.set_input_bits(name, &value);
                    sim_gate.set_input_bits(name, &value);
                }
                for name in &outputs {
                    let a = sim_gold.get(name);
                    let b = sim_gate.get(name);
                    if a != b {
                        return Err(IrError::InvalidIr(format!(
                            "scan equivalence check failed: output {name} \
                             diverged in run {run} cycle {cycle} ({a} vs {b})"
                        )));
                    }
                }
                sim_gold.step();
                sim_gate.step();
            }
        }
        Ok(())
    }
}
