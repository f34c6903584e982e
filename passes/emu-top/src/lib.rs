// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulation wrapper generation.
//!
//! Synthesizes a top-level module that owns the external clock:
//!
//! ```text
//! clk ─→ [emu_clk_gate] ─→ clk_gated ─→ DUT
//!              ↑
//!              ce = !emu_dpi_valid | emu_dpi_ack
//! ```
//!
//! While a DPI call is pending and the host has not acknowledged it the
//! gated clock halts, freezing the DUT mid-call. `emu_dpi_ack` is an
//! input of the wrapper only — the DUT never sees the handshake, it is
//! simply not clocked until the result is in place.
//!
//! Everything else is structural: the DUT's instrumentation ports
//! (bridge, scan, shadow, enable, finish) and its functional ports are
//! mirrored one-to-one onto the wrapper.

use log::{info, warn};
use netir::{CellType, Design, IrError, Module, SigSpec, State};

/// Wrapper-only handshake input.
pub const DPI_ACK: &str = "emu_dpi_ack";
/// DPI-valid output of an instrumented DUT.
pub const DPI_VALID: &str = "emu_dpi_valid";
/// Clock gate primitive and its instance name.
pub const CLK_GATE_TYPE: &str = "emu_clk_gate";
pub const CLK_GATE_INSTANCE: &str = "u_clk_gate";
pub const DUT_INSTANCE: &str = "u_dut";

#[derive(Clone, Debug)]
pub struct Options {
    /// Wrapper module name; default `emu_top_<dut>`.
    pub wrapper_name: Option<String>,
    pub clk_name: String,
    pub rst_name: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            wrapper_name: None,
            clk_name: "clk_i".to_string(),
            rst_name: "rst_ni".to_string(),
        }
    }
}

struct PortInfo {
    name: String,
    width: usize,
    input: bool,
    output: bool,
}

pub fn run(design: &mut Design, top: &str, opts: &Options) -> Result<String, IrError> {
    let dut = design
        .module(top)
        .ok_or_else(|| IrError::InvalidArgument(format!("no module named {top}")))?;

    let ports: Vec<PortInfo> = dut
        .wires()
        .filter(|(_, w)| w.is_port())
        .map(|(_, w)| PortInfo {
            name: w.name.clone(),
            width: w.width,
            input: w.port_input,
            output: w.port_output,
        })
        .collect();

    if !ports.iter().any(|p| p.name == opts.clk_name) {
        warn!("{top}: clock port '{}' not found in DUT", opts.clk_name);
    }
    let has_rst = ports.iter().any(|p| p.name == opts.rst_name && p.input);
    let has_dpi = ports.iter().any(|p| p.name == DPI_VALID && p.output);

    let wrapper_name = opts
        .wrapper_name
        .clone()
        .unwrap_or_else(|| format!("emu_top_{top}"));
    info!("{top}: creating wrapper '{wrapper_name}' (dpi: {has_dpi}, rst: {has_rst})");

    let mut wrapper = Module::new(wrapper_name.clone());

    // External clock, gated clock, clock enable.
    let ext_clk = wrapper.add_wire(&opts.clk_name, 1);
    wrapper.wire_mut(ext_clk).port_input = true;
    let clk_gated = wrapper.add_wire("clk_gated", 1);
    let clk_enable = wrapper.add_wire("clk_enable", 1);

    // The handshake input exists whenever the DUT has a DPI interface;
    // it terminates in the clock-enable logic below.
    let dpi_ack = if has_dpi {
        let w = wrapper.add_wire(DPI_ACK, 1);
        wrapper.wire_mut(w).port_input = true;
        Some(w)
    } else {
        None
    };

    // The DUT's dpi_valid is tapped so it can both leave the wrapper
    // and gate the clock.
    let dpi_valid_tap = has_dpi.then(|| wrapper.add_wire("dpi_valid_tap", 1));

    // Mirror every DUT port except the clock (owned by the wrapper) and
    // dpi_valid (tapped).
    for port in &ports {
        if port.name == opts.clk_name || port.name == DPI_VALID {
            continue;
        }
        if wrapper.find_wire(&port.name).is_some() {
            warn!("{top}: port {} collides with a wrapper wire", port.name);
            continue;
        }
        let w = wrapper.add_wire(&port.name, port.width);
        wrapper.wire_mut(w).port_input = port.input;
        wrapper.wire_mut(w).port_output = port.output;
    }
    if has_dpi {
        let w = wrapper.add_wire(DPI_VALID, 1);
        wrapper.wire_mut(w).port_output = true;
    }
    wrapper.fixup_ports();

    // clk_enable = !dpi_valid | dpi_ack; without DPI the clock runs
    // free.
    match (dpi_valid_tap, dpi_ack) {
        (Some(tap), Some(ack)) => {
            let not_valid = wrapper.add_wire_auto(1);
            let (tap_sig, not_sig) = (wrapper.sig(tap), wrapper.sig(not_valid));
            wrapper.add_not(tap_sig, not_sig.clone());
            let (ack_sig, ce_sig) = (wrapper.sig(ack), wrapper.sig(clk_enable));
            wrapper.add_or(not_sig, ack_sig, ce_sig);

            let (valid_out, tap_sig) =
                (wrapper.find_wire(DPI_VALID).unwrap(), wrapper.sig(tap));
            let out_sig = wrapper.sig(valid_out);
            wrapper.connect(out_sig, tap_sig);
        }
        _ => {
            let ce_sig = wrapper.sig(clk_enable);
            wrapper.connect(ce_sig, SigSpec::from_bit(netir::Bit::Const(State::S1)));
        }
    }

    // The clock gate primitive; a technology library supplies the
    // implementation downstream.
    let gate = wrapper.add_cell(CLK_GATE_INSTANCE, CellType::User(CLK_GATE_TYPE.to_string()));
    let (clk_sig, ce_sig, gated_sig) = (
        wrapper.sig(ext_clk),
        wrapper.sig(clk_enable),
        wrapper.sig(clk_gated),
    );
    {
        let cell = wrapper.cell_mut(gate);
        cell.set_port("clk_i", clk_sig);
        cell.set_port("ce_i", ce_sig);
        cell.set_port("clk_o", gated_sig);
    }

    // The DUT instance: clock from the gate, everything else from the
    // mirrored wrapper wire of the same name. dpi_ack is deliberately
    // absent.
    let dut_inst = wrapper.add_cell(DUT_INSTANCE, CellType::User(top.to_string()));
    let mut conns: Vec<(String, SigSpec)> = Vec::new();
    for port in &ports {
        let sig = if port.name == opts.clk_name {
            wrapper.sig(clk_gated)
        } else if port.name == DPI_VALID {
            wrapper.sig(dpi_valid_tap.expect("tap exists when dpi_valid does"))
        } else {
            let w = wrapper.find_wire(&port.name).expect("mirrored above");
            wrapper.sig(w)
        };
        conns.push((port.name.clone(), sig));
    }
    {
        let cell = wrapper.cell_mut(dut_inst);
        for (port, sig) in conns {
            cell.set_port(&port, sig);
        }
    }

    wrapper.fixup_ports();
    wrapper.check()?;
    design.add_module(wrapper);

    info!("{wrapper_name}: instantiated {CLK_GATE_INSTANCE} and {DUT_INSTANCE}");
    Ok(wrapper_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrumented_dut() -> Design {
        let mut m = Module::new("dut");
        let mk = |m: &mut Module, name: &str, width: usize, input: bool| {
            let w = m.add_wire(name, width);
            if input {
                m.wire_mut(w).port_input = true;
            } else {
                m.wire_mut(w).port_output = true;
            }
        };
        mk(&mut m, "clk_i", 1, true);
        mk(&mut m, "rst_ni", 1, true);
        mk(&mut m, "data_i", 8, true);
        mk(&mut m, "data_o", 8, false);
        mk(&mut m, "emu_dpi_valid", 1, false);
        mk(&mut m, "emu_dpi_func_id", 8, false);
        mk(&mut m, "emu_dpi_args", 16, false);
        mk(&mut m, "emu_dpi_result", 8, true);
        mk(&mut m, "emu_scan_enable", 1, true);
        mk(&mut m, "emu_scan_in", 1, true);
        mk(&mut m, "emu_scan_out", 1, false);
        mk(&mut m, "emu_en", 1, true);
        mk(&mut m, "emu_finish_o", 1, false);
        m.fixup_ports();
        let mut d = Design::new();
        d.add_module(m);
        d
    }

    #[test]
    fn wrapper_mirrors_ports_and_gates_the_clock() {
        let mut d = instrumented_dut();
        let name = run(&mut d, "dut", &Options::default()).unwrap();
        assert_eq!(name, "emu_top_dut");

        let w = d.module("emu_top_dut").unwrap();
        let port = |n: &str| {
            let id = w.find_wire(n).unwrap_or_else(|| panic!("missing {n}"));
            w.wire(id)
        };

        assert!(port("clk_i").port_input);
        assert!(port("rst_ni").port_input);
        assert!(port("data_i").port_input);
        assert!(port("data_o").port_output);
        assert!(port("emu_dpi_valid").port_output);
        assert!(port(DPI_ACK).port_input);
        assert_eq!(port("emu_dpi_func_id").width, 8);
        assert!(port("emu_dpi_func_id").port_output);
        assert_eq!(port("emu_dpi_args").width, 16);
        assert!(port("emu_dpi_result").port_input);
        assert!(port("emu_scan_enable").port_input);
        assert!(port("emu_scan_out").port_output);
        assert!(port("emu_en").port_input);
        assert!(port("emu_finish_o").port_output);

        // The gate instance drives the DUT clock from clk_gated.
        let (_, gate) = w
            .cells()
            .find(|(_, c)| c.name == CLK_GATE_INSTANCE)
            .unwrap();
        assert_eq!(gate.ty, CellType::User(CLK_GATE_TYPE.to_string()));
        let clk_gated = w.find_wire("clk_gated").unwrap();
        assert_eq!(gate.port("clk_o"), Some(&w.sig(clk_gated)));

        let (_, dut) = w.cells().find(|(_, c)| c.name == DUT_INSTANCE).unwrap();
        assert_eq!(dut.ty, CellType::User("dut".to_string()));
        assert_eq!(dut.port("clk_i"), Some(&w.sig(clk_gated)));

        // The handshake never reaches the DUT.
        assert!(!dut.has_port(DPI_ACK));
        // The reset passes straight through.
        let rst = w.find_wire("rst_ni").unwrap();
        assert_eq!(dut.port("rst_ni"), Some(&w.sig(rst)));
    }

    #[test]
    fn clock_enable_logic_present_with_dpi() {
        let mut d = instrumented_dut();
        run(&mut d, "dut", &Options::default()).unwrap();
        let w = d.module("emu_top_dut").unwrap();

        // ce = !dpi_valid | dpi_ack: one Not, one Or.
        assert!(w.cells().any(|(_, c)| c.ty == CellType::Not));
        assert!(w.cells().any(|(_, c)| c.ty == CellType::Or));
    }

    #[test]
    fn no_dpi_means_free_running_clock() {
        let mut m = Module::new("plain");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let q = m.add_wire("q", 1);
        m.wire_mut(q).port_output = true;
        m.fixup_ports();
        let mut d = Design::new();
        d.add_module(m);

        run(&mut d, "plain", &Options::default()).unwrap();
        let w = d.module("emu_top_plain").unwrap();
        assert!(w.find_wire(DPI_ACK).is_none());

        // clk_enable is tied high.
        let ce = w.find_wire("clk_enable").unwrap();
        let conn = w
            .connections
            .iter()
            .find(|c| c.lhs == w.sig(ce))
            .expect("clk_enable must be tied");
        assert!(conn.rhs.as_const().unwrap().as_u64() == Some(1));
    }

    #[test]
    fn custom_wrapper_name() {
        let mut d = instrumented_dut();
        let name = run(
            &mut d,
            "dut",
            &Options {
                wrapper_name: Some("emu_system_top".to_string()),
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(name, "emu_system_top");
        assert!(d.module("emu_system_top").is_some());
    }
}
