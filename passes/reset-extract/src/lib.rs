// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reset extraction.
//!
//! Captures each flip-flop's reset value as metadata and strips the
//! asynchronous reset machinery from the netlist. Async resets map badly
//! to FPGA flip-flops and defeat clock gating, so the reset semantics
//! move into an `emu_reset_value` attribute on the Q wire which the host
//! restores through the scan chain.
//!
//! After this pass:
//!
//! - `adff` → `dff`, `adffe` → `dffe`, `dffsr` → `dff`, `dffsre` → `dffe`
//! - `aldff`/`aldffe` with a constant async-load value are treated like
//!   `adff`; ones whose load data comes from a DPI call with constant
//!   arguments keep the call cell for host-side execution and record the
//!   function name on the Q wire. Anything else is a hard failure.
//! - `sdff`/`sdffe`/`sdffce` keep their cells (the reset logic goes dead
//!   once the reset net is tied off and constant propagation runs) but
//!   their values are recorded.
//! - The named reset port is driven to its inactive constant and demoted
//!   from the port list.

use log::{debug, info};
use netir::{Cell, CellId, CellType, Const, IrError, Module, SigMap, SigSpec};

/// Attribute holding a FF's reset value, on the Q wire.
pub const RESET_VALUE_ATTR: &str = "emu_reset_value";
/// Attribute naming the reset-time DPI function, on the Q wire.
pub const RESET_DPI_ATTR: &str = "emu_reset_dpi_func";
/// Marks a DPI call cell as reset-time (executed by the host, not
/// bridged into hardware).
pub const DPI_RESET_ATTR: &str = "emu_dpi_reset";
/// Module stamp: reset extraction ran.
pub const EXTRACTED_ATTR: &str = "emu_resets_extracted";
/// DPI call cell attribute carrying the function name.
pub const DPI_FUNC_ATTR: &str = "emu_dpi_func";

#[derive(Clone, Debug)]
pub struct Options {
    /// Reset port to tie off, `None` to leave ports alone. Active-low.
    pub rst_name: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            rst_name: Some("rst_ni".to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub async_stripped: usize,
    pub sync_kept: usize,
    pub no_reset: usize,
}

pub fn run(module: &mut Module, opts: &Options) -> Result<Stats, IrError> {
    module.check()?;

    let mut stats = Stats::default();

    for id in module.cell_ids() {
        let ty = module.cell(id).ty.clone();
        match ty {
            CellType::Adff | CellType::Adffe => {
                let value = required_param(module.cell(id), "ARST_VALUE")?;
                set_reset_attr(module, id, value)?;
                strip_async(module, id, ty == CellType::Adffe);
                stats.async_stripped += 1;
            }
            CellType::Dffsr | CellType::Dffsre => {
                // No explicit reset value on set/reset FFs; they are rare
                // and default to all-zeros.
                let width = required_width(module.cell(id))?;
                set_reset_attr(module, id, Const::zeros(width))?;
                strip_async(module, id, ty == CellType::Dffsre);
                stats.async_stripped += 1;
            }
            CellType::Aldff | CellType::Aldffe => {
                process_aldff(module, id, ty == CellType::Aldffe)?;
                stats.async_stripped += 1;
            }
            CellType::Sdff | CellType::Sdffe | CellType::Sdffce => {
                let value = required_param(module.cell(id), "SRST_VALUE")?;
                set_reset_attr(module, id, value)?;
                stats.sync_kept += 1;
            }
            CellType::Dff | CellType::Dffe => {
                stats.no_reset += 1;
            }
            _ => {}
        }
    }

    if stats.async_stripped + stats.sync_kept > 0 {
        module.set_attr(EXTRACTED_ATTR, "1");

        if let Some(rst_name) = &opts.rst_name {
            tie_off_reset(module, rst_name);
        }
    }

    info!(
        "{}: async resets stripped: {}, sync resets kept: {}, no-reset FFs: {}",
        module.name, stats.async_stripped, stats.sync_kept, stats.no_reset
    );

    module.check()?;
    Ok(stats)
}

fn required_param(cell: &Cell, name: &str) -> Result<Const, IrError> {
    cell.param_const(name).ok_or_else(|| IrError::MissingAttribute {
        entity: format!("cell {}", cell.name),
        attribute: name.to_string(),
    })
}

fn required_width(cell: &Cell) -> Result<usize, IrError> {
    cell.param_int("WIDTH")
        .map(|w| w as usize)
        .ok_or_else(|| IrError::MissingAttribute {
            entity: format!("cell {}", cell.name),
            attribute: "WIDTH".to_string(),
        })
}

/// Record the reset value on the first wire of the Q signal; one
/// attribute covers the whole variable.
fn set_reset_attr(module: &mut Module, id: CellId, value: Const) -> Result<(), IrError> {
    let q = module
        .cell(id)
        .port("Q")
        .cloned()
        .ok_or_else(|| IrError::InvalidIr(format!("FF {} has no Q", module.cell(id).name)))?;
    if let Some((wire, _)) = q.iter().find_map(|b| b.as_wire()) {
        module.wire_mut(wire).set_attr(RESET_VALUE_ATTR, value);
    }
    Ok(())
}

/// Replace an async-reset FF with its plain-clock variant, dropping the
/// reset/load/set/clear ports and parameters.
fn strip_async(module: &mut Module, id: CellId, keep_en: bool) {
    let old = module.cell(id).clone();
    debug!(
        "{}: stripping {} ({})",
        module.name,
        old.name,
        old.ty.as_str()
    );

    let new_ty = if keep_en { CellType::Dffe } else { CellType::Dff };
    let new_id = module.add_cell_auto(new_ty);
    let cell = module.cell_mut(new_id);
    for param in ["WIDTH", "CLK_POLARITY"] {
        if let Some(v) = old.params.get(param) {
            cell.params.insert(param.to_string(), v.clone());
        }
    }
    for port in ["CLK", "D", "Q"] {
        if let Some(sig) = old.port(port) {
            cell.set_port(port, sig.clone());
        }
    }
    if keep_en {
        if let Some(v) = old.params.get("EN_POLARITY") {
            cell.params.insert("EN_POLARITY".to_string(), v.clone());
        }
        if let Some(sig) = old.port("EN") {
            cell.set_port("EN", sig.clone());
        }
    }

    module.remove_cell(id);
}

/// Async-load FFs: a constant load value behaves like `adff`; a load
/// value computed by a DPI call with constant arguments is deferred to
/// the host at reset time. Anything else cannot be emulated.
fn process_aldff(module: &mut Module, id: CellId, has_en: bool) -> Result<(), IrError> {
    let ad = module
        .cell(id)
        .port("AD")
        .cloned()
        .ok_or_else(|| IrError::InvalidIr(format!("aldff {} has no AD", module.cell(id).name)))?;

    if let Some(value) = ad.as_const() {
        set_reset_attr(module, id, value)?;
        strip_async(module, id, has_en);
        return Ok(());
    }

    let Some(dpi_id) = find_driving_dpi_call(module, &ad) else {
        return Err(IrError::UnsupportedConstruct(format!(
            "aldff {}: AD is neither constant nor driven by a DPI call",
            module.cell(id).name
        )));
    };

    let dpi = module.cell(dpi_id);
    let func = dpi
        .attr_str(DPI_FUNC_ATTR)
        .ok_or_else(|| IrError::MissingAttribute {
            entity: format!("cell {}", dpi.name),
            attribute: DPI_FUNC_ATTR.to_string(),
        })?
        .to_string();
    if let Some(args) = dpi.port("ARGS") {
        if !args.is_fully_const() {
            return Err(IrError::UnsupportedConstruct(format!(
                "DPI call '{func}' in a reset block has non-constant arguments; \
                 only constant arguments are supported for reset-time calls"
            )));
        }
    }

    {
        let dpi = module.cell_mut(dpi_id);
        dpi.set_attr(DPI_RESET_ATTR, true);
        dpi.set_attr("keep", true);
    }

    let width = required_width(module.cell(id))?;
    set_reset_attr(module, id, Const::zeros(width))?;
    let q = module.cell(id).port("Q").cloned().unwrap_or_default();
    if let Some((wire, _)) = q.iter().find_map(|b| b.as_wire()) {
        module.wire_mut(wire).set_attr(RESET_DPI_ATTR, func.as_str());
    }

    strip_async(module, id, has_en);
    Ok(())
}

/// Find the DPI call cell whose RESULT drives `sig`, seen through the
/// module's direct connections.
fn find_driving_dpi_call(module: &Module, sig: &SigSpec) -> Option<CellId> {
    let sigmap = SigMap::new(module);
    let want = sigmap.map(sig);
    for (id, cell) in module.cells() {
        if cell.ty != CellType::DpiCall {
            continue;
        }
        let Some(result) = cell.port("RESULT") else {
            continue;
        };
        if !result.is_empty() && sigmap.map(result) == want {
            return Some(id);
        }
    }
    None
}

/// Drive the reset net to its inactive constant (active-low, so all
/// ones) and demote it from the port list. Constant propagation
/// downstream deletes the dead reset tree.
fn tie_off_reset(module: &mut Module, rst_name: &str) {
    let Some(id) = module.find_wire(rst_name) else {
        return;
    };
    if !module.wire(id).port_input {
        return;
    }
    let width = module.wire(id).width;
    module.wire_mut(id).port_input = false;
    module.connect(
        SigSpec::from_wire(id, width),
        SigSpec::from_const(&Const::ones(width)),
    );
    module.fixup_ports();
    info!("{}: removed reset port '{rst_name}' (tied to constant 1)", module.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use netir::Bit;

    fn counter_module() -> Module {
        let mut m = Module::new("counter");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let rst = m.add_wire("rst_ni", 1);
        m.wire_mut(rst).port_input = true;
        let d = m.add_wire("d", 8);
        let q = m.add_wire("q", 8);
        m.wire_mut(q).port_output = true;
        m.wire_mut(q).set_attr("hdlname", "counter q");

        let ff = m.add_cell("q_reg", CellType::Adff);
        let (clk_s, rst_s, d_s, q_s) = (m.sig(clk), m.sig(rst), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 8usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_param("ARST_POLARITY", 0i64);
            cell.set_param("ARST_VALUE", Const::from_u64(0x42, 8));
            cell.set_port("CLK", clk_s);
            cell.set_port("ARST", rst_s);
            cell.set_port("D", d_s);
            cell.set_port("Q", q_s);
        }
        // keep `d` driven so the module checks clean
        let (d_s, q_s) = (m.sig(d), m.sig(q));
        m.connect(d_s, q_s);
        m.fixup_ports();
        m
    }

    #[test]
    fn adff_reset_value_recorded_and_stripped() {
        let mut m = counter_module();
        let stats = run(&mut m, &Options::default()).unwrap();
        assert_eq!(stats.async_stripped, 1);

        // The Q wire carries the reset value.
        let q = m.find_wire("q").unwrap();
        let value = m.wire(q).attr(RESET_VALUE_ATTR).unwrap().as_const().unwrap();
        assert_eq!(value.as_u64(), Some(0x42));

        // Every async-reset cell is gone; the replacement is a plain dff.
        assert!(m.cells().all(|(_, c)| c.ty == CellType::Dff));
        let (_, ff) = m.cells().next().unwrap();
        assert!(!ff.has_port("ARST"));
        assert!(ff.params.get("ARST_VALUE").is_none());

        // Reset is no longer an input port and is tied inactive.
        let rst = m.find_wire("rst_ni").unwrap();
        assert!(!m.wire(rst).port_input);
        assert!(!m.ports.contains(&rst));
        let tied = m
            .connections
            .iter()
            .find(|c| c.lhs.iter().any(|b| *b == Bit::Wire(rst, 0)))
            .expect("reset must be tied off");
        assert_eq!(tied.rhs.as_const().unwrap(), Const::ones(1));

        assert_eq!(m.attr_str(EXTRACTED_ATTR), Some("1"));
        m.check().unwrap();
    }

    #[test]
    fn sdff_kept_with_value_recorded() {
        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let rst = m.add_wire("rst_ni", 1);
        m.wire_mut(rst).port_input = true;
        let d = m.add_wire("d", 4);
        m.wire_mut(d).port_input = true;
        let q = m.add_wire("q", 4);
        m.wire_mut(q).port_output = true;
        let ff = m.add_cell("ff", CellType::Sdff);
        let (clk_s, rst_s, d_s, q_s) = (m.sig(clk), m.sig(rst), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 4usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_param("SRST_POLARITY", 0i64);
            cell.set_param("SRST_VALUE", Const::from_u64(0x5, 4));
            cell.set_port("CLK", clk_s);
            cell.set_port("SRST", rst_s);
            cell.set_port("D", d_s);
            cell.set_port("Q", q_s);
        }
        m.fixup_ports();

        let stats = run(&mut m, &Options::default()).unwrap();
        assert_eq!(stats.sync_kept, 1);
        assert_eq!(stats.async_stripped, 0);

        // Cell survives, value is recorded, reset port is still gone.
        let (_, ff) = m.cells().next().unwrap();
        assert_eq!(ff.ty, CellType::Sdff);
        let q = m.find_wire("q").unwrap();
        let value = m.wire(q).attr(RESET_VALUE_ATTR).unwrap().as_const().unwrap();
        assert_eq!(value.as_u64(), Some(0x5));
        let rst = m.find_wire("rst_ni").unwrap();
        assert!(!m.wire(rst).port_input);
    }

    #[test]
    fn aldff_with_constant_load() {
        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let load = m.add_wire("load", 1);
        m.wire_mut(load).port_input = true;
        let d = m.add_wire("d", 4);
        m.wire_mut(d).port_input = true;
        let q = m.add_wire("q", 4);
        m.wire_mut(q).port_output = true;
        let ff = m.add_cell("ff", CellType::Aldff);
        let (clk_s, load_s, d_s, q_s) = (m.sig(clk), m.sig(load), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 4usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_param("ALOAD_POLARITY", 1i64);
            cell.set_port("CLK", clk_s);
            cell.set_port("ALOAD", load_s);
            cell.set_port("AD", SigSpec::from_const(&Const::from_u64(0x9, 4)));
            cell.set_port("D", d_s);
            cell.set_port("Q", q_s);
        }
        m.fixup_ports();

        run(&mut m, &Options { rst_name: None }).unwrap();
        let q = m.find_wire("q").unwrap();
        let value = m.wire(q).attr(RESET_VALUE_ATTR).unwrap().as_const().unwrap();
        assert_eq!(value.as_u64(), Some(0x9));
        assert!(m.cells().all(|(_, c)| c.ty == CellType::Dff));
    }

    #[test]
    fn aldff_driven_by_reset_dpi_call() {
        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let load = m.add_wire("load", 1);
        m.wire_mut(load).port_input = true;
        let d = m.add_wire("d", 32);
        m.wire_mut(d).port_input = true;
        let ad = m.add_wire("ad", 32);
        let q = m.add_wire("q", 32);
        m.wire_mut(q).port_output = true;

        let dpi = m.add_cell("init_call", CellType::DpiCall);
        let ad_s = m.sig(ad);
        {
            let cell = m.cell_mut(dpi);
            cell.set_attr(DPI_FUNC_ATTR, "boot_value");
            cell.set_param("ARG_WIDTH", 32usize);
            cell.set_param("RET_WIDTH", 32usize);
            cell.set_port("ARGS", SigSpec::from_const(&Const::from_u64(7, 32)));
            cell.set_port("RESULT", ad_s);
        }

        let ff = m.add_cell("ff", CellType::Aldff);
        let (clk_s, load_s, ad_s, d_s, q_s) =
            (m.sig(clk), m.sig(load), m.sig(ad), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 32usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_param("ALOAD_POLARITY", 1i64);
            cell.set_port("CLK", clk_s);
            cell.set_port("ALOAD", load_s);
            cell.set_port("AD", ad_s);
            cell.set_port("D", d_s);
            cell.set_port("Q", q_s);
        }
        m.fixup_ports();

        run(&mut m, &Options { rst_name: None }).unwrap();

        let q = m.find_wire("q").unwrap();
        assert_eq!(m.wire(q).attr_str(RESET_DPI_ATTR), Some("boot_value"));
        let dpi = m.cells().find(|(_, c)| c.ty == CellType::DpiCall).unwrap().1;
        assert!(dpi.attr_bool(DPI_RESET_ATTR));
        assert!(dpi.attr_bool("keep"));
    }

    #[test]
    fn aldff_with_unknown_driver_fails() {
        let mut m = Module::new("t");
        let clk = m.add_wire("clk_i", 1);
        m.wire_mut(clk).port_input = true;
        let load = m.add_wire("load", 1);
        m.wire_mut(load).port_input = true;
        let ad = m.add_wire("ad", 4);
        m.wire_mut(ad).port_input = true;
        let d = m.add_wire("d", 4);
        m.wire_mut(d).port_input = true;
        let q = m.add_wire("q", 4);
        m.wire_mut(q).port_output = true;
        let ff = m.add_cell("ff", CellType::Aldff);
        let (clk_s, load_s, ad_s, d_s, q_s) =
            (m.sig(clk), m.sig(load), m.sig(ad), m.sig(d), m.sig(q));
        {
            let cell = m.cell_mut(ff);
            cell.set_param("WIDTH", 4usize);
            cell.set_param("CLK_POLARITY", 1i64);
            cell.set_param("ALOAD_POLARITY", 1i64);
            cell.set_port("CLK", clk_s);
            cell.set_port("ALOAD", load_s);
            cell.set_port("AD", ad_s);
            cell.set_port("D", d_s);
            cell.set_port("Q", q_s);
        }
        m.fixup_ports();

        let err = run(&mut m, &Options::default()).unwrap_err();
        assert!(matches!(err, IrError::UnsupportedConstruct(_)));
    }
}
