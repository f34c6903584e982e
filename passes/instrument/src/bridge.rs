// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DPI bridge synthesis.
//!
//! Collects every DPI call cell that is not reset-time, assigns
//! monotonically increasing 8-bit func-ids in cell iteration order, and
//! wires the calls into a four-port bridge interface. With more than
//! one call, func-id and args go through a priority mux built from the
//! last call to the first so that func-id 0 dominates — the host
//! assumes the lowest id wins when several valid conditions are hot on
//! the same cycle.

use log::{debug, info, warn};
use netir::{Bit, CellId, CellType, Const, IrError, Module, SigMap, SigSpec, State};

use crate::{attrs, DPI_ARGS, DPI_FUNC_ID, DPI_RESULT, DPI_VALID, N_DPI_FUNCS_ATTR};

/// One argument of a DPI function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DpiArg {
    pub name: String,
    pub ty: String,
    pub direction: String,
    pub width: usize,
    /// Compile-time constant for string arguments.
    pub string_value: Option<String>,
}

/// A DPI function descriptor, as emitted into the metadata artefacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DpiFunction {
    pub name: String,
    pub func_id: u8,
    /// Total packed hardware argument width.
    pub arg_width: usize,
    pub ret_width: usize,
    pub ret_type: String,
    pub args: Vec<DpiArg>,
    /// Generated display function with an inline printf body.
    pub builtin: bool,
    /// Reset-time call: not bridged into hardware, issued by the host at
    /// reset release with compile-time constant arguments.
    pub reset: bool,
}

struct CallSite {
    cell: CellId,
    func: DpiFunction,
    args_sig: SigSpec,
    result_sig: SigSpec,
    valid: SigSpec,
}

pub fn create_bridge(module: &mut Module) -> Result<Vec<DpiFunction>, IrError> {
    let mut candidates = Vec::new();
    let mut reset_calls = Vec::new();
    for (id, cell) in module.cells() {
        if cell.ty != CellType::DpiCall {
            continue;
        }
        if cell.attr_bool(attrs::RESET) {
            reset_calls.push(id);
        } else {
            candidates.push(id);
        }
    }
    if candidates.is_empty() && reset_calls.is_empty() {
        debug!("{}: no DPI call cells", module.name);
        return Ok(Vec::new());
    }

    info!(
        "{}: bridging {} DPI call(s), {} reset-time call(s)",
        module.name,
        candidates.len(),
        reset_calls.len()
    );

    let mut sites = Vec::new();
    let mut next_id = 0u8;
    for id in candidates {
        let Some(site) = collect_site(module, id, &mut next_id, true)? else {
            continue;
        };
        sites.push(site);
    }
    if !sites.is_empty() {
        wire_bridge(module, &sites);
        module.set_attr(N_DPI_FUNCS_ATTR, sites.len());
    }

    let mut functions: Vec<DpiFunction> = sites.into_iter().map(|s| s.func).collect();

    // Reset-time calls are serviced by the host before the design ever
    // runs: no bridge hardware, but they keep an id and record their
    // constant arguments so the host can issue them.
    for id in reset_calls {
        if let Some(func) = collect_reset_call(module, id, &mut next_id)? {
            functions.push(func);
        }
        module.remove_cell(id);
    }

    Ok(functions)
}

/// Metadata for a reset-time call; the packed ARGS are constant, so the
/// per-argument values can be serialized instead of wired.
fn collect_reset_call(
    module: &Module,
    id: CellId,
    next_id: &mut u8,
) -> Result<Option<DpiFunction>, IrError> {
    let Some(site) = collect_site(module, id, next_id, false)? else {
        return Ok(None);
    };
    let mut func = site.func;
    func.reset = true;

    let args_const = site.args_sig.as_const().ok_or_else(|| {
        IrError::UnsupportedConstruct(format!(
            "reset-time DPI call '{}' has non-constant arguments",
            func.name
        ))
    })?;
    let mut offset = 0usize;
    for arg in &mut func.args {
        if arg.string_value.is_some() || arg.ty == "string" {
            continue;
        }
        let end = (offset + arg.width).min(args_const.len());
        if offset < end {
            let value = args_const.slice(offset, end - offset).as_u64().unwrap_or(0);
            arg.string_value = Some(value.to_string());
        }
        offset += arg.width;
    }
    Ok(Some(func))
}

fn collect_site(
    module: &Module,
    id: CellId,
    next_id: &mut u8,
    derive_valid: bool,
) -> Result<Option<CallSite>, IrError> {
    let cell = module.cell(id);
    let Some(name) = cell.attr_str(attrs::FUNC).map(str::to_string) else {
        warn!(
            "{}: DPI call cell {} has no {} attribute, skipping",
            module.name,
            cell.name,
            attrs::FUNC
        );
        return Ok(None);
    };

    let arg_width = cell.param_int("ARG_WIDTH").unwrap_or(32) as usize;
    let ret_width = cell.param_int("RET_WIDTH").unwrap_or(32) as usize;
    let ret_type = match cell.attr_str(attrs::RET_TYPE) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => if ret_width > 0 { "int" } else { "void" }.to_string(),
    };

    let split = |key: &str| -> Vec<String> {
        cell.attr_str(key)
            .map(|s| {
                s.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    };
    let names = split(attrs::ARG_NAMES);
    let types = split(attrs::ARG_TYPES);
    let widths = split(attrs::ARG_WIDTHS);
    let dirs = split(attrs::ARG_DIRS);

    let mut args = Vec::new();
    if names.is_empty() && arg_width > 0 {
        // No detailed metadata: synthesize one 32-bit arg per word.
        let n = arg_width.div_ceil(32);
        for i in 0..n {
            args.push(DpiArg {
                name: format!("arg{i}"),
                ty: "int".to_string(),
                direction: "input".to_string(),
                width: if i == n - 1 { arg_width - i * 32 } else { 32 },
                string_value: None,
            });
        }
    } else {
        for (i, name) in names.iter().enumerate() {
            let ty = types.get(i).cloned().unwrap_or_else(|| "int".to_string());
            let string_value = cell
                .attr_str(&attrs::string_arg(i))
                .map(str::to_string)
                .or_else(|| (ty == "string").then(String::new));
            args.push(DpiArg {
                name: name.clone(),
                ty,
                direction: dirs.get(i).cloned().unwrap_or_else(|| "input".to_string()),
                width: widths.get(i).and_then(|w| w.parse().ok()).unwrap_or(32),
                string_value,
            });
        }
    }

    let func = DpiFunction {
        name,
        func_id: *next_id,
        arg_width,
        ret_width,
        ret_type,
        args,
        builtin: cell.attr_bool(attrs::BUILTIN),
        reset: false,
    };
    *next_id = next_id.checked_add(1).ok_or_else(|| {
        IrError::InvalidIr(format!("{}: more than 255 DPI functions", module.name))
    })?;

    let args_sig = cell.port("ARGS").cloned().unwrap_or_default();
    let result_sig = cell.port("RESULT").cloned().unwrap_or_default();
    let valid = if derive_valid {
        derive_valid_condition(module, id, &result_sig, &func.name)
    } else {
        SigSpec::from_bit(Bit::Const(State::S0))
    };

    Ok(Some(CallSite {
        cell: id,
        func,
        args_sig,
        result_sig,
        valid,
    }))
}

/// Derive the condition under which a call executes. In order: the
/// cell's own EN port; the select of the priority-mux case feeding the
/// call's RESULT back into the design; a plain 2:1 mux on the same
/// signal; constant 1 with a warning (the call is probably outside a
/// clocked block).
fn derive_valid_condition(
    module: &Module,
    id: CellId,
    result_sig: &SigSpec,
    name: &str,
) -> SigSpec {
    let cell = module.cell(id);
    if let Some(en) = cell.port("EN") {
        if !en.is_empty() {
            debug!("{}: {} valid = EN port", module.name, name);
            return en.clone();
        }
    }

    let sigmap = SigMap::new(module);
    let result = sigmap.map(result_sig);
    if result.is_empty() {
        warn!(
            "{}: DPI call '{name}' has no result signal and no EN port, \
             assuming always valid",
            module.name
        );
        return SigSpec::from_bit(Bit::Const(State::S1));
    }

    let overlaps = |case: &SigSpec| -> bool {
        case.iter()
            .zip(result.iter())
            .any(|(a, b)| !a.is_const() && a == b)
    };

    for (_, cell) in module.cells() {
        if cell.ty != CellType::Pmux {
            continue;
        }
        let (Some(a), Some(b), Some(s)) = (cell.port("A"), cell.port("B"), cell.port("S")) else {
            continue;
        };
        let width = a.len();
        for case_idx in 0..s.len() {
            if (case_idx + 1) * width > b.len() {
                break;
            }
            let case = sigmap.map(&b.extract(case_idx * width, width));
            if overlaps(&case) {
                debug!(
                    "{}: {} valid = pmux case {case_idx} of {}",
                    module.name, name, cell.name
                );
                return SigSpec::from_bit(s[case_idx]);
            }
        }
    }

    for (_, cell) in module.cells() {
        if cell.ty != CellType::Mux {
            continue;
        }
        let (Some(b), Some(s)) = (cell.port("B"), cell.port("S")) else {
            continue;
        };
        if overlaps(&sigmap.map(b)) {
            debug!("{}: {} valid = mux select {}", module.name, name, cell.name);
            return s.clone();
        }
    }

    warn!(
        "{}: could not derive a valid condition for DPI call '{name}'; \
         DPI calls should only appear in clocked blocks",
        module.name
    );
    SigSpec::from_bit(Bit::Const(State::S1))
}

fn reduce_to_1bit(module: &mut Module, sig: SigSpec) -> SigSpec {
    if sig.len() == 1 {
        return sig;
    }
    let out = module.add_wire_auto(1);
    let out_sig = module.sig(out);
    module.add_reduce_or(sig, out_sig.clone());
    out_sig
}

fn wire_bridge(module: &mut Module, sites: &[CallSite]) {
    let max_arg_width = sites.iter().map(|s| s.func.arg_width).max().unwrap_or(0).max(1);
    let max_ret_width = sites.iter().map(|s| s.func.ret_width).max().unwrap_or(0).max(1);

    let valid = module.add_wire(DPI_VALID, 1);
    module.wire_mut(valid).port_output = true;
    let func_id = module.add_wire(DPI_FUNC_ID, 8);
    module.wire_mut(func_id).port_output = true;
    let args_out = module.add_wire(DPI_ARGS, max_arg_width);
    module.wire_mut(args_out).port_output = true;
    let result_in = module.add_wire(DPI_RESULT, max_ret_width);
    module.wire_mut(result_in).port_input = true;

    let valid_sig = module.sig(valid);
    let func_id_sig = module.sig(func_id);
    let args_sig = module.sig(args_out);
    let result_sig = module.sig(result_in);

    let valid_1bit: Vec<SigSpec> = sites
        .iter()
        .map(|s| reduce_to_1bit(module, s.valid.clone()))
        .collect();

    if sites.len() == 1 {
        let site = &sites[0];
        module.connect(valid_sig, valid_1bit[0].clone());
        module.connect(
            func_id_sig,
            SigSpec::from_const(&Const::from_u64(site.func.func_id as u64, 8)),
        );
        module.connect(args_sig, site.args_sig.zero_padded(max_arg_width));
    } else {
        // dpi_valid = OR of all conditions.
        let mut or_acc = valid_1bit[0].clone();
        for v in &valid_1bit[1..] {
            let out = module.add_wire_auto(1);
            let out_sig = module.sig(out);
            module.add_or(or_acc, v.clone(), out_sig.clone());
            or_acc = out_sig;
        }
        module.connect(valid_sig, or_acc);

        // Priority muxes, last to first: the first registered call wins.
        let mut id_acc = SigSpec::from_const(&Const::zeros(8));
        let mut args_acc = SigSpec::from_const(&Const::zeros(max_arg_width));
        for (i, site) in sites.iter().enumerate().rev() {
            let id_out = module.add_wire_auto(8);
            let id_out_sig = module.sig(id_out);
            module.add_mux(
                id_acc,
                SigSpec::from_const(&Const::from_u64(site.func.func_id as u64, 8)),
                valid_1bit[i].clone(),
                id_out_sig.clone(),
            );
            id_acc = id_out_sig;

            let args_out_w = module.add_wire_auto(max_arg_width);
            let args_out_sig = module.sig(args_out_w);
            module.add_mux(
                args_acc,
                site.args_sig.zero_padded(max_arg_width),
                valid_1bit[i].clone(),
                args_out_sig.clone(),
            );
            args_acc = args_out_sig;
        }
        module.connect(func_id_sig, id_acc);
        module.connect(args_sig, args_acc);
    }

    // The result slice is shared: every call reads the low bits sized to
    // its own return width. The host serialises completions, so only one
    // call consumes it per cycle.
    for site in sites.iter() {
        if !site.result_sig.is_empty() {
            module.connect(
                site.result_sig.clone(),
                result_sig.extract(0, site.result_sig.len()),
            );
        }
        debug!(
            "{}: func {} id={} arg_width={} ret_width={} base=0x{:x}",
            module.name,
            site.func.name,
            site.func.func_id,
            site.func.arg_width,
            site.func.ret_width,
            emu_proto::dpi_func_base(site.func.func_id)
        );
    }

    for site in sites.iter() {
        module.remove_cell(site.cell);
    }

    module.fixup_ports();
}
