// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DUT instrumentation.
//!
//! Three rewrites plus code generation:
//!
//! 1. `print` cells become generated built-in DPI calls, then every DPI
//!    call cell is lowered into a hardware mailbox bridge (`emu_dpi_*`
//!    ports with func-id, packed-args and result buses).
//! 2. `__finish` cells become a single `emu_finish_o` output.
//! 3. Every flip-flop grows an enable so the DUT freezes while `emu_en`
//!    is low; `emu_scan_enable` overrides it so scanning works on a
//!    frozen design.
//!
//! DPI calls must only appear in clocked blocks; the valid-condition
//! derivation falls back to constant 1 with a warning otherwise.
//!
//! The collected function descriptors feed two artefacts (see
//! [`codegen`]): the JSON metadata consumed by the host runtime and the
//! C dispatch source linked into the host.

use log::info;
use netir::{IrError, Module};

mod bridge;
mod finish;
mod gate;
mod print;

pub mod codegen;

pub use bridge::{DpiArg, DpiFunction};
pub use print::FmtPart;

/// Bridge port names.
pub const DPI_VALID: &str = "emu_dpi_valid";
pub const DPI_FUNC_ID: &str = "emu_dpi_func_id";
pub const DPI_ARGS: &str = "emu_dpi_args";
pub const DPI_RESULT: &str = "emu_dpi_result";
/// FF enable input; low freezes the DUT.
pub const EN_INPUT: &str = "emu_en";
/// Finish output port.
pub const FINISH_OUT: &str = "emu_finish_o";
/// Scan enable port, if a scan pass ran before us.
pub const SCAN_ENABLE: &str = "emu_scan_enable";

/// Module stamp: number of bridged DPI functions.
pub const N_DPI_FUNCS_ATTR: &str = "emu_n_dpi_funcs";

/// DPI call cell attributes (set by the front-end and the print
/// lowering).
pub mod attrs {
    pub const FUNC: &str = "emu_dpi_func";
    pub const BUILTIN: &str = "emu_dpi_builtin";
    pub const RESET: &str = "emu_dpi_reset";
    pub const RET_TYPE: &str = "emu_dpi_ret_type";
    pub const ARG_NAMES: &str = "emu_dpi_arg_names";
    pub const ARG_TYPES: &str = "emu_dpi_arg_types";
    pub const ARG_WIDTHS: &str = "emu_dpi_arg_widths";
    pub const ARG_DIRS: &str = "emu_dpi_arg_dirs";

    pub fn string_arg(index: usize) -> String {
        format!("emu_dpi_string_arg_{index}")
    }
}

#[derive(Clone, Debug, Default)]
pub struct Options {}

/// Everything the downstream artefact writers need.
#[derive(Clone, Debug, Default)]
pub struct Instrumented {
    pub functions: Vec<DpiFunction>,
    pub finish_exit_codes: Vec<i64>,
}

pub fn run(module: &mut Module, _opts: &Options) -> Result<Instrumented, IrError> {
    module.check()?;

    print::lower_prints(module)?;
    let functions = bridge::create_bridge(module)?;
    let finish_exit_codes = finish::lower_finish(module)?;
    gate::add_flop_enable(module)?;

    module.check()?;

    info!(
        "{}: instrumented ({} DPI function(s), {} finish cell(s))",
        module.name,
        functions.len(),
        finish_exit_codes.len()
    );

    Ok(Instrumented {
        functions,
        finish_exit_codes,
    })
}
