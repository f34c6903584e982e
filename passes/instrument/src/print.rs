// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `print` → DPI call lowering.
//!
//! A `print` cell carries a structured format spec (the `FORMAT`
//! parameter, a JSON-encoded part list) and the concatenated placeholder
//! signals on `ARGS`. Lowering turns it into a generated built-in DPI
//! call: the format string becomes a C-style string constant attribute
//! (it never travels through hardware), only the placeholder signals
//! stay on the args bus. The generated dispatch wrapper reconstructs the
//! `printf` — no user implementation needed.

use log::info;
use netir::{CellType, IrError, Module, SigSpec};
use serde::{Deserialize, Serialize};

use crate::attrs;

/// One piece of a print cell's format spec.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FmtPart {
    /// Literal text.
    Literal { text: String },
    /// An integer placeholder consuming `width` bits of `ARGS`.
    Integer {
        base: u32,
        signed: bool,
        #[serde(default)]
        upper: bool,
        width: usize,
    },
    /// A string-valued signal consuming `width` bits of `ARGS`.
    String { width: usize },
    /// Simulation time marker; not emulatable.
    Time,
    /// Unicode character; not emulatable.
    Char,
}

/// Escape a literal for inclusion in a C string constant.
fn escape_c(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
}

pub fn lower_prints(module: &mut Module) -> Result<(), IrError> {
    let prints: Vec<_> = module
        .cells()
        .filter(|(_, c)| c.ty == CellType::Print)
        .map(|(id, _)| id)
        .collect();
    if prints.is_empty() {
        return Ok(());
    }

    info!("{}: lowering {} print cell(s)", module.name, prints.len());

    let mut display_counter = 0usize;
    for id in prints {
        let cell = module.cell(id);
        let cell_name = cell.name.clone();
        let format = cell
            .params
            .get("FORMAT")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| IrError::MissingAttribute {
                entity: format!("cell {cell_name}"),
                attribute: "FORMAT".to_string(),
            })?;
        let parts: Vec<FmtPart> = serde_json::from_str(&format).map_err(|e| {
            IrError::InvalidIr(format!("cell {cell_name}: bad FORMAT spec: {e}"))
        })?;
        let all_args = cell.port("ARGS").cloned().unwrap_or_default();
        let en = cell.port("EN").cloned();

        let mut c_fmt = String::new();
        let mut hw_args = SigSpec::new();
        let mut arg_names = vec!["fmt".to_string()];
        let mut arg_types = vec!["string".to_string()];
        let mut arg_widths = vec!["0".to_string()];
        let mut arg_dirs = vec!["input".to_string()];
        let mut offset = 0usize;
        let mut hw_arg_idx = 0usize;

        for part in &parts {
            match part {
                FmtPart::Literal { text } => escape_c(text, &mut c_fmt),
                FmtPart::Integer {
                    base,
                    signed,
                    upper,
                    width,
                } => {
                    match base {
                        16 => c_fmt.push_str(if *upper { "%X" } else { "%x" }),
                        10 => c_fmt.push_str("%d"),
                        8 => c_fmt.push_str("%o"),
                        // no direct binary conversion in printf
                        2 => c_fmt.push_str("0x%x"),
                        _ => c_fmt.push_str("%d"),
                    }
                    hw_args.append(&all_args.extract(offset, *width));
                    offset += width;
                    arg_names.push(format!("arg{hw_arg_idx}"));
                    arg_types.push(if *signed { "int" } else { "bit" }.to_string());
                    arg_widths.push(width.to_string());
                    arg_dirs.push("input".to_string());
                    hw_arg_idx += 1;
                }
                FmtPart::String { width } => {
                    c_fmt.push_str("%s");
                    hw_args.append(&all_args.extract(offset, *width));
                    offset += width;
                    arg_names.push(format!("arg{hw_arg_idx}"));
                    arg_types.push("bit".to_string());
                    arg_widths.push(width.to_string());
                    arg_dirs.push("input".to_string());
                    hw_arg_idx += 1;
                }
                FmtPart::Time | FmtPart::Char => {
                    return Err(IrError::UnsupportedConstruct(format!(
                        "cell {cell_name}: time/char format parts cannot be emulated"
                    )));
                }
            }
        }

        let total_width = hw_args.len();
        let dpi_name = format!("__display_{display_counter}");
        display_counter += 1;

        let dpi_id = module.add_cell_auto(CellType::DpiCall);
        let dpi = module.cell_mut(dpi_id);
        dpi.set_attr(attrs::FUNC, dpi_name.as_str());
        dpi.set_attr(attrs::BUILTIN, true);
        dpi.set_param("ARG_WIDTH", total_width);
        dpi.set_param("RET_WIDTH", 0usize);
        dpi.set_param("NUM_ARGS", hw_arg_idx + 1); // +1 for the format string
        dpi.set_port("ARGS", hw_args);
        dpi.set_port("RESULT", SigSpec::new());
        dpi.set_attr(attrs::ARG_NAMES, arg_names.join(","));
        dpi.set_attr(attrs::ARG_TYPES, arg_types.join(","));
        dpi.set_attr(attrs::ARG_WIDTHS, arg_widths.join(","));
        dpi.set_attr(attrs::ARG_DIRS, arg_dirs.join(","));
        dpi.set_attr(attrs::RET_TYPE, "void");
        dpi.set_attr(&attrs::string_arg(0), c_fmt.as_str());
        if let Some(en) = en {
            dpi.set_port("EN", en);
        }

        info!(
            "{}: {} → {} ({} hardware arg(s), {} bits)",
            module.name, cell_name, dpi_name, hw_arg_idx, total_width
        );

        module.remove_cell(id);
    }

    Ok(())
}
