// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Artefact generation: the JSON DPI metadata consumed by the host
//! runtime and the C dispatch source compiled into it.
//!
//! The C side follows a fixed contract: one `_emu_wrap_<name>` per
//! function unpacking the 32-bit argument words (each argument consumes
//! `ceil(width/32)` words; string constants are compile-time literals
//! and consume none), plus a table of `{func_id, name, n_args,
//! ret_width, wrapper}` entries. Builtin display functions get inline
//! printf bodies; user functions get extern declarations to link
//! against.

use std::fmt::Write;

use serde::Serialize;

use crate::bridge::{DpiArg, DpiFunction};
use crate::Instrumented;
use emu_proto::{dpi_func_base, DPI_BASE, DPI_BLOCK_SIZE, MAILBOX_BASE};

#[derive(Serialize)]
struct JsonMeta<'a> {
    mailbox_base: String,
    dpi_base: String,
    func_block_size: u32,
    dpi_functions: Vec<JsonFunc<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    finish_exit_codes: Vec<i64>,
}

#[derive(Serialize)]
struct JsonFunc<'a> {
    id: u8,
    name: &'a str,
    base_addr: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    reset: bool,
    #[serde(rename = "return")]
    ret: Option<JsonReturn<'a>>,
    args: Vec<JsonArg<'a>>,
}

#[derive(Serialize)]
struct JsonReturn<'a> {
    #[serde(rename = "type")]
    ty: &'a str,
    width: usize,
}

#[derive(Serialize)]
struct JsonArg<'a> {
    name: &'a str,
    direction: &'a str,
    #[serde(rename = "type")]
    ty: &'a str,
    width: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,
}

/// Render the DPI metadata file.
pub fn dpi_json(instr: &Instrumented) -> String {
    let meta = JsonMeta {
        mailbox_base: format!("{MAILBOX_BASE:#x}"),
        dpi_base: format!("{DPI_BASE:#x}"),
        func_block_size: DPI_BLOCK_SIZE,
        dpi_functions: instr
            .functions
            .iter()
            .map(|f| JsonFunc {
                id: f.func_id,
                name: &f.name,
                base_addr: format!("{:#x}", dpi_func_base(f.func_id)),
                reset: f.reset,
                ret: (f.ret_width > 0).then(|| JsonReturn {
                    ty: &f.ret_type,
                    width: f.ret_width,
                }),
                args: f
                    .args
                    .iter()
                    .map(|a| JsonArg {
                        name: &a.name,
                        direction: &a.direction,
                        ty: &a.ty,
                        width: a.width,
                        value: a.string_value.as_deref(),
                    })
                    .collect(),
            })
            .collect(),
        finish_exit_codes: instr.finish_exit_codes.clone(),
    };
    let mut out = serde_json::to_string_pretty(&meta).expect("metadata serialization cannot fail");
    out.push('\n');
    out
}

/// Map a source-language type to the C type used at the dispatch
/// boundary. Bit vectors pick an unsigned integer family by width.
fn c_type(ty: &str, width: usize) -> &'static str {
    match ty {
        "int" | "integer" => "int32_t",
        "shortint" => "int16_t",
        "longint" => "int64_t",
        "byte" => "int8_t",
        "string" => "const char*",
        "void" => "void",
        "bit" | "logic" | "reg" => match width {
            0..=8 => "uint8_t",
            9..=16 => "uint16_t",
            17..=32 => "uint32_t",
            _ => "uint64_t",
        },
        _ if width <= 32 => "uint32_t",
        _ => "uint64_t",
    }
}

fn words(width: usize) -> usize {
    width.div_ceil(32)
}

fn write_prototype(out: &mut String, func: &DpiFunction) {
    let ret = if func.ret_width == 0 {
        "void"
    } else {
        c_type(&func.ret_type, func.ret_width)
    };
    write!(out, "extern {ret} {}(", func.name).unwrap();
    if func.args.is_empty() {
        out.push_str("void");
    } else {
        for (i, arg) in func.args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write!(out, "{} {}", c_type(&arg.ty, arg.width), arg.name).unwrap();
        }
    }
    out.push_str(");\n");
}

fn builtin_printf_args(args: &[DpiArg]) -> (String, String) {
    let mut fmt = String::new();
    let mut call = String::new();
    let mut offset = 0usize;
    for arg in args {
        if arg.ty == "string" {
            if let Some(value) = &arg.string_value {
                fmt = value.clone();
            }
            continue;
        }
        write!(call, ", ({})args[{offset}]", c_type(&arg.ty, arg.width)).unwrap();
        offset += words(arg.width);
    }
    (fmt, call)
}

fn write_wrapper(out: &mut String, func: &DpiFunction) {
    writeln!(
        out,
        "static uint64_t _emu_wrap_{}(const uint32_t *args) {{",
        func.name
    )
    .unwrap();

    if func.builtin {
        let (fmt, call_args) = builtin_printf_args(&func.args);
        writeln!(out, "    printf(\"{fmt}\"{call_args});").unwrap();
        writeln!(out, "    return 0;").unwrap();
    } else {
        let mut call = String::new();
        let mut offset = 0usize;
        for (i, arg) in func.args.iter().enumerate() {
            if i > 0 {
                call.push_str(", ");
            }
            match &arg.string_value {
                Some(value) if arg.ty == "string" => {
                    write!(call, "\"{value}\"").unwrap();
                }
                // Compile-time constant (reset-time calls): bake the
                // literal instead of reading argument registers.
                Some(value) => {
                    write!(call, "({}){value}", c_type(&arg.ty, arg.width)).unwrap();
                }
                None => {
                    write!(call, "({})args[{offset}]", c_type(&arg.ty, arg.width)).unwrap();
                    offset += words(arg.width);
                }
            }
        }
        if func.ret_width > 0 {
            writeln!(out, "    return (uint64_t){}({call});", func.name).unwrap();
        } else {
            writeln!(out, "    {}({call});", func.name).unwrap();
            writeln!(out, "    return 0;").unwrap();
        }
    }
    out.push_str("}\n\n");
}

/// Render the C dispatch source.
pub fn dispatch_source(instr: &Instrumented) -> String {
    let funcs = &instr.functions;
    let mut out = String::new();
    out.push_str("// Generated DPI dispatch table - DO NOT EDIT\n");
    out.push_str("//\n");
    out.push_str("// Link this with your DPI implementation.\n\n");
    out.push_str("#include <stdint.h>\n");
    out.push_str("#include <stdio.h>\n");
    out.push_str("#include <emu_dpi.h>\n\n");

    out.push_str("// User-provided DPI function implementations\n");
    for func in funcs.iter().filter(|f| !f.builtin) {
        write_prototype(&mut out, func);
    }
    out.push('\n');

    out.push_str("// Wrappers with the uniform callback signature\n");
    for func in funcs {
        write_wrapper(&mut out, func);
    }

    out.push_str("const emu_dpi_func_t emu_dpi_funcs[] = {\n");
    for func in funcs {
        writeln!(
            out,
            "    {{ {}, \"{}\", {}, {}, _emu_wrap_{} }},",
            func.func_id,
            func.name,
            func.args.len(),
            func.ret_width,
            func.name
        )
        .unwrap();
    }
    out.push_str("};\n\n");
    writeln!(out, "const int emu_dpi_n_funcs = {};", funcs.len()).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_func() -> DpiFunction {
        DpiFunction {
            name: "add".to_string(),
            func_id: 0,
            arg_width: 64,
            ret_width: 32,
            ret_type: "int".to_string(),
            args: vec![
                DpiArg {
                    name: "a".to_string(),
                    ty: "int".to_string(),
                    direction: "input".to_string(),
                    width: 32,
                    string_value: None,
                },
                DpiArg {
                    name: "b".to_string(),
                    ty: "int".to_string(),
                    direction: "input".to_string(),
                    width: 32,
                    string_value: None,
                },
            ],
            builtin: false,
            reset: false,
        }
    }

    fn display_func() -> DpiFunction {
        DpiFunction {
            name: "__display_0".to_string(),
            func_id: 1,
            arg_width: 8,
            ret_width: 0,
            ret_type: "void".to_string(),
            args: vec![
                DpiArg {
                    name: "fmt".to_string(),
                    ty: "string".to_string(),
                    direction: "input".to_string(),
                    width: 0,
                    string_value: Some("x=%d\\n".to_string()),
                },
                DpiArg {
                    name: "arg0".to_string(),
                    ty: "bit".to_string(),
                    direction: "input".to_string(),
                    width: 8,
                    string_value: None,
                },
            ],
            builtin: true,
            reset: false,
        }
    }

    fn instr() -> Instrumented {
        Instrumented {
            functions: vec![add_func(), display_func()],
            finish_exit_codes: vec![7],
        }
    }

    #[test]
    fn json_layout() {
        let json = dpi_json(&instr());
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["mailbox_base"], "0x0");
        assert_eq!(v["dpi_base"], "0x100");
        assert_eq!(v["func_block_size"], 64);
        assert_eq!(v["dpi_functions"][0]["id"], 0);
        assert_eq!(v["dpi_functions"][0]["name"], "add");
        assert_eq!(v["dpi_functions"][0]["base_addr"], "0x100");
        assert_eq!(v["dpi_functions"][0]["return"]["type"], "int");
        assert_eq!(v["dpi_functions"][0]["return"]["width"], 32);
        assert_eq!(v["dpi_functions"][0]["args"][1]["name"], "b");
        assert_eq!(v["dpi_functions"][1]["base_addr"], "0x140");
        assert_eq!(v["dpi_functions"][1]["return"], serde_json::Value::Null);
        assert_eq!(v["dpi_functions"][1]["args"][0]["value"], "x=%d\\n");
        assert_eq!(v["finish_exit_codes"][0], 7);
    }

    #[test]
    fn dispatch_wrappers() {
        let c = dispatch_source(&instr());
        assert!(c.contains("extern int32_t add(int32_t a, int32_t b);"));
        assert!(c.contains("static uint64_t _emu_wrap_add(const uint32_t *args) {"));
        assert!(c.contains("return (uint64_t)add((int32_t)args[0], (int32_t)args[1]);"));
        // builtin display reconstructs the printf inline
        assert!(c.contains("printf(\"x=%d\\n\", (uint8_t)args[0]);"));
        assert!(!c.contains("extern void __display_0"));
        assert!(c.contains("{ 0, \"add\", 2, 32, _emu_wrap_add },"));
        assert!(c.contains("{ 1, \"__display_0\", 2, 0, _emu_wrap___display_0 },"));
        assert!(c.contains("const int emu_dpi_n_funcs = 2;"));
    }

    #[test]
    fn wide_arguments_consume_multiple_words() {
        let mut f = add_func();
        f.args[0].width = 48;
        f.args[0].ty = "bit".to_string();
        let c = dispatch_source(&Instrumented {
            functions: vec![f],
            finish_exit_codes: Vec::new(),
        });
        // 48-bit arg occupies words 0..2, the next argument starts at 2.
        assert!(c.contains("(uint64_t)args[0]"));
        assert!(c.contains("(int32_t)args[2]"));
    }
}
