// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end pipeline tests: a seeded design through every pass, plus
//! the artefact files read back with the host-side readers.

use std::path::PathBuf;

use netir::memory::Memory;
use netir::{AttrValue, CellType, Const, Design, Module, SigSpec};

use emuc::{run_pipeline, write_artifacts, PipelineOptions};

/// An 8-bit counter with an async reset value of 0x42: q <= q + 1.
fn counter_module() -> Module {
    let mut m = Module::new("counter");
    let clk = m.add_wire("clk_i", 1);
    m.wire_mut(clk).port_input = true;
    let rst = m.add_wire("rst_ni", 1);
    m.wire_mut(rst).port_input = true;
    let d = m.add_wire("d", 8);
    let q = m.add_wire("q", 8);
    m.wire_mut(q).port_output = true;

    // q - 0xff ≡ q + 1 (mod 256)
    let (q_s, d_s) = (m.sig(q), m.sig(d));
    m.add_sub(q_s, SigSpec::from_const(&Const::from_u64(0xff, 8)), d_s);

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
    m.fixup_ports();
    m
}

#[test]
fn counter_scenario() {
    let mut design = Design::new();
    design.add_module(counter_module());

    let out = run_pipeline(&mut design, &PipelineOptions::new("counter")).unwrap();

    // Chain length matches the FF bit count; the reset value rides in
    // the scan map.
    assert_eq!(out.scan_map.chain_length, 8);
    assert_eq!(out.scan_map.variables.len(), 1);
    assert_eq!(
        out.scan_map.variables[0].reset_value.as_deref(),
        Some(&[0x42u32][..])
    );

    // The initial scan image: little-endian word 0 is 0x00000042.
    let image = emu_host::ScanImage::from_reset_values(&out.scan_map);
    assert_eq!(image.words(), &[0x0000_0042]);

    // Reset removal: the reset is no longer an input port and no
    // async-reset cell remains.
    let dut = design.module("counter").unwrap();
    let rst = dut.find_wire("rst_ni").unwrap();
    assert!(!dut.wire(rst).port_input);
    assert!(dut.cells().all(|(_, c)| c.ty != CellType::Adff));

    // Freeze plumbing and wrapper present.
    assert!(dut.find_wire("emu_en").is_some());
    assert!(dut.find_wire("emu_scan_enable").is_some());
    assert_eq!(out.wrapper, "emu_top_counter");
    assert!(design.module("emu_top_counter").is_some());

    // Single-driver and the other structural invariants hold
    // post-pipeline.
    dut.check().unwrap();
}

#[test]
fn counter_scenario_with_equiv_check() {
    let mut design = Design::new();
    design.add_module(counter_module());
    let mut opts = PipelineOptions::new("counter");
    opts.check_equiv = true;
    run_pipeline(&mut design, &opts).unwrap();
}

fn full_module() -> Module {
    let mut m = counter_module();

    // A memory with static init.
    let mut mem = Memory::new("scratch", 8, 16);
    let mut init = Const::default();
    for i in 0..16 * 8 {
        init.push(if i < 8 && 0xcdu64 >> i & 1 != 0 {
            netir::State::S1
        } else {
            netir::State::S0
        });
    }
    mem.init = init;
    m.add_memory(mem);

    // print("q=%d\n", q) under tick.
    let tick = m.add_wire("tick", 1);
    m.wire_mut(tick).port_input = true;
    let q = m.find_wire("q").unwrap();
    let parts = serde_json::json!([
        { "kind": "literal", "text": "q=" },
        { "kind": "integer", "base": 10, "signed": false, "width": 8 },
        { "kind": "literal", "text": "\n" },
    ]);
    let print = m.add_cell("print0", CellType::Print);
    let (q_s, tick_s) = (m.sig(q), m.sig(tick));
    {
        let cell = m.cell_mut(print);
        cell.set_param("FORMAT", AttrValue::Str(parts.to_string()));
        cell.set_port("ARGS", q_s);
        cell.set_port("EN", tick_s);
    }

    // $finish(7) on done.
    let done = m.add_wire("done", 1);
    m.wire_mut(done).port_input = true;
    let fin = m.add_cell("finish0", CellType::Finish);
    let done_s = m.sig(done);
    {
        let cell = m.cell_mut(fin);
        cell.set_param("EXIT_CODE", 7i64);
        cell.set_port("EN", done_s);
    }

    m.fixup_ports();
    m
}

fn temp_work(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("emuc-test-{}-{tag}", std::process::id()))
}

#[test]
fn artefacts_round_trip_through_the_host_readers() {
    let mut design = Design::new();
    design.add_module(full_module());

    let mut opts = PipelineOptions::new("counter");
    opts.mem_shadow = true;
    let out = run_pipeline(&mut design, &opts).unwrap();

    let work = temp_work("artefacts");
    let _ = std::fs::remove_dir_all(&work);
    write_artifacts(&work, &design, &out).unwrap();

    // The transformed netlist re-parses and contains the DUT, the
    // shadow controller and the wrapper.
    let text = std::fs::read_to_string(work.join("transformed.json")).unwrap();
    let reread = netir::json::from_str(&text).unwrap();
    for module in ["counter", "emu_mem_ctrl", "emu_top_counter"] {
        assert!(reread.module(module).is_some(), "missing {module}");
    }
    reread.module("counter").unwrap().check().unwrap();

    // DPI metadata loads with the host reader; ids and addresses agree
    // with the dispatch table.
    let meta = emu_host::DpiMetadata::load(&work.join("dpi.json")).unwrap();
    assert_eq!(meta.dpi_functions.len(), 1);
    assert_eq!(meta.dpi_functions[0].name, "__display_0");
    assert_eq!(meta.dpi_functions[0].base_addr, "0x100");
    assert_eq!(meta.finish_exit_codes, vec![7]);

    let dispatch = std::fs::read_to_string(work.join("dispatch.c")).unwrap();
    assert!(dispatch.contains("{ 0, \"__display_0\", 2, 0, _emu_wrap___display_0 },"));
    assert!(dispatch.contains("printf(\"q=%d\\n\", (uint8_t)args[0]);"));

    // Scan and memory maps round-trip byte-exactly.
    let mut f = std::fs::File::open(work.join("scan.map")).unwrap();
    let scan_map = emu_host::ScanMap::read_from(&mut f).unwrap();
    assert_eq!(scan_map, out.scan_map);

    let mut f = std::fs::File::open(work.join("mem.map")).unwrap();
    let mem_map = emu_host::MemMap::read_from(&mut f).unwrap();
    assert_eq!(Some(mem_map.clone()), out.mem_map);
    assert_eq!(mem_map.memories[0].initial.as_ref().unwrap()[0], 0xcd);

    let _ = std::fs::remove_dir_all(&work);
}
