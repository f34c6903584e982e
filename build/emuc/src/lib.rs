// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pipeline driver: runs the rewrite passes in order over a loaded
//! design and writes the artefact set downstream tools and the host
//! runtime consume.
//!
//! Pass order matters and is fixed: reset extraction must run before
//! scan insertion (reset values become scan metadata), instrumentation
//! must see the scan enable to build the freeze override, the shadow
//! pass adds ports the wrapper mirrors, and the wrapper comes last.

use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use emu_proto::memmap::MemMap;
use emu_proto::scanmap::ScanMap;
use netir::Design;
use pass_instrument::Instrumented;

pub mod paths;

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub top: String,
    pub clk: String,
    /// Reset port to extract and tie off; `None` keeps it.
    pub rst: Option<String>,
    pub mem_shadow: bool,
    pub check_equiv: bool,
    pub wrapper_name: Option<String>,
}

impl PipelineOptions {
    pub fn new(top: impl Into<String>) -> Self {
        PipelineOptions {
            top: top.into(),
            clk: "clk_i".to_string(),
            rst: Some("rst_ni".to_string()),
            mem_shadow: false,
            check_equiv: false,
            wrapper_name: None,
        }
    }
}

pub struct PipelineOutput {
    pub scan_map: ScanMap,
    pub instrumented: Instrumented,
    pub mem_map: Option<MemMap>,
    pub wrapper: String,
}

pub fn run_pipeline(design: &mut Design, opts: &PipelineOptions) -> Result<PipelineOutput> {
    let module = design
        .module_mut(&opts.top)
        .with_context(|| format!("no module named {}", opts.top))?;

    pass_reset_extract::run(
        module,
        &pass_reset_extract::Options {
            rst_name: opts.rst.clone(),
        },
    )
    .context("reset extraction")?;

    let scan_map = pass_scan_insert::run(
        module,
        &pass_scan_insert::Options {
            check_equiv: opts.check_equiv,
            ..pass_scan_insert::Options::default()
        },
    )
    .context("scan insertion")?;

    let instrumented = pass_instrument::run(module, &pass_instrument::Options::default())
        .context("instrumentation")?;

    let mem_map = if opts.mem_shadow {
        pass_mem_shadow::run(
            design,
            &opts.top,
            &pass_mem_shadow::Options {
                clk_name: opts.clk.clone(),
                ..pass_mem_shadow::Options::default()
            },
        )
        .context("memory shadow")?
    } else {
        None
    };

    let wrapper = pass_emu_top::run(
        design,
        &opts.top,
        &pass_emu_top::Options {
            wrapper_name: opts.wrapper_name.clone(),
            clk_name: opts.clk.clone(),
            rst_name: opts.rst.clone().unwrap_or_else(|| "rst_ni".to_string()),
        },
    )
    .context("wrapper generation")?;

    Ok(PipelineOutput {
        scan_map,
        instrumented,
        mem_map,
        wrapper,
    })
}

/// Write the artefact set into the work directory.
pub fn write_artifacts(work: &Path, design: &Design, out: &PipelineOutput) -> Result<()> {
    fs::create_dir_all(work)
        .with_context(|| format!("creating work directory {}", work.display()))?;

    let transformed = work.join("transformed.json");
    netir::json::to_writer(design, File::create(&transformed)?)
        .with_context(|| format!("writing {}", transformed.display()))?;

    let dpi_json = work.join("dpi.json");
    fs::write(&dpi_json, pass_instrument::codegen::dpi_json(&out.instrumented))
        .with_context(|| format!("writing {}", dpi_json.display()))?;

    let dispatch = work.join("dispatch.c");
    fs::write(
        &dispatch,
        pass_instrument::codegen::dispatch_source(&out.instrumented),
    )
    .with_context(|| format!("writing {}", dispatch.display()))?;

    let scan_map = work.join("scan.map");
    out.scan_map
        .write_to(&mut File::create(&scan_map)?)
        .with_context(|| format!("writing {}", scan_map.display()))?;

    if let Some(mem_map) = &out.mem_map {
        let path = work.join("mem.map");
        mem_map
            .write_to(&mut File::create(&path)?)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    info!(
        "artefacts in {}: transformed.json, dpi.json, dispatch.c, scan.map{}",
        work.display(),
        if out.mem_map.is_some() { ", mem.map" } else { "" }
    );
    Ok(())
}
