// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use emuc::paths::InstallPaths;
use emuc::{run_pipeline, write_artifacts, PipelineOptions};

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "netlist → emulation pipeline driver")]
struct Args {
    /// Top module name.
    #[clap(long)]
    top: String,

    /// Work/output directory.
    #[clap(long, default_value = "work")]
    work: PathBuf,

    /// Clock signal name.
    #[clap(long, default_value = "clk_i")]
    clk: String,

    /// Reset signal name (active-low), extracted and tied off.
    #[clap(long, default_value = "rst_ni")]
    rst: String,

    /// Leave the reset port alone.
    #[clap(long)]
    keep_rst: bool,

    /// Add shadow access ports to embedded memories.
    #[clap(long)]
    mem_shadow: bool,

    /// Verify scan insertion by bounded co-simulation.
    #[clap(long)]
    check_equiv: bool,

    /// Wrapper module name (default: emu_top_<top>).
    #[clap(long)]
    wrapper: Option<String>,

    /// Verbose output.
    #[clap(short, long)]
    verbose: bool,

    /// Input netlist (JSON).
    input: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    let paths = InstallPaths::resolve()?;
    log::debug!(
        "install root {} ({})",
        paths.root.display(),
        if paths.is_build_tree { "build tree" } else { "install tree" }
    );

    let input = File::open(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?;
    let mut design = netir::json::from_reader(input)
        .with_context(|| format!("parsing {}", args.input.display()))?;

    let opts = PipelineOptions {
        top: args.top.clone(),
        clk: args.clk.clone(),
        rst: (!args.keep_rst).then(|| args.rst.clone()),
        mem_shadow: args.mem_shadow,
        check_equiv: args.check_equiv,
        wrapper_name: args.wrapper.clone(),
    };

    let out = run_pipeline(&mut design, &opts)?;
    write_artifacts(&args.work, &design, &out)?;

    info!(
        "done: wrapper '{}', {} scan bit(s), {} DPI function(s)",
        out.wrapper,
        out.scan_map.chain_length,
        out.instrumented.functions.len()
    );
    Ok(())
}
