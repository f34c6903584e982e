// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic emulation host.
//!
//! Connects to a running emulator, restores the initial scan image
//! (reset values plus reset-time DPI results), preloads shadow
//! memories, releases reset and services DPI calls until the run
//! completes. Designs whose DPI functions are all generated displays
//! need nothing else; anything custom links `emu-host` as a library
//! instead.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};

use emu_host::{
    DpiExit, DpiMetadata, DpiTable, Emulator, MemMap, MmapTransport, ScanImage, ScanMap,
    SocketTransport, Transport,
};

#[derive(Debug, Parser)]
#[clap(about = "generic host for emulated designs")]
struct Args {
    /// Work directory produced by the pipeline (dpi.json, scan.map,
    /// mem.map).
    #[clap(long, default_value = "work")]
    work: PathBuf,

    /// PCIe target (BDF or device path) instead of a socket.
    #[clap(long, conflicts_with = "socket")]
    pcie: Option<String>,

    /// Unix domain socket of the simulation.
    #[clap(default_value = "/tmp/emu_sim.sock")]
    socket: String,

    /// Idle timeout (seconds) after the first serviced call.
    #[clap(long, default_value = "30")]
    idle_timeout: u64,

    /// Verbose output.
    #[clap(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> emu_host::Result<DpiExit> {
    let meta = DpiMetadata::load(&args.work.join("dpi.json"))?;

    let (transport, target): (Box<dyn Transport>, &str) = match &args.pcie {
        Some(target) => (Box::new(MmapTransport::new()), target.as_str()),
        None => (Box::new(SocketTransport::new()), args.socket.as_str()),
    };

    let mut emu = Emulator::new(transport);
    emu.connect(target)?;

    info!(
        "connected: design {:#010x}, version {:#010x}, {} DPI function(s)",
        emu.design_id()?,
        emu.version()?,
        emu.n_dpi_funcs()?
    );
    let hw_funcs = emu.n_dpi_funcs()?;
    if hw_funcs != meta.bridged_count() {
        warn!(
            "design reports {hw_funcs} DPI functions, metadata has {}",
            meta.bridged_count()
        );
    }

    let mut table = DpiTable::new();
    table.register_displays(&meta);
    let mut service = emu_host::DpiService::new(table);

    // Initial scan image: reset values, then reset-time DPI patches,
    // shifted in before the design runs.
    let scan_map_path = args.work.join("scan.map");
    if scan_map_path.exists() {
        let map = ScanMap::read_from(&mut File::open(&scan_map_path)?)?;
        if map.chain_length > 0 {
            let mut image = ScanImage::from_reset_values(&map);
            service.apply_reset_calls(&meta, &map, &mut image);
            emu.scan_begin()?;
            emu.scan_inject(image.words(), image.len_bits())?;
            emu.scan_end()?;
            info!("initial scan image loaded ({} bits)", map.chain_length);
        }
    }

    let mem_map_path = args.work.join("mem.map");
    if mem_map_path.exists() {
        let map = MemMap::read_from(&mut File::open(&mem_map_path)?)?;
        let words = emu.mem_preload(&map)?;
        info!("preloaded {words} shadow memory word(s)");
    }

    emu.set_reset(false)?;
    emu.start()?;

    let exit = service.run(&mut emu, Duration::from_secs(args.idle_timeout));

    if exit == DpiExit::Complete {
        if let Some(code) = meta.finish_exit_codes.first() {
            info!("design finished (exit code {code})");
        }
    }
    info!("final cycle count: {}", emu.cycle_count()?);
    info!(
        "serviced {} call(s), {} error(s)",
        service.call_count(),
        service.error_count()
    );

    emu.disconnect();
    Ok(exit)
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    match run(&args) {
        Ok(DpiExit::Complete) => ExitCode::SUCCESS,
        Ok(DpiExit::EmuError) => ExitCode::from(2),
        Ok(DpiExit::Error) => ExitCode::from(1),
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(1)
        }
    }
}
