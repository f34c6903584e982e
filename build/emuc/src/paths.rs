// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Install-root resolution.
//!
//! A single environment variable, `EMUC_HOME`, designates the install
//! root; the simulator testbench and host include directory are derived
//! from it. When unset, the root falls back to the executable's parent
//! directory, with a build-tree heuristic so running straight out of a
//! checkout works too.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Result};

pub const HOME_VAR: &str = "EMUC_HOME";

#[derive(Clone, Debug)]
pub struct InstallPaths {
    pub root: PathBuf,
    /// Generic simulator testbench top.
    pub sim_top: PathBuf,
    /// Headers for compiling the generated dispatch source.
    pub include_dir: PathBuf,
    pub is_build_tree: bool,
}

impl InstallPaths {
    pub fn resolve() -> Result<Self> {
        let root = match env::var_os(HOME_VAR) {
            Some(home) => {
                let root = PathBuf::from(home);
                if !root.is_dir() {
                    bail!("{HOME_VAR} points to non-existent directory {}", root.display());
                }
                root
            }
            None => {
                // bin/emuc → install root is one level up; a build tree
                // is detected below.
                let exe = env::current_exe()?;
                exe.parent()
                    .and_then(|p| p.parent())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."))
            }
        };

        // Build tree: the workspace manifest sits at the root.
        let is_build_tree = root.join("Cargo.toml").is_file();

        let (sim_top, include_dir) = if is_build_tree {
            (
                root.join("sim").join("emu_sim_top.sv"),
                root.join("host").join("include"),
            )
        } else {
            (
                root.join("share").join("emuc").join("emu_sim_top.sv"),
                root.join("include").join("emuc"),
            )
        };

        Ok(InstallPaths {
            root,
            sim_top,
            include_dir,
            is_build_tree,
        })
    }
}
