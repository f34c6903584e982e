// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical bit representatives.
//!
//! Structural comparisons (e.g. matching a mux case input against a DPI
//! result signal) must see through direct connections. A [`SigMap`] maps
//! every bit to a canonical representative after applying all of the
//! module's connections, driven bit → driver bit.

use std::collections::HashMap;

use crate::module::Module;
use crate::sigspec::{Bit, SigSpec};

pub struct SigMap {
    parent: HashMap<Bit, Bit>,
}

impl SigMap {
    pub fn new(module: &Module) -> Self {
        let mut parent = HashMap::new();
        for conn in &module.connections {
            for (l, r) in conn.lhs.iter().zip(conn.rhs.iter()) {
                // Driven bits resolve to their driver; constants stay.
                if !l.is_const() && l != r {
                    parent.insert(*l, *r);
                }
            }
        }
        SigMap { parent }
    }

    /// Canonical representative of a single bit.
    pub fn map_bit(&self, bit: Bit) -> Bit {
        let mut cur = bit;
        // Bounded walk; alias chains are short and a cycle (a=b, b=a)
        // must not hang us.
        for _ in 0..self.parent.len() + 1 {
            match self.parent.get(&cur) {
                Some(next) => cur = *next,
                None => break,
            }
        }
        cur
    }

    pub fn map(&self, sig: &SigSpec) -> SigSpec {
        sig.iter().map(|b| self.map_bit(*b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;

    #[test]
    fn follows_alias_chains() {
        let mut m = Module::new("t");
        let a = m.add_wire("a", 1);
        let b = m.add_wire("b", 1);
        let c = m.add_wire("c", 1);
        m.connect(m.sig(b), m.sig(a));
        m.connect(m.sig(c), m.sig(b));
        let map = SigMap::new(&m);
        assert_eq!(map.map(&m.sig(c)), m.sig(a));
        assert_eq!(map.map(&m.sig(a)), m.sig(a));
    }

    #[test]
    fn tolerates_cycles() {
        let mut m = Module::new("t");
        let a = m.add_wire("a", 1);
        let b = m.add_wire("b", 1);
        m.connect(m.sig(a), m.sig(b));
        m.connect(m.sig(b), m.sig(a));
        let map = SigMap::new(&m);
        // A degenerate a=b, b=a pair must terminate; the representative
        // stays within the equivalence class.
        let ra = map.map_bit(m.sig(a)[0]);
        assert!(ra == m.sig(a)[0] || ra == m.sig(b)[0]);
    }
}
