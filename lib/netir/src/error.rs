// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

/// Errors raised by IR validation and the rewrite passes.
#[derive(Clone, Debug, PartialEq)]
pub enum IrError {
    /// An input violated an IR invariant.
    InvalidIr(String),
    /// A construct the pipeline cannot lower (e.g. a non-constant async
    /// load that is not a DPI call).
    UnsupportedConstruct(String),
    /// An expected attribute was absent on a cell or wire.
    MissingAttribute { entity: String, attribute: String },
    InvalidArgument(String),
}

impl fmt::Display for IrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrError::InvalidIr(msg) => write!(f, "invalid IR: {msg}"),
            IrError::UnsupportedConstruct(msg) => {
                write!(f, "unsupported construct: {msg}")
            }
            IrError::MissingAttribute { entity, attribute } => {
                write!(f, "{entity}: missing attribute {attribute}")
            }
            IrError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for IrError {}
