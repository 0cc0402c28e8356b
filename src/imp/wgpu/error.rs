// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use std::fmt::Display;

/// Failure opening a wgpu device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    NoSuchAdapter,
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NoSuchAdapter => write!(f, "No such adapter"),
            Error::RequestDeviceError(e) => write!(f, "{}", e),
        }
    }
}
