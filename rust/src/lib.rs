//! Isochronous channel manager and Wi-Fi flow control implemented in Rust

pub mod error;
mod ffi;
#[cfg(test)]
mod future;
pub mod iso;
pub mod timer;
pub mod wifi;

#[cfg(test)]
mod test;

pub use ffi::*;
