#![cfg_attr(not(test), no_std)]

pub mod descriptor;
pub mod err;
pub mod host;
pub mod transfer;

pub use host::Speed;
