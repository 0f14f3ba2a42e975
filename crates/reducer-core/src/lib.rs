#![doc = include_str!("../README.md")]

pub mod codec;
mod common;
pub use common::*;
// Public re-export so downstream crates can reach the default codec's
// decoder without a direct dependency on `image`.
pub use image;
