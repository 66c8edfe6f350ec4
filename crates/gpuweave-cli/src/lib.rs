//! Pieces of the `gpuweave` binary that are reused by its tests.

pub mod shader;
pub mod smoke;
