//! Shipwright Library
//!
//! Release-oriented deployment of source-controlled applications: SCM
//! resolution, release directories behind an atomically switched `current`
//! link, an ordered hook pipeline, and restart of the served process.

pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod process;
pub mod scm;
pub mod storage;
pub mod utils;
