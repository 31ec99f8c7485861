//! Deployment module

pub mod build;
pub mod executor;
pub mod fsm;
pub mod hooks;
pub mod releases;
pub mod restart;
