//! Data model of a deployment

pub mod release;
pub mod spec;
