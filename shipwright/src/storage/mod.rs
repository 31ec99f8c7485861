//! Deploy root storage

pub mod history;
pub mod layout;
