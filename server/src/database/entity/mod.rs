//! Database entities.

pub mod nar_info;
pub mod reference;
pub mod signature;
