//! Command implementations: compare, migrate, save, info.

pub mod compare;
pub mod info;
pub mod migrate;
pub mod save;
