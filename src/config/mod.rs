pub mod defs;
pub mod references;
pub mod settings;
