pub mod command;
pub mod fastqc;
pub mod fastx;
pub mod file;
pub mod gtf;
pub mod stats;
pub mod streams;
pub mod system;
