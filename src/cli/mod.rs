pub mod args;

use clap::Parser;
pub use args::{Arguments, Layout};

pub fn parse() -> Arguments {
    Arguments::parse()
}
