//! lerelais binary entry point

use clap::Parser;
use lepasserelle::{block_on_with_grace, Cli, SHUTDOWN_GRACE};

fn main() -> anyhow::Result<()> {
    block_on_with_grace(Cli::parse().run(), SHUTDOWN_GRACE)?
}
