#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;

mod args;

use self::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    Args::parse().run().await
}
