use std::path::PathBuf;

use alloy_core::primitives::Bytes;
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum AddressFormat {
    Table,
    Env,
}

#[derive(Parser)]
#[command(name = "bridgehead")]
#[command(
    author,
    version,
    about = "Deploy and upgrade the Bridgehead protocol contracts at deterministic addresses"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "BRIDGEHEAD_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a Bridgehead.toml settings file, or the directory holding it.
    /// Defaults to `./Bridgehead.toml` when that file exists.
    ///
    /// Settings not found in the file are read from `BRIDGEHEAD_`-prefixed
    /// environment variables.
    #[arg(long, alias = "conf", env = "BRIDGEHEAD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy every contract not yet recorded. Safe to rerun after a failure.
    Deploy,
    /// Print the deployment groups without touching the chain.
    Plan,
    /// Diff the diamond's facets against the recorded ones and apply the cut.
    Upgrade(UpgradeArgs),
    /// Print the recorded addresses.
    Addresses(AddressesArgs),
}

#[derive(Debug, Clone, Args)]
pub struct UpgradeArgs {
    /// Deploy `DiamondUpgradeInit<N>` and run it as the cut's initializer.
    #[arg(long)]
    pub init_version: Option<u32>,

    /// Hex calldata for the initializer.
    #[arg(long, requires = "init_version", default_value_t = Bytes::new())]
    pub init_calldata: Bytes,

    /// Compute and print the cut without sending it.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct AddressesArgs {
    /// Output format.
    #[arg(long, default_value_t = AddressFormat::Table)]
    pub format: AddressFormat,

    /// Also write the env lines to this file.
    #[arg(long)]
    pub out: Option<PathBuf>,
}
