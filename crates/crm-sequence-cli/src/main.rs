use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = crm_sequence_cli::Cli::parse();
    crm_sequence_cli::run_cli(cli)
}
