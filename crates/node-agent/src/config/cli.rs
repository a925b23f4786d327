use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node agent daemon
    Daemon(Box<DaemonArgs>),
    /// Probe local GPUs and print the resulting pool
    #[command(name = "show-gpus")]
    ShowGpus,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn show_gpus_takes_no_arguments() {
        let cli = Cli::try_parse_from(["node-agent", "show-gpus"]).unwrap();
        assert!(matches!(cli.command, Commands::ShowGpus));
    }
}
