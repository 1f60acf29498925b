use clap::{Args, Parser, Subcommand};
use sitescan_discovery::DiscoveryMode;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "sitescan", version, about = "Discover and incrementally rescan a content repository")]
pub struct Cli {
    /// Config file (TOML, YAML or JSON); defaults to the platform config directory
    #[arg(short, long, global = true, env = "SITESCAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Never write to the repository
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a discovery, resuming an interrupted one when possible
    Discover(DiscoverArgs),
    /// Check the persisted site structure against the inventories
    Validate,
    /// Print the persisted checkpoint and progress of this repository
    Status,
    /// Forget local progress so the next run starts over
    Reset,
}

#[derive(Debug, Args)]
pub struct DiscoverArgs {
    /// Ignore previous inventories and rediscover everything
    #[arg(long, conflicts_with = "incremental")]
    pub full: bool,

    /// Merge against previous inventories even if the last run did not finish
    #[arg(long)]
    pub incremental: bool,

    /// Override the configured number of concurrent folder scans
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Print one JSON object per event instead of progress lines
    #[arg(long)]
    pub json: bool,
}
impl DiscoverArgs {
    pub fn mode(&self) -> DiscoveryMode {
        match (self.full, self.incremental) {
            (true, _) => DiscoveryMode::Full,
            (_, true) => DiscoveryMode::Incremental,
            _ => DiscoveryMode::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case::auto(&["sitescan", "discover"], DiscoveryMode::Auto)]
    #[case::full(&["sitescan", "discover", "--full"], DiscoveryMode::Full)]
    #[case::incremental(&["sitescan", "discover", "--incremental"], DiscoveryMode::Incremental)]
    fn test_discover_mode(#[case] argv: &[&str], #[case] expected: DiscoveryMode) {
        let cli = Cli::try_parse_from(argv).unwrap();
        let Command::Discover(args) = cli.command else {
            panic!("expected discover");
        };
        assert_eq!(args.mode(), expected);
    }

    #[test]
    fn test_full_and_incremental_conflict() {
        assert!(Cli::try_parse_from(["sitescan", "discover", "--full", "--incremental"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sitescan", "status", "--config", "site.toml", "-vv", "--dry-run"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("site.toml")));
        assert_eq!(cli.verbose, 2);
        assert!(cli.dry_run);
        assert!(matches!(cli.command, Command::Status));
    }
}
