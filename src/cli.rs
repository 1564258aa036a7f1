use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "spikewatch")]
#[command(author = "Spikewatch Team")]
#[command(version = "0.1.0")]
#[command(about = "On-chain token price spike alerts over chat", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml plus the SPIKEWATCH_ENV overlay)
    #[arg(short, long, default_value = "config", env = "SPIKEWATCH_CONFIG_DIR")]
    pub config: String,

    /// Record outgoing messages in memory instead of sending them
    #[arg(short, long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the alert service (default)
    Run,
    /// Apply database migrations and exit
    Migrate,
    /// Trim every watch list to its tier limit and exit
    EnforceLimits,
    /// Run one tier expiry pass and exit
    CheckExpiry,
    /// Capture monitoring users for restart recovery and exit
    MarkRestart,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::parse_from(["spikewatch"]);
        assert_eq!(cli.command(), Commands::Run);
        assert_eq!(cli.config, "config");
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::parse_from(["spikewatch", "--config", "/etc/spikewatch", "enforce-limits"]);
        assert_eq!(cli.command(), Commands::EnforceLimits);
        assert_eq!(cli.config, "/etc/spikewatch");

        let cli = Cli::parse_from(["spikewatch", "--dry-run", "check-expiry"]);
        assert_eq!(cli.command(), Commands::CheckExpiry);
        assert!(cli.dry_run);

        assert!(Cli::try_parse_from(["spikewatch", "trade"]).is_err());
    }
}
