use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "taskmaster",
    version,
    about = "Supervisor daemon for long-running program fleets"
)]
pub struct Cli {
    /// Path to the program catalog
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run without the interactive shell
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Positional alternative to --config
    #[arg(value_name = "PATH")]
    pub path: Option<PathBuf>,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .or_else(|| self.path.clone())
            .unwrap_or_else(|| PathBuf::from("taskmaster.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_taskmaster_yaml() {
        let cli = Cli::try_parse_from(["taskmaster"]).expect("parses");
        assert_eq!(cli.config_path(), PathBuf::from("taskmaster.yaml"));
        assert!(!cli.daemon);
    }

    #[test]
    fn config_flag_wins_over_positional_path() {
        let cli = Cli::try_parse_from(["taskmaster", "-c", "a.yaml", "b.yaml"]).expect("parses");
        assert_eq!(cli.config_path(), PathBuf::from("a.yaml"));
    }

    #[test]
    fn positional_path_is_accepted() {
        let cli = Cli::try_parse_from(["taskmaster", "-d", "b.yaml"]).expect("parses");
        assert_eq!(cli.config_path(), PathBuf::from("b.yaml"));
        assert!(cli.daemon);
    }
}
