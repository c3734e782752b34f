//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Load a queue snapshot and execute it on the simulated beamline
//! - `show`: Load a queue snapshot and print its projection
//! - `show-config`: Show configuration discovery information
//! - `init-config`: Write a configuration file holding the defaults

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    Show(ShowSnapshotConfig),
    ShowConfig,
    InitConfig(InitConfigOptions),
}

#[derive(Debug)]
pub struct RunConfig {
    pub snapshot: PathBuf,
    pub config_override: Option<PathBuf>,
    /// Start from this sample instead of the whole queue
    pub sample: Option<String>,
    pub auto_mount: bool,
    pub image_delay_ms: Option<u64>,
    pub verbose: bool,
}

#[derive(Debug)]
pub struct ShowSnapshotConfig {
    pub snapshot: PathBuf,
    pub config_override: Option<PathBuf>,
}

#[derive(Debug)]
pub struct InitConfigOptions {
    /// Target file, the user configuration when absent
    pub output: Option<PathBuf>,
    pub force: bool,
}

#[derive(Debug, Parser)]
#[command(name = "mxqueue")]
#[command(author = "mxqueue developers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Experiment queue scheduler for crystallography beamlines")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a queue snapshot on the simulated beamline
    Run {
        /// Path to a queue snapshot (.json or .json.gz)
        snapshot: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Sample ID to start from
        #[arg(long = "sample", value_name = "ID")]
        sample: Option<String>,
        /// Mount and run every sample in queue order
        #[arg(long = "auto-mount")]
        auto_mount: bool,
        /// Simulated time per image
        #[arg(long = "image-delay-ms", value_name = "MS")]
        image_delay_ms: Option<u64>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Print the projection of a queue snapshot
    Show {
        /// Path to a queue snapshot (.json or .json.gz)
        snapshot: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Show configuration discovery information
    ShowConfig,
    /// Write a configuration file holding the defaults
    InitConfig {
        /// Where to write it (default: ~/.mxqueue/config.toml)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long = "force")]
        force: bool,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                snapshot,
                config,
                sample,
                auto_mount,
                image_delay_ms,
                verbose,
            }) => {
                Self::check_snapshot_path(snapshot)?;
                Ok(ExecutionMode::Run(RunConfig {
                    snapshot: snapshot.clone(),
                    config_override: config.clone(),
                    sample: sample.clone(),
                    auto_mount: *auto_mount,
                    image_delay_ms: *image_delay_ms,
                    verbose: *verbose,
                }))
            }
            Some(Commands::Show { snapshot, config }) => {
                Self::check_snapshot_path(snapshot)?;
                Ok(ExecutionMode::Show(ShowSnapshotConfig {
                    snapshot: snapshot.clone(),
                    config_override: config.clone(),
                }))
            }
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            Some(Commands::InitConfig { output, force }) => {
                Ok(ExecutionMode::InitConfig(InitConfigOptions {
                    output: output.clone(),
                    force: *force,
                }))
            }
            None => Err(
                "No command specified. Use 'mxqueue --help' to see available commands.".to_string(),
            ),
        }
    }

    /// Snapshots are JSON, optionally gzipped; extension matching is case-insensitive
    fn check_snapshot_path(path: &std::path::Path) -> Result<(), String> {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();

        if name.ends_with(".json") || name.ends_with(".json.gz") {
            Ok(())
        } else {
            Err(format!(
                "Unsupported snapshot file {:?}: expected .json or .json.gz",
                path
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(snapshot: &str) -> Args {
        Args {
            command: Some(Commands::Run {
                snapshot: PathBuf::from(snapshot),
                config: None,
                sample: Some("1:01".to_string()),
                auto_mount: true,
                image_delay_ms: Some(2),
                verbose: true,
            }),
        }
    }

    #[test]
    fn test_run_command() {
        let mode = run_args("queue.json").mode().unwrap();

        if let ExecutionMode::Run(config) = mode {
            assert_eq!(config.snapshot, PathBuf::from("queue.json"));
            assert_eq!(config.sample.as_deref(), Some("1:01"));
            assert!(config.auto_mount);
            assert_eq!(config.image_delay_ms, Some(2));
            assert!(config.verbose);
        } else {
            panic!("Expected Run mode");
        }
    }

    #[test]
    fn test_snapshot_extensions() {
        assert!(run_args("queue.json").mode().is_ok());
        assert!(run_args("/data/mxcube.queue:7.json.gz").mode().is_ok());
        assert!(run_args("QUEUE.JSON").mode().is_ok());
        assert!(run_args("queue.toml").mode().is_err());
        assert!(run_args("queue").mode().is_err());
    }

    #[test]
    fn test_show_and_show_config_commands() {
        let args = Args {
            command: Some(Commands::Show {
                snapshot: PathBuf::from("queue.json"),
                config: Some(PathBuf::from("mxqueue.toml")),
            }),
        };
        assert!(matches!(args.mode().unwrap(), ExecutionMode::Show(_)));

        let args = Args {
            command: Some(Commands::ShowConfig),
        };
        assert!(matches!(args.mode().unwrap(), ExecutionMode::ShowConfig));
    }

    #[test]
    fn test_parse_from_command_line() {
        let args = <Args as Parser>::try_parse_from([
            "mxqueue",
            "run",
            "queue.json",
            "--sample",
            "2:05",
            "--image-delay-ms",
            "0",
        ])
        .unwrap();

        if let ExecutionMode::Run(config) = args.mode().unwrap() {
            assert_eq!(config.sample.as_deref(), Some("2:05"));
            assert_eq!(config.image_delay_ms, Some(0));
            assert!(!config.auto_mount);
        } else {
            panic!("Expected Run mode");
        }
    }

    #[test]
    fn test_init_config_command() {
        let args =
            <Args as Parser>::try_parse_from(["mxqueue", "init-config", "-o", "mxqueue.toml"])
                .unwrap();

        if let ExecutionMode::InitConfig(options) = args.mode().unwrap() {
            assert_eq!(options.output, Some(PathBuf::from("mxqueue.toml")));
            assert!(!options.force);
        } else {
            panic!("Expected InitConfig mode");
        }

        let args = <Args as Parser>::try_parse_from(["mxqueue", "init-config", "--force"]).unwrap();
        assert!(matches!(
            args.mode().unwrap(),
            ExecutionMode::InitConfig(InitConfigOptions { output: None, force: true })
        ));
    }

    #[test]
    fn test_no_command_error() {
        let args = Args { command: None };
        assert!(args.mode().is_err());
    }
}
