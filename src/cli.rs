use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use flexi_logger::{detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::config::{Config, CONFIG};
use crate::db::migration::{BroadcastSink, ConsoleSink, UpgradeMessage};
use crate::db::schema::{CURRENT_DB_VERSION, MIN_SUPPORTED_DB_VERSION};
use crate::db::{Database, DB_FILENAME};
use crate::error::HoardError;

#[derive(Parser)]
#[command(
    name = "hoard",
    version,
    about = "hoard: local portfolio database with crash-safe schema upgrades"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Open the database and apply pending schema upgrades (default)
    Upgrade {
        /// Database directory (default: from config)
        #[arg(long = "data-dir", short = 'd')]
        data_dir: Option<PathBuf>,

        /// Stream progress as JSON lines instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the schema version, any interrupted upgrade, and archived backups
    Status {
        /// Database directory (default: from config)
        #[arg(long = "data-dir", short = 'd')]
        data_dir: Option<PathBuf>,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), HoardError> {
        let args = Cli::parse();

        let project_dirs = Config::project_dirs()?;
        let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));

        let command = args.command.unwrap_or(Command::Upgrade {
            data_dir: None,
            json: false,
        });
        let data_dir = Self::resolve_data_dir(&command)?;
        let _logger = Self::setup_logging(config, &data_dir)?;

        match command {
            Command::Upgrade { json, .. } => Self::upgrade(&data_dir, json),
            Command::Status { .. } => Self::status(&data_dir),
        }
    }

    fn setup_logging(config: &Config, data_dir: &Path) -> Result<LoggerHandle, HoardError> {
        Logger::try_with_str(config.logging.log_spec())
            .map_err(|e| HoardError::Config(format!("Invalid log spec: {}", e)))?
            .log_to_file(FileSpec::default().directory(Self::log_dir(data_dir)).basename("hoard"))
            .rotate(
                Criterion::Size(10 * 1024 * 1024),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(5),
            )
            .duplicate_to_stderr(Duplicate::Warn)
            .format_for_files(detailed_format)
            .start()
            .map_err(|e| HoardError::Config(format!("Failed to start logger: {}", e)))
    }

    fn log_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("logs")
    }

    /// The `--data-dir` flag if given, otherwise the configured directory.
    fn resolve_data_dir(command: &Command) -> Result<PathBuf, HoardError> {
        match command {
            Command::Upgrade { data_dir, .. } | Command::Status { data_dir } => {
                Self::data_dir(data_dir.clone())
            }
        }
    }

    fn data_dir(arg: Option<PathBuf>) -> Result<PathBuf, HoardError> {
        match arg {
            Some(dir) => Ok(dir),
            None => Ok(Config::get()?.database.data_dir.clone()),
        }
    }

    fn upgrade(data_dir: &Path, json: bool) -> Result<(), HoardError> {
        let db_path = data_dir.join(DB_FILENAME);
        let existed = db_path.exists();

        let db = if json {
            Self::connect_streaming_json(data_dir)?
        } else {
            Database::connect(data_dir, Arc::new(ConsoleSink))?
        };
        let version = Database::schema_version(db.conn())?.unwrap_or(CURRENT_DB_VERSION);
        info!("Upgrade command finished at schema v{}", version);

        if json {
            return Ok(());
        }
        let mut out = io::stdout().lock();
        if existed {
            writeln!(out, "Database at {} is at schema v{}", db.path().display(), version)?;
        } else {
            writeln!(out, "Created new database at {} (schema v{})", db.path().display(), version)?;
        }
        Ok(())
    }

    /// Runs the upgrade with a broadcast sink and prints every message as a
    /// JSON line from a separate thread while the upgrade is in progress.
    fn connect_streaming_json(data_dir: &Path) -> Result<Database, HoardError> {
        let sink = Arc::new(BroadcastSink::new());
        let (history, mut rx) = sink.subscribe();

        let printer = thread::spawn(move || {
            let mut out = io::stdout().lock();
            for message in &history {
                if Self::write_json(&mut out, message).is_err() {
                    return;
                }
            }
            loop {
                match rx.blocking_recv() {
                    Ok(message) => {
                        if let Err(e) = Self::write_json(&mut out, &message) {
                            warn!("Stopped streaming upgrade progress: {}", e);
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Upgrade progress stream skipped {} messages", skipped)
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });

        let result = Database::connect(data_dir, sink.clone());
        // Last sender gone: the printer drains what is left and exits
        drop(sink);
        if printer.join().is_err() {
            warn!("Upgrade progress printer panicked");
        }
        result
    }

    fn write_json<W: Write>(out: &mut W, message: &UpgradeMessage) -> Result<(), HoardError> {
        let line = serde_json::to_string(message)
            .map_err(|e| HoardError::Error(format!("Failed to encode progress: {}", e)))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }

    fn status(data_dir: &Path) -> Result<(), HoardError> {
        let mut out = io::stdout().lock();
        let db_path = data_dir.join(DB_FILENAME);
        writeln!(out, "Database:          {}", db_path.display())?;
        writeln!(
            out,
            "Supported schemas: v{} - v{}",
            MIN_SUPPORTED_DB_VERSION, CURRENT_DB_VERSION
        )?;

        if !db_path.exists() {
            writeln!(out, "Schema version:    (no database yet)")?;
            return Ok(());
        }

        let db = Database::open(&db_path)?;
        match Database::schema_version(db.conn())? {
            Some(version) => writeln!(out, "Schema version:    v{}", version)?,
            None => writeln!(out, "Schema version:    (not recorded)")?,
        }
        if let Some(from) = Database::ongoing_upgrade(db.conn())? {
            writeln!(
                out,
                "WARNING: an upgrade from v{} to v{} was interrupted",
                from,
                from + 1
            )?;
        }

        let backups = Self::archived_backups(data_dir)?;
        if backups.is_empty() {
            writeln!(out, "Upgrade backups:   none")?;
        } else {
            writeln!(out, "Upgrade backups:")?;
            for backup in backups {
                writeln!(out, "  {}", backup)?;
            }
        }
        Ok(())
    }

    /// File names of archived pre-upgrade copies, sorted by name (timestamp first).
    fn archived_backups(data_dir: &Path) -> Result<Vec<String>, HoardError> {
        let suffix_base = DB_FILENAME.replace('.', "_");
        let mut names = Vec::new();
        for entry in fs::read_dir(data_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.ends_with(".backup") && name.contains(&format!("_{}_v", suffix_base)) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_upgrade() {
        let cli = Cli::try_parse_from(["hoard"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(
            cli.command.unwrap_or(Command::Upgrade {
                data_dir: None,
                json: false
            }),
            Command::Upgrade {
                data_dir: None,
                json: false
            }
        ));
    }

    #[test]
    fn test_cli_parsing_data_dir() {
        let cli = Cli::try_parse_from(["hoard", "status", "--data-dir", "/tmp/x"]).unwrap();
        match cli.command {
            Some(Command::Status { data_dir }) => assert_eq!(data_dir, Some(PathBuf::from("/tmp/x"))),
            _ => panic!("Expected status command"),
        }

        let cli = Cli::try_parse_from(["hoard", "upgrade", "-d", "/tmp/y"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Upgrade {
                data_dir: Some(_),
                json: false
            })
        ));
    }

    #[test]
    fn test_data_dir_flag_also_places_logs() {
        let cli = Cli::try_parse_from(["hoard", "upgrade", "-d", "/srv/hoard-a"]).unwrap();
        let data_dir = Cli::resolve_data_dir(&cli.command.unwrap()).unwrap();
        assert_eq!(data_dir, PathBuf::from("/srv/hoard-a"));
        assert_eq!(Cli::log_dir(&data_dir), PathBuf::from("/srv/hoard-a/logs"));

        let cli = Cli::try_parse_from(["hoard", "status", "--data-dir", "/srv/hoard-b"]).unwrap();
        assert_eq!(
            Cli::resolve_data_dir(&cli.command.unwrap()).unwrap(),
            PathBuf::from("/srv/hoard-b")
        );
    }

    #[test]
    fn test_cli_parsing_json_flag() {
        let cli = Cli::try_parse_from(["hoard", "upgrade", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Upgrade {
                data_dir: None,
                json: true
            })
        ));
        assert!(Cli::try_parse_from(["hoard", "status", "--json"]).is_err());
    }

    #[test]
    fn test_write_json_line() {
        let message = UpgradeMessage::DbUpgradeStatus(crate::db::migration::progress::UpgradeStatus {
            start_version: 1,
            target_version: 3,
            current: crate::db::migration::progress::CurrentUpgrade {
                to_version: 2,
                total_steps: 1,
                current_step: 1,
            },
        });
        let mut out = Vec::new();
        Cli::write_json(&mut out, &message).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"type\":\"DB_UPGRADE_STATUS\",\"data\":{\"start_version\":1,\"target_version\":3,\"current\":{\"to_version\":2,\"total_steps\":1,\"current_step\":1}}}\n"
        );
    }

    #[test]
    fn test_streaming_upgrade_reaches_current_version() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(&dir.path().join(DB_FILENAME)).unwrap();
            db.create_schema().unwrap();
            Database::set_schema_version(db.conn(), 2).unwrap();
        }

        let db = Cli::connect_streaming_json(dir.path()).unwrap();

        assert_eq!(
            Database::schema_version(db.conn()).unwrap(),
            Some(CURRENT_DB_VERSION)
        );
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        assert!(Cli::try_parse_from(["hoard", "downgrade"]).is_err());
        assert!(Cli::try_parse_from(["hoard", "upgrade", "--invalid-flag"]).is_err());
    }

    #[test]
    fn test_archived_backups_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in [
            "1700000200_hoard_db_v2.backup",
            "1700000100_hoard_db_v1.backup",
            "notes.backup",
            "hoard.db",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        assert_eq!(
            Cli::archived_backups(dir.path()).unwrap(),
            vec!["1700000100_hoard_db_v1.backup", "1700000200_hoard_db_v2.backup"]
        );
    }

    #[test]
    fn test_status_without_database() {
        let dir = TempDir::new().unwrap();
        Cli::status(dir.path()).unwrap();
        assert!(!dir.path().join(DB_FILENAME).exists());
    }
}
