use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::HoardError;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub hoard: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const HOARD_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            hoard: Self::HOARD_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.hoard.clone();
        self.hoard = self.hoard.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.hoard.as_str()) {
            eprintln!(
                "Config error: hoard log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::HOARD_LEVEL
            );
            self.hoard = Self::HOARD_LEVEL.to_owned();
        }
    }

    /// flexi_logger spec string, e.g. `hoard=info`.
    pub fn log_spec(&self) -> String {
        format!("hoard={}", self.hoard)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub data_dir: PathBuf,
}

impl DatabaseConfig {
    fn default(project_dirs: &ProjectDirs) -> Self {
        DatabaseConfig {
            data_dir: project_dirs.data_local_dir().to_path_buf(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

impl Config {
    pub fn project_dirs() -> Result<ProjectDirs, HoardError> {
        ProjectDirs::from("", "", "hoard")
            .ok_or_else(|| HoardError::Config("Could not determine the home directory".to_string()))
    }

    /// Loads `config.toml` from the app's data directory, layered over the
    /// defaults and under `HOARD_` environment variables
    /// (e.g. `HOARD_LOGGING__HOARD=debug`).
    ///
    /// A missing file is created with the defaults. A file that fails to
    /// parse falls back to the defaults.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        let default_config = Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(project_dirs),
        };

        if !config_path.exists() {
            Self::write_default(&config_path, &default_config);
        }

        Self::load_from(&config_path, default_config)
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn load_from(config_path: &Path, default_config: Config) -> Self {
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("HOARD_").split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();
        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
    }

    pub fn get() -> Result<&'static Config, HoardError> {
        CONFIG
            .get()
            .ok_or_else(|| HoardError::Config("Configuration not loaded".to_string()))
    }
}
