//! Log sinks: a file under `/var/log/calico/cni` and stderr, each with its own level.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

use crate::network::cni::schema::NetworkConfiguration;

pub const LOG_DIR: &str = "/var/log/calico/cni";

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub directory: PathBuf,
    pub file_name: &'static str,
    pub file_level: LevelFilter,
    pub stderr_level: LevelFilter,
}

impl LogSettings {
    /// Settings for the plugin itself. `config` is `None` when the configuration could not be read.
    pub fn for_plugin(config: Option<&NetworkConfiguration>) -> LogSettings {
        LogSettings::from_config(config, "cni.log", LevelFilter::INFO, LevelFilter::ERROR)
    }

    /// Settings for the standalone IPAM plugin, which only logs to a file when asked to.
    pub fn for_ipam(config: Option<&NetworkConfiguration>) -> LogSettings {
        LogSettings::from_config(config, "ipam.log", LevelFilter::OFF, LevelFilter::INFO)
    }

    fn from_config(
        config: Option<&NetworkConfiguration>,
        file_name: &'static str,
        file_default: LevelFilter,
        stderr_default: LevelFilter,
    ) -> LogSettings {
        let level = |setting: Option<&String>, default: LevelFilter| {
            setting.and_then(|name| parse_level(name)).unwrap_or(default)
        };
        LogSettings {
            directory: LOG_DIR.into(),
            file_name,
            file_level: level(config.and_then(|c| c.log_level.as_ref()), file_default),
            stderr_level: level(config.and_then(|c| c.log_level_stderr.as_ref()), stderr_default),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(self.file_name)
    }
}

/// Parses a level name as it appears in network configurations. Unknown names give `None`.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    let level = match name.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::DEBUG,
        "INFO" => LevelFilter::INFO,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "ERROR" | "CRITICAL" => LevelFilter::ERROR,
        "NONE" | "OFF" => LevelFilter::OFF,
        _ => return None,
    };
    Some(level)
}

fn open_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global subscriber. Only the first call in a process has any effect.
pub fn init(settings: &LogSettings) {
    let file = if settings.file_level == LevelFilter::OFF {
        None
    } else {
        match open_log_file(&settings.path()) {
            Ok(file) => Some(Arc::new(file)),
            Err(err) => {
                eprintln!("Could not open log file {}: {}", settings.path().display(), err);
                None
            }
        }
    };

    let stderr = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(settings.stderr_level);
    let file = file.map(|file| {
        fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(false)
            .with_filter(settings.file_level)
    });

    let _ = tracing_subscriber::registry().with(stderr).with(file).try_init();
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::cni::args::tests::network_config;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("WARNING"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("CRITICAL"), Some(LevelFilter::ERROR));
        assert_eq!(parse_level("NONE"), Some(LevelFilter::OFF));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn test_defaults() {
        let plugin = LogSettings::for_plugin(None);
        assert_eq!(plugin.path(), Path::new("/var/log/calico/cni/cni.log"));
        assert_eq!(plugin.file_level, LevelFilter::INFO);
        assert_eq!(plugin.stderr_level, LevelFilter::ERROR);

        let ipam = LogSettings::for_ipam(None);
        assert_eq!(ipam.path(), Path::new("/var/log/calico/cni/ipam.log"));
        assert_eq!(ipam.file_level, LevelFilter::OFF);
        assert_eq!(ipam.stderr_level, LevelFilter::INFO);
    }

    #[test]
    fn test_configured_levels() {
        let config = network_config(json!({
            "name": "net1",
            "type": "calico",
            "ipam": {"type": "calico-ipam"},
            "log_level": "debug",
            "log_level_stderr": "bogus"
        }));
        let settings = LogSettings::for_plugin(Some(&config));
        assert_eq!(settings.file_level, LevelFilter::DEBUG);
        assert_eq!(settings.stderr_level, LevelFilter::ERROR);
    }

    #[test]
    fn test_open_log_file_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/cni.log");
        open_log_file(&path).unwrap();
        assert!(path.is_file());
    }
}
