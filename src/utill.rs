//! Various utility and helper functions for the taker.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Once,
    time::{SystemTime, UNIX_EPOCH},
};

use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Logger, Root},
    encode::pattern::PatternEncoder,
    Config,
};

const LOG_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f%:z)} {h({l})} {t} - {m}{n}";

/// Get the system specific home directory.
/// Falls back to the current directory when no home directory is known.
pub fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default data directory. `~/.coinswap`.
pub fn get_data_dir() -> PathBuf {
    get_home_dir().join(".coinswap")
}

/// Get the Taker Directory. `~/.coinswap/taker`.
pub fn get_taker_dir() -> PathBuf {
    get_data_dir().join("taker")
}

/// Seconds since the unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sets up the taker logger: console plus `<data_dir>/debug.log`.
///
/// Only the first call has an effect, later calls are ignored.
pub fn setup_taker_logger(filter: LevelFilter, data_dir: Option<PathBuf>) {
    static LOGGER: Once = Once::new();
    LOGGER.call_once(|| {
        let data_dir = data_dir.unwrap_or_else(get_taker_dir);
        if let Err(e) = fs::create_dir_all(&data_dir) {
            eprintln!("Failed to create log directory {}: {e}", data_dir.display());
            return;
        }
        let log_path = data_dir.join("debug.log");

        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();
        let file = match FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(&log_path)
        {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", log_path.display());
                return;
            }
        };

        let config = Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .appender(Appender::builder().build("file", Box::new(file)))
            .logger(
                Logger::builder()
                    .appender("file")
                    .build("coinswap_taker", filter),
            )
            .build(Root::builder().appender("stdout").build(filter));

        match config {
            Ok(config) => {
                if let Err(e) = log4rs::init_config(config) {
                    eprintln!("Logger already initialized: {e}");
                }
            }
            Err(e) => eprintln!("Invalid logger configuration: {e:?}"),
        }
    });
}

/// Parses a flat `key = value` TOML file into a map.
///
/// Section headers, comments and blank lines are skipped. Values keep their raw text with
/// surrounding quotes removed.
pub fn parse_toml(file_path: &Path) -> io::Result<HashMap<String, String>> {
    let file = File::open(file_path)?;
    let reader = io::BufReader::new(file);

    let mut map = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(map)
}

/// Parses a single config field, falling back to `default` when absent or malformed.
pub fn parse_field<T: FromStr>(value: Option<&String>, default: T) -> T {
    value
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// Writes `bytes` to `path` through a temporary sibling file and a rename,
/// so readers never observe a half-written file.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_toml_skips_comments_and_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "# comment\n[section]\nsync_interval_secs = 42\nname = \"alice\"\n\nbroken line\n",
        )
        .unwrap();

        let map = parse_toml(&path).unwrap();
        assert_eq!(map.get("sync_interval_secs").map(String::as_str), Some("42"));
        assert_eq!(map.get("name").map(String::as_str), Some("alice"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn parse_field_falls_back_on_bad_values() {
        assert_eq!(parse_field(Some(&"7".to_string()), 1u32), 7);
        assert_eq!(parse_field(Some(&"seven".to_string()), 1u32), 1);
        assert_eq!(parse_field::<u32>(None, 3), 3);
    }

    #[test]
    fn atomic_write_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.cbor");
        write_atomically(&path, b"first").unwrap();
        write_atomically(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }
}
