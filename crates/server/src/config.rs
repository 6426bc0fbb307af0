//! Server configuration: a line-oriented `key=value` file.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Runtime configuration for the drive server.
///
/// Unknown keys are ignored so configs can be shared across versions; a
/// missing or unreadable file falls back to defaults with a warning.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub storage_root: PathBuf,
    pub database_file: PathBuf,
    pub log_file: PathBuf,
    pub max_clients: usize,
    pub long_task_threads: usize,
    pub max_chunk_bytes: usize,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub token_ttl_seconds: u64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".into(),
            listen_port: 6000,
            storage_root: "./server/storage".into(),
            database_file: "./data/cloud_drive.db".into(),
            log_file: "./data/server.log".into(),
            max_clients: 512,
            long_task_threads: 4,
            max_chunk_bytes: 1_048_576,
            jwt_secret: "cumulus-development-secret".into(),
            jwt_issuer: "cumulus".into(),
            token_ttl_seconds: 3600,
        }
    }
}

impl DriveConfig {
    /// Loads configuration from `path`, falling back to defaults for any
    /// missing key.
    pub fn load(path: &Path) -> Self {
        let mut config = Self::default();

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    "unable to read config file ({err}), using defaults"
                );
                return config;
            }
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "listen_address" => config.listen_address = value.into(),
                "listen_port" => set_number(key, value, &mut config.listen_port),
                "storage_root" => config.storage_root = value.into(),
                "database_file" => config.database_file = value.into(),
                "log_file" => config.log_file = value.into(),
                "max_clients" => set_number(key, value, &mut config.max_clients),
                "long_task_threads" => set_number(key, value, &mut config.long_task_threads),
                "max_chunk_bytes" => set_number(key, value, &mut config.max_chunk_bytes),
                "jwt_secret" => config.jwt_secret = value.into(),
                "jwt_issuer" => config.jwt_issuer = value.into(),
                "token_ttl_seconds" => set_number(key, value, &mut config.token_ttl_seconds),
                _ => {}
            }
        }
        config
    }
}

fn set_number<T: std::str::FromStr + Copy>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "ignoring unparsable config value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(contents: &str) -> DriveConfig {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        DriveConfig::load(file.path())
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = DriveConfig::load(Path::new("/no/such/config.conf"));
        assert_eq!(config.listen_port, 6000);
        assert_eq!(config.max_chunk_bytes, 1_048_576);
        assert_eq!(config.long_task_threads, 4);
    }

    #[test]
    fn parses_known_keys() {
        let config = load_str(
            "listen_address=127.0.0.1\n\
             listen_port=7100\n\
             storage_root=/srv/drive\n\
             max_clients=64\n\
             long_task_threads=2\n\
             jwt_secret=sekrit\n\
             token_ttl_seconds=60\n",
        );
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.listen_port, 7100);
        assert_eq!(config.storage_root, PathBuf::from("/srv/drive"));
        assert_eq!(config.max_clients, 64);
        assert_eq!(config.long_task_threads, 2);
        assert_eq!(config.jwt_secret, "sekrit");
        assert_eq!(config.token_ttl_seconds, 60);
    }

    #[test]
    fn skips_comments_blank_lines_and_unknown_keys() {
        let config = load_str(
            "# cumulus server\n\
             \n\
             listen_port = 9000 \n\
             some_future_key=whatever\n\
             not a key value line\n",
        );
        assert_eq!(config.listen_port, 9000);
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let config = load_str("listen_port=lots\nmax_clients=-3\n");
        assert_eq!(config.listen_port, 6000);
        assert_eq!(config.max_clients, 512);
    }
}
