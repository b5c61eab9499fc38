//! Parses the node's flat `key = value` configuration file and merges it
//! over the CLI flag defaults. Every key is optional: an absent key falls
//! back to the CLI-supplied port (or its built-in default) rather than
//! erroring out.
use std::collections::HashMap;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_WAL_FILE: &str = "node.wal";
const DEFAULT_LOG_FILE: &str = "node.log";
const DEFAULT_MAX_CLIENTS: usize = 10_000;

#[derive(Debug)]
pub struct Config {
    address: SocketAddr,
    http_address: SocketAddr,
    wal_file: String,
    log_file: String,
    node_seed: Option<SocketAddr>,
    max_clients: usize,
}

impl Config {
    /// Builds a `Config` from the CLI-supplied `--port`/`--http-port` (used
    /// as defaults) and, if `config_path` is given, a `key = value` file
    /// whose present keys override those defaults.
    pub fn from_args(port: u16, http_port: u16, config_path: Option<&str>) -> Result<Self, String> {
        let mut address = local_addr(port);
        let mut http_address = local_addr(http_port);
        let mut wal_file = DEFAULT_WAL_FILE.to_string();
        let mut log_file = DEFAULT_LOG_FILE.to_string();
        let mut node_seed = None;
        let mut max_clients = DEFAULT_MAX_CLIENTS;

        if let Some(path) = config_path {
            let map = Self::parse_key_value_lines(Self::read_lines_from_file(path)?)?;
            if let Some(v) = map.get("address") {
                address = Self::resolve(v, "address")?;
            }
            if let Some(v) = map.get("http_address") {
                http_address = Self::resolve(v, "http_address")?;
            }
            if let Some(v) = map.get("wal_file") {
                wal_file = v.clone();
            }
            if let Some(v) = map.get("log_file") {
                log_file = v.clone();
            }
            if let Some(v) = map.get("node_seed") {
                node_seed = Some(Self::resolve(v, "node_seed")?);
            }
            if let Some(v) = map.get("max_clients") {
                max_clients = v
                    .parse::<usize>()
                    .map_err(|_| format!("'max_clients' (\"{v}\") is not a valid number"))?;
            }
        }

        Ok(Config {
            address,
            http_address,
            wal_file,
            log_file,
            node_seed,
            max_clients,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn http_address(&self) -> SocketAddr {
        self.http_address
    }

    pub fn wal_file(&self) -> &str {
        &self.wal_file
    }

    pub fn log_file(&self) -> &str {
        &self.log_file
    }

    pub fn node_seed(&self) -> Option<SocketAddr> {
        self.node_seed
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    fn read_lines_from_file(path: &str) -> Result<Vec<String>, String> {
        let contents =
            fs::read_to_string(path).map_err(|e| format!("cannot read config file '{path}': {e}"))?;
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
            .map(|line| line.to_string())
            .collect())
    }

    fn parse_key_value_lines(lines: Vec<String>) -> Result<HashMap<String, String>, String> {
        let mut map = HashMap::new();
        for line in lines {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("malformed config line: '{line}'"))?;
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(map)
    }

    fn resolve(value: &str, key: &str) -> Result<SocketAddr, String> {
        value
            .to_socket_addrs()
            .map_err(|_| format!("'{key}' (\"{value}\") is not a valid host:port"))?
            .next()
            .ok_or_else(|| format!("could not resolve '{key}' (\"{value}\")"))
    }
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn write_temp_config(contents: &str) -> std::path::PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("kvnode-config-test-{n}.conf"));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn no_config_file_uses_cli_ports_and_defaults() {
        let config = Config::from_args(DEFAULT_PORT, DEFAULT_HTTP_PORT, None).unwrap();
        assert_eq!(config.address().port(), DEFAULT_PORT);
        assert_eq!(config.http_address().port(), DEFAULT_HTTP_PORT);
        assert_eq!(config.wal_file(), DEFAULT_WAL_FILE);
        assert_eq!(config.log_file(), DEFAULT_LOG_FILE);
        assert_eq!(config.max_clients(), DEFAULT_MAX_CLIENTS);
        assert!(config.node_seed().is_none());
    }

    #[test]
    fn config_file_keys_override_cli_defaults() {
        let path = write_temp_config("address = 127.0.0.1:9000\nwal_file = custom.wal\nmax_clients = 5\n# a comment\n");
        let config = Config::from_args(DEFAULT_PORT, DEFAULT_HTTP_PORT, Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.address().port(), 9000);
        assert_eq!(config.http_address().port(), DEFAULT_HTTP_PORT);
        assert_eq!(config.wal_file(), "custom.wal");
        assert_eq!(config.max_clients(), 5);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn absent_config_keys_fall_back_to_cli_defaults() {
        let path = write_temp_config("log_file = custom.log\n");
        let config = Config::from_args(7000, 8001, Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.address().port(), 7000);
        assert_eq!(config.http_address().port(), 8001);
        assert_eq!(config.log_file(), "custom.log");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::from_args(DEFAULT_PORT, DEFAULT_HTTP_PORT, Some("/nonexistent/path.conf")).is_err());
    }
}
