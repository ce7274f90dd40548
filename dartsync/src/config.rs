use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};
use crate::HANDSHAKE_PORT;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {

    #[error("cannot read config file {path}: {source}")]
    Unreadable { path: String, source: std::io::Error },

    #[error("config file has no watched-directory line")]
    MissingDirectory,

    #[error("watched directory {0} does not exist")]
    BadDirectory(String),

    #[error("invalid tracker address: {0}")]
    BadTrackerAddress(String),

}

pub type Result<T> = std::result::Result<T, ConfigError>;

// Peer configuration, read from a file named `config` in the working
// directory. First non-empty line is the watched directory, second
// (optional) is the tracker address.
#[derive(Debug, Clone)]
pub struct Config {

    // Directory kept in sync with the swarm.
    pub directory: PathBuf,

    // Control address of the tracker.
    pub tracker_addr: SocketAddr,

}

impl Config {

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {

        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        // A trailing separator is tolerated; paths are joined, not concatenated.
        let dir = lines.next().ok_or(ConfigError::MissingDirectory)?;
        let directory = PathBuf::from(dir.trim_end_matches('/'));
        if !directory.is_dir() {
            return Err(ConfigError::BadDirectory(dir.to_string()));
        }

        let tracker_addr = match lines.next() {
            Some(addr) => parse_tracker_addr(addr)?,
            None => SocketAddr::from(([127, 0, 0, 1], HANDSHAKE_PORT)),
        };

        Ok(Config { directory, tracker_addr })
    }
}

// Accepts either `ip:port` or a bare IP on the default handshake port.
fn parse_tracker_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Ok(sock);
    }
    addr.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, HANDSHAKE_PORT))
        .map_err(|_| ConfigError::BadTrackerAddress(addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_directory_and_tracker() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        std::fs::create_dir(&watched).unwrap();
        let contents = format!("{}/\n10.0.0.7:7000\n", watched.display());
        let path = write_config(tmp.path(), &contents);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.directory, watched);
        assert_eq!(config.tracker_addr, "10.0.0.7:7000".parse().unwrap());
    }

    #[test]
    fn test_load_bare_tracker_ip_gets_default_port() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = format!("{}\n192.168.1.2\n", tmp.path().display());
        let path = write_config(tmp.path(), &contents);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.tracker_addr.port(), HANDSHAKE_PORT);
    }

    #[test]
    fn test_load_defaults_tracker_to_loopback() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = format!("{}\n", tmp.path().display());
        let path = write_config(tmp.path(), &contents);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.tracker_addr, SocketAddr::from(([127, 0, 0, 1], HANDSHAKE_PORT)));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/config"),
            Err(ConfigError::Unreadable { .. })
        ));
    }

    #[test]
    fn test_load_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "\n\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::MissingDirectory)));
    }

    #[test]
    fn test_load_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "/definitely/not/a/dir\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::BadDirectory(_))));
    }
}
