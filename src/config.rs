//! Configuration file parser (spec.md §6). A text file of `name=value`
//! lines, `#` starts a comment, blank lines are ignored. Per-base detail
//! lives in a sibling file named `<configPath>.<baseId>`.

use crate::error::{CacheError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Cluster-wide configuration plus one `BaseConfig` per configured base.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// TRUE if this server starts in the PRIMARY role.
    pub primary: bool,
    /// Path the log sink appends to.
    pub log_path: PathBuf,
    /// Human-readable cluster identity, stamped into startup logs.
    pub cluster_name: String,
    /// Module identity, stamped into startup logs.
    pub module_name: String,
    /// Server type identity, stamped into startup logs.
    pub server_type: String,
    /// Local bind endpoint for the Binary Star state channel.
    pub bstar_local: SocketAddr,
    /// Remote (peer) endpoint for the Binary Star state channel.
    pub bstar_remote: SocketAddr,
    /// Configured bases, keyed by base id.
    pub bases: HashMap<String, BaseConfig>,
    /// Base ids, in the order they appeared in `baseidstrs`.
    pub base_ids: Vec<String>,
}

/// Per-base configuration (one sibling `.{baseId}` file).
#[derive(Debug, Clone)]
pub struct BaseConfig {
    /// Local snapshot/voting port.
    pub port: u16,
    /// Peer's snapshot/voting port.
    pub peer: u16,
    /// Durable store root directory for this base's MemCaches.
    pub database_path: PathBuf,
    /// MemCache partition ids hosted by this base.
    pub cache_ids: Vec<String>,
    /// Binary Star receptor endpoint for this base's snapshot requests.
    pub bstar_receptor: String,
    /// Address of the configured primary replica.
    pub address_primary: String,
    /// Port of the configured primary replica.
    pub port_primary: u16,
    /// Address of the configured backup replica.
    pub address_backup: String,
    /// Port of the configured backup replica.
    pub port_backup: u16,
}

fn parse_kv_file(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(eq) = line.find('=') {
            let key = line[..eq].trim().to_string();
            let value = line[eq + 1..].trim().to_string();
            map.insert(key, value);
        } else {
            warn!("config: ignoring malformed line in {:?}: {}", path, line);
        }
    }
    Ok(map)
}

fn required<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    map.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| CacheError::Config(format!("missing required key {}", key)))
}

fn parse_required<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str) -> Result<T> {
    required(map, key)?
        .parse()
        .map_err(|_| CacheError::Config(format!("invalid value for {}", key)))
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ClusterConfig {
    /// Load the global config file at `path`, then the sibling
    /// `path.<baseId>` file for every id named in `baseidstrs`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let global = parse_kv_file(path)?;

        let primary = matches!(global.get("primary").map(|s| s.as_str()), Some("TRUE"));
        let log_path = PathBuf::from(required(&global, "logPath")?);
        let cluster_name = required(&global, "ClusterName")?.to_string();
        let module_name = global.get("ModuleName").cloned().unwrap_or_default();
        let server_type = required(&global, "ServerType")?.to_string();
        let bstar_local: SocketAddr = parse_required(&global, "bstarLocal")?;
        let bstar_remote: SocketAddr = parse_required(&global, "bstarRemote")?;
        let base_ids = parse_csv(required(&global, "baseidstrs")?);

        let mut bases = HashMap::new();
        for base_id in &base_ids {
            let sibling = PathBuf::from(format!("{}.{}", path.display(), base_id));
            let fields = parse_kv_file(&sibling)?;
            let base = BaseConfig {
                port: parse_required(&fields, "port")?,
                peer: parse_required(&fields, "peer")?,
                database_path: PathBuf::from(required(&fields, "databasePath")?),
                cache_ids: parse_csv(required(&fields, "cacheids")?),
                bstar_receptor: required(&fields, "bstarReceptor")?.to_string(),
                address_primary: required(&fields, "addressprimary")?.to_string(),
                port_primary: parse_required(&fields, "portprimary")?,
                address_backup: required(&fields, "addressbackup")?.to_string(),
                port_backup: parse_required(&fields, "portbackup")?,
            };
            bases.insert(base_id.clone(), base);
        }

        Ok(Self {
            primary,
            log_path,
            cluster_name,
            module_name,
            server_type,
            bstar_local,
            bstar_remote,
            bases,
            base_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_global_and_per_base_files() {
        let dir = tempfile::tempdir().unwrap();
        let global_path = dir.path().join("cluster.conf");
        let mut global = std::fs::File::create(&global_path).unwrap();
        writeln!(global, "# comment").unwrap();
        writeln!(global, "primary=TRUE").unwrap();
        writeln!(global, "logPath=/tmp/clone.log").unwrap();
        writeln!(global, "ClusterName=demo").unwrap();
        writeln!(global, "ServerType=kv").unwrap();
        writeln!(global, "bstarLocal=127.0.0.1:5555").unwrap();
        writeln!(global, "bstarRemote=127.0.0.1:5556").unwrap();
        writeln!(global, "baseidstrs=A").unwrap();
        drop(global);

        let base_path = dir.path().join("cluster.conf.A");
        let mut base = std::fs::File::create(&base_path).unwrap();
        writeln!(base, "port=5561").unwrap();
        writeln!(base, "peer=5562").unwrap();
        writeln!(base, "databasePath=/tmp/db-a").unwrap();
        writeln!(base, "cacheids=c0,c1").unwrap();
        writeln!(base, "bstarReceptor=inproc://a").unwrap();
        writeln!(base, "addressprimary=127.0.0.1").unwrap();
        writeln!(base, "portprimary=5561").unwrap();
        writeln!(base, "addressbackup=127.0.0.1").unwrap();
        writeln!(base, "portbackup=5661").unwrap();
        drop(base);

        let config = ClusterConfig::load(&global_path).unwrap();
        assert!(config.primary);
        assert_eq!(config.cluster_name, "demo");
        assert_eq!(config.base_ids, vec!["A".to_string()]);
        let base_config = &config.bases["A"];
        assert_eq!(base_config.port, 5561);
        assert_eq!(base_config.cache_ids, vec!["c0".to_string(), "c1".to_string()]);
    }
}
