//! Ties the store, the WAL, the cluster manager and the hub together into
//! the four operations every transport calls: `SET`, `GET`, `DEL` and
//! `CLUSTER MEET`. This is the one place that knows the full sequence
//! "check ownership, log, apply, update stats, broadcast."
use std::sync::Arc;

use logger::Logger;

use crate::cluster::{ClusterManager, NodeOwner};
use crate::hub::Hub;
use crate::slot;
use crate::store::Store;
use crate::wal::{self, WalRecord, WalWriter};
use wire::CommandError;

pub struct CommandCore {
    store: Arc<Store>,
    wal: WalWriter,
    cluster: ClusterManager,
    hub: Hub,
    logger: Logger,
}

impl CommandCore {
    /// Opens (creating if needed) the WAL at `wal_path`, replays it into a
    /// fresh store, and builds a single-node cluster manager around
    /// `(host, port)`. Replay bypasses the WAL (the records are already
    /// durable) and the hub (no subscriber could have connected yet).
    pub fn open(
        wal_path: &std::path::Path,
        max_size: usize,
        host: String,
        port: u16,
        logger: Logger,
        hub: Hub,
    ) -> Result<Self, CommandError> {
        let store = Arc::new(Store::new(max_size));
        let records = wal::replay(wal_path)?;
        let replayed = records.len();
        for record in records {
            apply_replayed(&store, record)?;
        }
        if replayed > 0 {
            logger.info(&format!("replayed {replayed} WAL records"), "command_core");
        }

        let wal = WalWriter::open(wal_path)?;
        let cluster = ClusterManager::new(host, port);

        Ok(CommandCore {
            store,
            wal,
            cluster,
            hub,
            logger,
        })
    }

    pub fn cluster(&self) -> &ClusterManager {
        &self.cluster
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// A shared handle to the store, for the background expiration thread
    /// that runs alongside the command core rather than inside it.
    pub fn store_handle(&self) -> Arc<Store> {
        self.store.clone()
    }

    fn check_ownership(&self, key: &str) -> Result<(), CommandError> {
        let slot = slot::slot(key);
        match self.cluster.owner(slot) {
            NodeOwner::Local => Ok(()),
            NodeOwner::Remote { host, port } => Err(CommandError::Redirect { slot, host, port }),
        }
    }

    pub fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CommandError> {
        self.check_ownership(key)?;

        self.wal
            .append(&[b"SET".to_vec(), key.as_bytes().to_vec(), value.clone()])?;

        let prior = self.store.get(key);
        self.store.set(key, value.clone(), &self.logger);

        self.cluster.with_self(|n| match &prior {
            None => {
                n.incr_keys();
                n.add_bytes((key.len() + value.len()) as u64);
            }
            Some(prior_value) => {
                n.sub_bytes((key.len() + prior_value.len()) as u64);
                n.add_bytes((key.len() + value.len()) as u64);
            }
        });

        self.hub
            .broadcast_update("set", key, Some(&String::from_utf8_lossy(&value)));
        self.maybe_broadcast_cluster_stats();
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>, CommandError> {
        self.check_ownership(key)?;
        self.store.get(key).ok_or(CommandError::NotFound)
    }

    pub fn del(&self, key: &str) -> Result<bool, CommandError> {
        self.check_ownership(key)?;

        self.wal.append(&[b"DEL".to_vec(), key.as_bytes().to_vec()])?;

        let prior = self.store.get(key);
        let existed = self.store.delete(key);
        if existed {
            if let Some(prior_value) = prior {
                self.cluster.with_self(|n| {
                    n.decr_keys();
                    n.sub_bytes((key.len() + prior_value.len()) as u64);
                });
            }
            self.hub.broadcast_update("del", key, None);
            self.maybe_broadcast_cluster_stats();
        }
        Ok(existed)
    }

    pub fn cluster_meet(&self, host: String, port: u16) -> Result<(), CommandError> {
        if host.is_empty() || port == 0 {
            return Err(CommandError::Cluster(
                "CLUSTER MEET requires a non-empty host and a nonzero port".to_string(),
            ));
        }
        self.cluster.add_node(host, port);
        self.logger.info(
            &format!("cluster now has {} nodes", self.cluster.node_count()),
            "command_core",
        );
        self.maybe_broadcast_cluster_stats();
        Ok(())
    }

    fn maybe_broadcast_cluster_stats(&self) {
        if self.cluster.node_count() > 1 {
            self.hub
                .broadcast_cluster_stats(&self.cluster.snapshot(), self.cluster.self_id().as_str());
        }
    }
}

/// Applies a WAL record during startup replay: directly against the store,
/// bypassing the WAL (already durable) and the hub (nobody is subscribed
/// yet). An unrecognized verb fails the replay rather than panicking, so a
/// corrupt log surfaces through `CommandCore::open`'s `Result` and the
/// process exits with the documented code instead of unwinding.
fn apply_replayed(store: &Store, record: WalRecord) -> Result<(), CommandError> {
    let null_logger = Logger::null();
    match record.command() {
        Some(b"SET") if record.fields.len() == 3 => {
            let key = String::from_utf8_lossy(&record.fields[1]).into_owned();
            store.set(&key, record.fields[2].clone(), &null_logger);
            Ok(())
        }
        Some(b"DEL") if record.fields.len() == 2 => {
            let key = String::from_utf8_lossy(&record.fields[1]).into_owned();
            store.delete(&key);
            Ok(())
        }
        other => Err(CommandError::Wal(format!(
            "unknown or malformed WAL record during replay: {:?}",
            other.map(String::from_utf8_lossy)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_wal_path() -> std::path::PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("kvnode-core-test-{n}.wal"))
    }

    fn open_core(path: &std::path::Path) -> CommandCore {
        CommandCore::open(
            path,
            10,
            "127.0.0.1".to_string(),
            7000,
            Logger::null(),
            Hub::noop(),
        )
        .unwrap()
    }

    #[test]
    fn set_then_get_round_trips() {
        let path = temp_wal_path();
        let core = open_core(&path);
        core.set("a", b"1".to_vec()).unwrap();
        assert_eq!(core.get("a").unwrap(), b"1".to_vec());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let path = temp_wal_path();
        let core = open_core(&path);
        assert!(matches!(core.get("missing"), Err(CommandError::NotFound)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn del_reports_whether_key_existed() {
        let path = temp_wal_path();
        let core = open_core(&path);
        core.set("a", b"1".to_vec()).unwrap();
        assert!(core.del("a").unwrap());
        assert!(!core.del("a").unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn overwriting_a_key_replaces_its_byte_accounting() {
        let path = temp_wal_path();
        let core = open_core(&path);
        core.set("a", b"1".to_vec()).unwrap();
        core.set("a", b"longer-value".to_vec()).unwrap();
        assert_eq!(core.cluster().with_self(|n| n.key_count()), 1);
        assert_eq!(
            core.cluster().with_self(|n| n.byte_size()),
            ("a".len() + "longer-value".len()) as u64
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn replay_restores_state_from_a_previous_run() {
        let path = temp_wal_path();
        {
            let core = open_core(&path);
            core.set("a", b"1".to_vec()).unwrap();
            core.set("b", b"2".to_vec()).unwrap();
            core.del("a").unwrap();
        }

        let core = open_core(&path);
        assert!(matches!(core.get("a"), Err(CommandError::NotFound)));
        assert_eq!(core.get("b").unwrap(), b"2".to_vec());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn single_node_cluster_never_redirects() {
        let path = temp_wal_path();
        let core = open_core(&path);
        assert!(core.set("any-key", b"v".to_vec()).is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cluster_meet_rejects_a_zero_port() {
        let path = temp_wal_path();
        let core = open_core(&path);
        assert!(core.cluster_meet("127.0.0.1".to_string(), 0).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn three_node_cluster_redirects_keys_owned_elsewhere() {
        let path = temp_wal_path();
        let core = open_core(&path);
        core.cluster_meet("10.0.0.2".to_string(), 7001).unwrap();
        core.cluster_meet("10.0.0.3".to_string(), 7002).unwrap();
        assert!(core.cluster().is_initialized());

        // At least one of these keys must land on a non-self slot now that
        // the cluster has partitioned the slot space across three nodes.
        let any_redirected = (0..100)
            .map(|i| format!("k{i}"))
            .any(|k| matches!(core.set(&k, b"v".to_vec()), Err(CommandError::Redirect { .. })));
        assert!(any_redirected);
        let _ = std::fs::remove_file(&path);
    }
}
