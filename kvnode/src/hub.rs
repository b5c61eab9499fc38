//! Broadcast hub for the WebSocket dashboard: a single event-loop thread
//! owns the subscriber table and fans key updates and cluster stats out to
//! every connected browser.
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::spawn;

use logger::Logger;
use serde::Serialize;

use crate::cluster::NodeSnapshot;
use crate::slot::SLOT_COUNT;

/// Command sent to the hub's event loop.
enum HubCommand {
    Register { id: u64, sender: Sender<String> },
    Unregister { id: u64 },
    Broadcast { payload: String },
}

/// A JSON event pushed to every subscriber, shaped per the WebSocket
/// protocol's server-to-client messages.
#[derive(Serialize)]
#[serde(tag = "action")]
enum Event {
    #[serde(rename = "set")]
    Set { key: String, value: String },
    #[serde(rename = "del")]
    Del { key: String },
    #[serde(rename = "cluster_stats")]
    ClusterStats {
        nodes: Vec<NodeSnapshot>,
        #[serde(rename = "currentNodeId")]
        current_node_id: String,
        #[serde(rename = "totalSlots")]
        total_slots: u16,
        #[serde(rename = "clusterSize")]
        cluster_size: usize,
        #[serde(rename = "totalKeys")]
        total_keys: u64,
    },
}

/// Handle held by the command core and the transports. Cloning is cheap —
/// it just clones the sending half of the command channel.
#[derive(Clone)]
pub struct Hub {
    cmd_sender: Sender<HubCommand>,
}

impl Hub {
    /// Spawns the hub's event-loop thread and returns a handle to it.
    pub fn new(logger: Logger) -> Self {
        let (tx, rx) = channel();
        let mut core = HubCore::new(logger);
        spawn(move || core.run(rx));
        Hub { cmd_sender: tx }
    }

    /// A hub with nobody driving it, for tests that don't need fan-out.
    pub fn noop() -> Self {
        let (tx, _rx) = channel();
        Hub { cmd_sender: tx }
    }

    /// Registers a new subscriber and returns an unbounded channel the
    /// transport should drain and forward to its WebSocket.
    pub fn register(&self, id: u64) -> Receiver<String> {
        let (tx, rx) = channel();
        let _ = self.cmd_sender.send(HubCommand::Register { id, sender: tx });
        rx
    }

    pub fn unregister(&self, id: u64) {
        let _ = self.cmd_sender.send(HubCommand::Unregister { id });
    }

    /// Publishes a `set` or `del` update. `value` is ignored for `"del"`.
    pub fn broadcast_update(&self, action: &str, key: &str, value: Option<&str>) {
        let event = match action {
            "set" => Event::Set {
                key: key.to_string(),
                value: value.unwrap_or_default().to_string(),
            },
            "del" => Event::Del { key: key.to_string() },
            _ => return,
        };
        self.broadcast(&event);
    }

    pub fn broadcast_cluster_stats(&self, nodes: &[NodeSnapshot], current_node_id: &str) {
        let total_keys = nodes.iter().map(|n| n.key_count).sum();
        self.broadcast(&Event::ClusterStats {
            nodes: nodes.to_vec(),
            current_node_id: current_node_id.to_string(),
            total_slots: SLOT_COUNT,
            cluster_size: nodes.len(),
            total_keys,
        });
    }

    fn broadcast(&self, event: &Event) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        let _ = self.cmd_sender.send(HubCommand::Broadcast { payload });
    }
}

/// Owns the subscriber table. Runs on its own thread so a slow or wedged
/// subscriber can never block a writer thread that just wants to publish an
/// update. Per-subscriber channels are unbounded: the hub never blocks on a
/// send and never drops an update to make room.
struct HubCore {
    subscribers: HashMap<u64, Sender<String>>,
    logger: Logger,
}

impl HubCore {
    fn new(logger: Logger) -> Self {
        HubCore {
            subscribers: HashMap::new(),
            logger,
        }
    }

    fn run(&mut self, rx: Receiver<HubCommand>) {
        for cmd in rx {
            self.handle(cmd);
        }
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { id, sender } => {
                self.logger.debug("subscriber registered", "hub", id);
                self.subscribers.insert(id, sender);
            }
            HubCommand::Unregister { id } => {
                self.logger.debug("subscriber unregistered", "hub", id);
                self.subscribers.remove(&id);
            }
            HubCommand::Broadcast { payload } => {
                self.subscribers
                    .retain(|_, sender| sender.send(payload.clone()).is_ok());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn registered_subscriber_receives_set_updates() {
        let hub = Hub::new(Logger::null());
        let rx = hub.register(1);
        hub.broadcast_update("set", "foo", Some("bar"));
        let msg = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(msg.contains("\"action\":\"set\""));
        assert!(msg.contains("\"foo\""));
        assert!(msg.contains("\"bar\""));
    }

    #[test]
    fn del_update_carries_no_value_field() {
        let hub = Hub::new(Logger::null());
        let rx = hub.register(1);
        hub.broadcast_update("del", "foo", None);
        let msg = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(msg.contains("\"action\":\"del\""));
        assert!(!msg.contains("value"));
    }

    #[test]
    fn unregistered_subscriber_gets_nothing_further() {
        let hub = Hub::new(Logger::null());
        let rx = hub.register(1);
        hub.unregister(1);
        hub.broadcast_update("del", "foo", None);
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn multiple_subscribers_each_get_the_broadcast() {
        let hub = Hub::new(Logger::null());
        let rx1 = hub.register(1);
        let rx2 = hub.register(2);
        hub.broadcast_cluster_stats(&[], "self-id");
        assert!(rx1.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(rx2.recv_timeout(Duration::from_secs(1)).is_ok());
    }
}
