//! Live per-client status shared between running jobs and status readers.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

const STATUS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusAction {
    #[default]
    None,
    FullFile,
    IncrFile,
    ResumeFullFile,
    ResumeIncrFile,
    FullImage,
    IncrImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub client: String,
    pub action: StatusAction,
    /// -1 while progress is unknown.
    pub percent_done: i32,
    pub hash_queue_size: u64,
    pub prepare_hash_queue_size: u64,
}

impl ClientStatus {
    pub fn idle(client: &str) -> Self {
        Self {
            client: client.to_string(),
            action: StatusAction::None,
            percent_done: -1,
            hash_queue_size: 0,
            prepare_hash_queue_size: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.action == StatusAction::None
            && self.percent_done == -1
            && self.hash_queue_size == 0
            && self.prepare_hash_queue_size == 0
    }
}

#[derive(Debug)]
struct Slot {
    status: ClientStatus,
    stop_requested: bool,
}

/// Created once at startup and shared for the life of the process.
///
/// Each client's record sits behind its shard lock; writers replace it whole,
/// so readers see either the previous or the next record and never a mix.
pub struct StatusRegistry {
    slots: DashMap<String, Slot>,
    changes: broadcast::Sender<ClientStatus>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            slots: DashMap::new(),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientStatus> {
        self.changes.subscribe()
    }

    pub fn publish(&self, status: ClientStatus) {
        let snapshot = status.clone();
        self.slots
            .entry(status.client.clone())
            .and_modify(|slot| slot.status = status.clone())
            .or_insert_with(|| Slot {
                status,
                stop_requested: false,
            });
        // No receivers is fine
        let _ = self.changes.send(snapshot);
    }

    /// Read-modify-write of one record under its lock. Creates an idle record
    /// first if the client has none.
    pub fn update<F>(&self, client: &str, f: F) -> ClientStatus
    where
        F: FnOnce(&mut ClientStatus),
    {
        let snapshot = {
            let mut slot = self.slots.entry(client.to_string()).or_insert_with(|| Slot {
                status: ClientStatus::idle(client),
                stop_requested: false,
            });
            f(&mut slot.status);
            slot.status.client = client.to_string();
            slot.status.clone()
        };
        let _ = self.changes.send(snapshot.clone());
        snapshot
    }

    pub fn reset(&self, client: &str) {
        self.publish(ClientStatus::idle(client));
    }

    pub fn get(&self, client: &str) -> Option<ClientStatus> {
        self.slots.get(client).map(|slot| slot.status.clone())
    }

    pub fn all(&self) -> Vec<ClientStatus> {
        let mut all: Vec<ClientStatus> = self.slots.iter().map(|s| s.status.clone()).collect();
        all.sort_by(|a, b| a.client.cmp(&b.client));
        all
    }

    pub fn signal_stop_requested(&self, client: &str, requested: bool) {
        self.slots
            .entry(client.to_string())
            .and_modify(|slot| slot.stop_requested = requested)
            .or_insert_with(|| Slot {
                status: ClientStatus::idle(client),
                stop_requested: requested,
            });
    }

    pub fn stop_requested(&self, client: &str) -> bool {
        self.slots
            .get(client)
            .map(|slot| slot.stop_requested)
            .unwrap_or(false)
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn running(client: &str, n: u64) -> ClientStatus {
        ClientStatus {
            client: client.to_string(),
            action: StatusAction::IncrFile,
            percent_done: n as i32,
            hash_queue_size: n,
            prepare_hash_queue_size: n,
        }
    }

    #[test]
    fn test_publish_replaces_and_reset_goes_idle() {
        let registry = StatusRegistry::new();
        assert!(registry.get("pc").is_none());

        registry.publish(running("pc", 5));
        assert_eq!(registry.get("pc").unwrap().percent_done, 5);

        registry.reset("pc");
        let status = registry.get("pc").unwrap();
        assert!(status.is_idle());
        assert_eq!(status, ClientStatus::idle("pc"));
    }

    #[test]
    fn test_stop_flag_is_independent_of_record() {
        let registry = StatusRegistry::new();
        registry.signal_stop_requested("pc", true);
        assert!(registry.stop_requested("pc"));

        registry.publish(running("pc", 1));
        assert!(registry.stop_requested("pc"));

        registry.signal_stop_requested("pc", false);
        assert!(!registry.stop_requested("pc"));
        assert_eq!(registry.get("pc").unwrap().percent_done, 1);
        assert!(!registry.stop_requested("never-seen"));
    }

    #[test]
    fn test_update_modifies_in_place() {
        let registry = StatusRegistry::new();
        registry.publish(running("pc", 0));
        let after = registry.update("pc", |s| s.percent_done = 42);
        assert_eq!(after.percent_done, 42);
        assert_eq!(after.action, StatusAction::IncrFile);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let registry = StatusRegistry::new();
        let mut rx = registry.subscribe();
        registry.publish(running("pc", 3));
        registry.reset("pc");

        assert_eq!(rx.recv().await.unwrap().percent_done, 3);
        assert!(rx.recv().await.unwrap().is_idle());
    }

    #[test]
    fn test_concurrent_publish_is_never_torn() {
        let registry = Arc::new(StatusRegistry::new());
        let done = Arc::new(AtomicBool::new(false));
        let clients: Vec<String> = (0..8).map(|i| format!("client-{i}")).collect();

        let writers: Vec<_> = clients
            .iter()
            .cloned()
            .map(|client| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for n in 0..2_000u64 {
                        registry.publish(running(&client, n));
                    }
                    registry.reset(&client);
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let done = done.clone();
                let clients = clients.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        for client in &clients {
                            if let Some(s) = registry.get(client) {
                                if s.action == StatusAction::None {
                                    assert!(s.is_idle());
                                } else {
                                    assert_eq!(s.percent_done as u64, s.hash_queue_size);
                                    assert_eq!(s.hash_queue_size, s.prepare_hash_queue_size);
                                }
                                assert_eq!(&s.client, client);
                            }
                        }
                    }
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }

        assert!(registry.all().iter().all(ClientStatus::is_idle));
        assert_eq!(registry.all().len(), 8);
    }
}
