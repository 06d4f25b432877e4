//! Registry of live tunnels with admission control and idle shutdown.
//!
//! [`ConnectionsManager`] is the single authority for which correlation ids
//! have a running session. It enforces `max_clients` and owns the idle timer:
//! the timer is armed exactly while the registry is empty, and when it runs
//! out the [`IdleSignal`] handed to the process owner fires once.
//!
//! ## Concurrency
//!
//! The map and the timer live under one mutex. `try_add` checks capacity,
//! inserts and cancels the timer without releasing it; `remove` re-checks
//! emptiness under the same lock before arming. Each armed timer carries a
//! generation number and only fires if that generation is still current, so
//! a timer that woke just as a connection was admitted never fires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::ProxyConnection;

/// Manages the pool of active tunnels.
///
/// Cloneable: all clones share the same registry.
#[derive(Clone)]
pub struct ConnectionsManager {
    registry: Arc<Mutex<Registry>>,
    max_clients: usize,
    /// `None` disables idle shutdown.
    shutdown_delay: Option<Duration>,
    idle_tx: mpsc::UnboundedSender<()>,
}

struct Registry {
    connections: HashMap<String, Arc<ProxyConnection>>,
    idle_timer: Option<JoinHandle<()>>,
    generation: u64,
}

/// Receives the one-shot "no tunnel for `shutdown_delay`" notification.
pub struct IdleSignal {
    rx: mpsc::UnboundedReceiver<()>,
}

impl IdleSignal {
    /// Resolves when the idle timer fires. Never resolves if every manager
    /// handle was dropped first.
    pub async fn fired(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    /// Non-blocking check.
    pub fn try_fired(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

impl ConnectionsManager {
    /// Create an empty manager. The idle timer starts immediately, so this
    /// must be called from within a tokio runtime.
    pub fn new(max_clients: usize, shutdown_delay: Option<Duration>) -> (Self, IdleSignal) {
        let (idle_tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            registry: Arc::new(Mutex::new(Registry {
                connections: HashMap::new(),
                idle_timer: None,
                generation: 0,
            })),
            max_clients,
            shutdown_delay,
            idle_tx,
        };
        {
            let mut registry = manager.lock();
            manager.arm_idle_timer(&mut registry);
        }
        (manager, IdleSignal { rx })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Admit `connection` under `id`.
    ///
    /// Returns `false` without side effects when at capacity or when `id` is
    /// already registered.
    pub fn try_add(&self, id: &str, connection: Arc<ProxyConnection>) -> bool {
        let mut registry = self.lock();
        if registry.connections.len() >= self.max_clients {
            warn!(id, max = self.max_clients, "tunnel rejected: at capacity");
            return false;
        }
        if registry.connections.contains_key(id) {
            warn!(id, "tunnel rejected: id already registered");
            return false;
        }
        registry.connections.insert(id.to_string(), connection);
        Self::cancel_idle_timer(&mut registry);
        info!(id, active = registry.connections.len(), "tunnel admitted");
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxyConnection>> {
        self.lock().connections.get(id).cloned()
    }

    /// Drop `id`; arms the idle timer when the registry becomes empty.
    pub fn remove(&self, id: &str) {
        let mut registry = self.lock();
        if registry.connections.remove(id).is_none() {
            return;
        }
        info!(id, active = registry.connections.len(), "tunnel removed");
        if registry.connections.is_empty() {
            self.arm_idle_timer(&mut registry);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a normal closure on every live tunnel.
    pub async fn close_all(&self) {
        let connections: Vec<Arc<ProxyConnection>> =
            self.lock().connections.values().cloned().collect();
        for conn in connections {
            if let Err(e) = conn.close().await {
                warn!(id = %conn.id(), "close on shutdown failed: {e}");
            }
        }
    }

    fn arm_idle_timer(&self, registry: &mut Registry) {
        let Some(delay) = self.shutdown_delay else {
            return;
        };
        Self::cancel_idle_timer(registry);
        let generation = registry.generation;
        let shared = Arc::clone(&self.registry);
        let idle_tx = self.idle_tx.clone();
        registry.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut registry = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if registry.generation != generation || !registry.connections.is_empty() {
                return;
            }
            registry.idle_timer = None;
            info!(delay_secs = delay.as_secs(), "idle timer fired");
            let _ = idle_tx.send(());
        }));
        debug!(delay_secs = delay.as_secs(), "idle timer armed");
    }

    fn cancel_idle_timer(registry: &mut Registry) {
        registry.generation += 1;
        if let Some(timer) = registry.idle_timer.take() {
            timer.abort();
            debug!("idle timer cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::transport_pair;
    use crate::transport::Frame;
    use crate::tunnel::connection::HandoverTimeouts;
    use tokio::time::timeout;

    fn conn(id: &str) -> Arc<ProxyConnection> {
        Arc::new(ProxyConnection::server(id, HandoverTimeouts::default()))
    }

    #[tokio::test]
    async fn test_capacity() {
        let (manager, _idle) = ConnectionsManager::new(2, None);
        assert!(manager.try_add("a", conn("a")));
        assert!(manager.try_add("b", conn("b")));
        assert!(!manager.try_add("c", conn("c")));
        assert_eq!(manager.len(), 2);
        assert!(manager.get("a").is_some());
        assert!(manager.get("c").is_none());

        manager.remove("a");
        assert!(manager.try_add("c", conn("c")));
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (manager, _idle) = ConnectionsManager::new(4, None);
        assert!(manager.try_add("same", conn("same")));
        assert!(!manager.try_add("same", conn("same")));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_respect_bound() {
        let (manager, _idle) = ConnectionsManager::new(5, None);
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let id = format!("conn-{i}");
                    manager.try_add(&id, conn(&id))
                })
            })
            .collect();
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(manager.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_fires_once() {
        let (_manager, mut idle) = ConnectionsManager::new(2, Some(Duration::from_secs(10)));
        assert!(timeout(Duration::from_secs(9), idle.fired()).await.is_err());
        assert!(timeout(Duration::from_secs(2), idle.fired()).await.is_ok());
        assert!(timeout(Duration::from_secs(100), idle.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_suppresses_idle_timer() {
        let (manager, mut idle) = ConnectionsManager::new(2, Some(Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(manager.try_add("a", conn("a")));
        assert!(timeout(Duration::from_secs(60), idle.fired()).await.is_err());
        assert!(!idle.try_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_rearms_fresh_timer() {
        let (manager, mut idle) = ConnectionsManager::new(2, Some(Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(manager.try_add("a", conn("a")));
        tokio::time::sleep(Duration::from_secs(3)).await;
        manager.remove("a");

        // Armed at t=8s: nothing at the original t=10s deadline.
        assert!(timeout(Duration::from_secs(9), idle.fired()).await.is_err());
        assert!(timeout(Duration::from_secs(2), idle.fired()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_of_one_keeps_timer_off() {
        let (manager, mut idle) = ConnectionsManager::new(2, Some(Duration::from_secs(10)));
        assert!(manager.try_add("a", conn("a")));
        assert!(manager.try_add("b", conn("b")));
        manager.remove("a");
        assert!(timeout(Duration::from_secs(60), idle.fired()).await.is_err());
        manager.remove("missing");
        assert!(timeout(Duration::from_secs(60), idle.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_shutdown_disabled() {
        let (_manager, mut idle) = ConnectionsManager::new(2, None);
        assert!(timeout(Duration::from_secs(3600), idle.fired()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_sends_normal_closure() {
        let (manager, _idle) = ConnectionsManager::new(2, None);
        let (client, server) = transport_pair().await;
        let c = conn("live");
        c.accept(server);
        assert!(manager.try_add("live", c));

        manager.close_all().await;
        match client.recv().await.unwrap() {
            Frame::Close(Some(reason)) => assert!(reason.is_normal()),
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
