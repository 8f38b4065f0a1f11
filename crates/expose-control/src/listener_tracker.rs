//! Tracks public listener tasks for a session
//!
//! One accept loop runs per leased port. Unregistering aborts the loop and waits
//! for it so the listening socket is closed before the port is handed back.

use std::collections::HashMap;
use tokio::task::JoinHandle;

/// Accept-loop tasks keyed by public port
#[derive(Default)]
pub struct ListenerTracker {
    tasks: HashMap<u16, JoinHandle<()>>,
}

impl ListenerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the accept loop for a port
    pub fn register(&mut self, port: u16, handle: JoinHandle<()>) {
        // If there was a previous task, abort it first
        if let Some(old_handle) = self.tasks.insert(port, handle) {
            old_handle.abort();
        }
    }

    /// Abort the accept loop for a port and wait until its listener is dropped
    pub async fn unregister(&mut self, port: u16) -> bool {
        match self.tasks.remove(&port) {
            Some(handle) => {
                handle.abort();
                let _ = handle.await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> JoinHandle<()> {
        tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await })
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let mut tracker = ListenerTracker::new();
        tracker.register(4456, sleeper());

        assert!(tracker.unregister(4456).await);
        assert!(!tracker.unregister(4456).await);
    }

    #[tokio::test]
    async fn test_replacing_task_aborts_previous() {
        let mut tracker = ListenerTracker::new();
        let (guard, dropped) = tokio::sync::oneshot::channel::<()>();
        tracker.register(
            4456,
            tokio::spawn(async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(10)).await;
            }),
        );
        tracker.register(4456, sleeper());

        // The first task's future is dropped once the abort lands
        assert!(dropped.await.is_err());
        assert!(tracker.unregister(4456).await);
        assert!(!tracker.unregister(4456).await);
    }

    #[tokio::test]
    async fn test_unregister_closes_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut tracker = ListenerTracker::new();
        tracker.register(
            addr.port(),
            tokio::spawn(async move {
                loop {
                    let _ = listener.accept().await;
                }
            }),
        );

        tracker.unregister(addr.port()).await;
        assert!(tokio::net::TcpListener::bind(addr).await.is_ok());
    }
}
