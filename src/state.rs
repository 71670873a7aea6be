//! Threadsafe service state with broadcast wakeups.
//!
//! The cell does not validate transitions; the lifecycle record is the
//! sole mutator per service and keeps the discipline. The contract here
//! is only "wake all waiters whenever the state changes".

use tokio::sync::watch;

/// Externally visible lifecycle states of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Started => "started",
            ServiceState::Stopping => "stopping",
            ServiceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One state value plus a broadcast channel notifying every waiter on
/// each change.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ServiceState>,
}

impl StateCell {
    pub fn new(initial: ServiceState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Snapshot read.
    pub fn get(&self) -> ServiceState {
        *self.tx.borrow()
    }

    /// Assign and wake all waiters.
    pub fn set(&self, new_state: ServiceState) {
        self.tx.send_replace(new_state);
    }

    /// Transition `from -> to` only if the current state is `from`.
    /// Returns whether the transition happened. Waiters are woken only
    /// on an actual change.
    pub fn set_if(&self, from: ServiceState, to: ServiceState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Block while the state equals `state`; returns the state observed
    /// after leaving it.
    pub async fn wait_till_not(&self, state: ServiceState) -> ServiceState {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while
        // we are borrowed from it.
        let observed = rx
            .wait_for(|current| *current != state)
            .await
            .expect("state cell sender dropped while waiting");
        *observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn get_and_set_roundtrip() {
        let cell = StateCell::new(ServiceState::Stopped);
        assert_eq!(cell.get(), ServiceState::Stopped);
        cell.set(ServiceState::Starting);
        assert_eq!(cell.get(), ServiceState::Starting);
    }

    #[tokio::test]
    async fn set_if_only_fires_from_expected_state() {
        let cell = StateCell::new(ServiceState::Starting);
        assert!(cell.set_if(ServiceState::Starting, ServiceState::Started));
        assert_eq!(cell.get(), ServiceState::Started);
        assert!(!cell.set_if(ServiceState::Starting, ServiceState::Error));
        assert_eq!(cell.get(), ServiceState::Started);
    }

    #[tokio::test]
    async fn wait_till_not_returns_immediately_on_other_state() {
        let cell = StateCell::new(ServiceState::Started);
        let observed = cell.wait_till_not(ServiceState::Starting).await;
        assert_eq!(observed, ServiceState::Started);
    }

    #[tokio::test]
    async fn wait_till_not_wakes_all_waiters() {
        let cell = Arc::new(StateCell::new(ServiceState::Starting));
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            waiters.push(tokio::spawn(async move {
                cell.wait_till_not(ServiceState::Starting).await
            }));
        }
        // Give the waiters a chance to park before the transition.
        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.set(ServiceState::Started);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), ServiceState::Started);
        }
    }
}
