use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

use super::{ChangeEvent, ChangeKind, KvStore, keys};

/// Key families with a dedicated consumer task. Events within one route are
/// handled strictly in arrival order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeRoute {
    /// Object, registry and image scan state.
    ScanState,
    RegistryConfig,
    ScanConfig,
    Profile,
    Scanner,
}

impl ChangeRoute {
    pub const ALL: [ChangeRoute; 5] = [
        ChangeRoute::ScanState,
        ChangeRoute::RegistryConfig,
        ChangeRoute::ScanConfig,
        ChangeRoute::Profile,
        ChangeRoute::Scanner,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            ChangeRoute::ScanState => keys::SCAN_STATE_PREFIX,
            ChangeRoute::RegistryConfig => keys::REGISTRY_CONFIG_PREFIX,
            ChangeRoute::ScanConfig => keys::SCAN_CONFIG_KEY,
            ChangeRoute::Profile => keys::PROFILE_PREFIX,
            ChangeRoute::Scanner => keys::SCANNER_PREFIX,
        }
    }

    /// Route for a key, or `None` for keys nobody watches (scan reports).
    pub fn for_key(key: &str) -> Option<ChangeRoute> {
        Self::ALL
            .into_iter()
            .find(|route| key.starts_with(route.prefix()))
    }

    fn index(&self) -> usize {
        match self {
            ChangeRoute::ScanState => 0,
            ChangeRoute::RegistryConfig => 1,
            ChangeRoute::ScanConfig => 2,
            ChangeRoute::Profile => 3,
            ChangeRoute::Scanner => 4,
        }
    }
}

impl fmt::Display for ChangeRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle_change(&self, route: ChangeRoute, event: ChangeEvent);
}

/// Fans store notifications out to one bounded channel per [`ChangeRoute`].
///
/// The store subscription is taken at construction so that events racing
/// with an initial load are not lost. When the subscription lags, every
/// route is replayed from a store snapshot as `Modify` events.
pub struct ChangeDispatcher {
    kv: Arc<dyn KvStore>,
    events: BroadcastStream<ChangeEvent>,
    route_capacity: usize,
}

impl fmt::Debug for ChangeDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeDispatcher")
            .field("route_capacity", &self.route_capacity)
            .finish()
    }
}

impl ChangeDispatcher {
    pub fn new(kv: Arc<dyn KvStore>, route_capacity: usize) -> Self {
        Self {
            events: BroadcastStream::new(kv.subscribe()),
            kv,
            route_capacity: route_capacity.max(1),
        }
    }

    pub fn spawn(
        self,
        handler: Arc<dyn ChangeHandler>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(ChangeRoute::ALL.len() + 1);
        let mut senders = Vec::with_capacity(ChangeRoute::ALL.len());

        for route in ChangeRoute::ALL {
            let (tx, mut rx) = mpsc::channel::<ChangeEvent>(self.route_capacity);
            senders.push(tx);
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = rx.recv() => match next {
                            Some(event) => handler.handle_change(route, event).await,
                            None => break,
                        }
                    }
                }
                tracing::debug!(target: "scan::watch", %route, "change consumer stopped");
            }));
        }

        let mut events = self.events;
        let kv = self.kv;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(target: "scan::watch", "change router shutting down");
                        break;
                    }
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            let Some(route) = ChangeRoute::for_key(&event.key) else {
                                continue;
                            };
                            if senders[route.index()].send(event).await.is_err() {
                                tracing::warn!(target: "scan::watch", %route, "change consumer gone");
                            }
                        }
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            tracing::warn!(target: "scan::watch", "change router lagged, skipped {skipped} events");
                            resync(kv.as_ref(), &senders).await;
                        }
                        None => break,
                    }
                }
            }
        }));

        handles
    }
}

/// Re-deliver the current value of every watched key. Deletions missed
/// during the lag are not recovered.
async fn resync(kv: &dyn KvStore, senders: &[mpsc::Sender<ChangeEvent>]) {
    for route in ChangeRoute::ALL {
        let entries = match kv.list_prefix(route.prefix()).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(target: "scan::watch", %route, error = %err, "failed to list keys for resync");
                continue;
            }
        };
        let mut replayed = 0;
        for (key, value) in entries {
            if ChangeRoute::for_key(&key) != Some(route) {
                continue;
            }
            let event = ChangeEvent {
                kind: ChangeKind::Modify,
                key,
                value: Some(value),
                revision: 0,
            };
            if senders[route.index()].send(event).await.is_err() {
                tracing::warn!(target: "scan::watch", %route, "change consumer gone");
                break;
            }
            replayed += 1;
        }
        tracing::info!(target: "scan::watch", %route, replayed, "route resynced");
    }
}
