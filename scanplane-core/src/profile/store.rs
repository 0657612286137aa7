use std::fmt;
use std::sync::Arc;

use scanplane_model::{DEFAULT_PROFILE_NAME, VulnerabilityProfile};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::VulnerabilityProfileFilter;

/// Holds the compiled default profile and the token of the refresh pass
/// currently re-filtering cached results with it.
#[derive(Clone)]
pub struct ProfileStore {
    inner: Arc<RwLock<ProfileState>>,
}

struct ProfileState {
    filter: Arc<VulnerabilityProfileFilter>,
    refresh: CancellationToken,
}

impl fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ProfileStore");
        match self.inner.try_read() {
            Ok(state) => debug.field("filter", &state.filter),
            Err(_) => debug.field("filter", &"<locked>"),
        };
        debug.finish()
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ProfileState {
                filter: Arc::new(VulnerabilityProfileFilter::empty()),
                refresh: CancellationToken::new(),
            })),
        }
    }

    pub async fn current(&self) -> Arc<VulnerabilityProfileFilter> {
        Arc::clone(&self.inner.read().await.filter)
    }

    /// Install a new profile. Returns `None` for profiles other than the
    /// default one; otherwise the new filter and a token for its refresh
    /// pass. Any older refresh is cancelled.
    pub async fn update(
        &self,
        profile: &VulnerabilityProfile,
    ) -> Result<Option<(Arc<VulnerabilityProfileFilter>, CancellationToken)>> {
        if profile.name != DEFAULT_PROFILE_NAME {
            tracing::debug!(target: "scan::profile", name = %profile.name, "ignoring non-default profile");
            return Ok(None);
        }
        let filter = Arc::new(VulnerabilityProfileFilter::compile(profile)?);
        Ok(Some(self.install(filter).await))
    }

    /// Fall back to an empty profile.
    pub async fn reset(&self) -> (Arc<VulnerabilityProfileFilter>, CancellationToken) {
        self.install(Arc::new(VulnerabilityProfileFilter::compile(
            &VulnerabilityProfile::new(DEFAULT_PROFILE_NAME, Vec::new()),
        )
        .unwrap_or_default()))
        .await
    }

    async fn install(
        &self,
        filter: Arc<VulnerabilityProfileFilter>,
    ) -> (Arc<VulnerabilityProfileFilter>, CancellationToken) {
        let mut state = self.inner.write().await;
        state.refresh.cancel();
        state.refresh = CancellationToken::new();
        state.filter = Arc::clone(&filter);
        tracing::info!(
            target: "scan::profile",
            name = filter.name(),
            entries = filter.entry_count(),
            "vulnerability profile updated"
        );
        (filter, state.refresh.clone())
    }
}
