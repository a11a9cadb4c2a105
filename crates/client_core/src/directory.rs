use std::collections::HashMap;

use shared::domain::UserId;
use tokio::sync::RwLock;
use tracing::warn;

use crate::{gateway::StoreGateway, synchronizer::SenderIdentity, ViewerSession};

/// Cache of sender display identities, filled from profile lookups.
pub struct SenderDirectory {
    entries: RwLock<HashMap<UserId, SenderIdentity>>,
    fallback_name: String,
}

impl SenderDirectory {
    pub fn new(fallback_name: impl Into<String>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fallback_name: fallback_name.into(),
        }
    }

    pub fn fallback(&self) -> SenderIdentity {
        SenderIdentity {
            display_name: self.fallback_name.clone(),
            photo_url: None,
        }
    }

    /// Looks up every id not cached yet in one batch. Failures are logged and
    /// leave those ids unresolved.
    pub async fn prefetch(
        &self,
        gateway: &dyn StoreGateway,
        session: &ViewerSession,
        user_ids: &[UserId],
    ) {
        let missing = {
            let entries = self.entries.read().await;
            user_ids
                .iter()
                .filter(|id| **id != session.viewer_id && !entries.contains_key(*id))
                .cloned()
                .collect::<Vec<_>>()
        };
        if missing.is_empty() {
            return;
        }

        match gateway.fetch_profiles(&missing).await {
            Ok(profiles) => {
                let mut entries = self.entries.write().await;
                for profile in profiles {
                    entries.insert(
                        profile.user_id,
                        SenderIdentity {
                            display_name: profile.display_name,
                            photo_url: profile.photo_url,
                        },
                    );
                }
            }
            Err(err) => {
                warn!(
                    count = missing.len(),
                    "directory: profile lookup failed: {err}"
                );
            }
        }
    }

    /// The viewer's own messages always use the session identity; everyone
    /// else falls back to a generic name when no profile is available.
    pub async fn resolve(
        &self,
        gateway: &dyn StoreGateway,
        session: &ViewerSession,
        user_id: &UserId,
    ) -> SenderIdentity {
        if *user_id != session.viewer_id && !self.entries.read().await.contains_key(user_id) {
            self.prefetch(gateway, session, std::slice::from_ref(user_id))
                .await;
        }
        self.resolve_cached(session, user_id).await
    }

    /// Like [`resolve`](Self::resolve) but never performs a lookup.
    pub async fn resolve_cached(&self, session: &ViewerSession, user_id: &UserId) -> SenderIdentity {
        if *user_id == session.viewer_id {
            return session.identity();
        }
        self.entries
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.fallback())
    }
}
