// Per-subject deployment slots
//
// A subject has one preview identity (container, network, URL) that both the
// preview step and every loop redeploy write to. Deploys for the same subject
// are serialized behind an async mutex; different subjects never wait on
// each other.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use devloop_core::{CollaboratorError, PreviewDeployer, PreviewDeployment};

/// [`PreviewDeployer`] wrapper that serializes deploys per subject
pub struct SlottedDeployer {
    inner: Arc<dyn PreviewDeployer>,
    slots: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl SlottedDeployer {
    pub fn new(inner: Arc<dyn PreviewDeployer>) -> Self {
        Self {
            inner,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, subject_id: Uuid) -> Arc<Mutex<()>> {
        self.slots
            .entry(subject_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn lease(&self, subject_id: Uuid) -> SlotLease<'_> {
        SlotLease {
            slots: &self.slots,
            subject_id,
            slot: self.slot(subject_id),
        }
    }

    /// Number of subjects with a deploy in flight or waiting
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Holds a subject's slot; removes it from the map when the last holder or
/// waiter lets go, including when the deploy future is dropped
struct SlotLease<'a> {
    slots: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    subject_id: Uuid,
    slot: Arc<Mutex<()>>,
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        let slot = &self.slot;
        self.slots.remove_if(&self.subject_id, |_, held| {
            Arc::ptr_eq(held, slot) && Arc::strong_count(held) == 2
        });
    }
}

#[async_trait]
impl PreviewDeployer for SlottedDeployer {
    async fn deploy(
        &self,
        subject_id: Uuid,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PreviewDeployment, CollaboratorError> {
        let lease = self.lease(subject_id);
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
            guard = lease.slot.lock() => guard,
        };
        debug!(%subject_id, "acquired deployment slot");
        self.inner.deploy(subject_id, owner_id, cancel).await
    }

    async fn latest_deployment(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<PreviewDeployment>, CollaboratorError> {
        self.inner.latest_deployment(subject_id, cancel).await
    }
}
