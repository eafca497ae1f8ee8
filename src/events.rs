//! Lead event bus: in-process broadcast of lead lifecycle events.
//!
//! Delivery is at-most-once: a subscriber that falls behind loses events and
//! is told so through `RecvError::Lagged`. Firings never depend on this bus;
//! intake and status changes write them in the same transaction as the lead.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;
use uuid::Uuid;

use crate::automation::firing::LeadSnapshot;
use crate::automation::rule::Channel;
use crate::leads::model::LeadStatus;

/// Default broadcast channel capacity.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Events published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeadEvent {
    /// A lead was stored for the first time.
    LeadReceived {
        tenant_id: Uuid,
        lead_id: Uuid,
        occurred_at: DateTime<Utc>,
        lead: LeadSnapshot,
    },
    /// A lead moved between pipeline statuses.
    LeadStatusChanged {
        tenant_id: Uuid,
        lead_id: Uuid,
        from: LeadStatus,
        to: LeadStatus,
        occurred_at: DateTime<Utc>,
        lead: LeadSnapshot,
    },
    /// A scheduled firing ended in `Failed`.
    FiringFailed {
        tenant_id: Uuid,
        firing_id: Uuid,
        automation_id: Uuid,
        lead_id: Uuid,
        channel: Channel,
        attempt_count: u32,
        error: String,
        occurred_at: DateTime<Utc>,
    },
}

impl LeadEvent {
    pub fn tenant_id(&self) -> Uuid {
        match self {
            LeadEvent::LeadReceived { tenant_id, .. }
            | LeadEvent::LeadStatusChanged { tenant_id, .. }
            | LeadEvent::FiringFailed { tenant_id, .. } => *tenant_id,
        }
    }

}

/// Broadcast bus shared by intake, the lead service, the dispatcher, and feeds.
pub struct EventBus {
    tx: broadcast::Sender<LeadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Arc::new(Self { tx })
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: LeadEvent) -> usize {
        let tenant_id = event.tenant_id();
        // No receivers is fine; the feed is best-effort.
        match self.tx.send(event) {
            Ok(n) => {
                debug!(%tenant_id, receivers = n, "Lead event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to a single tenant's events.
    pub fn subscribe_tenant(&self, tenant_id: Uuid) -> TenantSubscription {
        TenantSubscription {
            tenant_id,
            rx: self.tx.subscribe(),
        }
    }
}

/// A receiver filtered to one tenant.
pub struct TenantSubscription {
    tenant_id: Uuid,
    rx: broadcast::Receiver<LeadEvent>,
}

impl TenantSubscription {
    /// Next event for this tenant.
    ///
    /// `Lagged` means events were dropped and the consumer should resync.
    pub async fn recv(&mut self) -> Result<LeadEvent, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if event.tenant_id() == self.tenant_id {
                return Ok(event);
            }
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }
}
