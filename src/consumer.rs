//! Lifecycle event consumer
//!
//! Tails the container lifecycle topic under a named consumer group and
//! mirrors each normalized status fact into the record store. Delivery is
//! at-least-once, so every apply must tolerate replays: a status already
//! recorded is a same-state no-op, and a stale fact that would regress the
//! state machine is skipped. Entries are acknowledged only after the store
//! accepted (or deliberately skipped) them; a crash before the ack means
//! redelivery on the next start.

use crate::lifecycle::{DeploymentStatus, ProjectType};
use crate::orchestrator::KIND_CONTAINER_STATE_CHANGED;
use crate::records::{RecordStore, StoreError};
use crate::stream::{EventStream, StreamEntry, TOPIC_CONTAINER_LIFECYCLE};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consumer group name for the record-store mirror
pub const GROUP_STATUS_MIRROR: &str = "status-mirror";

/// What the consumer did with one delivered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    /// Stored (or same-state replay); safe to acknowledge
    Ok,
    /// Malformed or stale; acknowledged and dropped
    Skipped,
    /// Store failure; leave unacknowledged for redelivery
    Retry,
}

fn apply_entry(store: &RecordStore, entry: &StreamEntry) -> Applied {
    let event = &entry.event;
    if event.kind != KIND_CONTAINER_STATE_CHANGED {
        debug!(kind = %event.kind, "Ignoring non-lifecycle event");
        return Applied::Skipped;
    }

    let Some(status) = event.field("status").and_then(|s| DeploymentStatus::from_str(s).ok())
    else {
        warn!(id = entry.id, "Lifecycle event without a parseable status");
        return Applied::Skipped;
    };
    let Some(project_type) = event
        .field("project_type")
        .and_then(|s| ProjectType::from_str(s).ok())
    else {
        warn!(id = entry.id, "Lifecycle event without a parseable project type");
        return Applied::Skipped;
    };

    match store.apply_status(&event.project_id, &event.deployment_id, project_type, status) {
        Ok(_) => {
            debug!(
                project_id = %event.project_id,
                deployment_id = %event.deployment_id,
                status = %status,
                "Lifecycle fact mirrored"
            );
            Applied::Ok
        }
        Err(StoreError::IllegalTransition { current, reported }) => {
            // Replayed or reordered fact; the store already moved past it
            debug!(
                deployment_id = %event.deployment_id,
                current = %current,
                reported = %reported,
                "Skipping stale lifecycle fact"
            );
            Applied::Skipped
        }
        Err(e) => {
            error!(error = %e, id = entry.id, "Failed to mirror lifecycle fact");
            Applied::Retry
        }
    }
}

/// Run the status-mirror consumer until shutdown
pub async fn run_status_consumer(
    stream: Arc<EventStream>,
    store: Arc<RecordStore>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reader = stream.reader(TOPIC_CONTAINER_LIFECYCLE, GROUP_STATUS_MIRROR);
    info!(group = GROUP_STATUS_MIRROR, "Lifecycle consumer started");

    loop {
        let entry = tokio::select! {
            entry = reader.next() => entry,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Lifecycle consumer shutting down");
                    return;
                }
                continue;
            }
        };

        match apply_entry(&store, &entry) {
            Applied::Ok | Applied::Skipped => reader.ack(entry.id),
            Applied::Retry => {
                // Back off briefly; the entry stays pending and is
                // redelivered after restart
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        }
    }
}
