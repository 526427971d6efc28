//! Notification classification
//!
//! Unsolicited notifications from a terminus fall into three groups: pollable
//! message-poll events (queued at alarm priority), RAS sensor events whose
//! reading names a pollable record (queued at overflow priority), and the
//! management-channel state sensor, which is consumed inline rather than
//! queued because it gates the channel lifecycle itself.

use std::sync::Arc;

use termlink_proto::{EventId, Notification, EVENT_ID_INVALID, EVENT_ID_NONE};

use crate::queues::Priority;

/// Sensor id carrying management-channel lifecycle transitions
pub const CHANNEL_STATE_SENSOR: u16 = 175;

/// Inclusive sensor-id window reserved for RAS error records
pub const RAS_SENSOR_FIRST: u16 = 191;
pub const RAS_SENSOR_LAST: u16 = 198;

/// Decoded reading of the channel-state sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    /// Lifecycle phase in the low byte
    pub phase: u8,
    /// Outcome status in the next byte, nonzero on failure
    pub status: u8,
}

impl ChannelState {
    pub fn from_reading(reading: u32) -> Self {
        Self {
            phase: (reading & 0xFF) as u8,
            status: ((reading >> 8) & 0xFF) as u8,
        }
    }

    /// The terminus is about to restart its management channel
    pub fn update_initiated(&self) -> bool {
        self.phase == 0x01
    }

    /// The channel restart finished; `status` says how
    pub fn update_complete(&self) -> bool {
        self.phase == 0x02
    }
}

/// Side effects of channel-state transitions, supplied by the embedding
/// application.
pub trait LifecycleHooks: Send + Sync {
    /// Stop issuing non-essential requests until the channel comes back.
    fn enter_quiescent_mode(&self);

    /// Channel restart completed with a nonzero status.
    fn notify_failure(&self, status: u8);
}

/// Maps a notification to the queue tier it belongs in, or consumes it
/// inline when it is a channel-state transition.
pub struct Classifier {
    hooks: Option<Arc<dyn LifecycleHooks>>,
}

impl Classifier {
    pub fn new() -> Self {
        Self { hooks: None }
    }

    pub fn with_hooks(hooks: Arc<dyn LifecycleHooks>) -> Self {
        Self { hooks: Some(hooks) }
    }

    /// Classify one notification. `Some((priority, id))` means the caller
    /// should queue `id` for polling; `None` means the notification was
    /// consumed (or discarded) here.
    pub fn classify(&self, notification: &Notification) -> Option<(Priority, EventId)> {
        match notification {
            Notification::MessagePoll { tid, event_id, .. } => {
                if !pollable_id(*event_id) {
                    tracing::debug!(
                        tid,
                        event_id = format_args!("{event_id:#x}"),
                        "message-poll notification with sentinel id ignored"
                    );
                    return None;
                }
                Some((Priority::Alarm, *event_id))
            }
            Notification::NumericSensor {
                tid,
                sensor_id,
                event_state,
                present_reading,
                ..
            } => {
                if *sensor_id == CHANNEL_STATE_SENSOR {
                    self.channel_transition(*tid, ChannelState::from_reading(*present_reading));
                    return None;
                }
                if (RAS_SENSOR_FIRST..=RAS_SENSOR_LAST).contains(sensor_id) {
                    // the reading's low half names the record to pull
                    let event_id = (*present_reading & 0xFFFF) as EventId;
                    if !pollable_id(event_id) {
                        tracing::debug!(
                            tid,
                            sensor_id,
                            "RAS sensor fired without a pollable record id"
                        );
                        return None;
                    }
                    return Some((Priority::Overflow, event_id));
                }
                tracing::debug!(
                    tid,
                    sensor_id,
                    event_state,
                    "sensor event outside managed windows ignored"
                );
                None
            }
        }
    }

    fn channel_transition(&self, tid: u8, state: ChannelState) {
        let Some(hooks) = &self.hooks else {
            tracing::debug!(tid, ?state, "channel-state transition with no hooks installed");
            return;
        };
        if state.update_initiated() {
            tracing::info!(tid, "management channel restarting, entering quiescent mode");
            hooks.enter_quiescent_mode();
        } else if state.update_complete() {
            if state.status == 0 {
                tracing::info!(tid, "management channel restart complete");
            } else {
                tracing::warn!(tid, status = state.status, "management channel restart failed");
                hooks.notify_failure(state.status);
            }
        } else {
            tracing::debug!(tid, phase = state.phase, "unrecognized channel-state phase");
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

fn pollable_id(id: EventId) -> bool {
    id != EVENT_ID_NONE && id != EVENT_ID_INVALID
}
