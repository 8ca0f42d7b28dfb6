//! Event bus seam.
//!
//! Inbound events the collector reacts to are [`CollectorEvent`] values; the
//! collector announces progress through [`Notification`] values handed to an
//! [`EventSink`]. Both carry the canonical topic string used by the host
//! application's bus.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::collector::action::ActionLabel;
use crate::collector::split::Split;

/// Translational control input. A `label` marks an explicit event; `None`
/// selects the legacy magnitude classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveCommand {
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,
    pub label: Option<ActionLabel>,
}

/// Yaw control input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotateCommand {
    pub delta: f32,
    pub label: Option<ActionLabel>,
}

/// Events consumed by the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorEvent {
    SceneCreated,
    SceneCleared,
    /// One simulation frame.
    Tick,
    Move(MoveCommand),
    Rotate(RotateCommand),
    /// Relocate the dataset root.
    DirectoryChanged { root: PathBuf },
    ConfigChanged { verbose: bool },
}

impl CollectorEvent {
    /// Returns the bus topic this event is delivered on.
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::SceneCreated => "scene/creation/completed",
            Self::SceneCleared => "scene/cleared",
            Self::Tick => "simulation/frame",
            Self::Move(_) => "keyboard/move",
            Self::Rotate(_) => "keyboard/rotate",
            Self::DirectoryChanged { .. } => "dataset/dir/changed",
            Self::ConfigChanged { .. } => "config/updated",
        }
    }
}

/// Notifications published by the collector and its persistence worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    CaptureComplete {
        frame: u64,
        distance: f32,
        action: ActionLabel,
        direction: [f32; 3],
    },
    TargetLocated {
        frame: u64,
        distance: f32,
        direction: [f32; 3],
    },
    BatchSaved {
        batch_id: u64,
        split: Split,
        count: usize,
        total_saved: u64,
    },
    BatchError {
        error: String,
    },
    ConfigUpdated {
        root: PathBuf,
        verbose: bool,
    },
    SceneBatchesRemoved {
        removed: usize,
        counter: u64,
    },
}

impl Notification {
    /// Returns the bus topic this notification is published on.
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::CaptureComplete { .. } => "dataset/capture/complete",
            Self::TargetLocated { .. } => "victim/detected",
            Self::BatchSaved { .. } => "dataset/batch/saved",
            Self::BatchError { .. } => "dataset/batch/error",
            Self::ConfigUpdated { .. } => "dataset/config/updated",
            Self::SceneBatchesRemoved { .. } => "dataset/scene/batches_removed",
        }
    }
}

/// Destination for collector notifications.
///
/// Called from both the tick context and the persistence worker, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, notification: Notification);
}

/// Forwards notifications into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    /// Creates a sink together with the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, notification: Notification) {
        // A closed receiver means nobody is listening anymore.
        if self.tx.send(notification).is_err() {
            tracing::trace!("notification receiver closed");
        }
    }
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _notification: Notification) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topics() {
        assert_eq!(CollectorEvent::Tick.topic(), "simulation/frame");
        assert_eq!(
            CollectorEvent::SceneCreated.topic(),
            "scene/creation/completed"
        );
        assert_eq!(
            CollectorEvent::DirectoryChanged {
                root: PathBuf::from("/tmp/x")
            }
            .topic(),
            "dataset/dir/changed"
        );
    }

    #[test]
    fn test_notification_topics() {
        let saved = Notification::BatchSaved {
            batch_id: 1,
            split: Split::Train,
            count: 500,
            total_saved: 1,
        };
        assert_eq!(saved.topic(), "dataset/batch/saved");

        let located = Notification::TargetLocated {
            frame: 10,
            distance: 3.0,
            direction: [1.0, 0.0, 0.0],
        };
        assert_eq!(located.topic(), "victim/detected");
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish(Notification::BatchError {
            error: "first".to_string(),
        });
        sink.publish(Notification::BatchError {
            error: "second".to_string(),
        });

        assert_eq!(
            rx.recv().await,
            Some(Notification::BatchError {
                error: "first".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(Notification::BatchError {
                error: "second".to_string()
            })
        );
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.publish(Notification::BatchError {
            error: "dropped".to_string(),
        });
    }
}
