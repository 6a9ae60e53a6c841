//! Output boundary: robot-frame poses published once per cycle.

use std::time::Duration;

use crossbeam::channel::Sender;
use nalgebra::UnitQuaternion;
use robot_tracker_core::{Pt3, TargetId};
use serde::{Deserialize, Serialize};

/// Filtered pose of one Confirmed target in the robot frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseUpdate {
    pub target_id: TargetId,
    /// Metres.
    pub position: Pt3,
    pub orientation: UnitQuaternion<f64>,
    /// One-sigma position uncertainty, metres.
    pub uncertainty: f64,
    pub cycle_timestamp: Duration,
    /// Lifted through a stale calibration.
    pub degraded: bool,
}

/// The consumer went away.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("pose consumer disconnected")]
pub struct SinkClosed;

/// Downstream consumer of pose updates.
pub trait PoseSink {
    fn publish(&mut self, update: PoseUpdate) -> Result<(), SinkClosed>;
}

impl<S: PoseSink + ?Sized> PoseSink for Box<S> {
    fn publish(&mut self, update: PoseUpdate) -> Result<(), SinkClosed> {
        (**self).publish(update)
    }
}

/// Forwards updates into a crossbeam channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: Sender<PoseUpdate>,
}

impl ChannelSink {
    pub fn new(tx: Sender<PoseUpdate>) -> Self {
        Self { tx }
    }
}

impl PoseSink for ChannelSink {
    fn publish(&mut self, update: PoseUpdate) -> Result<(), SinkClosed> {
        self.tx.send(update).map_err(|_| SinkClosed)
    }
}

/// Collects every update in memory.
#[derive(Clone, Debug, Default)]
pub struct VecSink {
    pub updates: Vec<PoseUpdate>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, target: TargetId) -> Option<&PoseUpdate> {
        self.updates.iter().rev().find(|u| u.target_id == target)
    }
}

impl PoseSink for VecSink {
    fn publish(&mut self, update: PoseUpdate) -> Result<(), SinkClosed> {
        self.updates.push(update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn update(id: u32, x: f64) -> PoseUpdate {
        PoseUpdate {
            target_id: TargetId(id),
            position: Pt3::new(x, 0.0, 0.0),
            orientation: UnitQuaternion::identity(),
            uncertainty: 0.001,
            cycle_timestamp: Duration::from_millis(33),
            degraded: false,
        }
    }

    #[test]
    fn channel_sink_reports_a_closed_consumer() {
        let (tx, rx) = channel::unbounded();
        let mut sink = ChannelSink::new(tx);
        sink.publish(update(1, 0.0)).expect("open");
        assert_eq!(rx.try_recv().map(|u| u.target_id), Ok(TargetId(1)));
        drop(rx);
        assert_eq!(sink.publish(update(1, 0.0)), Err(SinkClosed));
    }

    #[test]
    fn vec_sink_finds_the_latest_update_per_target() {
        let mut sink = VecSink::new();
        for (id, x) in [(1, 0.0), (2, 5.0), (1, 1.0)] {
            sink.publish(update(id, x)).expect("vec sink never closes");
        }
        assert_eq!(sink.latest(TargetId(1)).map(|u| u.position.x), Some(1.0));
        assert!(sink.latest(TargetId(9)).is_none());
    }

    #[test]
    fn pose_update_serializes() {
        let json = serde_json::to_string(&update(3, 0.25)).expect("json");
        let back: PoseUpdate = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, update(3, 0.25));
    }
}
