//! Frame sources and bounded-wait multi-camera acquisition.

use std::collections::{BTreeSet, VecDeque};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use robot_tracker_core::{CameraId, Frame};
use serde::{Deserialize, Serialize};

/// Recoverable acquisition failures. None of them stops the pipeline.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("{camera} did not deliver a frame within {timeout:?}")]
    Timeout { camera: CameraId, timeout: Duration },
    #[error("{camera} unavailable: {reason}")]
    Unavailable { camera: CameraId, reason: String },
    #[error("{camera} frame at {timestamp:?} is {offset:?} from the cycle reference")]
    Misaligned {
        camera: CameraId,
        timestamp: Duration,
        offset: Duration,
    },
    #[error("{camera} has no more frames")]
    Exhausted { camera: CameraId },
    #[error("{camera} capture worker is gone")]
    Disconnected { camera: CameraId },
    #[error("no camera delivered a usable frame")]
    NoFrames,
}

impl AcquisitionError {
    pub fn camera(&self) -> Option<CameraId> {
        match self {
            AcquisitionError::Timeout { camera, .. }
            | AcquisitionError::Unavailable { camera, .. }
            | AcquisitionError::Misaligned { camera, .. }
            | AcquisitionError::Exhausted { camera }
            | AcquisitionError::Disconnected { camera } => Some(*camera),
            AcquisitionError::NoFrames => None,
        }
    }
}

/// One camera backend.
///
/// Implementations wrap a driver and return frames stamped with the
/// pipeline's shared monotonic clock. `capture` may block; the acquirer calls
/// it from a dedicated thread.
pub trait FrameSource: Send {
    fn camera_id(&self) -> CameraId;

    fn capture(&mut self) -> Result<Frame, AcquisitionError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn camera_id(&self) -> CameraId {
        (**self).camera_id()
    }

    fn capture(&mut self) -> Result<Frame, AcquisitionError> {
        (**self).capture()
    }
}

/// Replays prerecorded frames of one camera, in order.
#[derive(Clone, Debug)]
pub struct ReplaySource {
    camera: CameraId,
    frames: VecDeque<Option<Frame>>,
    latency: Duration,
}

impl ReplaySource {
    pub fn new(camera: CameraId) -> Self {
        Self {
            camera,
            frames: VecDeque::new(),
            latency: Duration::ZERO,
        }
    }

    pub fn from_frames(camera: CameraId, frames: impl IntoIterator<Item = Frame>) -> Self {
        let mut source = Self::new(camera);
        for f in frames {
            source.push(f);
        }
        source
    }

    /// Block every capture for `latency`, as a slow camera would.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(Some(frame));
    }

    /// Queue one capture that reports the camera as unavailable.
    pub fn push_gap(&mut self) {
        self.frames.push_back(None);
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn camera_id(&self) -> CameraId {
        self.camera
    }

    fn capture(&mut self) -> Result<Frame, AcquisitionError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        match self.frames.pop_front() {
            Some(Some(frame)) => Ok(frame),
            Some(None) => Err(AcquisitionError::Unavailable {
                camera: self.camera,
                reason: "replay gap".into(),
            }),
            None => Err(AcquisitionError::Exhausted {
                camera: self.camera,
            }),
        }
    }
}

/// Acquisition timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionParams {
    /// Bounded wait for all cameras of one cycle, seconds.
    pub join_timeout_s: f64,
    /// Frames used in one cycle span at most this much, seconds.
    pub sync_tolerance_s: f64,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            join_timeout_s: 0.040,
            sync_tolerance_s: 0.005,
        }
    }
}

impl AcquisitionParams {
    pub fn join_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.join_timeout_s.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn sync_tolerance(&self) -> Duration {
        Duration::try_from_secs_f64(self.sync_tolerance_s.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Everything one acquisition round produced.
#[derive(Debug, Default)]
pub struct Acquisition {
    pub seq: u64,
    pub frames: Vec<Frame>,
    pub errors: Vec<AcquisitionError>,
}

impl Acquisition {
    /// Every requested camera reported end of stream.
    pub fn all_exhausted(&self) -> bool {
        self.frames.is_empty()
            && !self.errors.is_empty()
            && self
                .errors
                .iter()
                .all(|e| matches!(e, AcquisitionError::Exhausted { .. }))
    }
}

struct Reply {
    seq: u64,
    camera: CameraId,
    result: Result<Frame, AcquisitionError>,
}

struct Worker {
    camera: CameraId,
    requests: Sender<u64>,
    handle: JoinHandle<()>,
}

fn worker_loop(mut source: Box<dyn FrameSource>, requests: Receiver<u64>, replies: Sender<Reply>) {
    let camera = source.camera_id();
    for seq in requests.iter() {
        let result = source.capture();
        if replies.send(Reply { seq, camera, result }).is_err() {
            break;
        }
    }
    log::debug!("{camera}: capture worker stopped");
}

/// One capture thread per camera, joined per cycle with a shared deadline.
///
/// Each cycle sends a sequence-numbered request to every worker and collects
/// replies until all cameras answered or `join_timeout` elapsed. Cameras that
/// miss the deadline are absent for that cycle only; their late replies are
/// recognised by the stale sequence number and discarded.
pub struct MultiCameraAcquirer {
    workers: Vec<Worker>,
    replies: Receiver<Reply>,
    params: AcquisitionParams,
    seq: u64,
}

impl MultiCameraAcquirer {
    pub fn new(
        sources: Vec<Box<dyn FrameSource>>,
        params: AcquisitionParams,
    ) -> Result<Self, AcquisitionError> {
        let (reply_tx, replies) = channel::unbounded();
        let mut workers = Vec::with_capacity(sources.len());
        for source in sources {
            let camera = source.camera_id();
            // one outstanding request per camera; a busy camera skips cycles
            let (requests, request_rx) = channel::bounded(1);
            let reply_tx = reply_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("capture-{camera}"))
                .spawn(move || worker_loop(source, request_rx, reply_tx))
                .map_err(|e| AcquisitionError::Unavailable {
                    camera,
                    reason: format!("cannot spawn capture thread: {e}"),
                })?;
            log::info!("{camera}: capture worker started");
            workers.push(Worker {
                camera,
                requests,
                handle,
            });
        }
        Ok(Self {
            workers,
            replies,
            params,
            seq: 0,
        })
    }

    pub fn cameras(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.workers.iter().map(|w| w.camera)
    }

    pub fn params(&self) -> &AcquisitionParams {
        &self.params
    }

    /// Request one frame from every camera and wait at most `join_timeout`.
    pub fn acquire(&mut self) -> Acquisition {
        self.seq += 1;
        let seq = self.seq;
        let timeout = self.params.join_timeout();
        let deadline = Instant::now().checked_add(timeout);
        let mut out = Acquisition {
            seq,
            ..Acquisition::default()
        };

        let mut pending = BTreeSet::new();
        for w in &self.workers {
            match w.requests.try_send(seq) {
                Ok(()) => {
                    pending.insert(w.camera);
                }
                Err(TrySendError::Full(_)) => {
                    log::debug!("{}: still busy with an earlier request", w.camera);
                    out.errors.push(AcquisitionError::Timeout {
                        camera: w.camera,
                        timeout,
                    });
                }
                Err(TrySendError::Disconnected(_)) => {
                    out.errors
                        .push(AcquisitionError::Disconnected { camera: w.camera });
                }
            }
        }

        while !pending.is_empty() {
            let reply = match deadline {
                Some(deadline) => self.replies.recv_deadline(deadline),
                None => self
                    .replies
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match reply {
                Ok(reply) if reply.seq != seq => {
                    log::debug!(
                        "{}: discarding late reply for request {}",
                        reply.camera,
                        reply.seq
                    );
                }
                Ok(reply) => {
                    pending.remove(&reply.camera);
                    match reply.result {
                        Ok(frame) if frame.camera_id() == reply.camera => out.frames.push(frame),
                        Ok(frame) => out.errors.push(AcquisitionError::Unavailable {
                            camera: reply.camera,
                            reason: format!("source produced a frame of {}", frame.camera_id()),
                        }),
                        Err(e) => out.errors.push(e),
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for camera in pending {
            out.errors.push(AcquisitionError::Timeout { camera, timeout });
        }
        out
    }
}

impl Drop for MultiCameraAcquirer {
    fn drop(&mut self) {
        for Worker {
            camera,
            requests,
            handle,
        } in self.workers.drain(..)
        {
            drop(requests);
            if handle.join().is_err() {
                log::warn!("{camera}: capture worker panicked");
            }
        }
    }
}

/// Keep the largest set of frames whose timestamps span at most `tolerance`.
///
/// Timestamps are sorted and a `[t, t + tolerance]` window is slid over them;
/// the window holding the most frames wins, ties going to the newest window.
/// Frames outside it are returned as [`AcquisitionError::Misaligned`] with
/// their distance to the nearest kept frame.
pub fn align_frames(
    frames: Vec<Frame>,
    tolerance: Duration,
) -> (Vec<Frame>, Vec<AcquisitionError>) {
    let mut times: Vec<Duration> = frames.iter().map(Frame::timestamp).collect();
    times.sort_unstable();

    let mut best: Option<(usize, Duration)> = None;
    let mut end = 0;
    for (i, &start) in times.iter().enumerate() {
        end = end.max(i);
        while end + 1 < times.len() && times[end + 1] - start <= tolerance {
            end += 1;
        }
        let support = end - i + 1;
        if best.is_none_or(|(n, _)| support >= n) {
            best = Some((support, start));
        }
    }
    let Some((_, start)) = best else {
        return (Vec::new(), Vec::new());
    };
    let inside = |t: Duration| t >= start && t - start <= tolerance;
    let last = times
        .iter()
        .copied()
        .filter(|&t| inside(t))
        .max()
        .unwrap_or(start);

    let mut aligned = Vec::with_capacity(frames.len());
    let mut dropped = Vec::new();
    for f in frames {
        let t = f.timestamp();
        if inside(t) {
            aligned.push(f);
        } else {
            let offset = if t < start { start - t } else { t - last };
            log::debug!("{}: frame at {t:?} misaligned by {offset:?}", f.camera_id());
            dropped.push(AcquisitionError::Misaligned {
                camera: f.camera_id(),
                timestamp: t,
                offset,
            });
        }
    }
    (aligned, dropped)
}
