//! Frame-difference motion detection.
//!
//! The motion transcoder emits edge-detected 320×240 8-bit grayscale frames
//! back to back. For each frame the detector computes the sum of absolute
//! differences (SAD) against the previous frame, normalised by the pixel
//! count, and publishes it as the camera's motion magnitude:
//!
//! ```text
//! magnitude = Σ |cur[i] - prev[i]| / (320 × 240)      ∈ [0, 255]
//! ```
//!
//! A magnitude strictly above the camera threshold counts as a moving frame.
//! Once more than [`MOVING_FRAMES`] consecutive frames moved and no
//! recording is active, a clip of [`CLIP_DURATION`] is started.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::camera::Camera;

pub const FRAME_WIDTH: usize = 320;
pub const FRAME_HEIGHT: usize = 240;
/// Bytes per grayscale frame.
pub const FRAME_SIZE: usize = FRAME_WIDTH * FRAME_HEIGHT;

/// Consecutive moving frames that must be exceeded to start a clip.
///
/// The comparison is strict: five moving frames in a row do not start a
/// clip, the sixth does.
pub const MOVING_FRAMES: u32 = 5;

/// Length of a motion-triggered clip.
pub const CLIP_DURATION: Duration = Duration::from_secs(60);

/// Starts a time-bounded recording for a camera.
#[async_trait]
pub trait ClipRecorder: Send + Sync {
    /// Begin recording `camera` for `duration`. Failures are logged, not
    /// returned; the camera simply stays not recording.
    async fn start(&self, camera: &Arc<Camera>, duration: Duration);
}

/// Normalised SAD between two equally sized frames.
pub fn magnitude(current: &[u8], previous: &[u8]) -> f64 {
    debug_assert_eq!(current.len(), previous.len());
    if current.is_empty() {
        return 0.0;
    }
    let sum: u64 = current
        .iter()
        .zip(previous)
        .map(|(&a, &b)| u64::from(a.abs_diff(b)))
        .sum();
    sum as f64 / current.len() as f64
}

/// Reads frames from the motion transcoder and drives recording.
pub struct MotionDetector<R> {
    camera: Arc<Camera>,
    frames: R,
    recorder: Arc<dyn ClipRecorder>,
    current: Vec<u8>,
    previous: Vec<u8>,
    moving_frames: u32,
}

impl<R> MotionDetector<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(camera: Arc<Camera>, frames: R, recorder: Arc<dyn ClipRecorder>) -> Self {
        Self {
            camera,
            frames,
            recorder,
            current: vec![0; FRAME_SIZE],
            previous: vec![0; FRAME_SIZE],
            moving_frames: 0,
        }
    }

    /// Run until the frame source ends or `cancel` fires.
    ///
    /// Returns the reason the detector stopped.
    pub async fn run(mut self, cancel: CancellationToken) -> &'static str {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return "cancelled",
                read = self.frames.read_exact(&mut self.current) => {
                    if let Err(e) = read {
                        tracing::warn!(
                            camera = %self.camera.id(),
                            error = %e,
                            "motion: could not read frame pixels"
                        );
                        return "frame source ended";
                    }
                }
            }

            self.process_frame().await;
        }
    }

    async fn process_frame(&mut self) {
        let motion = magnitude(&self.current, &self.previous);
        std::mem::swap(&mut self.current, &mut self.previous);
        self.camera.set_motion(motion);

        if motion > self.camera.threshold() {
            self.moving_frames = self.moving_frames.saturating_add(1);
        } else {
            self.moving_frames = 0;
        }
        tracing::trace!(
            camera = %self.camera.id(),
            motion,
            moving_frames = self.moving_frames,
            "frame analysed"
        );

        if self.moving_frames > MOVING_FRAMES && !self.camera.is_recording() {
            tracing::info!(camera = %self.camera.id(), motion, "motion detected");
            self.recorder.start(&self.camera, CLIP_DURATION).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::RecordingHandle;
    use crate::camera::tests::test_camera;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Counts starts and marks the camera as recording, like the real
    /// recorder does on success.
    #[derive(Default)]
    struct CountingRecorder {
        starts: AtomicUsize,
        keep: parking_lot::Mutex<Vec<mpsc::Receiver<bytes::Bytes>>>,
    }

    #[async_trait]
    impl ClipRecorder for CountingRecorder {
        async fn start(&self, camera: &Arc<Camera>, duration: Duration) {
            assert_eq!(duration, CLIP_DURATION);
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(1);
            self.keep.lock().push(rx);
            camera.set_recording(RecordingHandle::new(n as u64, tx));
        }
    }

    fn frame(value: u8) -> Vec<u8> {
        vec![value; FRAME_SIZE]
    }

    /// Alternating black/white frames move by 255 each.
    fn moving_stream(frames: usize) -> Vec<u8> {
        (0..frames)
            .flat_map(|i| frame(if i % 2 == 0 { 255 } else { 0 }))
            .collect()
    }

    #[test]
    fn magnitude_of_identical_frames_is_zero() {
        assert_eq!(magnitude(&frame(7), &frame(7)), 0.0);
    }

    #[test]
    fn magnitude_is_normalised_sad() {
        let mut cur = frame(0);
        cur[0] = 255;
        cur[1] = 100;
        let expected = (255.0 + 100.0) / FRAME_SIZE as f64;
        assert!((magnitude(&cur, &frame(0)) - expected).abs() < 1e-12);
        assert_eq!(magnitude(&frame(255), &frame(0)), 255.0);
        assert_eq!(magnitude(&frame(0), &frame(255)), 255.0);
    }

    #[tokio::test]
    async fn sustained_motion_triggers_once() {
        let camera = test_camera("front", 5.0, true);
        let recorder = Arc::new(CountingRecorder::default());
        let data = moving_stream(20);
        let detector = MotionDetector::new(camera.clone(), &data[..], recorder.clone());

        let reason = detector.run(CancellationToken::new()).await;
        assert_eq!(reason, "frame source ended");
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert!(camera.is_recording());
        assert_eq!(camera.motion(), 255.0);
    }

    #[tokio::test]
    async fn trigger_needs_more_than_five_frames() {
        let camera = test_camera("front", 5.0, true);
        let recorder = Arc::new(CountingRecorder::default());
        let data = moving_stream(5);
        MotionDetector::new(camera.clone(), &data[..], recorder.clone())
            .run(CancellationToken::new())
            .await;
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);

        let data = moving_stream(6);
        MotionDetector::new(camera.clone(), &data[..], recorder.clone())
            .run(CancellationToken::new())
            .await;
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn still_frame_resets_counter() {
        let camera = test_camera("front", 5.0, true);
        let recorder = Arc::new(CountingRecorder::default());
        // Five moving frames, one still frame, five moving frames.
        let mut data = moving_stream(5);
        data.extend(frame(255));
        data.extend(moving_stream(5).into_iter().map(|b| 255 - b));
        MotionDetector::new(camera.clone(), &data[..], recorder.clone())
            .run(CancellationToken::new())
            .await;
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_trigger_while_recording() {
        let camera = test_camera("front", 5.0, true);
        let (tx, _rx) = mpsc::channel(1);
        camera.set_recording(RecordingHandle::new(99, tx));
        let recorder = Arc::new(CountingRecorder::default());
        let data = moving_stream(20);
        MotionDetector::new(camera.clone(), &data[..], recorder.clone())
            .run(CancellationToken::new())
            .await;
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn short_read_ends_detector() {
        let camera = test_camera("front", 5.0, true);
        let recorder = Arc::new(CountingRecorder::default());
        let mut data = frame(10);
        data.extend_from_slice(&[1, 2, 3]);
        let reason = MotionDetector::new(camera.clone(), &data[..], recorder)
            .run(CancellationToken::new())
            .await;
        assert_eq!(reason, "frame source ended");
        assert_eq!(camera.motion(), 10.0);
    }

    #[tokio::test]
    async fn cancellation_stops_detector() {
        let camera = test_camera("front", 5.0, true);
        let recorder = Arc::new(CountingRecorder::default());
        let (_writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reason = MotionDetector::new(camera, reader, recorder)
            .run(cancel)
            .await;
        assert_eq!(reason, "cancelled");
    }
}
