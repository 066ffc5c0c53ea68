//! Capture worker
//!
//! The frame source lives on a dedicated thread; the daemon loop requests
//! one frame at a time and waits for it with a deadline. A grab that blows
//! its deadline is abandoned, not cancelled: its late reply is discarded
//! before the next request. At most one request queues behind a stuck grab;
//! any further request is refused immediately as "busy".

use crate::error::{DaemonError, Result};
use drishti_eye::{Frame, FrameSource, VisionError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply = (u64, drishti_eye::Result<Frame>);

pub struct CaptureWorker {
    name: String,
    requests: Option<mpsc::Sender<u64>>,
    replies: mpsc::Receiver<Reply>,
    released: Option<oneshot::Receiver<()>>,
    next_request: u64,
    timeout: Duration,
}

impl CaptureWorker {
    /// Move `source` onto a capture thread and open it there.
    ///
    /// Fails if the source cannot be opened within `timeout`.
    pub async fn spawn(
        mut source: Box<dyn FrameSource>,
        timeout: Duration,
        buffer: usize,
    ) -> Result<Self> {
        let name = source.name().to_string();
        let (request_tx, mut request_rx) = mpsc::channel::<u64>(1);
        let (reply_tx, reply_rx) = mpsc::channel::<Reply>(buffer.max(1));
        let (opened_tx, opened_rx) = oneshot::channel::<drishti_eye::Result<()>>();
        let (released_tx, released_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name("drishti-capture".to_string())
            .spawn(move || {
                let opened = source.open();
                let ok = opened.is_ok();
                let _ = opened_tx.send(opened);
                if ok {
                    while let Some(id) = request_rx.blocking_recv() {
                        let result = source.grab();
                        if reply_tx.blocking_send((id, result)).is_err() {
                            break;
                        }
                    }
                }
                source.release();
                let _ = released_tx.send(());
            })
            .map_err(|e| DaemonError::Capture(format!("Failed to start capture thread: {}", e)))?;

        match tokio::time::timeout(timeout, opened_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(_)) => {
                return Err(DaemonError::Capture(format!("{} exited while opening", name)))
            }
            Err(_) => {
                return Err(DaemonError::Capture(format!(
                    "{} did not open within {} ms",
                    name,
                    timeout.as_millis()
                )))
            }
        }
        info!(source = %name, "Capture worker started");

        Ok(Self {
            name,
            requests: Some(request_tx),
            replies: reply_rx,
            released: Some(released_rx),
            next_request: 0,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request one frame and wait at most the configured timeout for it.
    pub async fn grab(&mut self) -> Result<Frame> {
        while let Ok((stale, _)) = self.replies.try_recv() {
            debug!(request = stale, "Discarding late frame");
        }

        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| DaemonError::Capture("capture worker shut down".to_string()))?;
        self.next_request += 1;
        let id = self.next_request;
        match requests.try_send(id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(DaemonError::Capture(format!(
                    "{} is still busy with an earlier grab",
                    self.name
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(DaemonError::Capture(format!("{} capture thread exited", self.name)))
            }
        }

        let timeout = self.timeout;
        let replies = &mut self.replies;
        let wait = async {
            loop {
                match replies.recv().await {
                    Some((reply_id, result)) if reply_id == id => return Some(result),
                    Some(_) => continue,
                    None => return None,
                }
            }
        };
        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(Some(result)) => Ok(result?),
            Ok(None) => Err(DaemonError::Capture(format!("{} capture thread exited", self.name))),
            Err(_) => Err(VisionError::CaptureTimeout(timeout.as_millis() as u64).into()),
        }
    }

    /// Stop the capture thread and wait up to `wait` for it to release the
    /// device. Returns whether the release was confirmed.
    pub async fn shutdown(&mut self, wait: Duration) -> bool {
        self.requests = None;
        self.replies.close();
        let Some(released) = self.released.take() else {
            return true;
        };
        match tokio::time::timeout(wait, released).await {
            Ok(_) => {
                info!(source = %self.name, "Capture device released");
                true
            }
            Err(_) => {
                warn!(source = %self.name, "Capture thread did not stop within {} ms", wait.as_millis());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::{GrayImage, Luma};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct SlowSource {
        delay: Duration,
        seq: u64,
        fail_open: bool,
        released: Arc<AtomicBool>,
    }

    impl SlowSource {
        fn new(delay: Duration) -> (Self, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            (
                Self {
                    delay,
                    seq: 0,
                    fail_open: false,
                    released: released.clone(),
                },
                released,
            )
        }
    }

    impl FrameSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        fn open(&mut self) -> drishti_eye::Result<()> {
            if self.fail_open {
                Err(VisionError::Camera("no device".to_string()))
            } else {
                Ok(())
            }
        }

        fn grab(&mut self) -> drishti_eye::Result<Frame> {
            std::thread::sleep(self.delay);
            self.seq += 1;
            Ok(Frame::new(GrayImage::from_pixel(4, 4, Luma([1])), Utc::now(), self.seq))
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_grab_returns_frames_in_order() {
        let (source, released) = SlowSource::new(Duration::ZERO);
        let mut worker = CaptureWorker::spawn(Box::new(source), Duration::from_secs(2), 2)
            .await
            .unwrap();
        assert_eq!(worker.grab().await.unwrap().sequence(), 1);
        assert_eq!(worker.grab().await.unwrap().sequence(), 2);
        assert!(worker.shutdown(Duration::from_secs(2)).await);
        assert!(released.load(Ordering::SeqCst));
        assert!(worker.grab().await.is_err());
    }

    #[tokio::test]
    async fn test_slow_grab_times_out_then_recovers() {
        let (source, _) = SlowSource::new(Duration::from_millis(150));
        let mut worker = CaptureWorker::spawn(Box::new(source), Duration::from_millis(50), 2)
            .await
            .unwrap();
        let err = worker.grab().await.unwrap_err();
        assert!(matches!(err, DaemonError::Vision(VisionError::CaptureTimeout(50))));

        tokio::time::sleep(Duration::from_millis(400)).await;
        worker.timeout = Duration::from_secs(2);
        let frame = worker.grab().await.unwrap();
        assert_eq!(frame.sequence(), 2);
        worker.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_busy_worker_refuses_requests() {
        let (source, _) = SlowSource::new(Duration::from_millis(300));
        let mut worker = CaptureWorker::spawn(Box::new(source), Duration::from_millis(20), 1)
            .await
            .unwrap();
        assert!(worker.grab().await.is_err());
        assert!(worker.grab().await.is_err());
        let err = worker.grab().await.unwrap_err();
        assert!(matches!(err, DaemonError::Capture(ref msg) if msg.contains("busy")));
        worker.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let (mut source, released) = SlowSource::new(Duration::ZERO);
        source.fail_open = true;
        let result = CaptureWorker::spawn(Box::new(source), Duration::from_secs(2), 1).await;
        assert!(matches!(result, Err(DaemonError::Vision(VisionError::Camera(_)))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(released.load(Ordering::SeqCst));
    }
}
