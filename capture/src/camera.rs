use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frame_cast_common::config::{CameraConfig, Config, StreamConfig};
use frame_cast_common::frame::Frame;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::FrameBuffer;
use crate::error::CaptureError;
use crate::extractor::run_extractor;
use crate::process::{terminate, CaptureProcess, CaptureSource, RpicamSource};
use crate::session::{frame_stream, Cursor, FrameStream};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Owns the capture lifecycle and the frame buffer consumers read from.
///
/// Capture starts lazily on the first consumer and then runs until
/// [`Camera::stop`] or process exit. Consumers leaving does not stop it.
pub struct Camera {
    camera: CameraConfig,
    stream: StreamConfig,
    source: Arc<dyn CaptureSource>,
    buffer: Arc<FrameBuffer>,
    state: Mutex<Lifecycle>,
    last_error: Arc<Mutex<Option<String>>>,
}

struct Lifecycle {
    session: Option<Session>,
    /// Earliest time another spawn may be attempted after a failure.
    retry_at: Option<Instant>,
    backoff: Duration,
    sessions_started: u64,
}

/// One running capture: its extractor task and the means to stop it.
///
/// A session stays in the lifecycle slot until its task has finished, even
/// after a stop was requested, so no second process can start while the
/// old one is still exiting.
struct Session {
    id: u64,
    /// Buffer sequence when the session started.
    start_seq: u64,
    alive: Arc<AtomicBool>,
    stopping: bool,
    shutdown: watch::Sender<bool>,
    /// Taken by `stop`, which awaits it outside the lifecycle lock.
    task: Option<JoinHandle<()>>,
}

impl Session {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn is_streaming(&self) -> bool {
        self.is_alive() && !self.stopping
    }
}

impl Lifecycle {
    /// Clear a finished session out of the slot and settle the backoff.
    ///
    /// A session that published at least one frame resets the backoff. One
    /// that ended on its own without a frame counts as a failed start.
    fn retire(&mut self, session: Session, current_seq: u64, now: Instant) {
        if current_seq > session.start_seq {
            self.backoff = INITIAL_BACKOFF;
        } else if !session.stopping {
            warn!(
                session = session.id,
                retry_in = ?self.backoff,
                "capture exited before producing a frame"
            );
            self.retry_at = Some(now + self.backoff);
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        }
        debug!(session = session.id, "capture session retired");
    }
}

/// Snapshot of the camera state for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub streaming: bool,
    pub sequence: u64,
    pub last_frame_at_ms: Option<i64>,
    pub sessions_started: u64,
    pub last_error: Option<String>,
}

impl Camera {
    pub fn new(camera: CameraConfig, stream: StreamConfig, source: Arc<dyn CaptureSource>) -> Self {
        Self {
            camera,
            stream,
            source,
            buffer: Arc::new(FrameBuffer::new()),
            state: Mutex::new(Lifecycle {
                session: None,
                retry_at: None,
                backoff: INITIAL_BACKOFF,
                sessions_started: 0,
            }),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Camera backed by the configured capture command.
    pub fn rpicam(config: &Config) -> Self {
        let source = Arc::new(RpicamSource::new(&config.camera));
        Self::new(config.camera.clone(), config.stream.clone(), source)
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn frame_timeout(&self) -> Duration {
        self.stream.frame_timeout()
    }

    /// Start capture unless a live session already exists.
    ///
    /// Concurrent callers serialise on the lifecycle lock, so at most one
    /// process is ever spawned. A session whose stream has ended is
    /// replaced; one that is still stopping blocks new starts until it has
    /// exited. After a failed start, calls inside the backoff window fail
    /// fast without touching the source.
    pub fn ensure_started(&self) -> Result<(), CaptureError> {
        let current_seq = self.buffer.sequence();
        let now = Instant::now();
        let mut state = self.lock_state();

        if let Some(session) = &state.session {
            if session.is_alive() {
                if session.stopping {
                    return Err(CaptureError::Unavailable(
                        "previous capture is still stopping".into(),
                    ));
                }
                return Ok(());
            }
        }
        if let Some(session) = state.session.take() {
            info!(session = session.id, "capture session ended, starting a new one");
            state.retire(session, current_seq, now);
        }

        if let Some(retry_at) = state.retry_at {
            if now < retry_at {
                return Err(CaptureError::Unavailable(format!(
                    "start failed recently, next attempt in {:?}",
                    retry_at - now
                )));
            }
        }

        match self.source.spawn() {
            Ok(process) => {
                state.retry_at = None;
                state.sessions_started += 1;
                let id = state.sessions_started;
                info!(
                    session = id,
                    source = self.source.name(),
                    pid = process.pid(),
                    width = self.camera.width,
                    height = self.camera.height,
                    fps = self.camera.fps,
                    "capture started"
                );
                state.session = Some(self.launch(id, current_seq, process));
                *self.lock_last_error() = None;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, retry_in = ?state.backoff, "failed to start capture");
                state.retry_at = Some(now + state.backoff);
                state.backoff = (state.backoff * 2).min(MAX_BACKOFF);
                *self.lock_last_error() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Stop the running capture, if any, and wait for it to wind down.
    ///
    /// The session keeps its slot until the process has exited. If that
    /// takes longer than the grace period plus a second, `stop` returns and
    /// the slot is freed by the next `ensure_started` once the task ends.
    pub async fn stop(&self) {
        let (id, task) = {
            let mut state = self.lock_state();
            let Some(session) = state.session.as_mut() else {
                debug!("stop requested but capture is not running");
                return;
            };
            if session.stopping {
                debug!(session = session.id, "capture is already stopping");
                return;
            }
            session.stopping = true;
            session.shutdown.send_replace(true);
            (session.id, session.task.take())
        };

        info!(session = id, "stopping capture");
        if let Some(task) = task {
            let deadline = self.stream.stop_grace() + Duration::from_secs(1);
            match tokio::time::timeout(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "extractor task failed"),
                Err(_) => warn!(session = id, "extractor did not stop in time"),
            }
        }

        let current_seq = self.buffer.sequence();
        let now = Instant::now();
        let mut state = self.lock_state();
        let finished = state
            .session
            .as_ref()
            .is_some_and(|s| s.id == id && !s.is_alive());
        if finished {
            if let Some(session) = state.session.take() {
                state.retire(session, current_seq, now);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().session.as_ref().is_some_and(Session::is_streaming)
    }

    pub fn status(&self) -> CameraStatus {
        let (streaming, sessions_started) = {
            let state = self.lock_state();
            let streaming = state.session.as_ref().is_some_and(Session::is_streaming);
            (streaming, state.sessions_started)
        };
        let latest = self.buffer.latest();
        CameraStatus {
            source: self.source.name().to_string(),
            width: self.camera.width,
            height: self.camera.height,
            fps: self.camera.fps,
            streaming,
            sequence: latest.as_ref().map_or(0, |f| f.seq),
            last_frame_at_ms: latest.map(|f| f.captured_at_ms),
            sessions_started,
            last_error: self.lock_last_error().clone(),
        }
    }

    /// One-shot retrieval: the current frame, or the first one to arrive
    /// within the snapshot timeout.
    pub async fn snapshot(&self) -> Result<Frame, CaptureError> {
        self.start_for_consumer();
        let timeout = self.stream.snapshot_timeout();
        Cursor::new()
            .next(&self.buffer, timeout)
            .await
            .ok_or(CaptureError::FrameTimeout(timeout))
    }

    /// Continuous stream of frames for one viewer.
    pub fn frames(self: &Arc<Self>) -> FrameStream {
        frame_stream(Arc::clone(self))
    }

    /// Lazy start on behalf of a consumer. Failure leaves the consumer
    /// waiting on the buffer; it is reported through `status()`.
    pub(crate) fn start_for_consumer(&self) {
        if let Err(e) = self.ensure_started() {
            debug!(error = %e, "consumer waiting on unavailable capture");
        }
    }

    fn launch(&self, id: u64, start_seq: u64, process: CaptureProcess) -> Session {
        let alive = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_alive = Arc::clone(&alive);
        let buffer = Arc::clone(&self.buffer);
        let last_error = Arc::clone(&self.last_error);
        let stream = self.stream.clone();
        let stop_requested = shutdown_rx.clone();

        let task = tokio::spawn(async move {
            let (reader, child) = process.into_parts();
            let stats = run_extractor(
                reader,
                &buffer,
                stream.max_pending_bytes,
                stream.read_chunk_bytes,
                shutdown_rx,
            )
            .await;

            if let Some(mut child) = child {
                terminate(&mut child, stream.stop_grace()).await;
            }

            if !*stop_requested.borrow() {
                let e = CaptureError::Unavailable("capture stream ended unexpectedly".into());
                warn!(session = id, error = %e, "capture lost, will restart on next consumer");
                *last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
            }

            task_alive.store(false, Ordering::Release);
            info!(
                session = id,
                frames = stats.frames,
                bytes = stats.bytes,
                recoveries = stats.recoveries,
                "capture session finished"
            );
        });

        Session {
            id,
            start_seq,
            alive,
            stopping: false,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_error(&self) -> MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
