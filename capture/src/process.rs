use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use frame_cast_common::config::CameraConfig;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::CaptureError;

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Something that can be started to produce a raw MJPEG byte stream.
///
/// Production uses [`RpicamSource`]; tests swap in [`ReplaySource`] so the
/// lifecycle and extraction paths run without camera hardware.
pub trait CaptureSource: Send + Sync {
    fn spawn(&self) -> Result<CaptureProcess, CaptureError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// A started capture: the stream to read from, plus the child process
/// behind it when there is one.
pub struct CaptureProcess {
    reader: ByteStream,
    child: Option<Child>,
}

impl CaptureProcess {
    pub fn new(reader: ByteStream, child: Option<Child>) -> Self {
        Self { reader, child }
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::new(Box::new(reader), None)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn into_parts(self) -> (ByteStream, Option<Child>) {
        (self.reader, self.child)
    }
}

/// Ask the child to exit, then kill it if it is still around after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(%status, "capture process already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to poll capture process"),
    }

    send_sigterm(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "capture process exited"),
        Ok(Err(e)) => warn!(error = %e, "failed to wait for capture process"),
        Err(_) => {
            warn!(grace = ?grace, "capture process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill capture process");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet, since
        // `id()` returns None after a successful wait.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

/// Runs `rpicam-vid` (or a compatible tool) in endless MJPEG mode with its
/// encoded output on stdout.
#[derive(Debug, Clone)]
pub struct RpicamSource {
    command: String,
    args: Vec<String>,
}

impl RpicamSource {
    pub fn new(config: &CameraConfig) -> Self {
        let mut args: Vec<String> = vec![
            "-t".into(),
            "0".into(), // run until killed
            "--codec".into(),
            "mjpeg".into(),
            "--width".into(),
            config.width.to_string(),
            "--height".into(),
            config.height.to_string(),
            "--framerate".into(),
            config.fps.to_string(),
            "--nopreview".into(),
            "-o".into(),
            "-".into(),
        ];
        args.extend(config.extra_args.iter().cloned());
        Self {
            command: config.command.clone(),
            args,
        }
    }
}

impl CaptureSource for RpicamSource {
    fn spawn(&self) -> Result<CaptureProcess, CaptureError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CaptureError::Unavailable(format!("failed to spawn {}: {e}", self.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Unavailable("could not get stdout handle".into()))?;

        debug!(
            command = self.command,
            args = ?self.args,
            pid = child.id(),
            "capture process started"
        );

        Ok(CaptureProcess::new(Box::new(stdout), Some(child)))
    }

    fn name(&self) -> &str {
        &self.command
    }
}

/// Replays canned bytes as if they came from a capture process.
pub struct ReplaySource {
    chunks: Vec<Bytes>,
    hold_open: bool,
    fail: bool,
    spawns: AtomicUsize,
    held: Arc<Mutex<Vec<DuplexStream>>>,
}

impl ReplaySource {
    /// Each spawn writes `chunks` in order and then closes the stream.
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            hold_open: false,
            fail: false,
            spawns: AtomicUsize::new(0),
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A source whose spawn always fails, like a missing capture binary.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::<Bytes>::new())
        }
    }

    /// Keep the stream open after the last chunk instead of signalling EOF.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Close every stream held open so far, as if the processes exited.
    pub fn close_all(&self) {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl CaptureSource for ReplaySource {
    fn spawn(&self) -> Result<CaptureProcess, CaptureError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CaptureError::Unavailable("replay source set to fail".into()));
        }

        let total: usize = self.chunks.iter().map(Bytes::len).sum();
        let (mut writer, reader) = tokio::io::duplex(total.max(1));
        let chunks = self.chunks.clone();
        let held = self.hold_open.then(|| Arc::clone(&self.held));

        tokio::spawn(async move {
            for chunk in chunks {
                if writer.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            if let Some(held) = held {
                held.lock().unwrap_or_else(PoisonError::into_inner).push(writer);
            }
        });

        Ok(CaptureProcess::from_reader(reader))
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[cfg(unix)]
    #[tokio::test]
    async fn rpicam_args_follow_config() {
        let config = CameraConfig {
            command: "echo".into(),
            width: 640,
            height: 480,
            fps: 15,
            extra_args: vec!["--rotation".into(), "180".into()],
            ..CameraConfig::default()
        };
        let source = RpicamSource::new(&config);
        assert_eq!(source.name(), "echo");

        let (mut reader, child) = source.spawn().unwrap().into_parts();
        let mut printed = String::new();
        reader.read_to_string(&mut printed).await.unwrap();
        assert_eq!(
            printed,
            "-t 0 --codec mjpeg --width 640 --height 480 --framerate 15 \
             --nopreview -o - --rotation 180\n"
        );
        child.unwrap().wait().await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let config = CameraConfig {
            command: "/nonexistent/frame-cast-capture-tool".into(),
            ..CameraConfig::default()
        };
        let result = RpicamSource::new(&config).spawn();
        assert!(matches!(result, Err(CaptureError::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_a_running_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        terminate(&mut child, Duration::from_secs(2)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn replay_source_serves_chunks_then_eof() {
        let source = ReplaySource::new([&b"abc"[..], &b"def"[..]]);
        let (mut reader, child) = source.spawn().unwrap().into_parts();
        assert!(child.is_none());

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
        assert_eq!(source.spawn_count(), 1);
    }

    #[tokio::test]
    async fn held_stream_ends_on_close_all() {
        let source = ReplaySource::new([&b"xy"[..]]).hold_open();
        let (mut reader, _) = source.spawn().unwrap().into_parts();

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xy");

        // Let the writer task park its half in `held`.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.close_all();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn failing_source_counts_attempts() {
        let source = ReplaySource::failing();
        assert!(source.spawn().is_err());
        assert!(source.spawn().is_err());
        assert_eq!(source.spawn_count(), 2);
    }
}
