//! Handles for background commands.
//!
//! An [`ExecutorHandle`] represents exactly one process started with
//! [`Host::run_async`](super::Host::run_async). Two relay tasks forward the
//! process's stdout and stderr to `tracing` line by line and keep a copy in
//! the handle's buffers. The relays stop at end of stream or when the handle's
//! cancellation token fires, whichever comes first; a hung process that never
//! closes its pipes is therefore not able to pin a relay task.
//!
//! Backends plug in through [`ProcessControl`], which knows how to signal and
//! query the underlying process (a local process group, or a remote one
//! reached over SSH). Backends hand their local child to a [`ChildReaper`],
//! so waiting for exit never blocks a concurrent kill or liveness check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::HostResult;

/// Backend-specific control over one running process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Sends a kill signal to the process. Must tolerate an already-dead process.
    async fn terminate(&self, pid: u32) -> HostResult<()>;

    /// Reports whether the process is still alive.
    async fn is_alive(&self, pid: u32) -> HostResult<bool>;

    /// Waits for the process to exit and returns its exit code.
    async fn wait(&self) -> HostResult<i32>;
}

/// Owns a spawned child and publishes its exit code.
///
/// The child is awaited on its own task. Dropping the reaper kills the child.
pub struct ChildReaper {
    exit: watch::Receiver<Option<i32>>,
    abort: CancellationToken,
}

impl ChildReaper {
    pub fn spawn(mut child: Child, label: String) -> Self {
        let (tx, rx) = watch::channel(None);
        let abort = CancellationToken::new();
        let token = abort.clone();

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!("[{}] failed to kill child: {}", label, e);
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    debug!("[{}] failed to reap child: {}", label, e);
                    -1
                }
            };
            tx.send_replace(Some(code));
        });

        Self { exit: rx, abort }
    }

    /// The exit code, once the child has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub async fn wait(&self) -> HostResult<i32> {
        let mut exit = self.exit.clone();
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(std::io::Error::other)?;
        Ok(code.unwrap_or(-1))
    }

    /// Kills the child and waits up to `limit` for it to be reaped.
    /// Returns `false` on timeout.
    pub async fn kill(&self, limit: Duration) -> bool {
        self.abort.cancel();
        tokio::time::timeout(limit, self.wait()).await.is_ok()
    }
}

impl Drop for ChildReaper {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Stdout,
    Stderr,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Source::Stdout => "stdout",
            Source::Stderr => "stderr",
        }
    }
}

/// A live reference to a process started in the background.
pub struct ExecutorHandle {
    label: String,
    pid: u32,
    control: Box<dyn ProcessControl>,
    cancel: CancellationToken,
    relays: Mutex<Vec<JoinHandle<()>>>,
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    killed: AtomicBool,
}

impl ExecutorHandle {
    /// Wraps a started process and attaches relay tasks to its output streams.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<O, E>(
        label: impl Into<String>,
        pid: u32,
        control: Box<dyn ProcessControl>,
        stdout: O,
        stderr: E,
    ) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let label = label.into();
        let cancel = CancellationToken::new();
        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));

        let relays = vec![
            tokio::spawn(relay(
                stdout,
                Source::Stdout,
                label.clone(),
                stdout_buf.clone(),
                cancel.clone(),
            )),
            tokio::spawn(relay(
                stderr,
                Source::Stderr,
                label.clone(),
                stderr_buf.clone(),
                cancel.clone(),
            )),
        ];

        Self {
            label,
            pid,
            control,
            cancel,
            relays: Mutex::new(relays),
            stdout: stdout_buf,
            stderr: stderr_buf,
            killed: AtomicBool::new(false),
        }
    }

    /// Process id of the command (the remote pid for SSH hosts).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns `true` once [`kill`](Self::kill) has been called.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Checks whether the process is actually alive.
    pub async fn is_running(&self) -> HostResult<bool> {
        self.control.is_alive(self.pid).await
    }

    /// Waits for natural exit, then drains the relays.
    pub async fn wait(&self) -> HostResult<i32> {
        let code = self.control.wait().await?;
        self.join_relays().await;
        Ok(code)
    }

    /// Kills the process and stops its relays.
    ///
    /// Idempotent: only the first call signals the process. The kill signal is
    /// best-effort; a failure is logged and the relays are stopped anyway.
    pub async fn kill(&self) -> HostResult<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            debug!("[{}] already killed (pid {})", self.label, self.pid);
            return Ok(());
        }

        if let Err(e) = self.control.terminate(self.pid).await {
            warn!("[{}] failed to kill pid {}: {}", self.label, self.pid, e);
        }

        self.cancel.cancel();
        self.join_relays().await;
        Ok(())
    }

    /// Snapshot of everything relayed from stdout so far.
    pub async fn stdout(&self) -> String {
        self.stdout.lock().await.clone()
    }

    /// Snapshot of everything relayed from stderr so far.
    pub async fn stderr(&self) -> String {
        self.stderr.lock().await.clone()
    }

    async fn join_relays(&self) {
        let handles = std::mem::take(&mut *self.relays.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                debug!("[{}] relay task ended abnormally: {}", self.label, e);
            }
        }
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("killed", &self.is_killed())
            .finish()
    }
}

async fn relay<R>(
    reader: R,
    source: Source,
    label: String,
    buffer: Arc<Mutex<String>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = LinesStream::new(BufReader::new(reader).lines());

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = lines.next() => next,
        };

        match next {
            Some(Ok(line)) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    match source {
                        Source::Stdout => info!("[{}] [{}] {}", label, source.as_str(), trimmed),
                        Source::Stderr => error!("[{}] [{}] {}", label, source.as_str(), trimmed),
                    }
                }
                let mut buffer = buffer.lock().await;
                buffer.push_str(&line);
                buffer.push('\n');
            }
            Some(Err(e)) => {
                debug!("[{}] {} relay read error: {}", label, source.as_str(), e);
                break;
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingControl {
        terminations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProcessControl for CountingControl {
        async fn terminate(&self, _pid: u32) -> HostResult<()> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_alive(&self, _pid: u32) -> HostResult<bool> {
            Ok(self.terminations.load(Ordering::SeqCst) == 0)
        }

        async fn wait(&self) -> HostResult<i32> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let terminations = Arc::new(AtomicUsize::new(0));
        let control = CountingControl {
            terminations: terminations.clone(),
        };
        let handle = ExecutorHandle::spawn(
            "test",
            42,
            Box::new(control),
            tokio::io::empty(),
            tokio::io::empty(),
        );

        assert!(handle.is_running().await.unwrap());
        handle.kill().await.unwrap();
        handle.kill().await.unwrap();

        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert!(handle.is_killed());
        assert!(!handle.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_relays_capture_output() {
        let control = CountingControl {
            terminations: Arc::new(AtomicUsize::new(0)),
        };
        let handle = ExecutorHandle::spawn(
            "test",
            7,
            Box::new(control),
            &b"line one\nline two\n"[..],
            &b"oops\n"[..],
        );

        assert_eq!(handle.wait().await.unwrap(), 0);
        assert_eq!(handle.stdout().await, "line one\nline two\n");
        assert_eq!(handle.stderr().await, "oops\n");
    }

    #[tokio::test]
    async fn test_reaper_wait_and_kill_do_not_contend() {
        let child = tokio::process::Command::new("sleep")
            .arg("300")
            .spawn()
            .unwrap();
        let reaper = Arc::new(ChildReaper::spawn(child, "sleeper".to_string()));
        assert_eq!(reaper.exit_code(), None);

        let waiter = tokio::spawn({
            let reaper = Arc::clone(&reaper);
            async move { reaper.wait().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(reaper.kill(std::time::Duration::from_secs(5)).await);
        assert_eq!(waiter.await.unwrap().unwrap(), -1);
        assert_eq!(reaper.exit_code(), Some(-1));
    }

    #[tokio::test]
    async fn test_reaper_reports_exit_code() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let reaper = ChildReaper::spawn(child, "short".to_string());
        assert_eq!(reaper.wait().await.unwrap(), 3);
        assert_eq!(reaper.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_kill_stops_relay_on_open_stream() {
        // The write half stays open, so the relay would block forever without cancellation.
        let (_writer, reader) = tokio::io::duplex(64);
        let control = CountingControl {
            terminations: Arc::new(AtomicUsize::new(0)),
        };
        let handle =
            ExecutorHandle::spawn("hung", 9, Box::new(control), reader, tokio::io::empty());

        tokio::time::timeout(std::time::Duration::from_secs(5), handle.kill())
            .await
            .expect("kill should not hang")
            .unwrap();
    }
}
