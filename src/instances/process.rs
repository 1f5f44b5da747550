//! Child process plumbing for one Q CLI chat session.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::Config;

/// How an instance process ended when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own or within the grace period after SIGTERM.
    Graceful,
    /// Ignored SIGTERM and was killed.
    Forced,
}

/// One spawned `q chat` child. Stdout and stderr are folded into a single
/// line channel so the aggregator sees one output stream, the way the
/// terminal would.
pub struct ProcessHandle {
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
}

impl ProcessHandle {
    /// Spawn the chat process and start its stream readers. Returns the
    /// handle together with the receiving end of the line channel.
    pub fn spawn(config: &Config) -> io::Result<(Self, mpsc::UnboundedReceiver<String>)> {
        let mut child = Command::new(&config.q_command)
            .arg("chat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr unavailable"))?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child pid unavailable"))?;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        spawn_line_reader(stdout, line_tx.clone(), pid, "stdout");
        spawn_line_reader(stderr, line_tx, pid, "stderr");

        Ok((
            Self {
                pid,
                child: Mutex::new(child),
                stdin: Mutex::new(stdin),
            },
            line_rx,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write one command line to the child's stdin and flush it through.
    pub async fn write_line(&self, text: &str) -> io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    /// SIGTERM, bounded wait, SIGKILL escalation. Always reaps the child.
    pub async fn shutdown(&self, grace: Duration) -> io::Result<StopOutcome> {
        let mut child = self.child.lock().await;

        if child.try_wait()?.is_some() {
            return Ok(StopOutcome::Graceful);
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            match signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                Ok(()) => {}
                Err(Errno::ESRCH) => {
                    child.wait().await?;
                    return Ok(StopOutcome::Graceful);
                }
                Err(e) => return Err(io::Error::other(e)),
            }

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => {
                    status?;
                    return Ok(StopOutcome::Graceful);
                }
                Err(_) => {
                    debug!(pid = self.pid, "grace period elapsed, killing instance");
                }
            }
        }

        #[cfg(not(unix))]
        let _ = grace;

        child.kill().await?;
        child.wait().await?;
        Ok(StopOutcome::Forced)
    }
}

fn spawn_line_reader<R>(
    reader: R,
    tx: mpsc::UnboundedSender<String>,
    pid: u32,
    stream: &'static str,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(pid, stream, error = %e, "instance output read failed");
                    break;
                }
            }
        }
        debug!(pid, stream, "instance output stream closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::test_util::{echo_stub, test_config, write_stub};

    #[tokio::test]
    async fn spawn_fails_for_missing_binary() {
        let config = test_config("/nonexistent/q-binary".to_string());
        assert!(ProcessHandle::spawn(&config).is_err());
    }

    #[tokio::test]
    async fn written_lines_come_back_over_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut lines) = ProcessHandle::spawn(&test_config(echo_stub(&dir))).unwrap();

        handle.write_line("hello").await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .expect("timed out waiting for output");
        assert_eq!(line.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn stderr_lines_share_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(&dir, "#!/bin/sh\necho oops >&2\nexec cat\n");
        let (_handle, mut lines) = ProcessHandle::spawn(&test_config(stub)).unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .expect("timed out waiting for stderr output");
        assert_eq!(line.as_deref(), Some("oops"));
    }

    #[tokio::test]
    async fn channel_closes_when_child_exits() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(&dir, "#!/bin/sh\necho bye\n");
        let (_handle, mut lines) = ProcessHandle::spawn(&test_config(stub)).unwrap();

        assert_eq!(lines.recv().await.as_deref(), Some("bye"));
        let closed = tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .expect("timed out waiting for close");
        assert!(closed.is_none());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn shutdown_terminates_a_live_child() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _lines) = ProcessHandle::spawn(&test_config(echo_stub(&dir))).unwrap();

        let outcome = handle.shutdown(Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn shutdown_of_exited_child_is_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(&dir, "#!/bin/sh\nexit 0\n");
        let (handle, mut lines) = ProcessHandle::spawn(&test_config(stub)).unwrap();

        // Wait for the child to finish before asking it to stop.
        let _ = lines.recv().await;
        let outcome = handle.shutdown(Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
    }
}
