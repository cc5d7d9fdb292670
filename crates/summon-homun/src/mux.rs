//! Output multiplexing for a captured subprocess.
//!
//! Two reader tasks (one per stream) push lines into a single bounded
//! queue. A supervisor task waits for both readers to drain, then for the
//! process to exit, records the exit outcome, and closes the queue. If the
//! run is cancelled the readers are aborted instead of drained, since
//! nothing consumes the queue after that.
//!
//! The consumer owns an [`OutputStream`] and pulls one line at a time with
//! [`OutputStream::next`], which hands the stream back alongside each
//! line. Lines from one stream keep their order; lines from different
//! streams interleave in whatever order they arrive.

use homun_core::OutputLine;
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pending lines the queue holds before readers block.
///
/// Once full, readers stop draining the pipes and the subprocess stalls on
/// its own writes until the event loop catches up.
pub const QUEUE_CAPACITY: usize = 100;

/// How a captured process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Non-zero exit. `code` is `None` when the process died from a signal.
    Failed { code: Option<i32> },
    /// Terminated because the run was cancelled.
    Cancelled,
    /// The exit status could not be collected.
    WaitFailed(String),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            Self::Success
        } else {
            Self::Failed {
                code: status.code(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Error text for an unsuccessful outcome.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Success => None,
            Self::Failed { code: Some(code) } => Some(format!("exit status {code}")),
            Self::Failed { code: None } => Some("terminated by signal".to_string()),
            Self::Cancelled => Some("cancelled".to_string()),
            Self::WaitFailed(reason) => Some(format!("failed to wait for process: {reason}")),
        }
    }
}

/// Consumer side of the output queue.
#[derive(Debug)]
pub struct OutputStream {
    lines: mpsc::Receiver<String>,
    exit: oneshot::Receiver<ExitOutcome>,
}

/// Result of one pull from an [`OutputStream`].
#[derive(Debug)]
pub enum OutputEvent {
    /// A line arrived; the stream is handed back for the next pull.
    Line(OutputLine, OutputStream),
    /// Both streams drained and the process exited.
    Closed(ExitOutcome),
}

impl OutputStream {
    /// Wait for the next line or for the queue to close.
    pub async fn next(mut self) -> OutputEvent {
        match self.lines.recv().await {
            Some(line) => OutputEvent::Line(OutputLine(line), self),
            None => {
                let outcome = self.exit.await.unwrap_or_else(|_| {
                    ExitOutcome::WaitFailed("supervisor ended without an exit status".to_string())
                });
                OutputEvent::Closed(outcome)
            }
        }
    }
}

/// Handle used to stop a running process and wait for its supervisor.
#[derive(Debug)]
pub struct ProcessControl {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl ProcessControl {
    pub fn new(cancel: CancellationToken, supervisor: JoinHandle<()>) -> Self {
        Self { cancel, supervisor }
    }

    /// Request termination and wait up to `grace` for the supervisor to finish.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        match tokio::time::timeout(grace, self.supervisor).await {
            Ok(Ok(())) => debug!("supervisor finished after cancellation"),
            Ok(Err(err)) => warn!(error = %err, "supervisor task panicked"),
            Err(_) => warn!(grace_ms = grace.as_millis(), "supervisor did not finish in time"),
        }
    }
}

/// Start multiplexing two readers.
///
/// `exit` resolves to the process outcome and is polled from its own task
/// so that it can react to cancellation while the readers are still busy.
/// Returns the consumer stream and the supervisor task.
pub fn spawn<O, E, X>(stdout: O, stderr: E, exit: X) -> (OutputStream, JoinHandle<()>)
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
    X: Future<Output = ExitOutcome> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();

    let waiter = tokio::spawn(exit);
    let stdout_task = tokio::spawn(pump(stdout, tx.clone(), "stdout"));
    let stderr_task = tokio::spawn(pump(stderr, tx.clone(), "stderr"));

    let supervisor = tokio::spawn(async move {
        let aborts: [AbortHandle; 2] = [stdout_task.abort_handle(), stderr_task.abort_handle()];
        let readers = join_readers([("stdout", stdout_task), ("stderr", stderr_task)]);
        tokio::pin!(readers);
        let mut waiter = waiter;

        let outcome = tokio::select! {
            () = &mut readers => outcome_of(waiter.await),
            joined = &mut waiter => {
                let outcome = outcome_of(joined);
                if outcome == ExitOutcome::Cancelled {
                    // Readers may be parked on a full queue or on pipes held
                    // open by surviving descendants.
                    for handle in &aborts {
                        handle.abort();
                    }
                }
                readers.await;
                outcome
            }
        };
        info!(outcome = ?outcome, "process exited; closing output queue");

        // A dropped receiver just means nobody is listening any more.
        let _ = exit_tx.send(outcome);
        drop(tx);
    });

    (
        OutputStream {
            lines: rx,
            exit: exit_rx,
        },
        supervisor,
    )
}

async fn join_readers(readers: [(&'static str, JoinHandle<usize>); 2]) {
    for (name, task) in readers {
        match task.await {
            Ok(lines) => debug!(stream = name, lines, "reader finished"),
            Err(err) if err.is_cancelled() => debug!(stream = name, "reader aborted"),
            Err(err) => warn!(stream = name, error = %err, "reader task failed"),
        }
    }
}

fn outcome_of(joined: std::result::Result<ExitOutcome, tokio::task::JoinError>) -> ExitOutcome {
    joined.unwrap_or_else(|err| ExitOutcome::WaitFailed(err.to_string()))
}

/// Forward lines from `reader` into the queue until EOF.
///
/// Returns the number of lines forwarded. Stops early if the consumer is
/// gone or the stream errors.
async fn pump<R>(reader: R, tx: mpsc::Sender<String>, stream: &'static str) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut count = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(strip_line_ending(&buf)).into_owned();
                if tx.send(line).await.is_err() {
                    debug!(stream, "output consumer dropped; reader stopping");
                    break;
                }
                count += 1;
            }
            Err(err) => {
                warn!(stream, error = %err, "read failed; reader stopping");
                break;
            }
        }
    }

    count
}

fn strip_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    async fn drain(mut stream: OutputStream) -> (Vec<String>, ExitOutcome) {
        let mut lines = Vec::new();
        loop {
            match stream.next().await {
                OutputEvent::Line(line, rest) => {
                    lines.push(line.0);
                    stream = rest;
                }
                OutputEvent::Closed(outcome) => return (lines, outcome),
            }
        }
    }

    #[test]
    fn strips_unix_and_windows_endings() {
        assert_eq!(strip_line_ending(b"abc\n"), b"abc");
        assert_eq!(strip_line_ending(b"abc\r\n"), b"abc");
        assert_eq!(strip_line_ending(b"abc"), b"abc");
        assert_eq!(strip_line_ending(b"\n"), b"");
    }

    #[test]
    fn outcome_messages() {
        assert_eq!(ExitOutcome::Success.error_message(), None);
        assert_eq!(
            ExitOutcome::Failed { code: Some(2) }.error_message().unwrap(),
            "exit status 2"
        );
        assert!(ExitOutcome::Failed { code: None }
            .error_message()
            .unwrap()
            .contains("signal"));
        assert!(ExitOutcome::Success.is_success());
        assert!(!ExitOutcome::Cancelled.is_success());
    }

    #[tokio::test]
    async fn merges_streams_preserving_per_stream_order() {
        let stdout: &[u8] = b"A1\nA2\n";
        let stderr: &[u8] = b"B1\n";

        let (stream, supervisor) = spawn(stdout, stderr, async { ExitOutcome::Success });
        let (lines, outcome) = drain(stream).await;
        supervisor.await.unwrap();

        assert_eq!(lines.len(), 3);
        let a1 = lines.iter().position(|l| l == "A1").unwrap();
        let a2 = lines.iter().position(|l| l == "A2").unwrap();
        assert!(a1 < a2, "A1 must precede A2: {lines:?}");
        assert!(lines.contains(&"B1".to_string()));
        assert_eq!(outcome, ExitOutcome::Success);
    }

    #[tokio::test]
    async fn closes_only_after_readers_and_exit() {
        let (mut out_writer, out_reader) = tokio::io::duplex(64);
        let (err_writer, err_reader) = tokio::io::duplex(64);
        let (exit_tx, exit_rx) = oneshot::channel::<()>();
        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = Arc::clone(&exited);

        let (stream, _supervisor) = spawn(out_reader, err_reader, async move {
            let _ = exit_rx.await;
            exited_flag.store(true, Ordering::SeqCst);
            ExitOutcome::Failed { code: Some(3) }
        });

        out_writer.write_all(b"first\n").await.unwrap();
        let stream = match stream.next().await {
            OutputEvent::Line(line, rest) => {
                assert_eq!(line.as_str(), "first");
                rest
            }
            OutputEvent::Closed(_) => panic!("closed before streams ended"),
        };

        // Both streams end, but the process has not exited yet.
        drop(out_writer);
        drop(err_writer);
        let pending = tokio::spawn(stream.next());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "queue closed before process exit");

        exit_tx.send(()).unwrap();
        match pending.await.unwrap() {
            OutputEvent::Closed(outcome) => {
                assert!(exited.load(Ordering::SeqCst));
                assert_eq!(outcome, ExitOutcome::Failed { code: Some(3) });
            }
            OutputEvent::Line(line, _) => panic!("unexpected line {line}"),
        }
    }

    #[tokio::test]
    async fn readers_block_when_queue_is_full() {
        let total = QUEUE_CAPACITY * 3;
        let data: String = (0..total).map(|i| format!("line {i}\n")).collect();
        let stdout = std::io::Cursor::new(data.into_bytes());
        let (stream, supervisor) = spawn(stdout, tokio::io::empty(), async { ExitOutcome::Success });

        // Without a consumer the supervisor cannot finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!supervisor.is_finished());

        let (lines, outcome) = drain(stream).await;
        assert_eq!(lines.len(), total);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[total - 1], format!("line {}", total - 1));
        assert_eq!(outcome, ExitOutcome::Success);
    }

    #[tokio::test]
    async fn cancelled_exit_does_not_wait_for_blocked_readers() {
        // An endless stream of lines fills the queue and parks the reader.
        let (stream, supervisor) = spawn(tokio::io::repeat(b'\n'), tokio::io::empty(), async {
            ExitOutcome::Cancelled
        });

        tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .expect("supervisor finished")
            .unwrap();

        let (lines, outcome) = drain(stream).await;
        assert!(lines.len() <= QUEUE_CAPACITY);
        assert_eq!(outcome, ExitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn non_utf8_output_is_replaced_not_dropped() {
        let stdout: &[u8] = b"ok\n\xff\xfe\nlast";
        let (stream, _) = spawn(stdout, tokio::io::empty(), async { ExitOutcome::Success });
        let (lines, _) = drain(stream).await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "ok");
        assert!(lines[1].contains('\u{fffd}'));
        assert_eq!(lines[2], "last");
    }

    #[tokio::test]
    async fn shutdown_cancels_and_waits() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        // The exit future only resolves once cancelled.
        let (stream, supervisor) = spawn(tokio::io::empty(), tokio::io::empty(), async move {
            token.cancelled().await;
            ExitOutcome::Cancelled
        });

        let control = ProcessControl::new(cancel, supervisor);
        control.shutdown(Duration::from_secs(2)).await;

        match stream.next().await {
            OutputEvent::Closed(outcome) => assert_eq!(outcome, ExitOutcome::Cancelled),
            OutputEvent::Line(line, _) => panic!("unexpected line {line}"),
        }
    }
}
