//! Subprocess executor (C2): runs the external LLM inference runner as a
//! child process, demultiplexes its stdout/stderr into channels, and
//! enforces a deadline with escalating forced termination.

use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use runtime::{notify_once::NotifyOnce, task::Task};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
use tracing::{debug, error, warn};

/// Default deadline for [`execute`] when the caller doesn't supply one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Grace period between a termination request and an unconditional kill.
const GRACEFUL_WAIT: Duration = Duration::from_millis(500);
/// Extra time [`execute_and_collect`] allows beyond the request timeout
/// before it gives up draining and force-terminates.
const COLLECT_DRAIN_SLACK: Duration = Duration::from_secs(5);
/// Channel capacity for output readers; bounded so a slow SSE consumer
/// backpressures the subprocess reader.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadMode {
    /// Yield one chunk per newline-terminated line (newline stripped).
    Line,
    /// Copy bytes as they arrive, with no line buffering.
    Raw,
}

/// A request to run one inference subprocess.
#[derive(Clone, Debug)]
pub struct ExecuteRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Environment variables injected into the child (API keys, model IDs,
    /// log settings), on top of whatever the parent process already sets.
    pub env: Vec<(String, String)>,
    /// Serialized as a single JSON line, written to stdin, then stdin is
    /// closed.
    pub stdin_payload: Value,
    pub out_mode: ReadMode,
    pub err_mode: ReadMode,
}

/// One chunk of subprocess output.
#[derive(Clone, Debug)]
pub enum Chunk {
    Line(String),
    Raw(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode stdin payload: {0}")]
    StdinEncode(#[source] serde_json::Error),
    #[error("failed to write stdin: {0}")]
    StdinWrite(#[source] std::io::Error),
    #[error("reader task panicked: {0}")]
    ReaderPanicked(String),
    #[error("execution deadline of {0:?} elapsed")]
    Timeout(Duration),
    #[error("process exited with non-zero status: {0}")]
    NonZeroExit(std::process::ExitStatus),
    #[error("failed to wait on child process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("failed to terminate child process: {0}")]
    Terminate(#[source] std::io::Error),
}

/// A handle to a running execution, allowing forced termination. Obtained
/// from [`execute_with_timeout`].
#[derive(Clone)]
pub struct ExecuteHandle {
    cancel: NotifyOnce,
    forced: Arc<AtomicBool>,
}

impl ExecuteHandle {
    /// Idempotent: calling `terminate` more than once, or after the process
    /// has already exited naturally, is a no-op from the caller's
    /// perspective.
    pub fn terminate(&self) {
        self.forced.store(true, Ordering::SeqCst);
        self.cancel.send();
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }
}

/// Starts a process with the default timeout. See [`execute_with_timeout`].
pub async fn execute(
    req: ExecuteRequest,
) -> (
    mpsc::Receiver<Chunk>,
    mpsc::Receiver<Chunk>,
    mpsc::Receiver<ExecError>,
) {
    let (out_rx, err_rx, exec_err_rx, _handle) =
        execute_with_timeout(req, DEFAULT_TIMEOUT).await;
    (out_rx, err_rx, exec_err_rx)
}

/// Starts `req.program`, wiring its stdout/stderr to two channels per
/// `req.out_mode`/`req.err_mode`, and enforces `timeout`. Returns a handle
/// that permits forced termination before the deadline.
pub async fn execute_with_timeout(
    req: ExecuteRequest,
    timeout: Duration,
) -> (
    mpsc::Receiver<Chunk>,
    mpsc::Receiver<Chunk>,
    mpsc::Receiver<ExecError>,
    ExecuteHandle,
) {
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (exec_err_tx, exec_err_rx) = mpsc::channel(8);

    let cancel = NotifyOnce::new();
    let forced = Arc::new(AtomicBool::new(false));
    let handle = ExecuteHandle {
        cancel: cancel.clone(),
        forced: forced.clone(),
    };

    Task::spawn(
        "llm-exec-supervisor",
        supervise(req, timeout, cancel, forced, out_tx, err_tx, exec_err_tx),
    )
    .detach();

    (out_rx, err_rx, exec_err_rx, handle)
}

/// Runs `req` to completion, draining all output into memory. Imposes a
/// drain deadline of `timeout + 5s` on top of the execution deadline and
/// forcibly terminates the process if drain hasn't finished by then.
pub async fn execute_and_collect(
    req: ExecuteRequest,
    timeout: Duration,
) -> Result<CollectedOutput, ExecError> {
    let (mut out_rx, mut err_rx, mut exec_err_rx, handle) =
        execute_with_timeout(req, timeout).await;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exec_error = None;

    let drain = async {
        loop {
            tokio::select! {
                biased;
                Some(exec_err) = exec_err_rx.recv() => {
                    exec_error = Some(exec_err);
                }
                chunk = out_rx.recv() => match chunk {
                    Some(c) => stdout.push(c),
                    None if err_rx.is_closed() => break,
                    None => {}
                },
                chunk = err_rx.recv() => match chunk {
                    Some(c) => stderr.push(c),
                    None if out_rx.is_closed() => break,
                    None => {}
                },
                else => break,
            }
        }
    };

    let drain_deadline = timeout + COLLECT_DRAIN_SLACK;
    if tokio::time::timeout(drain_deadline, drain).await.is_err() {
        handle.terminate();
        return Err(ExecError::Timeout(drain_deadline));
    }

    if let Some(err) = exec_error {
        return Err(err);
    }

    Ok(CollectedOutput { stdout, stderr })
}

#[derive(Clone, Debug, Default)]
pub struct CollectedOutput {
    pub stdout: Vec<Chunk>,
    pub stderr: Vec<Chunk>,
}

async fn supervise(
    req: ExecuteRequest,
    timeout: Duration,
    cancel: NotifyOnce,
    forced: Arc<AtomicBool>,
    out_tx: mpsc::Sender<Chunk>,
    err_tx: mpsc::Sender<Chunk>,
    exec_err_tx: mpsc::Sender<ExecError>,
) {
    let mut command = Command::new(&req.program);
    command
        .args(&req.args)
        .envs(req.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            let _ = exec_err_tx
                .send(ExecError::Spawn {
                    program: req.program.clone(),
                    source,
                })
                .await;
            return;
        }
    };

    if let Err(e) = write_stdin(&mut child, &req.stdin_payload).await {
        let _ = exec_err_tx.send(e).await;
        let _ = terminate_child(&mut child, &forced).await;
        return;
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let out_cancel = cancel.clone();
    let err_cancel = cancel.clone();
    let out_mode = req.out_mode;
    let err_mode = req.err_mode;

    let out_reader = Task::spawn(
        "llm-exec-stdout-reader",
        read_stream(stdout, out_mode, out_tx, out_cancel),
    );
    let err_reader = Task::spawn(
        "llm-exec-stderr-reader",
        read_stream(stderr, err_mode, err_tx, err_cancel),
    );

    let readers_done = async {
        let _ = out_reader.await;
        let _ = err_reader.await;
    };

    tokio::select! {
        () = readers_done => {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) if forced.load(Ordering::SeqCst) => {
                    debug!(%status, "child exited after forced termination");
                }
                Ok(status) => {
                    let _ = exec_err_tx.send(ExecError::NonZeroExit(status)).await;
                }
                Err(source) => {
                    let _ = exec_err_tx.send(ExecError::Wait(source)).await;
                }
            }
        }
        () = tokio::time::sleep(timeout) => {
            forced.store(true, Ordering::SeqCst);
            cancel.send();
            let _ = exec_err_tx.send(ExecError::Timeout(timeout)).await;
            let _ = terminate_child(&mut child, &forced).await;
        }
        () = cancel.clone().recv_owned() => {
            forced.store(true, Ordering::SeqCst);
            let _ = terminate_child(&mut child, &forced).await;
        }
    }
}

async fn write_stdin(child: &mut Child, payload: &Value) -> Result<(), ExecError> {
    let mut line = serde_json::to_vec(payload).map_err(ExecError::StdinEncode)?;
    line.push(b'\n');
    let mut stdin = child.stdin.take().expect("stdin piped");
    stdin.write_all(&line).await.map_err(ExecError::StdinWrite)?;
    stdin.shutdown().await.map_err(ExecError::StdinWrite)?;
    Ok(())
}

/// Attempts a graceful stop, waits up to [`GRACEFUL_WAIT`], then escalates
/// to an unconditional kill. Idempotent: calling this on an already-exited
/// child is a harmless no-op.
async fn terminate_child(child: &mut Child, forced: &Arc<AtomicBool>) -> Result<(), ExecError> {
    forced.store(true, Ordering::SeqCst);

    if child.try_wait().map_err(ExecError::Terminate)?.is_some() {
        return Ok(());
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SIGTERM the process group first so a shell-wrapped runner's
        // children exit too.
        unsafe {
            libc_kill(pid as i32, 15);
        }
    }

    if tokio::time::timeout(GRACEFUL_WAIT, child.wait()).await.is_ok() {
        return Ok(());
    }

    child.kill().await.map_err(ExecError::Terminate)?;
    Ok(())
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let _ = kill(pid, sig);
}

async fn read_stream<R>(
    reader: R,
    mode: ReadMode,
    tx: mpsc::Sender<Chunk>,
    mut cancel: NotifyOnce,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    match mode {
        ReadMode::Line => {
            let mut lines = BufReader::new(reader).lines();
            loop {
                if cancel.try_recv() {
                    break;
                }
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(Chunk::Line(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("transient read error: {e}");
                        break;
                    }
                }
            }
        }
        ReadMode::Raw => {
            let mut reader = reader;
            let mut buf = vec![0u8; 8192];
            loop {
                if cancel.try_recv() {
                    break;
                }
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Chunk::Raw(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("transient read error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn echo_request(script: &str) -> ExecuteRequest {
        ExecuteRequest {
            program: "/bin/sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned()],
            env: Vec::new(),
            stdin_payload: Value::Null,
            out_mode: ReadMode::Line,
            err_mode: ReadMode::Line,
        }
    }

    #[tokio::test]
    async fn collects_stdout_lines_in_order() {
        let req = echo_request("echo one; echo two; echo three");
        let result = execute_and_collect(req, Duration::from_secs(5))
            .await
            .expect("process should succeed");
        let lines: Vec<_> = result
            .stdout
            .iter()
            .map(|c| match c {
                Chunk::Line(s) => s.clone(),
                Chunk::Raw(_) => panic!("expected line chunks"),
            })
            .collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn non_zero_exit_surfaces_as_exec_error() {
        let req = echo_request("exit 7");
        let err = execute_and_collect(req, Duration::from_secs(5))
            .await
            .expect_err("non-zero exit should be an error");
        assert!(matches!(err, ExecError::NonZeroExit(_)));
    }

    #[tokio::test]
    async fn terminate_kills_a_process_that_ignores_sigterm() {
        let req = echo_request("trap '' TERM; sleep 30");
        let (_out, _err, mut exec_err_rx, handle) =
            execute_with_timeout(req, Duration::from_secs(30)).await;
        handle.terminate();
        let result = tokio::time::timeout(Duration::from_secs(2), exec_err_rx.recv()).await;
        assert!(result.is_ok(), "supervisor should react to forced termination promptly");
    }
}
