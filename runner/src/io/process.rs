//! Helpers for running child processes with timeouts and bounded output.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Lines of each stream kept from the end of the output.
pub const TAIL_LINES: usize = 20;

/// Longest single line kept in a tail.
const TAIL_LINE_BYTES: usize = 4096;

/// The child process could not be started at all (missing program, bad cwd).
#[derive(Debug, Error)]
#[error("failed to spawn {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Where a line of child output is forwarded while the child runs.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Forward stdout/stderr lines to the runner's own stdout/stderr.
    pub echo: bool,
    /// Append both streams to this file as they arrive.
    pub log_path: Option<PathBuf>,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// Last [`TAIL_LINES`] lines of stderr, independent of `output_limit_bytes`.
    pub stderr_tail: String,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, or `None` if killed by a signal or by the timeout.
    pub fn exit_code(&self) -> Option<i32> {
        if self.timed_out {
            return None;
        }
        self.status.code()
    }
}

/// What a reader thread kept of one stream.
struct Capture {
    head: Vec<u8>,
    truncated: usize,
    tail: VecDeque<Vec<u8>>,
}

impl Capture {
    fn tail_text(&self) -> String {
        let bytes: Vec<u8> = self.tail.iter().flatten().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[derive(Clone, Copy)]
enum Channel {
    Stdout,
    Stderr,
}

type SharedLog = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run a command, streaming its output while it runs.
///
/// Output is read concurrently on helper threads so the child never blocks on a
/// full pipe. `output_limit_bytes` bounds what is kept in memory per stream;
/// bytes beyond the limit are still drained, echoed and logged. With a
/// `timeout`, the child's whole process group is killed once it elapses and
/// `timed_out` is set.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes, echo = stream.echo))]
pub fn run_command(
    mut cmd: Command,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    stream: &StreamOptions,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own group, so a timeout also reaches grandchildren holding the pipes.
        cmd.process_group(0);
    }

    let log: SharedLog = Arc::new(match &stream.log_path {
        Some(path) => Some(Mutex::new(BufWriter::new(open_log(path)?))),
        None => None,
    });

    debug!("spawning child process");
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = %program, "failed to spawn command");
            return Err(SpawnError { program, source: e }.into());
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let echo = stream.echo;
    let stdout_log = log.clone();
    let stdout_handle = thread::spawn(move || {
        read_stream_limited_with_tee(stdout, output_limit_bytes, Channel::Stdout, echo, stdout_log)
    });
    let stderr_log = log.clone();
    let stderr_handle = thread::spawn(move || {
        read_stream_limited_with_tee(stderr, output_limit_bytes, Channel::Stderr, echo, stderr_log)
    });

    let mut timed_out = false;
    let status = match timeout {
        Some(timeout) => match child.wait_timeout(timeout).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "command timed out, killing"
                );
                timed_out = true;
                kill_process_group(&mut child).context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
        None => child.wait().context("wait for command")?,
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;
    let (stdout_truncated, stderr_truncated) = (stdout.truncated, stderr.truncated);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }
    if let Some(mutex) = &*log
        && let Ok(mut writer) = mutex.lock()
    {
        if timed_out {
            let _ = writeln!(writer, "[step timed out]");
        }
        writer.flush().context("flush step log")?;
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stderr_tail: stderr.tail_text(),
        stdout: stdout.head,
        stderr: stderr.head,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    File::options()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open step log {}", path.display()))
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return child.kill();
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

fn join_output(handle: thread::JoinHandle<Result<Capture>>) -> Result<Capture> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, forwarding each line as it arrives.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    channel: Channel,
    echo: bool,
    log: SharedLog,
) -> Result<Capture> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut tail: VecDeque<Vec<u8>> = VecDeque::with_capacity(TAIL_LINES);

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if echo {
            forward(channel, &line);
        }
        if let Some(ref mutex) = *log
            && let Ok(mut writer) = mutex.lock()
        {
            // Flush per line so the log can be tailed while the step runs
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to step log");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush step log");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }

        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        if line.len() > TAIL_LINE_BYTES {
            line.truncate(TAIL_LINE_BYTES);
            line.push(b'\n');
        }
        tail.push_back(line);
    }

    Ok(Capture {
        head: collected,
        truncated,
        tail,
    })
}

fn forward(channel: Channel, line: &[u8]) {
    let result = match channel {
        Channel::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(line).and_then(|()| out.flush())
        }
        Channel::Stderr => {
            let mut err = std::io::stderr().lock();
            err.write_all(line).and_then(|()| err.flush())
        }
    };
    if let Err(e) = result {
        warn!(err = %e, "failed to echo child output");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_exit_code_and_output() {
        let output = run_command(
            sh("echo out; echo err >&2; exit 3"),
            Some(Duration::from_secs(10)),
            1000,
            &StreamOptions::default(),
        )
        .expect("run");
        assert_eq!(output.exit_code(), Some(3));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_command(
            sh("printf 'abcdefghij\\n'"),
            None,
            4,
            &StreamOptions::default(),
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 7);
    }

    #[test]
    fn kills_on_timeout() {
        let mut sleep = Command::new("sleep");
        sleep.arg("5");
        let output = run_command(
            sleep,
            Some(Duration::from_millis(100)),
            1000,
            &StreamOptions::default(),
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code(), None);
    }

    #[test]
    fn timeout_kills_grandchildren_too() {
        let started = std::time::Instant::now();
        let output = run_command(
            sh("sleep 8; echo done"),
            Some(Duration::from_secs(1)),
            1000,
            &StreamOptions::default(),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
        assert!(!String::from_utf8_lossy(&output.stdout).contains("done"));
    }

    #[test]
    fn stderr_tail_survives_truncation() {
        let output = run_command(
            sh("for i in $(seq 1 50); do echo line$i >&2; done; exit 1"),
            None,
            64,
            &StreamOptions::default(),
        )
        .expect("run");
        assert!(output.stderr_truncated > 0);
        let lines: Vec<&str> = output.stderr_tail.lines().collect();
        assert_eq!(lines.len(), TAIL_LINES);
        assert_eq!(lines.first(), Some(&"line31"));
        assert_eq!(lines.last(), Some(&"line50"));
    }

    #[test]
    fn writes_both_streams_to_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("logs").join("01-step.log");
        run_command(
            sh("echo hello; echo oops >&2"),
            None,
            1000,
            &StreamOptions {
                echo: false,
                log_path: Some(log_path.clone()),
            },
        )
        .expect("run");
        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run_command(
            Command::new("definitely-not-a-real-program-ci-runner"),
            None,
            1000,
            &StreamOptions::default(),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<SpawnError>().is_some());
    }
}
