//! Child processes for agents, gates, scenarios and NFR tools.
//!
//! Every external command the factory launches goes through
//! [`run_command_with_stream`]: output is drained on reader threads while the
//! child runs, memory is bounded per stream, and a timeout kills the whole
//! process group.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

type Tee = Arc<Mutex<BufWriter<File>>>;

/// Bytes kept from one output stream, plus how many were dropped past the limit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    fn keep(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len()).min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..room]);
        self.dropped += chunk.len() - room;
    }

    /// Lossy text, with a `[label stream truncated N bytes]` trailer when bytes were dropped.
    pub fn text(&self, label: &str, stream: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!(
                "\n[{label} {stream} truncated {} bytes]\n",
                self.dropped
            ));
        }
        text
    }
}

/// Result of a finished (or killed) child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_text(&self, label: &str) -> String {
        self.stdout.text(label, "stdout")
    }

    pub fn stderr_text(&self, label: &str) -> String {
        self.stderr.text(label, "stderr")
    }

    /// Both streams under `=== stdout ===` / `=== stderr ===` headings, as written to gate logs.
    pub fn combined_log(&self, label: &str) -> String {
        let mut log = format!(
            "=== stdout ===\n{}\n=== stderr ===\n{}",
            self.stdout_text(label),
            self.stderr_text(label)
        );
        if self.timed_out {
            log.push_str(&format!(
                "\n[{label} killed after {}s timeout]\n",
                self.elapsed.as_secs()
            ));
        }
        log
    }
}

/// Turn a configured argv into a [`Command`] rooted at `workdir`.
pub fn command_from_argv(argv: &[String], workdir: &Path) -> Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        return Err(anyhow!("command is empty"));
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    Ok(cmd)
}

/// Run `cmd` to completion or until `timeout`, keeping at most `limit` bytes per stream.
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    limit: usize,
) -> Result<CommandOutput> {
    run_command_with_stream(cmd, stdin, timeout, limit, None)
}

/// As [`run_command_with_timeout`], also appending stdout to `stream_path` line by line.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), limit, streaming = stream_path.is_some()))]
pub fn run_command_with_stream(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    limit: usize,
    stream_path: Option<&Path>,
) -> Result<CommandOutput> {
    let tee = stream_path.map(open_tee).transpose()?;

    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    isolate_group(&mut cmd);

    let started = Instant::now();
    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "child started");

    let out_pipe = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let err_pipe = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let out_reader = thread::spawn(move || drain(out_pipe, limit, tee));
    let err_reader = thread::spawn(move || drain(err_pipe, limit, None));

    let writer = match stdin {
        Some(input) => {
            let mut pipe = child.stdin.take().ok_or_else(|| anyhow!("stdin not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || pipe.write_all(&input)))
        }
        None => None,
    };

    let pid = child.id();
    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "timed out; killing process group");
            kill_group(pid);
            kill_child(&mut child)?;
            (child.wait().context("reap killed command")?, true)
        }
    };
    let elapsed = started.elapsed();
    // Anything the child left running in its group still holds our pipes open,
    // and the readers below only return at EOF.
    kill_group(pid);

    if let Some(writer) = writer {
        match writer.join() {
            Ok(Err(e)) if e.kind() != ErrorKind::BrokenPipe => {
                warn!(err = %e, "could not write child stdin");
            }
            Err(_) => warn!("stdin writer panicked"),
            _ => {}
        }
    }
    let stdout = collect(out_reader).context("collect stdout")?;
    let stderr = collect(err_reader).context("collect stderr")?;
    if stdout.dropped + stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output exceeded limit"
        );
    }

    debug!(
        exit_code = ?status.code(),
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "child finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
        elapsed,
    })
}

fn open_tee(path: &Path) -> Result<Tee> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    Ok(Arc::new(Mutex::new(BufWriter::new(file))))
}

#[cfg(unix)]
fn isolate_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_group(_cmd: &mut Command) {}

/// SIGKILL every process still in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) {
    let pgid = format!("-{pid}");
    match Command::new("kill")
        .args(["-KILL", "--", &pgid])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!(pid, "killed leftover process group members"),
        // Empty group: nothing was left behind.
        Ok(_) => {}
        Err(e) => warn!(err = %e, "could not signal process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn kill_child(child: &mut Child) -> Result<()> {
    match child.kill() {
        // InvalidInput: the group kill already took the child down.
        Err(e) if e.kind() != ErrorKind::InvalidInput => Err(e).context("kill command"),
        _ => Ok(()),
    }
}

fn collect(reader: JoinHandle<Result<Captured>>) -> Result<Captured> {
    reader
        .join()
        .map_err(|_| anyhow!("output reader panicked"))?
}

/// Read `pipe` to EOF line by line, copying each line to `tee` when present.
fn drain<R: Read>(pipe: R, limit: usize, tee: Option<Tee>) -> Result<Captured> {
    let mut reader = BufReader::new(pipe);
    let mut captured = Captured::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).context("read output")? == 0 {
            return Ok(captured);
        }
        if let Some(tee) = &tee
            && let Ok(mut file) = tee.lock()
            && let Err(e) = file.write_all(&line).and_then(|()| file.flush())
        {
            warn!(err = %e, "could not write stream file");
        }
        captured.keep(&line, limit);
    }
}
