//! Child-process transport for the agent's stdio pipes.
//!
//! Stdout and stderr are switched to non-blocking mode right after spawn so
//! reads never stall the single orchestrating thread. Readiness waits go
//! through `poll(2)` with a bounded timeout.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::agent::SpawnConfig;

/// Size of the rolling stderr tail kept for diagnostics.
pub const STDERR_TAIL_BYTES: usize = 8192;

const READ_CHUNK: usize = 65536;
const TERM_GRACE: Duration = Duration::from_secs(3);
const KILL_GRACE: Duration = Duration::from_secs(2);
const REAP_POLL: Duration = Duration::from_millis(50);
/// Longest single readiness wait; callers loop on their own deadline.
const MAX_POLL: Duration = Duration::from_secs(3600);

/// Byte-level access to a running agent.
///
/// The client only ever talks to the agent through this trait, so tests can
/// substitute a scripted peer.
pub trait Transport {
    /// Write one line (a trailing newline is appended) and flush.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Block until stdout has data or hung up, or `timeout` passes.
    /// Returns whether the caller should read.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Append whatever stdout bytes are available right now. Never blocks.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    /// `None` while the agent is alive, otherwise a description of how it ended.
    fn exit_status(&mut self) -> Option<String>;

    /// Best-effort tail of the agent's stderr.
    fn stderr_tail(&mut self) -> String;
}

/// The agent running as a child process.
pub struct ChildTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
    stdout_closed: bool,
    stderr_tail: Vec<u8>,
}

impl ChildTransport {
    /// Spawn the agent with all three standard streams piped.
    pub fn spawn(config: &SpawnConfig) -> Result<Self> {
        info!(
            program = %config.program,
            args = ?config.args,
            work_dir = %config.work_dir,
            "starting agent over stdio transport"
        );

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !config.work_dir.is_empty() {
            cmd.current_dir(&config.work_dir);
        }
        for (key, val) in &config.env {
            cmd.env(key, val);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent process: {}", config.program))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("agent process started without piped stdio");
        };

        set_nonblocking(stdout.as_raw_fd()).context("failed to make agent stdout non-blocking")?;
        set_nonblocking(stderr.as_raw_fd()).context("failed to make agent stderr non-blocking")?;

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            stdout_closed: false,
            stderr_tail: Vec::new(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Move pending stderr bytes into the rolling tail so the pipe never fills.
    fn pump_stderr(&mut self) {
        let mut chunk = [0u8; 2048];
        loop {
            match self.stderr.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.stderr_tail.extend_from_slice(&chunk[..n]);
                    if self.stderr_tail.len() > STDERR_TAIL_BYTES {
                        let excess = self.stderr_tail.len() - STDERR_TAIL_BYTES;
                        self.stderr_tail.drain(..excess);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("agent stderr read failed: {e}");
                    break;
                }
            }
        }
    }

    fn wait_with_grace(&mut self, grace: Duration) -> bool {
        let until = Instant::now() + grace;
        while Instant::now() < until {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => thread::sleep(REAP_POLL),
                Err(_) => return false,
            }
        }
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Terminate gracefully, escalate to SIGKILL, and always reap.
    fn shutdown(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }

        // SAFETY: the pid belongs to a child we spawned and have not reaped.
        let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!("SIGTERM to agent failed: {}", io::Error::last_os_error());
        }
        if self.wait_with_grace(TERM_GRACE) {
            return;
        }

        warn!(pid = self.child.id(), "agent ignored SIGTERM; killing");
        let _ = self.child.kill();
        if !self.wait_with_grace(KILL_GRACE) {
            let _ = self.child.wait();
        }
    }
}

impl Transport for ChildTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut encoded = String::with_capacity(line.len() + 1);
        encoded.push_str(line);
        encoded.push('\n');
        self.stdin.write_all(encoded.as_bytes())?;
        self.stdin.flush()
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.pump_stderr();
        if self.stdout_closed {
            thread::sleep(timeout.min(REAP_POLL));
            return Ok(false);
        }

        // Stderr is watched too, so a chatty agent is drained while stdout is
        // quiet. Once stderr hangs up it is dropped from the set.
        let until = Instant::now() + timeout.min(MAX_POLL);
        let mut watch_stderr = true;
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.stdout.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.stderr.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let nfds: libc::nfds_t = if watch_stderr { 2 } else { 1 };
            let remaining = until.saturating_duration_since(Instant::now());
            let millis = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
            // SAFETY: `fds` outlives the call and holds at least `nfds` entries.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), nfds, millis) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(false);
                }
                return Err(err);
            }
            if rc == 0 {
                return Ok(false);
            }
            if fds[0].revents != 0 {
                return Ok(true);
            }
            if watch_stderr && fds[1].revents != 0 {
                if fds[1].revents & libc::POLLIN == 0 {
                    watch_stderr = false;
                }
                self.pump_stderr();
            }
            if Instant::now() >= until {
                return Ok(false);
            }
        }
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        if self.stdout_closed {
            return Ok(0);
        }
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            match self.stdout.read(&mut chunk) {
                Ok(0) => {
                    debug!("agent stdout reached EOF");
                    self.stdout_closed = true;
                    break;
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) if self.stdout_closed => {
                // Stdout hung up; give the process a moment to finish exiting.
                if self.wait_with_grace(REAP_POLL * 4) {
                    self.exit_status()
                } else {
                    Some("stdout closed".to_string())
                }
            }
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    fn stderr_tail(&mut self) -> String {
        self.pump_stderr();
        String::from_utf8_lossy(&self.stderr_tail).trim().to_string()
    }
}

impl Drop for ChildTransport {
    fn drop(&mut self) {
        self.shutdown();
        info!("agent process stopped");
    }
}

fn set_nonblocking(fd: libc::c_int) -> io::Result<()> {
    // SAFETY: fcntl on a file descriptor we own; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> SpawnConfig {
        SpawnConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            work_dir: String::new(),
            env: vec![],
        }
    }

    fn read_until(transport: &mut ChildTransport, needle: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let until = Instant::now() + Duration::from_secs(5);
        while Instant::now() < until {
            if transport.wait_readable(Duration::from_millis(200)).unwrap() {
                transport.read_available(&mut buf).unwrap();
            }
            if buf.windows(needle.len()).any(|w| w == needle) {
                break;
            }
        }
        buf
    }

    #[test]
    fn echoes_lines_through_cat() {
        let mut transport = ChildTransport::spawn(&sh("cat")).unwrap();
        transport.write_line("{\"ping\":1}").unwrap();
        let buf = read_until(&mut transport, b"\n");
        assert_eq!(buf, b"{\"ping\":1}\n");
        assert!(transport.exit_status().is_none());
    }

    #[test]
    fn read_available_never_blocks() {
        let mut transport = ChildTransport::spawn(&sh("sleep 5")).unwrap();
        let mut buf = Vec::new();
        let started = Instant::now();
        assert_eq!(transport.read_available(&mut buf).unwrap(), 0);
        assert!(!transport.wait_readable(Duration::from_millis(50)).unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn reports_exit_and_stderr_tail() {
        let mut transport =
            ChildTransport::spawn(&sh("echo 'fatal: no credentials' >&2; exit 3")).unwrap();
        let until = Instant::now() + Duration::from_secs(5);
        let mut status = None;
        while Instant::now() < until {
            let mut buf = Vec::new();
            if transport.wait_readable(Duration::from_millis(100)).unwrap() {
                transport.read_available(&mut buf).unwrap();
            }
            status = transport.exit_status();
            if status.is_some() {
                break;
            }
        }
        let status = status.expect("child should have exited");
        assert!(status.contains('3'), "status: {status}");
        assert!(transport.stderr_tail().contains("no credentials"));
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let mut transport = ChildTransport::spawn(&sh(
            "i=0; while [ $i -lt 5000 ]; do echo 'line of stderr noise' >&2; i=$((i+1)); done; echo done",
        ))
        .unwrap();
        let _ = read_until(&mut transport, b"done\n");
        let tail = transport.stderr_tail();
        assert!(!tail.is_empty());
        assert!(tail.len() <= STDERR_TAIL_BYTES);
    }

    #[test]
    fn drop_terminates_long_running_child() {
        let transport = ChildTransport::spawn(&sh("sleep 30")).unwrap();
        let pid = transport.pid() as libc::pid_t;
        let started = Instant::now();
        drop(transport);
        assert!(started.elapsed() < Duration::from_secs(5));
        // SAFETY: signal 0 only checks whether the pid still exists.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "child should be reaped after drop");
    }
}
