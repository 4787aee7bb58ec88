//! # External Program Adapters
//!
//! Line-oriented text tools (tokenizer, detokenizer) run as subprocesses.
//!
//! A program is resolved once when the owning profile is built: the file must
//! exist and is made executable if it is not. Each call then spawns one
//! process, writes the UTF-8 input to its stdin, closes it, and collects
//! stdout. There is no process pooling. A call fails if the process cannot
//! be spawned, exits non-zero, breaks a pipe, emits invalid UTF-8, exceeds
//! the timeout, or is cancelled; in the last two cases the process is killed.

use crate::chain::{CancellationToken, TextStage};
use crate::error::{Error, Result};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a running subprocess is polled for exit, timeout and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Spawn attempts when the freshly written program is still busy (ETXTBSY).
const SPAWN_ATTEMPTS: usize = 3;

/// Maximum stderr bytes quoted in error messages.
const STDERR_EXCERPT: usize = 512;

/// A resolved external program and its fixed arguments.
#[derive(Debug, Clone)]
pub struct ExternalProgram {
    path: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ExternalProgram {
    /// Resolves `path`, making it executable if needed.
    pub fn resolve(
        path: impl Into<PathBuf>,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::resource(&path, "external program not found"));
        }
        ensure_executable(&path)?;
        Ok(Self {
            path,
            args,
            timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Runs the program on `text` and returns its stdout without trailing whitespace.
    pub fn run(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        let mut child = self.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::external(&self.path, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::external(&self.path, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::external(&self.path, "stderr not captured"))?;

        let input = text.as_bytes().to_vec();
        let writer = thread::spawn(move || -> io::Result<()> {
            let mut stdin = stdin;
            stdin.write_all(&input)?;
            stdin.flush()
            // stdin dropped here, signalling EOF
        });
        let reader = spawn_reader(stdout);
        let err_reader = spawn_reader(stderr);

        // Joining is safe on every path: `wait` kills the process group before it errors
        let waited = self.wait(&mut child, cancel);

        let written = join(writer, &self.path)?;
        let output = join(reader, &self.path)?;
        let errors = join(err_reader, &self.path)?.unwrap_or_default();

        let status = waited?;
        let output =
            output.map_err(|e| Error::external(&self.path, format!("reading stdout failed: {e}")))?;

        if !status.success() {
            let excerpt = String::from_utf8_lossy(&errors[..errors.len().min(STDERR_EXCERPT)]);
            return Err(Error::external(
                &self.path,
                format!("exited with {status}: {}", excerpt.trim()),
            ));
        }
        written.map_err(|e| Error::external(&self.path, format!("writing stdin failed: {e}")))?;

        let output = String::from_utf8(output)
            .map_err(|e| Error::external(&self.path, format!("output is not UTF-8: {e}")))?;
        Ok(output.trim_end().to_string())
    }

    fn spawn(&self) -> Result<Child> {
        let mut attempt = 0;
        let mut command = Command::new(&self.path);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a kill also reaches programs the tool forks
            command.process_group(0);
        }

        loop {
            attempt += 1;
            let spawned = command.spawn();
            match spawned {
                Ok(child) => return Ok(child),
                Err(e) if is_text_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                    thread::sleep(POLL_INTERVAL * attempt as u32);
                }
                Err(e) => {
                    return Err(Error::external(&self.path, format!("spawn failed: {e}")));
                }
            }
        }
    }

    /// Waits for exit, killing the child on timeout or cancellation.
    fn wait(&self, child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    kill(child, &self.path);
                    return Err(Error::external(&self.path, format!("waiting failed: {e}")));
                }
            }
            if cancel.is_cancelled() {
                kill(child, &self.path);
                return Err(Error::Cancelled {
                    program: self.path.clone(),
                });
            }
            if let (Some(deadline), Some(after)) = (deadline, self.timeout) {
                if Instant::now() >= deadline {
                    kill(child, &self.path);
                    return Err(Error::Timeout {
                        program: self.path.clone(),
                        after,
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        source.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn join<T>(handle: JoinHandle<T>, program: &Path) -> Result<T> {
    handle
        .join()
        .map_err(|_| Error::external(program, "pipe thread panicked"))
}

/// Kills the child's process group and reaps the child.
fn kill(child: &mut Child, program: &Path) {
    if let Err(e) = kill_group(child) {
        log::warn!("failed to kill {}: {e}", program.display());
    }
    // Reap the process so it does not linger as a zombie
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(child: &mut Child) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::other("process id out of range"))?;
    // SAFETY: killpg only sends a signal; the group id is the child's own pid
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    // The group is already gone; fall back to the direct child
    child.kill()
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(target_os = "linux")]
fn is_text_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(26)
}

#[cfg(not(target_os = "linux"))]
fn is_text_busy(_e: &io::Error) -> bool {
    false
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path)?.permissions();
    if permissions.mode() & 0o111 == 0 {
        permissions.set_mode(permissions.mode() | 0o755);
        std::fs::set_permissions(path, permissions).map_err(|e| {
            Error::resource(path, format!("cannot make program executable: {e}"))
        })?;
        log::info!("made {} executable", path.display());
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// A text stage backed by an external program.
#[derive(Debug, Clone)]
pub struct ExternalStage {
    name: String,
    program: ExternalProgram,
}

impl ExternalStage {
    pub fn new(name: impl Into<String>, program: ExternalProgram) -> Self {
        Self {
            name: name.into(),
            program,
        }
    }

    /// Tokenizer invoked as `<program> -l <lang> -no-escape -q`.
    ///
    /// HTML escaping is disabled because entities were already decoded upstream.
    pub fn tokenizer(path: impl Into<PathBuf>, lang: &str, timeout: Option<Duration>) -> Result<Self> {
        let args = vec![
            "-l".to_string(),
            lang.to_string(),
            "-no-escape".to_string(),
            "-q".to_string(),
        ];
        Ok(Self::new("tokenizer", ExternalProgram::resolve(path, args, timeout)?))
    }

    /// Detokenizer invoked as `<program> -l <lang>`.
    pub fn detokenizer(
        path: impl Into<PathBuf>,
        lang: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let args = vec!["-l".to_string(), lang.to_string()];
        Ok(Self::new("detokenizer", ExternalProgram::resolve(path, args, timeout)?))
    }

    pub fn program(&self) -> &ExternalProgram {
        &self.program
    }
}

impl TextStage for ExternalStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, text: &str) -> Result<String> {
        self.program.run(text, &CancellationToken::new())
    }

    fn run_cancellable(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        self.program.run(text, cancel)
    }
}
