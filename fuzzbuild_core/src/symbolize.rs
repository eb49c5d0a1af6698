//! Streams log text through the external `symbolize` tool.
//!
//! Two tasks cooperate for the length of one call: a scoped writer thread
//! copies the caller's input into the subprocess's stdin, while the calling
//! thread drains its stdout line by line. Draining concurrently is what keeps
//! a large input from filling both pipes and deadlocking; a caller that hands
//! in a reader which itself waits on our output can still deadlock, and there
//! is no way to cancel a call other than ending its input.

use crate::paths::{PathError, PathTable, keys};
use regex::bytes::Regex;
use std::borrow::Cow;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::OnceLock;
use std::thread;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SymbolizeError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to spawn symbolizer {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("symbolizer pipe unavailable: {0}")]
    Pipe(&'static str),
    #[error("failed to feed input to symbolizer: {source}")]
    Input {
        #[source]
        source: io::Error,
    },
    #[error("failed during scan: {source}")]
    ReadOutput {
        #[source]
        source: io::Error,
    },
    #[error("failed to write symbolized output: {source}")]
    WriteOutput {
        #[source]
        source: io::Error,
    },
    #[error("failed waiting for symbolizer: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },
    #[error("symbolizer {program:?} {status}")]
    Exit { program: PathBuf, status: ExitStatus },
}

fn log_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9\[\]\.]*\[klog\] INFO: ").expect("log prefix regex"))
}

/// Removes the `[timestamp][klog] INFO: ` prefix the host adds to kernel log
/// lines. Lines without it are returned untouched.
pub fn strip_log_prefix(line: &[u8]) -> Cow<'_, [u8]> {
    log_prefix_regex().replace_all(line, &b""[..])
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// A fully configured invocation of the symbolizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbolizer {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Symbolizer {
    /// Points the symbolizer at `llvm_symbolizer` and at each build-id
    /// directory in order; the tool consults them in the order given.
    pub fn new(program: &Path, llvm_symbolizer: &Path, build_id_dirs: &[PathBuf]) -> Self {
        let mut args: Vec<OsString> = vec!["-llvm-symbolizer".into(), llvm_symbolizer.into()];
        for dir in build_id_dirs {
            args.push("-build-id-dir".into());
            args.push(dir.into());
        }
        Self {
            program: program.to_path_buf(),
            args,
        }
    }

    /// Builds the invocation from a layout's path table.
    pub fn from_paths(paths: &PathTable) -> Result<Self, SymbolizeError> {
        let resolved = paths.resolve(&[keys::SYMBOLIZE, keys::LLVM_SYMBOLIZER])?;
        Ok(Self::new(&resolved[0], &resolved[1], paths.build_id_dirs()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Pipes `input` through the symbolizer and writes each output line,
    /// stripped of its log prefix and terminated by a single `\n`, to
    /// `output`.
    ///
    /// Blocks until `input` is exhausted and the subprocess has exited. The
    /// end of `input` is not forwarded: `output` is flushed but left open,
    /// and framing or closing it is up to the caller.
    pub fn symbolize<R, W>(&self, input: R, output: &mut W) -> Result<(), SymbolizeError>
    where
        R: Read + Send,
        W: Write + ?Sized,
    {
        debug!(program = ?self.program, args = ?self.args, "Starting symbolizer");
        let mut session = SymbolizationSession::start(self)?;
        let stdin = session.take_stdin()?;
        let stdout = session.take_stdout()?;

        let (feed_result, relay_result) = thread::scope(|scope| {
            let feeder = scope.spawn(move || feed(input, stdin));
            let relay_result = relay(BufReader::new(stdout), output);
            let feed_result = feeder
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("symbolizer input thread panicked")));
            (feed_result, relay_result)
        });

        relay_result?;
        let status = session.wait()?;
        if !status.success() {
            return Err(SymbolizeError::Exit {
                program: self.program.clone(),
                status,
            });
        }
        feed_result.map_err(|source| SymbolizeError::Input { source })
    }
}

/// Copies all of `input` into the subprocess, then closes its stdin.
///
/// A symbolizer that exits without reading everything closes the pipe
/// early; that alone is not a failure, its exit status decides.
fn feed<R: Read>(mut input: R, mut stdin: ChildStdin) -> io::Result<()> {
    match io::copy(&mut input, &mut stdin) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Symbolizer closed its input early");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn relay<R, W>(mut reader: R, output: &mut W) -> Result<(), SymbolizeError>
where
    R: BufRead,
    W: Write + ?Sized,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|source| SymbolizeError::ReadOutput { source })?;
        if read == 0 {
            break;
        }
        let stripped = strip_log_prefix(trim_line_ending(&line));
        output
            .write_all(&stripped)
            .and_then(|()| output.write_all(b"\n"))
            .map_err(|source| SymbolizeError::WriteOutput { source })?;
    }
    output
        .flush()
        .map_err(|source| SymbolizeError::WriteOutput { source })
}

/// Owns one running symbolizer process. The process is always reaped: by
/// [`SymbolizationSession::wait`] on success, or on drop along error paths.
struct SymbolizationSession {
    child: Child,
    reaped: bool,
}

impl SymbolizationSession {
    fn start(symbolizer: &Symbolizer) -> Result<Self, SymbolizeError> {
        let child = Command::new(&symbolizer.program)
            .args(&symbolizer.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SymbolizeError::Spawn {
                program: symbolizer.program.clone(),
                source,
            })?;
        Ok(Self {
            child,
            reaped: false,
        })
    }

    fn take_stdin(&mut self) -> Result<ChildStdin, SymbolizeError> {
        self.child
            .stdin
            .take()
            .ok_or(SymbolizeError::Pipe("stdin"))
    }

    fn take_stdout(&mut self) -> Result<ChildStdout, SymbolizeError> {
        self.child
            .stdout
            .take()
            .ok_or(SymbolizeError::Pipe("stdout"))
    }

    fn wait(&mut self) -> Result<ExitStatus, SymbolizeError> {
        let status = self
            .child
            .wait()
            .map_err(|source| SymbolizeError::Wait { source })?;
        self.reaped = true;
        debug!(%status, "Symbolizer exited");
        Ok(status)
    }
}

impl Drop for SymbolizationSession {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        drop(self.child.stdin.take());
        drop(self.child.stdout.take());
        if let Err(e) = self.child.wait() {
            debug!("Failed to reap symbolizer: {e}");
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_utils {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    const STUBS: &[(&str, &str)] = &[
        ("echo", "#!/bin/sh\nexec cat\n"),
        ("fail", "#!/bin/sh\ncat > /dev/null\nexit 3\n"),
        (
            "args",
            "#!/bin/sh\nfor arg in \"$@\"; do echo \"$arg\"; done\ncat > /dev/null\n",
        ),
        ("early-exit", "#!/bin/sh\necho done\n"),
    ];

    /// Writes every stub symbolizer once per test binary. All stubs are
    /// closed before any test can spawn one, so no exec races a writer.
    fn stub_dir() -> &'static TempDir {
        static DIR: OnceLock<TempDir> = OnceLock::new();
        DIR.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            for (name, script) in STUBS {
                let path = dir.path().join(name);
                fs::write(&path, script).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            }
            dir
        })
    }

    pub(crate) fn stub(name: &str) -> PathBuf {
        stub_dir().path().join(name)
    }
}
