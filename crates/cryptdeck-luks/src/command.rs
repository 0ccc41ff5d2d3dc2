//! Execution wrapper for privileged tool invocations.
//!
//! Keeps process plumbing isolated so the volume operations stay testable
//! against fake binaries.

use cryptdeck_core::provider::{OpKind, OpOutcome, OpStatus};
use log::{debug, info, warn};
use std::ffi::{OsStr, OsString};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

/// One tool, optionally run through a privilege wrapper such as `sudo`.
#[derive(Debug, Clone)]
pub(crate) struct PrivilegedCommand {
    wrapper: Option<PathBuf>,
    program: PathBuf,
}

/// Captured result of a finished invocation.
#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) outcome: OpOutcome,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl Output {
    /// Stderr when present, otherwise stdout, trimmed.
    pub(crate) fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl PrivilegedCommand {
    pub(crate) fn new(wrapper: Option<&str>, program: impl Into<PathBuf>) -> Self {
        Self {
            wrapper: wrapper.map(PathBuf::from),
            program: program.into(),
        }
    }

    /// Run the tool to completion, writing `input` to its stdin first.
    ///
    /// Stdin is closed after the payload so the tool never waits for more.
    /// There is no timeout: an interactive tool may legitimately block.
    pub(crate) fn run<S: AsRef<OsStr>>(
        &self,
        op: OpKind,
        args: &[S],
        input: Option<&[u8]>,
    ) -> Output {
        let argv = self.argv(args);
        info!("running {op}: {}", render_argv(&argv));

        match self.execute(&argv, input) {
            Ok((status, stdout, stderr)) => {
                let outcome = OpOutcome {
                    op,
                    status: exit_status(status),
                };
                debug!("{outcome}");
                Output {
                    outcome,
                    stdout,
                    stderr,
                }
            }
            Err(err) => {
                warn!("unable to run {}: {err}", render_argv(&argv));
                Output {
                    outcome: OpOutcome::spawn_failed(op, err.to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        }
    }

    fn argv<S: AsRef<OsStr>>(&self, args: &[S]) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if let Some(wrapper) = &self.wrapper {
            argv.push(wrapper.clone().into_os_string());
        }
        argv.push(self.program.clone().into_os_string());
        argv.extend(args.iter().map(|arg| arg.as_ref().to_os_string()));
        argv
    }

    fn execute(
        &self,
        argv: &[OsString],
        input: Option<&[u8]>,
    ) -> io::Result<(ExitStatus, String, String)> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut command = Command::new(program);
        command.args(rest);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A tool that exits before reading everything closes the pipe;
                // its exit status still tells us what happened.
                if let Err(err) = stdin.write_all(payload).and_then(|_| stdin.flush()) {
                    debug!("stdin of {} closed early: {err}", program.to_string_lossy());
                }
            }
        }

        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());
        let status = child.wait()?;

        // The tool has already run; losing its output must not hide its status.
        let stdout = collect_output(stdout_handle, "stdout");
        let stderr = collect_output(stderr_handle, "stderr");
        Ok((status, stdout, stderr))
    }
}

fn exit_status(status: ExitStatus) -> OpStatus {
    match status.code() {
        Some(code) => OpStatus::Exited(code),
        None => OpStatus::Signalled,
    }
}

fn render_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

fn join_reader(
    handle: thread::JoinHandle<io::Result<String>>,
    stream: &str,
) -> io::Result<String> {
    handle.join().map_err(|_| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("{stream} reader thread panicked"),
        )
    })?
}

/// Output of one stream, or empty with a warning when it could not be read.
fn collect_output(handle: thread::JoinHandle<io::Result<String>>, stream: &str) -> String {
    join_reader(handle, stream).unwrap_or_else(|err| {
        warn!("unable to capture {stream}: {err}");
        String::new()
    })
}

/// Turn cryptsetup's open diagnostics into an operator-facing log line.
pub(crate) fn classify_open_failure(name: &str, source: &Path, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = if diagnostic.is_empty() {
        "no additional output"
    } else {
        diagnostic
    };
    let source = source.display();

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("keyslot")
        || lower.contains("key slot")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        return format!("cryptsetup rejected the key for `{name}` on {source}: {diagnostic}");
    }

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "cryptsetup lacked privileges to open `{name}` on {source}: {diagnostic}. Check the privilege wrapper"
        );
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
    {
        return format!(
            "cryptsetup could not access {source} for `{name}`: {diagnostic}. Confirm the device is present"
        );
    }

    if lower.contains("already exists") {
        return format!("mapping `{name}` already appears active: {diagnostic}");
    }

    format!("cryptsetup failed to open `{name}` on {source}: {diagnostic}")
}
