//! RUN entry execution.
//!
//! The default runner invokes the entry's shell with the command string as
//! its last argument and streams stdout/stderr to the output sink line by
//! line while the child runs.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use vmbuild_plan::protocol::OutputStream;
use vmbuild_plan::RunEntry;

use crate::error::{BootstrapError, Result};
use crate::reporter::OutputSink;
use crate::user::Identity;

/// `PATH` given to commands that do not set their own.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// How long output is still forwarded after the shell has exited. Lines a
/// background process writes later are dropped.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Capability: execute a RUN entry.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `entry` to completion, appending its output to `output` tagged
    /// with `index`. Returns once the child has exited and the output it
    /// produced has been appended.
    async fn run(&self, index: usize, entry: &RunEntry, output: &dyn OutputSink) -> Result<()>;
}

/// Runs commands through the entry's configured shell.
#[derive(Debug, Clone, Default)]
pub struct ShellCommandRunner;

impl ShellCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, index: usize, entry: &RunEntry, output: &dyn OutputSink) -> Result<()> {
        let original = if entry.original_command.is_empty() {
            entry.command.as_str()
        } else {
            entry.original_command.as_str()
        };
        let launch_error = |detail: String| BootstrapError::Execution {
            command: original.to_string(),
            exit_code: None,
            detail,
        };

        if entry.shell.is_empty() {
            return Err(launch_error("shell is empty".to_string()));
        }

        let command = expand_variables(&entry.command, &entry.env, &entry.args);
        let argv = entry.shell.argv(&command);
        let identity = Identity::resolve(&entry.user).map_err(launch_error)?;

        let workdir = Path::new(entry.workdir.as_str());
        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(|e| BootstrapError::io(workdir, e))?;

        info!(
            entry = index,
            program = %argv[0],
            workdir = %workdir.display(),
            uid = identity.uid.as_raw(),
            gid = identity.gid.as_raw(),
            "running command"
        );

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(workdir)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .envs(&entry.args)
            .envs(&entry.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let current = Identity::current();
        if identity.gid != current.gid {
            cmd.gid(identity.gid.as_raw());
        }
        if identity.uid != current.uid {
            cmd.uid(identity.uid.as_raw());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| launch_error(format!("failed to launch '{}': {}", argv[0], e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let forwarding = async {
            tokio::join!(
                forward_lines(stdout, index, OutputStream::Stdout, output),
                forward_lines(stderr, index, OutputStream::Stderr, output),
            )
        };
        tokio::pin!(forwarding);

        // The step ends when the shell exits, even if a background process
        // it started still holds the pipes open.
        let mut forwarded = None;
        let status = loop {
            tokio::select! {
                results = &mut forwarding, if forwarded.is_none() => forwarded = Some(results),
                status = child.wait() => break status,
            }
        };
        let status =
            status.map_err(|e| launch_error(format!("failed to wait for command: {}", e)))?;

        let (stdout_result, stderr_result) = match forwarded {
            Some(results) => results,
            None => match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut forwarding).await {
                Ok(results) => results,
                Err(_) => {
                    warn!(
                        entry = index,
                        "command exited but its output is still open, detaching"
                    );
                    (Ok(()), Ok(()))
                }
            },
        };
        for (stream, result) in [
            (OutputStream::Stdout, stdout_result),
            (OutputStream::Stderr, stderr_result),
        ] {
            if let Err(e) = result {
                warn!(entry = index, %stream, error = %e, "failed to read command output");
            }
        }

        if status.success() {
            debug!(entry = index, "command succeeded");
            return Ok(());
        }

        let detail = match (status.code(), status.signal()) {
            (Some(code), _) => format!("exited with status {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "exited abnormally".to_string(),
        };
        Err(BootstrapError::Execution {
            command: original.to_string(),
            exit_code: status.code(),
            detail,
        })
    }
}

/// Read `reader` to EOF, appending each line (newline kept) to `output`.
async fn forward_lines<R>(
    reader: Option<R>,
    index: usize,
    stream: OutputStream,
    output: &dyn OutputSink,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        debug!(
            entry = index,
            %stream,
            line = %String::from_utf8_lossy(&line).trim_end(),
            "command output"
        );
        output.append(index, stream, &line);
    }
}

/// Replace `$NAME` and `${NAME}` references whose name is defined in `env`
/// or `args` (env wins). Unknown references and `$$` are left untouched so
/// the shell still sees its own variables.
pub fn expand_variables(
    command: &str,
    env: &HashMap<String, String>,
    args: &HashMap<String, String>,
) -> String {
    let lookup = |name: &str| env.get(name).or_else(|| args.get(name));

    let mut expanded = String::with_capacity(command.len());
    let mut rest = command;

    while let Some(pos) = rest.find('$') {
        expanded.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            expanded.push_str("$$");
            rest = stripped;
        } else if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    let name = &braced[..end];
                    match lookup(name) {
                        Some(value) => expanded.push_str(value),
                        None => {
                            expanded.push_str("${");
                            expanded.push_str(name);
                            expanded.push('}');
                        }
                    }
                    rest = &braced[end + 1..];
                }
                None => {
                    expanded.push_str("${");
                    rest = braced;
                }
            }
        } else {
            let len = after
                .char_indices()
                .find(|(i, c)| {
                    !(c.is_ascii_alphabetic() || *c == '_' || (*i > 0 && c.is_ascii_digit()))
                })
                .map(|(i, _)| i)
                .unwrap_or(after.len());
            let name = &after[..len];
            match lookup(name) {
                Some(value) if !name.is_empty() => expanded.push_str(value),
                _ => {
                    expanded.push('$');
                    expanded.push_str(name);
                }
            }
            rest = &after[len..];
        }
    }

    expanded.push_str(rest);
    expanded
}
