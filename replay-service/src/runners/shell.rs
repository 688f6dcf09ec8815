// Shell Runner
// Executes commands through `sh -c` with a per-task environment overlay

use crate::execution::environment::EnvironmentOverlay;
use crate::runners::{CommandOutput, CommandRunner, OutputCallback};

use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Shell runner for executing build commands
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: &'static str,
    shell_args: &'static [&'static str],
}

impl ShellRunner {
    /// Create a new shell runner using the platform's default shell
    pub fn new() -> Self {
        if cfg!(target_os = "windows") {
            Self {
                shell: "cmd",
                shell_args: &["/C"],
            }
        } else {
            Self {
                shell: "sh",
                shell_args: &["-c"],
            }
        }
    }

    fn command(&self, env: &EnvironmentOverlay, command: &str, working_dir: &Path) -> Command {
        let mut cmd = Command::new(self.shell);
        cmd.args(self.shell_args);
        cmd.arg(command);
        cmd.current_dir(working_dir);
        for name in env.removed() {
            cmd.env_remove(name);
        }
        cmd.envs(env.vars());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward every line of `reader` to `on_output` while collecting it
///
/// Bytes that are not UTF-8 are replaced rather than ending the stream, so
/// the pipe is always drained until the child closes it.
fn stream_lines<R>(reader: R, on_output: OutputCallback, is_error: bool) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut output = String::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed reading command output");
                    break;
                }
            }

            let line = String::from_utf8_lossy(trim_line_ending(&buf));
            on_output(&line, is_error);
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&line);
        }
        output
    })
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        env: &EnvironmentOverlay,
        command: &str,
        working_dir: &Path,
        on_output: OutputCallback,
    ) -> CommandOutput {
        let mut child = match self.command(env, command, working_dir).spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to spawn shell process '{}': {}", self.shell, e);
                on_output(&message, true);
                return CommandOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: message,
                };
            }
        };

        let stdout_handle = child
            .stdout
            .take()
            .map(|stdout| stream_lines(stdout, on_output.clone(), false));
        let stderr_handle = child
            .stderr
            .take()
            .map(|stderr| stream_lines(stderr, on_output.clone(), true));

        let status = child.wait().await;
        if let Err(e) = &status {
            tracing::warn!(command, error = %e, "failed waiting for command");
        }

        let stdout = match stdout_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        CommandOutput {
            exit_code: status.ok().and_then(|s| s.code()),
            stdout,
            stderr,
        }
    }
}
