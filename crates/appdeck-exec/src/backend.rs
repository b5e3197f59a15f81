//! Command execution backends.
//!
//! [`CommandBackend`] is the seam between the executor and whatever
//! actually runs commands on a node. [`ShellBackend`] runs them through a
//! local shell, or through `ssh` when configured and the target host is
//! known.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use appdeck_core::config::{ExecutorConfig, SshConfig};
use appdeck_core::types::StepKind;

use crate::error::ExecError;

/// Exit code reported when the process was terminated by a signal.
const EXIT_SIGNALLED: i32 = -1;

/// Bytes kept from the end of each of stdout and stderr.
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// One command or script to run.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub content: String,
    pub kind: StepKind,
    pub working_directory: Option<PathBuf>,
    pub use_sudo: bool,
    pub timeout: Duration,
    /// Environment exported to the process.
    pub env: BTreeMap<String, String>,
    /// Target host; `None` means the local machine.
    pub host: Option<String>,
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for logging.
    pub fn merged(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end_matches('\n'), self.stderr),
        }
    }
}

/// Boxed future returned by [`CommandBackend::execute`].
pub type ExecFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ExecError>> + Send + 'a>>;

/// Runs commands on behalf of the executor and health checks.
///
/// Implementations must enforce `request.timeout` and stop the process when
/// the returned future is dropped.
pub trait CommandBackend: Send + Sync {
    fn execute<'a>(&'a self, request: &'a CommandRequest) -> ExecFuture<'a>;
}

/// Shell-based backend: `<shell> -c` for commands, `<shell> -s` for scripts.
#[derive(Debug, Clone)]
pub struct ShellBackend {
    shell: String,
    sudo: Vec<String>,
    ssh: Option<SshConfig>,
}

impl Default for ShellBackend {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

impl ShellBackend {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
            sudo: vec!["sudo".to_string(), "-n".to_string()],
            ssh: None,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            sudo: config.sudo.clone(),
            ssh: config.ssh.clone(),
        }
    }

    /// Set the elevation program and its arguments.
    pub fn with_sudo(mut self, sudo: Vec<String>) -> Self {
        self.sudo = sudo;
        self
    }

    /// Run requests that carry a host over SSH.
    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// Build the process invocation and the payload to feed on stdin.
    fn build(&self, request: &CommandRequest) -> (Command, Option<String>) {
        match (&self.ssh, &request.host) {
            (Some(ssh), Some(host)) => self.build_remote(ssh, host, request),
            _ => self.build_local(request),
        }
    }

    fn build_local(&self, request: &CommandRequest) -> (Command, Option<String>) {
        let mut argv: Vec<String> = Vec::new();
        if request.use_sudo {
            argv.extend(self.sudo.iter().cloned());
        }
        argv.push(self.shell.clone());

        let payload = match request.kind {
            StepKind::Command => {
                argv.push("-c".to_string());
                argv.push(request.content.clone());
                None
            }
            StepKind::Script => {
                argv.push("-s".to_string());
                Some(request.content.clone())
            }
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).envs(&request.env);
        if let Some(dir) = &request.working_directory {
            cmd.current_dir(dir);
        }
        (cmd, payload)
    }

    /// Remote execution always feeds the content on stdin, preceded by a
    /// prologue exporting the environment and changing directory.
    fn build_remote(
        &self,
        ssh: &SshConfig,
        host: &str,
        request: &CommandRequest,
    ) -> (Command, Option<String>) {
        let destination = match &ssh.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        };
        let mut remote: Vec<String> = Vec::new();
        if request.use_sudo {
            remote.extend(self.sudo.iter().cloned());
        }
        remote.push(self.shell.clone());
        remote.push("-s".to_string());

        let mut payload = String::new();
        for (key, value) in &request.env {
            payload.push_str(&format!("export {key}={}\n", shell_quote(value)));
        }
        if let Some(dir) = &request.working_directory {
            payload.push_str(&format!(
                "cd {} || exit 1\n",
                shell_quote(&dir.to_string_lossy())
            ));
        }
        payload.push_str(&request.content);
        if !payload.ends_with('\n') {
            payload.push('\n');
        }

        let mut cmd = Command::new(&ssh.program);
        cmd.args(&ssh.options)
            .arg("-p")
            .arg(ssh.port.to_string())
            .arg(destination)
            .arg(remote.join(" "));
        (cmd, Some(payload))
    }

    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError> {
        let started = Instant::now();
        let (mut cmd, payload) = self.build(request);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn(e.to_string()))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let completion = async move {
            let feed = async move {
                if let (Some(mut stdin), Some(payload)) = (stdin, payload) {
                    // The process may exit without reading all of its input.
                    if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                        debug!(error = %e, "failed to write script to stdin");
                    }
                }
            };
            let ((), stdout, stderr, status) =
                tokio::join!(feed, read_tail(stdout), read_tail(stderr), child.wait());
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        };

        match tokio::time::timeout(request.timeout, completion).await {
            Ok(Ok((stdout, stderr, status))) => Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code: status.code().unwrap_or(EXIT_SIGNALLED),
                duration: started.elapsed(),
            }),
            Ok(Err(e)) => Err(ExecError::Io(e.to_string())),
            Err(_) => Err(ExecError::TimedOut(request.timeout)),
        }
    }
}

impl CommandBackend for ShellBackend {
    fn execute<'a>(&'a self, request: &'a CommandRequest) -> ExecFuture<'a> {
        Box::pin(self.run(request))
    }
}

/// Drain a pipe, keeping only its last `MAX_CAPTURE_BYTES`.
async fn read_tail<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut tail = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > 2 * MAX_CAPTURE_BYTES {
            tail.drain(..tail.len() - MAX_CAPTURE_BYTES);
        }
    }
    if tail.len() > MAX_CAPTURE_BYTES {
        tail.drain(..tail.len() - MAX_CAPTURE_BYTES);
    }
    Ok(tail)
}

/// Single-quote a value for POSIX shells.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: StepKind, content: &str) -> CommandRequest {
        CommandRequest {
            content: content.to_string(),
            kind,
            working_directory: None,
            use_sudo: false,
            timeout: Duration::from_secs(5),
            env: BTreeMap::new(),
            host: None,
        }
    }

    #[tokio::test]
    async fn runs_command_and_captures_streams() {
        let backend = ShellBackend::new("/bin/sh");
        let out = backend
            .execute(&request(StepKind::Command, "echo out; echo err >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.merged(), "out\nerr\n");
    }

    #[tokio::test]
    async fn runs_script_from_stdin() {
        let backend = ShellBackend::new("/bin/sh");
        let script = "A=2\nB=3\necho $((A * B))\n";
        let out = backend
            .execute(&request(StepKind::Script, script))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "6");
    }

    #[tokio::test]
    async fn honours_working_directory_and_env() {
        let dir = std::env::temp_dir();
        let backend = ShellBackend::new("/bin/sh");
        let mut req = request(StepKind::Command, "pwd; echo $GREETING");
        req.working_directory = Some(dir.clone());
        req.env.insert("GREETING".to_string(), "hello".to_string());

        let out = backend.execute(&req).await.unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        let expected = dir.canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(lines[0]).canonicalize().unwrap(),
            expected
        );
        assert_eq!(lines[1], "hello");
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let backend = ShellBackend::new("/bin/sh");
        let mut req = request(StepKind::Command, "sleep 5");
        req.timeout = Duration::from_millis(200);

        let started = Instant::now();
        let err = backend.execute(&req).await.unwrap_err();
        assert!(matches!(err, ExecError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn captured_output_keeps_only_the_tail() {
        let backend = ShellBackend::new("/bin/sh");
        let out = backend
            .execute(&request(
                StepKind::Command,
                "head -c 300000 /dev/zero | tr '\\0' a; echo end; head -c 200000 /dev/zero | tr '\\0' b >&2",
            ))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.len(), MAX_CAPTURE_BYTES);
        assert!(out.stdout.ends_with("aend\n"));
        assert_eq!(out.stderr.len(), MAX_CAPTURE_BYTES);
        assert!(out.stderr.bytes().all(|b| b == b'b'));
    }

    #[tokio::test]
    async fn missing_shell_is_spawn_error() {
        let backend = ShellBackend::new("/nonexistent/shell");
        let err = backend
            .execute(&request(StepKind::Command, "true"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
    }

    #[tokio::test]
    async fn sudo_prefix_is_applied() {
        // `env` stands in for sudo: it runs the rest of the argv unchanged.
        let backend = ShellBackend::new("/bin/sh").with_sudo(vec!["env".to_string()]);
        let mut req = request(StepKind::Command, "echo elevated");
        req.use_sudo = true;
        let out = backend.execute(&req).await.unwrap();
        assert_eq!(out.stdout.trim(), "elevated");
    }

    #[test]
    fn remote_invocation_feeds_prologue_on_stdin() {
        let backend = ShellBackend::new("/bin/bash").with_ssh(SshConfig {
            user: Some("deploy".to_string()),
            ..SshConfig::default()
        });
        let mut req = request(StepKind::Command, "make install");
        req.host = Some("10.0.0.5".to_string());
        req.use_sudo = true;
        req.working_directory = Some(PathBuf::from("/opt/it's"));
        req.env.insert("MODE".to_string(), "prod".to_string());

        let (cmd, payload) = backend.build(&req);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "ssh");
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"deploy@10.0.0.5".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("sudo -n /bin/bash -s"));

        let payload = payload.unwrap();
        assert_eq!(
            payload,
            "export MODE='prod'\ncd '/opt/it'\\''s' || exit 1\nmake install\n"
        );
    }

    #[test]
    fn requests_without_host_stay_local() {
        let backend = ShellBackend::new("/bin/sh").with_ssh(SshConfig::default());
        let (cmd, payload) = backend.build(&request(StepKind::Command, "true"));
        assert_eq!(cmd.as_std().get_program(), "/bin/sh");
        assert!(payload.is_none());
    }
}
