//! Subprocess transport backend for local AI CLI tools.
//!
//! Runs the configured executable once per request: stdin closed, stdout
//! and stderr captured, environment scrubbed of terminal-interactive
//! signals so the CLI does not attempt an ANSI UI. The per-request deadline
//! kills the child on expiry.
//!
//! Two opt-in execution modes, toggled by environment:
//! - `LLM_GATEWAY_CLI_USE_PTY` wraps the command in `script(1)` so CLIs
//!   that refuse to run without a TTY see a pseudo-terminal.
//! - `LLM_GATEWAY_CLI_USE_TERMINAL` runs the command in a separate terminal
//!   window, capturing output through a temp file with a sentinel exit
//!   marker.

use super::cli_output::process_cli_output;
use super::{Backend, BackendResult};
use crate::config::ProviderConfig;
use crate::types::{BackendKind, GatewayRequest};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const EXIT_SENTINEL: &str = "__LLM_GATEWAY_EXIT:";

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

pub struct CliBackend {
    config: ProviderConfig,
    resolved: Mutex<Option<PathBuf>>,
}

impl std::fmt::Debug for CliBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliBackend")
            .field("name", &self.config.name)
            .field("command", &self.config.cli_command)
            .finish()
    }
}

impl CliBackend {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            resolved: Mutex::new(None),
        }
    }

    /// Resolve the binary: absolute path, then PATH, then well-known bin
    /// directories that background daemons often lack in their PATH.
    fn find_cli(&self) -> Option<PathBuf> {
        if let Some(cached) = self.resolved.lock().unwrap().clone() {
            return Some(cached);
        }
        let command = self.config.cli_command.as_deref()?;

        let found = resolve_binary(command);
        if let Some(ref path) = found {
            *self.resolved.lock().unwrap() = Some(path.clone());
        }
        found
    }

    fn build_args(&self, message: &str) -> Vec<String> {
        let mut args = self.config.cli_args.clone();
        // The prompt goes last; that is how these tools take positional input.
        args.push(message.to_string());
        args
    }

    fn resolve_cwd(&self) -> Option<PathBuf> {
        let cwd = self.config.cli_cwd.as_deref()?;
        let path = PathBuf::from(cwd);
        if path.is_dir() {
            Some(path)
        } else {
            tracing::warn!(provider = %self.config.name, cwd = %cwd, "configured cwd missing, using default");
            None
        }
    }

    fn timeout_for(&self, request: &GatewayRequest) -> Duration {
        let secs = if request.timeout_s > 0.0 {
            request.timeout_s
        } else {
            self.config.timeout_s
        };
        Duration::from_secs_f64(secs.max(1.0))
    }

    fn scrubbed_command(&self, program: &Path, args: &[String], cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .env("CI", "1");
        for (key, value) in &self.config.cli_env {
            cmd.env(key, value);
        }
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    async fn run_subprocess(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
        cwd: Option<&Path>,
    ) -> std::io::Result<(String, String, i32, bool)> {
        let mut child = self.scrubbed_command(program, args, cwd).spawn()?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let timed_out = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let code = status?.code().unwrap_or(-1);
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                return Ok((
                    String::from_utf8_lossy(&stdout).into_owned(),
                    String::from_utf8_lossy(&stderr).into_owned(),
                    code,
                    false,
                ));
            }
            Err(_) => {
                let _ = child.kill().await;
                true
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            -1,
            timed_out,
        ))
    }

    /// PTY mode: run under `script(1)`, which allocates a pseudo-terminal
    /// and forwards the child's combined output.
    async fn run_with_pty(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
        cwd: Option<&Path>,
    ) -> std::io::Result<(String, String, i32, bool)> {
        let mut line = shell_quote(&program.to_string_lossy());
        for arg in args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        let wrapped = vec!["-qec".to_string(), line, "/dev/null".to_string()];
        self.run_subprocess(Path::new("script"), &wrapped, timeout, cwd)
            .await
    }

    /// External terminal mode: spawn the command inside a terminal window,
    /// redirecting output to a temp file that ends with a sentinel exit
    /// marker, and poll the file until the marker appears or the deadline
    /// passes.
    async fn run_in_terminal(
        &self,
        program: &Path,
        args: &[String],
        request_id: &str,
        timeout: Duration,
    ) -> std::io::Result<(String, String, i32, bool)> {
        let out_path = std::env::temp_dir().join(format!("llm-gateway-{}.out", request_id));
        let mut line = shell_quote(&program.to_string_lossy());
        for arg in args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        let script = format!(
            "{} > {out} 2>&1; printf '{sentinel}%s\\n' \"$?\" >> {out}",
            line,
            out = shell_quote(&out_path.to_string_lossy()),
            sentinel = EXIT_SENTINEL,
        );

        let mut spawned = false;
        for terminal in ["x-terminal-emulator", "xterm"] {
            let launched = std::process::Command::new(terminal)
                .args(["-e", "sh", "-c", &script])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            if launched.is_ok() {
                spawned = true;
                break;
            }
        }
        if !spawned {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no terminal emulator available",
            ));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(content) = std::fs::read_to_string(&out_path) {
                if let Some(pos) = content.rfind(EXIT_SENTINEL) {
                    let code = content[pos + EXIT_SENTINEL.len()..]
                        .trim()
                        .parse::<i32>()
                        .unwrap_or(-1);
                    let output = content[..pos].to_string();
                    let _ = std::fs::remove_file(&out_path);
                    return Ok((output, String::new(), code, false));
                }
            }
            if Instant::now() >= deadline {
                let output = std::fs::read_to_string(&out_path).unwrap_or_default();
                let _ = std::fs::remove_file(&out_path);
                return Ok((output, String::new(), -1, true));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Resolve a binary name against PATH and the well-known bin directories.
fn resolve_binary(command: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(command);
    if direct.is_absolute() {
        return is_executable(&direct).then_some(direct);
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(command);
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }

    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut fallbacks: Vec<PathBuf> = Vec::new();
    if let Some(home) = home {
        fallbacks.push(home.join(".local/bin"));
        fallbacks.push(home.join(".npm-global/bin"));
        fallbacks.push(home.join("bin"));
    }
    fallbacks.push(PathBuf::from("/opt/homebrew/bin"));
    fallbacks.push(PathBuf::from("/usr/local/bin"));

    for dir in fallbacks {
        let candidate = dir.join(command);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[async_trait]
impl Backend for CliBackend {
    async fn execute(&self, request: &GatewayRequest) -> BackendResult {
        let start = Instant::now();

        let Some(program) = self.find_cli() else {
            return BackendResult::fail(format!(
                "CLI command not found: {}",
                self.config.cli_command.as_deref().unwrap_or("<unset>")
            ))
            .with_latency(start.elapsed().as_secs_f64() * 1000.0);
        };

        let args = self.build_args(&request.message);
        let cwd = self.resolve_cwd();
        let timeout = self.timeout_for(request);
        tracing::debug!(provider = %self.config.name, program = %program.display(), "running CLI");

        let run = if env_flag("LLM_GATEWAY_CLI_USE_TERMINAL") {
            self.run_in_terminal(&program, &args, &request.id, timeout).await
        } else if env_flag("LLM_GATEWAY_CLI_USE_PTY") {
            self.run_with_pty(&program, &args, timeout, cwd.as_deref()).await
        } else {
            self.run_subprocess(&program, &args, timeout, cwd.as_deref()).await
        };

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        match run {
            Ok((_, _, _, true)) => BackendResult::fail(format!(
                "CLI command timed out after {}s",
                timeout.as_secs_f64()
            ))
            .with_latency(latency_ms),
            Ok((stdout, stderr, code, false)) => process_cli_output(
                &stdout,
                &stderr,
                code,
                latency_ms,
                &request.message,
                &self.config.name,
            ),
            Err(e) => BackendResult::fail(format!("failed to run CLI: {}", e))
                .with_latency(latency_ms),
        }
    }

    /// Binary presence and execute permission only. Running the tool here
    /// would trip slow first-invocation auth flows.
    async fn health_check(&self) -> bool {
        self.find_cli().is_some()
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::CliExec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_for(command: &str) -> CliBackend {
        CliBackend::new(ProviderConfig::cli("tool", command))
    }

    #[test]
    fn test_resolve_from_path() {
        // `sh` exists on every target platform.
        assert!(resolve_binary("sh").is_some());
        assert!(resolve_binary("definitely-not-a-real-binary-xyz").is_none());
    }

    #[test]
    fn test_resolve_absolute() {
        let sh = resolve_binary("sh").unwrap();
        assert_eq!(resolve_binary(&sh.to_string_lossy()), Some(sh));
        assert!(resolve_binary("/nonexistent/absolute/binary").is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_build_args_appends_prompt() {
        let mut config = ProviderConfig::cli("tool", "tool");
        config.cli_args = vec!["exec".to_string(), "--json".to_string()];
        let backend = CliBackend::new(config);
        assert_eq!(backend.build_args("the prompt"), vec!["exec", "--json", "the prompt"]);
    }

    #[tokio::test]
    async fn test_execute_missing_binary() {
        let backend = backend_for("definitely-not-a-real-binary-xyz");
        let result = backend.execute(&GatewayRequest::new("tool", "hi")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("CLI command not found"));
    }

    #[tokio::test]
    async fn test_execute_captures_output() {
        let mut config = ProviderConfig::cli("tool", "sh");
        config.cli_args = vec!["-c".to_string(), "echo answer-text #".to_string()];
        let backend = CliBackend::new(config);
        let result = backend.execute(&GatewayRequest::new("tool", "ignored")).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.response.as_deref(), Some("answer-text"));
        assert!(result.latency_ms > 0.0);
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let mut config = ProviderConfig::cli("tool", "sh");
        config.cli_args = vec!["-c".to_string(), "echo oops >&2; exit 3 #".to_string()];
        let backend = CliBackend::new(config);
        let result = backend.execute(&GatewayRequest::new("tool", "x")).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("exited with code 3"));
        assert!(error.contains("oops"));
    }

    #[tokio::test]
    async fn test_execute_deadline_kills_child() {
        let mut config = ProviderConfig::cli("tool", "sh");
        config.cli_args = vec!["-c".to_string(), "sleep 30 #".to_string()];
        let backend = CliBackend::new(config);
        let request = GatewayRequest::new("tool", "x").with_timeout(1.0);
        let start = Instant::now();
        let result = backend.execute(&request).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(backend_for("sh").health_check().await);
        assert!(!backend_for("definitely-not-a-real-binary-xyz").health_check().await);
    }
}
