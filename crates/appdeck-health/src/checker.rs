//! Health check probe logic.
//!
//! A [`HealthChecker`] is built from a port configuration and probes one
//! `(host, port)` pair. Probes never return errors: anything that goes wrong
//! is reported as [`ProbeResult::Unhealthy`] or [`ProbeResult::Failed`].

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use appdeck_exec::{CommandBackend, CommandRequest};
use appdeck_state::{HealthCheckType, PortConfiguration, StepKind};

use crate::error::HealthError;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The target answered as configured.
    Healthy,
    /// The probe ran but the success criterion did not hold.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        *self == ProbeResult::Healthy
    }
}

/// Probe strategy for one port configuration.
#[derive(Debug, Clone)]
pub enum HealthChecker {
    TcpConnect,
    /// Binds a local UDP socket and connects it to the target. This proves
    /// that a route exists, not that anything is listening.
    UdpPortCheck,
    Command {
        /// Command line with `{HOST}` and `{PORT}` tokens.
        command: String,
        success_exit_code: i32,
        /// Takes precedence over the exit code when set.
        success_output_regex: Option<Regex>,
    },
}

impl HealthChecker {
    pub fn from_config(port: &PortConfiguration) -> Result<Self, HealthError> {
        match port.health_check_type {
            HealthCheckType::TcpConnect => Ok(Self::TcpConnect),
            HealthCheckType::UdpPortCheck => Ok(Self::UdpPortCheck),
            HealthCheckType::Command => {
                let invalid = |reason: String| HealthError::InvalidConfig {
                    port_id: port.id.clone(),
                    reason,
                };
                let config = &port.health_check_config;
                let command = config
                    .get("command")
                    .and_then(Value::as_str)
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| invalid("missing `command`".to_string()))?
                    .to_string();
                let success_exit_code = match config.get("success_exit_code") {
                    None | Some(Value::Null) => 0,
                    Some(v) => v
                        .as_i64()
                        .and_then(|c| i32::try_from(c).ok())
                        .ok_or_else(|| invalid(format!("bad `success_exit_code`: {v}")))?,
                };
                let success_output_regex = match config
                    .get("success_output_regex")
                    .and_then(Value::as_str)
                {
                    Some(pattern) => Some(Regex::new(pattern).map_err(|e| invalid(e.to_string()))?),
                    None => None,
                };
                Ok(Self::Command {
                    command,
                    success_exit_code,
                    success_output_regex,
                })
            }
        }
    }

    /// Run a single probe against `host:port`.
    pub async fn probe(
        &self,
        backend: &dyn CommandBackend,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> ProbeResult {
        match self {
            HealthChecker::TcpConnect => tcp_probe(host, port, timeout).await,
            HealthChecker::UdpPortCheck => udp_probe(host, port, timeout).await,
            HealthChecker::Command {
                command,
                success_exit_code,
                success_output_regex,
            } => {
                let request = CommandRequest {
                    content: command
                        .replace("{HOST}", host)
                        .replace("{PORT}", &port.to_string()),
                    kind: StepKind::Command,
                    working_directory: None,
                    use_sudo: false,
                    timeout,
                    env: BTreeMap::new(),
                    host: None,
                };
                match backend.execute(&request).await {
                    Ok(output) => {
                        let healthy = match success_output_regex {
                            Some(re) => re.is_match(&output.merged()),
                            None => output.exit_code == *success_exit_code,
                        };
                        if healthy {
                            ProbeResult::Healthy
                        } else {
                            debug!(host, port, exit_code = output.exit_code, "health command did not succeed");
                            ProbeResult::Unhealthy
                        }
                    }
                    Err(e) => {
                        debug!(host, port, error = %e, "health command failed to run");
                        ProbeResult::Failed
                    }
                }
            }
        }
    }

    /// Probe up to `1 + retries` times, stopping at the first healthy
    /// result. Returns the last result and the number of attempts made.
    pub async fn probe_with_retries(
        &self,
        backend: &dyn CommandBackend,
        host: &str,
        port: u16,
        timeout: Duration,
        retries: u32,
    ) -> (ProbeResult, u32) {
        let max_attempts = retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.probe(backend, host, port, timeout).await;
            if result.is_healthy() || attempt >= max_attempts {
                return (result, attempt);
            }
        }
    }
}

/// Open a TCP connection within `timeout`, then close it.
pub async fn tcp_probe(host: &str, port: u16, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "tcp probe connection failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(host, port, "tcp probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Bind an ephemeral UDP socket and connect it to `host:port`.
pub async fn udp_probe(host: &str, port: u16, timeout: Duration) -> ProbeResult {
    let attempt = async {
        let target = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| std::io::Error::other("host did not resolve"))?;
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok::<_, std::io::Error>(())
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "udp probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(host, port, "udp probe timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use appdeck_exec::ShellBackend;
    use appdeck_state::Protocol;

    use super::*;

    fn port_config(kind: HealthCheckType, config: Value) -> PortConfiguration {
        PortConfiguration {
            id: "http".to_string(),
            port: 8080,
            protocol: Protocol::Tcp,
            description: None,
            health_check_type: kind,
            health_check_config: config,
            health_check_interval_secs: 60,
            health_check_timeout_secs: 1,
            health_check_retries: 0,
        }
    }

    /// A port that was listening a moment ago and is now closed.
    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn tcp_probe_to_listener_is_healthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(
            tcp_probe("127.0.0.1", port, Duration::from_secs(1)).await,
            ProbeResult::Healthy
        );
    }

    #[tokio::test]
    async fn tcp_probe_to_closed_port_fails() {
        let port = closed_port().await;
        assert_eq!(
            tcp_probe("127.0.0.1", port, Duration::from_millis(500)).await,
            ProbeResult::Failed
        );
    }

    #[tokio::test]
    async fn udp_probe_succeeds_locally() {
        assert_eq!(
            udp_probe("127.0.0.1", 5353, Duration::from_secs(1)).await,
            ProbeResult::Healthy
        );
    }

    #[test]
    fn builds_checkers_from_config() {
        assert!(matches!(
            HealthChecker::from_config(&port_config(HealthCheckType::TcpConnect, json!({}))),
            Ok(HealthChecker::TcpConnect)
        ));
        let checker = HealthChecker::from_config(&port_config(
            HealthCheckType::Command,
            json!({"command": "redis-cli -h {HOST} -p {PORT} ping", "success_output_regex": "PONG"}),
        ))
        .unwrap();
        match checker {
            HealthChecker::Command {
                success_exit_code,
                success_output_regex,
                ..
            } => {
                assert_eq!(success_exit_code, 0);
                assert!(success_output_regex.is_some());
            }
            other => panic!("unexpected checker {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_command_config() {
        let missing = HealthChecker::from_config(&port_config(HealthCheckType::Command, json!({})));
        assert!(matches!(missing, Err(HealthError::InvalidConfig { .. })));

        let bad_regex = HealthChecker::from_config(&port_config(
            HealthCheckType::Command,
            json!({"command": "true", "success_output_regex": "("}),
        ));
        assert!(matches!(bad_regex, Err(HealthError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn command_probe_substitutes_host_and_port() {
        let backend = ShellBackend::new("/bin/sh");
        let checker = HealthChecker::Command {
            command: "test {HOST} = 127.0.0.1 && test {PORT} = 6379".to_string(),
            success_exit_code: 0,
            success_output_regex: None,
        };
        let result = checker
            .probe(&backend, "127.0.0.1", 6379, Duration::from_secs(5))
            .await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn command_probe_honours_exit_code_and_regex() {
        let backend = ShellBackend::new("/bin/sh");

        let by_code = HealthChecker::Command {
            command: "exit 3".to_string(),
            success_exit_code: 3,
            success_output_regex: None,
        };
        assert_eq!(
            by_code.probe(&backend, "localhost", 1, Duration::from_secs(5)).await,
            ProbeResult::Healthy
        );

        // The regex wins over a successful exit code.
        let by_regex = HealthChecker::Command {
            command: "echo degraded".to_string(),
            success_exit_code: 0,
            success_output_regex: Some(Regex::new("^ok").unwrap()),
        };
        assert_eq!(
            by_regex.probe(&backend, "localhost", 1, Duration::from_secs(5)).await,
            ProbeResult::Unhealthy
        );
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let backend = ShellBackend::new("/bin/sh");
        let port = closed_port().await;
        let (result, attempts) = HealthChecker::TcpConnect
            .probe_with_retries(&backend, "127.0.0.1", port, Duration::from_millis(200), 2)
            .await;
        assert_eq!(result, ProbeResult::Failed);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn retries_stop_on_success() {
        let backend = ShellBackend::new("/bin/sh");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (result, attempts) = HealthChecker::TcpConnect
            .probe_with_retries(&backend, "127.0.0.1", port, Duration::from_secs(1), 5)
            .await;
        assert_eq!(result, ProbeResult::Healthy);
        assert_eq!(attempts, 1);
    }
}
