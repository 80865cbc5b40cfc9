//! Runs the program being exposed as a child of the agent.

use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::AgentError;

const PORT_POLL: Duration = Duration::from_millis(100);

pub struct Supervisor {
    program: String,
    child: Child,
}

impl Supervisor {
    /// Starts `command` with `PORT` set to `port`.
    pub fn spawn(command: &[String], port: u16) -> Result<Self, AgentError> {
        let (program, args) = command
            .split_first()
            .ok_or(AgentError::Protocol("no program to run"))?;
        let child = Command::new(program)
            .args(args)
            .env("PORT", port.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                program: program.clone(),
                source,
            })?;
        info!(program = %program, pid = ?child.id(), port, "started program");
        Ok(Self {
            program: program.clone(),
            child,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Forwards a signal to the child, if it is still running.
    pub fn signal(&self, sig: Signal) {
        let Some(id) = self.child.id() else {
            return;
        };
        if let Err(err) = kill(Pid::from_raw(id as i32), sig) {
            warn!(program = %self.program, signal = ?sig, error = %err, "failed to signal program");
        }
    }

    /// Waits for the child, relaying SIGINT, SIGTERM and SIGHUP to it.
    pub async fn wait(mut self) -> Result<ExitStatus, AgentError> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                status = self.child.wait() => {
                    let status = status?;
                    info!(program = %self.program, %status, "program exited");
                    return Ok(status);
                }
                _ = interrupt.recv() => self.signal(Signal::SIGINT),
                _ = terminate.recv() => self.signal(Signal::SIGTERM),
                _ = hangup.recv() => self.signal(Signal::SIGHUP),
            }
        }
    }
}

/// Polls until something accepts connections on `addr`.
pub async fn wait_for_port(addr: &str, limit: Duration) -> Result<(), AgentError> {
    let deadline = Instant::now() + limit;
    loop {
        match TcpStream::connect(addr).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(AgentError::StartupTimeout(limit));
                }
                debug!(addr, error = %err, "local service not up yet");
            }
        }
        sleep(PORT_POLL).await;
    }
}

/// Shell-style exit code: the child's own code, or 128 plus the signal that
/// killed it.
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn child_sees_port_and_exit_code_is_kept() {
        let child = Supervisor::spawn(&sh(r#"test "$PORT" = 4321 && exit 7"#), 4321).unwrap();
        let status = timeout(Duration::from_secs(5), child.wait()).await.unwrap().unwrap();
        assert_eq!(exit_code(status), 7);
    }

    #[tokio::test]
    async fn signalled_child_exits_with_128_plus_signal() {
        let child = Supervisor::spawn(&sh("sleep 30"), 0).unwrap();
        child.signal(Signal::SIGTERM);
        let status = timeout(Duration::from_secs(5), child.wait()).await.unwrap().unwrap();
        assert_eq!(exit_code(status), 128 + Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = Supervisor::spawn(&["/nonexistent/wormhole-test".to_string()], 0)
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Spawn { .. }));
    }

    #[tokio::test]
    async fn port_wait_sees_listener_and_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        wait_for_port(&addr, Duration::from_secs(1)).await.unwrap();
        drop(listener);

        let err = wait_for_port(&addr, Duration::from_millis(250)).await.unwrap_err();
        assert!(matches!(err, AgentError::StartupTimeout(_)));
    }
}
