use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use wormhole_core::{BoxedStream, ControlCodec, Message};

use super::{SessionCore, SessionError};
use crate::store::StoreError;
use crate::telemetry::HEARTBEAT_TIMEOUTS_TOTAL;

/// Outbound control frames queued per session.
pub(super) const CONTROL_QUEUE: usize = 64;
const WRITER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The agent closed the control connection.
    ControlClosed,
    HeartbeatTimeout,
    /// The agent sent `Shutdown`.
    AgentShutdown(String),
    ProtocolError(&'static str),
    StoreUnavailable,
    ServerShutdown,
    /// Teardown was started by another task.
    Cancelled,
}

impl CloseReason {
    /// Text of the `Shutdown` frame sent to the agent, if any.
    fn notice(&self) -> Option<String> {
        match self {
            CloseReason::ControlClosed | CloseReason::AgentShutdown(_) => None,
            CloseReason::HeartbeatTimeout => Some("heartbeat timeout".into()),
            CloseReason::ProtocolError(what) => Some(format!("protocol error: {what}")),
            CloseReason::StoreUnavailable => Some("session store unavailable".into()),
            CloseReason::ServerShutdown => Some("server shutting down".into()),
            CloseReason::Cancelled => Some("session closed".into()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ControlClosed => f.write_str("control connection closed"),
            CloseReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            CloseReason::AgentShutdown(error) if error.is_empty() => f.write_str("agent shutdown"),
            CloseReason::AgentShutdown(error) => write!(f, "agent shutdown: {error}"),
            CloseReason::ProtocolError(what) => write!(f, "protocol error: {what}"),
            CloseReason::StoreUnavailable => f.write_str("session store unavailable"),
            CloseReason::ServerShutdown => f.write_str("server shutdown"),
            CloseReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A session driven by a framed control connection.
#[async_trait]
pub(crate) trait ControlSession: Send + Sync + 'static {
    fn core(&self) -> &SessionCore;

    fn control(&self) -> &mpsc::Sender<Message>;

    /// Periodic maintenance, run every `conn_check_interval`.
    fn on_tick(&self) {}

    /// Full teardown. Must be idempotent.
    async fn close(&self, reason: CloseReason);
}

/// Runs the control loop until the session ends, then tears it down.
pub(crate) async fn serve_control<S: ControlSession>(
    session: Arc<S>,
    framed: Framed<BoxedStream, ControlCodec>,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) -> CloseReason {
    let (mut sink, mut frames) = framed.split();
    let session_id = session.core().id().to_string();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let last = matches!(message, Message::Shutdown(_));
            trace!(message = message.name(), "control write");
            if let Err(err) = sink.send(message).await {
                debug!(error = %err, "control write failed");
                return;
            }
            if last {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let core = session.core();
    let cancelled = core.cancelled();
    let mut tick = interval(core.config().conn_check_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break CloseReason::ServerShutdown,
            _ = cancelled.cancelled() => break CloseReason::Cancelled,
            _ = tick.tick() => {
                if core.heartbeat_expired() {
                    counter!(HEARTBEAT_TIMEOUTS_TOTAL, 1);
                    warn!(session_id = %session_id, "no ping within timeout");
                    break CloseReason::HeartbeatTimeout;
                }
                session.on_tick();
            }
            frame = frames.next() => match frame {
                None => break CloseReason::ControlClosed,
                Some(Err(err)) => {
                    warn!(session_id = %session_id, error = %err, "bad control frame");
                    break CloseReason::ProtocolError("malformed frame");
                }
                Some(Ok(message)) => {
                    if let Err(reason) = handle_message(session.as_ref(), message).await {
                        break reason;
                    }
                }
            },
        }
    };

    match reason.notice() {
        Some(notice) => {
            if session.control().try_send(Message::shutdown(notice)).is_ok() {
                if timeout(WRITER_GRACE, &mut writer).await.is_err() {
                    writer.abort();
                }
            } else {
                writer.abort();
            }
        }
        None => writer.abort(),
    }
    session.close(reason.clone()).await;
    reason
}

async fn handle_message<S: ControlSession>(session: &S, message: Message) -> Result<(), CloseReason> {
    let core = session.core();
    match message {
        Message::Ping => {
            core.record_ping();
            if session.control().try_send(Message::Pong).is_err() {
                debug!(session_id = %core.id(), "control queue full, pong dropped");
            }
            core.touch_endpoints().await;
            Ok(())
        }
        Message::Pong => {
            core.record_ping();
            Ok(())
        }
        Message::Release(release) => match core.register_release(release).await {
            Ok(()) => Ok(()),
            Err(SessionError::Store(StoreError::Unavailable(err))) => {
                warn!(session_id = %core.id(), error = %err, "failed to record release");
                Err(CloseReason::StoreUnavailable)
            }
            Err(err) => {
                warn!(session_id = %core.id(), error = %err, "failed to record release");
                Ok(())
            }
        },
        Message::Shutdown(shutdown) => Err(CloseReason::AgentShutdown(shutdown.error)),
        other => {
            warn!(session_id = %core.id(), message = other.name(), "unexpected control message");
            Err(CloseReason::ProtocolError("unexpected message"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::tests::{agent, context};
    use crate::store::MemoryStore;
    use tokio::io::DuplexStream;

    struct Probe {
        core: SessionCore,
        control: mpsc::Sender<Message>,
        ticks: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ControlSession for Probe {
        fn core(&self) -> &SessionCore {
            &self.core
        }

        fn control(&self) -> &mpsc::Sender<Message> {
            &self.control
        }

        fn on_tick(&self) {
            self.ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        async fn close(&self, reason: CloseReason) {
            self.core.teardown(&reason).await;
        }
    }

    async fn start(
        config: SessionConfig,
    ) -> (
        Arc<MemoryStore>,
        Arc<Probe>,
        Framed<DuplexStream, ControlCodec>,
        CancellationToken,
        tokio::task::JoinHandle<CloseReason>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let core = SessionCore::establish(context(store.clone(), config), agent())
            .await
            .unwrap();
        let (control, outbound) = mpsc::channel(CONTROL_QUEUE);
        let probe = Arc::new(Probe {
            core,
            control,
            ticks: Default::default(),
        });
        let (server_io, agent_io) = tokio::io::duplex(4096);
        let framed = Framed::new(Box::new(server_io) as BoxedStream, ControlCodec);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve_control(
            Arc::clone(&probe),
            framed,
            outbound,
            shutdown.clone(),
        ));
        (store, probe, Framed::new(agent_io, ControlCodec), shutdown, task)
    }

    async fn next(agent: &mut Framed<DuplexStream, ControlCodec>) -> Option<Message> {
        timeout(Duration::from_secs(2), agent.next())
            .await
            .expect("control frame")
            .map(|frame| frame.unwrap())
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (_store, probe, mut agent, _shutdown, task) = start(SessionConfig::default()).await;
        agent.send(Message::Ping).await.unwrap();
        assert_eq!(next(&mut agent).await, Some(Message::Pong));

        drop(agent);
        let reason = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::ControlClosed);
        assert!(probe.core.is_closed());
    }

    #[tokio::test]
    async fn silent_agent_is_told_and_disconnected() {
        let config = SessionConfig {
            ping_timeout: Duration::from_millis(50),
            conn_check_interval: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let (store, probe, mut agent, _shutdown, task) = start(config).await;
        assert_eq!(
            next(&mut agent).await,
            Some(Message::shutdown("heartbeat timeout"))
        );
        let reason = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::HeartbeatTimeout);
        assert!(store.zscore("sessions:disconnected", probe.core.id()).is_some());
    }

    #[tokio::test]
    async fn second_auth_control_is_a_protocol_error() {
        let (_store, _probe, mut agent, _shutdown, task) = start(SessionConfig::default()).await;
        agent.send(Message::auth_control("fly_token")).await.unwrap();
        assert_eq!(
            next(&mut agent).await,
            Some(Message::shutdown("protocol error: unexpected message"))
        );
        let reason = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::ProtocolError("unexpected message"));
    }

    #[tokio::test]
    async fn server_shutdown_notifies_agent() {
        let (_store, _probe, mut agent, shutdown, task) = start(SessionConfig::default()).await;
        shutdown.cancel();
        assert_eq!(
            next(&mut agent).await,
            Some(Message::shutdown("server shutting down"))
        );
        assert_eq!(next(&mut agent).await, None);
        let reason = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::ServerShutdown);
    }

    #[tokio::test]
    async fn agent_shutdown_ends_session_quietly() {
        let (_store, _probe, mut agent, _shutdown, task) = start(SessionConfig::default()).await;
        agent.send(Message::shutdown("bye")).await.unwrap();
        let reason = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::AgentShutdown("bye".into()));
    }
}
