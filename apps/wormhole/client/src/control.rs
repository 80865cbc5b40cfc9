//! The agent end of a control connection.

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use wormhole_core::{ControlCodec, Message, Release, Stream};

use crate::tunnel::Dialer;
use crate::AgentError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
/// `Shutdown` text the server sends when it rejects the token.
const AUTH_FAILED: &str = "authentication failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The agent itself is stopping.
    Cancelled,
    /// The server sent `Shutdown`.
    ServerShutdown(String),
    /// The server closed the connection without a word.
    Closed,
    PongTimeout,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Cancelled => f.write_str("cancelled"),
            Disconnect::ServerShutdown(error) if error.is_empty() => f.write_str("server shutdown"),
            Disconnect::ServerShutdown(error) => write!(f, "server shutdown: {error}"),
            Disconnect::Closed => f.write_str("connection closed"),
            Disconnect::PongTimeout => f.write_str("no pong within timeout"),
        }
    }
}

/// How one control connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    /// Whether the server ever showed it accepted the session.
    pub established: bool,
    pub cause: Disconnect,
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub release: Option<Release>,
}

/// Dials the server and drives one control connection until it ends.
pub async fn run_control(
    dialer: &Dialer,
    options: &ControlOptions,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, AgentError> {
    let stream = dialer.dial_control().await?;
    drive(stream, dialer, options, shutdown).await
}

/// Runs the control protocol over an already connected stream.
pub async fn drive<S: Stream>(
    stream: S,
    dialer: &Dialer,
    options: &ControlOptions,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, AgentError> {
    let mut framed = Framed::new(stream, ControlCodec);
    framed.send(Message::auth_control(dialer.token())).await?;
    if let Some(release) = &options.release {
        framed.send(Message::Release(release.clone())).await?;
    }
    // The server never acknowledges AuthControl; the first Pong or
    // OpenTunnel proves the token was accepted.
    framed.send(Message::Ping).await?;

    let tunnels = shutdown.child_token();
    let _stop_tunnels = tunnels.clone().drop_guard();
    let mut established = false;
    let mut last_pong = Instant::now();
    let mut ping = interval(options.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.reset();

    let cause = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if timeout(SHUTDOWN_GRACE, framed.send(Message::shutdown(""))).await.is_err() {
                    debug!("shutdown notice not delivered");
                }
                break Disconnect::Cancelled;
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > options.pong_timeout {
                    warn!(timeout = ?options.pong_timeout, "server stopped answering pings");
                    break Disconnect::PongTimeout;
                }
                trace!("ping");
                framed.send(Message::Ping).await?;
            }
            frame = framed.next() => match frame {
                None => break Disconnect::Closed,
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(Message::OpenTunnel(open))) => {
                    established = true;
                    spawn_tunnel(dialer.clone(), open.client_id, tunnels.clone());
                }
                Some(Ok(Message::Ping)) => framed.send(Message::Pong).await?,
                Some(Ok(Message::Pong)) => {
                    if !established {
                        info!("control connection established");
                    }
                    established = true;
                    last_pong = Instant::now();
                }
                Some(Ok(Message::Shutdown(notice))) => {
                    if !established && notice.error == AUTH_FAILED {
                        return Err(AgentError::AuthenticationFailed);
                    }
                    break Disconnect::ServerShutdown(notice.error);
                }
                Some(Ok(other)) => {
                    warn!(message = other.name(), "unexpected control message");
                    return Err(AgentError::Protocol("unexpected control message"));
                }
            },
        }
    };
    Ok(SessionEnd { established, cause })
}

fn spawn_tunnel(dialer: Dialer, session_id: String, cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = dialer.open_tunnel(&session_id, cancel).await {
            warn!(session_id, error = %err, "tunnel failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Proto;
    use crate::local_proxy::LocalProxy;
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    fn dialer() -> Dialer {
        let local = Arc::new(LocalProxy::new("127.0.0.1:9", None));
        Dialer::new(Proto::Tcp, "127.0.0.1:9", "fly_token", None, local).unwrap()
    }

    fn options() -> ControlOptions {
        ControlOptions {
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(15),
            release: None,
        }
    }

    async fn next(server: &mut Framed<DuplexStream, ControlCodec>) -> Message {
        timeout(Duration::from_secs(2), server.next())
            .await
            .expect("control frame")
            .expect("open connection")
            .expect("valid frame")
    }

    #[tokio::test]
    async fn handshake_announces_token_and_release() {
        let (agent_io, server_io) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_io, ControlCodec);
        let mut opts = options();
        opts.release = Some(Release {
            id: "v7".into(),
            ..Release::default()
        });
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { drive(agent_io, &dialer(), &opts, &shutdown).await })
        };

        assert_eq!(next(&mut server).await, Message::auth_control("fly_token"));
        match next(&mut server).await {
            Message::Release(release) => assert_eq!(release.id, "v7"),
            other => panic!("expected release, got {other:?}"),
        }
        assert_eq!(next(&mut server).await, Message::Ping);
        server.send(Message::Pong).await.unwrap();
        server.send(Message::shutdown("maintenance")).await.unwrap();

        let end = timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert!(end.established);
        assert_eq!(end.cause, Disconnect::ServerShutdown("maintenance".into()));
    }

    #[tokio::test]
    async fn rejected_token_is_an_authentication_failure() {
        let (agent_io, server_io) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_io, ControlCodec);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(async move { drive(agent_io, &dialer(), &options(), &shutdown).await });

        assert_eq!(next(&mut server).await, Message::auth_control("fly_token"));
        server.send(Message::shutdown("authentication failed")).await.unwrap();
        let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(AgentError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn server_pings_are_answered() {
        let (agent_io, server_io) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_io, ControlCodec);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(async move { drive(agent_io, &dialer(), &options(), &shutdown).await });

        next(&mut server).await;
        next(&mut server).await;
        server.send(Message::Ping).await.unwrap();
        assert_eq!(next(&mut server).await, Message::Pong);
        drop(server);

        let end = timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert!(!end.established);
        assert_eq!(end.cause, Disconnect::Closed);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (agent_io, server_io) = tokio::io::duplex(4096);
        let _server = Framed::new(server_io, ControlCodec);
        let opts = ControlOptions {
            ping_interval: Duration::from_millis(20),
            pong_timeout: Duration::from_millis(50),
            release: None,
        };
        let shutdown = CancellationToken::new();
        let end = timeout(Duration::from_secs(2), drive(agent_io, &dialer(), &opts, &shutdown))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.cause, Disconnect::PongTimeout);
    }

    #[tokio::test]
    async fn cancelling_sends_shutdown() {
        let (agent_io, server_io) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_io, ControlCodec);
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { drive(agent_io, &dialer(), &options(), &shutdown).await })
        };
        next(&mut server).await;
        next(&mut server).await;
        shutdown.cancel();
        assert_eq!(next(&mut server).await, Message::shutdown(""));
        let end = timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert_eq!(end.cause, Disconnect::Cancelled);
    }
}
