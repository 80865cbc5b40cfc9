pub mod codec;
pub mod messages;
pub mod tls;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{ControlCodec, CodecError, MAX_FRAME_LEN};
pub use messages::{
    AuthControl, AuthTunnel, Message, OpenTunnel, Release, Shutdown, SSH_RELEASE_COMMAND,
};
pub use tls::{ClientTls, ServerTls, TlsError};

/// How often the agent sends `Ping` on the control connection.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
/// Server side: a session without a `Ping` for this long is expired.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(30);
/// Agent side: the control connection is dropped after this long without a `Pong`.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(15);
/// Period of the per-session watchdog and tunnel top-up.
pub const DEFAULT_CONN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Any bidirectional byte stream a control channel can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn Stream>;
