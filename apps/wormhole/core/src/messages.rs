use serde::{Deserialize, Serialize};

pub const AUTH_CONTROL: u8 = 1;
pub const AUTH_TUNNEL: u8 = 2;
pub const OPEN_TUNNEL: u8 = 3;
pub const PING: u8 = 4;
pub const PONG: u8 = 5;
pub const SHUTDOWN: u8 = 6;
pub const RELEASE: u8 = 7;

/// Exec request the ssh transport uses in place of a `Release` frame; the
/// release follows as JSON after one space.
pub const SSH_RELEASE_COMMAND: &str = "wormhole-release";

/// First frame on a control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthControl {
    pub token: String,
}

/// Only frame on the first TLS phase of a tunnel connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTunnel {
    /// Session id the tunnel belongs to.
    pub client_id: String,
    pub token: String,
}

/// Server request for one more tunnel connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTunnel {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {
    pub error: String,
}

/// VCS metadata describing what the agent is serving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Release {
    pub id: String,
    pub branch: String,
    pub description: String,
    pub vcs_type: String,
    pub vcs_revision: String,
    pub vcs_revision_message: String,
    pub vcs_revision_time: String,
    pub author_name: String,
    pub author_email: String,
}

impl Release {
    /// Field/value pairs in wire order, used when persisting a release.
    pub fn fields(&self) -> [(&'static str, &str); 9] {
        [
            ("id", self.id.as_str()),
            ("branch", self.branch.as_str()),
            ("description", self.description.as_str()),
            ("vcs_type", self.vcs_type.as_str()),
            ("vcs_revision", self.vcs_revision.as_str()),
            ("vcs_revision_message", self.vcs_revision_message.as_str()),
            ("vcs_revision_time", self.vcs_revision_time.as_str()),
            ("author_name", self.author_name.as_str()),
            ("author_email", self.author_email.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AuthControl(AuthControl),
    AuthTunnel(AuthTunnel),
    OpenTunnel(OpenTunnel),
    Ping,
    Pong,
    Shutdown(Shutdown),
    Release(Release),
}

impl Message {
    pub fn auth_control(token: impl Into<String>) -> Self {
        Message::AuthControl(AuthControl {
            token: token.into(),
        })
    }

    pub fn auth_tunnel(client_id: impl Into<String>, token: impl Into<String>) -> Self {
        Message::AuthTunnel(AuthTunnel {
            client_id: client_id.into(),
            token: token.into(),
        })
    }

    pub fn open_tunnel(client_id: impl Into<String>) -> Self {
        Message::OpenTunnel(OpenTunnel {
            client_id: client_id.into(),
        })
    }

    pub fn shutdown(error: impl Into<String>) -> Self {
        Message::Shutdown(Shutdown {
            error: error.into(),
        })
    }

    pub fn tag(&self) -> u8 {
        match self {
            Message::AuthControl(_) => AUTH_CONTROL,
            Message::AuthTunnel(_) => AUTH_TUNNEL,
            Message::OpenTunnel(_) => OPEN_TUNNEL,
            Message::Ping => PING,
            Message::Pong => PONG,
            Message::Shutdown(_) => SHUTDOWN,
            Message::Release(_) => RELEASE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::AuthControl(_) => "auth_control",
            Message::AuthTunnel(_) => "auth_tunnel",
            Message::OpenTunnel(_) => "open_tunnel",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Shutdown(_) => "shutdown",
            Message::Release(_) => "release",
        }
    }
}
