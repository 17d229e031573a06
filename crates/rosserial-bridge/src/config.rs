//! Parameterization surface of the bridge. Loading these from a file or a
//! command line is the embedding daemon's business.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs shared by every session regardless of transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Per-read deadline on the link. The sync budget is three times this.
    #[serde(default = "default_link_timeout")]
    pub link_timeout: Duration,
    /// Pause after opening the link, letting device boot-loaders hand off.
    #[serde(default = "default_boot_grace")]
    pub boot_grace: Duration,
    /// Pause before the first topic negotiation request.
    #[serde(default = "default_negotiate_delay")]
    pub negotiate_delay: Duration,
    /// How long a middleware service caller waits for the device's reply.
    #[serde(default = "default_service_timeout")]
    pub service_timeout: Duration,
}

fn default_link_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_boot_grace() -> Duration {
    Duration::from_millis(100)
}

fn default_negotiate_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_service_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link_timeout: default_link_timeout(),
            boot_grace: default_boot_grace(),
            negotiate_delay: default_negotiate_delay(),
            service_timeout: default_service_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_baud() -> u32 {
    57_600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpConfig {
    pub port: u16,
    /// Run each accepted connection's session on its own thread instead of
    /// inline on the accept loop.
    #[serde(default)]
    pub spawn_sessions: bool,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UdpConfig {
    pub port: u16,
    #[serde(default)]
    pub session: SessionConfig,
}
