//! Connection configuration.

use std::time::Duration;

use clap::{Args, ValueEnum};
use hostbridge_core::WireFormat;

/// Default lifetime of requests created by the connection itself.
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_millis(1000);
/// Default number of handshake rounds before giving up.
pub const DEFAULT_HANDSHAKE_RETRY_COUNT: u32 = 60;
/// Default pause between handshake rounds.
pub const DEFAULT_HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Per-connection settings for expiration and handshake retries.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Lifetime given to messages the connection creates (handshake rounds,
    /// queue sends). Messages built by callers keep their own expiration.
    pub default_time_to_live: Duration,
    /// Maximum number of handshake rounds.
    pub max_handshake_retries: u32,
    /// Fixed delay between a failed handshake round and the next one.
    pub handshake_retry_delay: Duration,
    /// Encoding used on the transport.
    pub wire_format: WireFormat,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_time_to_live: DEFAULT_TIME_TO_LIVE,
            max_handshake_retries: DEFAULT_HANDSHAKE_RETRY_COUNT,
            handshake_retry_delay: DEFAULT_HANDSHAKE_RETRY_DELAY,
            wire_format: WireFormat::Json,
        }
    }
}

/// Wire format choice as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WireFormatArg {
    Json,
    Msgpack,
}

impl From<WireFormatArg> for WireFormat {
    fn from(arg: WireFormatArg) -> Self {
        match arg {
            WireFormatArg::Json => Self::Json,
            WireFormatArg::Msgpack => Self::MsgPack,
        }
    }
}

/// Command-line / environment form of [`ConnectionConfig`].
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Lifetime of connection-created requests, in milliseconds.
    #[arg(long, env = "HOSTBRIDGE_DEFAULT_TTL_MS", default_value_t = 1000)]
    pub default_ttl_ms: u64,

    /// Maximum number of handshake rounds.
    #[arg(long, env = "HOSTBRIDGE_MAX_HANDSHAKE_RETRIES", default_value_t = DEFAULT_HANDSHAKE_RETRY_COUNT)]
    pub max_handshake_retries: u32,

    /// Delay between handshake rounds, in milliseconds.
    #[arg(long, env = "HOSTBRIDGE_HANDSHAKE_RETRY_DELAY_MS", default_value_t = 100)]
    pub handshake_retry_delay_ms: u64,

    /// Encoding used on the transport.
    #[arg(long, env = "HOSTBRIDGE_WIRE_FORMAT", value_enum, default_value_t = WireFormatArg::Json)]
    pub wire_format: WireFormatArg,
}

impl From<ConnectionArgs> for ConnectionConfig {
    fn from(args: ConnectionArgs) -> Self {
        Self {
            default_time_to_live: Duration::from_millis(args.default_ttl_ms),
            max_handshake_retries: args.max_handshake_retries,
            handshake_retry_delay: Duration::from_millis(args.handshake_retry_delay_ms),
            wire_format: args.wire_format.into(),
        }
    }
}
