//! Per-connection read/write loops for each transport.
//!
//! Every connection runs as a reader task and a writer task. The reader
//! decodes inbound bytes and feeds the [`Dispatcher`](crate::module::Dispatcher);
//! the writer drains the session's outbound queue and emits periodic
//! heartbeats. Whichever finishes first ends the connection, after which the
//! state machine is closed and the session unregistered exactly once.

pub(crate) mod tcp;
pub(crate) mod udp;
pub(crate) mod websocket;

use crate::config::GatewayConfig;
use crate::heartbeat::KeepAlive;
use crate::message::{Message, MessageType};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Interval;

/// How long a closing WebSocket waits for the peer's close frame.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timer settings shared by all transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Period of outgoing heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// Close after this much inbound silence
    pub idle_timeout: Option<Duration>,
    /// Read buffer size for raw transports
    pub read_buffer_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for SessionSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
            read_buffer_size: config.read_buffer_size,
        }
    }
}

impl SessionSettings {
    pub(crate) fn heartbeat_ticker(&self) -> Option<Interval> {
        self.heartbeat_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        })
    }

    /// Time left before `keep_alive` expires, if the check is enabled.
    pub(crate) fn idle_remaining(&self, keep_alive: &KeepAlive) -> Option<Duration> {
        self.idle_timeout
            .map(|timeout| timeout.saturating_sub(keep_alive.idle_for()))
    }
}

/// Resolves on the next tick, or never when heartbeats are disabled.
pub(crate) async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sleeps for `duration`, or forever when there is no deadline.
pub(crate) async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// What a raw (TCP/UDP) writer does with a queued message.
pub(crate) enum RawOutbound {
    Write(Bytes),
    Skip,
    Close,
}

impl From<Message> for RawOutbound {
    fn from(message: Message) -> Self {
        match message.msg_type {
            MessageType::Text | MessageType::Binary => RawOutbound::Write(message.data),
            MessageType::Ping | MessageType::Pong => RawOutbound::Skip,
            MessageType::Close => RawOutbound::Close,
        }
    }
}
