//! Per-connection read and write loops.
//!
//! Each accepted socket gets two halves: [`write_pump`] drains the session's
//! outbound queue to the wire and sends transport pings, [`read_pump`]
//! decodes inbound frames and hands them to the dispatcher. Either side
//! exiting unregisters the session, and closing the queue stops the other.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, histogram};
use opus_settings::ServerSettings;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::dispatcher::dispatch;
use super::frame::Frame;
use super::hub::HubHandle;
use super::session::{OutboundReceiver, Session};
use crate::errors::GatewayError;
use crate::metrics::names;

/// Per-connection settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PumpConfig {
    /// Outbound queue capacity.
    pub outbound_capacity: usize,
    /// Interval between transport pings.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is dropped.
    pub heartbeat_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerSettings> for PumpConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            outbound_capacity: settings.outbound_capacity,
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_timeout: settings.heartbeat_timeout(),
        }
    }
}

/// Why the write side stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteExit {
    /// The outbound queue was closed.
    QueueClosed,
    /// No inbound activity within the heartbeat timeout.
    TimedOut,
    /// Writing to the transport failed.
    SendFailed,
}

/// Why the read side stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadExit {
    /// The client sent a Close frame.
    ClientClosed,
    /// The transport ended without a Close frame.
    Eof,
    /// Reading from the transport failed.
    Error,
    /// The session was torn down from elsewhere.
    QueueClosed,
}

impl ReadExit {
    fn is_expected(self) -> bool {
        !matches!(self, Self::Error)
    }
}

/// Drain `outbound` to `sink` until the queue closes or the transport fails.
pub async fn write_pump<W>(
    mut sink: W,
    mut outbound: OutboundReceiver,
    session: Arc<Session>,
    hub: HubHandle,
    config: PumpConfig,
) -> WriteExit
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let interval = config.heartbeat_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.as_ref().into())).await {
                        warn!(session_id = %session.id(), error = %e, "websocket write failed");
                        break WriteExit::SendFailed;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break WriteExit::QueueClosed;
                }
            },
            _ = ticker.tick() => {
                let idle = session.idle_for();
                if idle > config.heartbeat_timeout {
                    warn!(session_id = %session.id(), ?idle, "client unresponsive, disconnecting");
                    break WriteExit::TimedOut;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break WriteExit::SendFailed;
                }
            }
        }
    };

    hub.unregister(session.id().clone()).await;
    let _ = sink.close().await;
    exit
}

/// Decode frames from `stream` and dispatch them until the connection ends.
pub async fn read_pump<S, E>(mut stream: S, session: Arc<Session>, hub: HubHandle) -> ReadExit
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let exit = loop {
        let next = tokio::select! {
            biased;
            () = session.outbound().closed() => break ReadExit::QueueClosed,
            next = stream.next() => next,
        };
        let message = match next {
            None => break ReadExit::Eof,
            Some(Err(e)) => {
                warn!(session_id = %session.id(), error = %e, "websocket read failed");
                break ReadExit::Error;
            }
            Some(Ok(message)) => message,
        };
        session.touch();

        let decoded = match &message {
            Message::Text(text) => Frame::decode(text.as_str()),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => Frame::decode(text),
                Err(_) => {
                    debug!(session_id = %session.id(), len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break ReadExit::ClientClosed,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        counter!(names::WS_FRAMES_RECEIVED_TOTAL).increment(1);

        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                counter!(names::WS_FRAMES_MALFORMED_TOTAL).increment(1);
                warn!(session_id = %session.id(), error = %e, "dropping malformed frame");
                continue;
            }
        };

        match dispatch(frame, &session, &hub).await {
            Ok(()) => {}
            Err(GatewayError::HubClosed) => break ReadExit::QueueClosed,
            Err(e) => warn!(session_id = %session.id(), error = %e, "dispatch failed"),
        }
    };

    hub.unregister(session.id().clone()).await;
    exit
}

/// Hand an upgraded socket to the hub and run it to completion.
pub async fn accept(socket: WebSocket, hub: HubHandle, config: PumpConfig) {
    let (sink, stream) = socket.split();
    serve_connection(sink, stream, hub, config).await;
}

/// Register a new session and drive both pump sides over `sink`/`stream`.
#[instrument(skip_all, fields(session_id))]
pub async fn serve_connection<W, S, E>(sink: W, stream: S, hub: HubHandle, config: PumpConfig)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (session, outbound) = Session::new(config.outbound_capacity);
    let _ = tracing::Span::current().record("session_id", session.id().as_str());

    if let Err(e) = hub.register(Arc::clone(&session)).await {
        warn!(error = %e, "rejecting connection");
        return;
    }
    info!(queue_capacity = session.outbound().capacity(), "client connected");

    match Frame::connected(session.id().as_str()).encode() {
        Ok(greeting) => {
            let _ = session.outbound().push(greeting);
        }
        Err(e) => warn!(error = %e, "failed to encode greeting"),
    }

    let writer = tokio::spawn(write_pump(
        sink,
        outbound,
        Arc::clone(&session),
        hub.clone(),
        config,
    ));
    let read_exit = read_pump(stream, Arc::clone(&session), hub).await;
    let write_exit = match writer.await {
        Ok(exit) => Some(exit),
        Err(e) => {
            warn!(error = %e, "write pump task failed");
            None
        }
    };

    let duration = session.age();
    histogram!(names::WS_CONNECTION_DURATION_SECONDS).record(duration.as_secs_f64());
    if read_exit.is_expected() {
        info!(
            ?read_exit,
            ?write_exit,
            dropped = session.outbound().dropped(),
            duration_secs = duration.as_secs_f64(),
            "client disconnected"
        );
    } else {
        warn!(
            ?read_exit,
            ?write_exit,
            dropped = session.outbound().dropped(),
            "client connection lost"
        );
    }
}
