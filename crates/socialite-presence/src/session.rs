//! Transport-neutral drivers for status and party sessions.
//!
//! The HTTP layer adapts its websocket into a [`Frame`] stream and a `String`
//! sink; everything after the upgrade happens here.

use std::fmt::Display;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{PartySession, PresenceEngine, StatusSession};
use crate::identity::UserId;
use crate::messages::{parse_inbound, InboundMessage, StatusMessage};
use crate::registry::ConnectionHandle;

/// A client frame, reduced to what the sessions care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
    /// Binary, ping/pong and anything else the transport surfaces.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    ReadError,
    WriteFailed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Heartbeat,
    Ignored,
}

/// Handles one client text frame: a ping is answered with a pong on the
/// session's own channel and counted as a heartbeat.
pub async fn handle_inbound(
    engine: &PresenceEngine,
    user: &UserId,
    reply: &ConnectionHandle,
    text: &str,
) -> InboundOutcome {
    match parse_inbound(text) {
        Ok(InboundMessage::Ping) => {
            if let Err(err) = reply.try_deliver(StatusMessage::Pong.to_json()) {
                debug!(user = %user, "pong not queued: {err}");
            }
            engine.submit_heartbeat(user).await;
            InboundOutcome::Heartbeat
        }
        Err(err) => {
            warn!(user = %user, "ignoring client message: {err}");
            InboundOutcome::Ignored
        }
    }
}

/// Runs a status session until the client leaves, a write fails, the
/// session is closed through the engine, or the engine shuts down. The
/// session is always deregistered on exit.
pub async fn drive_status_session<R, E, W>(
    engine: &PresenceEngine,
    session: StatusSession,
    reader: R,
    writer: W,
) -> SessionEnd
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
    W: Sink<String> + Unpin,
    W::Error: Display,
{
    let StatusSession {
        user,
        handle,
        outbound,
    } = session;
    info!(user = %user, session = handle.session_id(), "status session open");

    // The close token is a child of the engine shutdown token.
    let end = tokio::select! {
        end = read_loop(engine, &user, &handle, reader) => end,
        end = write_loop(outbound, writer) => end,
        _ = handle.closed() => SessionEnd::Cancelled,
    };

    engine.end_status_session(&user, handle.session_id());
    info!(user = %user, session = handle.session_id(), end = ?end, "status session closed");
    end
}

/// Runs a party session. The snapshot poller stops when this returns.
pub async fn drive_party_session<R, E, W>(
    engine: &PresenceEngine,
    session: PartySession,
    reader: R,
    writer: W,
) -> SessionEnd
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
    W: Sink<String> + Unpin,
    W::Error: Display,
{
    let PartySession {
        party,
        user,
        reply,
        outbound,
        poller,
        _stop_poller,
    } = session;
    info!(party = %party, user = %user, "party session open");

    let shutdown = engine.shutdown_token();
    let end = tokio::select! {
        end = read_loop(engine, &user, &reply, reader) => end,
        end = write_loop(outbound, writer) => end,
        _ = shutdown.cancelled() => SessionEnd::Cancelled,
    };

    drop(_stop_poller);
    if let Err(err) = poller.await {
        warn!(party = %party, user = %user, "party poller ended abnormally: {err}");
    }
    engine.end_party_session();
    info!(party = %party, user = %user, end = ?end, "party session closed");
    end
}

async fn read_loop<R, E>(
    engine: &PresenceEngine,
    user: &UserId,
    reply: &ConnectionHandle,
    mut reader: R,
) -> SessionEnd
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Frame::Text(text)) => {
                handle_inbound(engine, user, reply, &text).await;
            }
            Ok(Frame::Close) => return SessionEnd::ClientClosed,
            Ok(Frame::Other) => debug!(user = %user, "ignoring non-text frame"),
            Err(err) => {
                warn!(user = %user, "session read failed: {err}");
                return SessionEnd::ReadError;
            }
        }
    }
    SessionEnd::ClientClosed
}

async fn write_loop<W>(mut outbound: mpsc::Receiver<String>, mut writer: W) -> SessionEnd
where
    W: Sink<String> + Unpin,
    W::Error: Display,
{
    while let Some(text) = outbound.recv().await {
        if let Err(err) = writer.send(text).await {
            debug!("session write failed: {err}");
            return SessionEnd::WriteFailed;
        }
    }
    SessionEnd::Cancelled
}
