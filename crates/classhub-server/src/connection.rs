//! The tasks behind one WebSocket: read pump, write pump and the
//! registration countdown.
//!
//! The pumps are generic over any `Stream`/`Sink` of axum WebSocket frames.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use classhub_settings::ServerSettings;

use crate::client::ClientHandle;
use crate::hub::HubHandle;
use crate::processor::{Flow, Processor};

/// Timing limits of one connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionLimits {
    /// Read deadline, refreshed by every inbound frame.
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub registration_timeout: Duration,
}

impl From<&ServerSettings> for ConnectionLimits {
    fn from(s: &ServerSettings) -> Self {
        Self {
            pong_wait: s.pong_wait(),
            ping_period: s.ping_period(),
            write_wait: s.write_wait(),
            registration_timeout: s.registration_timeout(),
        }
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        (&ServerSettings::default()).into()
    }
}

/// Drive an admitted connection until either pump stops, then leave the Hub.
///
/// The client joins the Hub first (evicting any older connection with the
/// same id) and has `registration_timeout` to send a valid Register.
pub async fn run_connection<W, R, E>(
    sink: W,
    stream: R,
    outbound: mpsc::Receiver<String>,
    processor: Processor,
    hub: HubHandle,
    limits: ConnectionLimits,
) where
    W: Sink<WsMessage> + Unpin + Send + 'static,
    W::Error: Display + Send + 'static,
    R: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let client = processor.client().clone();
    if let Err(error) = hub.register(client.clone()).await {
        warn!(client_id = %client.id, %error, "could not join hub");
        return;
    }
    info!(client_id = %client.id, unit_id = %client.unit_id, conn_id = %client.conn_id, "client connected");

    let countdown = spawn_registration_countdown(client.clone(), hub.clone(), limits.registration_timeout);
    let mut writer = tokio::spawn(write_pump(sink, outbound, limits.ping_period, limits.write_wait));
    let mut reader = tokio::spawn(read_pump(stream, processor, limits.pong_wait));

    tokio::select! {
        _ = &mut reader => {}
        _ = &mut writer => {
            reader.abort();
        }
    }

    client.cancel_registration();
    if let Err(error) = hub.unregister(&client).await {
        debug!(client_id = %client.id, %error, "hub gone during disconnect");
    }
    // Still registered under another path (e.g. the Hub stopped): close our
    // own queue so the writer flushes and exits.
    client.close_outbound();
    if !writer.is_finished() && timeout(limits.write_wait, &mut writer).await.is_err() {
        writer.abort();
    }
    countdown.abort();
    info!(client_id = %client.id, unit_id = %client.unit_id, conn_id = %client.conn_id, "client disconnected");
}

/// Evict the client if it has not registered within `window`.
pub fn spawn_registration_countdown(
    client: Arc<ClientHandle>,
    hub: HubHandle,
    window: Duration,
) -> JoinHandle<()> {
    let token = client.registration_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(window) => {
                if client.is_registered() {
                    return;
                }
                info!(client_id = %client.id, unit_id = %client.unit_id, "registration window elapsed");
                if let Err(error) = hub.unregister(&client).await {
                    debug!(client_id = %client.id, %error, "hub gone before eviction");
                }
            }
        }
    })
}

/// Read frames into the processor until the peer closes, errors, goes
/// quiet for `pong_wait`, or the processor logs the client out.
pub async fn read_pump<R, E>(mut stream: R, mut processor: Processor, pong_wait: Duration)
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let client_id = processor.client().id.clone();
    loop {
        let frame = match timeout(pong_wait, stream.next()).await {
            Err(_) => {
                debug!(%client_id, "read deadline elapsed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                debug!(%client_id, %error, "read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            WsMessage::Text(text) => {
                if processor.process(text.as_str()).await == Flow::Terminate {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            // Pings, pongs and binary frames only refresh the deadline.
            _ => {}
        }
    }
}

/// Flush queued messages and keepalive pings. A closed queue sends a Close
/// frame and ends the pump; a send slower than `write_wait` is a failure.
pub async fn write_pump<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<String>,
    ping_period: Duration,
    write_wait: Duration,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(text) => {
                    if !send_within(&mut sink, WsMessage::Text(text.into()), write_wait).await {
                        break;
                    }
                }
                None => {
                    send_within(&mut sink, WsMessage::Close(None), write_wait).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if !send_within(&mut sink, WsMessage::Ping(Bytes::new()), write_wait).await {
                    break;
                }
            }
        }
    }
}

async fn send_within<W>(sink: &mut W, frame: WsMessage, write_wait: Duration) -> bool
where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            debug!(%error, "write failed");
            false
        }
        Err(_) => {
            debug!("write deadline elapsed");
            false
        }
    }
}
