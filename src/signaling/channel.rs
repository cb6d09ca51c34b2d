use crate::error::ChatError;
use crate::signaling::events::{
    decode_server_event, encode_client_event, ClientEvent, ServerEvent, SignalingHandle,
};
use futures_util::{Sink, SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// WebSocket connection to the matchmaking relay.
///
/// Outbound events go through the [`SignalingHandle`]; inbound events are
/// delivered in order on the receiver returned by [`take_inbound`].
///
/// [`take_inbound`]: SignalingChannel::take_inbound
pub struct SignalingChannel {
    handle: SignalingHandle,
    inbound: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    close_tx: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SignalingChannel {
    /// Opens the relay socket. Any failure here is fatal for the session.
    pub async fn connect(server_url: &str, connect_timeout: Duration) -> Result<Self, ChatError> {
        let url =
            Url::parse(server_url).map_err(|e| ChatError::ChannelUnavailable(e.to_string()))?;
        info!("connecting to relay {url}");

        let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ChatError::ChannelUnavailable(format!(
                    "no answer from {url} within {}s",
                    connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| ChatError::ChannelUnavailable(e.to_string()))?;
        info!("relay connected");

        let (mut sink, mut stream) = ws.split();
        let (handle, mut outbound) = SignalingHandle::channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    next = outbound.recv() => match next {
                        Some(event) => {
                            if !write_event(&mut sink, &event).await {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut close_rx => {
                        // anything queued before close() still goes out
                        while let Ok(event) = outbound.try_recv() {
                            if !write_event(&mut sink, &event).await {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("relay writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match decode_server_event(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("skipping relay frame: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        info!("relay closed the connection: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("relay read failed: {e}");
                        break;
                    }
                }
            }
            debug!("relay reader finished");
        });

        Ok(Self {
            handle,
            inbound: Some(inbound),
            close_tx: Some(close_tx),
            writer,
            reader,
        })
    }

    pub fn handle(&self) -> SignalingHandle {
        self.handle.clone()
    }

    /// Inbound event stream; `None` after the first call.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.inbound.take()
    }

    /// Writes every queued event and a close frame, then stops the reader.
    pub async fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.writer).await {
            debug!("relay writer ended abnormally: {e}");
        }
        self.reader.abort();
        info!("relay connection closed");
    }
}

/// Sends one event. Unencodable events are skipped; false means the socket is gone.
async fn write_event<S>(sink: &mut S, event: &ClientEvent) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let text = match encode_client_event(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("dropping {}: {e}", event.name());
            return true;
        }
    };
    match sink.send(Message::text(text)).await {
        Ok(()) => true,
        Err(e) => {
            warn!("relay write failed: {e}");
            false
        }
    }
}
