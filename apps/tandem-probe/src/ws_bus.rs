use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tandem_signal::{BusError, BusResult, Signal, SignalBus};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

const INBOUND_CAPACITY: usize = 512;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// [`SignalBus`] over one websocket to the relay.
///
/// Outbound signals go through a writer task; inbound frames are decoded by a
/// reader task and fanned out to subscribers. Losing the socket surfaces as a
/// single [`Signal::Disconnected`].
pub struct WsBus {
    peer_id: String,
    send_tx: mpsc::UnboundedSender<Message>,
    inbound: broadcast::Sender<Signal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsBus {
    pub async fn connect(relay_url: &str, peer_id: &str) -> BusResult<Self> {
        let url = relay_websocket_url(relay_url, peer_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| BusError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "tandem::probe", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        let inbound = broadcast::channel(INBOUND_CAPACITY).0;

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
        });

        let reader_tx = inbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => forward_frame(&reader_tx, &text),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => forward_frame(&reader_tx, &text),
                        Err(_) => {
                            tracing::debug!(target = "tandem::probe", "dropping non-utf8 frame")
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "tandem::probe",
                                    "relay websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "tandem::probe",
                                    "relay websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
            let _ = reader_tx.send(Signal::Disconnected);
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            peer_id: peer_id.to_string(),
            send_tx,
            inbound,
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

fn forward_frame(tx: &broadcast::Sender<Signal>, text: &str) {
    tracing::trace!(target = "tandem::probe", event = "ws_in", len = text.len());
    match Signal::from_frame(text) {
        Ok(signal) => {
            let _ = tx.send(signal);
        }
        Err(err) => {
            tracing::debug!(target = "tandem::probe", error = %err, "ignoring unknown relay frame");
        }
    }
}

impl SignalBus for WsBus {
    fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.inbound.subscribe()
    }

    fn emit(&self, signal: Signal) -> BusResult<()> {
        let frame = signal.to_frame()?;
        tracing::trace!(
            target = "tandem::probe",
            event = "ws_out",
            name = signal.name(),
            len = frame.len()
        );
        self.send_tx
            .send(Message::Text(frame))
            .map_err(|_| BusError::Closed)
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Normalises the relay address to a websocket URL and tags it with our id.
fn relay_websocket_url(relay_url: &str, peer_id: &str) -> BusResult<Url> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| BusError::Transport(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(BusError::Transport(format!(
                "unsupported relay scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| BusError::Transport("invalid websocket scheme".into()))?;
    url.query_pairs_mut().append_pair("peer", peer_id);
    url.set_fragment(None);
    Ok(url)
}
