//! Broker transport
//!
//! Publishes generation requests on one channel and matches replies arriving
//! on another by correlation id, so requests and replies are fully decoupled:
//! the backend may answer out of order or not at all. A background client task
//! owns the TCP link to the broker and reconnects with exponential backoff
//! when it drops; a monitor task times out requests whose replies never came.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::application::ports::outbound::{
    ReplyStream, TransportError, TransportPort, TransportReply, TransportRequest,
};
use crate::domain::value_objects::CorrelationId;
use crate::infrastructure::config::BrokerConfig;
use crate::infrastructure::transport::pending::PendingMap;
use crate::infrastructure::transport::supervisor::{ConnectionSupervisor, LinkState};
use crate::infrastructure::transport::wire::{Envelope, Frame};

/// How long an unanswered liveness probe may hang before the link is dropped
const PROBE_GRACE_CAP: Duration = Duration::from_secs(30);

/// Outbound envelopes queued while the link is (re)connecting
const OUTBOUND_BUFFER: usize = 64;

pub struct BrokerTransport {
    outbound: mpsc::Sender<Envelope>,
    pending: Arc<PendingMap>,
    supervisor: Arc<ConnectionSupervisor>,
    request_channel: String,
    stale_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerTransport {
    /// Start the client and monitor tasks for the configured broker.
    ///
    /// The returned transport is usable immediately; requests submitted
    /// before the link is up wait in the outbound buffer and go out once the
    /// connection is established.
    pub fn connect(config: &BrokerConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let pending = Arc::new(PendingMap::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.initial_backoff(),
            config.max_backoff(),
            config.max_reconnect_attempts,
        ));

        let client = BrokerClient {
            addr: config.addr.clone(),
            reply_channel: config.reply_channel.clone(),
            request_channel: config.request_channel.clone(),
            idle_probe: config.idle_probe(),
            pending: Arc::clone(&pending),
            supervisor: Arc::clone(&supervisor),
            outbound_rx,
        };
        let client_task = tokio::spawn(client.run());
        let monitor_task = tokio::spawn(run_monitor(
            Arc::clone(&pending),
            config.monitor_interval(),
            config.stale_timeout(),
        ));

        Self {
            outbound: outbound_tx,
            pending,
            supervisor,
            request_channel: config.request_channel.clone(),
            stale_timeout: config.stale_timeout(),
            tasks: vec![client_task, monitor_task],
        }
    }

    pub fn supervisor(&self) -> Arc<ConnectionSupervisor> {
        Arc::clone(&self.supervisor)
    }

    /// In-flight correlation map, shared for periodic stats
    pub fn pending_map(&self) -> Arc<PendingMap> {
        Arc::clone(&self.pending)
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl TransportPort for BrokerTransport {
    async fn generate(&self, request: TransportRequest) -> Result<TransportReply, TransportError> {
        if self.supervisor.is_degraded() {
            return Err(TransportError::ConnectionLost(
                "broker link degraded, awaiting manual reset".to_string(),
            ));
        }

        let correlation_id = CorrelationId::new();
        let receiver = self.pending.register(correlation_id.clone()).await;

        let envelope = Envelope::new(
            self.request_channel.clone(),
            Frame::Request {
                correlation_id: correlation_id.clone(),
                session_key: request.session_key,
                messages: request.messages,
                params: request.params,
                tools: request.tools,
            },
        );
        // The deadline covers the outbound queue wait as well: the buffer
        // fills while the link is down, and callers queued behind it still
        // time out at the stale bound.
        let submit_and_wait = async {
            if self.outbound.send(envelope).await.is_err() {
                self.pending.forget(&correlation_id).await;
                return Err(TransportError::ConnectionLost(
                    "broker client task stopped".to_string(),
                ));
            }
            match receiver.await {
                Ok(result) => result,
                // Slot dropped without a result: the transport is shutting down
                Err(_) => Err(TransportError::ConnectionLost(
                    "broker transport shut down while request was in flight".to_string(),
                )),
            }
        };

        match tokio::time::timeout(self.stale_timeout, submit_and_wait).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.forget(&correlation_id).await;
                Err(TransportError::Timeout(self.stale_timeout))
            }
        }
    }

    /// The broker protocol has no incremental delivery, so a stream is the
    /// completed reply as a single increment.
    async fn generate_stream(
        &self,
        request: TransportRequest,
    ) -> Result<ReplyStream, TransportError> {
        let reply = self.generate(request).await?;
        Ok(Box::pin(futures_util::stream::once(async move {
            Ok(reply.text)
        })))
    }
}

/// Owns the TCP link: connects, reconnects, reads frames, writes frames
struct BrokerClient {
    addr: String,
    reply_channel: String,
    request_channel: String,
    idle_probe: Duration,
    pending: Arc<PendingMap>,
    supervisor: Arc<ConnectionSupervisor>,
    outbound_rx: mpsc::Receiver<Envelope>,
}

impl BrokerClient {
    async fn run(mut self) {
        loop {
            if self.supervisor.is_degraded() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            self.supervisor.set_state(LinkState::Connecting);
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    self.supervisor.record_success();
                    tracing::info!("Connected to broker at {}", self.addr);
                    self.drive(stream).await;
                    self.supervisor.set_state(LinkState::Disconnected);
                    // In-flight requests stay registered across the reconnect:
                    // the broker may still deliver their replies, and the
                    // monitor times out whatever never arrives.
                    let in_flight = self.pending.len().await;
                    if in_flight > 0 {
                        tracing::info!(
                            "Broker link dropped with {} request(s) awaiting replies",
                            in_flight
                        );
                    }
                }
                Err(e) => match self.supervisor.record_failure() {
                    Some(delay) => {
                        tracing::warn!(
                            "Broker connect to {} failed: {} - retrying in {}s",
                            self.addr,
                            e,
                            delay.as_secs()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            "Broker connect to {} failed: {} - attempt budget spent, link degraded",
                            self.addr,
                            e
                        );
                        self.pending
                            .drain_all(TransportError::ConnectionLost(
                                "broker link degraded".to_string(),
                            ))
                            .await;
                    }
                },
            }
        }
    }

    /// Pump one established connection until it dies or goes unresponsive
    async fn drive(&mut self, stream: TcpStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let probe_grace = self.idle_probe.min(PROBE_GRACE_CAP);
        let mut last_inbound = Instant::now();
        let mut awaiting_pong = false;
        let mut probe_sent_at = Instant::now();

        loop {
            let deadline = if awaiting_pong {
                probe_sent_at + probe_grace
            } else {
                last_inbound + self.idle_probe
            };

            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            last_inbound = Instant::now();
                            awaiting_pong = false;
                            if let Some(frame) = self.handle_line(&line).await {
                                if Self::write_frame(&mut writer, &self.request_channel, frame)
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::info!("Broker closed the connection");
                            return;
                        }
                        Err(e) => {
                            tracing::warn!("Broker read failed: {}", e);
                            return;
                        }
                    }
                }
                envelope = self.outbound_rx.recv() => {
                    let Some(envelope) = envelope else {
                        // Transport dropped; nothing left to pump
                        return;
                    };
                    if Self::write_envelope(&mut writer, &envelope).await.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if awaiting_pong {
                        tracing::warn!(
                            "Broker unresponsive for {}s after probe, dropping link",
                            probe_grace.as_secs()
                        );
                        return;
                    }
                    if Self::write_frame(&mut writer, &self.request_channel, Frame::Ping)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    awaiting_pong = true;
                    probe_sent_at = Instant::now();
                }
            }
        }
    }

    /// Process one inbound line; returns a frame to send back, if any
    async fn handle_line(&self, line: &str) -> Option<Frame> {
        let envelope = match Envelope::from_line(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Discarding malformed broker frame: {}", e);
                return None;
            }
        };
        if envelope.channel != self.reply_channel {
            tracing::debug!("Ignoring frame on channel {}", envelope.channel);
            return None;
        }

        match envelope.frame {
            Frame::Reply {
                correlation_id,
                text,
                actions,
            } => {
                let delivered = self
                    .pending
                    .resolve(&correlation_id, Ok(TransportReply { text, actions }))
                    .await;
                if !delivered {
                    tracing::debug!("Late reply for unknown request {}", correlation_id);
                }
                None
            }
            Frame::Error {
                correlation_id,
                message,
            } => {
                let delivered = self
                    .pending
                    .resolve(&correlation_id, Err(TransportError::Upstream(message)))
                    .await;
                if !delivered {
                    tracing::debug!("Late error for unknown request {}", correlation_id);
                }
                None
            }
            Frame::Ping => Some(Frame::Pong),
            Frame::Pong => None,
            Frame::Request { .. } => {
                tracing::debug!("Ignoring request frame on reply channel");
                None
            }
        }
    }

    async fn write_envelope(
        writer: &mut (impl AsyncWriteExt + Unpin),
        envelope: &Envelope,
    ) -> std::io::Result<()> {
        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode outbound frame: {}", e);
                return Ok(());
            }
        };
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    async fn write_frame(
        writer: &mut (impl AsyncWriteExt + Unpin),
        channel: &str,
        frame: Frame,
    ) -> std::io::Result<()> {
        Self::write_envelope(writer, &Envelope::new(channel, frame)).await
    }
}

/// Times out requests whose replies never arrived
async fn run_monitor(pending: Arc<PendingMap>, interval: Duration, stale_timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let expired = pending.sweep_stale(stale_timeout).await;
        if expired > 0 {
            tracing::warn!("Timed out {} stale broker request(s)", expired);
        }
    }
}
