use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{FutureExt, Stream, StreamExt};
use prometheus::IntGauge;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::server::{
    client::{Client, ClientError, ClientIdentity},
    message::{CheckRequest, ServerMessage},
    middleware::validation::validate_domain,
    runner::CheckRunner,
    ServerState,
};
use crate::utils::error::HealthCheckError;

/// Inbound frames buffered while a check is running. Frames beyond this are dropped.
const INBOUND_BUFFER: usize = 16;

/// Runs a session over an upgraded WebSocket until the client goes away.
pub async fn handle_socket<R: CheckRunner>(
    socket: WebSocket,
    state: Arc<ServerState<R>>,
    identity: ClientIdentity,
) {
    let (writer, reader) = socket.split();
    let client = Client::spawn(identity, writer);
    run_session(state, client, reader).await;
}

/// Drives one client session.
///
/// A reader task forwards inbound frames in arrival order and raises the
/// disconnect flag when the stream ends, which lets an in-flight check be
/// cancelled instead of running for a client that is no longer there.
/// Frames still buffered when the client leaves are discarded unprocessed.
pub async fn run_session<R, I, E>(state: Arc<ServerState<R>>, client: Client, reader: I)
where
    R: CheckRunner,
    I: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let span = info_span!("session", client = %client.id, identity = %client.identity());

    async move {
        let (inbound_tx, mut inbound) = mpsc::channel(INBOUND_BUFFER);
        let (closed_tx, closed) = watch::channel(false);
        let pump = tokio::spawn(pump_inbound(reader, inbound_tx, closed_tx).in_current_span());

        state.clients.add(client.clone());
        state.metrics.connections.inc();
        info!("Session opened");

        let gone = closed.clone();
        let mut session = Session {
            state: state.clone(),
            client: client.clone(),
            disconnected: closed,
        };

        while let Some(frame) = inbound.recv().await {
            if *gone.borrow() {
                debug!("Client gone, discarding buffered frames");
                break;
            }
            state.metrics.messages_received.inc();
            match frame {
                Message::Text(text) => {
                    if let Err(e) = session.dispatch(&text).await {
                        debug!("Stopping session: {}", e);
                        break;
                    }
                }
                Message::Close(_) => break,
                Message::Binary(data) => debug!("Ignoring binary frame ({} bytes)", data.len()),
                _ => {}
            }
        }

        pump.abort();
        state.clients.remove(&client.id);
        state.metrics.connections.dec();
        client.close();
        info!("Session closed");
    }
    .instrument(span)
    .await
}

async fn pump_inbound<I, E>(
    mut reader: I,
    inbound: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
) where
    I: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(msg) => {
                let closing = matches!(msg, Message::Close(_));
                match inbound.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("Inbound buffer full, dropping frame"),
                    Err(TrySendError::Closed(_)) => break,
                }
                if closing {
                    break;
                }
            }
            Err(e) => {
                debug!("Read error: {}", e);
                break;
            }
        }
    }
    let _ = closed.send(true);
}

/// Per-connection state machine.
struct Session<R> {
    state: Arc<ServerState<R>>,
    client: Client,
    disconnected: watch::Receiver<bool>,
}

impl<R: CheckRunner> Session<R> {
    /// Handles one text frame and reports any failure to the client.
    ///
    /// Only a dead outbound queue is returned as an error; every other
    /// failure becomes an error frame and the session carries on.
    async fn dispatch(&mut self, text: &str) -> Result<(), ClientError> {
        let outcome = AssertUnwindSafe(self.handle_text(text))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HealthCheckError::Internal(panic_message(&*panic))));

        match outcome {
            Ok(()) => Ok(()),
            Err(HealthCheckError::Disconnected) => Ok(()),
            Err(HealthCheckError::ClientError(e)) => Err(e),
            Err(e) => {
                debug!("Request failed: {}", e);
                self.reply(&e.to_reply())
            }
        }
    }

    #[instrument(skip(self, text))]
    async fn handle_text(&mut self, text: &str) -> Result<(), HealthCheckError> {
        let request = CheckRequest::parse(text, self.state.config.max_message_size)?;
        let domain = validate_domain(&request.domain)?;

        let identity = self.client.identity().clone();
        if !self.state.rate_limiter.admit(&identity) {
            self.state.metrics.rate_limited.inc();
            warn!(%identity, "Rate limit exceeded");
            return Err(HealthCheckError::RateLimited {
                max_requests: self.state.rate_limiter.max_requests(),
                window: describe_window(self.state.rate_limiter.window().as_secs()),
                retry_after: self
                    .state
                    .rate_limiter
                    .retry_after(&identity)
                    .map(|wait| wait.as_secs().max(1)),
            });
        }

        if self.state.admission.available() == 0 {
            self.reply(&ServerMessage::queued())?;
        }

        let token = tokio::select! {
            token = self.state.admission.acquire() => token?,
            _ = wait_for_disconnect(&mut self.disconnected) => {
                info!(%domain, "Client left while queued");
                return Err(HealthCheckError::Disconnected);
            }
        };

        self.reply(&ServerMessage::starting())?;
        info!(%domain, "Running check");

        let metrics = &self.state.metrics;
        let in_flight = InFlight::enter(&metrics.checks_in_flight);
        let started = Instant::now();

        let outcome = tokio::select! {
            outcome = self.state.runner.run(domain) => Some(outcome),
            _ = wait_for_disconnect(&mut self.disconnected) => None,
        };

        metrics.check_duration.observe(started.elapsed().as_secs_f64());
        drop(in_flight);
        drop(token);

        match outcome {
            None => {
                metrics.record_outcome("cancelled");
                info!(%domain, "Client left mid-check, check cancelled");
                Err(HealthCheckError::Disconnected)
            }
            Some(Ok(data)) => {
                metrics.record_outcome("complete");
                info!(%domain, elapsed = ?started.elapsed(), "Check complete");
                self.reply(&ServerMessage::complete(data))?;
                Ok(())
            }
            Some(Err(e)) => {
                metrics.record_outcome(e.kind());
                warn!(%domain, "Check did not complete: {}", e);
                Err(e.into())
            }
        }
    }

    fn reply(&self, message: &ServerMessage) -> Result<(), ClientError> {
        self.client.send_message(message)?;
        self.state.metrics.messages_sent.inc();
        Ok(())
    }
}

/// Keeps the in-flight gauge raised for as long as it lives.
struct InFlight<'a>(&'a IntGauge);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Resolves once the reader task has seen the client go away.
async fn wait_for_disconnect(flag: &mut watch::Receiver<bool>) {
    loop {
        let gone = *flag.borrow_and_update();
        if gone || flag.changed().await.is_err() {
            return;
        }
    }
}

/// Human form of the rate limit window, e.g. `15 minutes`.
pub fn describe_window(secs: u64) -> String {
    match secs {
        s if s % 3600 == 0 => plural(s / 3600, "hour"),
        s if s % 60 == 0 => plural(s / 60, "minute"),
        s => plural(s, "second"),
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unexpected failure while handling request".to_string()
    }
}
