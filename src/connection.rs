//! Per-connection actor.
//!
//! The reader side owns all connection state and handles client messages
//! strictly in order. A separate writer task drains the bounded outbound
//! queue, which is also what the subscription registry publishes into.

use crate::admin::AdminCommand;
use crate::app_state::RelayState;
use crate::auth::new_challenge;
use crate::codec::{ClientMessage, InboundEvent, RelayMessage};
use crate::error::Error;
use crate::kinds::KindClass;
use crate::metrics;
use crate::rate_limiter::{Admission, ConnectionPermit};
use crate::storage::StoreOutcome;
use crate::subscription::{ConnectionId, Outbound};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use nostr::{Event, EventId, Filter, PublicKey, Timestamp};
use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_futures::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

/// The outbound queue was closed, so the connection is going away.
#[derive(Debug)]
struct Disconnected;

pub struct ClientConnection {
    id: ConnectionId,
    source: String,
    state: Arc<RelayState>,
    phase: ConnectionPhase,
    challenge: String,
    authed_pubkey: Option<PublicKey>,
    outbound: mpsc::Sender<Outbound>,
    token: CancellationToken,
}

impl ClientConnection {
    pub async fn run(socket: WebSocket, state: Arc<RelayState>, source: String, permit: ConnectionPermit) {
        let id = state.next_connection_id();
        let span = tracing::info_span!(parent: None, "websocket_connection", ip = %source, id);
        let channel_size = state.settings.websocket.channel_size;
        let (outbound, outbound_rx) = mpsc::channel(channel_size);
        let token = state.cancellation_token.child_token();

        let connection = ClientConnection {
            id,
            source,
            state,
            phase: ConnectionPhase::Connecting,
            challenge: new_challenge(),
            authed_pubkey: None,
            outbound,
            token,
        };
        connection.serve(socket, outbound_rx).instrument(span).await;
        drop(permit);
    }

    async fn serve(mut self, socket: WebSocket, outbound_rx: mpsc::Receiver<Outbound>) {
        metrics::active_connections().increment(1.0);
        self.state
            .registry
            .register(self.id, self.outbound.clone(), self.token.clone());
        info!("Connection {} opened from {}", self.id, self.source);

        let (sink, mut stream) = socket.split();
        let writer = tokio::spawn(
            write_loop(self.id, sink, outbound_rx, self.state.clone(), self.token.clone())
                .in_current_span(),
        );

        if self.send(RelayMessage::auth(self.challenge.clone())).await.is_ok() {
            self.transition(ConnectionPhase::Authenticating);
            self.read_loop(&mut stream).await;
        }

        self.transition(ConnectionPhase::Closing);
        let removed = self.state.registry.unregister(self.id);
        self.token.cancel();
        if let Err(e) = writer.await {
            warn!("Writer task for connection {} failed: {}", self.id, e);
        }
        metrics::active_connections().decrement(1.0);
        self.transition(ConnectionPhase::Closed);
        info!(
            "Connection {} closed, {} subscription(s) dropped",
            self.id, removed
        );
    }

    async fn read_loop(&mut self, stream: &mut futures::stream::SplitStream<WebSocket>) {
        let settings = self.state.settings.websocket.clone();
        let deadline = settings
            .max_connection_time
            .map(|limit| tokio::time::Instant::now() + limit);

        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                _ = sleep_until(deadline) => {
                    debug!("Connection {} reached its maximum lifetime", self.id);
                    break;
                }
                next = tokio::time::timeout(settings.idle_timeout, stream.next()) => next,
            };

            let result = match next {
                Err(_) => {
                    debug!("Connection {} idle for {:?}", self.id, settings.idle_timeout);
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Err(e))) => {
                    debug!("Connection {} socket error: {}", self.id, e);
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    if text.as_str().len() > settings.max_message_bytes {
                        self.send(RelayMessage::notice(format!(
                            "invalid: message exceeds {} bytes",
                            settings.max_message_bytes
                        )))
                        .await
                    } else {
                        self.handle_text(text.as_str()).await
                    }
                }
                Ok(Some(Ok(Message::Binary(_)))) => {
                    self.send(RelayMessage::notice("invalid: binary frames are not supported"))
                        .await
                }
                Ok(Some(Ok(_))) => Ok(()),
            };

            if result.is_err() {
                break;
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), Disconnected> {
        match ClientMessage::from_json(text) {
            Ok(ClientMessage::Event(inbound)) => self.handle_event(*inbound).await,
            Ok(ClientMessage::Req {
                subscription_id,
                filters,
            }) => self.handle_req(subscription_id, filters).await,
            Ok(ClientMessage::Close(subscription_id)) => {
                self.state.registry.unsubscribe(self.id, &subscription_id);
                Ok(())
            }
            Ok(ClientMessage::Auth(inbound)) => self.handle_auth(*inbound).await,
            Err(e) => {
                debug!("Connection {} sent a malformed message: {}", self.id, e);
                match e.subscription_id() {
                    Some(subscription_id) => {
                        self.send(RelayMessage::closed(subscription_id, e.to_string()))
                            .await
                    }
                    None => self.send(RelayMessage::notice(e.to_string())).await,
                }
            }
        }
    }

    async fn handle_event(&mut self, inbound: InboundEvent) -> Result<(), Disconnected> {
        let started = Instant::now();
        let claimed_id = inbound.claimed_id().unwrap_or_default().to_string();
        metrics::inbound_events_processed().increment(1);

        match self.process_event(inbound).await {
            Ok((event, outcome)) => {
                let class: &'static str = KindClass::of(event.kind).into();
                metrics::events_accepted(class).increment(1);
                metrics::event_latency(class).record(started.elapsed().as_secs_f64() * 1000.0);
                let message = match outcome {
                    StoreOutcome::Stored | StoreOutcome::NotPersisted => "",
                    StoreOutcome::Duplicate => "duplicate: already have this event",
                    StoreOutcome::Superseded => "duplicate: superseded by a newer event",
                };
                self.send(RelayMessage::ok(event.id.to_hex(), true, message))
                    .await
            }
            Err(e) => {
                let reason = e.client_reason();
                metrics::events_rejected(metrics::rejection_label(&reason)).increment(1);
                debug!("Rejected event {}: {}", claimed_id, reason);
                let auth_required = matches!(e, Error::AuthRequired { .. });
                for message in e.to_relay_messages_from_event(&claimed_id) {
                    self.send(message).await?;
                }
                if auth_required {
                    self.send(RelayMessage::auth(self.challenge.clone())).await?;
                }
                Ok(())
            }
        }
    }

    async fn process_event(&self, inbound: InboundEvent) -> Result<(Event, StoreOutcome), Error> {
        let event = self.validate(inbound).await?;

        if let Admission::Deny { retry_after } = self.state.rate_limiter.admit(&self.source) {
            metrics::rate_limit_denials().increment(1);
            return Err(Error::rate_limited(
                "too many events",
                retry_after.as_millis() as u64,
            ));
        }

        self.state
            .authorizer
            .authorize(&event, self.authed_pubkey.as_ref())
            .map_err(|denial| denial.into_error())?;

        let command = AdminCommand::from_event(&event)?;
        let outcome = self.state.database.save_event(&event).await?;
        if outcome.should_broadcast() {
            let delivered = self.state.registry.publish(&event);
            debug!(target: "subscriptions", "Event {} delivered {} time(s)", event.id, delivered);
        }

        if let Some(command) = command {
            if matches!(outcome, StoreOutcome::Stored | StoreOutcome::Duplicate) {
                self.state.admin.apply_once(command, &event).await?;
            }
        }

        Ok((event, outcome))
    }

    async fn validate(&self, inbound: InboundEvent) -> Result<Event, Error> {
        let validator = self.state.validator.clone();
        tokio::task::spawn_blocking(move || validator.validate(&inbound)).await?
    }

    async fn handle_auth(&mut self, inbound: InboundEvent) -> Result<(), Disconnected> {
        let claimed_id = inbound.claimed_id().unwrap_or_default().to_string();
        let result = match self.validate(inbound).await {
            Ok(event) => self
                .state
                .authorizer
                .verify_auth_event(&event, &self.challenge, Timestamp::now())
                .map(|pubkey| (event.id, pubkey)),
            Err(e) => Err(e),
        };

        match result {
            Ok((event_id, pubkey)) => {
                debug!(target: "auth", "Connection {} authenticated as {}", self.id, pubkey);
                self.authed_pubkey = Some(pubkey);
                self.transition(ConnectionPhase::Active);
                self.send(RelayMessage::ok(event_id.to_hex(), true, "")).await
            }
            Err(e) => {
                warn!(target: "auth", "Connection {} failed AUTH: {}", self.id, e);
                self.send(RelayMessage::ok(claimed_id, false, e.client_reason()))
                    .await
            }
        }
    }

    async fn handle_req(
        &mut self,
        subscription_id: String,
        filters: Vec<Filter>,
    ) -> Result<(), Disconnected> {
        if let Err(e) = self.check_req(&filters) {
            for message in e.to_relay_messages_from_subscription_id(&subscription_id) {
                self.send(message).await?;
            }
            return Ok(());
        }

        let generation = match self
            .state
            .registry
            .subscribe(self.id, &subscription_id, filters.clone())
        {
            Ok(generation) => generation,
            Err(e) => {
                for message in e.to_relay_messages_from_subscription_id(&subscription_id) {
                    self.send(message).await?;
                }
                return Ok(());
            }
        };

        let mut sent: HashSet<EventId> = HashSet::new();
        for filter in filters {
            let mut events = pin!(self.state.database.query_stream(filter));
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => {
                        if sent.insert(event.id) {
                            self.enqueue(Outbound::delivery(&subscription_id, generation, event))
                                .await?;
                        }
                    }
                    Err(e) => {
                        self.state.registry.unsubscribe(self.id, &subscription_id);
                        for message in e.to_relay_messages_from_subscription_id(&subscription_id)
                        {
                            self.send(message).await?;
                        }
                        return Ok(());
                    }
                }
            }
        }

        self.send(RelayMessage::eose(subscription_id.as_str())).await?;
        self.state
            .registry
            .activate(self.id, &subscription_id, &sent);
        debug!(
            target: "subscriptions",
            "Subscription {} sent {} stored event(s)", subscription_id, sent.len()
        );
        Ok(())
    }

    fn check_req(&self, filters: &[Filter]) -> Result<(), Error> {
        let limits = &self.state.settings.query;
        if filters.len() > limits.max_filters {
            return Err(Error::invalid(format!(
                "too many filters (max {})",
                limits.max_filters
            )));
        }
        if filters.iter().any(|filter| filter.search.is_some()) {
            return Err(Error::unsupported("search filters are not supported"));
        }
        if self.state.settings.read_requires_auth && self.authed_pubkey.is_none() {
            return Err(Error::auth_required("authenticate to read"));
        }
        Ok(())
    }

    async fn send(&self, message: RelayMessage) -> Result<(), Disconnected> {
        self.enqueue(Outbound::reply(message)).await
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<(), Disconnected> {
        self.outbound.send(outbound).await.map_err(|_| Disconnected)
    }

    fn transition(&mut self, next: ConnectionPhase) {
        debug!("Connection {} {} -> {}", self.id, self.phase, next);
        self.phase = next;
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn write_loop(
    id: ConnectionId,
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    state: Arc<RelayState>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = outbound_rx.recv() => message,
        };
        let Some(outbound) = message else {
            break;
        };

        // Deliveries queued before a CLOSE, or for an earlier subscription
        // under the same id, are dropped here.
        if !state.registry.is_current(id, &outbound) {
            continue;
        }

        if let Err(e) = sink
            .send(Message::Text(outbound.message.to_json().into()))
            .await
        {
            debug!("Connection {} write failed: {}", id, e);
            break;
        }
    }

    token.cancel();
    let _ = sink.close().await;
    debug!("Writer task for connection {} exiting", id);
}
