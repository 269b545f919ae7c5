//! The client session loop.
//!
//! One task owns the [`Dispatcher`] and serializes everything that can change
//! client state:
//! - Inbound relay envelopes
//! - Local commands from presentation
//! - Engine reports (local candidates, remote streams, connection loss)
//! - Typing timers
//! - In-flight negotiations, polled as a `FuturesUnordered`
//!
//! A negotiation that suspends (media acquisition, description application)
//! does not block the loop, so an early candidate is dispatched, and buffered,
//! while the description it depends on is still being applied.

use echo_call::{MediaEngine, Negotiation, SessionSignal};
use echo_common::config::AppConfig;
use echo_common::envelope::Inbound;
use echo_common::models::IceServer;
use echo_common::EchoError;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{ClientError, ClientResult};
use crate::event::{ClientEvent, Command};
use crate::relay::RelayLink;

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Values the session needs from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ice_servers: Vec<IceServer>,
    /// Typing quiet window, both for our debounce and the peer watchdog.
    pub typing_quiet: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ice_servers: config.call.ice_servers(),
            typing_quiet: config.chat.typing_quiet(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            typing_quiet: Duration::from_millis(500),
        }
    }
}

/// Presentation's side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl SessionHandle {
    pub async fn send(&self, command: Command) -> ClientResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Relay(EchoError::RelayDisconnected))
    }

    /// Subscribe to state changes. Subscribe before the session starts to see
    /// its first events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

pub struct ClientSession {
    dispatcher: Dispatcher,
    inbound: mpsc::Receiver<Inbound>,
    commands: mpsc::Receiver<Command>,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    negotiations: FuturesUnordered<Negotiation>,
}

impl ClientSession {
    pub fn new(
        username: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        settings: &SessionSettings,
        link: RelayLink,
    ) -> (Self, SessionHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (dispatcher, signals) =
            Dispatcher::new(username, engine, settings, link.outbound, events.clone());

        let session = Self {
            dispatcher,
            inbound: link.inbound,
            commands,
            signals,
            negotiations: FuturesUnordered::new(),
        };
        let handle = SessionHandle {
            commands: command_tx,
            events,
        };
        (session, handle)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Join the relay and run until the user leaves (`Ok`) or the relay goes
    /// away (`Err`, after all state was dropped).
    pub async fn run(mut self) -> ClientResult<()> {
        self.dispatcher.join();
        info!(username = self.dispatcher.username(), "Session started");

        loop {
            let deadline = self.dispatcher.next_deadline();

            tokio::select! {
                envelope = self.inbound.recv() => match envelope {
                    Some(envelope) => {
                        if let Some(negotiation) = self.dispatcher.dispatch(envelope).await {
                            self.negotiations.push(negotiation);
                        }
                    }
                    None => {
                        warn!("Relay disconnected, dropping session state");
                        self.negotiations.clear();
                        self.dispatcher.teardown(false).await;
                        self.dispatcher.emit(ClientEvent::Disconnected);
                        return Err(EchoError::RelayDisconnected.into());
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Leave) | None => {
                        self.negotiations.clear();
                        self.dispatcher.teardown(true).await;
                        self.dispatcher.emit(ClientEvent::Left);
                        info!("Left session");
                        return Ok(());
                    }
                    Some(command) => match self.dispatcher.handle_command(command).await {
                        Ok(Some(negotiation)) => self.negotiations.push(negotiation),
                        Ok(None) => {}
                        Err(e) => self.dispatcher.report(&e),
                    },
                },
                Some(signal) = self.signals.recv() => {
                    self.dispatcher.on_session_signal(signal).await;
                }
                Some(outcome) = self.negotiations.next(), if !self.negotiations.is_empty() => {
                    self.dispatcher.on_outcome(outcome);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.dispatcher.poll_timers(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayEnd;
    use echo_call::testing::FakeEngine;
    use echo_call::CallPhase;
    use echo_common::envelope::Outbound;
    use echo_common::models::{IceCandidate, Participant, SessionDescription};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Let the session drain everything it can before time moves on.
    async fn settle() {
        tokio::time::sleep(ms(1)).await;
    }

    fn drain(relay: &mut RelayEnd) -> Vec<Outbound> {
        let mut sent = Vec::new();
        while let Ok(envelope) = relay.sent.try_recv() {
            sent.push(envelope);
        }
        sent
    }

    fn drain_events(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn typing(sent: &[Outbound]) -> Vec<bool> {
        sent.iter()
            .filter_map(|e| match e {
                Outbound::Typing { is_typing, .. } => Some(*is_typing),
                _ => None,
            })
            .collect()
    }

    async fn start(
        engine: &FakeEngine,
    ) -> (
        tokio::task::JoinHandle<ClientResult<()>>,
        SessionHandle,
        RelayEnd,
    ) {
        let (link, relay) = RelayLink::in_memory();
        let (session, handle) = ClientSession::new(
            "Me",
            Arc::new(engine.clone()),
            &SessionSettings::default(),
            link,
        );
        let task = tokio::spawn(session.run());

        relay
            .deliver
            .send(Inbound::Connect { id: "me".into() })
            .await
            .unwrap();
        relay
            .deliver
            .send(Inbound::UsersList(vec![
                Participant::new("me", "Me"),
                Participant::new("alice", "Alice"),
                Participant::new("bob", "Bob"),
            ]))
            .await
            .unwrap();
        settle().await;
        (task, handle, relay)
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_debounce_through_loop() {
        let engine = FakeEngine::new();
        let (task, handle, mut relay) = start(&engine).await;
        assert_eq!(drain(&mut relay), vec![Outbound::SetUsername("Me".into())]);

        handle.send(Command::SelectPeer("bob".into())).await.unwrap();
        settle().await;
        drain(&mut relay);

        // One keystroke every 100 ms for two seconds
        for n in 0..20 {
            handle.send(Command::Compose("x".repeat(n + 1))).await.unwrap();
            tokio::time::sleep(ms(100)).await;
        }
        assert_eq!(typing(&drain(&mut relay)), vec![true]);

        tokio::time::sleep(ms(500)).await;
        assert_eq!(typing(&drain(&mut relay)), vec![false]);

        tokio::time::sleep(ms(2000)).await;
        assert!(drain(&mut relay).is_empty());

        handle.send(Command::Leave).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_typing_expires_without_refresh() {
        let engine = FakeEngine::new();
        let (task, handle, relay) = start(&engine).await;
        let mut events = handle.subscribe();

        relay
            .deliver
            .send(Inbound::Typing {
                user_id: "alice".into(),
                is_typing: true,
            })
            .await
            .unwrap();
        settle().await;
        tokio::time::sleep(ms(600)).await;

        let typing: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::PeerTyping { typing, .. } => Some(typing),
                _ => None,
            })
            .collect();
        assert_eq!(typing, vec![true, false]);

        handle.send(Command::Leave).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_candidates_while_answering() {
        let engine = FakeEngine::new();
        let gate = engine.gate_remote_description();
        let (task, handle, mut relay) = start(&engine).await;
        let mut events = handle.subscribe();

        relay
            .deliver
            .send(Inbound::Offer {
                from: "alice".into(),
                offer: SessionDescription::offer("v=0 alice"),
            })
            .await
            .unwrap();
        for n in 1..=2 {
            relay
                .deliver
                .send(Inbound::IceCandidate {
                    from: "alice".into(),
                    candidate: IceCandidate::new(format!("candidate:{n}")),
                })
                .await
                .unwrap();
        }
        settle().await;
        assert!(engine.log().applied_candidates.is_empty());

        gate.notify_one();
        settle().await;
        assert_eq!(
            engine.log().applied_candidates,
            vec!["candidate:1".to_owned(), "candidate:2".to_owned()]
        );
        assert!(drain(&mut relay)
            .iter()
            .any(|e| matches!(e, Outbound::Answer { .. })));
        assert!(drain_events(&mut events).contains(&ClientEvent::CallPhase(CallPhase::Active)));

        handle.send(Command::Leave).await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(drain(&mut relay), vec![Outbound::CallEnded { to: "alice".into() }]);
        assert_eq!(engine.log().live_media(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_loss_is_fatal() {
        let engine = FakeEngine::new();
        let (task, handle, relay) = start(&engine).await;
        let mut events = handle.subscribe();

        handle.send(Command::SelectPeer("bob".into())).await.unwrap();
        handle.send(Command::Call).await.unwrap();
        settle().await;
        assert_eq!(engine.log().live_sessions(), 1);

        drop(relay);
        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::Relay(EchoError::RelayDisconnected))
        ));
        assert_eq!(engine.log().live_sessions(), 0);
        assert_eq!(engine.log().live_media(), 0);
        assert_eq!(drain_events(&mut events).last(), Some(&ClientEvent::Disconnected));
        assert!(handle.send(Command::Call).await.is_err());
    }
}
