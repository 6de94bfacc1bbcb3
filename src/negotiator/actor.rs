//! Task, der einen SessionNegotiator besitzt
//!
//! Alle Operationen für einen Peer laufen nacheinander in diesem Task.
//! Wird der Handle geschlossen oder gedroppt, bricht der laufende Schritt ab
//! und sein Ergebnis wird verworfen; der Transport wird immer geschlossen.

use super::SessionNegotiator;
use crate::media::LocalMediaHandle;
use crate::signaling::{ParticipantId, SignalMessage};
use crate::transport::TransportEvents;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum NegotiatorCommand {
    Start,
    Signal(SignalMessage),
    ReplaceTracks(Option<LocalMediaHandle>),
}

pub struct NegotiatorHandle {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<NegotiatorCommand>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NegotiatorHandle {
    /// Startet den Task für einen Negotiator und seinen Transport
    pub fn spawn(negotiator: SessionNegotiator, events: TransportEvents) -> Self {
        let peer = negotiator.peer().clone();
        let generation = negotiator.generation();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(negotiator, rx, events, cancel.clone()));

        Self {
            peer,
            generation,
            tx,
            cancel,
            task: Some(task),
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Initiator: Offer erstellen
    pub fn start(&self) {
        let _ = self.tx.send(NegotiatorCommand::Start);
    }

    pub fn signal(&self, message: SignalMessage) {
        let _ = self.tx.send(NegotiatorCommand::Signal(message));
    }

    pub fn replace_tracks(&self, media: Option<LocalMediaHandle>) {
        let _ = self.tx.send(NegotiatorCommand::ReplaceTracks(media));
    }

    /// Bricht den laufenden Schritt ab und wartet, bis der Transport
    /// geschlossen ist
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Negotiator task for {} ended abnormally: {}", self.peer, e);
            }
        }
    }
}

impl Drop for NegotiatorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for NegotiatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatorHandle")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .finish()
    }
}

async fn run(
    mut negotiator: SessionNegotiator,
    mut rx: mpsc::UnboundedReceiver<NegotiatorCommand>,
    mut events: TransportEvents,
    cancel: CancellationToken,
) {
    loop {
        let deadline = negotiator.deadline();
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => {
                let Some(command) = command else { break };
                let step = async {
                    let result = match command {
                        NegotiatorCommand::Start => negotiator.create_offer().await,
                        NegotiatorCommand::Signal(message) => negotiator.handle_signal(message).await,
                        NegotiatorCommand::ReplaceTracks(media) => {
                            negotiator.replace_tracks(media.as_ref()).await
                        }
                    };
                    if let Err(e) = result {
                        tracing::debug!("Negotiator step failed: {}", e);
                    }
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = step => {}
                }
            }
            Some(event) = events.recv() => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = negotiator.handle_transport_event(event) => {}
                }
            }
            _ = timer => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = negotiator.on_deadline(tokio::time::Instant::now()) => {}
                }
            }
        }
    }

    negotiator.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiator::{
        NegotiationState, NegotiationTimings, NegotiatorContext, NegotiatorEvent,
        NegotiatorEventKind, Role,
    };
    use crate::signaling::{topics, MemoryBus};
    use crate::transport::{LoopbackBehaviour, LoopbackNetwork, TransportFactory};
    use std::sync::Arc;
    use std::time::Duration;

    async fn spawn_initiator(
        network: &LoopbackNetwork,
        timeout: Duration,
    ) -> (NegotiatorHandle, mpsc::UnboundedReceiver<NegotiatorEvent>) {
        let local = ParticipantId::from("a");
        let peer = ParticipantId::from("b");
        let parts = network.create(&local, &peer, None).await.unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let ctx = NegotiatorContext {
            local,
            bus: Arc::new(MemoryBus::new()),
            topic: topics::signaling("actor"),
            events: tx,
            timings: NegotiationTimings {
                negotiation_timeout: timeout,
                disconnect_grace: Duration::from_secs(1),
            },
        };
        let negotiator =
            SessionNegotiator::new(ctx, peer, Role::Initiator, 7, 2, parts.transport);
        (NegotiatorHandle::spawn(negotiator, parts.events), events)
    }

    #[tokio::test]
    async fn test_close_releases_transport() {
        let network = LoopbackNetwork::new();
        let (handle, _events) = spawn_initiator(&network, Duration::from_secs(10)).await;

        handle.start();
        handle.close().await;

        assert_eq!(network.open_transports(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_transport() {
        let network = LoopbackNetwork::with_behaviour(LoopbackBehaviour::Stall);
        let (handle, _events) = spawn_initiator(&network, Duration::from_secs(10)).await;
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), async {
            while network.open_transports() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_failure_with_attempt() {
        let network = LoopbackNetwork::new();
        let (handle, mut events) = spawn_initiator(&network, Duration::from_millis(200)).await;
        handle.start();

        let failure = loop {
            let event = events.recv().await.unwrap();
            assert_eq!(event.generation, 7);
            if let NegotiatorEventKind::Failed { attempt, cause } = event.kind {
                break (attempt, cause);
            }
        };

        assert_eq!(failure.0, 2);
        assert_eq!(
            failure.1,
            crate::negotiator::FailureCause::Timeout(NegotiationState::AwaitingAnswer)
        );
        handle.close().await;
    }
}
