//! Supervisor actor owning the queue, tracker and dispatcher actors.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dispatch_core::{DispatchConfig, DispatchEvent, OutcomeStatus};
use ractor::{Actor, ActorProcessingErr, ActorRef, ActorStatus, SupervisionEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::dispatcher_actor::{DispatcherActor, DispatcherState};
use crate::health::{HealthMonitor, HealthProbe};
use crate::messages::{
    DispatcherMessage, EngineActors, QueueMessage, SupervisorMessage, TrackerMessage, ask,
};
use crate::queue_actor::{QueueActor, QueueActorState};
use crate::recorder::OutcomeRecorder;
use crate::registry::WorkerRegistry;
use crate::tracker_actor::{TrackerActor, TrackerArgs};
use crate::transport::WorkerTransport;

/// Supervisor arguments: the shared pieces every child needs.
pub struct SupervisorArgs {
    pub config: Arc<DispatchConfig>,
    pub registry: Arc<WorkerRegistry>,
    pub recorder: Arc<OutcomeRecorder>,
    pub transport: Arc<dyn WorkerTransport>,
    pub probe: Option<Arc<dyn HealthProbe>>,
    pub event_tx: broadcast::Sender<DispatchEvent>,
    pub held: Arc<AtomicUsize>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    pub queue: ActorRef<QueueMessage>,
    pub tracker: ActorRef<TrackerMessage>,
    /// Live dispatcher actors.
    dispatchers: Vec<ActorRef<DispatcherMessage>>,
    /// Arguments for spawning another dispatcher.
    template: DispatcherState,
    monitor: Option<JoinHandle<()>>,
    config: Arc<DispatchConfig>,
    held: Arc<AtomicUsize>,
    shutting_down: bool,
}

impl SupervisorState {
    fn is_dispatcher(&self, cell: &ractor::ActorCell) -> bool {
        self.dispatchers.iter().any(|d| d.get_id() == cell.get_id())
    }

    fn forget_dispatcher(&mut self, cell: &ractor::ActorCell) {
        self.dispatchers.retain(|d| d.get_id() != cell.get_id());
    }

    /// Wait for dispatchers to stop and for every in-flight job to resolve,
    /// bounded by one job timeout.
    async fn drain(&self) {
        let bound = self.config.per_job_timeout() + self.config.sweep_interval() * 2;
        let started = Instant::now();
        loop {
            let dispatching = self
                .dispatchers
                .iter()
                .filter(|d| !matches!(d.get_status(), ActorStatus::Stopped))
                .count();
            let held = self.held.load(Ordering::Acquire);
            let pending = ask(&self.tracker, |reply| TrackerMessage::PendingCount { reply })
                .await
                .unwrap_or_default();

            if dispatching == 0 && held == 0 && pending == 0 {
                return;
            }
            if started.elapsed() >= bound {
                tracing::warn!(dispatching, held, pending, "Shutdown drain timed out");
                return;
            }
            tokio::time::sleep(self.config.sweep_interval()).await;
        }
    }
}

async fn spawn_dispatcher(
    myself: &ActorRef<SupervisorMessage>,
    template: &DispatcherState,
) -> Result<ActorRef<DispatcherMessage>, ActorProcessingErr> {
    let (actor, _handle) =
        Actor::spawn_linked(None, DispatcherActor, template.clone(), myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn dispatcher: {}", e)))?;
    Ok(actor)
}

/// Supervisor actor for one dispatch engine.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            workers = args.registry.len(),
            dispatchers = args.config.dispatchers,
            "Starting dispatch supervisor"
        );

        let queue_state =
            QueueActorState::new(args.config.max_queue_size).with_event_tx(args.event_tx.clone());
        let (queue, _) = Actor::spawn_linked(None, QueueActor, queue_state, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn queue: {}", e)))?;

        let tracker_args = TrackerArgs {
            queue: queue.clone(),
            registry: args.registry.clone(),
            recorder: args.recorder.clone(),
            sweep_interval: args.config.sweep_interval(),
            event_tx: Some(args.event_tx.clone()),
        };
        let (tracker, _) = Actor::spawn_linked(None, TrackerActor, tracker_args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn tracker: {}", e)))?;

        let template = DispatcherState {
            queue: queue.clone(),
            tracker: tracker.clone(),
            registry: args.registry.clone(),
            transport: args.transport,
            config: args.config.clone(),
            event_tx: Some(args.event_tx),
            held: args.held.clone(),
        };
        let mut dispatchers = Vec::with_capacity(args.config.dispatchers as usize);
        for _ in 0..args.config.dispatchers {
            dispatchers.push(spawn_dispatcher(&myself, &template).await?);
        }

        let monitor = args.probe.map(|probe| {
            HealthMonitor::new(
                args.registry.clone(),
                probe,
                args.config.health_check_interval(),
            )
            .spawn()
        });

        Ok(SupervisorState {
            queue,
            tracker,
            dispatchers,
            template,
            monitor,
            config: args.config,
            held: args.held,
            shutting_down: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Actors { reply } => {
                let _ = reply.send(EngineActors {
                    queue: state.queue.clone(),
                    tracker: state.tracker.clone(),
                });
            }

            SupervisorMessage::DispatcherCount { reply } => {
                let _ = reply.send(state.dispatchers.len());
            }

            SupervisorMessage::Shutdown { reply } => {
                tracing::info!("Shutting down dispatch engine");
                state.shutting_down = true;

                // Closing the queue wakes every dispatcher with `None`.
                let drained = ask(&state.queue, |reply| QueueMessage::Shutdown { reply })
                    .await
                    .unwrap_or_default();
                for ticket in drained {
                    let _ = state.tracker.send_message(TrackerMessage::Finalize {
                        ticket: Box::new(ticket),
                        status: OutcomeStatus::Failed,
                        error: "queue shut down".into(),
                    });
                }

                state.drain().await;

                match ask(&state.tracker, |reply| TrackerMessage::Shutdown { reply }).await {
                    Ok(failed) if failed > 0 => {
                        tracing::warn!(failed, "Failed jobs still pending at shutdown");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Tracker unavailable at shutdown"),
                }

                if let Some(monitor) = state.monitor.take() {
                    monitor.abort();
                }
                state.queue.stop(None);

                let _ = reply.send(());
                myself.stop(None);
                return Ok(());
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, error) => {
                if !state.is_dispatcher(&cell) {
                    tracing::error!(actor_id = %cell.get_id(), error = %error, "Engine actor failed");
                    return Ok(());
                }
                state.forget_dispatcher(&cell);
                tracing::warn!(actor_id = %cell.get_id(), error = %error, "Dispatcher failed");

                if !state.shutting_down {
                    match spawn_dispatcher(&myself, &state.template).await {
                        Ok(dispatcher) => {
                            tracing::info!(actor_id = %dispatcher.get_id(), "Respawned dispatcher");
                            state.dispatchers.push(dispatcher);
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to respawn dispatcher"),
                    }
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!(
                    actor_id = %cell.get_id(),
                    reason = ?reason,
                    "Child actor terminated"
                );
                state.forget_dispatcher(&cell);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Start a supervisor and its children.
pub async fn start_supervisor(
    args: SupervisorArgs,
) -> Result<(ActorRef<SupervisorMessage>, JoinHandle<()>), ractor::SpawnErr> {
    Actor::spawn(None, Supervisor, args).await
}
