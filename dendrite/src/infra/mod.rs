//! Messaging infrastructure: spawns workers and services as isolated tokio
//! tasks, retains their handles, and tears them down on `stop`.
//!
//! A crashing actor cannot corrupt controller memory; its terminal error is
//! observable on the handle after `join`.

use async_trait::async_trait;
use color_eyre::eyre::eyre;
use color_eyre::Report;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// An actor driven by the runtime: a worker or a runtime service. `start`
/// arms the actor's endpoints and runs its loop to completion.
#[async_trait]
pub trait SyncActor: Send {
    async fn start(self: Box<Self>) -> Result<(), Report>;
}

/// Handle of a spawned actor. `exception` is empty on success, otherwise it
/// holds the actor's terminal error.
#[derive(Debug)]
pub struct ActorHandle {
    name: String,
    handle: Option<JoinHandle<Result<(), Report>>>,
    pub exception: Option<Report>,
}

impl ActorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the actor to finish and records its terminal error, if
    /// any. Idempotent.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(Ok(())) => debug!(actor = %self.name, "actor finished"),
                Ok(Err(report)) => {
                    self.exception = Some(report);
                }
                Err(join_error) => {
                    self.exception =
                        Some(eyre!("actor {} panicked: {}", self.name, join_error));
                }
            }
        }
    }

    /// Whether the actor has not been joined yet.
    pub fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    /// Signals the actor to wind down immediately. Last-resort teardown for
    /// exit paths that cannot await.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Spawns actors and owns their handles.
#[derive(Debug, Default)]
pub struct MessageInfrastructure {
    started: bool,
    pub actors: Vec<ActorHandle>,
}

impl MessageInfrastructure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    /// Spawns an isolated actor whose entry invokes the builder and then
    /// runs the built actor to completion.
    pub fn build_actor<F>(&mut self, name: impl Into<String>, build: F)
    where
        F: FnOnce() -> Box<dyn SyncActor> + Send + 'static,
    {
        assert!(self.started, "build_actor before infrastructure start");
        let name = name.into();
        debug!(actor = %name, "spawning actor");
        let handle = tokio::spawn(async move {
            let actor = build();
            actor.start().await
        });
        self.actors.push(ActorHandle {
            name,
            handle: Some(handle),
            exception: None,
        });
    }

    /// Number of actors that have not been joined yet.
    pub fn live_actors(&self) -> usize {
        self.actors.iter().filter(|actor| actor.is_live()).count()
    }

    /// Joins all outstanding actors and releases the infrastructure.
    /// Idempotent; safe to call on every controller exit path.
    pub async fn stop(&mut self) {
        for actor in self.actors.iter_mut() {
            actor.join().await;
            if let Some(exception) = &actor.exception {
                warn!(actor = %actor.name, "actor ended with exception: {:?}", exception);
            }
        }
        self.started = false;
    }

    /// Aborts all outstanding actors without joining them. Only for exit
    /// paths that cannot await, e.g. the controller's destructor.
    pub fn abort_all(&self) {
        for actor in &self.actors {
            actor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fails;

    #[async_trait]
    impl SyncActor for Fails {
        async fn start(self: Box<Self>) -> Result<(), Report> {
            Err(eyre!("broken model"))
        }
    }

    struct Succeeds;

    #[async_trait]
    impl SyncActor for Succeeds {
        async fn start(self: Box<Self>) -> Result<(), Report> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn join_records_the_exception() {
        let mut infra = MessageInfrastructure::new();
        infra.start();
        infra.build_actor("ok", || Box::new(Succeeds));
        infra.build_actor("broken", || Box::new(Fails));
        assert_eq!(infra.live_actors(), 2);

        infra.stop().await;
        assert_eq!(infra.live_actors(), 0);
        assert!(infra.actors[0].exception.is_none());
        let report = infra.actors[1].exception.as_ref().unwrap();
        assert!(format!("{report}").contains("broken model"));
    }
}
