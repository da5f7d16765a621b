//! Driver of the asynchronous protocol.
//!
//! Workers of an asynchronous sync domain progress freely once told to run;
//! the service only aggregates their upstream requests and relays
//! controller commands. There is no deterministic host phase, so variable
//! access is not supported here.

use super::ServicePorts;
use crate::channel::{CspRecvPort, CspSelector};
use crate::error::{RunResult, RuntimeError};
use crate::id::ServiceId;
use crate::infra::SyncActor;
use crate::mgmt::{self, Command, Response};
use async_trait::async_trait;
use color_eyre::Report;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Controller,
    Worker(usize),
}

pub struct AsyncService {
    service_id: ServiceId,
    ports: ServicePorts,
    running: bool,
    req_pause: bool,
    req_stop: bool,
    error: bool,
}

#[async_trait]
impl SyncActor for AsyncService {
    async fn start(mut self: Box<Self>) -> Result<(), Report> {
        self.ports.start_all();
        debug!(service = self.service_id, "async service started");
        self.run().await?;
        Ok(())
    }
}

impl AsyncService {
    pub fn new(service_id: ServiceId, ports: ServicePorts) -> Self {
        Self {
            service_id,
            ports,
            running: false,
            req_pause: false,
            req_stop: false,
            error: false,
        }
    }

    /// Two-state loop: wait for a controller command; once workers were
    /// told to run, also collect their responses as they arrive, so one
    /// silent worker cannot block the requests of the others.
    async fn run(&mut self) -> RunResult<()> {
        let mut selector = CspSelector::new();
        loop {
            let source = {
                let mut choices: Vec<(&mut CspRecvPort, Source)> =
                    Vec::with_capacity(1 + self.ports.worker_to_service.len());
                choices.push((&mut self.ports.runtime_to_service, Source::Controller));
                if self.running {
                    for (index, port) in self.ports.worker_to_service.iter_mut().enumerate() {
                        choices.push((port, Source::Worker(index)));
                    }
                }
                selector.select(&mut choices).await
            };
            match source {
                Source::Controller => {
                    let word = self.ports.runtime_to_service.recv().await?;
                    match Command::decode(word) {
                        Some(Command::Stop) => {
                            self.handle_stop().await?;
                            return Ok(());
                        }
                        Some(Command::Pause) => {
                            self.handle_pause().await?;
                        }
                        Some(Command::Run(_)) => {
                            self.ports.fan_to_workers(mgmt::RUN).await?;
                            self.running = true;
                        }
                        _ => {
                            return Err(RuntimeError::Protocol {
                                port: self.ports.runtime_to_service.name().to_string(),
                                word,
                            });
                        }
                    }
                }
                Source::Worker(index) => {
                    self.drain_worker_responses(index).await?;
                    if std::mem::take(&mut self.req_stop) {
                        self.ports
                            .service_to_runtime
                            .send(Response::ReqStop.encode())
                            .await?;
                    }
                    if std::mem::take(&mut self.req_pause) {
                        self.ports
                            .service_to_runtime
                            .send(Response::ReqPause.encode())
                            .await?;
                    }
                    if std::mem::take(&mut self.error) {
                        self.ports
                            .service_to_runtime
                            .send(Response::Error.encode())
                            .await?;
                    }
                }
            }
        }
    }

    /// Consumes the ready response, then sweeps the remaining worker
    /// channels without blocking on any of them.
    async fn drain_worker_responses(&mut self, ready: usize) -> RunResult<()> {
        let word = self.ports.worker_to_service[ready].recv().await?;
        self.latch_response(word);
        let num_workers = self.ports.worker_to_service.len();
        for index in 0..num_workers {
            while self.ports.worker_to_service[index].probe() {
                let word = self.ports.worker_to_service[index].recv().await?;
                self.latch_response(word);
            }
        }
        Ok(())
    }

    fn latch_response(&mut self, word: mgmt::Word) {
        match Response::decode(word) {
            Some(Response::Done) => {}
            Some(Response::ReqPause) => self.req_pause = true,
            Some(Response::ReqStop) => self.req_stop = true,
            Some(Response::Error) => self.error = true,
            _ => {
                warn!(service = self.service_id, word, "unexpected worker response");
                self.error = true;
            }
        }
    }

    /// Fans `PAUSE` and awaits a `PAUSED` ack from every worker before
    /// acknowledging upward. Responses a worker queued before observing
    /// the pause are drained on the way.
    async fn handle_pause(&mut self) -> RunResult<()> {
        self.ports.fan_to_workers(Command::Pause.encode()).await?;
        for port in self.ports.worker_to_service.iter_mut() {
            loop {
                let word = port.recv().await?;
                match Response::decode(word) {
                    Some(Response::Paused) => break,
                    Some(Response::Done)
                    | Some(Response::ReqPause)
                    | Some(Response::ReqStop) => {
                        // stale pre-pause traffic
                        continue;
                    }
                    _ => {
                        self.ports
                            .service_to_runtime
                            .send(Response::Error.encode())
                            .await?;
                        return Err(RuntimeError::Protocol {
                            port: port.name().to_string(),
                            word,
                        });
                    }
                }
            }
        }
        self.ports
            .service_to_runtime
            .send(Response::Paused.encode())
            .await?;
        Ok(())
    }

    /// Fans `STOP` and awaits termination of every worker. Responses a
    /// worker queued before observing the stop are drained on the way.
    async fn handle_stop(&mut self) -> RunResult<()> {
        self.ports.fan_to_workers(Command::Stop.encode()).await?;
        for port in self.ports.worker_to_service.iter_mut() {
            loop {
                let word = port.recv().await?;
                match Response::decode(word) {
                    Some(Response::Terminated) => break,
                    Some(Response::Done)
                    | Some(Response::ReqPause)
                    | Some(Response::ReqStop) => {
                        // stale pre-stop traffic
                        continue;
                    }
                    _ => {
                        self.ports
                            .service_to_runtime
                            .send(Response::Error.encode())
                            .await?;
                        return Err(RuntimeError::Protocol {
                            port: port.name().to_string(),
                            word,
                        });
                    }
                }
            }
        }
        self.ports
            .service_to_runtime
            .send(Response::Terminated.encode())
            .await?;
        self.ports.join_all();
        Ok(())
    }
}
