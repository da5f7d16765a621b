//! Driver of the phased synchronization protocol.
//!
//! Per time step the service cycles its workers through
//! `SPK -> PRE_MGMT -> LRN -> POST_MGMT -> SPK -> ...`, entering the
//! special `HOST` phase before the first step of a run and after the last.
//! Worker responses latch pending flags; the advancement rule services any
//! requested management phase before the next spiking step and honors
//! pause/stop at phase boundaries, never mid-phase.

use super::ServicePorts;
use crate::channel::CspSelector;
use crate::error::{RunResult, RuntimeError};
use crate::id::{ServiceId, WorkerId};
use crate::infra::SyncActor;
use crate::mgmt::{Command, Phase, Response, Word};
use async_trait::async_trait;
use color_eyre::Report;
use tracing::{debug, trace, warn};

/// Outcome of one phase advancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Phase(Phase),
    /// Exit the step loop and request a pause upstream.
    Pause,
    /// Exit the step loop and request a stop upstream.
    Stop,
}

/// Pending requests latched from worker responses.
#[derive(Debug, Default, Clone, Copy)]
struct PendingFlags {
    pre_lrn_mgmt: bool,
    post_lrn_mgmt: bool,
    lrn: bool,
    pause: bool,
    stop: bool,
}

impl PendingFlags {
    /// Advances to the next phase. Management phases a worker asked for are
    /// serviced first; then stop, winning over pause (pause after stop is
    /// meaningless); then the step boundary decides between `HOST` and
    /// `SPK`.
    fn next_phase(&mut self, is_last_step: bool) -> Step {
        if self.pre_lrn_mgmt {
            self.pre_lrn_mgmt = false;
            return Step::Phase(Phase::PreMgmt);
        }
        if self.post_lrn_mgmt {
            self.post_lrn_mgmt = false;
            return Step::Phase(Phase::PostMgmt);
        }
        if self.lrn {
            self.lrn = false;
            return Step::Phase(Phase::Lrn);
        }
        if self.stop {
            self.stop = false;
            return Step::Stop;
        }
        if self.pause {
            self.pause = false;
            return Step::Pause;
        }
        if is_last_step {
            return Step::Phase(Phase::Host);
        }
        Step::Phase(Phase::Spk)
    }
}

/// How a step loop ended.
enum StepExit {
    /// The terminal `HOST` phase was reached; completion is reported.
    Completed,
    /// A pause or an upstream request exited the loop; the service keeps
    /// accepting commands.
    Interrupted,
    /// A stop was honored (or an error terminated the run); the service is
    /// done.
    Stopped,
}

pub struct PhasedService {
    service_id: ServiceId,
    ports: ServicePorts,
    pending: PendingFlags,
    paused: bool,
    error: bool,
}

#[async_trait]
impl SyncActor for PhasedService {
    async fn start(mut self: Box<Self>) -> Result<(), Report> {
        self.ports.start_all();
        debug!(service = self.service_id, "phased service started");
        self.run().await?;
        Ok(())
    }
}

impl PhasedService {
    pub fn new(service_id: ServiceId, ports: ServicePorts) -> Self {
        Self {
            service_id,
            ports,
            pending: PendingFlags::default(),
            paused: false,
            error: false,
        }
    }

    /// Retrieves commands from the controller. `STOP` and `PAUSE` are
    /// fanned to the workers; a step count enters the step loop; variable
    /// access is relayed while sitting in a host phase.
    async fn run(&mut self) -> RunResult<()> {
        let mut selector = CspSelector::new();
        let mut phase = Phase::Host;

        loop {
            selector
                .select(&mut [(&mut self.ports.runtime_to_service, ())])
                .await;
            let word = self.ports.runtime_to_service.recv().await?;
            match Command::decode(word) {
                Some(Command::Stop) => {
                    self.handle_stop().await?;
                    return Ok(());
                }
                Some(Command::Pause) => {
                    self.handle_pause().await?;
                    self.paused = true;
                }
                Some(Command::GetData) => self.handle_get(phase).await?,
                Some(Command::SetData) => self.handle_set(phase).await?,
                Some(Command::Run(num_steps)) => {
                    self.paused = false;
                    let (end_phase, exit) = self.step_loop(num_steps).await?;
                    phase = end_phase;
                    match exit {
                        StepExit::Stopped => return Ok(()),
                        StepExit::Interrupted => {}
                        StepExit::Completed => {
                            // inform the controller that the last time step
                            // was reached
                            if !self.paused {
                                self.ports
                                    .service_to_runtime
                                    .send(Response::Done.encode())
                                    .await?;
                            }
                        }
                    }
                }
                None => {
                    return Err(RuntimeError::Protocol {
                        port: self.ports.runtime_to_service.name().to_string(),
                        word,
                    });
                }
            }
        }
    }

    /// Iterates through protocol phases until the last time step is
    /// reached, a worker request exits the loop, or the controller
    /// preempts it. Returns the phase the loop ended in.
    async fn step_loop(&mut self, num_steps: Word) -> RunResult<(Phase, StepExit)> {
        let mut curr_step: Word = 0;
        let mut phase = Phase::Host;
        loop {
            // the comparison happens before the final SPK is advanced, so
            // the last step's management phases run after HOST is scheduled
            let is_last_step = curr_step == num_steps;
            match self.pending.next_phase(is_last_step) {
                Step::Stop => {
                    self.ports
                        .service_to_runtime
                        .send(Response::ReqStop.encode())
                        .await?;
                    return Ok((phase, StepExit::Interrupted));
                }
                Step::Pause => {
                    self.ports
                        .service_to_runtime
                        .send(Response::ReqPause.encode())
                        .await?;
                    return Ok((phase, StepExit::Interrupted));
                }
                Step::Phase(next) => {
                    phase = next;
                    if phase == Phase::Spk {
                        curr_step += 1;
                    }
                    trace!(service = self.service_id, ?phase, curr_step, "phase");
                    self.ports.fan_to_workers(phase.encode()).await?;
                    if phase != Phase::Host {
                        self.collect_worker_responses().await?;
                        if self.error {
                            // forward the error and wind the others down
                            self.ports
                                .service_to_runtime
                                .send(Response::Error.encode())
                                .await?;
                            self.stop_workers_after_error().await;
                            return Ok((phase, StepExit::Stopped));
                        }
                    }
                    // honor a controller stop/pause at the phase boundary
                    if self.ports.runtime_to_service.probe() {
                        let cmd = self.ports.runtime_to_service.peek().await?;
                        if cmd == Command::Stop.encode() {
                            self.ports.runtime_to_service.recv().await?;
                            self.handle_stop().await?;
                            return Ok((phase, StepExit::Stopped));
                        }
                        if cmd == Command::Pause.encode() {
                            self.ports.runtime_to_service.recv().await?;
                            self.handle_pause().await?;
                            self.paused = true;
                            return Ok((phase, StepExit::Interrupted));
                        }
                    }
                    if phase == Phase::Host {
                        return Ok((phase, StepExit::Completed));
                    }
                }
            }
        }
    }

    /// Collects one response per worker and latches the pending flags.
    /// A malformed or out-of-place response latches the error flag, which
    /// the step loop turns into an upstream `ERROR`.
    async fn collect_worker_responses(&mut self) -> RunResult<()> {
        let num_workers = self.ports.worker_to_service.len();
        for index in 0..num_workers {
            let port = &mut self.ports.worker_to_service[index];
            let word = port.recv().await?;
            match Response::decode(word) {
                Some(Response::Done) => {}
                Some(Response::Error) => self.error = true,
                Some(Response::ReqPreLrnMgmt) => self.pending.pre_lrn_mgmt = true,
                Some(Response::ReqPostLrnMgmt) => self.pending.post_lrn_mgmt = true,
                Some(Response::ReqLearning) => self.pending.lrn = true,
                Some(Response::ReqPause) => self.pending.pause = true,
                Some(Response::ReqStop) => self.pending.stop = true,
                _ => {
                    warn!(
                        service = self.service_id,
                        port = port.name(),
                        word,
                        "unexpected phase response"
                    );
                    self.error = true;
                }
            }
        }
        Ok(())
    }

    /// Winds the workers down after an error. The failed worker's channels
    /// may already be closed, so everything here is best-effort.
    async fn stop_workers_after_error(&mut self) {
        for port in self.ports.service_to_worker.iter_mut() {
            let _ = port.send(Command::Stop.encode()).await;
        }
        for port in self.ports.worker_to_service.iter_mut() {
            loop {
                match port.recv().await {
                    Ok(word) if word == Response::Terminated.encode() => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
        self.ports.join_all();
    }

    /// Receives one word per worker and checks it against the expected
    /// ack.
    async fn collect_acks(&mut self, expected: Response) -> RunResult<()> {
        for port in self.ports.worker_to_service.iter_mut() {
            let word = port.recv().await?;
            if word != expected.encode() {
                return Err(RuntimeError::Protocol {
                    port: port.name().to_string(),
                    word,
                });
            }
        }
        Ok(())
    }

    /// Fans `STOP` to the workers, awaits termination of all of them, and
    /// reports upward. A wrong ack is reported upward as `ERROR` so the
    /// controller never blocks on a missing `TERMINATED`.
    async fn handle_stop(&mut self) -> RunResult<()> {
        self.ports.fan_to_workers(Command::Stop.encode()).await?;
        if let Err(error) = self.collect_acks(Response::Terminated).await {
            self.ports
                .service_to_runtime
                .send(Response::Error.encode())
                .await?;
            return Err(error);
        }
        self.ports
            .service_to_runtime
            .send(Response::Terminated.encode())
            .await?;
        self.ports.join_all();
        Ok(())
    }

    /// Fans `PAUSE` to the workers, awaits their `PAUSED` acks, and
    /// reports upward.
    async fn handle_pause(&mut self) -> RunResult<()> {
        self.ports.fan_to_workers(Command::Pause.encode()).await?;
        if let Err(error) = self.collect_acks(Response::Paused).await {
            self.ports
                .service_to_runtime
                .send(Response::Error.encode())
                .await?;
            return Err(error);
        }
        self.ports
            .service_to_runtime
            .send(Response::Paused.encode())
            .await?;
        Ok(())
    }

    fn addressed_worker(&mut self, worker_id: WorkerId) -> RunResult<usize> {
        self.ports.worker_index(worker_id).ok_or_else(|| {
            RuntimeError::Config(format!(
                "service {} does not drive worker {}",
                self.service_id, worker_id
            ))
        })
    }

    /// Relays a variable read to the addressed worker and its payload back
    /// upward. Legal only while sitting in a host phase; otherwise worker
    /// state may be mid-update and the request is answered with `ERROR`.
    async fn handle_get(&mut self, phase: Phase) -> RunResult<()> {
        let worker_id = self.ports.runtime_to_service.recv().await? as WorkerId;
        let var_id_word = self.ports.runtime_to_service.recv().await?;
        if phase != Phase::Host {
            warn!(
                service = self.service_id,
                "variable read outside host phase"
            );
            self.ports
                .service_to_runtime
                .send(Response::Error.encode())
                .await?;
            return Ok(());
        }
        let index = self.addressed_worker(worker_id)?;
        self.ports.service_to_worker[index]
            .send(Command::GetData.encode())
            .await?;
        self.ports.service_to_worker[index].send(var_id_word).await?;

        // relay [num_items, data...] upward
        let num_items = self.ports.worker_to_service[index].recv().await?;
        self.ports.service_to_runtime.send(num_items).await?;
        for _ in 0..num_items {
            let value = self.ports.worker_to_service[index].recv().await?;
            self.ports.service_to_runtime.send(value).await?;
        }
        Ok(())
    }

    /// Relays a variable write down to the addressed worker. Outside a
    /// host phase the payload is drained and dropped to keep the channel
    /// framed.
    async fn handle_set(&mut self, phase: Phase) -> RunResult<()> {
        let worker_id = self.ports.runtime_to_service.recv().await? as WorkerId;
        let var_id_word = self.ports.runtime_to_service.recv().await?;
        if phase != Phase::Host {
            warn!(
                service = self.service_id,
                "variable write outside host phase, dropping payload"
            );
            let num_items = self.ports.runtime_to_service.recv().await?;
            for _ in 0..num_items {
                self.ports.runtime_to_service.recv().await?;
            }
            return Ok(());
        }
        let index = self.addressed_worker(worker_id)?;
        self.ports.service_to_worker[index]
            .send(Command::SetData.encode())
            .await?;
        self.ports.service_to_worker[index].send(var_id_word).await?;

        // relay [num_items, data...] downward
        let num_items = self.ports.runtime_to_service.recv().await?;
        self.ports.service_to_worker[index].send(num_items).await?;
        for _ in 0..num_items {
            let value = self.ports.runtime_to_service.recv().await?;
            self.ports.service_to_worker[index].send(value).await?;
        }
        Ok(())
    }
}
