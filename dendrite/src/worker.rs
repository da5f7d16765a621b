//! Worker-side protocol loop.
//!
//! A conforming worker receives phase and command tokens from its service,
//! answers every non-`HOST` phase with exactly one response token, honors
//! `STOP`/`PAUSE`, serves variable access during host phases, and reports
//! terminal failures as `STATUS_ERROR` before exiting. The per-phase
//! behavior itself is pluggable: host-interpreted models implement
//! [`WorkerModel`] (phased domains) or [`AsyncWorkerModel`] (asynchronous
//! domains).

use crate::builder::WorkerBuilder;
use crate::channel::{CspRecvPort, CspSendPort};
use crate::executable::Tensor;
use crate::id::{VarId, WorkerId};
use crate::infra::SyncActor;
use crate::mgmt::{self, Command, Phase, Response, Word};
use crate::HashMap;
use async_trait::async_trait;
use color_eyre::eyre::eyre;
use color_eyre::Report;
use tracing::{debug, trace};

/// The variables a worker owns, keyed by id.
#[derive(Debug, Default)]
pub struct VarStore {
    vars: HashMap<VarId, Tensor>,
}

impl VarStore {
    pub fn insert(&mut self, var_id: VarId, tensor: Tensor) {
        self.vars.insert(var_id, tensor);
    }

    pub fn get(&self, var_id: VarId) -> Option<&Tensor> {
        self.vars.get(&var_id)
    }

    pub fn get_mut(&mut self, var_id: VarId) -> Option<&mut Tensor> {
        self.vars.get_mut(&var_id)
    }
}

/// What a model did with a phase. Requests are carried upstream to the
/// service, which schedules the corresponding phase or exits the step
/// loop at the next boundary.
pub enum PhaseOutcome {
    Done,
    ReqPreLrnMgmt,
    ReqLearning,
    ReqPostLrnMgmt,
    ReqPause,
    ReqStop,
    Failed(Report),
}

/// Per-phase behavior of a worker in a phased sync domain.
pub trait WorkerModel: Send + 'static {
    /// Runs one phase. `time_step` counts `Spk` phases, starting at 1
    /// during the first spiking phase. During `Host` the returned outcome
    /// is ignored; workers are silent in that phase.
    fn on_phase(&mut self, phase: Phase, time_step: u64, vars: &mut VarStore) -> PhaseOutcome;
}

/// What an asynchronous model did with a `RUN` command.
pub enum AsyncOutcome {
    Done,
    ReqPause,
    ReqStop,
    Failed(Report),
}

/// Behavior of a worker in an asynchronous sync domain.
pub trait AsyncWorkerModel: Send + 'static {
    fn on_run(&mut self, vars: &mut VarStore) -> AsyncOutcome;
}

/// Worker actor of a phased sync domain.
pub struct WorkerActor<M> {
    worker_id: WorkerId,
    model: M,
    vars: VarStore,
    time_step: u64,
    from_service: CspRecvPort,
    to_service: CspSendPort,
    csp_sends: Vec<CspSendPort>,
    csp_recvs: Vec<CspRecvPort>,
}

#[async_trait]
impl<M: WorkerModel> SyncActor for WorkerActor<M> {
    async fn start(mut self: Box<Self>) -> Result<(), Report> {
        self.start_ports();
        debug!(worker = self.worker_id, "worker started");
        let result = self.run().await;
        if let Err(report) = result {
            // report the failure before exiting; the service may already be
            // gone, in which case the exception on the actor handle is the
            // only trace left
            let _ = self.to_service.send(Response::Error.encode()).await;
            return Err(report);
        }
        Ok(())
    }
}

impl<M: WorkerModel> WorkerActor<M> {
    fn start_ports(&mut self) {
        self.from_service.start();
        self.to_service.start();
        for port in self.csp_sends.iter_mut() {
            port.start();
        }
        for port in self.csp_recvs.iter_mut() {
            port.start();
        }
    }

    fn join_ports(&mut self) {
        self.from_service.join();
        self.to_service.join();
        for port in self.csp_sends.iter_mut() {
            port.join();
        }
        for port in self.csp_recvs.iter_mut() {
            port.join();
        }
    }

    async fn run(&mut self) -> Result<(), Report> {
        loop {
            let word = self.from_service.recv().await?;
            if let Some(phase) = Phase::decode(word) {
                trace!(worker = self.worker_id, ?phase, "phase");
                if phase == Phase::Spk {
                    self.time_step += 1;
                }
                let outcome = self.model.on_phase(phase, self.time_step, &mut self.vars);
                if phase == Phase::Host {
                    // workers are silent during host phases
                    continue;
                }
                let response = match outcome {
                    PhaseOutcome::Done => Response::Done,
                    PhaseOutcome::ReqPreLrnMgmt => Response::ReqPreLrnMgmt,
                    PhaseOutcome::ReqLearning => Response::ReqLearning,
                    PhaseOutcome::ReqPostLrnMgmt => Response::ReqPostLrnMgmt,
                    PhaseOutcome::ReqPause => Response::ReqPause,
                    PhaseOutcome::ReqStop => Response::ReqStop,
                    PhaseOutcome::Failed(report) => return Err(report),
                };
                self.to_service.send(response.encode()).await?;
                continue;
            }
            match Command::decode(word) {
                Some(Command::Stop) => {
                    self.to_service.send(Response::Terminated.encode()).await?;
                    self.join_ports();
                    return Ok(());
                }
                Some(Command::Pause) => {
                    self.to_service.send(Response::Paused.encode()).await?;
                }
                Some(Command::GetData) => self.handle_get().await?,
                Some(Command::SetData) => self.handle_set().await?,
                _ => {
                    return Err(eyre!(
                        "worker {} received unexpected word {}",
                        self.worker_id,
                        word
                    ));
                }
            }
        }
    }

    async fn handle_get(&mut self) -> Result<(), Report> {
        let var_id = self.from_service.recv().await? as VarId;
        let tensor = self.var(var_id)?;
        let data: Vec<f64> = tensor.data().to_vec();
        self.to_service.send(data.len() as Word).await?;
        for value in data {
            self.to_service.send(mgmt::data_word(value)).await?;
        }
        Ok(())
    }

    async fn handle_set(&mut self) -> Result<(), Report> {
        let var_id = self.from_service.recv().await? as VarId;
        let num_items = self.from_service.recv().await?;
        let num_items = usize::try_from(num_items)
            .map_err(|_| eyre!("negative item count {} in set request", num_items))?;
        let mut data = Vec::with_capacity(num_items);
        for _ in 0..num_items {
            data.push(mgmt::word_data(self.from_service.recv().await?));
        }
        let worker_id = self.worker_id;
        let tensor = self.var_mut(var_id)?;
        if num_items > tensor.len() {
            return Err(eyre!(
                "worker {} received {} item(s) for variable {} of {} item(s)",
                worker_id,
                num_items,
                var_id,
                tensor.len()
            ));
        }
        tensor.data_mut()[..num_items].copy_from_slice(&data);
        Ok(())
    }

    fn var(&self, var_id: VarId) -> Result<&Tensor, Report> {
        self.vars
            .get(var_id)
            .ok_or_else(|| eyre!("worker {} does not own variable {}", self.worker_id, var_id))
    }

    fn var_mut(&mut self, var_id: VarId) -> Result<&mut Tensor, Report> {
        let worker_id = self.worker_id;
        self.vars
            .get_mut(var_id)
            .ok_or_else(|| eyre!("worker {} does not own variable {}", worker_id, var_id))
    }
}

/// Worker actor of an asynchronous sync domain. Variable access is not part
/// of this contract; there is no deterministic host phase to serve it in.
pub struct AsyncWorkerActor<M> {
    worker_id: WorkerId,
    model: M,
    vars: VarStore,
    from_service: CspRecvPort,
    to_service: CspSendPort,
}

#[async_trait]
impl<M: AsyncWorkerModel> SyncActor for AsyncWorkerActor<M> {
    async fn start(mut self: Box<Self>) -> Result<(), Report> {
        self.from_service.start();
        self.to_service.start();
        debug!(worker = self.worker_id, "async worker started");
        let result = self.run().await;
        if let Err(report) = result {
            let _ = self.to_service.send(Response::Error.encode()).await;
            return Err(report);
        }
        Ok(())
    }
}

impl<M: AsyncWorkerModel> AsyncWorkerActor<M> {
    async fn run(&mut self) -> Result<(), Report> {
        loop {
            let word = self.from_service.recv().await?;
            match Command::decode(word) {
                Some(Command::Run(_)) => {
                    let response = match self.model.on_run(&mut self.vars) {
                        AsyncOutcome::Done => Response::Done,
                        AsyncOutcome::ReqPause => Response::ReqPause,
                        AsyncOutcome::ReqStop => Response::ReqStop,
                        AsyncOutcome::Failed(report) => return Err(report),
                    };
                    self.to_service.send(response.encode()).await?;
                }
                Some(Command::Stop) => {
                    self.to_service.send(Response::Terminated.encode()).await?;
                    self.from_service.join();
                    self.to_service.join();
                    return Ok(());
                }
                Some(Command::Pause) => {
                    self.to_service.send(Response::Paused.encode()).await?;
                }
                _ => {
                    return Err(eyre!(
                        "async worker {} received unexpected word {}",
                        self.worker_id,
                        word
                    ));
                }
            }
        }
    }
}

/// Builder of a host-interpreted worker for a phased sync domain.
pub struct HostWorkerBuilder<M> {
    worker_id: WorkerId,
    model: M,
    vars: Vec<(VarId, Tensor)>,
    csp_sends: Vec<CspSendPort>,
    csp_recvs: Vec<CspRecvPort>,
    from_service: Option<CspRecvPort>,
    to_service: Option<CspSendPort>,
}

impl<M: WorkerModel> HostWorkerBuilder<M> {
    pub fn new(worker_id: WorkerId, model: M) -> Self {
        Self {
            worker_id,
            model,
            vars: Vec::new(),
            csp_sends: Vec::new(),
            csp_recvs: Vec::new(),
            from_service: None,
            to_service: None,
        }
    }

    /// Declares a variable with its initial value.
    pub fn with_var(mut self, var_id: VarId, init: Tensor) -> Self {
        self.vars.push((var_id, init));
        self
    }
}

impl<M: WorkerModel> WorkerBuilder for HostWorkerBuilder<M> {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn add_csp_send(&mut self, port: CspSendPort) {
        self.csp_sends.push(port);
    }

    fn add_csp_recv(&mut self, port: CspRecvPort) {
        self.csp_recvs.push(port);
    }

    fn set_service_recv(&mut self, from_service: CspRecvPort) {
        self.from_service = Some(from_service);
    }

    fn set_service_send(&mut self, to_service: CspSendPort) {
        self.to_service = Some(to_service);
    }

    fn build(self: Box<Self>) -> Box<dyn SyncActor> {
        let mut vars = VarStore::default();
        for (var_id, tensor) in self.vars {
            vars.insert(var_id, tensor);
        }
        Box::new(WorkerActor {
            worker_id: self.worker_id,
            model: self.model,
            vars,
            time_step: 0,
            from_service: self
                .from_service
                .expect("worker command endpoint should be wired before build"),
            to_service: self
                .to_service
                .expect("worker response endpoint should be wired before build"),
            csp_sends: self.csp_sends,
            csp_recvs: self.csp_recvs,
        })
    }
}

/// Builder of a host-interpreted worker for an asynchronous sync domain.
pub struct AsyncWorkerBuilder<M> {
    worker_id: WorkerId,
    model: M,
    vars: Vec<(VarId, Tensor)>,
    from_service: Option<CspRecvPort>,
    to_service: Option<CspSendPort>,
}

impl<M: AsyncWorkerModel> AsyncWorkerBuilder<M> {
    pub fn new(worker_id: WorkerId, model: M) -> Self {
        Self {
            worker_id,
            model,
            vars: Vec::new(),
            from_service: None,
            to_service: None,
        }
    }

    pub fn with_var(mut self, var_id: VarId, init: Tensor) -> Self {
        self.vars.push((var_id, init));
        self
    }
}

impl<M: AsyncWorkerModel> WorkerBuilder for AsyncWorkerBuilder<M> {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn add_csp_send(&mut self, _port: CspSendPort) {
        // asynchronous workers in this flavor have no worker-worker edges
    }

    fn add_csp_recv(&mut self, _port: CspRecvPort) {}

    fn set_service_recv(&mut self, from_service: CspRecvPort) {
        self.from_service = Some(from_service);
    }

    fn set_service_send(&mut self, to_service: CspSendPort) {
        self.to_service = Some(to_service);
    }

    fn build(self: Box<Self>) -> Box<dyn SyncActor> {
        let mut vars = VarStore::default();
        for (var_id, tensor) in self.vars {
            vars.insert(var_id, tensor);
        }
        Box::new(AsyncWorkerActor {
            worker_id: self.worker_id,
            model: self.model,
            vars,
            from_service: self
                .from_service
                .expect("worker command endpoint should be wired before build"),
            to_service: self
                .to_service
                .expect("worker response endpoint should be wired before build"),
        })
    }
}
