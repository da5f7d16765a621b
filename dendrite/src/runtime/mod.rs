//! The runtime controller.
//!
//! Consumes an executable and a run condition, and exposes the APIs to
//! start, pause, stop and wait on an execution. Execution can be blocking
//! or non-blocking as specified by the run condition; worker state is
//! readable and writable from the host between runs.

use crate::builder::ServiceProtocol;
use crate::channel::{CspRecvPort, CspSendPort};
use crate::error::{RunResult, RuntimeError};
use crate::executable::{Executable, NodeKind, RunCondition, Tensor};
use crate::id::{ServiceId, VarId, WorkerId};
use crate::infra::MessageInfrastructure;
use crate::mgmt::{self, Command, Response, Word, MAX_STEPS};
use std::collections::BTreeMap;
use std::mem;
use tracing::{debug, error, warn};

pub struct Runtime {
    executable: Executable,
    infra: MessageInfrastructure,
    service_protocols: BTreeMap<ServiceId, ServiceProtocol>,
    initialized: bool,
    started: bool,
    running: bool,
    req_paused: bool,
    req_stop: bool,
    error: bool,
    num_steps: Word,
    /// Outbound command endpoints, one per service.
    runtime_to_service: BTreeMap<ServiceId, CspSendPort>,
    /// Inbound response endpoints, one per service.
    service_to_runtime: BTreeMap<ServiceId, CspRecvPort>,
}

impl Runtime {
    pub fn new(executable: Executable) -> Self {
        Self {
            executable,
            infra: MessageInfrastructure::new(),
            service_protocols: BTreeMap::new(),
            initialized: false,
            started: false,
            running: false,
            req_paused: false,
            req_stop: false,
            error: false,
            num_steps: 0,
            runtime_to_service: BTreeMap::new(),
            service_to_runtime: BTreeMap::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of spawned actors that have not been joined yet.
    pub fn live_actors(&self) -> usize {
        self.infra.live_actors()
    }

    /// Validates the executable, starts the messaging infrastructure,
    /// fabricates all channels, and spawns worker and service actors.
    pub fn initialize(&mut self) -> RunResult<()> {
        let node_configs = &self.executable.node_configs;
        if node_configs.len() != 1 {
            return Err(RuntimeError::Config(format!(
                "expected exactly 1 node config, got {}",
                node_configs.len()
            )));
        }
        let node_config = &node_configs[0];
        if node_config.nodes.len() != 1 {
            return Err(RuntimeError::Config(format!(
                "expected exactly 1 node, got {}",
                node_config.nodes.len()
            )));
        }
        if node_config.nodes[0].kind != NodeKind::HeadNode {
            return Err(RuntimeError::Config(
                "the single node must be the head node".to_string(),
            ));
        }

        self.infra.start();
        self.build_channels()?;
        self.build_sync_channels()?;
        self.build_workers();
        self.build_services();
        self.start_ports();
        self.initialized = true;
        debug!("runtime initialized");
        Ok(())
    }

    /// Fabricates worker-worker channels and wires the endpoints into the
    /// two worker builders.
    fn build_channels(&mut self) -> RunResult<()> {
        let channel_builders = mem::take(&mut self.executable.channel_builders);
        for channel_builder in channel_builders {
            let (send, recv) = channel_builder.build();
            self.worker_builder_mut(channel_builder.src_worker)?
                .add_csp_send(send);
            self.worker_builder_mut(channel_builder.dst_worker)?
                .add_csp_recv(recv);
        }
        Ok(())
    }

    /// Fabricates controller-service and service-worker channels,
    /// classifying each endpoint by name.
    fn build_sync_channels(&mut self) -> RunResult<()> {
        let sync_channel_builders = mem::take(&mut self.executable.sync_channel_builders);
        for builder in sync_channel_builders {
            let (send, recv) = builder.build();
            let service_id = builder.service_id;
            if builder.name.contains("runtime_to_service") {
                self.service_builder_mut(service_id)?.set_runtime_recv(recv);
                self.runtime_to_service.insert(service_id, send);
            } else if builder.name.contains("service_to_runtime") {
                self.service_builder_mut(service_id)?.set_runtime_send(send);
                self.service_to_runtime.insert(service_id, recv);
            } else if builder.name.contains("service_to_worker") {
                let worker_id = sync_worker_id(&builder.name, builder.worker_id)?;
                self.service_builder_mut(service_id)?
                    .add_worker_send(worker_id, send);
                self.worker_builder_mut(worker_id)?.set_service_recv(recv);
            } else if builder.name.contains("worker_to_service") {
                let worker_id = sync_worker_id(&builder.name, builder.worker_id)?;
                self.worker_builder_mut(worker_id)?.set_service_send(send);
                self.service_builder_mut(service_id)?
                    .add_worker_recv(worker_id, recv);
            } else {
                return Err(RuntimeError::Config(format!(
                    "unexpected sync channel {}",
                    builder.name
                )));
            }
        }
        Ok(())
    }

    fn worker_builder_mut(
        &mut self,
        worker_id: WorkerId,
    ) -> RunResult<&mut Box<dyn crate::builder::WorkerBuilder>> {
        let executable = &mut self.executable;
        if executable.host_builders.contains_key(&worker_id) {
            return Ok(executable
                .host_builders
                .get_mut(&worker_id)
                .expect("key was just checked"));
        }
        if executable.native_builders.contains_key(&worker_id) {
            return Ok(executable
                .native_builders
                .get_mut(&worker_id)
                .expect("key was just checked"));
        }
        if executable.accel_builders.contains_key(&worker_id) {
            return Ok(executable
                .accel_builders
                .get_mut(&worker_id)
                .expect("key was just checked"));
        }
        Err(RuntimeError::Config(format!(
            "no builder for worker {worker_id}"
        )))
    }

    fn service_builder_mut(
        &mut self,
        service_id: ServiceId,
    ) -> RunResult<&mut crate::builder::ServiceBuilder> {
        self.executable
            .service_builders
            .get_mut(&service_id)
            .ok_or_else(|| RuntimeError::Config(format!("no builder for service {service_id}")))
    }

    /// Spawns one actor per worker builder, all flavors.
    fn build_workers(&mut self) {
        let flavors = [
            mem::take(&mut self.executable.host_builders),
            mem::take(&mut self.executable.native_builders),
            mem::take(&mut self.executable.accel_builders),
        ];
        for builders in flavors {
            for (worker_id, builder) in builders {
                self.infra
                    .build_actor(format!("worker_{worker_id}"), move || builder.build());
            }
        }
    }

    /// Spawns one actor per service builder.
    fn build_services(&mut self) {
        let service_builders = mem::take(&mut self.executable.service_builders);
        for (service_id, builder) in service_builders {
            self.service_protocols.insert(service_id, builder.protocol());
            self.infra
                .build_actor(format!("service_{service_id}"), move || builder.build());
        }
    }

    fn start_ports(&mut self) {
        for port in self.runtime_to_service.values_mut() {
            port.start();
        }
        for port in self.service_to_runtime.values_mut() {
            port.start();
        }
    }

    /// Starts running under the given condition. Requires `initialize`.
    pub async fn start(&mut self, run_condition: RunCondition) -> RunResult<()> {
        if !self.initialized {
            return Err(RuntimeError::Usage(
                "runtime not initialized yet".to_string(),
            ));
        }
        self.started = true;
        self.run(run_condition).await
    }

    async fn run(&mut self, run_condition: RunCondition) -> RunResult<()> {
        self.running = true;
        let blocking = match run_condition {
            RunCondition::Steps {
                num_steps,
                blocking,
            } => {
                self.num_steps = Word::try_from(num_steps).unwrap_or(MAX_STEPS);
                blocking
            }
            RunCondition::Continuous => {
                self.num_steps = MAX_STEPS;
                false
            }
        };
        debug!(num_steps = self.num_steps, blocking, "starting run");
        self.send_to_services(self.num_steps).await?;
        if blocking {
            self.drain_service_responses().await?;
        }
        Ok(())
    }

    /// Waits for the services of a non-blocking run to report completion.
    pub async fn wait(&mut self) -> RunResult<()> {
        self.drain_service_responses().await
    }

    async fn send_to_services(&mut self, word: Word) -> RunResult<()> {
        for port in self.runtime_to_service.values_mut() {
            port.send(word).await?;
        }
        Ok(())
    }

    /// Receives one response per service. Pause and stop requests are
    /// deferred until every service is drained, then honored; worker
    /// errors are collected from the actor handles and summarized.
    async fn drain_service_responses(&mut self) -> RunResult<()> {
        if !self.running {
            return Ok(());
        }
        let mut exception_count = 0;
        for port in self.service_to_runtime.values_mut() {
            let word = port.recv().await?;
            match Response::decode(word) {
                Some(Response::Done) => {}
                Some(Response::ReqPause) => self.req_paused = true,
                Some(Response::ReqStop) => self.req_stop = true,
                Some(Response::Error) => {
                    if !self.error {
                        // receive all errors from the workers
                        for actor in self.infra.actors.iter_mut() {
                            actor.join().await;
                            if let Some(exception) = &actor.exception {
                                error!(
                                    actor = actor.name(),
                                    "worker exception: {:?}", exception
                                );
                                exception_count += 1;
                            }
                        }
                        self.error = true;
                    }
                }
                _ => {
                    return Err(RuntimeError::Protocol {
                        port: port.name().to_string(),
                        word,
                    });
                }
            }
        }
        if mem::take(&mut self.req_paused) {
            self.pause().await?;
        }
        if mem::take(&mut self.req_stop) {
            self.stop().await?;
        }
        if mem::take(&mut self.error) {
            self.running = false;
            return Err(RuntimeError::WorkerExceptions {
                count: exception_count,
            });
        }
        self.running = false;
        Ok(())
    }

    /// Pauses an ongoing run at the next phase boundary. No-op while not
    /// running.
    pub async fn pause(&mut self) -> RunResult<()> {
        if !self.running {
            return Ok(());
        }
        self.send_to_services(Command::Pause.encode()).await?;
        let mut exception_count = 0;
        let mut worker_error = false;
        for port in self.service_to_runtime.values_mut() {
            let word = port.recv().await?;
            match Response::decode(word) {
                Some(Response::Paused) => {}
                Some(Response::Error) => {
                    if !worker_error {
                        for actor in self.infra.actors.iter_mut() {
                            actor.join().await;
                            if let Some(exception) = &actor.exception {
                                error!(
                                    actor = actor.name(),
                                    "worker exception: {:?}", exception
                                );
                                exception_count += 1;
                            }
                        }
                        worker_error = true;
                    }
                }
                _ => {
                    return Err(RuntimeError::Protocol {
                        port: port.name().to_string(),
                        word,
                    });
                }
            }
        }
        self.running = false;
        if worker_error {
            self.stop().await?;
            return Err(RuntimeError::WorkerExceptions {
                count: exception_count,
            });
        }
        Ok(())
    }

    /// Stops an ongoing or paused run. Idempotent once not started; the
    /// messaging infrastructure is released on every exit path.
    pub async fn stop(&mut self) -> RunResult<()> {
        let result = self.stop_services().await;
        self.infra.stop().await;
        result
    }

    async fn stop_services(&mut self) -> RunResult<()> {
        // actors are spawned at initialize, so they must be wound down even
        // when the runtime never started; a second stop is a no-op
        if !self.initialized {
            debug!("runtime not initialized yet");
            return Ok(());
        }
        let mut protocol_error = None;
        for (service_id, port) in self.runtime_to_service.iter_mut() {
            if port.send(Command::Stop.encode()).await.is_err() {
                // the service already terminated (e.g. after a worker error)
                debug!(service = *service_id, "service gone before stop");
                continue;
            }
            let response_port = self
                .service_to_runtime
                .get_mut(service_id)
                .expect("every service has a response endpoint");
            match response_port.recv().await {
                Ok(word) if word == Response::Terminated.encode() => {}
                Ok(word) => {
                    protocol_error = Some(RuntimeError::Protocol {
                        port: response_port.name().to_string(),
                        word,
                    });
                }
                Err(_) => {
                    debug!(service = *service_id, "service gone during stop");
                }
            }
        }
        self.join_ports();
        self.running = false;
        self.started = false;
        self.initialized = false;
        match protocol_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Joins all controller-owned endpoints.
    fn join_ports(&mut self) {
        for port in self.runtime_to_service.values_mut() {
            port.join();
        }
        for port in self.service_to_runtime.values_mut() {
            port.join();
        }
    }

    fn var_route(&self, var_id: VarId) -> RunResult<(ServiceId, WorkerId, Vec<usize>, usize)> {
        let exec_var = self.executable.exec_var(var_id)?;
        Ok((
            exec_var.service_id,
            exec_var.worker_id,
            exec_var.shape.clone(),
            exec_var.num_items(),
        ))
    }

    fn refuse_async(&self, service_id: ServiceId, operation: &str) -> RunResult<()> {
        match self.service_protocols.get(&service_id) {
            Some(ServiceProtocol::Asynchronous) => Err(RuntimeError::Usage(format!(
                "{operation} is not supported on an asynchronous sync domain"
            ))),
            Some(_) => Ok(()),
            None => Err(RuntimeError::Config(format!(
                "unknown service {service_id}"
            ))),
        }
    }

    /// Reads the value of a variable, optionally subselecting flat
    /// indices. Only between runs, and never on asynchronous sync domains.
    pub async fn get_var(&mut self, var_id: VarId, idx: Option<&[usize]>) -> RunResult<Tensor> {
        let (service_id, worker_id, shape, expected_items) = self.var_route(var_id)?;
        if !self.started {
            return Err(RuntimeError::Usage("runtime has not started".to_string()));
        }
        self.refuse_async(service_id, "get")?;

        // 1. send the GET command with its trailer
        let request_port = self
            .runtime_to_service
            .get_mut(&service_id)
            .expect("every service has a command endpoint");
        request_port.send(Command::GetData.encode()).await?;
        request_port.send(worker_id as Word).await?;
        request_port.send(var_id as Word).await?;

        // 2. receive [num_items, data...]
        let data_port = self
            .service_to_runtime
            .get_mut(&service_id)
            .expect("every service has a response endpoint");
        let first = data_port.recv().await?;
        if first < 0 {
            // the service answered with a token instead of a count
            return Err(RuntimeError::Usage(
                "variable access rejected; the sync domain is not in a host phase".to_string(),
            ));
        }
        let num_items = first as usize;
        let mut data = Vec::with_capacity(num_items);
        for _ in 0..num_items {
            data.push(mgmt::word_data(data_port.recv().await?));
        }

        // 3. reshape the flat payload back to the variable's shape
        if num_items != expected_items {
            return Err(RuntimeError::Protocol {
                port: data_port.name().to_string(),
                word: first,
            });
        }
        let tensor = Tensor::new(shape, data)?;
        match idx {
            Some(idx) => tensor.select(idx),
            None => Ok(tensor),
        }
    }

    /// Writes the value of a variable. With `idx` the value is subselected
    /// before transfer. Only between runs, and never on asynchronous sync
    /// domains.
    pub async fn set_var(
        &mut self,
        var_id: VarId,
        value: &Tensor,
        idx: Option<&[usize]>,
    ) -> RunResult<()> {
        let (service_id, worker_id, shape, expected_items) = self.var_route(var_id)?;
        if !self.started {
            return Err(RuntimeError::Usage("runtime has not started".to_string()));
        }
        self.refuse_async(service_id, "set")?;

        // subselect before transfer
        let buffer = match idx {
            Some(idx) => value.select(idx)?,
            None => value.clone(),
        };
        if idx.is_none() && buffer.len() != expected_items {
            return Err(RuntimeError::Usage(format!(
                "value of {} item(s) does not fit variable of shape {:?}",
                buffer.len(),
                shape
            )));
        }

        // send [SET_DATA, worker, var, num_items, data...]
        let request_port = self
            .runtime_to_service
            .get_mut(&service_id)
            .expect("every service has a command endpoint");
        request_port.send(Command::SetData.encode()).await?;
        request_port.send(worker_id as Word).await?;
        request_port.send(var_id as Word).await?;
        request_port.send(buffer.len() as Word).await?;
        for value in buffer.data() {
            request_port.send(mgmt::data_word(*value)).await?;
        }
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.started {
            // last-resort release of compute resources; normal exit paths
            // go through `stop`
            warn!("runtime dropped while started, aborting actors");
            self.infra.abort_all();
        }
    }
}

fn sync_worker_id(name: &str, worker_id: Option<WorkerId>) -> RunResult<WorkerId> {
    worker_id.ok_or_else(|| {
        RuntimeError::Config(format!("sync channel {name} does not address a worker"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ServiceBuilder, SyncChannelBuilder, WorkerBuilder};
    use crate::config::RuntimeConfig;
    use crate::executable::{ExecVar, Node, NodeConfig};
    use crate::infra::SyncActor;
    use crate::mgmt::Phase;
    use crate::worker::{
        AsyncOutcome, AsyncWorkerBuilder, AsyncWorkerModel, HostWorkerBuilder, PhaseOutcome,
        VarStore, WorkerModel,
    };
    use async_trait::async_trait;
    use color_eyre::eyre::eyre;
    use color_eyre::Report;
    use std::time::Duration;

    const VAR_SPK: VarId = 1;
    const VAR_HOST: VarId = 2;
    const VAR_LRN: VarId = 3;
    const VAR_WEIGHTS: VarId = 4;

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Counts phases into its variables; can fail or emit upstream
    /// requests at a given time step.
    #[derive(Default)]
    struct CountingModel {
        fail_at_step: Option<u64>,
        req_pause_at_step: Option<u64>,
        req_stop_at_step: Option<u64>,
        req_lrn_at_step: Option<u64>,
    }

    impl CountingModel {
        fn bump(vars: &mut VarStore, var_id: VarId) {
            if let Some(tensor) = vars.get_mut(var_id) {
                tensor.data_mut()[0] += 1.0;
            }
        }
    }

    impl WorkerModel for CountingModel {
        fn on_phase(
            &mut self,
            phase: Phase,
            time_step: u64,
            vars: &mut VarStore,
        ) -> PhaseOutcome {
            match phase {
                Phase::Spk => {
                    if self.fail_at_step == Some(time_step) {
                        return PhaseOutcome::Failed(eyre!(
                            "injected failure at step {time_step}"
                        ));
                    }
                    Self::bump(vars, VAR_SPK);
                    if self.req_pause_at_step == Some(time_step) {
                        self.req_pause_at_step = None;
                        return PhaseOutcome::ReqPause;
                    }
                    if self.req_stop_at_step == Some(time_step) {
                        self.req_stop_at_step = None;
                        return PhaseOutcome::ReqStop;
                    }
                    if self.req_lrn_at_step == Some(time_step) {
                        self.req_lrn_at_step = None;
                        return PhaseOutcome::ReqLearning;
                    }
                    PhaseOutcome::Done
                }
                Phase::Lrn => {
                    Self::bump(vars, VAR_LRN);
                    PhaseOutcome::Done
                }
                Phase::Host => {
                    Self::bump(vars, VAR_HOST);
                    PhaseOutcome::Done
                }
                _ => PhaseOutcome::Done,
            }
        }
    }

    fn counting_builder(worker_id: WorkerId, model: CountingModel) -> Box<dyn WorkerBuilder> {
        Box::new(
            HostWorkerBuilder::new(worker_id, model)
                .with_var(VAR_SPK, Tensor::zeros(vec![1]))
                .with_var(VAR_HOST, Tensor::zeros(vec![1]))
                .with_var(VAR_LRN, Tensor::zeros(vec![1])),
        )
    }

    fn var(var_id: VarId, worker_id: WorkerId, shape: Vec<usize>) -> ExecVar {
        ExecVar {
            var_id,
            worker_id,
            service_id: 0,
            shape,
        }
    }

    /// Assembles a single-domain executable, the way the compiler would.
    fn assemble(
        protocol: ServiceProtocol,
        builders: Vec<Box<dyn WorkerBuilder>>,
        exec_vars: Vec<ExecVar>,
    ) -> Executable {
        let capacity = RuntimeConfig::default().channel_capacity();
        let service_id: ServiceId = 0;
        let model_ids: Vec<WorkerId> =
            builders.iter().map(|builder| builder.worker_id()).collect();

        let mut executable = Executable::new();
        executable.node_configs.push(NodeConfig {
            nodes: vec![Node {
                kind: NodeKind::HeadNode,
            }],
            exec_vars: exec_vars
                .into_iter()
                .map(|exec_var| (exec_var.var_id, exec_var))
                .collect(),
        });
        executable.service_builders.insert(
            service_id,
            ServiceBuilder::new(protocol, service_id, model_ids.clone()),
        );
        executable
            .sync_channel_builders
            .push(SyncChannelBuilder::runtime_to_service(service_id, capacity));
        executable
            .sync_channel_builders
            .push(SyncChannelBuilder::service_to_runtime(service_id, capacity));
        for worker_id in &model_ids {
            executable.sync_channel_builders.push(
                SyncChannelBuilder::service_to_worker(service_id, *worker_id, capacity),
            );
            executable.sync_channel_builders.push(
                SyncChannelBuilder::worker_to_service(service_id, *worker_id, capacity),
            );
        }
        for builder in builders {
            executable.host_builders.insert(builder.worker_id(), builder);
        }
        executable
    }

    async fn scalar(runtime: &mut Runtime, var_id: VarId) -> f64 {
        runtime.get_var(var_id, None).await.unwrap().data()[0]
    }

    #[tokio::test]
    async fn minimal_blocking_run() {
        init_tracing();
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, CountingModel::default())],
            vec![var(VAR_SPK, 1, vec![1]), var(VAR_HOST, 1, vec![1])],
        );
        let mut runtime = Runtime::new(executable);
        assert!(!runtime.is_initialized());
        runtime.initialize().unwrap();
        assert!(runtime.is_initialized());
        assert!(!runtime.is_started());

        runtime
            .start(RunCondition::Steps {
                num_steps: 3,
                blocking: true,
            })
            .await
            .unwrap();
        assert!(runtime.is_started());
        assert!(!runtime.is_running());

        // the worker saw exactly 3 spiking phases and the terminal host
        // phase
        assert_eq!(scalar(&mut runtime, VAR_SPK).await, 3.0);
        assert_eq!(scalar(&mut runtime, VAR_HOST).await, 1.0);

        runtime.stop().await.unwrap();
        assert!(!runtime.is_started());
        assert_eq!(runtime.live_actors(), 0);
    }

    #[tokio::test]
    async fn requested_learning_phase_runs_before_the_next_step() {
        init_tracing();
        let model = CountingModel {
            req_lrn_at_step: Some(2),
            ..Default::default()
        };
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, model)],
            vec![var(VAR_SPK, 1, vec![1]), var(VAR_LRN, 1, vec![1])],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();
        runtime
            .start(RunCondition::Steps {
                num_steps: 3,
                blocking: true,
            })
            .await
            .unwrap();

        assert_eq!(scalar(&mut runtime, VAR_SPK).await, 3.0);
        assert_eq!(scalar(&mut runtime, VAR_LRN).await, 1.0);
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pause_mid_run_then_stop() {
        init_tracing();
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, CountingModel::default())],
            vec![var(VAR_SPK, 1, vec![1])],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();
        runtime
            .start(RunCondition::Steps {
                num_steps: 1_000_000,
                blocking: false,
            })
            .await
            .unwrap();
        assert!(runtime.is_running());

        runtime.pause().await.unwrap();
        assert!(!runtime.is_running());
        assert!(runtime.is_started());

        // the sync domain sits mid-run, not in a host phase, so variable
        // access is rejected
        let error = runtime.get_var(VAR_SPK, None).await.unwrap_err();
        assert!(matches!(error, RuntimeError::Usage(_)));

        runtime.stop().await.unwrap();
        assert_eq!(runtime.live_actors(), 0);
    }

    #[tokio::test]
    async fn worker_pause_request_pauses_the_run() {
        init_tracing();
        let model = CountingModel {
            req_pause_at_step: Some(3),
            ..Default::default()
        };
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, model)],
            vec![var(VAR_SPK, 1, vec![1])],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();

        // the drain observes REQ_PAUSE and invokes pause automatically
        runtime
            .start(RunCondition::Steps {
                num_steps: 10,
                blocking: true,
            })
            .await
            .unwrap();
        assert!(!runtime.is_running());
        assert!(runtime.is_started());

        runtime.stop().await.unwrap();
        assert_eq!(runtime.live_actors(), 0);
    }

    #[tokio::test]
    async fn worker_stop_request_stops_the_run() {
        init_tracing();
        let model = CountingModel {
            req_stop_at_step: Some(2),
            ..Default::default()
        };
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, model)],
            vec![var(VAR_SPK, 1, vec![1])],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();

        // the drain observes REQ_STOP and invokes stop automatically
        runtime
            .start(RunCondition::Steps {
                num_steps: 10,
                blocking: true,
            })
            .await
            .unwrap();
        assert!(!runtime.is_started());
        assert_eq!(runtime.live_actors(), 0);
    }

    #[tokio::test]
    async fn worker_error_is_collected_and_summarized() {
        init_tracing();
        let failing = CountingModel {
            fail_at_step: Some(4),
            ..Default::default()
        };
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![
                counting_builder(1, failing),
                counting_builder(2, CountingModel::default()),
            ],
            vec![],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();

        let error = runtime
            .start(RunCondition::Steps {
                num_steps: 10,
                blocking: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            RuntimeError::WorkerExceptions { count: 1 }
        ));

        runtime.stop().await.unwrap();
        assert_eq!(runtime.live_actors(), 0);
    }

    #[tokio::test]
    async fn get_set_round_trip() {
        init_tracing();
        let builder = Box::new(
            HostWorkerBuilder::new(1, CountingModel::default())
                .with_var(VAR_WEIGHTS, Tensor::zeros(vec![2, 3])),
        );
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![builder],
            vec![var(VAR_WEIGHTS, 1, vec![2, 3])],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();

        // variable access requires a started runtime
        let value =
            Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let error = runtime.set_var(VAR_WEIGHTS, &value, None).await.unwrap_err();
        assert!(matches!(error, RuntimeError::Usage(_)));

        runtime
            .start(RunCondition::Steps {
                num_steps: 1,
                blocking: true,
            })
            .await
            .unwrap();

        runtime.set_var(VAR_WEIGHTS, &value, None).await.unwrap();
        let read = runtime.get_var(VAR_WEIGHTS, None).await.unwrap();
        assert_eq!(read, value);

        // flat-index subselection
        let picked = runtime.get_var(VAR_WEIGHTS, Some(&[0, 5])).await.unwrap();
        assert_eq!(picked.data(), &[1.0, 6.0]);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn continuous_run_then_stop() {
        init_tracing();
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, CountingModel::default())],
            vec![var(VAR_SPK, 1, vec![1])],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();
        runtime.start(RunCondition::Continuous).await.unwrap();
        assert!(runtime.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;

        runtime.stop().await.unwrap();
        assert!(!runtime.is_started());
        assert_eq!(runtime.live_actors(), 0);
    }

    // A fault-injected worker: conforming during phases, but answering the
    // stop command with an unknown token.
    struct RogueActor {
        from_service: crate::channel::CspRecvPort,
        to_service: crate::channel::CspSendPort,
    }

    #[async_trait]
    impl SyncActor for RogueActor {
        async fn start(mut self: Box<Self>) -> Result<(), Report> {
            self.from_service.start();
            self.to_service.start();
            loop {
                let word = self.from_service.recv().await?;
                if let Some(phase) = Phase::decode(word) {
                    if phase != Phase::Host {
                        self.to_service.send(Response::Done.encode()).await?;
                    }
                    continue;
                }
                // a conforming worker would answer TERMINATED here
                self.to_service.send(-99).await?;
                return Ok(());
            }
        }
    }

    #[derive(Default)]
    struct RogueBuilder {
        from_service: Option<crate::channel::CspRecvPort>,
        to_service: Option<crate::channel::CspSendPort>,
    }

    impl WorkerBuilder for RogueBuilder {
        fn worker_id(&self) -> WorkerId {
            1
        }

        fn add_csp_send(&mut self, _port: crate::channel::CspSendPort) {}

        fn add_csp_recv(&mut self, _port: crate::channel::CspRecvPort) {}

        fn set_service_recv(&mut self, from_service: crate::channel::CspRecvPort) {
            self.from_service = Some(from_service);
        }

        fn set_service_send(&mut self, to_service: crate::channel::CspSendPort) {
            self.to_service = Some(to_service);
        }

        fn build(self: Box<Self>) -> Box<dyn SyncActor> {
            Box::new(RogueActor {
                from_service: self.from_service.unwrap(),
                to_service: self.to_service.unwrap(),
            })
        }
    }

    #[tokio::test]
    async fn protocol_violation_still_tears_down() {
        init_tracing();
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![Box::new(RogueBuilder::default())],
            vec![],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();
        runtime
            .start(RunCondition::Steps {
                num_steps: 2,
                blocking: true,
            })
            .await
            .unwrap();

        let error = runtime.stop().await.unwrap_err();
        assert!(matches!(error, RuntimeError::Protocol { .. }));
        // the infrastructure is torn down regardless
        assert_eq!(runtime.live_actors(), 0);
        assert!(!runtime.is_started());
    }

    // Asynchronous domain: the worker requests a stop on its first run.
    struct OneShotModel;

    impl AsyncWorkerModel for OneShotModel {
        fn on_run(&mut self, _vars: &mut VarStore) -> AsyncOutcome {
            AsyncOutcome::ReqStop
        }
    }

    #[tokio::test]
    async fn asynchronous_domain_aggregates_worker_requests() {
        init_tracing();
        let builder = Box::new(AsyncWorkerBuilder::new(1, OneShotModel));
        let executable = assemble(
            ServiceProtocol::Asynchronous,
            vec![builder],
            vec![var(VAR_WEIGHTS, 1, vec![1])],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();
        runtime.start(RunCondition::Continuous).await.unwrap();

        // variable access is refused on an asynchronous domain
        let error = runtime.get_var(VAR_WEIGHTS, None).await.unwrap_err();
        assert!(matches!(error, RuntimeError::Usage(_)));

        // the worker's REQ_STOP surfaces through the service; the drain
        // honors it by stopping everything
        runtime.wait().await.unwrap();
        assert!(!runtime.is_started());
        assert_eq!(runtime.live_actors(), 0);
    }

    // Asynchronous domain: the worker requests a pause on its first run.
    struct PausingModel;

    impl AsyncWorkerModel for PausingModel {
        fn on_run(&mut self, _vars: &mut VarStore) -> AsyncOutcome {
            AsyncOutcome::ReqPause
        }
    }

    #[tokio::test]
    async fn asynchronous_domain_pause_fans_to_workers() {
        init_tracing();
        let builder = Box::new(AsyncWorkerBuilder::new(1, PausingModel));
        let executable = assemble(ServiceProtocol::Asynchronous, vec![builder], vec![]);
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();
        runtime.start(RunCondition::Continuous).await.unwrap();

        // the worker's REQ_PAUSE surfaces through the service; the drain
        // invokes pause, which the service fans to its workers and only
        // acks upward once every worker replied PAUSED
        runtime.wait().await.unwrap();
        assert!(!runtime.is_running());
        assert!(runtime.is_started());

        runtime.stop().await.unwrap();
        assert_eq!(runtime.live_actors(), 0);
    }

    #[tokio::test]
    async fn stop_before_start_still_tears_down() {
        init_tracing();
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, CountingModel::default())],
            vec![],
        );
        let mut runtime = Runtime::new(executable);
        runtime.initialize().unwrap();
        assert!(runtime.live_actors() > 0);

        // pause while not running is a no-op
        runtime.pause().await.unwrap();

        runtime.stop().await.unwrap();
        assert_eq!(runtime.live_actors(), 0);

        // a second stop is a no-op
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_requires_initialize() {
        init_tracing();
        let executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, CountingModel::default())],
            vec![],
        );
        let mut runtime = Runtime::new(executable);
        let error = runtime
            .start(RunCondition::Steps {
                num_steps: 1,
                blocking: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(error, RuntimeError::Usage(_)));
        assert!(!runtime.is_started());
    }

    #[tokio::test]
    async fn initialize_rejects_malformed_node_configs() {
        init_tracing();
        // no node config at all
        let mut runtime = Runtime::new(Executable::new());
        assert!(matches!(
            runtime.initialize(),
            Err(RuntimeError::Config(_))
        ));

        // a non-head node
        let mut executable = assemble(
            ServiceProtocol::Phased,
            vec![counting_builder(1, CountingModel::default())],
            vec![],
        );
        executable.node_configs[0].nodes[0].kind = NodeKind::Accelerator;
        let mut runtime = Runtime::new(executable);
        assert!(matches!(
            runtime.initialize(),
            Err(RuntimeError::Config(_))
        ));
    }
}
