//! Builder objects the compiler hands to the runtime. Channel builders
//! fabricate the edges of the graph; worker and service builders are
//! shipped into spawned actors, where `build` produces the actor that
//! `start` then runs.
//!
//! Cyclic service-worker references are avoided by keying everything by id:
//! at runtime each side holds channel endpoints only.

use crate::channel::{channel, CspRecvPort, CspSendPort};
use crate::id::{ServiceId, WorkerId};
use crate::infra::SyncActor;
use crate::service::asynchronous::AsyncService;
use crate::service::phased::PhasedService;
use crate::service::ServicePorts;
use crate::HashMap;
use serde::{Deserialize, Serialize};

/// Builder of a unidirectional worker-worker edge.
#[derive(Debug, Clone)]
pub struct ChannelBuilder {
    pub src_worker: WorkerId,
    pub dst_worker: WorkerId,
    pub label: String,
    pub capacity: usize,
}

impl ChannelBuilder {
    pub fn new(
        src_worker: WorkerId,
        dst_worker: WorkerId,
        label: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            src_worker,
            dst_worker,
            label: label.into(),
            capacity,
        }
    }

    /// Fabricates the channel; the caller wires the endpoints into the two
    /// worker builders.
    pub fn build(&self) -> (CspSendPort, CspRecvPort) {
        let name = format!(
            "{}_{}_to_{}",
            self.label, self.src_worker, self.dst_worker
        );
        channel(name, self.capacity)
    }
}

/// Builder of a controller-service or service-worker edge. Endpoints are
/// classified by name substring when the controller wires them; the
/// constructors below guarantee the conventional names.
#[derive(Debug, Clone)]
pub struct SyncChannelBuilder {
    pub name: String,
    pub service_id: ServiceId,
    /// Set on service-worker edges, absent on controller-service edges.
    pub worker_id: Option<WorkerId>,
    pub capacity: usize,
}

impl SyncChannelBuilder {
    /// Controller outbound command edge.
    pub fn runtime_to_service(service_id: ServiceId, capacity: usize) -> Self {
        Self {
            name: format!("runtime_to_service_{service_id}"),
            service_id,
            worker_id: None,
            capacity,
        }
    }

    /// Controller inbound response edge.
    pub fn service_to_runtime(service_id: ServiceId, capacity: usize) -> Self {
        Self {
            name: format!("service_to_runtime_{service_id}"),
            service_id,
            worker_id: None,
            capacity,
        }
    }

    /// Service outbound phase/command edge towards one worker.
    pub fn service_to_worker(service_id: ServiceId, worker_id: WorkerId, capacity: usize) -> Self {
        Self {
            name: format!("service_to_worker_{service_id}_{worker_id}"),
            service_id,
            worker_id: Some(worker_id),
            capacity,
        }
    }

    /// Worker response edge towards its service.
    pub fn worker_to_service(service_id: ServiceId, worker_id: WorkerId, capacity: usize) -> Self {
        Self {
            name: format!("worker_to_service_{worker_id}_{service_id}"),
            service_id,
            worker_id: Some(worker_id),
            capacity,
        }
    }

    pub fn build(&self) -> (CspSendPort, CspRecvPort) {
        channel(self.name.clone(), self.capacity)
    }
}

/// Synchronization protocol a service implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceProtocol {
    /// The cyclic phase protocol (`SPK`, management, learning, `HOST`).
    Phased,
    /// Workers progress freely; no deterministic host phase, so variable
    /// access is unsupported.
    Asynchronous,
}

/// Builder of a worker actor. Implementations hold the worker's model and
/// collect channel endpoints as the controller wires the graph.
pub trait WorkerBuilder: Send + 'static {
    fn worker_id(&self) -> WorkerId;

    /// Wires the send endpoint of a worker-worker edge.
    fn add_csp_send(&mut self, port: CspSendPort);

    /// Wires the recv endpoint of a worker-worker edge.
    fn add_csp_recv(&mut self, port: CspRecvPort);

    /// Wires the service-facing command endpoint.
    fn set_service_recv(&mut self, from_service: CspRecvPort);

    /// Wires the service-facing response endpoint.
    fn set_service_send(&mut self, to_service: CspSendPort);

    fn build(self: Box<Self>) -> Box<dyn SyncActor>;
}

/// Builder of a runtime service actor.
pub struct ServiceBuilder {
    protocol: ServiceProtocol,
    service_id: ServiceId,
    /// Ids of the workers this service drives, in routing order.
    model_ids: Vec<WorkerId>,
    runtime_to_service: Option<CspRecvPort>,
    service_to_runtime: Option<CspSendPort>,
    service_to_worker: HashMap<WorkerId, CspSendPort>,
    worker_to_service: HashMap<WorkerId, CspRecvPort>,
}

impl ServiceBuilder {
    pub fn new(protocol: ServiceProtocol, service_id: ServiceId, model_ids: Vec<WorkerId>) -> Self {
        Self {
            protocol,
            service_id,
            model_ids,
            runtime_to_service: None,
            service_to_runtime: None,
            service_to_worker: HashMap::new(),
            worker_to_service: HashMap::new(),
        }
    }

    pub fn protocol(&self) -> ServiceProtocol {
        self.protocol
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn set_runtime_recv(&mut self, port: CspRecvPort) {
        self.runtime_to_service = Some(port);
    }

    pub fn set_runtime_send(&mut self, port: CspSendPort) {
        self.service_to_runtime = Some(port);
    }

    pub fn add_worker_send(&mut self, worker_id: WorkerId, port: CspSendPort) {
        self.service_to_worker.insert(worker_id, port);
    }

    pub fn add_worker_recv(&mut self, worker_id: WorkerId, port: CspRecvPort) {
        self.worker_to_service.insert(worker_id, port);
    }

    pub fn build(mut self) -> Box<dyn SyncActor> {
        let runtime_to_service = self
            .runtime_to_service
            .take()
            .expect("service command endpoint should be wired before build");
        let service_to_runtime = self
            .service_to_runtime
            .take()
            .expect("service response endpoint should be wired before build");

        // worker ports in `model_ids` order, so that routing by index works
        let service_to_worker = self
            .model_ids
            .iter()
            .map(|worker_id| {
                self.service_to_worker
                    .remove(worker_id)
                    .expect("every driven worker should have a command endpoint")
            })
            .collect();
        let worker_to_service = self
            .model_ids
            .iter()
            .map(|worker_id| {
                self.worker_to_service
                    .remove(worker_id)
                    .expect("every driven worker should have a response endpoint")
            })
            .collect();

        let ports = ServicePorts {
            runtime_to_service,
            service_to_runtime,
            service_to_worker,
            worker_to_service,
            model_ids: self.model_ids,
        };
        match self.protocol {
            ServiceProtocol::Phased => Box::new(PhasedService::new(self.service_id, ports)),
            ServiceProtocol::Asynchronous => Box::new(AsyncService::new(self.service_id, ports)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_channel_names_follow_the_classification_convention() {
        let capacity = 8;
        let rts = SyncChannelBuilder::runtime_to_service(3, capacity);
        let str_ = SyncChannelBuilder::service_to_runtime(3, capacity);
        let stw = SyncChannelBuilder::service_to_worker(3, 7, capacity);
        let wts = SyncChannelBuilder::worker_to_service(3, 7, capacity);

        assert!(rts.name.contains("runtime_to_service"));
        assert!(!rts.name.contains("service_to_runtime"));
        assert!(str_.name.contains("service_to_runtime"));
        assert!(!str_.name.contains("runtime_to_service"));
        assert!(stw.name.contains("service_to_worker"));
        assert!(wts.name.contains("worker_to_service"));

        // both endpoints of a built channel carry the builder's name
        let (send, recv) = stw.build();
        assert_eq!(send.name(), stw.name);
        assert_eq!(recv.name(), stw.name);
    }
}
