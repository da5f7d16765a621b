//! Per-sync-domain runtime services.
//!
//! Every service actor owns the same three channel sets: a controller-facing
//! pair and a parallel pair per driven worker. `start` arms all endpoints
//! and enters the protocol loop; the loop ends when the controller's `STOP`
//! has been honored. Services are single-threaded cooperative loops built
//! on the selector.

// This module contains the phased (cyclic phase sequence) driver.
pub mod phased;

// This module contains the asynchronous driver.
pub mod asynchronous;

use crate::channel::{CspRecvPort, CspSendPort};
use crate::error::RunResult;
use crate::id::WorkerId;
use crate::mgmt::Word;

/// The channel endpoints of one service, with the worker ports ordered by
/// `model_ids` so that routing by index works.
pub struct ServicePorts {
    pub runtime_to_service: CspRecvPort,
    pub service_to_runtime: CspSendPort,
    pub service_to_worker: Vec<CspSendPort>,
    pub worker_to_service: Vec<CspRecvPort>,
    pub model_ids: Vec<WorkerId>,
}

impl ServicePorts {
    pub fn start_all(&mut self) {
        self.runtime_to_service.start();
        self.service_to_runtime.start();
        for port in self.service_to_worker.iter_mut() {
            port.start();
        }
        for port in self.worker_to_service.iter_mut() {
            port.start();
        }
    }

    pub fn join_all(&mut self) {
        self.runtime_to_service.join();
        self.service_to_runtime.join();
        for port in self.service_to_worker.iter_mut() {
            port.join();
        }
        for port in self.worker_to_service.iter_mut() {
            port.join();
        }
    }

    /// Routing index of a driven worker.
    pub fn worker_index(&self, worker_id: WorkerId) -> Option<usize> {
        self.model_ids.iter().position(|id| *id == worker_id)
    }

    /// Sends one word to every driven worker.
    pub async fn fan_to_workers(&mut self, word: Word) -> RunResult<()> {
        for port in self.service_to_worker.iter_mut() {
            port.send(word).await?;
        }
        Ok(())
    }
}
