//! The compiled form of a user graph, handed to the controller at
//! construction. The compiler that lowers a graph into this bundle lives
//! outside the runtime.

use crate::builder::{ChannelBuilder, ServiceBuilder, SyncChannelBuilder, WorkerBuilder};
use crate::error::{RunResult, RuntimeError};
use crate::id::{ServiceId, VarId, WorkerId};
use crate::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compute resource backing a node. The runtime only schedules on the head
/// node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    HeadNode,
    Accelerator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
}

/// Descriptor of an executable variable: its owning worker, the service
/// that routes to that worker, and the variable's shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecVar {
    pub var_id: VarId,
    pub worker_id: WorkerId,
    pub service_id: ServiceId,
    pub shape: Vec<usize>,
}

impl ExecVar {
    pub fn num_items(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub nodes: Vec<Node>,
    pub exec_vars: HashMap<VarId, ExecVar>,
}

/// A shaped buffer of 64-bit floats, the payload type of variable access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> RunResult<Self> {
        let num_items: usize = shape.iter().product();
        if num_items != data.len() {
            return Err(RuntimeError::Usage(format!(
                "tensor shape {:?} does not hold {} item(s)",
                shape,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A tensor of zeros with the given shape.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let num_items = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; num_items],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Subselects the given flat indices into a rank-1 tensor.
    pub fn select(&self, idx: &[usize]) -> RunResult<Self> {
        let mut data = Vec::with_capacity(idx.len());
        for &i in idx {
            let item = self.data.get(i).ok_or_else(|| {
                RuntimeError::Usage(format!(
                    "index {} out of bounds for tensor of {} item(s)",
                    i,
                    self.data.len()
                ))
            })?;
            data.push(*item);
        }
        Ok(Self {
            shape: vec![idx.len()],
            data,
        })
    }
}

/// Termination predicate supplied at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunCondition {
    /// Run for `num_steps` time steps. When `blocking`, `start` returns
    /// only after every service reported completion; otherwise the caller
    /// collects completion later through `wait`.
    Steps { num_steps: u64, blocking: bool },
    /// Run until stopped. Never blocking.
    Continuous,
}

/// The immutable bundle the controller consumes: node configuration,
/// per-flavor worker builders, service builders, and the channel builders
/// describing every edge of the graph.
#[derive(Default)]
pub struct Executable {
    pub node_configs: Vec<NodeConfig>,
    /// Builders of host-interpreted workers.
    pub host_builders: BTreeMap<WorkerId, Box<dyn WorkerBuilder>>,
    /// Builders of natively compiled workers.
    pub native_builders: BTreeMap<WorkerId, Box<dyn WorkerBuilder>>,
    /// Builders of accelerator-resident workers.
    pub accel_builders: BTreeMap<WorkerId, Box<dyn WorkerBuilder>>,
    pub service_builders: BTreeMap<ServiceId, ServiceBuilder>,
    /// Worker-worker edges.
    pub channel_builders: Vec<ChannelBuilder>,
    /// Controller-service and service-worker edges.
    pub sync_channel_builders: Vec<SyncChannelBuilder>,
}

impl Executable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the descriptor of a variable.
    pub fn exec_var(&self, var_id: VarId) -> RunResult<&ExecVar> {
        self.node_configs
            .first()
            .and_then(|node_config| node_config.exec_vars.get(&var_id))
            .ok_or_else(|| RuntimeError::Usage(format!("unknown variable {var_id}")))
    }
}
