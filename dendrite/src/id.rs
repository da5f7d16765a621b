/// Identifier of a worker (process model) in the compiled graph.
pub type WorkerId = u64;

/// Identifier of a sync domain and of the runtime service that drives it.
pub type ServiceId = u64;

/// Identifier of an executable variable.
pub type VarId = u64;
