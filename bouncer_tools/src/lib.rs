//! Tooling to run zero-downtime failovers of a stolon-managed Postgres
//! cluster fronted by PgBouncer.
//!
//! The `bouncer_ctl` binary wires these modules into four commands:
//! - `supervise` keeps the local PgBouncer pointed at the current primary;
//! - `pauser` serves the pause/resume API used during failover;
//! - `failover` runs the orchestrated primary switch;
//! - `status` reports cluster and pauser health.

// etcd access: get/put/compare-and-put, watches, the failover lock
pub mod store;

// parsing of the stolon clusterdata document and health predicates
pub mod cluster;

// merged watch+poll event stream with ordering filters and a retrying fold
pub mod stream;

// PgBouncer admin commands and config rendering
pub mod pgbouncer;

// ordered steps with deferred cleanups, used by the failover orchestrator
pub mod pipeline;

// the pauser RPC service and its client
pub mod pauser;

// failover orchestration
pub mod failover;

// stolonctl invocation
pub mod stolonctl;

// PgBouncer child process supervision
pub mod supervisor;

// process-global prometheus metrics
pub mod metrics;
