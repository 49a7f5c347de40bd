//! Cluster plumbing shared by both coordinators
//!
//! Worker-facing client traits, service discovery over the metadata store,
//! and in-process worker backends for development and testing. The RPC
//! transport behind the traits is an external concern; only request/response
//! semantics live here.

pub mod local;
pub mod session;
pub mod worker;

pub use local::{
    LocalDataCoord, LocalIndexWorker, LocalIndexWorkerFactory, LocalQueryWorker,
    LocalQueryWorkerFactory,
};
pub use session::{Election, Role, SessionEvent, SessionManager, SessionRecord};
pub use worker::{
    CreateJobRequest, DataCoord, DataDistribution, IndexWorker, IndexWorkerFactory, JobStats,
    LeaderViewReport, QueryWorker, QueryWorkerFactory, RecoveryInfo, SegmentLoadInfo, SyncAction,
    SyncDistributionRequest,
};

/// Session role of index build workers.
pub const ROLE_INDEX_WORKER: &str = "index-worker";
/// Session role of query workers.
pub const ROLE_QUERY_WORKER: &str = "query-worker";
/// Session role of the coordinator itself.
pub const ROLE_COORDINATOR: &str = "coordinator";
