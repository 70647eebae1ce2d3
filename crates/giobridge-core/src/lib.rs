//! Blocking byte-stream devices layered over an asynchronous, callback-completed provider.
//!
//! A [`Mapper`] binds providers into regions. Each region acquires its resources one
//! allocation at a time, then serves [`GioDevice`] reads, writes and control transfers from
//! a bounded pool of request contexts.

mod completion;
mod dispatch;

pub mod binding;
pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod pseudo;
pub mod region;
pub mod resources;

pub use binding::{Attachment, BindingRegistry, HostAttach, NodeTable, UnbindOutcome};
pub use completion::AsyncStatus;
pub use config::{MAX_STAGING_BUFFER_SIZE, MapperConfig};
pub use device::{GioDevice, Mapper, PendingBind};
pub use error::{MapperError, MapperErrorKind, MapperResult};
pub use pool::{ContextKind, ContextPool, PoolCounts, RequestContext};
pub use provider::{
    AllocCompleter, ContextId, ControlHandle, GioProvider, ProviderLimits, Resource,
    XferCompleter, XferCompletion, XferRequest,
};
pub use pseudo::{PseudoConfig, PseudoMode, PseudoProvider};
pub use region::{Region, RegionState, RegionStats};
pub use resources::{AcquisitionState, ResourceKind, ResourceSet};

pub use giobridge_proto as proto;
