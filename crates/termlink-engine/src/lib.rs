//! Controller-side engine for terminus discovery and event polling
//!
//! Two cooperating state machines per managed endpoint:
//!
//! - [`discovery::Terminus`] walks the capability-negotiation chain for a
//!   newly added endpoint and bulk-loads its description records into the
//!   shared repository.
//! - [`poller::EventPoller`] drains priority queues of pending event ids,
//!   pulling each payload fragment by fragment over a stop-and-wait exchange,
//!   reassembling, checksum-verifying, and dispatching to registered class
//!   handlers.
//!
//! Both run as tasks on a single cooperative reactor; the
//! [`manager::EndpointManager`] owns their lifecycles and tears them down
//! when an endpoint is removed.

pub mod classify;
pub mod config;
pub mod consumers;
pub mod discovery;
pub mod manager;
pub mod poller;
pub mod queues;
pub mod registry;

pub use classify::{ChannelState, Classifier, LifecycleHooks};
pub use config::{EngineConfig, NameDecoration, NameMap};
pub use consumers::{MemoryRepository, ObjectFactory, Repository};
pub use discovery::{DiscoveryOutcome, FruField, Terminus, TerminusProfile};
pub use manager::EndpointManager;
pub use poller::{CycleOutcome, EventPoller};
pub use queues::{EnqueueOutcome, EventQueues, Priority};
pub use registry::HandlerRegistry;
