mod broadcast;
mod config;
mod core;
mod error;
mod key;
mod live_state;
mod registry;
mod replica;
mod subscription;

#[cfg(doctest)]
mod tests_readme;

pub use broadcast::{InvalidationBroadcaster, InvalidationNotice, InvalidationSink};
pub use config::{duration, Config, LiveStateConfig, RegistryConfig};
pub use crate::core::{Generation, Validity};
pub use error::{Error, Result};
pub use key::{Arg, ComputationKey, OperationId, SessionToken};
pub use live_state::{LiveContext, LiveState, LiveStateObserver, Phase};
pub use registry::{ComputationRegistry, ComputeContext, ComputedCell};
pub use replica::{
    LocalEndpoint, RemoteEndpoint, RemoteSnapshot, RemoteValue, ReplicaClient, ReplicaMirror,
};
pub use subscription::Subscription;
