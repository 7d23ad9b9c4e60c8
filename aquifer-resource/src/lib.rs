//! Generic lifecycle framework for streamed, reference-counted resources.
//!
//! A [`Resource`] is a handle to one loadable asset. Loading is asynchronous:
//! a load request takes the handle's re-entrancy guard, gets routed through a
//! [`LoaderSet`] to the loader that understands the recipe ([`CreateInfo`]),
//! and publishes its result through a [`LoadOp`]. Release of GPU-visible data
//! is deferred through a [`DeferredCallRing`] so no in-flight frame can still
//! reference it.

mod create_info;
mod deferred;
mod loader;
mod pool;
mod resource;

pub use create_info::{CreateInfo, SharedCreateInfo};
pub use deferred::DeferredCallRing;
pub use loader::{LoadError, LoaderSet, ResourceLoader, UnloadQueue, UnloadRequest};
pub use pool::{PoolError, ResourcePool};
pub use resource::{
    LoadDispatch, LoadOp, LoadState, Resource, ResourceData, ResourceFns, ResourceHandle,
};
