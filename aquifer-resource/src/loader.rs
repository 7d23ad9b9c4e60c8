use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use aquifer_base::ResourceId;

use crate::create_info::{CreateInfo, SharedCreateInfo};
use crate::resource::{LoadOp, ResourceData, ResourceHandle};

/// Why a load could not produce data.
///
/// Loader-specific failures ride in the boxed variants; everything surfaces
/// through [`LoadOp::fail`] and leaves the resource in the `Failed` state,
/// queryable and retry-able.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("no create info is available to build the resource from")]
    MissingCreateInfo,
    #[error("no registered loader accepts the create info")]
    NoCompatibleLoader,
    #[error("importing source data failed: {0}")]
    Import(Box<dyn std::error::Error + Send + Sync>),
    #[error("uploading built data failed: {0}")]
    Upload(Box<dyn std::error::Error + Send + Sync>),
    #[error("required sub-resource {0} failed to load")]
    DependencyFailed(ResourceId),
}

/// The per-asset-kind loading contract.
///
/// A new asset kind plugs into the framework by implementing this trait and
/// registering the loader in a [`LoaderSet`]; nothing else is required.
pub trait ResourceLoader: Send + Sync {
    /// Fast, side-effect-free check used to route a recipe to the right
    /// loader among several registered ones.
    fn can_process(
        &self,
        create_info: &dyn CreateInfo,
    ) -> bool;

    /// Builds the resource's data from the recipe. May do the work inline or
    /// hand it off to further workers; `load_op` must be consumed exactly
    /// once on every path out.
    fn load(
        self: Arc<Self>,
        resource: ResourceHandle,
        create_info: SharedCreateInfo,
        load_op: LoadOp,
    );

    /// Once-per-frame upkeep, called on the thread that owns the session:
    /// finish in-flight uploads, retire one deferred-ring bucket, promote
    /// queued unload requests whose prior load has fully completed.
    fn maintenance(&self) {}

    /// Releases a resource's published data: immediately when no
    /// frame-in-flight constraints apply (teardown), otherwise after the
    /// loader's configured delay.
    fn unload(
        &self,
        resource: ResourceHandle,
        iteration: u32,
        immediate: bool,
    );

    /// Destroys data already detached from its resource, whether replaced by
    /// a reload or still published when the last handle dropped.
    fn release_detached(
        &self,
        data: ResourceData,
    );
}

/// A deferred unload, parked until maintenance promotes it into the ring.
/// The stamp voids the request if the data is replaced in the meantime.
pub struct UnloadRequest {
    pub resource: ResourceHandle,
    pub iteration: u32,
}

/// Queue of [`UnloadRequest`]s for loaders to embed: unloads arrive from any
/// thread, maintenance drains them on the session-owning one.
pub struct UnloadQueue {
    tx: Sender<UnloadRequest>,
    rx: Receiver<UnloadRequest>,
}

impl UnloadQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        UnloadQueue { tx, rx }
    }

    pub fn push(
        &self,
        request: UnloadRequest,
    ) {
        // The receiving half lives alongside the sender, so this cannot fail
        self.tx.send(request).unwrap();
    }

    /// Takes everything queued so far.
    pub fn drain(&self) -> Vec<UnloadRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.rx.try_recv() {
            requests.push(request);
        }
        requests
    }
}

impl Default for UnloadQueue {
    fn default() -> Self {
        UnloadQueue::new()
    }
}

/// Ordered registry of loaders for the asset kinds a simulation understands.
pub struct LoaderSet {
    loaders: Vec<Arc<dyn ResourceLoader>>,
}

impl LoaderSet {
    pub fn new() -> Self {
        LoaderSet {
            loaders: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        loader: Arc<dyn ResourceLoader>,
    ) {
        self.loaders.push(loader);
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// The first registered loader that accepts the recipe.
    pub fn find_for(
        &self,
        create_info: &dyn CreateInfo,
    ) -> Option<&Arc<dyn ResourceLoader>> {
        self.loaders
            .iter()
            .find(|loader| loader.can_process(create_info))
    }

    /// Routes a load to a compatible loader. A missing recipe or one that no
    /// loader accepts fails the op; it is not retried.
    pub fn dispatch(
        &self,
        resource: ResourceHandle,
        create_info: Option<SharedCreateInfo>,
        load_op: LoadOp,
    ) {
        let create_info = match create_info {
            Some(create_info) => create_info,
            None => {
                load_op.fail(LoadError::MissingCreateInfo);
                return;
            }
        };

        match self.find_for(create_info.as_ref()) {
            Some(loader) => loader.clone().load(resource, create_info, load_op),
            None => {
                log::warn!(
                    "resource {} - create info matches no registered loader",
                    resource.id()
                );
                load_op.fail(LoadError::NoCompatibleLoader);
            }
        }
    }

    /// Per-frame upkeep across every registered loader.
    #[profiling::function]
    pub fn maintenance(&self) {
        for loader in &self.loaders {
            loader.maintenance();
        }
    }
}

impl Default for LoaderSet {
    fn default() -> Self {
        LoaderSet::new()
    }
}
