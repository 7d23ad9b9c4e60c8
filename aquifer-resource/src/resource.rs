use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use aquifer_base::ResourceId;
use aquifer_task::SplitThreadPool;

use crate::create_info::SharedCreateInfo;
use crate::loader::{LoadError, ResourceLoader};

/// Type-erased loaded payload. The loader that built it knows the concrete
/// type and downcasts on the way back out.
pub type ResourceData = Box<dyn Any + Send + Sync>;

/// Load progress of a resource.
///
/// `Unloaded --load--> Loading --ok--> Loaded`; `Loading --err--> Failed`;
/// `Loaded | Failed --unload--> Unloaded`. A `Failed` resource stays
/// queryable and a later load re-runs the full sequence.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

impl LoadState {
    fn from_u8(value: u8) -> LoadState {
        match value {
            1 => LoadState::Loading,
            2 => LoadState::Loaded,
            3 => LoadState::Failed,
            _ => LoadState::Unloaded,
        }
    }
}

/// What became of a load request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadDispatch {
    /// The request took the loading guard; the load is running or scheduled.
    Scheduled,
    /// Another load already holds the guard. The request had no effect and
    /// the caller must not assume its own request will be honored.
    AlreadyLoading,
}

pub type ImportCreateInfoFn = dyn Fn(ResourceId) -> Option<SharedCreateInfo> + Send + Sync;
pub type DispatchLoadFn = dyn Fn(ResourceHandle, Option<SharedCreateInfo>, LoadOp) + Send + Sync;
pub type ScheduleTaskFn = dyn Fn(Box<dyn FnOnce() + Send + 'static>) + Send + Sync;

/// Callbacks shared by a pool and every resource it creates: how to fetch a
/// create-info for an id, how to route a load to a loader, and where to
/// schedule asynchronous work. Passed around explicitly, never registered
/// process-wide.
pub struct ResourceFns {
    import: Option<Box<ImportCreateInfoFn>>,
    load: Box<DispatchLoadFn>,
    schedule_async: Option<Box<ScheduleTaskFn>>,
}

impl ResourceFns {
    pub fn new(
        load: impl Fn(ResourceHandle, Option<SharedCreateInfo>, LoadOp) + Send + Sync + 'static
    ) -> Self {
        ResourceFns {
            import: None,
            load: Box::new(load),
            schedule_async: None,
        }
    }

    /// Routes loads through a loader registry.
    pub fn for_loaders(loaders: Arc<crate::loader::LoaderSet>) -> Self {
        ResourceFns::new(move |resource, create_info, load_op| {
            loaders.dispatch(resource, create_info, load_op)
        })
    }

    /// Sets the callback that fetches a create-info snapshot for an id, used
    /// when loading with a missing or stale recipe.
    pub fn with_importer(
        mut self,
        import: impl Fn(ResourceId) -> Option<SharedCreateInfo> + Send + Sync + 'static,
    ) -> Self {
        self.import = Some(Box::new(import));
        self
    }

    /// Sets the callback load tasks are handed to. Without one, loads run on
    /// the requesting thread.
    pub fn with_async_schedule(
        mut self,
        schedule: impl Fn(Box<dyn FnOnce() + Send + 'static>) + Send + Sync + 'static,
    ) -> Self {
        self.schedule_async = Some(Box::new(schedule));
        self
    }

    /// Wires asynchronous loads onto a split thread pool's async workers.
    pub fn with_thread_pool(
        self,
        thread_pool: Arc<SplitThreadPool>,
    ) -> Self {
        self.with_async_schedule(move |task| {
            if let Err(error) = thread_pool.schedule_async(task) {
                // The dropped task takes its load op with it, failing the load
                log::error!("could not schedule load task: {}", error);
            }
        })
    }
}

struct LoadedData {
    data: ResourceData,
    // Snapshot the data was built from, kept so it can be rebuilt
    create_info: Option<SharedCreateInfo>,
    unloader: Arc<dyn ResourceLoader>,
}

struct ResourceSlot {
    // Bumped whenever the published data changes; stale deferred unloads
    // compare against it and back off
    iteration: u32,
    create_info: Option<SharedCreateInfo>,
    loaded: Option<LoadedData>,
}

/// A handle to one loadable asset.
///
/// Ownership is carried by [`Arc`]: the creating pool holds one reference,
/// and every other holder (the load task included, for the duration of
/// loading) holds a clone, so the resource cannot be destroyed while a load
/// is in flight. The use count is orthogonal and tracks active external
/// consumers rather than owners.
///
/// All fields are atomics except the published data slot, whose mutex is held
/// only across swaps.
pub struct Resource {
    id: ResourceId,
    type_tag: u32,
    use_count: AtomicI32,
    // Sole re-entrancy guard for loads: whoever wins the CAS owns the load
    // until its op is consumed
    loading: AtomicBool,
    state: AtomicU8,
    slot: Mutex<ResourceSlot>,
    fns: Arc<ResourceFns>,
}

pub type ResourceHandle = Arc<Resource>;

impl Resource {
    pub fn new(
        id: ResourceId,
        type_tag: u32,
        fns: Arc<ResourceFns>,
    ) -> ResourceHandle {
        log::trace!("resource {} - created", id);

        Arc::new(Resource {
            id,
            type_tag,
            use_count: AtomicI32::new(0),
            loading: AtomicBool::new(false),
            state: AtomicU8::new(LoadState::Unloaded as u8),
            slot: Mutex::new(ResourceSlot {
                iteration: 0,
                create_info: None,
                loaded: None,
            }),
            fns,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn type_tag(&self) -> u32 {
        self.type_tag
    }

    pub fn load_state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Number of live handles, the load task's included.
    pub fn ref_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub fn use_count(&self) -> i32 {
        self.use_count.load(Ordering::SeqCst)
    }

    /// Marks an external consumer; returns the new count.
    pub fn increment_use_count(&self) -> i32 {
        self.use_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement_use_count(&self) -> i32 {
        self.use_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Stamp identifying the currently published data.
    pub fn iteration(&self) -> u32 {
        self.slot.lock().unwrap().iteration
    }

    /// The latest create-info snapshot, if any was imported or published.
    pub fn create_info(&self) -> Option<SharedCreateInfo> {
        self.slot.lock().unwrap().create_info.clone()
    }

    pub fn has_data(&self) -> bool {
        self.slot.lock().unwrap().loaded.is_some()
    }

    /// Runs `f` against the published data if it is present and of type `T`.
    /// The slot lock is held while `f` runs; keep it short.
    pub fn data_with<T: Any, R>(
        &self,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let slot = self.slot.lock().unwrap();
        let loaded = slot.loaded.as_ref()?;
        let data = loaded.data.downcast_ref::<T>()?;
        Some(f(data))
    }

    /// Requests a (re)load of the resource's data.
    ///
    /// The winning request refreshes the create-info when asked to (or when
    /// none is known), then routes the resource through the load dispatch
    /// callback. The task goes to the async scheduler when one is configured
    /// and runs on the calling thread otherwise.
    pub fn load(
        self: &Arc<Self>,
        refresh_create_info: bool,
    ) -> LoadDispatch {
        if self
            .loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!(
                "resource {} - load requested while a load is already in flight",
                self.id
            );
            return LoadDispatch::AlreadyLoading;
        }

        self.set_state(LoadState::Loading);

        // The op keeps the resource alive across the async boundary and owns
        // the loading guard from here on: if the task never runs, dropping
        // the op fails the load instead of wedging the guard
        let load_op = LoadOp::new(self.clone());
        let resource = self.clone();
        let task = move || {
            if refresh_create_info || resource.create_info().is_none() {
                resource.refresh_create_info();
            }
            let create_info = resource.create_info();
            (resource.fns.load)(resource.clone(), create_info, load_op);
        };

        match &self.fns.schedule_async {
            Some(schedule_async) => {
                log::trace!("resource {} - loading asynchronously", self.id);
                schedule_async(Box::new(task));
            }
            None => {
                log::trace!("resource {} - loading on the calling thread", self.id);
                task();
            }
        }

        LoadDispatch::Scheduled
    }

    /// Re-imports the create-info snapshot without touching the loaded data.
    /// Shares the loading guard with [`Resource::load`], so the two cannot
    /// interleave.
    pub fn import_create_info(self: &Arc<Self>) -> LoadDispatch {
        if self
            .loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!(
                "resource {} - create-info import requested while a load is in flight",
                self.id
            );
            return LoadDispatch::AlreadyLoading;
        }

        let guard = LoadingGuard {
            resource: self.clone(),
        };
        let resource = self.clone();
        let task = move || {
            resource.refresh_create_info();
            drop(guard);
        };

        match &self.fns.schedule_async {
            Some(schedule_async) => schedule_async(Box::new(task)),
            None => task(),
        }

        LoadDispatch::Scheduled
    }

    /// Releases the published data, now (`immediate`) or after the owning
    /// loader's configured delay.
    ///
    /// An unload issued while a load is still in flight races the publish of
    /// the new data; sequencing the two is the caller's job, the framework
    /// does not order them.
    pub fn unload(
        self: &Arc<Self>,
        immediate: bool,
    ) {
        let snapshot = {
            let slot = self.slot.lock().unwrap();
            slot.loaded
                .as_ref()
                .map(|loaded| (loaded.unloader.clone(), slot.iteration))
        };

        if let Some((unloader, iteration)) = snapshot {
            log::trace!(
                "resource {} - unload requested ({})",
                self.id,
                if immediate { "immediate" } else { "deferred" }
            );
            unloader.unload(self.clone(), iteration, immediate);
        }
    }

    /// Detaches the published data if `iteration` still identifies it.
    /// Loaders call this from their release paths; a stale stamp means the
    /// data was already replaced or taken, and nothing happens.
    pub fn take_data(
        &self,
        iteration: u32,
    ) -> Option<ResourceData> {
        let taken = {
            let mut slot = self.slot.lock().unwrap();
            if slot.iteration != iteration {
                return None;
            }
            let loaded = slot.loaded.take()?;
            slot.iteration += 1;
            loaded
        };

        self.set_state(LoadState::Unloaded);
        log::debug!("resource {} - unloaded", self.id);

        // The loaded create-info and the unloader reference drop here,
        // outside the slot lock
        Some(taken.data)
    }

    fn set_state(
        &self,
        state: LoadState,
    ) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn refresh_create_info(&self) {
        if let Some(import) = &self.fns.import {
            if let Some(new_create_info) = import(self.id) {
                let replaced = {
                    let mut slot = self.slot.lock().unwrap();
                    slot.create_info.replace(new_create_info)
                };
                // Snapshot teardown can be expensive; it happens outside the lock
                drop(replaced);
            }
        }
    }

    fn publish(
        &self,
        data: ResourceData,
        create_info: Option<SharedCreateInfo>,
        unloader: Arc<dyn ResourceLoader>,
    ) {
        let replaced = {
            let mut slot = self.slot.lock().unwrap();
            slot.iteration += 1;
            slot.loaded.replace(LoadedData {
                data,
                create_info,
                unloader,
            })
        };

        self.set_state(LoadState::Loaded);
        self.loading.store(false, Ordering::SeqCst);
        log::debug!("resource {} - loaded", self.id);

        // Data replaced by a reload goes back through its loader for release
        if let Some(replaced) = replaced {
            replaced.unloader.release_detached(replaced.data);
        }
    }

    fn mark_failed(&self) {
        self.set_state(LoadState::Failed);
        self.loading.store(false, Ordering::SeqCst);
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if self.use_count.load(Ordering::SeqCst) > 0 {
            log::warn!(
                "resource {} - destroyed while use count is non-zero",
                self.id
            );
        }

        // No other handles exist at this point; any still-published data goes
        // back through its loader
        if let Some(loaded) = self.slot.get_mut().unwrap().loaded.take() {
            loaded.unloader.release_detached(loaded.data);
        }

        log::trace!("resource {} - destroyed", self.id);
    }
}

// Releases the loading flag when a create-info import finishes or its task
// is dropped unrun.
struct LoadingGuard {
    resource: ResourceHandle,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.resource.loading.store(false, Ordering::SeqCst);
    }
}

/// Completion token for one load.
///
/// Every exit path of a loader's `load` must consume the op exactly once via
/// [`LoadOp::complete`] or [`LoadOp::fail`]. Dropping it unconsumed fails the
/// resource, so the loading guard and the load task's reference are never
/// leaked.
pub struct LoadOp {
    resource: Option<ResourceHandle>,
}

impl LoadOp {
    pub(crate) fn new(resource: ResourceHandle) -> Self {
        LoadOp {
            resource: Some(resource),
        }
    }

    pub fn resource(&self) -> &ResourceHandle {
        self.resource.as_ref().unwrap()
    }

    /// Publishes the built data and moves the resource to `Loaded`. The
    /// previously published data, if any, is released through its loader.
    pub fn complete(
        mut self,
        data: ResourceData,
        create_info: Option<SharedCreateInfo>,
        unloader: Arc<dyn ResourceLoader>,
    ) {
        let resource = self.resource.take().unwrap();
        resource.publish(data, create_info, unloader);
    }

    /// Marks the resource `Failed`. It stays queryable, and a later load may
    /// retry the full sequence.
    pub fn fail(
        mut self,
        error: LoadError,
    ) {
        let resource = self.resource.take().unwrap();
        log::error!("resource {} - load failed: {}", resource.id(), error);
        resource.mark_failed();
    }
}

impl Drop for LoadOp {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            log::error!(
                "resource {} - load op dropped without completing",
                resource.id()
            );
            resource.mark_failed();
        }
    }
}
