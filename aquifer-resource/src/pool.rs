use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use aquifer_base::ResourceId;

use crate::resource::{Resource, ResourceFns, ResourceHandle};

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("a resource with this id already exists in the pool")]
    IdAlreadyExists,
    #[error("no resource with this id exists in the pool")]
    NotFound,
}

/// Owner of the resources for one asset kind.
///
/// The pool creates each resource holding one reference and hands out clones;
/// a resource is destroyed when the pool's reference and every external one
/// are gone. Removal while external references remain is allowed but logged,
/// since the resource then outlives its pool entry.
pub struct ResourcePool {
    type_tag: u32,
    fns: Arc<ResourceFns>,
    resources: DashMap<ResourceId, ResourceHandle>,
}

impl ResourcePool {
    pub fn new(
        type_tag: u32,
        fns: Arc<ResourceFns>,
    ) -> Self {
        ResourcePool {
            type_tag,
            fns,
            resources: DashMap::new(),
        }
    }

    pub fn type_tag(&self) -> u32 {
        self.type_tag
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Creates the resource for `id`. The id must not already be present.
    pub fn add(
        &self,
        id: ResourceId,
    ) -> Result<ResourceHandle, PoolError> {
        match self.resources.entry(id) {
            Entry::Occupied(_) => Err(PoolError::IdAlreadyExists),
            Entry::Vacant(entry) => {
                let resource = Resource::new(id, self.type_tag, self.fns.clone());
                entry.insert(resource.clone());
                Ok(resource)
            }
        }
    }

    pub fn find(
        &self,
        id: ResourceId,
    ) -> Option<ResourceHandle> {
        self.resources.get(&id).map(|entry| entry.value().clone())
    }

    /// Drops the pool's reference to `id`.
    pub fn remove(
        &self,
        id: ResourceId,
    ) -> Result<(), PoolError> {
        let (_, resource) = self.resources.remove(&id).ok_or(PoolError::NotFound)?;

        if Arc::strong_count(&resource) > 1 {
            log::warn!(
                "resource {} - removed from its pool while externally referenced, destruction is deferred to the last holder",
                id
            );
        }

        Ok(())
    }

    /// Requests a deferred unload of every pooled resource, e.g. ahead of
    /// session teardown.
    pub fn unload_all(&self) {
        for entry in self.resources.iter() {
            entry.value().unload(false);
        }
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        for entry in self.resources.iter() {
            if Arc::strong_count(entry.value()) > 1 {
                log::warn!(
                    "resource {} - pool destroyed while the resource is still externally referenced",
                    entry.key()
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::create_info::{CreateInfo, SharedCreateInfo};
    use crate::loader::{LoadError, ResourceLoader};
    use crate::resource::{LoadOp, LoadState, ResourceData};
    use aquifer_base::{GroupId, IndexAllocator};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BytesRecipe(Vec<u8>);
    impl CreateInfo for BytesRecipe {}

    // Completes loads inline; deferred unloads release on the next maintenance
    struct BytesLoader {
        pending_unloads: crate::loader::UnloadQueue,
        released: AtomicUsize,
    }

    impl BytesLoader {
        fn new() -> Arc<Self> {
            Arc::new(BytesLoader {
                pending_unloads: crate::loader::UnloadQueue::new(),
                released: AtomicUsize::new(0),
            })
        }
    }

    impl ResourceLoader for BytesLoader {
        fn can_process(
            &self,
            create_info: &dyn CreateInfo,
        ) -> bool {
            create_info.is::<BytesRecipe>()
        }

        fn load(
            self: Arc<Self>,
            _resource: ResourceHandle,
            create_info: SharedCreateInfo,
            load_op: LoadOp,
        ) {
            let bytes = create_info.downcast_ref::<BytesRecipe>().unwrap().0.clone();
            load_op.complete(Box::new(bytes), Some(create_info), self.clone());
        }

        fn maintenance(&self) {
            for request in self.pending_unloads.drain() {
                if let Some(data) = request.resource.take_data(request.iteration) {
                    self.release_detached(data);
                }
            }
        }

        fn unload(
            &self,
            resource: ResourceHandle,
            iteration: u32,
            immediate: bool,
        ) {
            if immediate {
                if let Some(data) = resource.take_data(iteration) {
                    self.release_detached(data);
                }
            } else {
                self.pending_unloads.push(crate::loader::UnloadRequest {
                    resource,
                    iteration,
                });
            }
        }

        fn release_detached(
            &self,
            data: ResourceData,
        ) {
            self.released.fetch_add(1, Ordering::SeqCst);
            drop(data);
        }
    }

    fn bytes_pool(loader: &Arc<BytesLoader>) -> ResourcePool {
        let dispatch_loader = loader.clone();
        let fns = Arc::new(
            crate::resource::ResourceFns::new(move |resource, create_info, load_op| {
                match create_info {
                    Some(create_info) => {
                        dispatch_loader
                            .clone()
                            .load(resource, create_info, load_op)
                    }
                    None => load_op.fail(LoadError::MissingCreateInfo),
                }
            })
            .with_importer(|id| {
                Some(Arc::new(BytesRecipe(vec![id.index() as u8])) as SharedCreateInfo)
            }),
        );
        ResourcePool::new(3, fns)
    }

    #[test]
    fn added_resources_are_findable() {
        let loader = BytesLoader::new();
        let pool = bytes_pool(&loader);
        let id = ResourceId::new(GroupId::PERSISTENT, 1);

        let added = pool.add(id).unwrap();
        assert_eq!(added.id(), id);
        assert_eq!(added.type_tag(), 3);

        let found = pool.find(id).unwrap();
        assert!(Arc::ptr_eq(&added, &found));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let loader = BytesLoader::new();
        let pool = bytes_pool(&loader);
        let id = ResourceId::new(GroupId::PERSISTENT, 1);

        pool.add(id).unwrap();
        assert_eq!(pool.add(id).err(), Some(PoolError::IdAlreadyExists));
    }

    #[test]
    fn finding_or_removing_unknown_ids_fails() {
        let loader = BytesLoader::new();
        let pool = bytes_pool(&loader);
        let id = ResourceId::new(GroupId::PERSISTENT, 9);

        assert!(pool.find(id).is_none());
        assert_eq!(pool.remove(id).err(), Some(PoolError::NotFound));
    }

    #[test]
    fn removal_drops_the_pools_reference() {
        let loader = BytesLoader::new();
        let pool = bytes_pool(&loader);
        let id = ResourceId::new(GroupId::PERSISTENT, 2);

        let resource = pool.add(id).unwrap();
        assert_eq!(resource.ref_count(), 2);

        pool.remove(id).unwrap();
        assert_eq!(resource.ref_count(), 1);
        assert!(pool.find(id).is_none());
    }

    #[test]
    fn ids_issued_by_an_allocator_drive_the_pool() {
        let loader = BytesLoader::new();
        let pool = bytes_pool(&loader);
        let allocator = IndexAllocator::new(GroupId::PERSISTENT);

        for _ in 0..3 {
            pool.add(allocator.generate().unwrap()).unwrap();
        }
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn unload_all_defers_release_until_maintenance() {
        let loader = BytesLoader::new();
        let pool = bytes_pool(&loader);

        let mut resources = Vec::new();
        for index in 1..=3 {
            let resource = pool.add(ResourceId::new(GroupId::PERSISTENT, index)).unwrap();
            resource.load(false);
            assert_eq!(resource.load_state(), LoadState::Loaded);
            resources.push(resource);
        }

        pool.unload_all();

        // Still reachable for in-flight consumers until maintenance runs
        assert_eq!(loader.released.load(Ordering::SeqCst), 0);
        assert!(resources.iter().all(|resource| resource.has_data()));

        loader.maintenance();

        assert_eq!(loader.released.load(Ordering::SeqCst), 3);
        assert!(resources.iter().all(|resource| !resource.has_data()));
    }
}
