use std::sync::Arc;

use downcast_rs::{impl_downcast, DowncastSync};

/// An immutable recipe describing how to (re)build a resource's data.
///
/// Implementations are plain data. A snapshot is shared as
/// [`SharedCreateInfo`] and lives as long as anything still holds it; a
/// resource keeps the snapshot its current data was built from so the same
/// data can be rebuilt later. Loaders identify the recipes they understand by
/// downcasting.
pub trait CreateInfo: DowncastSync {}
impl_downcast!(sync CreateInfo);

/// A shared, independently reference-counted create-info snapshot.
pub type SharedCreateInfo = Arc<dyn CreateInfo>;
