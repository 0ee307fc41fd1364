//! Local map: a bounded keyframe window and its asynchronous rebuild.

mod manager;
mod submap;

pub use manager::{MapManager, MapStatus, MapUpdateTrigger, SharedLocalMap};
pub use submap::{Keyframe, LocalMap, Submap};
