// Host page abstraction: the document, observers and video events the engine works against.

pub mod memory;
pub mod traits;

pub use memory::{ElementSpec, MemoryPage};
pub use traits::{
    DomError, InteractionKind, Mutation, NodeId, NodeInfo, ObserveFilter, PageDom, PageEvent,
    PageEventSink, Subscription, VideoEvent, VideoRef, VideoSnapshot,
};
