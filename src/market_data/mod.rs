// Market data module entrypoint
pub mod adapters;     // venue-specific snapshot sources and wire types
pub mod diff_stream;  // stream text -> DiffEvent
pub mod normaliser;   // converts strings <-> ticks/lots
pub mod router;       // DepthFeed, the consumer-facing API
pub mod sync;         // per-subscription sync driver

pub use router::{BookSubscription, DepthFeed};
pub use sync::BookStatus;
