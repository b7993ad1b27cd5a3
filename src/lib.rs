//! hawser: an event-driven networking runtime.
//!
//! Single-threaded event loops multiplex I/O readiness (mio) or io_uring
//! completions; channels bind a transport socket to a user-defined handler
//! pipeline; reference-counted buffers move bytes through that pipeline;
//! bootstraps assemble the pieces:
//!
//! - [`buffer`]: reference-counted buffers, pooled arenas, composites,
//!   leak detection
//! - [`cleaner`]: background release of native resources
//! - [`pipeline`]: the handler chain and event propagation
//! - [`channel`]: channel lifecycle, options, and the unsafe layer
//! - [`promise`]: single-assignment completion with listeners
//! - [`executor`]: event loops, groups, and the scheduler
//! - [`io`]: the readiness backend contract, mio and io_uring backends
//! - [`bootstrap`]: client and server builders

pub mod bootstrap;
pub mod buffer;
pub mod channel;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod executor;
pub mod io;
pub mod pipeline;
pub mod promise;

pub use bootstrap::{Bootstrap, ServerBootstrap};
pub use buffer::{Allocator, ByteBuf, CompositeBuf, LeakDetector, LeakLevel};
pub use channel::{Channel, ChannelOption, ChannelState, InputShutdownEvent, RecvAllocatorSpec};
pub use config::{Runtime, RuntimeConfig, ServerConfig};
pub use error::{Error, Result};
pub use executor::{EventLoop, EventLoopGroup, ScheduledHandle};
pub use io::BackendKind;
pub use pipeline::{Caps, ChannelInitializer, Handler, HandlerContext, Message, Pipeline};
pub use promise::{Outcome, Promise, PromiseCombiner};
