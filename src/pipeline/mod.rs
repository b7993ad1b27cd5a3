//! Handler pipelines.
//!
//! A pipeline is a doubly-linked chain of handler contexts between a fixed
//! head and tail. Inbound events walk head to tail; outbound operations walk
//! tail to head, with the head performing the actual channel operation.
//! Walks skip contexts whose handler lacks the event direction, and the next
//! inbound hop for the hot read path is cached per context and invalidated
//! on every mutation.
//!
//! Mutation during dispatch is legal: a removed context keeps its own
//! pointers, so an in-flight walk continues at its successor.

mod handler;

pub use handler::{ChannelInitializer, Handler};
pub(crate) use handler::{HeadHandler, TailHandler};

use crate::buffer::ByteBuf;
use crate::channel::{Channel, ChannelCore};
use crate::error::{Error, Result, SharedError};
use crate::executor::EventLoop;
use crate::promise::Promise;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::warn;

/// A message moving through a pipeline.
pub type Message = Box<dyn Any + Send + 'static>;

/// Downcast a pipeline message to a buffer, returning the message on
/// mismatch.
pub fn downcast_buf(msg: Message) -> std::result::Result<ByteBuf, Message> {
    msg.downcast::<ByteBuf>().map(|b| *b)
}

/// Direction capabilities a handler participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps(u8);

impl Caps {
    /// Reacts to inbound events.
    pub const INBOUND: Caps = Caps(1);
    /// Intercepts outbound operations.
    pub const OUTBOUND: Caps = Caps(1 << 1);

    /// Both directions.
    pub fn all() -> Caps {
        Caps(Self::INBOUND.0 | Self::OUTBOUND.0)
    }

    /// Whether all bits of `other` are present.
    pub fn contains(self, other: Caps) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Caps {
    type Output = Caps;
    fn bitor(self, rhs: Caps) -> Caps {
        Caps(self.0 | rhs.0)
    }
}

/// One node of the pipeline: a named handler plus its links.
pub struct HandlerContext {
    name: String,
    handler: RefCell<Box<dyn Handler>>,
    caps: Caps,
    prev: RefCell<Weak<HandlerContext>>,
    next: RefCell<Option<Rc<HandlerContext>>>,
    /// Cached next inbound-capable context for the read path.
    read_cache: RefCell<Option<Rc<HandlerContext>>>,
    removed: Cell<bool>,
    pipe: RefCell<Weak<PipeInner>>,
}

struct PipeInner {
    head: Rc<HandlerContext>,
    tail: Rc<HandlerContext>,
    channel: Weak<ChannelCore>,
    event_loop: EventLoop,
}

/// The handler chain bound to one channel. Loop-local; cross-thread
/// mutation goes through the channel handle, which wraps the call as a task.
#[derive(Clone)]
pub struct Pipeline {
    inner: Rc<PipeInner>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<ChannelCore>, event_loop: EventLoop) -> Pipeline {
        let head = Rc::new(HandlerContext {
            name: "head".to_string(),
            handler: RefCell::new(Box::new(HeadHandler)),
            caps: Caps::all(),
            prev: RefCell::new(Weak::new()),
            next: RefCell::new(None),
            read_cache: RefCell::new(None),
            removed: Cell::new(false),
            pipe: RefCell::new(Weak::new()),
        });
        let tail = Rc::new(HandlerContext {
            name: "tail".to_string(),
            handler: RefCell::new(Box::new(TailHandler)),
            caps: Caps::INBOUND,
            prev: RefCell::new(Rc::downgrade(&head)),
            next: RefCell::new(None),
            read_cache: RefCell::new(None),
            removed: Cell::new(false),
            pipe: RefCell::new(Weak::new()),
        });
        *head.next.borrow_mut() = Some(Rc::clone(&tail));
        let inner = Rc::new(PipeInner {
            head,
            tail,
            channel,
            event_loop,
        });
        *inner.head.pipe.borrow_mut() = Rc::downgrade(&inner);
        *inner.tail.pipe.borrow_mut() = Rc::downgrade(&inner);
        Pipeline { inner }
    }

    pub(crate) fn channel_core(&self) -> Option<Rc<ChannelCore>> {
        self.inner.channel.upgrade()
    }

    /// The channel this pipeline belongs to, while it is alive.
    pub fn channel(&self) -> Option<Channel> {
        self.channel_core().map(|core| core.handle())
    }

    /// The event loop running this pipeline's callbacks.
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    // ---- mutation ----

    fn ctx_of(&self, name: &str) -> Option<Rc<HandlerContext>> {
        let mut cur = self.inner.head.next.borrow().clone();
        while let Some(ctx) = cur {
            if Rc::ptr_eq(&ctx, &self.inner.tail) {
                return None;
            }
            if ctx.name == name {
                return Some(ctx);
            }
            cur = ctx.next.borrow().clone();
        }
        None
    }

    fn check_unique(&self, name: &str) -> Result<()> {
        if name == "head" || name == "tail" || self.ctx_of(name).is_some() {
            return Err(Error::IllegalState(format!(
                "duplicate handler name: {name}"
            )));
        }
        Ok(())
    }

    fn invalidate_caches(&self) {
        let mut cur = Some(Rc::clone(&self.inner.head));
        while let Some(ctx) = cur {
            ctx.read_cache.borrow_mut().take();
            cur = ctx.next.borrow().clone();
        }
    }

    fn link_before(&self, anchor: &Rc<HandlerContext>, ctx: Rc<HandlerContext>) {
        let prev = anchor.prev.borrow().upgrade().expect("anchor has no prev");
        *ctx.prev.borrow_mut() = Rc::downgrade(&prev);
        *ctx.next.borrow_mut() = Some(Rc::clone(anchor));
        *prev.next.borrow_mut() = Some(Rc::clone(&ctx));
        *anchor.prev.borrow_mut() = Rc::downgrade(&ctx);
        self.invalidate_caches();
    }

    fn new_ctx(&self, name: &str, handler: Box<dyn Handler>) -> Rc<HandlerContext> {
        let caps = handler.caps();
        Rc::new(HandlerContext {
            name: name.to_string(),
            handler: RefCell::new(handler),
            caps,
            prev: RefCell::new(Weak::new()),
            next: RefCell::new(None),
            read_cache: RefCell::new(None),
            removed: Cell::new(false),
            pipe: RefCell::new(Rc::downgrade(&self.inner)),
        })
    }

    fn added(&self, ctx: &Rc<HandlerContext>) -> Result<()> {
        let result = ctx.handler.borrow_mut().handler_added(ctx);
        if let Err(e) = result {
            self.unlink(ctx);
            return Err(e);
        }
        Ok(())
    }

    /// Insert a handler right after the head.
    pub fn add_first(&self, name: &str, handler: Box<dyn Handler>) -> Result<()> {
        self.check_unique(name)?;
        let ctx = self.new_ctx(name, handler);
        let anchor = self.inner.head.next.borrow().clone().expect("head has next");
        self.link_before(&anchor, Rc::clone(&ctx));
        self.added(&ctx)
    }

    /// Append a handler right before the tail.
    pub fn add_last(&self, name: &str, handler: Box<dyn Handler>) -> Result<()> {
        self.check_unique(name)?;
        let ctx = self.new_ctx(name, handler);
        self.link_before(&self.inner.tail.clone(), Rc::clone(&ctx));
        self.added(&ctx)
    }

    /// Insert a handler before the named one.
    pub fn add_before(&self, anchor: &str, name: &str, handler: Box<dyn Handler>) -> Result<()> {
        self.check_unique(name)?;
        let anchor = self
            .ctx_of(anchor)
            .ok_or_else(|| Error::IllegalState(format!("no such handler: {anchor}")))?;
        let ctx = self.new_ctx(name, handler);
        self.link_before(&anchor, Rc::clone(&ctx));
        self.added(&ctx)
    }

    /// Insert a handler after the named one.
    pub fn add_after(&self, anchor: &str, name: &str, handler: Box<dyn Handler>) -> Result<()> {
        self.check_unique(name)?;
        let anchor = self
            .ctx_of(anchor)
            .ok_or_else(|| Error::IllegalState(format!("no such handler: {anchor}")))?;
        let next = anchor.next.borrow().clone().expect("non-tail has next");
        let ctx = self.new_ctx(name, handler);
        self.link_before(&next, Rc::clone(&ctx));
        self.added(&ctx)
    }

    fn unlink(&self, ctx: &Rc<HandlerContext>) {
        let prev = ctx.prev.borrow().upgrade().expect("removed ctx has prev");
        let next = ctx.next.borrow().clone().expect("removed ctx has next");
        *prev.next.borrow_mut() = Some(Rc::clone(&next));
        *next.prev.borrow_mut() = Rc::downgrade(&prev);
        // The removed node keeps its own pointers so an in-flight walk
        // continues at its successor.
        ctx.removed.set(true);
        self.invalidate_caches();
    }

    /// Remove the named handler. `handler_removed` runs after the last event
    /// it can observe; removal from inside the handler's own callback defers
    /// the notification to a loop task.
    pub fn remove(&self, name: &str) -> Result<()> {
        let ctx = self
            .ctx_of(name)
            .ok_or_else(|| Error::IllegalState(format!("no such handler: {name}")))?;
        self.unlink(&ctx);
        notify_removed(ctx);
        Ok(())
    }

    /// Replace the named handler in place, keeping the position.
    pub fn replace(&self, name: &str, new_name: &str, handler: Box<dyn Handler>) -> Result<()> {
        let ctx = self
            .ctx_of(name)
            .ok_or_else(|| Error::IllegalState(format!("no such handler: {name}")))?;
        if new_name != name {
            self.check_unique(new_name)?;
        }
        // Same links, fresh context node: capability masks are fixed at add.
        let new_ctx = self.new_ctx(new_name, handler);
        let next = ctx.next.borrow().clone().expect("non-tail has next");
        self.link_before(&next, Rc::clone(&new_ctx));
        self.unlink(&ctx);
        notify_removed(ctx);
        self.added(&new_ctx)
    }

    /// Handler names from head to tail, exclusive of both.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut cur = self.inner.head.next.borrow().clone();
        while let Some(ctx) = cur {
            if Rc::ptr_eq(&ctx, &self.inner.tail) {
                break;
            }
            names.push(ctx.name.clone());
            cur = ctx.next.borrow().clone();
        }
        names
    }

    /// Whether a handler with the given name is installed.
    pub fn contains(&self, name: &str) -> bool {
        self.ctx_of(name).is_some()
    }

    // ---- inbound entry points (called by the channel's unsafe layer) ----

    pub(crate) fn fire_channel_registered(&self) {
        invoke_channel_registered(&self.inner.head);
    }

    pub(crate) fn fire_channel_active(&self) {
        invoke_channel_active(&self.inner.head);
    }

    pub(crate) fn fire_channel_read(&self, msg: Message) {
        invoke_channel_read(&self.inner.head, msg);
    }

    pub(crate) fn fire_channel_read_complete(&self) {
        invoke_channel_read_complete(&self.inner.head);
    }

    pub(crate) fn fire_channel_inactive(&self) {
        invoke_channel_inactive(&self.inner.head);
    }

    pub(crate) fn fire_channel_unregistered(&self) {
        invoke_channel_unregistered(&self.inner.head);
    }

    pub(crate) fn fire_user_event(&self, event: Message) {
        invoke_user_event(&self.inner.head, event);
    }

    pub(crate) fn fire_exception_caught(&self, cause: SharedError) {
        invoke_exception_caught(&self.inner.head, cause);
    }

    pub(crate) fn fire_writability_changed(&self, writable: bool) {
        invoke_writability_changed(&self.inner.head, writable);
    }

    // ---- outbound entry points ----

    fn promise(&self) -> Promise<()> {
        Promise::with_executor(self.inner.event_loop.clone())
    }

    /// Bind the channel's socket to a local address.
    pub fn bind(&self, addr: SocketAddr) -> Promise<()> {
        let promise = self.promise();
        self.inner.tail.bind_with(addr, promise.clone());
        promise
    }

    /// Connect the channel to a remote address.
    pub fn connect(&self, addr: SocketAddr) -> Promise<()> {
        let promise = self.promise();
        self.inner.tail.connect_with(addr, promise.clone());
        promise
    }

    /// Shut the connection down without closing the channel.
    pub fn disconnect(&self) -> Promise<()> {
        let promise = self.promise();
        self.inner.tail.disconnect_with(promise.clone());
        promise
    }

    /// Close the channel.
    pub fn close(&self) -> Promise<()> {
        let promise = self.promise();
        self.inner.tail.close_with(promise.clone());
        promise
    }

    /// Queue a message for writing.
    pub fn write(&self, msg: Message) -> Promise<()> {
        let promise = self.promise();
        self.inner.tail.write_with(msg, promise.clone());
        promise
    }

    /// `write` completing the supplied promise.
    pub fn write_with(&self, msg: Message, promise: Promise<()>) {
        self.inner.tail.write_with(msg, promise);
    }

    /// `bind` completing the supplied promise.
    pub fn bind_with_promise(&self, addr: SocketAddr, promise: Promise<()>) {
        self.inner.tail.bind_with(addr, promise);
    }

    /// `connect` completing the supplied promise.
    pub fn connect_with_promise(&self, addr: SocketAddr, promise: Promise<()>) {
        self.inner.tail.connect_with(addr, promise);
    }

    /// `disconnect` completing the supplied promise.
    pub fn disconnect_with_promise(&self, promise: Promise<()>) {
        self.inner.tail.disconnect_with(promise);
    }

    /// `close` completing the supplied promise.
    pub fn close_with_promise(&self, promise: Promise<()>) {
        self.inner.tail.close_with(promise);
    }

    /// Flush queued writes toward the kernel.
    pub fn flush(&self) {
        self.inner.tail.flush_op();
    }

    /// `write` followed by `flush`.
    pub fn write_and_flush(&self, msg: Message) -> Promise<()> {
        let promise = self.write(msg);
        self.flush();
        promise
    }

    /// Request one read from the transport.
    pub fn read(&self) {
        self.inner.tail.read_op();
    }
}

fn notify_removed(ctx: Rc<HandlerContext>) {
    match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => {
            if let Err(e) = handler.handler_removed(&ctx) {
                warn!(handler = %ctx.name, error = %e, "handler_removed failed");
            }
        }
        // Removal from inside the handler's own callback: notify after the
        // current dispatch unwinds.
        Err(_) => match crate::executor::current_loop_ctx() {
            Some(loop_ctx) => {
                let ctx = Rc::clone(&ctx);
                loop_ctx.borrow_mut().execute_local(Box::new(move || {
                    if let Ok(mut handler) = ctx.handler.try_borrow_mut() {
                        if let Err(e) = handler.handler_removed(&ctx) {
                            warn!(handler = %ctx.name, error = %e, "handler_removed failed");
                        }
                    }
                }));
            }
            None => warn!(handler = %ctx.name, "removal outside the event loop; notification skipped"),
        },
    }
}

impl HandlerContext {
    /// This context's handler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the handler was removed from its pipeline.
    pub fn is_removed(&self) -> bool {
        self.removed.get()
    }

    /// The pipeline this context belongs to.
    pub fn pipeline(&self) -> Option<Pipeline> {
        self.pipe.borrow().upgrade().map(|inner| Pipeline { inner })
    }

    /// The channel, while it is alive.
    pub fn channel(&self) -> Option<Channel> {
        self.channel_core().map(|core| core.handle())
    }

    pub(crate) fn channel_core(&self) -> Option<Rc<ChannelCore>> {
        self.pipe.borrow().upgrade().and_then(|p| p.channel.upgrade())
    }

    /// The buffer allocator of the channel.
    pub fn alloc(&self) -> Option<crate::buffer::Allocator> {
        self.channel_core().map(|core| core.alloc().clone())
    }

    /// The event loop running this pipeline.
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.pipe.borrow().upgrade().map(|p| p.event_loop.clone())
    }

    fn next_inbound(&self) -> Option<Rc<HandlerContext>> {
        if let Some(cached) = self.read_cache.borrow().clone() {
            return Some(cached);
        }
        let mut cur = self.next.borrow().clone();
        while let Some(ctx) = cur {
            if ctx.caps.contains(Caps::INBOUND) && !ctx.removed.get() {
                *self.read_cache.borrow_mut() = Some(Rc::clone(&ctx));
                return Some(ctx);
            }
            cur = ctx.next.borrow().clone();
        }
        None
    }

    fn prev_outbound(&self) -> Option<Rc<HandlerContext>> {
        let mut cur = self.prev.borrow().upgrade();
        while let Some(ctx) = cur {
            if ctx.caps.contains(Caps::OUTBOUND) && !ctx.removed.get() {
                return Some(ctx);
            }
            cur = ctx.prev.borrow().upgrade();
        }
        None
    }

    // ---- inbound forwarding ----

    /// Forward `channel_registered` to the next inbound handler.
    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.next_inbound() {
            invoke_channel_registered(&next);
        }
    }

    /// Forward `channel_active` to the next inbound handler.
    pub fn fire_channel_active(&self) {
        if let Some(next) = self.next_inbound() {
            invoke_channel_active(&next);
        }
    }

    /// Forward a read message to the next inbound handler.
    pub fn fire_channel_read(&self, msg: Message) {
        if let Some(next) = self.next_inbound() {
            invoke_channel_read(&next, msg);
        }
    }

    /// Forward `channel_read_complete` to the next inbound handler.
    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.next_inbound() {
            invoke_channel_read_complete(&next);
        }
    }

    /// Forward `channel_inactive` to the next inbound handler.
    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.next_inbound() {
            invoke_channel_inactive(&next);
        }
    }

    /// Forward `channel_unregistered` to the next inbound handler.
    pub fn fire_channel_unregistered(&self) {
        if let Some(next) = self.next_inbound() {
            invoke_channel_unregistered(&next);
        }
    }

    /// Forward a user event to the next inbound handler.
    pub fn fire_user_event(&self, event: Message) {
        if let Some(next) = self.next_inbound() {
            invoke_user_event(&next, event);
        }
    }

    /// Forward an exception to the next inbound handler.
    pub fn fire_exception_caught(&self, cause: SharedError) {
        if let Some(next) = self.next_inbound() {
            invoke_exception_caught(&next, cause);
        }
    }

    /// Forward a writability change to the next inbound handler.
    pub fn fire_writability_changed(&self, writable: bool) {
        if let Some(next) = self.next_inbound() {
            invoke_writability_changed(&next, writable);
        }
    }

    // ---- outbound operations ----

    fn op_promise(&self) -> Promise<()> {
        match self.pipe.borrow().upgrade() {
            Some(p) => Promise::with_executor(p.event_loop.clone()),
            None => Promise::new(),
        }
    }

    /// Bind through the handlers upstream of this one.
    pub fn bind(&self, addr: SocketAddr) -> Promise<()> {
        let promise = self.op_promise();
        self.bind_with(addr, promise.clone());
        promise
    }

    /// `bind` completing the supplied promise.
    pub fn bind_with(&self, addr: SocketAddr, promise: Promise<()>) {
        match self.prev_outbound() {
            Some(prev) => invoke_bind(&prev, addr, promise),
            None => {
                promise.try_failure(Error::ClosedChannel);
            }
        }
    }

    /// Connect through the handlers upstream of this one.
    pub fn connect(&self, addr: SocketAddr) -> Promise<()> {
        let promise = self.op_promise();
        self.connect_with(addr, promise.clone());
        promise
    }

    /// `connect` completing the supplied promise.
    pub fn connect_with(&self, addr: SocketAddr, promise: Promise<()>) {
        match self.prev_outbound() {
            Some(prev) => invoke_connect(&prev, addr, promise),
            None => {
                promise.try_failure(Error::ClosedChannel);
            }
        }
    }

    /// Disconnect through the handlers upstream of this one.
    pub fn disconnect(&self) -> Promise<()> {
        let promise = self.op_promise();
        self.disconnect_with(promise.clone());
        promise
    }

    /// `disconnect` completing the supplied promise.
    pub fn disconnect_with(&self, promise: Promise<()>) {
        match self.prev_outbound() {
            Some(prev) => invoke_disconnect(&prev, promise),
            None => {
                promise.try_failure(Error::ClosedChannel);
            }
        }
    }

    /// Close through the handlers upstream of this one.
    pub fn close(&self) -> Promise<()> {
        let promise = self.op_promise();
        self.close_with(promise.clone());
        promise
    }

    /// `close` completing the supplied promise.
    pub fn close_with(&self, promise: Promise<()>) {
        match self.prev_outbound() {
            Some(prev) => invoke_close(&prev, promise),
            None => {
                promise.try_failure(Error::ClosedChannel);
            }
        }
    }

    /// Queue a write through the handlers upstream of this one.
    pub fn write(&self, msg: Message) -> Promise<()> {
        let promise = self.op_promise();
        self.write_with(msg, promise.clone());
        promise
    }

    /// `write` completing the supplied promise.
    pub fn write_with(&self, msg: Message, promise: Promise<()>) {
        match self.prev_outbound() {
            Some(prev) => invoke_write(&prev, msg, promise),
            None => {
                release_message(msg);
                promise.try_failure(Error::ClosedChannel);
            }
        }
    }

    /// Flush through the handlers upstream of this one.
    pub fn flush_op(&self) {
        if let Some(prev) = self.prev_outbound() {
            invoke_flush(&prev);
        }
    }

    /// Request a read through the handlers upstream of this one.
    pub fn read_op(&self) {
        if let Some(prev) = self.prev_outbound() {
            invoke_read(&prev);
        }
    }

    /// `write` followed by `flush`.
    pub fn write_and_flush(&self, msg: Message) -> Promise<()> {
        let promise = self.write(msg);
        self.flush_op();
        promise
    }
}

/// Release a message that will never be delivered.
pub(crate) fn release_message(msg: Message) {
    if let Ok(buf) = downcast_buf(msg) {
        if buf.is_accessible() {
            let _ = buf.release();
        }
    }
}

// ---- invocation helpers ----
//
// Each invoke borrows the target handler for the duration of the callback.
// A context that is mid-callback cannot be re-entered; the event forwards
// past it instead. An `Err` from an inbound callback is delivered to the
// next handler's `exception_caught`.

macro_rules! invoke_inbound_plain {
    ($invoke:ident, $method:ident, $fire:ident) => {
        pub(crate) fn $invoke(ctx: &Rc<HandlerContext>) {
            let result = match ctx.handler.try_borrow_mut() {
                Ok(mut handler) => handler.$method(ctx),
                Err(_) => {
                    ctx.$fire();
                    Ok(())
                }
            };
            if let Err(e) = result {
                ctx.fire_exception_caught(Arc::new(e));
            }
        }
    };
}

invoke_inbound_plain!(
    invoke_channel_registered,
    channel_registered,
    fire_channel_registered
);
invoke_inbound_plain!(invoke_channel_active, channel_active, fire_channel_active);
invoke_inbound_plain!(
    invoke_channel_read_complete,
    channel_read_complete,
    fire_channel_read_complete
);
invoke_inbound_plain!(
    invoke_channel_inactive,
    channel_inactive,
    fire_channel_inactive
);
invoke_inbound_plain!(
    invoke_channel_unregistered,
    channel_unregistered,
    fire_channel_unregistered
);

pub(crate) fn invoke_channel_read(ctx: &Rc<HandlerContext>, msg: Message) {
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.channel_read(ctx, msg),
        Err(_) => {
            ctx.fire_channel_read(msg);
            Ok(())
        }
    };
    if let Err(e) = result {
        ctx.fire_exception_caught(Arc::new(e));
    }
}

pub(crate) fn invoke_user_event(ctx: &Rc<HandlerContext>, event: Message) {
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.user_event_triggered(ctx, event),
        Err(_) => {
            ctx.fire_user_event(event);
            Ok(())
        }
    };
    if let Err(e) = result {
        ctx.fire_exception_caught(Arc::new(e));
    }
}

pub(crate) fn invoke_writability_changed(ctx: &Rc<HandlerContext>, writable: bool) {
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.channel_writability_changed(ctx, writable),
        Err(_) => {
            ctx.fire_writability_changed(writable);
            Ok(())
        }
    };
    if let Err(e) = result {
        ctx.fire_exception_caught(Arc::new(e));
    }
}

pub(crate) fn invoke_exception_caught(ctx: &Rc<HandlerContext>, cause: SharedError) {
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.exception_caught(ctx, cause),
        Err(_) => {
            ctx.fire_exception_caught(cause);
            Ok(())
        }
    };
    if let Err(e) = result {
        // An exception handler that itself fails would loop; log and stop.
        warn!(handler = %ctx.name, error = %e, "exception_caught failed");
    }
}

// Outbound invocations fail the operation's promise on `Err`. The promise is
// cloned before the call: clones share the same completion state.

pub(crate) fn invoke_bind(ctx: &Rc<HandlerContext>, addr: SocketAddr, promise: Promise<()>) {
    let guard = promise.clone();
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.bind(ctx, addr, promise),
        Err(_) => {
            ctx.bind_with(addr, promise);
            Ok(())
        }
    };
    if let Err(e) = result {
        guard.try_failure(e);
    }
}

pub(crate) fn invoke_connect(ctx: &Rc<HandlerContext>, addr: SocketAddr, promise: Promise<()>) {
    let guard = promise.clone();
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.connect(ctx, addr, promise),
        Err(_) => {
            ctx.connect_with(addr, promise);
            Ok(())
        }
    };
    if let Err(e) = result {
        guard.try_failure(e);
    }
}

pub(crate) fn invoke_disconnect(ctx: &Rc<HandlerContext>, promise: Promise<()>) {
    let guard = promise.clone();
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.disconnect(ctx, promise),
        Err(_) => {
            ctx.disconnect_with(promise);
            Ok(())
        }
    };
    if let Err(e) = result {
        guard.try_failure(e);
    }
}

pub(crate) fn invoke_close(ctx: &Rc<HandlerContext>, promise: Promise<()>) {
    let guard = promise.clone();
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.close(ctx, promise),
        Err(_) => {
            ctx.close_with(promise);
            Ok(())
        }
    };
    if let Err(e) = result {
        guard.try_failure(e);
    }
}

pub(crate) fn invoke_write(ctx: &Rc<HandlerContext>, msg: Message, promise: Promise<()>) {
    let guard = promise.clone();
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.write(ctx, msg, promise),
        Err(_) => {
            ctx.write_with(msg, promise);
            Ok(())
        }
    };
    if let Err(e) = result {
        guard.try_failure(e);
    }
}

pub(crate) fn invoke_flush(ctx: &Rc<HandlerContext>) {
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.flush(ctx),
        Err(_) => {
            ctx.flush_op();
            Ok(())
        }
    };
    if let Err(e) = result {
        ctx.fire_exception_caught(Arc::new(e));
    }
}

pub(crate) fn invoke_read(ctx: &Rc<HandlerContext>) {
    let result = match ctx.handler.try_borrow_mut() {
        Ok(mut handler) => handler.read(ctx),
        Err(_) => {
            ctx.read_op();
            Ok(())
        }
    };
    if let Err(e) = result {
        ctx.fire_exception_caught(Arc::new(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline() -> Pipeline {
        Pipeline::new(Weak::new(), EventLoop::detached("pipeline-test"))
    }

    type Log = Rc<RefCell<Vec<String>>>;

    /// Records lifecycle and events; optionally forwards only even reads.
    struct Recorder {
        label: &'static str,
        log: Log,
        forward_even_only: bool,
    }

    impl Recorder {
        fn new(label: &'static str, log: &Log) -> Recorder {
            Recorder {
                label,
                log: Rc::clone(log),
                forward_even_only: false,
            }
        }

        fn push(&self, what: impl std::fmt::Display) {
            self.log.borrow_mut().push(format!("{}:{}", self.label, what));
        }
    }

    impl Handler for Recorder {
        fn caps(&self) -> Caps {
            Caps::INBOUND
        }

        fn handler_added(&mut self, _ctx: &HandlerContext) -> Result<()> {
            self.push("added");
            Ok(())
        }

        fn handler_removed(&mut self, _ctx: &HandlerContext) -> Result<()> {
            self.push("removed");
            Ok(())
        }

        fn channel_active(&mut self, ctx: &HandlerContext) -> Result<()> {
            self.push("active");
            ctx.fire_channel_active();
            Ok(())
        }

        fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) -> Result<()> {
            let n = *msg.downcast::<u32>().expect("test messages are u32");
            self.push(format!("read {n}"));
            if !self.forward_even_only || n % 2 == 0 {
                ctx.fire_channel_read(Box::new(n));
            }
            Ok(())
        }

        fn exception_caught(&mut self, ctx: &HandlerContext, cause: SharedError) -> Result<()> {
            self.push(format!("caught {cause}"));
            ctx.fire_exception_caught(cause);
            Ok(())
        }
    }

    impl Recorder {
        fn log_of(log: &Log) -> Vec<String> {
            log.borrow().clone()
        }
    }

    #[test]
    fn test_handler_added_runs_before_events() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        pipe.add_last("a", Box::new(Recorder::new("a", &log))).unwrap();
        pipe.fire_channel_active();
        assert_eq!(Recorder::log_of(&log), vec!["a:added", "a:active"]);
    }

    #[test]
    fn test_names_reflect_insertion_points() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        pipe.add_last("b", Box::new(Recorder::new("b", &log))).unwrap();
        pipe.add_first("a", Box::new(Recorder::new("a", &log))).unwrap();
        pipe.add_after("b", "d", Box::new(Recorder::new("d", &log))).unwrap();
        pipe.add_before("d", "c", Box::new(Recorder::new("c", &log))).unwrap();
        assert_eq!(pipe.names(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        pipe.add_last("a", Box::new(Recorder::new("a", &log))).unwrap();
        assert!(pipe.add_last("a", Box::new(Recorder::new("a", &log))).is_err());
        assert!(pipe.add_last("head", Box::new(Recorder::new("h", &log))).is_err());
    }

    #[test]
    fn test_downstream_sees_subsequence_upstream_forwarded() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut filter = Recorder::new("h1", &log);
        filter.forward_even_only = true;
        pipe.add_last("h1", Box::new(filter)).unwrap();
        pipe.add_last("h2", Box::new(Recorder::new("h2", &log))).unwrap();
        for n in 0..6u32 {
            pipe.fire_channel_read(Box::new(n));
        }
        let h2_reads: Vec<String> = Recorder::log_of(&log)
            .into_iter()
            .filter(|e| e.starts_with("h2:read"))
            .collect();
        // Inbound order at h2 equals exactly what h1 forwarded.
        assert_eq!(h2_reads, vec!["h2:read 0", "h2:read 2", "h2:read 4"]);
    }

    #[test]
    fn test_remove_takes_effect_and_notifies() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        pipe.add_last("a", Box::new(Recorder::new("a", &log))).unwrap();
        pipe.add_last("b", Box::new(Recorder::new("b", &log))).unwrap();
        pipe.remove("a").unwrap();
        assert!(!pipe.contains("a"));
        pipe.fire_channel_read(Box::new(1u32));
        let log = Recorder::log_of(&log);
        assert!(log.contains(&"a:removed".to_string()));
        assert!(!log.contains(&"a:read 1".to_string()));
        assert!(log.contains(&"b:read 1".to_string()));
    }

    #[test]
    fn test_replace_keeps_position() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        pipe.add_last("a", Box::new(Recorder::new("a", &log))).unwrap();
        pipe.add_last("b", Box::new(Recorder::new("b", &log))).unwrap();
        pipe.replace("a", "a2", Box::new(Recorder::new("a2", &log))).unwrap();
        assert_eq!(pipe.names(), vec!["a2", "b"]);
        pipe.fire_channel_read(Box::new(7u32));
        let log = Recorder::log_of(&log);
        assert!(log.contains(&"a:removed".to_string()));
        let a2 = log.iter().position(|e| e == "a2:read 7").unwrap();
        let b = log.iter().position(|e| e == "b:read 7").unwrap();
        assert!(a2 < b);
    }

    /// Removes itself while handling its first read.
    struct SelfRemover {
        seen: Rc<AtomicUsize>,
    }

    impl Handler for SelfRemover {
        fn caps(&self) -> Caps {
            Caps::INBOUND
        }

        fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            let pipeline = ctx.pipeline().unwrap();
            pipeline.remove(ctx.name())?;
            ctx.fire_channel_read(msg);
            Ok(())
        }
    }

    #[test]
    fn test_remove_during_dispatch_continues_at_successor() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::new(AtomicUsize::new(0));
        pipe.add_last(
            "once",
            Box::new(SelfRemover {
                seen: Rc::clone(&seen),
            }),
        )
        .unwrap();
        pipe.add_last("after", Box::new(Recorder::new("after", &log))).unwrap();

        pipe.fire_channel_read(Box::new(1u32));
        // The in-flight event still reached the successor.
        assert_eq!(Recorder::log_of(&log), vec!["after:added", "after:read 1"]);
        assert!(!pipe.contains("once"));

        pipe.fire_channel_read(Box::new(2u32));
        assert_eq!(seen.load(Ordering::SeqCst), 1, "removed handler sees no more events");
        assert!(Recorder::log_of(&log).contains(&"after:read 2".to_string()));
    }

    /// Fails every read.
    struct Failing;

    impl Handler for Failing {
        fn caps(&self) -> Caps {
            Caps::INBOUND
        }

        fn channel_read(&mut self, _ctx: &HandlerContext, msg: Message) -> Result<()> {
            release_message(msg);
            Err(Error::Decoder("bad frame".into()))
        }
    }

    #[test]
    fn test_inbound_error_reaches_next_exception_caught() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        pipe.add_last("bad", Box::new(Failing)).unwrap();
        pipe.add_last("obs", Box::new(Recorder::new("obs", &log))).unwrap();
        pipe.fire_channel_read(Box::new(3u32));
        let log = Recorder::log_of(&log);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], "obs:added");
        assert!(log[1].starts_with("obs:caught"));
        assert!(log[1].contains("decoder failure"));
    }

    #[test]
    fn test_initializer_populates_then_removes_itself() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let log2 = Rc::clone(&log);
        pipe.add_last(
            "init",
            Box::new(ChannelInitializer::new(move |p: &Pipeline| {
                p.add_last("installed", Box::new(Recorder::new("installed", &log2)))
            })),
        )
        .unwrap();
        pipe.fire_channel_registered();
        assert!(!pipe.contains("init"));
        assert!(pipe.contains("installed"));
    }

    /// Records outbound writes passing through.
    struct OutboundTap {
        label: &'static str,
        log: Log,
    }

    impl Handler for OutboundTap {
        fn caps(&self) -> Caps {
            Caps::OUTBOUND
        }

        fn write(&mut self, ctx: &HandlerContext, msg: Message, promise: Promise<()>) -> Result<()> {
            self.log.borrow_mut().push(format!("{}:write", self.label));
            ctx.write_with(msg, promise);
            Ok(())
        }
    }

    #[test]
    fn test_outbound_walks_tail_to_head() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        pipe.add_last(
            "o1",
            Box::new(OutboundTap {
                label: "o1",
                log: Rc::clone(&log),
            }),
        )
        .unwrap();
        pipe.add_last(
            "o2",
            Box::new(OutboundTap {
                label: "o2",
                log: Rc::clone(&log),
            }),
        )
        .unwrap();
        let promise = pipe.write(Box::new(1u32));
        // Closest-to-tail intercepts first; with no channel the head fails
        // the promise.
        assert_eq!(Recorder::log_of(&log), vec!["o2:write", "o1:write"]);
        assert!(matches!(
            promise.cause().as_deref(),
            Some(Error::ClosedChannel)
        ));
    }

    #[test]
    fn test_inbound_walk_skips_outbound_only_handlers() {
        let pipe = pipeline();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        pipe.add_last(
            "out",
            Box::new(OutboundTap {
                label: "out",
                log: Rc::clone(&log),
            }),
        )
        .unwrap();
        pipe.add_last("in", Box::new(Recorder::new("in", &log))).unwrap();
        pipe.fire_channel_read(Box::new(9u32));
        let log = Recorder::log_of(&log);
        assert!(log.contains(&"in:read 9".to_string()));
        assert!(!log.iter().any(|e| e.starts_with("out:")));
    }
}
