//! Handler trait and the built-in head, tail, and initializer handlers.

use crate::error::{Error, Result, SharedError};
use crate::pipeline::{downcast_buf, Caps, HandlerContext, Message, Pipeline};
use crate::promise::Promise;
use std::net::SocketAddr;
use tracing::{debug, error, warn};

/// User code attached to a pipeline.
///
/// Every callback has a forwarding default, so a handler overrides only what
/// it cares about. Inbound callbacks return `Result`; an `Err` is delivered
/// to the next handler's `exception_caught`. Outbound callbacks that return
/// `Err` fail the operation's promise.
///
/// Narrow `caps` to the direction actually overridden so walks skip the
/// handler for the other direction.
#[allow(unused_variables)]
pub trait Handler: 'static {
    /// Which event directions this handler participates in.
    fn caps(&self) -> Caps {
        Caps::all()
    }

    /// Runs before any event reaches the handler.
    fn handler_added(&mut self, ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    /// Runs after the last event the handler can observe.
    fn handler_removed(&mut self, ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    /// The channel was registered with its event loop.
    fn channel_registered(&mut self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    /// The channel became active (bound or connected).
    fn channel_active(&mut self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    /// A message arrived. Ownership of `msg` transfers to this handler:
    /// retain, release, or forward it.
    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) -> Result<()> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    /// The current read turn finished.
    fn channel_read_complete(&mut self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    /// The channel went inactive. Fires at most once.
    fn channel_inactive(&mut self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    /// The channel was deregistered from its event loop.
    fn channel_unregistered(&mut self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    /// An application-defined event.
    fn user_event_triggered(&mut self, ctx: &HandlerContext, event: Message) -> Result<()> {
        ctx.fire_user_event(event);
        Ok(())
    }

    /// An error from a downstream callback or the transport.
    fn exception_caught(&mut self, ctx: &HandlerContext, cause: SharedError) -> Result<()> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }

    /// The outbound buffer crossed a writability watermark.
    fn channel_writability_changed(&mut self, ctx: &HandlerContext, writable: bool) -> Result<()> {
        ctx.fire_writability_changed(writable);
        Ok(())
    }

    /// Outbound bind.
    fn bind(&mut self, ctx: &HandlerContext, addr: SocketAddr, promise: Promise<()>) -> Result<()> {
        ctx.bind_with(addr, promise);
        Ok(())
    }

    /// Outbound connect.
    fn connect(
        &mut self,
        ctx: &HandlerContext,
        addr: SocketAddr,
        promise: Promise<()>,
    ) -> Result<()> {
        ctx.connect_with(addr, promise);
        Ok(())
    }

    /// Outbound disconnect.
    fn disconnect(&mut self, ctx: &HandlerContext, promise: Promise<()>) -> Result<()> {
        ctx.disconnect_with(promise);
        Ok(())
    }

    /// Outbound close.
    fn close(&mut self, ctx: &HandlerContext, promise: Promise<()>) -> Result<()> {
        ctx.close_with(promise);
        Ok(())
    }

    /// Outbound write. Ownership of `msg` transfers down the pipeline.
    fn write(&mut self, ctx: &HandlerContext, msg: Message, promise: Promise<()>) -> Result<()> {
        ctx.write_with(msg, promise);
        Ok(())
    }

    /// Outbound flush.
    fn flush(&mut self, ctx: &HandlerContext) -> Result<()> {
        ctx.flush_op();
        Ok(())
    }

    /// Outbound read request.
    fn read(&mut self, ctx: &HandlerContext) -> Result<()> {
        ctx.read_op();
        Ok(())
    }
}

/// Terminal outbound handler: performs the actual channel operations.
pub(crate) struct HeadHandler;

impl Handler for HeadHandler {
    fn bind(&mut self, ctx: &HandlerContext, addr: SocketAddr, promise: Promise<()>) -> Result<()> {
        match ctx.channel_core() {
            Some(core) => match core.unsafe_bind(addr) {
                Ok(()) => {
                    promise.try_success(());
                }
                Err(e) => {
                    promise.try_failure(e);
                }
            },
            None => {
                promise.try_failure(Error::ClosedChannel);
            }
        }
        Ok(())
    }

    fn connect(
        &mut self,
        ctx: &HandlerContext,
        addr: SocketAddr,
        promise: Promise<()>,
    ) -> Result<()> {
        match ctx.channel_core() {
            Some(core) => core.unsafe_connect(addr, promise),
            None => {
                promise.try_failure(Error::ClosedChannel);
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, ctx: &HandlerContext, promise: Promise<()>) -> Result<()> {
        match ctx.channel_core() {
            Some(core) => core.unsafe_disconnect(promise),
            None => {
                promise.try_failure(Error::ClosedChannel);
            }
        }
        Ok(())
    }

    fn close(&mut self, ctx: &HandlerContext, promise: Promise<()>) -> Result<()> {
        match ctx.channel_core() {
            Some(core) => core.unsafe_close(promise),
            None => {
                promise.try_failure(Error::ClosedChannel);
            }
        }
        Ok(())
    }

    fn write(&mut self, ctx: &HandlerContext, msg: Message, promise: Promise<()>) -> Result<()> {
        match ctx.channel_core() {
            Some(core) => core.unsafe_write(msg, promise),
            None => {
                super::release_message(msg);
                promise.try_failure(Error::ClosedChannel);
            }
        }
        Ok(())
    }

    fn flush(&mut self, ctx: &HandlerContext) -> Result<()> {
        if let Some(core) = ctx.channel_core() {
            core.unsafe_flush();
        }
        Ok(())
    }

    fn read(&mut self, ctx: &HandlerContext) -> Result<()> {
        if let Some(core) = ctx.channel_core() {
            core.unsafe_begin_read();
        }
        Ok(())
    }
}

/// Terminal inbound handler: disposes of whatever reached the end of the
/// pipeline unhandled.
pub(crate) struct TailHandler;

impl Handler for TailHandler {
    fn caps(&self) -> Caps {
        Caps::INBOUND
    }

    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) -> Result<()> {
        debug!(
            channel = ctx.channel_core().map(|c| c.serial()).unwrap_or(0),
            "message reached the tail unhandled; discarding"
        );
        match downcast_buf(msg) {
            Ok(buf) => {
                if buf.is_accessible() {
                    let _ = buf.release();
                }
            }
            Err(_other) => {}
        }
        Ok(())
    }

    fn exception_caught(&mut self, ctx: &HandlerContext, cause: SharedError) -> Result<()> {
        // Unhandled pipeline exception: log and close the channel.
        error!(%cause, "unhandled exception reached the end of the pipeline; closing channel");
        if let Some(core) = ctx.channel_core() {
            core.unsafe_close(Promise::new());
        }
        Ok(())
    }

    fn user_event_triggered(&mut self, _ctx: &HandlerContext, _event: Message) -> Result<()> {
        Ok(())
    }
}

/// One-shot handler that populates a fresh channel's pipeline, then removes
/// itself.
pub struct ChannelInitializer {
    init: Option<Box<dyn FnOnce(&Pipeline) -> Result<()> + Send>>,
}

impl ChannelInitializer {
    /// Wrap the initialization closure.
    pub fn new(init: impl FnOnce(&Pipeline) -> Result<()> + Send + 'static) -> ChannelInitializer {
        ChannelInitializer {
            init: Some(Box::new(init)),
        }
    }
}

impl Handler for ChannelInitializer {
    fn caps(&self) -> Caps {
        Caps::INBOUND
    }

    fn channel_registered(&mut self, ctx: &HandlerContext) -> Result<()> {
        let pipeline = ctx
            .pipeline()
            .ok_or_else(|| Error::IllegalState("pipeline is gone".into()))?;
        if let Some(init) = self.init.take() {
            let name = ctx.name().to_string();
            let result = init(&pipeline);
            // Unlink before forwarding so later events skip the initializer.
            if let Err(e) = pipeline.remove(&name) {
                warn!(error = %e, "failed to remove channel initializer");
            }
            result?;
        }
        ctx.fire_channel_registered();
        Ok(())
    }
}
