//! Channels: one transport endpoint, its lifecycle, and its unsafe layer.
//!
//! A channel moves `Open -> Bound -> Connected -> Closed`; any fatal I/O
//! error, explicit close, or peer close reaches the terminal `Closed`. The
//! public [`Channel`] handle is cloneable and Send: operations called off
//! the channel's event loop hop onto it as tasks. The loop-local
//! [`ChannelCore`] owns the socket, config, pipeline, outbound buffer, and
//! receive sizing, and exposes the unsafe layer (`register`, `begin_read`,
//! `do_read`, `do_write`, `do_close`, `force_flush`) that only the event
//! loop invokes.

pub(crate) mod config;
mod outbound;
mod recv;
pub(crate) mod socket;

pub use config::{ChannelOption, RecvAllocatorSpec};
pub(crate) use config::ChannelConfig;

use crate::buffer::{Allocator, ByteBuf};
use crate::error::{Error, Result, SharedError};
use crate::executor::{current_loop_ctx, EventLoop, LoopRef, ScheduledHandle};
use crate::io::{Interest, IoBackend, IoPayload, Ready};
use crate::pipeline::{downcast_buf, release_message, Message, Pipeline};
use crate::promise::Promise;
use outbound::{OutboundBuffer, Retired};
use recv::AdaptiveRecv;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::IoSlice;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
use crate::io::uring::sendfile::SendFile;
#[cfg(target_os = "linux")]
use crate::io::OpKind;

/// Listener backlog, matching the kernel-side default used at bind time.
const LISTEN_BACKLOG: i32 = 1024;

/// Flushed entries gathered into one vectored write.
const MAX_IOVECS: usize = 64;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Lifecycle states of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Created, not yet bound or connected.
    Open = 0,
    /// Bound to a local address.
    Bound = 1,
    /// Connected to a peer.
    Connected = 2,
    /// Terminal.
    Closed = 3,
}

impl ChannelState {
    fn from_u8(v: u8) -> ChannelState {
        match v {
            0 => ChannelState::Open,
            1 => ChannelState::Bound,
            2 => ChannelState::Connected,
            _ => ChannelState::Closed,
        }
    }
}

/// What the channel endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    /// Connected byte stream.
    Stream,
    /// Accepting listener.
    Listener,
}

/// User event fired when the peer shut down its write side and
/// `ALLOW_HALF_CLOSURE` keeps the channel open.
#[derive(Debug)]
pub struct InputShutdownEvent;

/// Message a listener channel fires for each accepted connection. The
/// server bootstrap's acceptor handler consumes these.
pub(crate) struct AcceptedSocket {
    pub(crate) socket: socket2::Socket,
    pub(crate) peer: SocketAddr,
}

/// Cross-thread visible state behind a channel handle.
pub(crate) struct ChannelShared {
    event_loop: EventLoop,
    id: AtomicUsize,
    serial: u64,
    state: AtomicU8,
    active: AtomicBool,
    close_promise: Promise<()>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    attrs: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

/// Handle to a channel. Cloneable and Send; every operation returns a
/// promise and hops to the channel's event loop when called off-loop.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// The event loop this channel is pinned to.
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the channel has not reached `Closed`.
    pub fn is_open(&self) -> bool {
        self.state() != ChannelState::Closed
    }

    /// Whether the channel is bound/connected and usable.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Promise that completes when the channel finishes closing.
    pub fn close_future(&self) -> Promise<()> {
        self.shared.close_promise.clone()
    }

    /// Local address, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    /// Peer address, once connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.shared.peer_addr.lock().unwrap()
    }

    /// Store an attribute on the channel.
    pub fn set_attr(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.shared.attrs.lock().unwrap().insert(key.into(), value);
    }

    /// Fetch an attribute from the channel.
    pub fn attr(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.attrs.lock().unwrap().get(key).cloned()
    }

    fn op_promise(&self) -> Promise<()> {
        Promise::with_executor(self.shared.event_loop.clone())
    }

    /// Run `f` on the channel's loop with the core, or with `None` when the
    /// channel is already gone.
    fn invoke(&self, f: impl FnOnce(Option<&Rc<ChannelCore>>) + Send + 'static) {
        let shared = Arc::clone(&self.shared);
        let task = move || {
            let core = current_loop_ctx().and_then(|ctx| {
                let ctx = ctx.borrow();
                ctx.channel(shared.id.load(Ordering::Acquire), shared.serial)
            });
            f(core.as_ref());
        };
        if self.shared.event_loop.in_event_loop() {
            task();
        } else if let Err(rejected) = self.shared.event_loop.try_execute(Box::new(task)) {
            // Loop is shutting down: the task sees no core and fails the op.
            rejected();
        }
    }

    /// Queue a message for writing.
    pub fn write(&self, msg: Message) -> Promise<()> {
        let promise = self.op_promise();
        let p = promise.clone();
        self.invoke(move |core| match core {
            Some(core) => core.pipeline.write_with(msg, p),
            None => {
                release_message(msg);
                p.try_failure(Error::ClosedChannel);
            }
        });
        promise
    }

    /// Queue a buffer for writing.
    pub fn write_buf(&self, buf: ByteBuf) -> Promise<()> {
        self.write(Box::new(buf))
    }

    /// Flush queued writes toward the kernel.
    pub fn flush(&self) {
        self.invoke(|core| {
            if let Some(core) = core {
                core.pipeline.flush();
            }
        });
    }

    /// `write` followed by `flush`.
    pub fn write_and_flush(&self, msg: Message) -> Promise<()> {
        let promise = self.op_promise();
        let p = promise.clone();
        self.invoke(move |core| match core {
            Some(core) => {
                core.pipeline.write_with(msg, p);
                core.pipeline.flush();
            }
            None => {
                release_message(msg);
                p.try_failure(Error::ClosedChannel);
            }
        });
        promise
    }

    /// Request one read from the transport (used with `AUTO_READ=false`).
    pub fn read(&self) {
        self.invoke(|core| {
            if let Some(core) = core {
                core.pipeline.read();
            }
        });
    }

    /// Bind to a local address.
    pub fn bind(&self, addr: SocketAddr) -> Promise<()> {
        let promise = self.op_promise();
        let p = promise.clone();
        self.invoke(move |core| match core {
            Some(core) => core.pipeline.bind_with_promise(addr, p),
            None => {
                p.try_failure(Error::ClosedChannel);
            }
        });
        promise
    }

    /// Connect to a remote address.
    pub fn connect(&self, addr: SocketAddr) -> Promise<()> {
        let promise = self.op_promise();
        let p = promise.clone();
        self.invoke(move |core| match core {
            Some(core) => core.pipeline.connect_with_promise(addr, p),
            None => {
                p.try_failure(Error::ClosedChannel);
            }
        });
        promise
    }

    /// Shut the connection down.
    pub fn disconnect(&self) -> Promise<()> {
        let promise = self.op_promise();
        let p = promise.clone();
        self.invoke(move |core| match core {
            Some(core) => core.pipeline.disconnect_with_promise(p),
            None => {
                p.try_failure(Error::ClosedChannel);
            }
        });
        promise
    }

    /// Close the channel. Closing an already-closed channel completes with
    /// the previously completed close future.
    pub fn close(&self) -> Promise<()> {
        let promise = self.op_promise();
        let p = promise.clone();
        let close_future = self.close_future();
        self.invoke(move |core| match core {
            Some(core) => core.pipeline.close_with_promise(p),
            // Already torn down: the close future has the terminal outcome.
            None => {
                close_future.add_listener(move |_| {
                    p.try_success(());
                });
            }
        });
        promise
    }

    /// Add a handler at the end of the pipeline.
    pub fn pipeline_add_last(
        &self,
        name: impl Into<String>,
        handler: impl crate::pipeline::Handler + Send,
    ) -> Promise<()> {
        let promise = self.op_promise();
        let p = promise.clone();
        let name = name.into();
        self.invoke(move |core| match core {
            Some(core) => match core.pipeline.add_last(&name, Box::new(handler)) {
                Ok(()) => {
                    p.try_success(());
                }
                Err(e) => {
                    p.try_failure(e);
                }
            },
            None => {
                p.try_failure(Error::ClosedChannel);
            }
        });
        promise
    }

    /// Remove a handler from the pipeline.
    pub fn pipeline_remove(&self, name: impl Into<String>) -> Promise<()> {
        let promise = self.op_promise();
        let p = promise.clone();
        let name = name.into();
        self.invoke(move |core| match core {
            Some(core) => match core.pipeline.remove(&name) {
                Ok(()) => {
                    p.try_success(());
                }
                Err(e) => {
                    p.try_failure(e);
                }
            },
            None => {
                p.try_failure(Error::ClosedChannel);
            }
        });
        promise
    }

    /// Send a file region to the peer without user-space copies (io_uring
    /// backends only). Completes with the transferred byte count.
    #[cfg(target_os = "linux")]
    pub fn send_file(&self, file: std::fs::File, offset: u64, len: u64) -> Promise<u64> {
        let promise: Promise<u64> = Promise::with_executor(self.shared.event_loop.clone());
        let p = promise.clone();
        self.invoke(move |core| match core {
            Some(core) => core.start_sendfile(file, offset, len, p),
            None => {
                p.try_failure(Error::ClosedChannel);
            }
        });
        promise
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("serial", &self.shared.serial)
            .field("state", &self.state())
            .field("local", &self.local_addr())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

struct PendingConnect {
    promise: Promise<()>,
    timeout: Option<ScheduledHandle>,
}

#[cfg(target_os = "linux")]
#[derive(Default)]
struct UringState {
    write_inflight: bool,
    /// Retained views pinning submitted write buffers until completion.
    inflight_bufs: Vec<ByteBuf>,
    closing: bool,
    close_submitted: bool,
}

/// Loop-local state of one channel.
pub(crate) struct ChannelCore {
    shared: Arc<ChannelShared>,
    kind: ChannelKind,
    socket: RefCell<Option<socket2::Socket>>,
    cfg: RefCell<ChannelConfig>,
    pipeline: Pipeline,
    outbound: RefCell<OutboundBuffer>,
    recv: RefCell<AdaptiveRecv>,
    loop_ref: LoopRef,
    alloc: Allocator,
    interest: Cell<Interest>,
    registered: Cell<bool>,
    active_fired: Cell<bool>,
    inactive_fired: Cell<bool>,
    read_pending: Cell<bool>,
    input_shutdown: Cell<bool>,
    draining_close: Cell<bool>,
    connect_pending: RefCell<Option<PendingConnect>>,
    #[cfg(target_os = "linux")]
    uring: RefCell<UringState>,
    #[cfg(target_os = "linux")]
    sendfile: RefCell<Option<SendFile>>,
}

/// Create a channel on the current loop, register it with the backend, and
/// fire `channel_registered`. For already-connected sockets (accepted
/// children) the channel also goes active.
pub(crate) fn create_channel(
    loop_ref: &LoopRef,
    alloc: Allocator,
    kind: ChannelKind,
    sock: socket2::Socket,
    cfg: ChannelConfig,
    initializer: Option<&(dyn Fn(&Pipeline) -> Result<()>)>,
    connected_peer: Option<SocketAddr>,
) -> Result<Rc<ChannelCore>> {
    let event_loop = loop_ref.borrow().handle();
    let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
    let state = if connected_peer.is_some() {
        ChannelState::Connected
    } else {
        ChannelState::Open
    };
    let shared = Arc::new(ChannelShared {
        event_loop: event_loop.clone(),
        id: AtomicUsize::new(usize::MAX),
        serial,
        state: AtomicU8::new(state as u8),
        active: AtomicBool::new(false),
        close_promise: Promise::with_executor(event_loop.clone()),
        local_addr: Mutex::new(sock.local_addr().ok().and_then(|a| a.as_socket())),
        peer_addr: Mutex::new(connected_peer),
        attrs: Mutex::new(HashMap::new()),
    });
    let recv_spec = cfg.recv_spec;
    let (high, low) = (cfg.high_water_mark, cfg.low_water_mark);
    let core = Rc::new_cyclic(|weak| ChannelCore {
        shared,
        kind,
        socket: RefCell::new(Some(sock)),
        cfg: RefCell::new(cfg),
        pipeline: Pipeline::new(weak.clone(), event_loop),
        outbound: RefCell::new(OutboundBuffer::new(high, low)),
        recv: RefCell::new(AdaptiveRecv::new(recv_spec)),
        loop_ref: Rc::clone(loop_ref),
        alloc,
        interest: Cell::new(Interest::empty()),
        registered: Cell::new(false),
        active_fired: Cell::new(false),
        inactive_fired: Cell::new(false),
        read_pending: Cell::new(false),
        input_shutdown: Cell::new(false),
        draining_close: Cell::new(false),
        connect_pending: RefCell::new(None),
        #[cfg(target_os = "linux")]
        uring: RefCell::new(UringState::default()),
        #[cfg(target_os = "linux")]
        sendfile: RefCell::new(None),
    });

    // Register: slab slot first, then kernel-side with no interest yet.
    let id = {
        let mut ctx = loop_ref.borrow_mut();
        let id = ctx.insert_channel(Rc::clone(&core));
        let fd = core.fd().expect("fresh channel has a socket");
        if let Err(e) = ctx.backend.register(fd, id, Interest::empty()) {
            ctx.remove_channel(id);
            return Err(e);
        }
        id
    };
    core.shared.id.store(id, Ordering::Release);
    core.registered.set(true);

    if let Some(init) = initializer {
        if let Err(e) = init(&core.pipeline) {
            let fd = core.fd().expect("fresh channel has a socket");
            let mut ctx = loop_ref.borrow_mut();
            let _ = ctx.backend.deregister(fd, id);
            ctx.remove_channel(id);
            core.registered.set(false);
            core.set_state(ChannelState::Closed);
            return Err(e);
        }
    }
    core.pipeline.fire_channel_registered();

    if connected_peer.is_some() {
        core.mark_active();
    }
    Ok(core)
}

impl ChannelCore {
    /// The public handle for this channel.
    pub(crate) fn handle(&self) -> Channel {
        Channel {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stable identifier, unique per process.
    pub(crate) fn serial(&self) -> u64 {
        self.shared.serial
    }

    /// Registration id on the loop's backend.
    pub(crate) fn id(&self) -> usize {
        self.shared.id.load(Ordering::Acquire)
    }

    /// The channel's allocator.
    pub(crate) fn alloc(&self) -> &Allocator {
        &self.alloc
    }

    /// The channel's pipeline.
    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn fd(&self) -> Option<RawFd> {
        self.socket.borrow().as_ref().map(|s| s.as_raw_fd())
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    fn is_uring(&self) -> bool {
        self.loop_ref.borrow().backend.is_uring()
    }

    fn set_interest(&self, interest: Interest) {
        if interest == self.interest.get() {
            return;
        }
        self.interest.set(interest);
        if !self.registered.get() {
            return;
        }
        let fd = match self.fd() {
            Some(fd) => fd,
            None => return,
        };
        let id = self.id();
        if let Err(e) = self.loop_ref.borrow_mut().backend.modify(fd, id, interest) {
            warn!(channel = self.serial(), error = %e, "interest change failed");
        }
    }

    fn add_interest(&self, interest: Interest) {
        self.set_interest(self.interest.get().with(interest));
    }

    fn remove_interest(&self, interest: Interest) {
        self.set_interest(self.interest.get().without(interest));
    }

    fn mark_active(&self) {
        if self.active_fired.get() {
            return;
        }
        self.active_fired.set(true);
        self.shared.active.store(true, Ordering::Release);
        self.pipeline.fire_channel_active();
        if self.cfg.borrow().auto_read {
            self.unsafe_begin_read();
        }
    }

    fn fire_writability(&self, change: Option<bool>) {
        if let Some(writable) = change {
            if self.state() != ChannelState::Closed {
                self.pipeline.fire_writability_changed(writable);
            }
        }
    }

    /// Complete retired write promises with success, then report any
    /// watermark transition. Runs with no loop-local borrows held.
    fn apply_progress(&self, retired: Retired) {
        for promise in retired.promises {
            promise.try_success(());
        }
        self.fire_writability(retired.writability);
    }

    /// Fail retired write promises with the cause, then report any
    /// watermark transition.
    fn apply_write_failure(&self, retired: Retired, cause: &SharedError) {
        for promise in retired.promises {
            promise.try_failure_shared(SharedError::clone(cause));
        }
        self.fire_writability(retired.writability);
    }

    // ---- unsafe layer: invoked by the head handler and the event loop ----

    pub(crate) fn unsafe_bind(&self, addr: SocketAddr) -> Result<()> {
        match self.state() {
            ChannelState::Closed => return Err(Error::ClosedChannel),
            ChannelState::Open => {}
            _ => {
                return Err(Error::IllegalState("channel is already bound".into()));
            }
        }
        {
            let socket = self.socket.borrow();
            let socket = socket.as_ref().ok_or(Error::ClosedChannel)?;
            socket.bind(&addr.into())?;
            if self.kind == ChannelKind::Listener {
                socket.listen(LISTEN_BACKLOG)?;
            }
            *self.shared.local_addr.lock().unwrap() =
                socket.local_addr().ok().and_then(|a| a.as_socket());
        }
        self.set_state(ChannelState::Bound);
        if self.kind == ChannelKind::Listener {
            self.mark_active();
        }
        Ok(())
    }

    pub(crate) fn unsafe_connect(self: &Rc<Self>, addr: SocketAddr, promise: Promise<()>) {
        if self.kind != ChannelKind::Stream {
            promise.try_failure(Error::IllegalState("cannot connect a listener".into()));
            return;
        }
        match self.state() {
            ChannelState::Closed => {
                promise.try_failure(Error::ClosedChannel);
                return;
            }
            ChannelState::Connected => {
                promise.try_failure(Error::AlreadyConnected);
                return;
            }
            _ => {}
        }
        if self.connect_pending.borrow().is_some() {
            promise.try_failure(Error::ConnectionPending);
            return;
        }

        #[cfg(target_os = "linux")]
        if self.is_uring() {
            let fd = match self.fd() {
                Some(fd) => fd,
                None => {
                    promise.try_failure(Error::ClosedChannel);
                    return;
                }
            };
            let id = self.id();
            let submitted = self
                .loop_ref
                .borrow_mut()
                .backend
                .uring_mut()
                .expect("uring backend")
                .submit_connect(id, fd, &addr);
            match submitted {
                Ok(()) => self.arm_connect_pending(promise),
                Err(e) => {
                    promise.try_failure(e);
                }
            }
            return;
        }

        let result = {
            let socket = self.socket.borrow();
            match socket.as_ref() {
                Some(socket) => socket.connect(&addr.into()),
                None => {
                    promise.try_failure(Error::ClosedChannel);
                    return;
                }
            }
        };
        match result {
            Ok(()) => {
                self.arm_connect_pending(promise);
                self.finish_connect();
            }
            Err(ref e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                self.arm_connect_pending(promise);
                self.add_interest(Interest::WRITE);
            }
            Err(e) => {
                promise.try_failure(e.into());
                self.unsafe_close_forced(Arc::new(Error::ClosedChannel));
            }
        }
    }

    fn arm_connect_pending(self: &Rc<Self>, promise: Promise<()>) {
        let timeout = self.cfg.borrow().connect_timeout.map(|delay| {
            let channel = self.handle();
            self.shared.event_loop.schedule(delay, move || {
                let shared = Arc::clone(&channel.shared);
                if let Some(ctx) = current_loop_ctx() {
                    let core = {
                        let ctx = ctx.borrow();
                        ctx.channel(shared.id.load(Ordering::Acquire), shared.serial)
                    };
                    if let Some(core) = core {
                        core.connect_timed_out(delay);
                    }
                }
            })
        });
        *self.connect_pending.borrow_mut() = Some(PendingConnect { promise, timeout });
    }

    fn connect_timed_out(self: &Rc<Self>, delay: std::time::Duration) {
        let pending = self.connect_pending.borrow_mut().take();
        if let Some(pending) = pending {
            pending.promise.try_failure(Error::ConnectTimeout(delay));
            self.unsafe_close_forced(Arc::new(Error::ConnectTimeout(delay)));
        }
    }

    /// Resolve an outstanding non-blocking connect after the socket reported
    /// writable (or the connect op completed with 0).
    fn finish_connect(self: &Rc<Self>) {
        let pending = self.connect_pending.borrow_mut().take();
        let pending = match pending {
            Some(pending) => pending,
            None => return,
        };
        if let Some(timeout) = &pending.timeout {
            timeout.cancel();
        }
        let check = {
            let socket = self.socket.borrow();
            match socket.as_ref() {
                Some(socket) => match socket.take_error() {
                    Ok(Some(e)) => Err(e),
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                },
                None => {
                    pending.promise.try_failure(Error::ClosedChannel);
                    return;
                }
            }
        };
        match check {
            Ok(()) => {
                {
                    let socket = self.socket.borrow();
                    let socket = socket.as_ref().expect("socket present");
                    *self.shared.peer_addr.lock().unwrap() =
                        socket.peer_addr().ok().and_then(|a| a.as_socket());
                    *self.shared.local_addr.lock().unwrap() =
                        socket.local_addr().ok().and_then(|a| a.as_socket());
                }
                self.set_state(ChannelState::Connected);
                self.remove_interest(Interest::WRITE);
                pending.promise.try_success(());
                self.mark_active();
                // Anything flushed while the connect was outstanding.
                self.force_flush();
            }
            Err(e) => {
                let cause: SharedError = Arc::new(e.into());
                pending
                    .promise
                    .try_failure_shared(SharedError::clone(&cause));
                self.unsafe_close_forced(cause);
            }
        }
    }

    /// Resolve a connect-op completion from the ring.
    #[cfg(target_os = "linux")]
    fn on_connect_complete(self: &Rc<Self>, result: i32) {
        if result == 0 {
            self.finish_connect();
        } else if result == -libc::EINPROGRESS {
            // Completion-based connect fell back to readiness.
            self.add_interest(Interest::WRITE);
        } else {
            let pending = self.connect_pending.borrow_mut().take();
            if let Some(pending) = pending {
                if let Some(timeout) = &pending.timeout {
                    timeout.cancel();
                }
                let cause: SharedError = Arc::new(Error::from_errno(-result));
                pending
                    .promise
                    .try_failure_shared(SharedError::clone(&cause));
                self.unsafe_close_forced(cause);
            }
        }
    }

    pub(crate) fn unsafe_disconnect(self: &Rc<Self>, promise: Promise<()>) {
        // TCP has no connected-but-unbound resting state to return to:
        // disconnect tears the channel down like close.
        self.unsafe_close(promise);
    }

    pub(crate) fn unsafe_write(&self, msg: Message, promise: Promise<()>) {
        if self.state() == ChannelState::Closed || self.draining_close.get() {
            release_message(msg);
            promise.try_failure(Error::ClosedChannel);
            return;
        }
        if self.kind == ChannelKind::Stream && self.state() != ChannelState::Connected {
            release_message(msg);
            promise.try_failure(Error::NotYetConnected);
            return;
        }
        match downcast_buf(msg) {
            Ok(buf) => {
                let change = self.outbound.borrow_mut().add(buf, promise);
                self.fire_writability(change);
            }
            Err(other) => {
                release_message(other);
                promise.try_failure(Error::Encoder("unsupported message type".into()));
            }
        }
    }

    pub(crate) fn unsafe_flush(self: &Rc<Self>) {
        self.outbound.borrow_mut().add_flush();
        self.force_flush();
    }

    /// Push flushed bytes toward the kernel now.
    pub(crate) fn force_flush(self: &Rc<Self>) {
        if self.connect_pending.borrow().is_some() {
            return;
        }
        if self.kind != ChannelKind::Stream || self.state() != ChannelState::Connected {
            return;
        }
        #[cfg(target_os = "linux")]
        if self.is_uring() {
            self.uring_flush();
            return;
        }
        self.poll_flush();
    }

    /// Readiness write path: non-blocking vectored writes with a bounded
    /// spin, then write interest while the kernel pushes back.
    fn poll_flush(self: &Rc<Self>) {
        let spin = self.cfg.borrow().write_spin_count;
        for _ in 0..spin {
            if !self.outbound.borrow().has_flushed() {
                break;
            }
            let parts = self.outbound.borrow().flushed_parts(MAX_IOVECS);
            if parts.is_empty() {
                // Only empty buffers queued: complete them.
                let retired = self.outbound.borrow_mut().progress(0);
                self.apply_progress(retired);
                continue;
            }
            let result = {
                let socket = self.socket.borrow();
                let socket = match socket.as_ref() {
                    Some(socket) => socket,
                    None => return,
                };
                // The queue entries stay alive until `progress` removes
                // them, so the borrowed regions outlive this call.
                let slices: Vec<IoSlice<'_>> = parts
                    .iter()
                    .map(|&(ptr, len)| {
                        IoSlice::new(unsafe { std::slice::from_raw_parts(ptr, len) })
                    })
                    .collect();
                socket.send_vectored(&slices)
            };
            match result {
                Ok(n) => {
                    let retired = self.outbound.borrow_mut().progress(n);
                    self.apply_progress(retired);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.add_interest(Interest::WRITE);
                    return;
                }
                Err(e) => {
                    self.write_path_failed(Arc::new(e.into()));
                    return;
                }
            }
        }
        self.after_flush_progress();
    }

    fn after_flush_progress(self: &Rc<Self>) {
        if self.outbound.borrow().has_flushed() {
            self.add_interest(Interest::WRITE);
        } else {
            self.remove_interest(Interest::WRITE);
            if self.draining_close.get() {
                self.finish_close();
            }
        }
    }

    /// A write error fails the flushed promises; with `AUTO_CLOSE` the
    /// channel then closes.
    fn write_path_failed(self: &Rc<Self>, cause: SharedError) {
        let retired = self.outbound.borrow_mut().fail_flushed();
        self.apply_write_failure(retired, &cause);
        if self.cfg.borrow().auto_close {
            self.unsafe_close_forced(cause);
        }
    }

    // ---- io_uring write path ----

    #[cfg(target_os = "linux")]
    fn uring_flush(self: &Rc<Self>) {
        if self.uring.borrow().write_inflight || !self.outbound.borrow().has_flushed() {
            return;
        }
        let parts = self.outbound.borrow().flushed_parts(MAX_IOVECS);
        if parts.is_empty() {
            let retired = self.outbound.borrow_mut().progress(0);
            self.apply_progress(retired);
            self.after_flush_progress();
            return;
        }
        let fd = match self.fd() {
            Some(fd) => fd,
            None => return,
        };
        let id = self.id();
        // The submission carries raw addresses into these buffers; retained
        // views keep the memory alive until the completion arrives, even if
        // the entries are failed out from under the op.
        let pinned = self.outbound.borrow().retain_flushed(MAX_IOVECS);
        let submitted = {
            let mut ctx = self.loop_ref.borrow_mut();
            let uring = ctx.backend.uring_mut().expect("uring backend");
            if parts.len() == 1 {
                uring.submit_write(id, fd, parts[0].0, parts[0].1)
            } else {
                uring.submit_writev(id, fd, &parts)
            }
        };
        match submitted {
            Ok(()) => {
                let mut state = self.uring.borrow_mut();
                state.write_inflight = true;
                state.inflight_bufs = pinned;
            }
            Err(e) => {
                for buf in pinned {
                    let _ = buf.release();
                }
                self.write_path_failed(Arc::new(e));
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn release_inflight_write(&self) {
        let bufs = {
            let mut state = self.uring.borrow_mut();
            state.write_inflight = false;
            std::mem::take(&mut state.inflight_bufs)
        };
        for buf in bufs {
            let _ = buf.release();
        }
    }

    #[cfg(target_os = "linux")]
    fn on_write_complete(self: &Rc<Self>, result: i32) {
        if self.uring.borrow().closing {
            return;
        }
        if result >= 0 {
            let retired = self.outbound.borrow_mut().progress(result as usize);
            self.apply_progress(retired);
            if self.outbound.borrow().has_flushed() {
                // Short write: the tail is re-queued immediately.
                self.uring_flush();
            } else {
                self.after_flush_progress();
            }
        } else if result == -libc::EAGAIN {
            // Kernel pushed back: fall back to write readiness.
            self.add_interest(Interest::WRITE);
        } else {
            self.write_path_failed(Arc::new(Error::from_errno(-result)));
        }
    }

    // ---- read path ----

    pub(crate) fn unsafe_begin_read(&self) {
        if self.state() == ChannelState::Closed {
            return;
        }
        if !self.cfg.borrow().auto_read {
            self.read_pending.set(true);
        }
        self.add_interest(Interest::READ);
    }

    /// Drain readable bytes, firing `channel_read` per buffer, bounded by
    /// the adaptive allocator's per-turn budget.
    fn do_read(self: &Rc<Self>) {
        self.recv.borrow_mut().start_turn();
        let max_messages = self.cfg.borrow().max_messages_per_read;
        let mut eof = false;
        loop {
            if self.state() == ChannelState::Closed {
                return;
            }
            let size = self.recv.borrow().next_size();
            let mut buf = match self.alloc.buffer(size, size) {
                Ok(buf) => buf,
                Err(e) => {
                    self.pipeline.fire_exception_caught(Arc::new(e));
                    break;
                }
            };
            let result = {
                let socket = self.socket.borrow();
                let socket = match socket.as_ref() {
                    Some(socket) => socket,
                    None => {
                        let _ = buf.release();
                        return;
                    }
                };
                let (ptr, cap) = match buf.writable_parts() {
                    Ok(parts) => parts,
                    Err(e) => {
                        let _ = buf.release();
                        self.pipeline.fire_exception_caught(Arc::new(e));
                        return;
                    }
                };
                let uninit =
                    unsafe { std::slice::from_raw_parts_mut(ptr as *mut MaybeUninit<u8>, cap) };
                socket.recv(uninit)
            };
            match result {
                Ok(0) => {
                    let _ = buf.release();
                    eof = true;
                    break;
                }
                Ok(n) => {
                    let filled = n == buf.writable_bytes();
                    if let Err(e) = buf.advance_writer(n) {
                        let _ = buf.release();
                        self.pipeline.fire_exception_caught(Arc::new(e));
                        break;
                    }
                    self.recv.borrow_mut().record(n);
                    self.pipeline.fire_channel_read(Box::new(buf));
                    let more = self
                        .recv
                        .borrow()
                        .continue_reading(max_messages, filled);
                    if !more {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let _ = buf.release();
                    break;
                }
                Err(e) => {
                    let _ = buf.release();
                    let cause: SharedError = Arc::new(e.into());
                    self.pipeline
                        .fire_exception_caught(SharedError::clone(&cause));
                    self.unsafe_close_forced(cause);
                    return;
                }
            }
        }
        self.pipeline.fire_channel_read_complete();
        if eof {
            self.read_eof();
            return;
        }
        self.after_read_turn();
    }

    fn after_read_turn(&self) {
        if !self.cfg.borrow().auto_read {
            self.read_pending.set(false);
            self.remove_interest(Interest::READ);
        }
    }

    /// Peer shut down its write side. With half-closure allowed the input
    /// side transitions first and a user event fires; otherwise close.
    fn read_eof(self: &Rc<Self>) {
        if self.cfg.borrow().allow_half_closure {
            if !self.input_shutdown.get() {
                self.input_shutdown.set(true);
                self.remove_interest(Interest::READ);
                self.pipeline.fire_user_event(Box::new(InputShutdownEvent));
            }
            return;
        }
        self.unsafe_close(Promise::new());
    }

    /// Accept as many connections as the per-turn budget allows.
    fn do_accept(self: &Rc<Self>) {
        let max_messages = self.cfg.borrow().max_messages_per_read;
        let mut accepted = 0;
        loop {
            if accepted >= max_messages || self.state() == ChannelState::Closed {
                break;
            }
            let result = {
                let socket = self.socket.borrow();
                match socket.as_ref() {
                    Some(socket) => socket.accept(),
                    None => return,
                }
            };
            match result {
                Ok((child, peer)) => {
                    accepted += 1;
                    let peer = match peer.as_socket() {
                        Some(peer) => peer,
                        None => continue,
                    };
                    self.pipeline
                        .fire_channel_read(Box::new(AcceptedSocket { socket: child, peer }));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(channel = self.serial(), error = %e, "accept failed");
                    self.pipeline.fire_exception_caught(Arc::new(e.into()));
                    break;
                }
            }
        }
        self.pipeline.fire_channel_read_complete();
        self.after_read_turn();
    }

    // ---- close path ----

    /// Close, draining flushed writes first when the channel is healthy.
    /// The supplied promise completes together with the close future.
    pub(crate) fn unsafe_close(self: &Rc<Self>, promise: Promise<()>) {
        let close_future = self.shared.close_promise.clone();
        if !promise.is_void() {
            close_future.add_listener(move |_| {
                promise.try_success(());
            });
        }
        if self.state() == ChannelState::Closed || self.draining_close.get() {
            return;
        }
        // Unflushed writes will never reach the wire.
        let cause: SharedError = Arc::new(Error::ClosedChannel);
        let retired = self.outbound.borrow_mut().fail_unflushed();
        self.apply_write_failure(retired, &cause);

        if self.state() == ChannelState::Connected && self.outbound.borrow().has_flushed() {
            // Graceful: finish submitting flushed bytes, then tear down.
            self.draining_close.set(true);
            self.force_flush();
            return;
        }
        self.finish_close();
    }

    /// Immediate close on a fatal error: pending writes fail, no draining.
    pub(crate) fn unsafe_close_forced(self: &Rc<Self>, cause: SharedError) {
        if self.state() == ChannelState::Closed {
            return;
        }
        self.draining_close.set(false);
        let retired = self.outbound.borrow_mut().fail_all();
        self.apply_write_failure(retired, &cause);
        self.finish_close();
    }

    fn finish_close(self: &Rc<Self>) {
        if self.state() == ChannelState::Closed {
            return;
        }
        self.set_state(ChannelState::Closed);
        self.shared.active.store(false, Ordering::Release);
        self.draining_close.set(false);

        // A connect that never completed fails now.
        let pending = self.connect_pending.borrow_mut().take();
        if let Some(pending) = pending {
            if let Some(timeout) = &pending.timeout {
                timeout.cancel();
            }
            pending.promise.try_failure(Error::ClosedChannel);
        }

        let cause: SharedError = Arc::new(Error::ClosedChannel);
        let retired = self.outbound.borrow_mut().fail_all();
        self.apply_write_failure(retired, &cause);

        // In-flight submissions are cancelled first; the sendfile pipe and
        // any pinned write buffers are released only once their (cancelled)
        // completions have drained, in `teardown`.
        #[cfg(target_os = "linux")]
        if self.is_uring() && self.cancel_inflight_ops() {
            return;
        }
        self.teardown();
    }

    /// Submit cancels for every outstanding submission. Returns true when
    /// completions are still due and teardown must wait for them.
    #[cfg(target_os = "linux")]
    fn cancel_inflight_ops(self: &Rc<Self>) -> bool {
        let id = self.id();
        let mut ctx = self.loop_ref.borrow_mut();
        let uring = match ctx.backend.uring_mut() {
            Some(uring) => uring,
            None => return false,
        };
        let outstanding = uring.pending_ops(id);
        if outstanding == 0 {
            return false;
        }
        uring.cancel_all(id);
        self.uring.borrow_mut().closing = true;
        debug!(channel = self.serial(), outstanding, "waiting for cancelled completions");
        true
    }

    /// Check whether a closing channel has drained its completions; if so,
    /// close the fd through the ring to preserve ordering, then tear down.
    #[cfg(target_os = "linux")]
    fn poll_closing_progress(self: &Rc<Self>) {
        if !self.uring.borrow().closing {
            return;
        }
        let id = self.id();
        let pending = {
            let ctx = self.loop_ref.borrow();
            match &ctx.backend {
                crate::io::Backend::Uring(uring) => uring.pending_ops(id),
                _ => 0,
            }
        };
        if pending > 0 {
            return;
        }
        if !self.uring.borrow().close_submitted {
            // Hand the fd to the ring; the Close completion finishes teardown.
            let fd = {
                let socket = self.socket.borrow_mut().take();
                socket.map(|s| s.into_raw_fd())
            };
            if let Some(fd) = fd {
                let submitted = self
                    .loop_ref
                    .borrow_mut()
                    .backend
                    .uring_mut()
                    .expect("uring backend")
                    .submit_close(id, fd);
                match submitted {
                    Ok(()) => {
                        self.uring.borrow_mut().close_submitted = true;
                        return;
                    }
                    Err(e) => {
                        warn!(channel = self.serial(), error = %e, "ring close failed; closing inline");
                        unsafe { libc::close(fd) };
                    }
                }
            }
            self.uring.borrow_mut().closing = false;
            self.teardown();
        }
    }

    #[cfg(target_os = "linux")]
    fn on_close_complete(self: &Rc<Self>) {
        self.uring.borrow_mut().closing = false;
        self.teardown();
    }

    /// Deregister, drop the socket, and fire the terminal events.
    fn teardown(self: &Rc<Self>) {
        #[cfg(target_os = "linux")]
        {
            self.release_inflight_write();
            let (pipe, abandoned) = match self.sendfile.borrow_mut().as_mut() {
                Some(machine) => machine.close(),
                None => (None, None),
            };
            if let Some(pipe) = pipe {
                if let Some(uring) = self.loop_ref.borrow_mut().backend.uring_mut() {
                    uring.release_pipe(pipe);
                }
            }
            if let Some(promise) = abandoned {
                promise.try_failure(Error::ClosedChannel);
            }
        }
        let id = self.id();
        if self.registered.get() {
            self.registered.set(false);
            let fd = self.fd();
            let mut ctx = self.loop_ref.borrow_mut();
            if let Some(fd) = fd {
                if let Err(e) = ctx.backend.deregister(fd, id) {
                    debug!(channel = self.serial(), error = %e, "deregister failed");
                }
            } else {
                // fd already surrendered to the ring; drop bookkeeping only.
                let _ = ctx.backend.deregister(-1, id);
            }
        }
        // Dropping the socket closes the fd (unless the ring already did).
        self.socket.borrow_mut().take();

        if self.active_fired.get() && !self.inactive_fired.get() {
            self.inactive_fired.set(true);
            self.pipeline.fire_channel_inactive();
        }
        self.pipeline.fire_channel_unregistered();

        self.loop_ref.borrow_mut().remove_channel(id);
        self.shared.close_promise.try_success(());
        debug!(channel = self.serial(), "channel closed");
    }

    // ---- event dispatch from the loop ----

    /// Entry point for backend events belonging to this channel.
    pub(crate) fn on_io_event(self: &Rc<Self>, payload: IoPayload) {
        match payload {
            IoPayload::Ready(ready) => self.on_ready(ready),
            #[cfg(target_os = "linux")]
            IoPayload::Completion { op, result } => self.on_completion(op, result),
            #[cfg(not(target_os = "linux"))]
            IoPayload::Completion { .. } => {}
        }
    }

    fn on_ready(self: &Rc<Self>, ready: Ready) {
        if self.state() == ChannelState::Closed {
            #[cfg(target_os = "linux")]
            self.poll_closing_progress();
            return;
        }
        if ready.contains(Ready::WRITABLE) || ready.contains(Ready::CONNECT) {
            if self.connect_pending.borrow().is_some() {
                self.finish_connect();
            } else {
                self.force_flush();
            }
        }
        if self.state() == ChannelState::Closed {
            return;
        }
        if ready.contains(Ready::READABLE)
            || ready.contains(Ready::ACCEPT)
            || ready.contains(Ready::HANG_UP)
        {
            match self.kind {
                ChannelKind::Listener => self.do_accept(),
                ChannelKind::Stream => {
                    if self.interest.get().is_readable() || ready.contains(Ready::HANG_UP) {
                        self.do_read();
                    }
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn on_completion(self: &Rc<Self>, op: OpKind, result: i32) {
        if matches!(op, OpKind::Write | OpKind::Writev) {
            // The submission's pinned buffers release on every exit path.
            self.release_inflight_write();
        }
        if self.uring.borrow().closing {
            match op {
                OpKind::Close => self.on_close_complete(),
                _ => self.poll_closing_progress(),
            }
            return;
        }
        match op {
            OpKind::Connect => self.on_connect_complete(result),
            OpKind::Write | OpKind::Writev => self.on_write_complete(result),
            OpKind::SpliceToPipe | OpKind::SpliceFromPipe => {
                self.on_splice_complete(op, result);
            }
            OpKind::Close => self.on_close_complete(),
            other => {
                debug!(channel = self.serial(), op = ?other, result, "ignored completion");
            }
        }
    }

    // ---- sendfile (io_uring only) ----

    #[cfg(target_os = "linux")]
    fn start_sendfile(
        self: &Rc<Self>,
        file: std::fs::File,
        offset: u64,
        len: u64,
        promise: Promise<u64>,
    ) {
        if self.state() != ChannelState::Connected {
            promise.try_failure(Error::NotYetConnected);
            return;
        }
        if !self.is_uring() {
            promise.try_failure(Error::IllegalState(
                "sendfile requires the io_uring backend".into(),
            ));
            return;
        }
        let sock_fd = match self.fd() {
            Some(fd) => fd,
            None => {
                promise.try_failure(Error::ClosedChannel);
                return;
            }
        };
        let id = self.id();
        // Complete the promise only after every loop-local borrow is back.
        let failure = {
            let mut machine_slot = self.sendfile.borrow_mut();
            let machine = machine_slot.get_or_insert_with(|| SendFile::new(id, sock_fd));
            if !machine.is_idle() {
                Some(Error::Busy)
            } else {
                let mut ctx = self.loop_ref.borrow_mut();
                let uring = ctx.backend.uring_mut().expect("uring backend");
                match uring.acquire_pipe() {
                    Ok(pipe) => {
                        match machine.start(file, offset, len, promise.clone(), pipe, uring) {
                            Ok(()) => None,
                            Err(e) => {
                                let (pipe, _) = machine.close();
                                if let Some(pipe) = pipe {
                                    uring.release_pipe(pipe);
                                }
                                Some(e)
                            }
                        }
                    }
                    Err(e) => Some(e),
                }
            }
        };
        if let Some(e) = failure {
            promise.try_failure(e);
        }
    }

    #[cfg(target_os = "linux")]
    fn on_splice_complete(self: &Rc<Self>, op: OpKind, result: i32) {
        let done = {
            let mut machine_slot = self.sendfile.borrow_mut();
            let machine = match machine_slot.as_mut() {
                Some(machine) => machine,
                None => return,
            };
            let mut ctx = self.loop_ref.borrow_mut();
            let uring = ctx.backend.uring_mut().expect("uring backend");
            match op {
                OpKind::SpliceToPipe => machine.on_splice_to_pipe(result, uring),
                _ => machine.on_splice_from_pipe(result, uring),
            }
        };
        if let Some(done) = done {
            if let Some(uring) = self.loop_ref.borrow_mut().backend.uring_mut() {
                uring.release_pipe(done.pipe);
            }
            match done.outcome {
                Ok(transferred) => {
                    done.promise.try_success(transferred);
                }
                Err(e) => {
                    done.promise.try_failure(e);
                }
            }
        }
    }
}
