//! hawser echo server.
//!
//! A demonstration of the runtime's public surface: two event loop groups
//! (acceptor + workers), a server bootstrap with a child pipeline holding
//! one echo handler, and configuration via CLI arguments or TOML file.

use hawser::channel::ChannelOption;
use hawser::error::Result;
use hawser::io::BackendKind;
use hawser::pipeline::{downcast_buf, Caps, Handler, HandlerContext, Message};
use hawser::{EventLoopGroup, Runtime, ServerBootstrap, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Writes every received buffer straight back.
struct EchoHandler;

impl Handler for EchoHandler {
    fn caps(&self) -> Caps {
        Caps::INBOUND
    }

    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) -> Result<()> {
        match downcast_buf(msg) {
            Ok(buf) => {
                ctx.write_and_flush(Box::new(buf));
            }
            Err(other) => ctx.fire_channel_read(other),
        }
        Ok(())
    }
}

fn backend_of(name: &str) -> BackendKind {
    match name {
        "poll" => BackendKind::Poll,
        "uring" => BackendKind::Uring,
        "auto" => BackendKind::Auto,
        other => {
            warn!(backend = other, "unknown backend, using auto");
            BackendKind::Auto
        }
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = Runtime::from_env();
    let backend = backend_of(&config.backend);

    info!(
        listen = %config.listen,
        workers = config.workers,
        backend = ?backend,
        "Starting hawser echo server"
    );

    let acceptors = EventLoopGroup::new(1, backend, &runtime)?;
    let workers = EventLoopGroup::new(config.workers, backend, &runtime)?;

    let server = ServerBootstrap::new()
        .group(&acceptors, &workers)
        .option(ChannelOption::SoReuseaddr(true))
        .child_option(ChannelOption::TcpNodelay(true))
        .child_handler(|pipeline| pipeline.add_last("echo", Box::new(EchoHandler)));

    let channel = match server.bind(&config.listen).await_done()?.as_ref() {
        hawser::Outcome::Success(channel) => channel.clone(),
        hawser::Outcome::Failure(cause) => {
            return Err(format!("bind failed: {cause}").into());
        }
        hawser::Outcome::Cancelled => return Err("bind cancelled".into()),
    };
    info!(local = ?channel.local_addr(), "Listening");

    // Serve until the listener closes (never, short of a signal).
    channel.close_future().sync()?;
    workers.shutdown().sync()?;
    acceptors.shutdown().sync()?;
    Ok(())
}
