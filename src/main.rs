//! sockmux - Party Line Chat Server
//!
//! Every line a logged-in user types is relayed to everyone else. Exercises
//! the listener factory, line framing, idle timeouts, connection jobs and
//! manager jobs of the sockmux library.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sockmux::config::{ConfigManager, SocketConfig};
use sockmux::{
    ConnType, Connection, ConnectionHandler, ConnectionManager, Context, Cron, ListenOptions,
    ShutdownCoordinator,
};

/// Unnamed users are dropped after this long
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_CRON: &str = "login-timeout";
const MAX_NICK_LEN: usize = 16;

/// CLI arguments for sockmux
#[derive(Parser, Debug)]
#[command(name = "sockmux")]
#[command(about = "sockmux - party line chat server")]
#[command(version)]
#[command(long_about = "
sockmux - party line chat server

Connect with any line-oriented client, pick a nick, and every line you type
is relayed to the other users. Commands: /who, /quit.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  SOCKMUX_PORT            - Listening port
  SOCKMUX_BIND_HOST       - Local address to bind
  SOCKMUX_IDLE_TIMEOUT    - Idle timeout (e.g., 5m, 30s)
  SOCKMUX_SELECT_TIMEOUT  - Longest poll wait (e.g., 100ms)
  SOCKMUX_RATE_BYTES      - Write quota per window, 0 disables shaping
  SOCKMUX_RATE_WINDOW     - Write quota window (e.g., 1s)
  SOCKMUX_TLS_ENABLED     - Encrypt connections (true/false)
  SOCKMUX_PEM_FILE        - Certificate and key file
  SOCKMUX_LOG_LEVEL       - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "sockmux.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Port to listen on (overrides config file)
    #[arg(short, long, help = "Port to listen on")]
    pub port: Option<u16>,

    /// Local address to bind (overrides config file)
    #[arg(short, long, help = "Local address to bind")]
    pub bind_host: Option<String>,

    #[arg(long, help = "Encrypt connections with TLS")]
    pub enable_tls: bool,

    #[arg(long, help = "PEM file with certificate chain and private key")]
    pub pem_file: Option<PathBuf>,

    #[arg(long, help = "Require clients to present a certificate")]
    pub require_client_cert: bool,

    /// Idle timeout in seconds, 0 disables it
    #[arg(long, help = "Idle timeout in seconds")]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

/// A line waiting to be relayed
struct Broadcast {
    /// Connection name of the sender, who does not get a copy
    from: Option<String>,
    text: String,
}

/// State shared by all users of the party line
#[derive(Default)]
struct Hub {
    outbox: Vec<Broadcast>,
    /// Connection name to nick
    nicks: BTreeMap<String, String>,
}

impl Hub {
    fn announce(&mut self, from: &str, text: String) {
        self.outbox.push(Broadcast {
            from: Some(from.to_string()),
            text,
        });
    }
}

/// Settings applied to every accepted user
#[derive(Default)]
struct PeerSettings {
    socket: SocketConfig,
}

#[derive(Default)]
struct PartyLine {
    hub: Rc<RefCell<Hub>>,
    settings: Rc<PeerSettings>,
    nick: Option<String>,
}

impl PartyLine {
    fn new(hub: Rc<RefCell<Hub>>, settings: Rc<PeerSettings>) -> Self {
        Self {
            hub,
            settings,
            nick: None,
        }
    }

    fn login(&mut self, ctx: &mut Context<'_, Self>, nick: &str) {
        let valid = !nick.is_empty()
            && nick.len() <= MAX_NICK_LEN
            && nick.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            reply(ctx, "Nicks are 1-16 letters, digits, '_' or '-'. Try again:");
            return;
        }

        let mut hub = self.hub.borrow_mut();
        if hub.nicks.values().any(|taken| taken.eq_ignore_ascii_case(nick)) {
            drop(hub);
            reply(ctx, "That nick is taken. Try again:");
            return;
        }

        ctx.stop_cron(LOGIN_CRON);
        hub.nicks.insert(ctx.name().to_string(), nick.to_string());
        hub.announce(ctx.name(), format!("* {} has joined", nick));
        let online = hub.nicks.len();
        drop(hub);

        info!("{} logged in as {}", ctx.name(), nick);
        self.nick = Some(nick.to_string());
        reply(ctx, &format!("Hello {}, {} user(s) online", nick, online));
    }
}

impl ConnectionHandler for PartyLine {
    fn connected(&mut self, ctx: &mut Context<'_, Self>) {
        if ctx.conn_type() == ConnType::Inbound {
            reply(ctx, "Welcome to the party line. Enter your nick:");
        }
    }

    fn disconnected(&mut self, ctx: &mut Context<'_, Self>) {
        if let Some(nick) = self.nick.take() {
            let mut hub = self.hub.borrow_mut();
            hub.nicks.remove(ctx.name());
            hub.announce(ctx.name(), format!("* {} has left", nick));
        }
        debug!("{} disconnected", ctx.name());
    }

    fn timeout(&mut self, ctx: &mut Context<'_, Self>) {
        reply(ctx, "Idle for too long, goodbye");
    }

    fn sock_error(&mut self, ctx: &mut Context<'_, Self>) {
        warn!("Socket error on {}", ctx.name());
    }

    fn read_line(&mut self, ctx: &mut Context<'_, Self>, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let Some(nick) = self.nick.clone() else {
            self.login(ctx, text);
            return;
        };

        match text {
            "/quit" => {
                reply(ctx, "Bye");
                ctx.close();
            }
            "/who" => {
                let who = self.hub.borrow().nicks.values().cloned().collect::<Vec<_>>();
                reply(ctx, &format!("Online: {}", who.join(", ")));
            }
            _ => {
                let name = ctx.name().to_string();
                self.hub.borrow_mut().announce(&name, format!("<{}> {}", nick, text));
            }
        }
    }

    fn reached_max_buffer(&mut self, ctx: &mut Context<'_, Self>) {
        ctx.read_buffer_mut().clear();
        reply(ctx, "Line too long, discarded");
    }

    fn connection_from(&mut self, ctx: &mut Context<'_, Self>, host: &str, port: u16) -> bool {
        info!("Connection from {}:{} on {}", host, port, ctx.name());
        true
    }

    fn spawn(&mut self, _host: &str, _port: u16) -> Option<Connection<Self>> {
        let mut peer = Connection::new(PartyLine::new(Rc::clone(&self.hub), Rc::clone(&self.settings)));
        let socket = peer.socket_mut();
        socket.apply_config(&self.settings.socket);
        socket.enable_line_mode(true);

        peer.add_cron(Cron::once(LOGIN_CRON, LOGIN_TIMEOUT, |conn: &mut Connection<PartyLine>| {
            if conn.handler().nick.is_none() {
                info!("{} did not log in in time", conn.name());
                if let Err(e) = conn.write_line("Login timed out") {
                    debug!("Unable to notify {}: {}", conn.name(), e);
                }
                conn.close();
            }
        }));
        Some(peer)
    }
}

/// Send a line to one user, dropping the user if that fails
fn reply(ctx: &mut Context<'_, PartyLine>, text: &str) {
    if let Err(e) = ctx.write_line(text) {
        debug!("Write to {} failed: {}", ctx.name(), e);
        ctx.close();
    }
}

/// Manager job: relay queued lines to every logged-in user but the sender
fn deliver(manager: &mut ConnectionManager<PartyLine>, hub: &Rc<RefCell<Hub>>) {
    let pending = std::mem::take(&mut hub.borrow_mut().outbox);
    for message in pending {
        for conn in manager.iter_mut() {
            if conn.handler().nick.is_none() || message.from.as_deref() == Some(conn.name()) {
                continue;
            }
            if let Err(e) = conn.write_line(&message.text) {
                debug!("Relay to {} failed: {}", conn.name(), e);
                conn.close();
            }
        }
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    init_tracing(&args, &config.logging.level)?;

    info!("Starting sockmux v{} - party line chat server", env!("CARGO_PKG_VERSION"));

    config.merge_with_cli_args(
        args.port,
        args.bind_host.as_deref(),
        args.enable_tls,
        args.pem_file.as_deref(),
        args.require_client_cert,
        args.idle_timeout,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Listen port: {}", config.listener.port);
        info!("  Bind host: {}", config.listener.bind_host.as_deref().unwrap_or("*"));
        info!("  Idle timeout: {:?}", config.socket.idle_timeout);
        info!("  Select timeout: {:?}", config.manager.select_timeout);
        info!(
            "  Rate shaping: {}",
            if config.rate.is_enabled() {
                format!("{} bytes per {:?}", config.rate.max_bytes, config.rate.window)
            } else {
                "disabled".to_string()
            }
        );
        info!("  TLS: {}", if config.tls.enabled { "enabled" } else { "disabled" });
        return Ok(());
    }

    let mut manager = ConnectionManager::<PartyLine>::with_config(&config.manager)
        .context("Unable to create the connection manager")?;

    let hub = Rc::new(RefCell::new(Hub::default()));
    let settings = Rc::new(PeerSettings {
        socket: config.socket.clone(),
    });

    let mut listener = Connection::new(PartyLine::new(Rc::clone(&hub), settings));
    if config.rate.is_enabled() {
        // Inherited by every accepted user
        listener
            .socket_mut()
            .set_rate(config.rate.max_bytes, config.rate.window.as_millis() as u64);
    }

    let mut options = ListenOptions::new(config.listener.port, config.listener.name.clone())
        .backlog(config.listener.backlog);
    if let Some(bind_host) = &config.listener.bind_host {
        options = options.bind_host(bind_host.clone());
    }
    if config.tls.enabled {
        options = options.tls(config.tls.clone());
    }
    manager
        .listen(options, listener)
        .context("Unable to start the listener")?;

    manager.add_cron(Cron::every(
        "broadcast",
        Duration::ZERO,
        move |m: &mut ConnectionManager<PartyLine>| deliver(m, &hub),
    ));

    let shutdown = ShutdownCoordinator::new(manager.waker());
    let _signals = shutdown.spawn_signal_listener()?;

    info!(
        "Party line listening on port {} ({})",
        config.listener.port,
        if config.tls.enabled { "TLS" } else { "plain" }
    );
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    manager.run(&shutdown.flag());

    info!("Initiating graceful shutdown...");
    for conn in manager.iter_mut() {
        if conn.handler().nick.is_some() {
            if let Err(e) = conn.write_line("Server shutting down") {
                debug!("Unable to notify {}: {}", conn.name(), e);
            }
        }
    }
    manager.close_all();
    manager.loop_once();

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured: &str) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(configured)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
