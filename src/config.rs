//! Per-daemon configuration (spec.md §6 Configuration), loaded the way
//! `cli.rs` loads `usbvfiod`'s `Cli`: a `clap::Parser` derive, but every
//! field also binds to the `USBIPICE_*` environment variable the spec names,
//! since the original has no CLI surface at all, only env vars.

use std::net::IpAddr;

use clap::Parser;

fn local_ip_fallback() -> String {
    // Best-effort local-IP discovery, used only as a last resort when
    // USBIPICE_VIRTUAL_IP / USBIPICE_CONTROL_SERVER is unset, mirroring the
    // `get_ip()` fallback in `original_source/worker/Config.py`.
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "usbipice-control",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Reservation/expiry/heartbeat control plane for usbipice",
    long_about = None
)]
pub struct ControlConfig {
    /// Enable verbose logging. Repeat for more verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Store connection string (USBIPICE_DATABASE). Out of scope per
    /// spec.md §1 - accepted for CLI compatibility but only consulted by
    /// a real `Store` backend, not the in-memory reference one.
    #[arg(long, env = "USBIPICE_DATABASE")]
    pub database: Option<String>,

    /// Port the control HTTP/WebSocket server listens on.
    #[arg(long, env = "USBIPICE_CONTROL_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Worker heartbeat poll period in seconds (spec.md §4.6, default 15).
    #[arg(long, env = "USBIPICE_HEARTBEAT_SECONDS", default_value_t = 15)]
    pub heartbeat_poll_seconds: u64,

    /// Worker-timeout poll period in seconds (default 15).
    #[arg(long, env = "USBIPICE_TIMEOUT_POLL_SECONDS", default_value_t = 15)]
    pub timeout_poll_seconds: u64,

    /// Duration of missed heartbeats before a worker is declared dead
    /// (default 60, `T_worker_timeout`).
    #[arg(long, env = "USBIPICE_TIMEOUT_DURATION_SECONDS", default_value_t = 60)]
    pub timeout_duration_seconds: u64,

    /// Reservation-expiry poll period in seconds (default 30).
    #[arg(long, env = "USBIPICE_RESERVATION_POLL_SECONDS", default_value_t = 30)]
    pub reservation_poll_seconds: u64,

    /// Ending-soon poll period in seconds (default 300).
    #[arg(
        long,
        env = "USBIPICE_RESERVATION_EXPIRING_NOTIFICATION_SECONDS",
        default_value_t = 300
    )]
    pub reservation_expiring_poll_seconds: u64,

    /// Notify clients this many minutes before expiry (default 20,
    /// `T_notify`).
    #[arg(
        long,
        env = "USBIPICE_RESERVATION_EXPIRING_NOTIFY_AT_MINUTES",
        default_value_t = 20
    )]
    pub reservation_notify_at_minutes: i64,

    /// Default reservation lifetime in seconds, `T_reserve` (spec.md §9 OQ2,
    /// default 1h).
    #[arg(long, env = "USBIPICE_RESERVE_SECONDS", default_value_t = 3600)]
    pub reserve_seconds: i64,

    /// Reservation extension increment in seconds, `T_extend` (default 1h).
    #[arg(long, env = "USBIPICE_EXTEND_SECONDS", default_value_t = 3600)]
    pub extend_seconds: i64,

    /// Grace window before an unbound session is torn down (spec.md §4.4,
    /// default 60s).
    #[arg(long, env = "USBIPICE_SESSION_GRACE_SECONDS", default_value_t = 60)]
    pub session_grace_seconds: u64,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "usbipice-worker",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Worker node hosting physical USB-attached devices for usbipice",
    long_about = None
)]
pub struct WorkerConfig {
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, env = "USBIPICE_DATABASE")]
    pub database: Option<String>,

    /// This worker's name, falls back to the OS hostname with a warning
    /// (mirrors `original_source/worker/Config.py`).
    #[arg(long, env = "USBIPICE_WORKER_NAME")]
    pub worker_name: Option<String>,

    /// Base URL of the control server, e.g. `http://10.0.0.1:8080`.
    #[arg(long, env = "USBIPICE_CONTROL_SERVER")]
    pub control_server: String,

    /// Port this worker's HTTP/WebSocket server listens on.
    #[arg(long, env = "USBIPICE_SERVER_PORT", default_value_t = 8081)]
    pub server_port: u16,

    /// IP advertised to clients for USB-over-IP attach (falls back to a
    /// detected local IP with a warning).
    #[arg(long, env = "USBIPICE_VIRTUAL_IP")]
    pub virtual_ip: Option<IpAddr>,

    /// USB-over-IP TCP port advertised to clients.
    #[arg(long, env = "USBIPICE_VIRTUAL_PORT", default_value_t = 3240)]
    pub virtual_port: u16,

    /// Path to the default/known-good firmware image flashed into devices
    /// on `unreserve` and at first sight.
    #[arg(long, env = "USBIPICE_DEFAULT")]
    pub default_firmware: String,

    /// Optional firmware image for the pulse-count reservable
    /// (spec.md §9 OQ3).
    #[arg(long, env = "USBIPICE_PULSE_COUNT")]
    pub pulse_count_firmware: Option<String>,

    /// Grace window before an unbound session is torn down.
    #[arg(long, env = "USBIPICE_SESSION_GRACE_SECONDS", default_value_t = 60)]
    pub session_grace_seconds: u64,
}

impl WorkerConfig {
    pub fn resolved_worker_name(&self) -> String {
        self.worker_name.clone().unwrap_or_else(|| {
            let hostname = hostname_fallback();
            tracing::warn!(hostname, "USBIPICE_WORKER_NAME not set, using hostname");
            hostname
        })
    }

    pub fn resolved_virtual_ip(&self) -> String {
        match self.virtual_ip {
            Some(ip) => ip.to_string(),
            None => {
                let ip = local_ip_fallback();
                tracing::warn!(ip, "USBIPICE_VIRTUAL_IP not set, using detected local IP");
                ip
            }
        }
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            hostname::get_impl()
        })
        .unwrap_or_else(|| "unknown-worker".to_string())
}

/// Minimal hostname lookup without pulling in a dedicated crate - mirrors
/// the narrow use `original_source/worker/Config.py` makes of `HOSTNAME`.
mod hostname {
    pub fn get_impl() -> Option<String> {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .filter(|out| out.status.success())
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "usbipice-client-cli",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Reserve, use and release usbipice devices from the command line",
    long_about = None
)]
pub struct ClientCliConfig {
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Base URL of the control server.
    #[arg(long, env = "USBIPICE_CONTROL_SERVER")]
    pub control_server: String,

    /// Identifier this client reserves devices under.
    #[arg(long, env = "USBIPICE_CLIENT_NAME")]
    pub client_name: String,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum ClientCommand {
    /// Reserve `amount` devices of the given reservable `kind`.
    Reserve {
        #[arg(long, default_value_t = 1)]
        amount: u32,
        #[arg(long, default_value = "usbip")]
        kind: String,
    },
    /// List serials currently held by this client.
    List,
    /// Extend all held reservations.
    ExtendAll,
    /// End all held reservations.
    EndAll,
    /// Flash firmware onto attached devices matching held serials.
    Flash {
        #[arg(long)]
        firmware: String,
    },
}
