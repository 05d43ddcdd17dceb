//! # perfkit-monitor
//!
//! Terminal front end for perfkit instrumentation servers.
//!
//! ## Overview
//!
//! Connects to one server and:
//! - mirrors the remote shell to stdout and forwards stdin lines to it
//! - keeps the config registry and tracer classes in sync
//! - fetches traced classes periodically and logs summaries
//!
//! ## Architecture
//!
//! This is Layer 3 - the binary that ties together:
//! - perfkit-core: Configuration, errors and wire types
//! - perfkit-transport: TCP framing
//! - perfkit-session: Session and trace state
//!
//! Network I/O runs on a tokio runtime; every piece of session state is
//! driven from the main thread's tick loop.

mod cli;

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use perfkit_core::{ClientConfig, TraceValue};
use perfkit_session::{SessionManager, SessionManagerConfig, SessionSlot, SlotId};
use perfkit_transport::{TcpTransport, TransportStatus};

use cli::{Args, ConsoleCommand, USAGE};

const TICK_INTERVAL: Duration = Duration::from_millis(16);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let address = args
        .address
        .clone()
        .unwrap_or_else(|| config.connection.address());
    info!(
        "perfkit-monitor v{} connecting to {}",
        env!("CARGO_PKG_VERSION"),
        address
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("perfkit-io")
        .build()
        .context("failed to start I/O runtime")?;

    let mut manager =
        SessionManager::with_config(SessionManagerConfig::from_client_config(&config));
    let transport = TcpTransport::connect(runtime.handle(), address.clone());
    let slot_id = manager.open(&address, transport)?;

    {
        let slot = manager.get_mut(&slot_id)?;
        slot.session_mut().set_session_state_observer(|state| {
            debug!(
                "Session state: cpu user={:.1}% kernel={:.1}%, rss={} bytes, threads={}, in={} B/s, out={} B/s",
                state.cpu_usage_self_user * 100.0,
                state.cpu_usage_self_kernel * 100.0,
                state.memory_usage_resident,
                state.num_threads,
                state.bw_in,
                state.bw_out
            );
        });
        if let Some((id, password)) = args.credentials() {
            slot.session().login(id, password)?;
        }
    }

    let mut console = spawn_console_reader(&runtime);
    let result = run(&mut manager, slot_id, &mut console);

    manager.close_all();
    runtime.shutdown_timeout(Duration::from_millis(500));
    info!("perfkit-monitor shutting down");
    result
}

/// Forward stdin lines to the main loop.
fn spawn_console_reader(runtime: &Runtime) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Console input closed");
                    break;
                }
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

fn run(
    manager: &mut SessionManager,
    slot_id: SlotId,
    console: &mut mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    let mut fence = 0u64;
    let mut connected_once = false;
    let mut last_summary = Instant::now();

    loop {
        let now = Instant::now();
        for (_, report) in manager.tick_all(now) {
            if let Some(diff) = report.diff.filter(|d| !d.is_empty()) {
                info!(
                    "Tracer classes changed: added={}, removed={}, replaced={}",
                    diff.added.len(),
                    diff.removed.len(),
                    diff.replaced.len()
                );
            }
        }

        let slot = manager.get_mut(&slot_id)?;

        if slot.session_mut().take_shell_fresh() {
            let read = slot.session().read_shell_since(fence);
            if read.skipped > 0 {
                warn!("Shell output overflowed, {} bytes skipped", read.skipped);
            }
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(read.bytes)?;
            stdout.flush()?;
            fence = read.fence;
        }

        match slot.session().status() {
            TransportStatus::Connected => {
                if !connected_once {
                    info!("Connected");
                    connected_once = true;
                }
            }
            TransportStatus::Invalid => {
                if connected_once {
                    info!("Connection closed by server");
                } else {
                    error!("Could not connect to {}", slot.label());
                }
                return Ok(());
            }
            TransportStatus::Connecting => {}
        }

        while let Ok(line) = console.try_recv() {
            if !handle_line(slot, &line) {
                return Ok(());
            }
        }

        if now.duration_since(last_summary) >= SUMMARY_INTERVAL {
            log_summary(slot);
            last_summary = now;
        }

        std::thread::sleep(TICK_INTERVAL);
    }
}

/// Handle one console line. Returns `false` when the user asked to quit.
fn handle_line(slot: &mut SessionSlot, line: &str) -> bool {
    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{e:#}");
            return true;
        }
    };

    let result = match command {
        ConsoleCommand::Quit => return false,
        ConsoleCommand::Help => {
            println!("{USAGE}");
            Ok(())
        }
        ConsoleCommand::Shell(line) => slot.session().push_command(&line),
        ConsoleCommand::Classes => {
            for class in slot.trace().classes() {
                println!(
                    "{:<24} instance={:<6} tracing={:<5} nodes={:<5} fetches={}",
                    class.name(),
                    class.instance_id(),
                    class.is_tracing(),
                    class.node_count(),
                    class.fetch_count()
                );
            }
            Ok(())
        }
        ConsoleCommand::Trace { class, enable } => {
            slot.trace_mut().set_class_tracing(&class, enable)
        }
        ConsoleCommand::Nodes(class) => {
            let mut nodes: Vec<_> = slot.trace().class_nodes(&class).collect();
            nodes.sort_by(|a, b| a.path.cmp(&b.path));
            for node in nodes {
                println!(
                    "{:indent$}{} = {}",
                    "",
                    node.name,
                    format_value(&node.value),
                    indent = node.depth * 2
                );
            }
            Ok(())
        }
        ConsoleCommand::Config => {
            for class in slot.session().config().classes() {
                println!("[{}]", class.name);
                class.for_each_entity(|entity| {
                    println!("  {:<6} {:<24} {}", entity.config_key, entity.name, entity.value);
                });
            }
            Ok(())
        }
        ConsoleCommand::Set { class, key, value } => slot.session().configure(&class, key, value),
    };

    if let Err(e) = result {
        eprintln!("{e}");
    }
    true
}

fn format_value(value: &TraceValue) -> String {
    match value {
        TraceValue::Null => "-".to_string(),
        TraceValue::Duration(us) => format!("{:.3} ms", *us as f64 / 1000.0),
        TraceValue::Integer(v) => v.to_string(),
        TraceValue::Float(v) => format!("{v:.4}"),
        TraceValue::String(s) => s.clone(),
        TraceValue::Boolean(b) => b.to_string(),
    }
}

fn log_summary(slot: &SessionSlot) {
    let session = slot.session();
    let stats = session.stats();
    let traced = slot.trace().classes().filter(|c| c.is_tracing()).count();
    info!(
        "Summary: epoch={}, frames={}, unknown_routes={}, marshal_errors={}, config_classes={}, traced_classes={}, nodes={}",
        session.epoch(),
        stats.dispatched,
        stats.unknown_routes,
        stats.marshal_errors,
        session.config().class_count(),
        traced,
        slot.trace().node_count()
    );
}
