//! vmlink client binary - command line tool for a VM server's control channel

use std::env;
use vmlink::{
    attach_viewer, CloseReason, ConnectionInfo, ControlConfig, ControlError, Event, KeepaliveConfig,
    Session, VmState,
};

/// What `--config` looked like on the command line
#[derive(Debug, PartialEq)]
enum ConfigArg {
    Absent,
    Path(String),
    /// Flag given without a file
    Missing,
}

/// Pull `--config <file>` out of args
fn take_config_arg(args: &mut Vec<String>) -> ConfigArg {
    match args.iter().position(|a| a == "--config" || a == "-c") {
        Some(i) if i + 1 < args.len() => {
            let path = args.remove(i + 1);
            args.remove(i);
            ConfigArg::Path(path)
        }
        Some(i) => {
            args.remove(i);
            ConfigArg::Missing
        }
        None => ConfigArg::Absent,
    }
}

#[tokio::main]
async fn main() -> vmlink::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args: Vec<String> = env::args().collect();
    let config = match take_config_arg(&mut args) {
        ConfigArg::Absent => ControlConfig::default(),
        ConfigArg::Path(path) => ControlConfig::load(&path)?,
        ConfigArg::Missing => {
            println!("--config needs a file");
            println!();
            print_usage();
            return Ok(());
        }
    };

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = args[1].as_str();
    let info = connection_info(&config, &args);
    let keepalive = config.keepalive();

    match command {
        "status" | "watch" => run_session(command, &info, keepalive, None).await,
        "start" => run_session(command, &info, keepalive, Some(VmState::Running)).await,
        "stop" => run_session(command, &info, keepalive, Some(VmState::Stopped)).await,
        "destroy" => run_session(command, &info, keepalive, Some(VmState::Destroyed)).await,
        "attach" => {
            let stream = attach_viewer(&info).await?;
            println!(
                "Viewer attached to {} (local {})",
                info,
                stream.local_addr()?
            );
            Ok(())
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// Run a control session, printing events until `command` is satisfied
async fn run_session(
    command: &str,
    info: &ConnectionInfo,
    keepalive: KeepaliveConfig,
    target: Option<VmState>,
) -> vmlink::Result<()> {
    let mut session = Session::connect(info, keepalive)?;
    let handle = session.handle();
    let mut events = session.subscribe();
    if let Some(target) = target {
        session.want_vm_state(target);
    }

    let watcher = async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    print_event(&event);
                    if matches!(event, Event::Closed { .. }) {
                        break;
                    }
                    if is_finished(command, &event) {
                        handle.close();
                    }
                }
                _ = tokio::signal::ctrl_c() => handle.close(),
            }
        }
    };

    let (reason, ()) = tokio::join!(session.run(), watcher);
    session_result(reason)
}

/// Only a close we asked for counts as success
fn session_result(reason: CloseReason) -> vmlink::Result<()> {
    match reason {
        CloseReason::Local => Ok(()),
        reason => Err(ControlError::SessionEnded(reason)),
    }
}

/// Whether `event` completes `command`
fn is_finished(command: &str, event: &Event) -> bool {
    match (command, event) {
        ("status", Event::AuthOk { .. }) => true,
        ("start", Event::AuthOk { vm_state, .. }) => *vm_state == VmState::Running,
        ("start", Event::VmStarted { .. })
        | ("start", Event::StartupFailed { .. })
        | ("start", Event::StartupRejectedMemory) => true,
        ("stop", Event::AuthOk { vm_state, .. }) => *vm_state == VmState::Stopped,
        ("stop", Event::VmStopped) => true,
        ("destroy", Event::VmDestroyed) => true,
        _ => false,
    }
}

fn print_event(event: &Event) {
    match event {
        Event::Connected => println!("Connected"),
        Event::AuthOk {
            vm_state,
            name,
            max_mouse_rate,
        } => {
            println!("VM: {}", name);
            println!("State: {}", vm_state);
            if *max_mouse_rate > 0 {
                println!("Mouse rate limit: {}", max_mouse_rate);
            }
        }
        Event::AuthFailed { error } => println!("Authentication failed: {}", error),
        Event::ProtocolError { message } => println!("Server error: {}", message),
        Event::AttachingViewer => println!("Attaching viewer"),
        Event::StartupProgress { fraction } => {
            println!("Starting: {:>3}%", (fraction * 100.0).round() as i64)
        }
        Event::StartupRejectedMemory => println!("Startup rejected: not enough memory"),
        Event::StartupFailed { message } => println!("Startup failed: {}", message),
        Event::VmStarted { .. } => println!("VM started"),
        Event::VmStopped => println!("VM stopped"),
        Event::VmDestroyed => println!("VM destroyed"),
        Event::Pong => {}
        Event::Closed { reason } => println!("Disconnected: {}", reason),
    }
}

fn print_usage() {
    println!("vmlink client - VM control channel");
    println!();
    println!("Usage: vmlink-client [--config <file>] <command> [address[:port]] [token]");
    println!();
    println!("Commands:");
    println!("  status                                  Show VM name and state");
    println!("  start                                   Start the VM and wait until running");
    println!("  stop                                    Stop the VM and wait until stopped");
    println!("  destroy                                 Destroy the VM");
    println!("  watch                                   Print VM events until Ctrl+C");
    println!("  attach                                  Attach a viewer and report success");
    println!();
    println!("Examples:");
    println!("  vmlink-client status vm.example.org secret");
    println!("  vmlink-client start 192.168.1.100:18923 secret");
    println!("  vmlink-client --config vmlink.json watch");
    println!();
    println!("Default port: {}", vmlink::DEFAULT_PORT);
    println!();
    println!("Config file (JSON): address, port, token, keepalive_interval_ms,");
    println!("                    max_outstanding_pings");
}

/// Address and token from the command line, falling back to the config
fn connection_info(config: &ControlConfig, args: &[String]) -> ConnectionInfo {
    let mut info = config.connection_info();
    if let Some(addr) = args.get(2) {
        let (host, port) = split_addr(addr);
        info = ConnectionInfo::new(host, port.unwrap_or(info.port), info.token);
    }
    if let Some(token) = args.get(3) {
        info.token = token.clone();
    }
    if info.address.is_empty() {
        info.address = "127.0.0.1".into();
    }
    info
}

/// Split `host[:port]`; a bracketed IPv6 literal keeps its colons
fn split_addr(s: &str) -> (&str, Option<u16>) {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (s, None),
        },
        _ => (s, None),
    }
}
