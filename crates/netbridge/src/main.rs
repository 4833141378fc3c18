//! `netbridge` binary entry point: parses the CLI surface, loads the
//! layered configuration, initialises logging, and dispatches into one of
//! the four connection modes or the outbound client / keystore forms.

use clap::Parser;
use host_config::{logging, Config};
use netbridge::dispatcher::{self, BridgeMode};
use netbridge::error::{BridgeError, BridgeResult};
use netbridge::isolator::{self, IsolationPolicy};
use netbridge::keystore::Keystore;
use tracing::{error, info};

use netbridge::config::{Args, Command};

fn parse_mode(args: &Args) -> BridgeResult<BridgeMode> {
    if let Some(parts) = &args.forward_local {
        let [connpoint, host, port] = <[String; 3]>::try_from(parts.clone())
            .map_err(|_| BridgeError::ArgumentInvalid("-s expects 3 values".into()))?;
        if !connpoint.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BridgeError::ArgumentInvalid(format!(
                "connpoint {connpoint:?} must match [A-Za-z0-9]+"
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| BridgeError::ArgumentInvalid(format!("invalid port {port:?}")))?;
        return Ok(BridgeMode::ForwardLocal { connpoint, host, port });
    }

    if let Some(parts) = &args.forward_inherited {
        let [fd, host, port] = <[String; 3]>::try_from(parts.clone())
            .map_err(|_| BridgeError::ArgumentInvalid("-S expects 3 values".into()))?;
        let fd: i32 = fd
            .parse()
            .map_err(|_| BridgeError::ArgumentInvalid(format!("invalid fd {fd:?}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| BridgeError::ArgumentInvalid(format!("invalid port {port:?}")))?;
        return Ok(BridgeMode::InheritedSocket { fd, host, port });
    }

    if let Some(port) = args.listen_port {
        return Ok(BridgeMode::Listen {
            port,
            bind_host: args.listen_host.clone(),
            exec: args.exec.clone(),
        });
    }

    if let Some(target) = &args.target {
        return Ok(BridgeMode::Outbound {
            target: target.clone(),
            port: args.target_port,
        });
    }

    Err(BridgeError::ArgumentInvalid(
        "no mode selected: expected -s, -S, -l, a keystore subcommand, or [tag@]host".into(),
    ))
}

async fn run(args: Args, config: Config) -> BridgeResult<()> {
    if let Some(fd) = isolator::child_mode_fd() {
        info!(fd, "re-exec'd as per-connection child, serving inherited descriptor");
        return dispatcher::serve_inherited_remote_session(fd, &config).await;
    }

    let retry = args.retry.unwrap_or(config.default_retry);

    if let Some(Command::Keystore { base_dir, tag, host, port }) = &args.command {
        let root = base_dir
            .clone()
            .unwrap_or_else(|| config.paths().keystore_dir());
        let ks = Keystore::open(&root)?;
        ks.register(tag, host, *port, Vec::new())?;
        info!(%tag, %host, port, "registered keystore entry");
        return Ok(());
    }

    let mode = parse_mode(&args)?;
    info!(?mode, "dispatching connection mode");

    match mode {
        BridgeMode::Listen { port, bind_host, exec } => {
            let policy = IsolationPolicy::from_single_flag(args.single);
            dispatcher::run_listen(&bind_host, port, policy, exec.as_deref(), &config).await
        }
        BridgeMode::Outbound { target, port } => {
            let keystore_root = config.paths().keystore_dir();
            let (host, resolved_port) =
                dispatcher::resolve_outbound_target(&target, port, &config, &keystore_root)?;
            let mut session = dispatcher::connect_outbound(&host, resolved_port, retry).await?;
            info!(%host, resolved_port, "outbound session established");
            let connpoint = dispatcher::default_connpoint(&config);
            let mut pr = dispatcher::establish_local_listener(connpoint.clone()).await?;
            dispatcher::bridge_session(&mut pr, &connpoint, true, &mut session).await
        }
        BridgeMode::ForwardLocal { connpoint, host, port } => {
            let mut session = dispatcher::connect_outbound(&host, port, retry).await?;
            info!(%connpoint, %host, port, "forward-local session established");
            let mut pr = dispatcher::establish_local_listener(connpoint.clone()).await?;
            dispatcher::bridge_session(&mut pr, &connpoint, true, &mut session).await
        }
        BridgeMode::InheritedSocket { fd, host, port } => {
            let inherited = dispatcher::adopt_inherited_socket(fd)?;
            let mut session = dispatcher::connect_outbound(&host, port, retry).await?;
            info!(fd, %host, port, "inherited-socket session established");
            let segment_tag = format!("inherited-{fd}");
            let mut pr = dispatcher::establish_local_inherited(inherited, segment_tag.clone()).await?;
            dispatcher::bridge_session(&mut pr, &segment_tag, true, &mut session).await
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("netbridge: configuration error: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    if let Err(e) = logging::parse_level(&args.log_level) {
        eprintln!("netbridge: invalid --log-level: {e}");
        return std::process::ExitCode::from(64);
    }

    let groups = match &args.trace_groups {
        Some(selector) => match logging::parse_trace_groups(selector) {
            Ok(groups) => groups,
            Err(e) => {
                eprintln!("netbridge: invalid -d selector: {e}");
                return std::process::ExitCode::from(64);
            }
        },
        None => Vec::new(),
    };

    if let Err(e) = config.paths().ensure_dirs() {
        eprintln!("netbridge: failed to create state directories: {e}");
        return std::process::ExitCode::from(1);
    }
    let log_path = config.paths().logs_dir().join("netbridge.jsonl");
    logging::init_logging("netbridge", &args.log_level, &groups, log_path);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::select! {
        result = run(args, config) => {
            match result {
                Ok(()) => std::process::ExitCode::from(0),
                Err(e) => {
                    error!(error = %e, "netbridge exiting with error");
                    std::process::ExitCode::from(e.exit_code() as u8)
                }
            }
        }
        _ = ctrl_c => {
            info!("received shutdown signal, exiting");
            std::process::ExitCode::from(0)
        }
    }
}
