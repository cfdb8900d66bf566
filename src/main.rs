use eyre::WrapErr;
use lexopt::prelude::*;
use std::time::Duration;
use utun::{BackendConfig, FrontendConfig, Listener, Server};

/// Which side of the tunnel this process runs.
#[derive(Debug, Clone)]
enum Role {
    Frontend(FrontendConfig),
    Backend(BackendConfig),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    // Initialize logging based on command-line flags before argument parsing
    let args: Vec<String> = std::env::args().collect();
    let filter = if args.contains(&"--debug".to_string()) {
        tracing_subscriber::filter::EnvFilter::new("debug")
    } else if args.contains(&"-v".to_string()) || args.contains(&"--verbose".to_string()) {
        tracing_subscriber::filter::EnvFilter::new("info")
    } else {
        tracing_subscriber::filter::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let role = parse_args().wrap_err("parse arguments")?;

    match role {
        Role::Frontend(config) => {
            tracing::info!(
                "Starting utun frontend - UDP bind: {}:{}, backend: {}",
                config.host,
                config.port,
                config.backend_endpoint()
            );
            let listener = Listener::bind(&config).await?;
            listener.run().await
        }
        Role::Backend(config) => {
            tracing::info!(
                "Starting utun backend - TCP bind: {}:{}, origin: {}:{}, idle timeout: {:?}",
                config.host,
                config.port,
                config.origin_host,
                config.origin_port,
                config.idle_timeout
            );
            let server = Server::bind(&config).await?;
            server.run().await
        }
    }
}

fn parse_args() -> eyre::Result<Role> {
    let mut parser = lexopt::Parser::from_env();

    let role = match parser.next()? {
        Some(Value(role)) => role.string()?,
        Some(Short('h')) | Some(Long("help")) => usage(0),
        Some(arg) => return Err(arg.unexpected()).wrap_err("expected 'frontend' or 'backend'"),
        None => usage(1),
    };

    match role.as_str() {
        "frontend" => parse_frontend(&mut parser).map(Role::Frontend),
        "backend" => parse_backend(&mut parser).map(Role::Backend),
        other => eyre::bail!("unknown role '{other}', expected 'frontend' or 'backend'"),
    }
}

fn parse_frontend(parser: &mut lexopt::Parser) -> eyre::Result<FrontendConfig> {
    let mut config = FrontendConfig::default();
    while let Some(arg) = parser.next()? {
        match arg {
            Long("host") => config.host = parser.value()?.string().wrap_err("--host")?,
            Long("port") => config.port = parser.value()?.parse().wrap_err("--port")?,
            Long("backend-host") => {
                config.backend_host = parser.value()?.string().wrap_err("--backend-host")?;
            }
            Long("backend-port") => {
                config.backend_port = parser.value()?.parse().wrap_err("--backend-port")?;
            }
            // Already applied to the log filter
            Short('v') | Long("verbose") | Long("debug") => {}
            Short('h') | Long("help") => usage(0),
            _ => return Err(arg.unexpected()).wrap_err("unexpected argument"),
        }
    }
    Ok(config)
}

fn parse_backend(parser: &mut lexopt::Parser) -> eyre::Result<BackendConfig> {
    let mut config = BackendConfig::default();
    while let Some(arg) = parser.next()? {
        match arg {
            Long("host") => config.host = parser.value()?.string().wrap_err("--host")?,
            Long("port") => config.port = parser.value()?.parse().wrap_err("--port")?,
            Long("origin-host") => {
                config.origin_host = parser.value()?.string().wrap_err("--origin-host")?;
            }
            Long("origin-port") => {
                config.origin_port = parser.value()?.parse().wrap_err("--origin-port")?;
            }
            Long("idle-timeout") => {
                let secs: u64 = parser.value()?.parse().wrap_err("--idle-timeout")?;
                config.idle_timeout = Duration::from_secs(secs);
            }
            Short('v') | Long("verbose") | Long("debug") => {}
            Short('h') | Long("help") => usage(0),
            _ => return Err(arg.unexpected()).wrap_err("unexpected argument"),
        }
    }
    Ok(config)
}

/// Displays help information and exits with the specified code.
fn usage(exit_with: i32) -> ! {
    let bin = std::env::args()
        .next()
        .unwrap_or_else(|| String::from(env!("CARGO_BIN_NAME")));

    eprintln!(
        "{} ({})",
        concat!(env!("CARGO_BIN_NAME"), " ", env!("CARGO_PKG_VERSION")),
        env!("GIT_HASH")
    );
    eprintln!();
    eprintln!("DESCRIPTION:");
    eprintln!("    Tunnels UDP traffic over a single TCP connection.");
    eprintln!("    The frontend faces UDP clients, the backend faces the origin UDP service.");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    {bin} frontend [OPTIONS]");
    eprintln!("    {bin} backend [OPTIONS]");
    eprintln!();
    eprintln!("FRONTEND OPTIONS:");
    eprintln!("    --host <HOST>           UDP bind host (default: 0.0.0.0)");
    eprintln!("    --port <PORT>           UDP bind port (default: 9999)");
    eprintln!("    --backend-host <HOST>   Backend TCP host (default: 127.0.0.1)");
    eprintln!("    --backend-port <PORT>   Backend TCP port (default: 8888)");
    eprintln!();
    eprintln!("BACKEND OPTIONS:");
    eprintln!("    --host <HOST>           TCP bind host (default: 0.0.0.0)");
    eprintln!("    --port <PORT>           TCP bind port (default: 8888)");
    eprintln!("    --origin-host <HOST>    Origin UDP host (default: 127.0.0.1)");
    eprintln!("    --origin-port <PORT>    Origin UDP port (default: 8211)");
    eprintln!("    --idle-timeout <SECS>   Close client relays idle this long (default: 5)");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -v, --verbose           Enable info logging");
    eprintln!("    --debug                 Enable debug logging");
    eprintln!("    -h, --help              Show this help message");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    # Backend (next to the origin service)");
    eprintln!("    {bin} backend --port 8888 --origin-port 8211");
    eprintln!();
    eprintln!("    # Frontend (where clients are)");
    eprintln!("    {bin} frontend --port 9999 --backend-host server --backend-port 8888");
    eprintln!();
    std::process::exit(exit_with);
}
