//! veilsocks binary
//!
//! Usage: veilsocks <client|server> [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file (default: config.toml)
//!   -h, --help           Print help information

use std::env;
use std::process::ExitCode;

use veilsocks::client::Client;
use veilsocks::config::FileConfig;
use veilsocks::server::Server;
use veilsocks::Error;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    let mode = match args.get(1).map(String::as_str) {
        Some("client") => Mode::Client,
        Some("server") => Mode::Server,
        Some("-h") | Some("--help") | None => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Some(other) => {
            eprintln!("Unknown mode: {}", other);
            print_usage();
            return ExitCode::from(1);
        }
    };

    let mut config_path = "config.toml".to_string();
    let mut rest = args[2..].iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "-c" | "--config" => match rest.next() {
                Some(path) => config_path = path.clone(),
                None => {
                    eprintln!("Error: --config requires a file path");
                    return ExitCode::from(1);
                }
            },
            "-h" | "--help" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("Unknown option: {}", other);
                return ExitCode::from(1);
            }
        }
    }

    match run(mode, &config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            if e.is_config() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

enum Mode {
    Client,
    Server,
}

async fn run(mode: Mode, config_path: &str) -> Result<(), Error> {
    let file = FileConfig::load(config_path)?;

    match mode {
        Mode::Client => {
            let section = file
                .client
                .ok_or_else(|| Error::config("no [client] section in configuration"))?;
            let client = Client::new(section.into_config()?)?;
            client.run().await
        }
        Mode::Server => {
            let section = file
                .server
                .ok_or_else(|| Error::config("no [server] section in configuration"))?;
            let server = Server::new(section.into_config()?)?;
            server.run().await
        }
    }
}

fn print_usage() {
    println!(
        r#"veilsocks - tunneling SOCKS5 proxy pair

USAGE:
    veilsocks <client|server> [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file (default: config.toml)
    -h, --help           Print help information

EXAMPLES:
    Run the local endpoint:
        veilsocks client -c client.toml

    Run the remote endpoint:
        veilsocks server -c server.toml
"#
    );
}
