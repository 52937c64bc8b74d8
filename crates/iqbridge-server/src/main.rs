//! Binary entry point: flag parsing, logging setup, and the listen loop.

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

use iqbridge_hal::default_registry;
use iqbridge_server::Server;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 20655;

fn usage() {
    println!(
        "usage: iqbridge-server [-?|--help] [-h <listen host: default {}>] [-p <listen port: default {}>]",
        DEFAULT_HOST, DEFAULT_PORT
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut host = DEFAULT_HOST.to_string();
    let mut port = DEFAULT_PORT;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-?" | "--help" => {
                usage();
                return;
            }
            "-h" => match args.next() {
                Some(value) => host = value,
                None => {
                    usage();
                    process::exit(1);
                }
            },
            "-p" => {
                let value = args.next().unwrap_or_default();
                port = match value.parse() {
                    Ok(port) => port,
                    Err(_) => {
                        tracing::error!(port = %value, "cannot parse listen port");
                        process::exit(1);
                    }
                };
            }
            other => {
                tracing::warn!(arg = %other, "ignoring unknown argument");
            }
        }
    }

    let mut server = match Server::bind(&host, port, default_registry()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{}", e);
            process::exit(e.exit_code());
        }
    };
    tracing::info!(host = %host, port, "listening");

    if let Err(e) = server.run() {
        tracing::error!("{}", e);
        process::exit(e.exit_code());
    }
}
