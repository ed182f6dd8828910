use std::process;

use clap::{App, Arg};
use serde_derive::Deserialize;
use sloggers::LoggerConfig;

use adbnet::endpoint::{Collaborators, Endpoint};
use adbnet::Config;
use adbproto::auth::KeyStore;
use adbproto::logging;

mod hooks;
mod shell;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DaemonConfig {
    server: Config,
    log: Option<LoggerConfig>,
}

fn main() {
    let matches = App::new("adbd")
        .version("0.1.0")
        .about("ADB device-side daemon")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the TOML config file")
                .index(1),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .help("Override the listen port"),
        )
        .arg(
            Arg::with_name("no-auth")
                .long("no-auth")
                .help("Accept connections without authentication"),
        )
        .get_matches();

    let mut config = match matches.value_of("CONFIG_FILE") {
        Some(path) => match serdeconv::from_toml_file::<DaemonConfig, _>(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("adbd: cannot load config {}: {}", path, err);
                process::exit(1);
            }
        },
        None => DaemonConfig::default(),
    };

    if let Some(port) = matches.value_of("port") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => {
                eprintln!("adbd: invalid port {}", port);
                process::exit(1);
            }
        }
    }
    if matches.is_present("no-auth") {
        config.server.auth_required = false;
    }

    let log = match &config.log {
        Some(log_config) => logging::init(log_config),
        None => logging::default_logger(),
    };
    let log = match log {
        Ok(log) => log,
        Err(err) => {
            eprintln!("adbd: cannot build logger: {}", err);
            process::exit(1);
        }
    };

    let keys = match &config.server.auth_keys_path {
        Some(path) => match KeyStore::load(path) {
            Ok(keys) => {
                logging::info!(log, "loaded trusted keys"; "count" => keys.len(), "path" => path);
                keys
            }
            Err(err) => {
                logging::warn!(log, "cannot read key file"; "path" => path, "error" => %err);
                KeyStore::new()
            }
        },
        None => KeyStore::new(),
    };

    let hooks = Collaborators {
        verifier: Box::new(hooks::RejectingVerifier),
        nonce: Box::new(hooks::RandomNonce::new()),
        reboot: Box::new(hooks::LogReboot::new(
            log.new(logging::o!("hook" => "reboot")),
        )),
        shell: Box::new(shell::PipedShell::new()),
    };

    let mut endpoint = match Endpoint::new(config.server, keys, hooks, log.clone()) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            logging::crit!(log, "cannot start endpoint"; "error" => %err);
            process::exit(1);
        }
    };

    if let Err(err) = endpoint.run() {
        logging::crit!(log, "event loop failed"; "error" => %err);
        process::exit(1);
    }
}
