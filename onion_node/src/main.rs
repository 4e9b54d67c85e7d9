#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

mod directory_server;
mod keys;
mod node_config;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Error};
use futures::Future;
use itertools::Itertools;
use tokio::net::TcpListener;
use tokio::runtime;
#[cfg(unix)]
use syslog::Facility;

use onion::core::circuit::CircuitBuilder;
use onion::core::client::OnionClient;
use onion::core::directory::{HttpDirectory, MemoryDirectory, NodeDirectory};
use onion::core::relay::*;
use onion::crypto::SecretKey;
use onion::packet::{NodeDescriptor, Role};

use crate::keys::*;
use crate::node_config::*;

/// Shortest allowed interval between registrations.
const MIN_REGISTER_INTERVAL: Duration = Duration::from_secs(1);

/// Run a future with the runtime specified by config.
fn run<F>(future: F, threads: Threads) -> Result<(), Error>
    where F: Future<Output = Result<(), Error>>
{
    let runtime = if threads == Threads::N(1) {
        runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create runtime")?
    } else {
        let mut builder = runtime::Builder::new_multi_thread();
        match threads {
            Threads::N(n) => { builder.worker_threads(n as usize); },
            Threads::Auto => { }, // builder will detect number of cores automatically
        }
        builder
            .enable_all()
            .build()
            .context("Failed to create runtime")?
    };
    runtime.block_on(future)
}

fn init_logger(log_type: LogType) -> Result<(), Error> {
    match log_type {
        LogType::Stderr => {
            let env = env_logger::Env::default()
                .filter_or("RUST_LOG", "info");
            env_logger::Builder::from_env(env)
                .init();
        },
        LogType::Stdout => {
            let env = env_logger::Env::default()
                .filter_or("RUST_LOG", "info");
            env_logger::Builder::from_env(env)
                .target(env_logger::fmt::Target::Stdout)
                .init();
        },
        #[cfg(unix)]
        LogType::Syslog => {
            syslog::init(Facility::LOG_USER, log::LevelFilter::Info, None)
                .map_err(|e| anyhow!("Failed to initialize syslog backend: {}", e))?;
        },
        LogType::None => { },
    }
    Ok(())
}

/// Role specific part of the relay engine.
fn behavior(config: &NodeConfig) -> Result<Box<dyn RelayBehavior>, Error> {
    Ok(match config.role {
        Role::Guard => Box::new(GuardRelay),
        Role::Middle => Box::new(MiddleRelay),
        Role::Exit => {
            let operation = HttpOperation::new()
                .context("Failed to create HTTP client")?;
            Box::new(ExitRelay::new(Box::new(operation))
                .with_timeout(Duration::from_secs(config.exit_timeout)))
        },
    })
}

/// Register the node now and then every `interval` so it stays inside the
/// freshness window of the directory.
async fn run_registration(directory: HttpDirectory, descriptor: NodeDescriptor, interval: Duration) -> Result<(), Error> {
    let mut wakeups = tokio::time::interval(interval.max(MIN_REGISTER_INTERVAL));
    loop {
        wakeups.tick().await;

        match directory.register(descriptor.clone()).await {
            Ok(()) => debug!("Registered with the directory {}", directory.base_url()),
            Err(e) => warn!("Failed to register with the directory {}: {}", directory.base_url(), e),
        }
    }
}

async fn run_relay(config: NodeConfig, sk: SecretKey) -> Result<(), Error> {
    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {}", config.address))?;
    let address = match config.public_address {
        Some(address) => address,
        None => listener.local_addr()?,
    };

    let pk = sk.public_key();
    let node = RelayNode::new(node_id(&pk), sk, behavior(&config)?)
        .with_config(config.relay_config());

    let mut descriptor = node.descriptor(address);
    descriptor.weight = config.weight;
    if descriptor.weight == 0 {
        warn!("Weight is 0, the node will never be selected for circuits");
    }

    let directory = HttpDirectory::new(&config.directory)?;

    info!("Running {} relay {} on {}", node.role(), node.id(), config.address);

    let relay_future = async {
        node.run(listener).await.map_err(Error::from)
    };
    let registration_future = run_registration(directory, descriptor, Duration::from_secs(config.register_interval));

    futures::try_join!(relay_future, registration_future)?;

    Ok(())
}

async fn run_request(config: RequestConfig) -> Result<(), Error> {
    let directory = HttpDirectory::new(&config.directory)?;
    let builder = CircuitBuilder::new(Arc::new(directory))
        .with_path_length(config.path_length);
    let client = OnionClient::new(builder);

    let circuit = client.create_circuit().await?;
    info!(
        "Built circuit {} through {}",
        circuit.id,
        circuit.nodes.iter().map(|node| format!("{} {}", node.role, node.address)).format(", ")
    );

    let result = client.send(circuit.id, config.request).await;
    client.destroy_circuit(circuit.id).await;
    let response = result?;

    info!("Got response with status {} and {} bytes of body", response.status, response.body.len());
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", response.status)?;
    stdout.write_all(&response.body)?;
    stdout.flush()?;

    Ok(())
}

fn main() -> Result<(), Error> {
    let config = match cli_parse()? {
        Mode::DerivePk(pk) => {
            println!("{}", hex::encode(pk.as_bytes()));
            return Ok(())
        },
        Mode::Directory(config) => {
            init_logger(config.log_type)?;
            let directory = MemoryDirectory::new(config.freshness);
            return run(directory_server::run(config.address, directory), config.threads)
        },
        Mode::Request(config) => {
            init_logger(config.log_type)?;
            return run(run_request(config), Threads::N(1))
        },
        Mode::Relay(config) => config,
    };

    init_logger(config.log_type)?;

    info!("Starting onion-node with onion {}", onion::crate_version());

    for key in config.unused.keys() {
        warn!("Unused configuration key: {:?}", key);
    }

    let sk = if let Some(ref sk) = config.sk {
        sk.clone()
    } else if let Some(ref keys_file) = config.keys_file {
        load_or_gen_keys(keys_file)?.1
    } else {
        return Err(anyhow!("Neither secret key nor keys file is specified"))
    };

    if config.sk_passed_as_arg {
        warn!("You should not pass the secret key via arguments due to \
               security reasons. Use the environment variable instead");
    }

    info!("Public key: {}", hex::encode(sk.public_key().as_bytes()));

    let threads = config.threads;
    run(run_relay(config, sk), threads)
}
