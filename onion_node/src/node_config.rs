use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use clap::{Arg, ArgMatches, Command, ValueEnum, builder::PossibleValue, parser::ValueSource, value_parser};
use config::{Config, File as CfgFile, FileFormat as CfgFileFormat};
use serde::{de, Deserialize, Deserializer};
use serde_yaml::Value;

use onion::core::circuit::DEFAULT_PATH_LENGTH;
use onion::core::directory::FRESHNESS_WINDOW;
use onion::core::relay::{RelayConfig, DEFAULT_MAX_CONNECTIONS, EXIT_TIMEOUT};
use onion::crypto::{PublicKey, SecretKey};
use onion::packet::{ExitRequest, Role};

use crate::keys::*;

/// Config for threading.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
pub enum Threads {
    /// Detect number of threads automatically by the number of CPU cores.
    Auto,
    /// Exact number of threads.
    N(u16)
}

impl FromStr for Threads {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            Ok(Threads::Auto)
        } else {
            u16::from_str(s).map(Threads::N)
        }
    }
}

/// Specifies where to write logs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
pub enum LogType {
    Stderr,
    Stdout,
    #[cfg(unix)]
    Syslog,
    None,
}

impl ValueEnum for LogType {
    fn value_variants<'a>() -> &'a [Self] {
        use self::LogType::*;
        #[cfg(unix)]
        return &[Stderr, Stdout, Syslog, None];
        #[cfg(not(unix))]
        return &[Stderr, Stdout, None];
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        use self::LogType::*;
        Some(match self {
            Stderr => PossibleValue::new("Stderr"),
            Stdout => PossibleValue::new("Stdout"),
            #[cfg(unix)]
            Syslog => PossibleValue::new("Syslog"),
            None => PossibleValue::new("None")
        })
    }
}

fn de_threads<'de, D>(deserializer: D) -> Result<Threads, D::Error> where D: Deserializer<'de> {
    let s = String::deserialize(deserializer)?;

    Threads::from_str(&s)
        .map_err(|e| de::Error::custom(format!("threads: {:?}", e)))
}

/// Config of a relay node parsed from command line arguments or a config
/// file.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// Position the node takes in circuits.
    pub role: Role,
    /// TCP address the relay listens on.
    pub address: SocketAddr,
    /// Address advertised in the directory when it differs from `address`.
    #[serde(rename = "public-address")]
    #[serde(default)]
    pub public_address: Option<SocketAddr>,
    /// Base URL of the directory server.
    pub directory: String,
    /// Seconds between registrations with the directory.
    #[serde(rename = "register-interval")]
    pub register_interval: u64,
    /// Selection weight advertised in the descriptor.
    pub weight: u32,
    /// Maximum number of inbound connections handled at once.
    #[serde(rename = "connections-limit")]
    pub connections_limit: usize,
    /// Seconds to wait for the next hop to accept a connection.
    #[serde(rename = "dial-timeout")]
    pub dial_timeout: u64,
    /// Seconds to wait for the next hop to answer.
    #[serde(rename = "response-timeout")]
    pub response_timeout: u64,
    /// Seconds the exit node gives the external operation.
    #[serde(rename = "exit-timeout")]
    pub exit_timeout: u64,
    /// Long-term secret key.
    #[serde(skip_deserializing)]
    pub sk: Option<SecretKey>,
    /// True if the SecretKey was passed as an argument instead of environment
    /// variable. Necessary to print a warning since the logger backend is not
    /// initialized when we parse arguments.
    #[serde(skip_deserializing)]
    pub sk_passed_as_arg: bool,
    /// Path to the file where keys are stored.
    /// Required with config.
    #[serde(rename = "keys-file")]
    pub keys_file: Option<String>,
    /// Number of threads for execution.
    #[serde(deserialize_with = "de_threads")]
    pub threads: Threads,
    /// Specifies where to write logs.
    #[serde(rename = "log-type")]
    pub log_type: LogType,
    /// Unused fields while parsing config file
    #[serde(flatten)]
    pub unused: HashMap<String, Value>,
}

impl NodeConfig {
    /// Timeouts and limits of the relay engine.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            dial_timeout: Duration::from_secs(self.dial_timeout),
            response_timeout: Duration::from_secs(self.response_timeout),
            max_connections: self.connections_limit,
            ..RelayConfig::default()
        }
    }
}

/// Config of a directory server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// TCP address the HTTP server listens on.
    pub address: SocketAddr,
    /// Descriptors not refreshed within this window are not listed.
    pub freshness: Duration,
    /// Number of threads for execution.
    pub threads: Threads,
    /// Specifies where to write logs.
    pub log_type: LogType,
}

/// Config of a single request sent through a fresh circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestConfig {
    /// Base URL of the directory server.
    pub directory: String,
    /// Number of hops of the circuit.
    pub path_length: usize,
    /// Request executed by the exit node.
    pub request: ExitRequest,
    /// Specifies where to write logs.
    pub log_type: LogType,
}

/// What the binary was asked to do.
#[derive(Debug)]
pub enum Mode {
    /// Run a relay node.
    Relay(NodeConfig),
    /// Run a directory server.
    Directory(DirectoryConfig),
    /// Send one request through the overlay and print the response.
    Request(RequestConfig),
    /// Print the public key.
    DerivePk(PublicKey),
}

fn create_sk_arg() -> Arg {
    Arg::new("secret-key")
        .short('s')
        .long("secret-key")
        .help("Secret key of the node. Note that you should not pass the key \
               via arguments due to security reasons. Use this argument for \
               test purposes only. In the real world use the environment \
               variable instead")
        .num_args(1)
        .conflicts_with("keys-file")
        .env("ONION_SECRET_KEY")
        .hide(true)
}

fn create_keys_file_arg() -> Arg {
    Arg::new("keys-file")
        .short('k')
        .long("keys-file")
        .help("Path to the file where keys of the node are stored")
        .num_args(1)
        .required_unless_present("secret-key")
        .conflicts_with("secret-key")
}

fn create_threads_arg() -> Arg {
    Arg::new("threads")
        .short('j')
        .long("threads")
        .help("Number of threads to use. The value 'auto' means that the \
               number of threads will be determined automatically by the \
               number of CPU cores")
        .num_args(1)
        .value_parser(value_parser!(Threads))
        .default_value("1")
}

fn create_log_type_arg() -> Arg {
    Arg::new("log-type")
        .short('l')
        .long("log-type")
        .help("Where to write logs")
        .num_args(1)
        .value_parser(value_parser!(LogType))
        .default_value("Stderr")
}

fn create_directory_url_arg() -> Arg {
    Arg::new("directory")
        .short('d')
        .long("directory")
        .help("Base URL of the directory server, e.g. http://127.0.0.1:8080")
        .num_args(1)
        .required(true)
}

fn app() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .args_conflicts_with_subcommands(true)
        .subcommand_negates_reqs(true)
        .subcommand(Command::new("config")
            .about("Run a relay node with settings from a config file")
            .arg(Arg::new("cfg-file")
                .index(1)
                .help("Load settings from saved config file. \
                    Config file format is YAML")
                .num_args(1)
                .required(true)))
        .subcommand(Command::new("derive-pk")
            .about("Derive PK from either --keys-file or from env:ONION_SECRET_KEY")
            .arg(create_sk_arg())
            .arg(create_keys_file_arg()))
        .subcommand(Command::new("directory")
            .about("Run a directory server")
            .arg(Arg::new("address")
                .short('a')
                .long("address")
                .help("TCP address to run the HTTP server on")
                .num_args(1)
                .value_parser(value_parser!(SocketAddr))
                .required(true))
            .arg(Arg::new("freshness")
                .short('f')
                .long("freshness")
                .help("Seconds a registration stays fresh")
                .num_args(1)
                .value_parser(value_parser!(u64))
                .default_value("300"))
            .arg(create_threads_arg())
            .arg(create_log_type_arg()))
        .subcommand(Command::new("request")
            .about("Send a request through a fresh circuit and print the response")
            .arg(create_directory_url_arg())
            .arg(Arg::new("path-length")
                .short('p')
                .long("path-length")
                .help("Number of hops of the circuit")
                .num_args(1)
                .value_parser(value_parser!(usize))
                .default_value("3"))
            .arg(Arg::new("body")
                .short('b')
                .long("body")
                .help("Body of the request")
                .num_args(1))
            .arg(Arg::new("method")
                .index(1)
                .help("Method of the request, e.g. GET")
                .required(true))
            .arg(Arg::new("target")
                .index(2)
                .help("Target of the request, e.g. http://example.com/")
                .required(true))
            .arg(create_log_type_arg()))
        // here go args without subcommands
        .arg(create_sk_arg())
        .arg(create_keys_file_arg())
        .arg(Arg::new("role")
            .short('r')
            .long("role")
            .help("Role of the node: guard, middle or exit")
            .num_args(1)
            .value_parser(value_parser!(Role))
            .required(true))
        .arg(Arg::new("address")
            .short('a')
            .long("address")
            .help("TCP address to run the relay on")
            .num_args(1)
            .value_parser(value_parser!(SocketAddr))
            .required(true))
        .arg(Arg::new("public-address")
            .long("public-address")
            .help("Address advertised in the directory. Defaults to --address")
            .num_args(1)
            .value_parser(value_parser!(SocketAddr)))
        .arg(create_directory_url_arg())
        .arg(Arg::new("register-interval")
            .long("register-interval")
            .help("Seconds between registrations with the directory")
            .num_args(1)
            .value_parser(value_parser!(u64))
            .default_value("60"))
        .arg(Arg::new("weight")
            .short('w')
            .long("weight")
            .help("Selection weight advertised in the directory, 0 means \
                   the node is never selected")
            .num_args(1)
            .value_parser(value_parser!(u32))
            .default_value("1"))
        .arg(Arg::new("connections-limit")
            .short('c')
            .long("connections-limit")
            .help("Maximum number of inbound connections the relay can hold")
            .num_args(1)
            .value_parser(value_parser!(usize))
            .default_value("512"))
        .arg(Arg::new("dial-timeout")
            .long("dial-timeout")
            .help("Seconds to wait for the next hop to accept a connection")
            .num_args(1)
            .value_parser(value_parser!(u64))
            .default_value("10"))
        .arg(Arg::new("response-timeout")
            .long("response-timeout")
            .help("Seconds to wait for the next hop to answer")
            .num_args(1)
            .value_parser(value_parser!(u64))
            .default_value("30"))
        .arg(Arg::new("exit-timeout")
            .long("exit-timeout")
            .help("Seconds the exit node gives the external operation")
            .num_args(1)
            .value_parser(value_parser!(u64))
            .default_value("10"))
        .arg(create_threads_arg())
        .arg(create_log_type_arg())
}

/// Parse command line arguments.
pub fn cli_parse() -> Result<Mode, Error> {
    let matches = app().get_matches();
    parse_matches(&matches)
}

fn parse_matches(matches: &ArgMatches) -> Result<Mode, Error> {
    match matches.subcommand() {
        Some(("derive-pk", m)) => run_derive_pk(m).map(Mode::DerivePk),
        Some(("config", m)) => run_config(m).map(Mode::Relay),
        Some(("directory", m)) => run_directory(m).map(Mode::Directory),
        Some(("request", m)) => Ok(Mode::Request(run_request(m))),
        _ => run_args(matches).map(Mode::Relay),
    }
}

/// Parse settings from a saved file.
fn parse_config(config_path: &str) -> Result<NodeConfig, Error> {
    let config_file = Config::builder()
        .set_default("log-type", "Stderr")?
        .set_default("threads", "1")?
        .set_default("register-interval", 60i64)?
        .set_default("weight", 1i64)?
        .set_default("connections-limit", DEFAULT_MAX_CONNECTIONS as i64)?
        .set_default("dial-timeout", 10i64)?
        .set_default("response-timeout", 30i64)?
        .set_default("exit-timeout", EXIT_TIMEOUT.as_secs() as i64)?
        .add_source(CfgFile::new(config_path, CfgFileFormat::Yaml))
        .build()
        .with_context(|| format!("Can't build config file {}", config_path))?;

    let config: NodeConfig = config_file.try_deserialize()
        .context("Can't deserialize config")?;

    if config.keys_file.is_none() {
        bail!("Can't deserialize config: 'keys-file' is not set");
    }

    Ok(config)
}

fn sk_passed_as_arg(matches: &ArgMatches) -> bool {
    matches.value_source("secret-key") == Some(ValueSource::CommandLine)
}

fn run_derive_pk(matches: &ArgMatches) -> Result<PublicKey, Error> {
    if sk_passed_as_arg(matches) {
        bail!("You should not pass the secret key via arguments due to \
               security reasons. Use the environment variable instead");
    }

    if let Some(sk) = matches.get_one::<String>("secret-key") {
        return Ok(parse_secret_key(sk)?.public_key())
    }

    match matches.get_one::<String>("keys-file") {
        Some(keys_file) => {
            let file = std::fs::File::open(keys_file)
                .context("Failed to read the keys file")?;
            let (pk, _sk) = load_keys(file)?;
            Ok(pk)
        },
        None => bail!("Neither secret key nor keys file is specified"),
    }
}

fn run_config(matches: &ArgMatches) -> Result<NodeConfig, Error> {
    let config_path = matches.get_one::<String>("cfg-file")
        .context("Config file is not specified")?;

    parse_config(config_path)
}

fn run_directory(matches: &ArgMatches) -> Result<DirectoryConfig, Error> {
    let address = *matches.get_one::<SocketAddr>("address").context("Address is not specified")?;

    let freshness = matches.get_one::<u64>("freshness").copied()
        .map(Duration::from_secs)
        .unwrap_or(FRESHNESS_WINDOW);

    let threads = matches.get_one("threads").copied().unwrap_or(Threads::N(1));

    let log_type = matches.get_one("log-type").copied().unwrap_or(LogType::Stderr);

    Ok(DirectoryConfig {
        address,
        freshness,
        threads,
        log_type,
    })
}

fn run_request(matches: &ArgMatches) -> RequestConfig {
    let directory = matches.get_one::<String>("directory").cloned().unwrap_or_default();

    let path_length = matches.get_one::<usize>("path-length").copied()
        .unwrap_or(DEFAULT_PATH_LENGTH);

    let method = matches.get_one::<String>("method").map(|m| m.to_ascii_uppercase()).unwrap_or_default();
    let target = matches.get_one::<String>("target").cloned().unwrap_or_default();
    let mut request = ExitRequest::new(&method, &target);
    if let Some(body) = matches.get_one::<String>("body") {
        request.body = body.as_bytes().to_vec();
    }

    let log_type = matches.get_one("log-type").copied().unwrap_or(LogType::Stderr);

    RequestConfig {
        directory,
        path_length,
        request,
        log_type,
    }
}

fn run_args(matches: &ArgMatches) -> Result<NodeConfig, Error> {
    let role = *matches.get_one::<Role>("role").context("Role is not specified")?;

    let address = *matches.get_one::<SocketAddr>("address").context("Address is not specified")?;

    let public_address = matches.get_one::<SocketAddr>("public-address").copied();

    let directory = matches.get_one::<String>("directory").cloned()
        .context("Directory is not specified")?;

    let register_interval = matches.get_one::<u64>("register-interval").copied().unwrap_or(60);

    let weight = matches.get_one::<u32>("weight").copied().unwrap_or(1);

    let connections_limit = matches.get_one::<usize>("connections-limit").copied()
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let dial_timeout = matches.get_one::<u64>("dial-timeout").copied().unwrap_or(10);

    let response_timeout = matches.get_one::<u64>("response-timeout").copied().unwrap_or(30);

    let exit_timeout = matches.get_one::<u64>("exit-timeout").copied()
        .unwrap_or_else(|| EXIT_TIMEOUT.as_secs());

    let sk = matches.get_one::<String>("secret-key")
        .map(|s| parse_secret_key(s))
        .transpose()?;

    let sk_passed_as_arg = sk_passed_as_arg(matches);

    let keys_file = matches.get_one("keys-file").cloned();

    let threads = matches.get_one("threads").copied().unwrap_or(Threads::N(1));

    let log_type = matches.get_one("log-type").copied().unwrap_or(LogType::Stderr);

    Ok(NodeConfig {
        role,
        address,
        public_address,
        directory,
        register_interval,
        weight,
        connections_limit,
        dial_timeout,
        response_timeout,
        exit_timeout,
        sk,
        sk_passed_as_arg,
        keys_file,
        threads,
        log_type,
        unused: HashMap::new(),
    })
}
