use std::{collections::HashMap, fs::read_to_string, str::FromStr, time::Duration};

use anyhow::{Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};

use codec::{NetworkId, identity::Identity};
use overlay::tracker::TrackerConfiguration;

/// Environment variable overriding the advertised external address, for
/// nodes behind NAT.
pub const EXTERNAL_ADDRESS_ENV: &str = "MUDDLE_EXTERNAL";

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Node {
    ///
    /// network id
    ///
    /// Exactly 4 ASCII characters naming the overlay this node belongs
    /// to. Packets tagged with any other network id are dropped at
    /// ingress, so nodes of different deployments can share hosts and
    /// ports without ever mixing traffic.
    ///
    #[serde(default = "Node::network")]
    pub network: String,
    ///
    /// secret key
    ///
    /// Hex-encoded 32-byte seed of the node identity. The node address is
    /// the public half of this key; omitting it generates a fresh
    /// identity (and thus a fresh address) on every start.
    ///
    pub secret_key: Option<String>,
    ///
    /// listen ports
    ///
    /// TCP ports to accept overlay connections on. Zero picks a random
    /// free port.
    ///
    #[serde(default = "Node::listen_ports")]
    pub listen_ports: Vec<u16>,
    ///
    /// external address
    ///
    /// The address advertised to peers in the handshake. The
    /// MUDDLE_EXTERNAL environment variable takes precedence; with
    /// neither set, loopback is assumed.
    ///
    #[serde(default)]
    pub external_address: Option<String>,
    ///
    /// port mapping
    ///
    /// Advertise a listening port as a different external port, for
    /// setups where a gateway remaps ports.
    ///
    #[serde(default)]
    pub port_mapping: HashMap<String, u16>,
    ///
    /// initial peers
    ///
    /// Uris dialed at startup and held open indefinitely.
    ///
    #[serde(default)]
    pub peers: Vec<String>,
    ///
    /// peer table file
    ///
    /// Cache file the kademlia peer table is persisted to; loaded on
    /// start so a rebooted node can rejoin without fresh bootstrap peers.
    ///
    #[serde(default)]
    pub peer_table_file: Option<String>,
}

impl Node {
    fn network() -> String {
        "MUDL".to_string()
    }

    fn listen_ports() -> Vec<u16> {
        vec![1337]
    }
}

impl Default for Node {
    fn default() -> Self {
        Self {
            network: Self::network(),
            secret_key: None,
            listen_ports: Self::listen_ports(),
            external_address: None,
            port_mapping: HashMap::new(),
            peers: Vec::new(),
            peer_table_file: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tracker {
    ///
    /// Target steady-state count of structured outgoing links chosen
    /// from the kademlia table. Zero disables automatic connectivity.
    ///
    #[serde(default = "Tracker::max_kademlia_connections")]
    pub max_kademlia_connections: usize,
    ///
    /// Additional random long-range links maintained on top of the
    /// structured ones.
    ///
    #[serde(default = "Tracker::max_longrange_connections")]
    pub max_longrange_connections: usize,
    ///
    /// Collapse simultaneous dials between two peers down to a single
    /// link.
    ///
    #[serde(default = "Tracker::enabled")]
    pub disconnect_duplicates: bool,
    ///
    /// Close connections this node accidentally makes to its own
    /// listening port.
    ///
    #[serde(default = "Tracker::enabled")]
    pub disconnect_from_self: bool,
    ///
    /// Seconds before a cached peer manifest is considered stale and
    /// re-queried.
    ///
    #[serde(default = "Tracker::manifest_ttl")]
    pub manifest_ttl: u64,
    ///
    /// Maintenance ticks between peer-table dumps to disk.
    ///
    #[serde(default = "Tracker::persist_interval")]
    pub persist_interval: u32,
}

impl Tracker {
    fn max_kademlia_connections() -> usize {
        8
    }

    fn max_longrange_connections() -> usize {
        2
    }

    fn enabled() -> bool {
        true
    }

    fn manifest_ttl() -> u64 {
        60
    }

    fn persist_interval() -> u32 {
        20
    }

    pub fn to_configuration(&self) -> TrackerConfiguration {
        TrackerConfiguration {
            max_kademlia_connections: self.max_kademlia_connections,
            max_longrange_connections: self.max_longrange_connections,
            disconnect_duplicates: self.disconnect_duplicates,
            disconnect_from_self: self.disconnect_from_self,
            manifest_ttl: Duration::from_secs(self.manifest_ttl),
            persist_interval: self.persist_interval,
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            max_kademlia_connections: Self::max_kademlia_connections(),
            max_longrange_connections: Self::max_longrange_connections(),
            disconnect_duplicates: Self::enabled(),
            disconnect_from_self: Self::enabled(),
            manifest_ttl: Self::manifest_ttl(),
            persist_interval: Self::persist_interval(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Runtime {
    ///
    /// Maximum number of threads the I/O pool can use.
    ///
    #[serde(default = "Runtime::max_threads")]
    pub max_threads: usize,
}

impl Runtime {
    fn max_threads() -> usize {
        num_cpus::get()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            max_threads: Self::max_threads(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub tracker: Tracker,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: muddle-node --config /etc/muddle/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(
            &Cli::parse().config,
        )?)?)
    }

    /// The 4-byte network id this node runs on.
    pub fn network_id(&self) -> Result<NetworkId> {
        let bytes = self.node.network.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|byte| byte.is_ascii()) {
            bail!("network id must be exactly 4 ascii characters: {}", self.node.network);
        }

        Ok(NetworkId::new([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// The node identity: from the configured seed, or freshly generated.
    pub fn identity(&self) -> Result<Identity> {
        let Some(hex) = &self.node.secret_key else {
            return Ok(Identity::generate());
        };

        if hex.len() != 64 {
            bail!("secret key must be 64 hex characters");
        }

        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| anyhow::anyhow!("secret key is not valid hex"))?;
        }

        Ok(Identity::from_seed(&seed))
    }

    /// Listening port to advertised external port. Toml table keys are
    /// strings; non-numeric ones are rejected here.
    pub fn port_mapping(&self) -> Result<HashMap<u16, u16>> {
        let mut mapping = HashMap::new();
        for (listen, external) in &self.node.port_mapping {
            let listen: u16 = listen
                .parse()
                .map_err(|_| anyhow::anyhow!("bad port in port-mapping: {listen}"))?;
            mapping.insert(listen, *external);
        }

        Ok(mapping)
    }

    /// The address advertised to peers, in precedence order: environment
    /// override, configured value, loopback.
    pub fn external_address(&self) -> String {
        std::env::var(EXTERNAL_ADDRESS_ENV)
            .ok()
            .or_else(|| self.node.external_address.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }
}
