use crate::core::simulator::DeclaredCapacity;
use crate::domain::model::Mode;
use crate::utils::error::Result;
use crate::utils::validation::{
    validate_hex, validate_non_empty_string, validate_range, validate_server, Validate,
};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "fog-client")]
#[command(about = "Joins this node to an orchestrated fog topology")]
pub struct CliConfig {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, global = true, default_value = "./data", help = "Directory for logs, records and cached capacities")]
    pub data_dir: PathBuf,

    #[arg(long, global = true, help = "TOML file overriding the built-in Classes of Service")]
    pub cos_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Connect as client.
    Client {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Connect as resource.
    Resource {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        node: NodeArgs,
        #[command(flatten)]
        simulated: SimulatedArgs,
    },
    /// Connect as switch.
    Switch {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(short = 'd', long, help = "Bridge datapath ID (in hexadecimal)")]
        dpid: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    #[arg(short, long, help = "Server IP and API port. Format is IP:PORT")]
    pub server: String,

    #[arg(short, long, help = "Detailed output on the console")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct NodeArgs {
    #[arg(short, long, help = "Custom node ID (for simulations)")]
    pub id: Option<String>,

    #[arg(short, long, help = "Custom node label (for simulations)")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct SimulatedArgs {
    #[arg(short, long, help = "Number of simulated CPUs")]
    pub cpu: Option<f64>,

    #[arg(short, long, help = "Size of simulated RAM (in MB)")]
    pub ram: Option<f64>,

    #[arg(short, long, help = "Size of simulated disk (in GB)")]
    pub disk: Option<f64>,

    #[arg(short, long, help = "Size of simulated egress bandwidth (in Mbps)")]
    pub egress: Option<f64>,

    #[arg(short = 'n', long, help = "Size of simulated ingress bandwidth (in Mbps)")]
    pub ingress: Option<f64>,
}

impl CliConfig {
    pub fn mode(&self) -> Mode {
        match self.command {
            Command::Client { .. } => Mode::Client,
            Command::Resource { .. } => Mode::Resource,
            Command::Switch { .. } => Mode::Switch,
        }
    }

    pub fn connection(&self) -> &ConnectionArgs {
        match &self.command {
            Command::Client { connection, .. }
            | Command::Resource { connection, .. }
            | Command::Switch { connection, .. } => connection,
        }
    }

    pub fn verbose(&self) -> bool {
        self.connection().verbose
    }

    pub fn server(&self) -> Result<SocketAddr> {
        validate_server("server", &self.connection().server)
    }

    pub fn node_args(&self) -> NodeArgs {
        match &self.command {
            Command::Client { node, .. } | Command::Resource { node, .. } => node.clone(),
            Command::Switch { .. } => NodeArgs::default(),
        }
    }

    pub fn dpid(&self) -> Option<&str> {
        match &self.command {
            Command::Switch { dpid, .. } => Some(dpid),
            _ => None,
        }
    }

    pub fn declared_capacity(&self) -> DeclaredCapacity {
        match &self.command {
            Command::Resource { simulated, .. } => DeclaredCapacity {
                cpu: simulated.cpu,
                ram: simulated.ram,
                disk: simulated.disk,
            },
            _ => DeclaredCapacity::default(),
        }
    }
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        self.server()?;

        if let Some(dpid) = self.dpid() {
            validate_hex("dpid", dpid)?;
        }

        let node = self.node_args();
        if let Some(id) = &node.id {
            validate_non_empty_string("id", id)?;
        }
        if let Some(label) = &node.label {
            validate_non_empty_string("label", label)?;
        }

        // 頻寬目前只做檢查，模擬器不使用
        if let Command::Resource { simulated, .. } = &self.command {
            let values = [
                ("cpu", simulated.cpu),
                ("ram", simulated.ram),
                ("disk", simulated.disk),
                ("egress", simulated.egress),
                ("ingress", simulated.ingress),
            ];
            for (field, value) in values {
                if let Some(value) = value {
                    validate_range(field, value, 0.0, f64::MAX)?;
                }
            }
        }

        Ok(())
    }
}
