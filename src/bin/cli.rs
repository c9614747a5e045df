//! CLI for master operations

use clap::{Parser, Subcommand};
use failover::client::AdminClient;
use failover::common::parse_duration;
use failover::ServerName;

#[derive(Parser)]
#[command(name = "failover")]
#[command(about = "failover master admin CLI")]
#[command(version)]
struct Cli {
    /// Master URL
    #[arg(long, default_value = "http://localhost:7000")]
    master: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Declare a server dead and submit its crash recovery
    Expire {
        /// Server name (host,port,start_code)
        server: String,

        /// Wait for the recovery to finish (e.g. 30s, 5m)
        #[arg(long)]
        wait: Option<String>,
    },

    /// Show one server's state
    State {
        /// Server name (host,port,start_code)
        server: String,
    },

    /// List tracked servers
    Servers,

    /// Register a server join
    Register {
        /// Server name (host,port,start_code)
        server: String,

        /// Partitions served (comma-separated)
        #[arg(long, value_delimiter = ',')]
        partitions: Vec<String>,
    },

    /// Expire every tracked server that is not live
    Reconcile,

    /// List procedures
    Procedures,

    /// Show one procedure
    Procedure {
        id: u64,

        /// Wait for it to finish (e.g. 30s, 5m)
        #[arg(long)]
        wait: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = AdminClient::new(&cli.master)?;

    match cli.command {
        Commands::Expire { server, wait } => {
            let server: ServerName = server.parse()?;
            let resp = client.expire(&server).await?;
            match resp.rejected {
                Some(reason) => println!("Not submitted: {}", reason),
                None => {
                    println!("Submitted crash recovery pid={}", resp.proc_id);
                    if let Some(wait) = wait {
                        let info = client.wait(resp.proc_id, parse_duration(&wait)?).await?;
                        println!("  Status: {:?}", info.status);
                    }
                }
            }
        }

        Commands::State { server } => {
            let server: ServerName = server.parse()?;
            let node = client.server(&server).await?;
            println!("Server {}", node.name);
            println!("  State: {}", node.state);
            println!("  Since: {}", node.since);
            println!("  Partitions: {}", node.partitions.len());
            if let Some(pid) = node.recovery {
                println!("  Recovery: pid={}", pid);
            }
        }

        Commands::Servers => {
            for node in client.servers().await? {
                let recovery = node
                    .recovery
                    .map(|p| format!(" pid={}", p))
                    .unwrap_or_default();
                println!(
                    "{:<40} {:<10} partitions={}{}",
                    node.name.to_string(),
                    node.state.to_string(),
                    node.partitions.len(),
                    recovery
                );
            }
        }

        Commands::Register { server, partitions } => {
            let server: ServerName = server.parse()?;
            let reg = client.register(&server, partitions).await?;
            println!("Registered: {}", reg.registered);
            for pid in reg.expired {
                println!("  Expired older generation: pid={}", pid);
            }
        }

        Commands::Reconcile => {
            let submitted = client.reconcile().await?;
            println!("Submitted {} recoveries", submitted.len());
            for pid in submitted {
                println!("  pid={}", pid);
            }
        }

        Commands::Procedures => {
            for p in client.procedures().await? {
                println!(
                    "{:>6} {:<18} {:<18} {:<9} {}",
                    p.id,
                    p.procedure,
                    p.step,
                    format!("{:?}", p.status),
                    p.server.unwrap_or_default()
                );
            }
        }

        Commands::Procedure { id, wait } => {
            let info = match wait {
                Some(wait) => client.wait(id, parse_duration(&wait)?).await?,
                None => client.procedure(id).await?,
            };
            println!("Procedure {}", info.id);
            println!("  Type: {}", info.procedure);
            println!("  Step: {}", info.step);
            println!("  Status: {:?}", info.status);
            if let Some(server) = info.server {
                println!("  Server: {}", server);
            }
            if let Some(parent) = info.parent {
                println!("  Parent: {}", parent);
            }
            if !info.children.is_empty() {
                println!("  Children: {:?}", info.children);
            }
            if let Some(error) = info.error {
                println!("  Error: {}", error);
            }
        }
    }

    Ok(())
}
