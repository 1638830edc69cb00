mod output;
mod radio;
mod sim;
mod topology;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use topology::Topology;

#[derive(Parser)]
#[command(name = "sos-sim", about = "Drive simulated SOS relay meshes in one process")]
struct Cli {
    /// Probability that a single radio frame is lost.
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// RNG seed for loss, link quality and layouts.
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Give up waiting for deliveries after this many seconds.
    #[arg(long, default_value = "10")]
    duration: u64,

    /// Hop budget for injected messages.
    #[arg(long, default_value = "8")]
    ttl: u8,

    /// Directory for the JSONL event log (stdout only when omitted).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One SOS from the first device of a chain; the last one is online.
    Line {
        #[arg(long, default_value = "6")]
        nodes: usize,
    },

    /// SOS from a grid corner; optionally the opposite corner is online.
    Grid {
        #[arg(long, default_value = "4")]
        width: usize,
        #[arg(long, default_value = "4")]
        height: usize,
        /// Give the far corner internet access.
        #[arg(long)]
        gateway: bool,
    },

    /// Many SOS messages from random devices in a random layout.
    Storm {
        #[arg(long, default_value = "30")]
        nodes: usize,
        #[arg(long, default_value = "20")]
        messages: usize,
        /// Radio range on the unit square.
        #[arg(long, default_value = "0.25")]
        range: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    eprintln!("sos-sim v{}", env!("CARGO_PKG_VERSION"));

    let (scenario, topology, messages, origin, gateway) = match cli.command {
        Command::Line { nodes } => {
            let gw = Some(nodes.saturating_sub(1));
            ("line", Topology::line(nodes), 1, Some(0), gw)
        }
        Command::Grid {
            width,
            height,
            gateway,
        } => {
            let far = (width * height).saturating_sub(1);
            let gw = gateway.then_some(far);
            ("grid", Topology::grid(width, height), 1, Some(0), gw)
        }
        Command::Storm {
            nodes,
            messages,
            range,
        } => (
            "storm",
            Topology::scatter(nodes, range, cli.seed),
            messages,
            None,
            None,
        ),
    };

    if let Some(dir) = &cli.output_dir {
        let path = output::resolve_jsonl_path(dir, scenario)?;
        output::init_jsonl_writer(&path)?;
        eprintln!("JSONL output: {}", path.display());
    }

    let summary = sim::run(sim::SimConfig {
        scenario: scenario.to_string(),
        topology,
        ttl: cli.ttl,
        loss: cli.loss,
        seed: cli.seed,
        duration: Duration::from_secs(cli.duration),
        messages,
        origin,
        gateway,
    })
    .await?;

    output::emit(&summary);
    eprintln!();
    eprintln!(
        "{}: {}/{} deliveries ({:.1}%), max {} hops, {} frames ({} lost), {} duplicates",
        summary.scenario,
        summary.deliveries,
        summary.expected_deliveries,
        summary.delivery_ratio * 100.0,
        summary.max_hops,
        summary.frames_sent,
        summary.frames_lost,
        summary.duplicates,
    );
    Ok(())
}
