//! List the serial ports that answer as compatible stage controllers,
//! and show which one a connection attempt would pick.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use microstage::config::Settings;
use microstage::stage::probe;

#[derive(Parser)]
#[command(name = "stage-probe", about = "Discover connected stage controllers")]
struct Args {
    /// Settings file (TOML); built-in defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Probe only this port instead of enumerating the system.
    #[arg(short, long)]
    port: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        settings.probe.ports = vec![port];
    }

    let hits = probe::scan_ports(&settings.probe).await;
    if hits.is_empty() {
        println!("no responding controllers found");
        return Ok(());
    }

    for hit in &hits {
        println!(
            "{} @ {}: {} (machine: {}, uuid: {})",
            hit.port,
            hit.baud,
            hit.identity.firmware_name,
            hit.identity.machine_name.as_deref().unwrap_or("-"),
            hit.identity.machine_uuid.as_deref().unwrap_or("-"),
        );
    }

    match probe::select(&hits, &settings.probe) {
        Ok(chosen) => println!("would connect to {} @ {}", chosen.port, chosen.baud),
        Err(e) => println!("no usable selection: {e}"),
    }
    Ok(())
}
