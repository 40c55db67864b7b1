use std::path::PathBuf;

use aqueduct::{DriverContext, MediaDriver, ThreadingMode};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aqueductmd", about = "aqueduct media driver")]
struct Args {
    /// Driver directory holding the control file and log buffers.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Threading mode: dedicated, shared-network or shared.
    #[arg(long, default_value = "dedicated")]
    threading_mode: String,

    /// Remove a stale driver directory before starting.
    #[arg(long)]
    delete_dir_on_start: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut context = DriverContext::from_env();
    if let Some(dir) = args.dir {
        context.dir = dir;
    }
    context.threading_mode = match args.threading_mode.as_str() {
        "dedicated" => ThreadingMode::Dedicated,
        "shared-network" => ThreadingMode::SharedNetwork,
        "shared" => ThreadingMode::Shared,
        other => {
            eprintln!("unknown threading mode: {other}");
            std::process::exit(1);
        }
    };
    if args.delete_dir_on_start {
        context.dir_delete_on_start = true;
    }

    match MediaDriver::launch(context) {
        Ok(driver) => driver.run_until_signalled(),
        Err(e) => {
            eprintln!("couldn't launch media driver: {e}");
            std::process::exit(1);
        }
    }
}
