use bpsense::BpSenseParams;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// path to recon parameters file to write
    parameter_file: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match BpSenseParams::default().to_file(&args.parameter_file) {
        Ok(filename) => info!("wrote default parameter file to {}", filename.display()),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
