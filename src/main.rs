use bpsense::{bpsense_exec, DataSetParams};
use clap::Parser;
use log::error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let ds_params = DataSetParams::parse();
    if let Err(e) = bpsense_exec(&ds_params) {
        error!("{}", e);
        std::process::exit(1);
    }
}
