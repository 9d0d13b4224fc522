use log::debug;
use structopt::StructOpt;
use worker::config::Options;

fn main() {
    let options = Options::from_args();

    env_logger::Builder::from_default_env().init();
    debug!("worker options: {:?}", options);

    std::process::exit(worker::run(options));
}
