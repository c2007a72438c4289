/*
 * toyvote is the toyvote server. It takes the unicast port as a positional
 * argument, discovers its peers over UDP multicast, takes part in leader
 * election, and serves the polling service when it holds leadership.
 */

#![warn(clippy::all)]

use toyvote::config::Config;
use toyvote::error::Result;
use toyvote::Server;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A distributed polling service server")
        .arg(clap::Arg::new("port").help("Unicast port to listen on").required(true))
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path"),
        )
        .get_matches();

    let config = Config::load(args.get_one::<String>("config").map(String::as_str))?;

    let loglevel = config.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("toyvote");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let port: u16 = args.get_one::<String>("port").expect("port is required").parse()?;
    let server = Server::new(port, config)?;
    server.serve(Arc::new(AtomicBool::new(false)))
}
