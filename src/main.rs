use std::future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use ordered_multicast::config::MulticastConfig;
use ordered_multicast::membership::failure_detector::FailureDetector;
use ordered_multicast::membership::readiness::wait_for_peers;
use ordered_multicast::messaging::roster::{read_hostfile, Roster};
use ordered_multicast::messaging::transport::UdpTransport;
use ordered_multicast::multicast::service::MulticastService;
use tokio::select;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    /// file with one hostname per line, defining the group and every peer's id
    #[clap(long)]
    hostfile: PathBuf,

    /// number of messages to multicast, with payloads 1..=count
    #[clap(long, default_value_t = 0)]
    count: u32,

    /// probability of dropping an incoming record
    #[clap(long, default_value_t = 0.0)]
    drop_rate: f64,

    /// delay in milliseconds applied to some Ack / SeqAck replies
    #[clap(long, default_value_t = 0)]
    delay: u64,

    /// this process' name in the hostfile, defaults to the HOSTNAME environment variable
    #[clap(long)]
    hostname: Option<String>,

    #[clap(long, default_value_t = false)]
    no_failure_detector: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let my_hostname = match args.hostname {
        Some(h) => h,
        None => std::env::var("HOSTNAME")
            .map_err(|_| anyhow!("no --hostname given and HOSTNAME is not set"))?,
    };

    let config = Arc::new(MulticastConfig::new(args.drop_rate, Duration::from_millis(args.delay)));
    config.validate()?;

    let hostnames = read_hostfile(&args.hostfile)?;
    let roster = Arc::new(Roster::resolve(&hostnames, &my_hostname, config.multicast_port).await?);

    let probe_transport = Arc::new(UdpTransport::bind(any_addr(config.probe_port)).await?);
    let _probe_responder = wait_for_peers(probe_transport, Arc::new(roster.with_port(config.probe_port)), config.probe_interval).await?;

    let transport = Arc::new(UdpTransport::bind(any_addr(config.multicast_port)).await?);
    let service = Arc::new(MulticastService::new(config.clone(), roster.clone(), transport, Box::new(|msg| {
        info!("delivered sender={} msg_id={} payload={}", msg.sender, msg.msg_id, msg.payload);
    }))?);

    let failure_detector = if args.no_failure_detector {
        None
    }
    else {
        let heartbeat_transport = Arc::new(UdpTransport::bind(any_addr(config.heartbeat_port)).await?);
        let s = service.clone();
        Some(FailureDetector::new(config.clone(), Arc::new(roster.with_port(config.heartbeat_port)), heartbeat_transport, Box::new(move |peer| {
            let s = s.clone();
            tokio::spawn(async move { s.remove_peer(peer).await });
        })))
    };

    let multicast_all = async {
        for payload in 1..=args.count {
            service.multicast(payload).await?;
        }
        info!("multicast {} messages", args.count);
        future::pending::<anyhow::Result<()>>().await
    };

    let detect_failures = async {
        match &failure_detector {
            Some(fd) => fd.run().await,
            None => future::pending().await,
        }
    };

    select! {
        result = service.run() => result,
        result = detect_failures => result,
        result = multicast_all => result,
    }
}
