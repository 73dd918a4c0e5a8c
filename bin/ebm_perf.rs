use clap::Parser;
use ebm_socket::{Distribution, StripeConfig};
use std::{io::Read, io::Write, time::{Duration, Instant}};
use tracing_subscriber::filter::EnvFilter;

fn run_client_mode(args: Args, config: StripeConfig) -> ebm_socket::Result<()> {

    let mut stream = ebm_socket::connect(args.addr.as_str(), &config)?;
    println!("Connected successfully to {} over {} streams", args.addr, stream.streams());

    let mut buf = vec![0u8; args.size];
    buf.fill(42);

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        stream.write_all(&buf)?;
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }
    stream.close()?;
    println!("Transfer finished");
    Ok(())
}

fn run_server_mode(args: Args, config: StripeConfig) -> ebm_socket::Result<()> {

    let mut listener = ebm_socket::StripedListener::bind(args.addr.as_str(), config)?;
    let mut sid = 0;
    loop {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                println!("Accepted {} streams from: {addr}", stream.streams());
                let mut buf = vec![0u8; args.size];
                let mut start = Instant::now();
                let mut total_recv = 0;
                let sampling_period = Duration::from_secs(args.period);
                let cid = sid;
                sid += 1;
                std::thread::spawn(move || {
                    loop {
                        let n = match stream.read(&mut buf) {
                            Ok(n) => n,
                            Err(e) => {
                                println!("[{cid}]: transfer failed: {e}");
                                break;
                            }
                        };
                        if n == 0 {
                            println!("[{cid}]: stream finished by remote party");
                            break;
                        }
                        total_recv += n;
                        let delta = start.elapsed();
                        if delta >= sampling_period {
                            let throughput = ((total_recv * 8) as f32 / delta.as_secs_f32()) / (10u64.pow(6) as f32);
                            println!("[{cid}]: {throughput} Mbps");
                            start = Instant::now();
                            total_recv = 0;
                        }
                    }
                    let _ = stream.close();
                });
            }
            Err(e) => println!("Failed to accept connection: {e}"),
        }
    }
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> ebm_socket::Result<()> {

    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    let config = StripeConfig::default()
        .with_streams(args.bond)
        .with_max_segment_len(args.segment)
        .with_distribution(if args.first_available {
            Distribution::FirstAvailable
        } else {
            Distribution::RoundRobin
        });
    config.validate()?;

    if args.client {
        run_client_mode(args, config)
    } else {
        run_server_mode(args, config)
    }
}

/// The throughput benchmark for striped extended block mode streams
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Set the client mode for the application
    #[arg(short, long)]
    client: bool,
    /// The address <ip:port> to listen or connect, depending on the mode.
    #[arg(short, long)]
    addr: String,
    /// The read/write buffer size
    #[arg(short, long)]
    size: usize,
    /// The number of parallel streams the server asks for
    #[arg(short, long, default_value = "4")]
    bond: u8,
    /// The maximum segment payload length
    #[arg(long, default_value_t = ebm_socket::config::FRAGMENT_SIZE)]
    segment: usize,
    /// Hand segments to the first free stream instead of round-robin
    #[arg(short, long)]
    first_available: bool,
    /// The sampling period in seconds
    #[arg(short, long, default_value = "1")]
    period: u64,
    /// Stop the client after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,
}
