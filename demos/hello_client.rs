use std::time::Duration;
use std::io::Write;
use tracing_subscriber::filter::EnvFilter;
use clap::Parser;

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
    // Initialize log bridge to capture log crate messages - MUST be first!
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    println!("Starting striped client");
    let config = ebm_socket::StripeConfig::default().with_max_segment_len(args.segment);
    let mut stream = ebm_socket::connect(args.connect.as_str(), &config)?;
    println!("Connected successfully over {} streams", stream.streams());

    let mut buf = vec![0u8; args.size];

    for _ in 0..args.count {
        stream.write_all(&buf)?;
        println!("Wrote {} bytes", buf.len());
        for b in buf.iter_mut() {
            *b = b.wrapping_add(1);
        }
        std::thread::sleep(Duration::from_micros(args.period));
    }
    stream.close()
}

/// A simple client illustrating the use of striped streams.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The server address to connect to in the formant <ip:port>
    #[arg(short, long)]
    connect: String,
    /// The write buffer size
    #[arg(short, long)]
    size: usize,
    /// Production period in micro-sec
    #[arg(short, long)]
    period: u64,
    /// Number of buffers to send before closing
    #[arg(short = 'n', long, default_value = "16")]
    count: usize,
    /// The maximum segment payload length
    #[arg(long, default_value = "8192")]
    segment: usize,
}
