use tracing::info;
use tracing_subscriber::filter::EnvFilter;
use std::io::Read;

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
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    init_env_filter(env_filter);

    println!("Starting StripedListener server on 127.0.0.1:7890");
    println!("Waiting for 3 connections to bond together");

    let config = ebm_socket::StripeConfig::default().with_streams(3);
    let mut listener = ebm_socket::StripedListener::bind("127.0.0.1:7890", config)?;
    let (mut stream, addr) = listener.accept()?;
    println!("Accepted connection from: {addr}");

    let mut buf = vec![0u8; 4096];
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n;
        info!("Received {n} bytes, {total} so far");
    }
    println!("Stream finished after {total} bytes");
    if let Err(e) = stream.close() {
        println!("Closing the stream failed: {e}");
    }
    Ok(())
}
