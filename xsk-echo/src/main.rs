use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use xsk_echo::{EchoLoop, RX_BATCH_SIZE, Socket, Stats, XskConfig, mmap, stats};

const STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Zero-copy AF_XDP ICMP echo responder.
///
/// Expects a kernel-side XDP program on the device to redirect traffic into
/// this socket's queue; everything redirected is answered in place.
#[derive(Parser, Debug)]
#[command(name = "xsk-echo", version, about)]
struct Args {
    /// Network device to bind to
    #[arg(short, long)]
    dev: String,

    /// Interface receive queue to bind
    #[arg(short = 'Q', long, default_value_t = 0)]
    queue: u32,

    /// Wait for packets with poll() instead of spinning
    #[arg(short, long)]
    poll_mode: bool,

    /// Force copy mode
    #[arg(short, long, conflicts_with = "zero_copy")]
    copy: bool,

    /// Force zero-copy mode
    #[arg(short, long)]
    zero_copy: bool,

    /// Maximum descriptors consumed per loop iteration
    #[arg(short, long, default_value_t = RX_BATCH_SIZE)]
    batch_size: usize,

    /// Suppress the periodic statistics report
    #[arg(short, long)]
    quiet: bool,
}

fn ifindex(dev: &str) -> anyhow::Result<u32> {
    let name = std::ffi::CString::new(dev)?;
    let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if idx == 0 {
        anyhow::bail!(
            "unknown device {dev:?}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(idx)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let if_index = ifindex(&args.dev)?;
    mmap::allow_unlimited_memlock().context("failed to lift RLIMIT_MEMLOCK")?;

    let config = XskConfig {
        zero_copy: if args.zero_copy {
            Some(true)
        } else if args.copy {
            Some(false)
        } else {
            None
        },
        huge_page: None,
        need_wakeup: None,
    };
    let socket = Socket::new(if_index, args.queue, config)
        .with_context(|| format!("failed to open AF_XDP socket on {}", args.dev))?;
    log::info!("AF_XDP socket bound to {} queue {}", args.dev, args.queue);

    let counters = Arc::new(Stats::new());
    let token = CancellationToken::new();

    let reporter = (!args.quiet).then(|| {
        tokio::spawn(stats::report_loop(
            counters.clone(),
            STATS_INTERVAL,
            token.clone(),
        ))
    });

    let mut echo = EchoLoop::new(socket, counters, args.batch_size, args.poll_mode)
        .context("failed to prime the fill ring")?;
    let loop_token = token.clone();
    let mut io_loop = tokio::task::spawn_blocking(move || echo.run(loop_token));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to wait for interrupt")?;
            log::info!("interrupt received, shutting down");
            token.cancel();
            (&mut io_loop).await.context("I/O loop panicked")??;
        }
        res = &mut io_loop => {
            token.cancel();
            res.context("I/O loop panicked")??;
        }
    }

    if let Some(reporter) = reporter {
        reporter.await.ok();
    }

    println!("Detached from device {}, exiting", args.dev);
    Ok(())
}
