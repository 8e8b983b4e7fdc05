//! Point-to-point latency and bandwidth between two nodes.
//!
//! `latency`: ping-pong, one message in flight, half the round trip is
//! reported. `bw`: rank 0 streams a window of messages, rank 1 answers each
//! window with a 4-byte ack.
//!
//! ```text
//! aml-bench latency --local 2
//! aml-bench bw --rank 0 --peers 10.0.0.1:7000,10.0.0.2:7000
//! ```
//!
//! Sizes double from `--min-size` up to `--max-size`, stopping at the
//! largest payload both nodes can deliver to each other.

use std::cell::Cell;
use std::process;
use std::rc::Rc;
use std::time::Instant;

use aml::launch::{self, LaunchArgs, LaunchMode};
use aml::{Aml, AmlError, Conduit, MemConduit, NodeId};
use clap::{Args, Parser, Subcommand};
use tokio::task::LocalSet;

const HANDLER_ID: u32 = 250;
const LARGE_MESSAGE_SIZE: usize = 8192;
const FIELD_WIDTH: usize = 20;
const FLOAT_PRECISION: usize = 2;

#[derive(Parser, Debug)]
#[command(name = "aml-bench")]
#[command(about = "Point-to-point latency and bandwidth of the active message layer")]
struct Cli {
    #[command(subcommand)]
    test: Test,

    #[command(flatten)]
    options: BenchOptions,

    #[command(flatten)]
    launch: LaunchArgs,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Test {
    /// Ping-pong latency
    Latency,
    /// Windowed streaming bandwidth
    Bw,
}

#[derive(Args, Debug, Clone)]
struct BenchOptions {
    /// Smallest message size
    #[arg(long, default_value = "1")]
    min_size: usize,

    /// Largest message size
    #[arg(long, default_value = "1048576")]
    max_size: usize,

    /// Timed iterations for small messages
    #[arg(long, default_value = "10000")]
    iterations: usize,

    /// Warm-up iterations for small messages
    #[arg(long, default_value = "100")]
    skip: usize,

    /// Timed iterations above the large message threshold
    #[arg(long, default_value = "1000")]
    iterations_large: usize,

    /// Warm-up iterations above the large message threshold
    #[arg(long, default_value = "10")]
    skip_large: usize,

    /// Messages per bandwidth window
    #[arg(long, default_value = "64")]
    window: usize,
}

impl BenchOptions {
    fn rounds(&self, size: usize) -> (usize, usize) {
        if size > LARGE_MESSAGE_SIZE {
            (self.iterations_large, self.skip_large)
        } else {
            (self.iterations, self.skip)
        }
    }
}

/// Messages received by the benchmark handler.
///
/// The handler only counts: payloads are read in place and never copied.
#[derive(Clone, Default)]
struct Inbox {
    count: Rc<Cell<usize>>,
}

impl Inbox {
    fn record(&self) {
        self.count.set(self.count.get() + 1);
    }

    fn pending(&self) -> usize {
        self.count.get()
    }

    fn take(&self) -> usize {
        self.count.replace(0)
    }
}

/// Register the handler and agree on the largest usable size.
async fn prepare<C: Conduit>(aml: &mut Aml<C>) -> Result<(Inbox, NodeId, usize), AmlError> {
    if aml.node_count() != 2 {
        return Err(AmlError::Bootstrap {
            message: format!("this test requires exactly two nodes, got {}", aml.node_count()),
        });
    }

    let inbox = Inbox::default();
    let sink = inbox.clone();
    aml.register_handler(HANDLER_ID, move |_from: NodeId, _payload: &[u8]| sink.record())
        .await?;

    let peer = NodeId::new(1 - aml.self_id().get());
    let inline = aml.config().max_medium - 1;
    let own_limit = inline.max(aml.slice_size(peer).unwrap_or(0));
    let limit = aml.all_min(own_limit as i64).await?;
    Ok((inbox, peer, limit.max(0) as usize))
}

fn sizes(options: &BenchOptions, limit: usize) -> impl Iterator<Item = usize> {
    let max = options.max_size.min(limit);
    std::iter::successors(Some(options.min_size.max(1)), |size| size.checked_mul(2))
        .take_while(move |size| *size <= max)
}

async fn latency<C: Conduit>(mut aml: Aml<C>, options: BenchOptions) -> Result<(), AmlError> {
    let (inbox, peer, limit) = prepare(&mut aml).await?;
    let leader = aml.self_id().index() == 0;
    if leader {
        println!("{:<10}{:>FIELD_WIDTH$}", "# Size", "Latency (us)");
    }

    for size in sizes(&options, limit) {
        let message = vec![b'a'; size];
        let (iterations, skip) = options.rounds(size);
        aml.barrier().await?;

        let mut started = Instant::now();
        for i in 0..iterations + skip {
            if i == skip {
                started = Instant::now();
            }
            if leader {
                aml.send(&message, HANDLER_ID, peer).await?;
                aml.wait_until(|| inbox.pending() == 1).await?;
                inbox.take();
            } else {
                aml.wait_until(|| inbox.pending() == 1).await?;
                inbox.take();
                aml.send(&message, HANDLER_ID, peer).await?;
            }
        }

        if leader {
            let elapsed = started.elapsed().as_secs_f64();
            let latency = elapsed * 1e6 / (2.0 * iterations.max(1) as f64);
            println!("{size:<10}{latency:>FIELD_WIDTH$.FLOAT_PRECISION$}");
        }
    }

    aml.finalize().await
}

async fn bandwidth<C: Conduit>(mut aml: Aml<C>, options: BenchOptions) -> Result<(), AmlError> {
    let (inbox, peer, limit) = prepare(&mut aml).await?;
    let leader = aml.self_id().index() == 0;
    let window = options.window.max(1);
    if leader {
        println!("{:<10}{:>FIELD_WIDTH$}", "# Size", "Bandwidth (MB/s)");
    }

    for size in sizes(&options, limit) {
        let message = vec![b'a'; size];
        let (iterations, skip) = options.rounds(size);
        aml.barrier().await?;

        let mut started = Instant::now();
        for i in 0..iterations + skip {
            if i == skip {
                started = Instant::now();
            }
            if leader {
                for _ in 0..window {
                    aml.send(&message, HANDLER_ID, peer).await?;
                }
                aml.wait_until(|| inbox.pending() == 1).await?;
                inbox.take();
            } else {
                aml.wait_until(|| inbox.pending() == window).await?;
                inbox.take();
                aml.send(&message[..4.min(size)], HANDLER_ID, peer).await?;
            }
        }

        if leader {
            let elapsed = started.elapsed().as_secs_f64();
            let megabytes = size as f64 / 1e6 * iterations as f64 * window as f64;
            println!("{size:<10}{:>FIELD_WIDTH$.FLOAT_PRECISION$}", megabytes / elapsed);
        }
    }

    aml.finalize().await
}

fn run(cli: Cli) -> Result<(), AmlError> {
    let runtime = launch::local_runtime()?;
    let Cli {
        test,
        options,
        launch: args,
    } = cli;

    match args.mode()? {
        LaunchMode::Local { nodes } => {
            let config = args.config()?;
            let results = match test {
                Test::Latency => runtime.block_on(launch::run_local_group(
                    nodes,
                    config,
                    move |aml: Aml<MemConduit>| latency(aml, options.clone()),
                )),
                Test::Bw => runtime.block_on(launch::run_local_group(
                    nodes,
                    config,
                    move |aml: Aml<MemConduit>| bandwidth(aml, options.clone()),
                )),
            };
            results.into_iter().collect::<Result<Vec<()>, _>>()?;
            Ok(())
        }
        LaunchMode::Tcp { .. } => runtime.block_on(LocalSet::new().run_until(async {
            let aml = launch::connect(&args).await?;
            match test {
                Test::Latency => latency(aml, options).await,
                Test::Bw => bandwidth(aml, options).await,
            }
        })),
    }
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("aml-bench: {err}");
        process::exit(1);
    }
}
