//! Smoke test for a process group.
//!
//! Every node registers handler 4, sends `rank * 10.0` to its right
//! neighbour, then the group reduces the ranks. Rank 0 prints the results.
//!
//! ```text
//! aml-smoke --local 4
//! aml-smoke --rank 0 --peers 127.0.0.1:7000,127.0.0.1:7001   # and rank 1
//! ```
//!
//! Exit code 1 on any failure.

use std::cell::Cell;
use std::process;
use std::rc::Rc;

use aml::launch::{self, LaunchArgs, LaunchMode};
use aml::{Aml, AmlError, Conduit, MemConduit, NodeId};
use clap::Parser;
use tokio::task::LocalSet;

const HANDLER_ID: u32 = 4;

async fn scenario<C: Conduit>(mut aml: Aml<C>) -> Result<(), AmlError> {
    let me = aml.self_id();
    let stored = Rc::new(Cell::new(None));
    let slot = stored.clone();
    aml.register_handler(HANDLER_ID, move |from: NodeId, payload: &[u8]| {
        match <[u8; 8]>::try_from(payload) {
            Ok(bytes) => {
                let value = f64::from_le_bytes(bytes);
                println!("value on node {me} replaced by node {from} with value {value:.6}");
                slot.set(Some(value));
            }
            Err(_) => eprintln!("node {me}: expected 8 bytes from node {from}, got {}", payload.len()),
        }
    })
    .await?;

    let value = me.get() as f64 * 10.0;
    let neighbour = NodeId::new((me.get() + 1) % aml.node_count() as u32);
    aml.send(&value.to_le_bytes(), HANDLER_ID, neighbour).await?;
    aml.barrier().await?;

    let rank = me.get() as i64;
    let sum = aml.all_sum(rank).await?;
    let max = aml.all_max(rank).await?;
    let min = aml.all_min(rank).await?;
    aml.barrier().await?;

    if me.index() == 0 {
        println!("sum of all ranks = {sum}");
        println!("min of all ranks = {min}");
        println!("max of all ranks = {max}");
    }
    if stored.get().is_none() {
        eprintln!("node {me}: no value received");
    }

    aml.finalize().await
}

fn run(args: LaunchArgs) -> Result<(), AmlError> {
    let runtime = launch::local_runtime()?;
    match args.mode()? {
        LaunchMode::Local { nodes } => {
            let config = args.config()?;
            let results =
                runtime.block_on(launch::run_local_group(nodes, config, scenario::<MemConduit>));
            results.into_iter().collect::<Result<Vec<()>, _>>()?;
            Ok(())
        }
        LaunchMode::Tcp { .. } => runtime.block_on(LocalSet::new().run_until(async {
            let aml = launch::connect(&args).await?;
            scenario(aml).await
        })),
    }
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    if let Err(err) = run(LaunchArgs::parse()) {
        eprintln!("aml-smoke: {err}");
        process::exit(1);
    }
}
