//! End-to-end exchanges on in-process groups.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use aml::launch::run_local_group;
use aml::{AmlConfig, AmlError, NodeId};

use crate::common::{init_tracing, pattern, Recorder};

#[tokio::test]
async fn test_neighbour_value_stored_once() {
    init_tracing();

    let results = run_local_group(2, AmlConfig::local(), |mut aml| async move {
        let stored = Rc::new(RefCell::new(Vec::new()));
        let slot = stored.clone();
        aml.register_handler(4, move |_from: NodeId, payload: &[u8]| {
            if let Ok(bytes) = <[u8; 8]>::try_from(payload) {
                slot.borrow_mut().push(f64::from_le_bytes(bytes));
            }
        })
        .await?;

        let me = aml.self_id();
        if me == NodeId::new(0) {
            let value = me.get() as f64 * 10.0;
            aml.send(&value.to_le_bytes(), 4, NodeId::new(1)).await?;
        }
        aml.barrier().await?;
        aml.finalize().await?;
        Ok::<_, AmlError>(stored.take())
    })
    .await;

    let mut results = results.into_iter();
    assert!(results.next().expect("node 0").expect("ok").is_empty());
    assert_eq!(results.next().expect("node 1").expect("ok"), vec![0.0]);
}

#[tokio::test]
async fn test_reductions_over_node_ids() {
    init_tracing();

    for nodes in [1, 2, 5] {
        let results = run_local_group(nodes, AmlConfig::local(), |mut aml| async move {
            let id = aml.self_id().get() as i64;
            let sum = aml.all_sum(id).await?;
            let min = aml.all_min(id).await?;
            let max = aml.all_max(id).await?;
            aml.finalize().await?;
            Ok::<_, AmlError>((sum, min, max))
        })
        .await;

        let n = nodes as i64;
        for result in results {
            assert_eq!(result.expect("node succeeded"), (n * (n - 1) / 2, 0, n - 1));
        }
    }
}

#[tokio::test]
async fn test_reductions_interleave_with_traffic() {
    init_tracing();

    let results = run_local_group(3, AmlConfig::local(), |mut aml| async move {
        let received = Rc::new(Cell::new(0i64));
        let total = received.clone();
        aml.register_handler(40, move |_from: NodeId, payload: &[u8]| {
            if let Ok(bytes) = <[u8; 8]>::try_from(payload) {
                total.set(total.get() + i64::from_le_bytes(bytes));
            }
        })
        .await?;

        // Everyone sends its id + 1 to node 0, then the group checks the
        // sum node 0 saw against the sum of what was sent.
        let me = aml.self_id();
        let value = me.get() as i64 + 1;
        if me != NodeId::new(0) {
            aml.send(&value.to_le_bytes(), 40, NodeId::new(0)).await?;
        }
        let sent = aml.all_sum(if me == NodeId::new(0) { 0 } else { value }).await?;
        aml.barrier().await?;
        let seen = aml.all_max(received.get()).await?;
        aml.finalize().await?;
        Ok::<_, AmlError>((sent, seen))
    })
    .await;

    for result in results {
        assert_eq!(result.expect("node succeeded"), (5, 5));
    }
}

#[tokio::test]
async fn test_ring_exchange_across_tiers() {
    init_tracing();
    let config = AmlConfig::local();
    let sizes = [0, 17, config.max_medium - 1, config.max_medium, 8 * config.max_medium];
    let nodes = 4;

    let results = run_local_group(nodes, config, move |mut aml| async move {
        let recorder = Recorder::default();
        aml.register_handler(77, recorder.handler()).await?;

        let me = aml.self_id().get();
        let right = NodeId::new((me + 1) % nodes as u32);
        for (round, len) in sizes.iter().enumerate() {
            aml.send(&pattern(*len, (me as usize * 16 + round) as u8), 77, right)
                .await?;
        }
        aml.barrier().await?;
        aml.finalize().await?;
        Ok::<_, AmlError>(recorder.messages())
    })
    .await;

    for (rank, result) in results.into_iter().enumerate() {
        let left = (rank + nodes - 1) % nodes;
        let messages = result.expect("node succeeded");
        assert_eq!(messages.len(), sizes.len());
        for (round, (from, payload)) in messages.into_iter().enumerate() {
            assert_eq!(from, NodeId::new(left as u32));
            assert_eq!(payload, pattern(sizes[round], (left * 16 + round) as u8));
        }
    }
}

#[tokio::test]
async fn test_wait_until_returns_after_handler_runs() {
    init_tracing();

    let results = run_local_group(2, AmlConfig::local(), |mut aml| async move {
        let pings = Rc::new(Cell::new(0u32));
        let counter = pings.clone();
        aml.register_handler(1, move |_from: NodeId, _payload: &[u8]| {
            counter.set(counter.get() + 1);
        })
        .await?;

        let peer = NodeId::new(1 - aml.self_id().get());
        for round in 1..=10 {
            if aml.self_id() == NodeId::new(0) {
                aml.send(&[], 1, peer).await?;
                aml.wait_until(|| pings.get() == round).await?;
            } else {
                aml.wait_until(|| pings.get() == round).await?;
                aml.send(&[], 1, peer).await?;
            }
        }
        aml.finalize().await?;
        Ok::<_, AmlError>(pings.get())
    })
    .await;

    for result in results {
        assert_eq!(result.expect("node succeeded"), 10);
    }
}

#[tokio::test]
async fn test_messages_sent_before_finalize_are_dispatched() {
    init_tracing();
    let config = AmlConfig::local();
    let len = 3 * config.max_medium;

    let results = run_local_group(3, config, move |mut aml| async move {
        let recorder = Recorder::default();
        aml.register_handler(200, recorder.handler()).await?;
        let me = aml.self_id();
        if me != NodeId::new(2) {
            aml.send(b"last words", 200, NodeId::new(2)).await?;
            aml.send(&pattern(len, me.get() as u8), 200, NodeId::new(2))
                .await?;
        }
        aml.finalize().await?;
        Ok::<_, AmlError>(recorder.len())
    })
    .await;

    let counts: Vec<usize> = results
        .into_iter()
        .map(|result| result.expect("node succeeded"))
        .collect();
    assert_eq!(counts, vec![0, 0, 4]);
}
