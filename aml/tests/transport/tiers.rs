//! Tier selection: local, control, inline and rendezvous sends.

use aml::conduit::MemFabric;
use aml::launch::run_local_group;
use aml::{Aml, AmlConfig, AmlError, NodeId, TransportMetrics};
use tokio::task::LocalSet;

use crate::common::{init_tracing, pattern, Recorder};

#[tokio::test]
async fn test_local_delivery_runs_before_send_returns() {
    init_tracing();

    let results = run_local_group(2, AmlConfig::local(), |mut aml| async move {
        let recorder = Recorder::default();
        aml.register_handler(6, recorder.handler()).await?;
        let me = aml.self_id();

        aml.send(&[], 6, me).await?;
        assert_eq!(recorder.len(), 1);
        aml.send(b"to myself", 6, me).await?;
        assert_eq!(recorder.len(), 2);

        let metrics = aml.metrics().clone();
        aml.finalize().await?;
        Ok::<_, AmlError>((recorder.messages(), metrics))
    })
    .await;

    for (rank, result) in results.into_iter().enumerate() {
        let (messages, metrics) = result.expect("node succeeded");
        let me = NodeId::new(rank as u32);
        assert_eq!(messages, vec![(me, Vec::new()), (me, b"to myself".to_vec())]);
        assert_eq!(metrics.local_deliveries, 2);
        assert_eq!(metrics.wire_sends(), 0);
        assert_eq!(metrics.bytes_sent, 0);
        assert_eq!(metrics.local_bytes, 9);
    }
}

#[tokio::test]
async fn test_each_tier_delivers_exactly_once() {
    init_tracing();
    let config = AmlConfig::local();
    let max_medium = config.max_medium;
    let lengths = [0, 1, max_medium - 1, max_medium];

    let results = run_local_group(2, config, move |mut aml| async move {
        let recorder = Recorder::default();
        aml.register_handler(12, recorder.handler()).await?;

        if aml.self_id() == NodeId::new(0) {
            assert!(aml.slice_size(NodeId::new(1)).expect("slice") >= max_medium);
            for (seed, len) in lengths.iter().enumerate() {
                aml.send(&pattern(*len, seed as u8), 12, NodeId::new(1)).await?;
            }
        }
        aml.barrier().await?;
        // Acks go out while the receiver sits in the first barrier.
        aml.barrier().await?;

        let metrics = aml.metrics().clone();
        aml.finalize().await?;
        Ok::<_, AmlError>((recorder.messages(), metrics))
    })
    .await;

    let mut results = results.into_iter();
    let (sent, sender): (_, TransportMetrics) = results.next().expect("node 0").expect("ok");
    let (received, receiver) = results.next().expect("node 1").expect("ok");

    assert!(sent.is_empty());
    assert_eq!(sender.short_sent, 1);
    assert_eq!(sender.medium_sent, 2);
    assert_eq!(sender.long_sent, 1);
    assert_eq!(sender.acks_received, 1);

    assert_eq!(received.len(), lengths.len());
    for (seed, (len, (from, payload))) in lengths.iter().zip(&received).enumerate() {
        assert_eq!(*from, NodeId::new(0));
        assert_eq!(*payload, pattern(*len, seed as u8));
    }
    assert_eq!(receiver.dispatched, lengths.len() as u64);
    assert_eq!(receiver.acks_sent, 1);
}

#[tokio::test]
async fn test_rendezvous_lands_in_writer_slice() {
    init_tracing();
    let config = AmlConfig::local();
    let segment = config.segment_size;
    let fabric = MemFabric::uniform(3, segment);
    let payload_len = config.max_medium * 2;

    let local = LocalSet::new();
    let handles: Vec<_> = fabric
        .conduits()
        .into_iter()
        .map(|conduit| {
            let config = config.clone();
            local.spawn_local(async move {
                let mut aml = Aml::init(conduit, config).await?;
                let recorder = Recorder::default();
                aml.register_handler(9, recorder.handler()).await?;
                let me = aml.self_id().get();
                if me != 1 {
                    aml.send(&pattern(payload_len, me as u8), 9, NodeId::new(1))
                        .await?;
                }
                aml.barrier().await?;
                aml.finalize().await?;
                Ok::<_, AmlError>(recorder.len())
            })
        })
        .collect();

    let counts = local
        .run_until(async move {
            let mut counts = Vec::new();
            for handle in handles {
                counts.push(handle.await.expect("join").expect("node succeeded"));
            }
            counts
        })
        .await;
    assert_eq!(counts, vec![0, 2, 0]);

    // Owner 1 in a group of 3: writer 0 owns the first half, writer 2 the second.
    let slice = segment / 2;
    let landed = fabric.segment_snapshot(NodeId::new(1));
    assert_eq!(&landed[..payload_len], &pattern(payload_len, 0)[..]);
    assert_eq!(&landed[slice..slice + payload_len], &pattern(payload_len, 2)[..]);
}

#[tokio::test]
async fn test_oversized_inline_payload_is_acknowledged() {
    init_tracing();
    let config = AmlConfig::local()
        .with_max_medium(1024)
        .with_max_long_request(100);

    let results = run_local_group(2, config, |mut aml| async move {
        let recorder = Recorder::default();
        aml.register_handler(3, recorder.handler()).await?;
        if aml.self_id() == NodeId::new(0) {
            aml.send(&pattern(50, 1), 3, NodeId::new(1)).await?;
            aml.send(&pattern(500, 2), 3, NodeId::new(1)).await?;
        }
        aml.barrier().await?;
        aml.barrier().await?;
        let metrics = aml.metrics().clone();
        aml.finalize().await?;
        Ok::<_, AmlError>((recorder.len(), metrics))
    })
    .await;

    let (counts, metrics): (Vec<usize>, Vec<TransportMetrics>) = results
        .into_iter()
        .map(|result| result.expect("node succeeded"))
        .unzip();
    assert_eq!(counts, vec![0, 2]);
    assert_eq!(metrics[0].medium_sent, 2);
    assert_eq!(metrics[0].long_sent, 0);
    assert_eq!(metrics[0].acks_received, 1);
    assert_eq!(metrics[1].acks_sent, 1);
}
