//! Full stack over the TCP mesh on loopback.

use std::net::SocketAddr;
use std::time::Duration;

use aml::{Aml, AmlConfig, AmlError, NodeId, TcpConduit, TcpConfig};
use tokio::net::TcpListener;
use tokio::task::LocalSet;

use crate::common::{init_tracing, pattern, Recorder};

async fn loopback_listeners(nodes: usize) -> (Vec<TcpListener>, Vec<SocketAddr>) {
    let mut listeners = Vec::with_capacity(nodes);
    let mut addrs = Vec::with_capacity(nodes);
    for _ in 0..nodes {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        addrs.push(listener.local_addr().expect("local addr"));
        listeners.push(listener);
    }
    (listeners, addrs)
}

async fn node(
    listener: TcpListener,
    rank: NodeId,
    peers: Vec<SocketAddr>,
    config: AmlConfig,
) -> Result<(Vec<(NodeId, Vec<u8>)>, i64, i64), AmlError> {
    let conduit = TcpConduit::establish(
        listener,
        rank,
        peers,
        config.segment_size,
        TcpConfig::default(),
    )
    .await?;
    let large = 2 * config.max_medium;
    let mut aml = Aml::init(conduit, config).await?;

    let recorder = Recorder::default();
    aml.register_handler(12, recorder.handler()).await?;

    let me = aml.self_id();
    let right = NodeId::new((me.get() + 1) % aml.node_count() as u32);
    aml.send(&[], 12, right).await?;
    aml.send(&pattern(100, me.get() as u8), 12, right).await?;
    aml.send(&pattern(large, me.get() as u8), 12, right).await?;
    aml.send(&pattern(large, me.get() as u8 + 100), 12, right).await?;
    aml.barrier().await?;

    let id = me.get() as i64;
    let sum = aml.all_sum(id).await?;
    let max = aml.all_max(id).await?;
    aml.finalize().await?;
    Ok((recorder.messages(), sum, max))
}

#[tokio::test]
async fn test_ring_over_loopback() {
    init_tracing();
    let nodes = 3;
    let config = AmlConfig::local();
    let large = 2 * config.max_medium;

    let local = LocalSet::new();
    let results = local
        .run_until(async move {
            let (listeners, addrs) = loopback_listeners(nodes).await;
            let handles: Vec<_> = listeners
                .into_iter()
                .enumerate()
                .map(|(rank, listener)| {
                    tokio::task::spawn_local(node(
                        listener,
                        NodeId::new(rank as u32),
                        addrs.clone(),
                        config.clone(),
                    ))
                })
                .collect();

            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.expect("join"));
            }
            results
        });
    let results = tokio::time::timeout(Duration::from_secs(30), results)
        .await
        .expect("group finished in time");

    for (rank, result) in results.into_iter().enumerate() {
        let (messages, sum, max) = result.expect("node succeeded");
        assert_eq!((sum, max), (3, 2));

        let left = ((rank + nodes - 1) % nodes) as u8;
        let from = NodeId::new(left as u32);
        assert_eq!(
            messages,
            vec![
                (from, Vec::new()),
                (from, pattern(100, left)),
                (from, pattern(large, left)),
                (from, pattern(large, left + 100)),
            ]
        );
    }
}

#[tokio::test]
async fn test_oversized_send_aborts_tcp_group() {
    init_tracing();
    let config = AmlConfig::local();

    let local = LocalSet::new();
    let results = local
        .run_until(async move {
            let (listeners, addrs) = loopback_listeners(2).await;
            let handles: Vec<_> = listeners
                .into_iter()
                .enumerate()
                .map(|(rank, listener)| {
                    let peers = addrs.clone();
                    let config = config.clone();
                    tokio::task::spawn_local(async move {
                        let rank = NodeId::new(rank as u32);
                        let conduit = TcpConduit::establish(
                            listener,
                            rank,
                            peers,
                            config.segment_size,
                            TcpConfig::default(),
                        )
                        .await?;
                        let too_large = config.segment_size + 1;
                        let mut aml = Aml::init(conduit, config).await?;
                        if rank == NodeId::new(0) {
                            aml.send(&vec![0u8; too_large], 1, NodeId::new(1)).await?;
                        }
                        aml.barrier().await?;
                        aml.finalize().await?;
                        Ok::<_, AmlError>(())
                    })
                })
                .collect();

            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.expect("join"));
            }
            results
        });
    let results = tokio::time::timeout(Duration::from_secs(30), results)
        .await
        .expect("group finished in time");

    assert!(matches!(results[0], Err(AmlError::MessageTooLarge { .. })));
    match &results[1] {
        Err(AmlError::GroupAborted { origin, .. }) => assert_eq!(*origin, NodeId::new(0)),
        other => panic!("expected GroupAborted, got {other:?}"),
    }
}
