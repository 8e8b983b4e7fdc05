//! Protocol violations abort the whole group.

use aml::conduit::MemFabric;
use aml::launch::run_local_group;
use aml::{Aml, AmlConfig, AmlError, LifecycleState, MemConduit, NodeId};

use crate::common::{init_tracing, Recorder};

/// Two bootstrapped nodes driven from the same task.
async fn pair(config: AmlConfig) -> (MemFabric, Aml<MemConduit>, Aml<MemConduit>) {
    let fabric = MemFabric::uniform(2, config.segment_size);
    let (first, second) = tokio::join!(
        Aml::init(fabric.conduit(NodeId::new(0)), config.clone()),
        Aml::init(fabric.conduit(NodeId::new(1)), config),
    );
    (fabric, first.expect("init node 0"), second.expect("init node 1"))
}

fn assert_aborted_by(err: AmlError, node: u32) {
    match err {
        AmlError::GroupAborted { origin, .. } => assert_eq!(origin, NodeId::new(node)),
        other => panic!("expected GroupAborted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_oversized_send_delivers_nothing() {
    init_tracing();
    let config = AmlConfig::local();
    let slice = config.segment_size;
    let recorder = Recorder::default();

    let results = run_local_group(2, config, {
        let recorder = recorder.clone();
        move |mut aml| {
            let recorder = recorder.clone();
            async move {
                aml.register_handler(4, recorder.handler()).await?;
                if aml.self_id() == NodeId::new(0) {
                    aml.send(&vec![1u8; slice + 4464], 4, NodeId::new(1)).await?;
                }
                aml.barrier().await?;
                aml.finalize().await?;
                Ok::<_, AmlError>(())
            }
        }
    })
    .await;

    let mut results = results.into_iter();
    match results.next().expect("node 0") {
        Err(AmlError::MessageTooLarge {
            length,
            destination,
            inline_max,
            slice_size,
        }) => {
            assert_eq!(length, 70_000);
            assert_eq!(destination, NodeId::new(1));
            assert_eq!(inline_max, 1023);
            assert_eq!(slice_size, slice);
        }
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }
    assert_aborted_by(results.next().expect("node 1").expect_err("aborted"), 0);
    assert!(recorder.is_empty());
}

#[tokio::test]
async fn test_unregistered_handler_aborts_group() {
    init_tracing();
    let (fabric, mut sender, mut receiver) = pair(AmlConfig::local()).await;

    sender
        .send(b"nobody home", 9, NodeId::new(1))
        .await
        .expect("send succeeds locally");

    let err = receiver.poll().expect_err("id 9 was never registered");
    match err {
        AmlError::UnregisteredHandler {
            handler,
            sender: from,
            node,
        } => {
            assert_eq!(handler, 9);
            assert_eq!(from, NodeId::new(0));
            assert_eq!(node, NodeId::new(1));
        }
        other => panic!("expected UnregisteredHandler, got {other:?}"),
    }
    assert_eq!(receiver.state(), LifecycleState::Terminated);
    assert!(matches!(
        receiver.poll(),
        Err(AmlError::NotReady { operation: "poll", .. })
    ));

    assert_aborted_by(sender.barrier().await.expect_err("group is gone"), 1);
    assert_eq!(sender.state(), LifecycleState::Terminated);
    let notice = fabric.abort_notice().expect("abort recorded");
    assert!(notice.reason.contains("non registered handler"));
}

#[tokio::test]
async fn test_invalid_destination_is_fatal() {
    init_tracing();
    let (_fabric, mut sender, mut receiver) = pair(AmlConfig::local()).await;

    let err = sender
        .send(b"x", 4, NodeId::new(5))
        .await
        .expect_err("node 5 is outside the group");
    assert!(matches!(
        err,
        AmlError::InvalidDestination { destination, nodes: 2 } if destination == NodeId::new(5)
    ));
    assert!(err.is_protocol_violation());
    assert_aborted_by(receiver.poll().expect_err("aborted"), 0);
}

#[tokio::test]
async fn test_out_of_range_registration_is_fatal() {
    init_tracing();
    let (_fabric, mut first, mut second) = pair(AmlConfig::local()).await;

    let err = first
        .register_handler(256, |_: NodeId, _: &[u8]| {})
        .await
        .expect_err("256 does not fit the id space");
    assert!(matches!(err, AmlError::InvalidHandlerId { id: 256 }));
    assert!(!first.is_registered(256));
    assert!(matches!(
        first.send(b"x", 4, NodeId::new(1)).await,
        Err(AmlError::NotReady { .. })
    ));
    assert_aborted_by(second.barrier().await.expect_err("aborted"), 0);
}

#[tokio::test]
async fn test_dropped_context_releases_blocked_peers() {
    init_tracing();
    let (_fabric, first, mut second) = pair(AmlConfig::local()).await;

    drop(first);
    match second.barrier().await {
        Err(AmlError::GroupAborted { origin, reason }) => {
            assert_eq!(origin, NodeId::new(0));
            assert_eq!(reason, "context dropped without finalize");
        }
        other => panic!("expected GroupAborted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_right_after_registration_never_faults() {
    init_tracing();
    let nodes = 4;

    let results = run_local_group(nodes, AmlConfig::local(), move |mut aml| async move {
        let recorder = Recorder::default();
        aml.register_handler(7, recorder.handler()).await?;
        let me = aml.self_id();
        for peer in 0..nodes as u32 {
            let peer = NodeId::new(peer);
            if peer != me {
                aml.send(&me.get().to_le_bytes(), 7, peer).await?;
            }
        }
        aml.barrier().await?;
        aml.finalize().await?;
        Ok::<_, AmlError>(recorder.messages())
    })
    .await;

    for result in results {
        let mut senders: Vec<u32> = result
            .expect("no node faulted")
            .into_iter()
            .map(|(from, payload)| {
                assert_eq!(payload, from.get().to_le_bytes());
                from.get()
            })
            .collect();
        senders.sort_unstable();
        assert_eq!(senders.len(), nodes - 1);
        senders.dedup();
        assert_eq!(senders.len(), nodes - 1);
    }
}
