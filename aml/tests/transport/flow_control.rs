//! One outstanding rendezvous transfer per peer.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use aml::conduit::MemFabric;
use aml::launch::run_local_group;
use aml::{Aml, AmlConfig, AmlError, NodeId};

use crate::common::{init_tracing, pattern, Recorder};

#[tokio::test]
async fn test_second_rendezvous_waits_for_first_ack() {
    init_tracing();
    let config = AmlConfig::local();
    let len = config.max_medium * 4;

    // Set by node 0 once its second send returned.
    let second_done = Rc::new(Cell::new(false));
    // What node 1's handler saw for each dispatch.
    let observed = Rc::new(RefCell::new(Vec::new()));

    let results = run_local_group(2, config, {
        let second_done = second_done.clone();
        let observed = observed.clone();
        move |mut aml| {
            let second_done = second_done.clone();
            let observed = observed.clone();
            async move {
                let recorder = Recorder::default();
                let mut record = recorder.handler();
                let flag = second_done.clone();
                aml.register_handler(21, move |from: NodeId, payload: &[u8]| {
                    observed.borrow_mut().push(flag.get());
                    record(from, payload);
                })
                .await?;

                if aml.self_id() == NodeId::new(0) {
                    aml.send(&pattern(len, 1), 21, NodeId::new(1)).await?;
                    aml.send(&pattern(len, 2), 21, NodeId::new(1)).await?;
                    second_done.set(true);
                }
                // Node 1 only makes progress from inside the barrier.
                aml.barrier().await?;

                let waits = aml.metrics().flow_control_waits;
                aml.finalize().await?;
                Ok::<_, AmlError>((recorder.messages(), waits))
            }
        }
    })
    .await;

    let mut results = results.into_iter();
    let (_, sender_waits) = results.next().expect("node 0").expect("ok");
    let (received, receiver_waits) = results.next().expect("node 1").expect("ok");

    assert_eq!(sender_waits, 1);
    assert_eq!(receiver_waits, 0);
    // The first transfer was dispatched while the second send was blocked.
    assert!(!observed.borrow()[0]);
    assert_eq!(
        received,
        vec![
            (NodeId::new(0), pattern(len, 1)),
            (NodeId::new(0), pattern(len, 2)),
        ]
    );
}

#[tokio::test]
async fn test_slices_to_different_peers_are_independent() {
    init_tracing();
    let config = AmlConfig::local();
    let len = config.max_medium;

    let results = run_local_group(3, config, move |mut aml| async move {
        let recorder = Recorder::default();
        aml.register_handler(22, recorder.handler()).await?;
        if aml.self_id() == NodeId::new(0) {
            aml.send(&pattern(len, 1), 22, NodeId::new(1)).await?;
            aml.send(&pattern(len, 2), 22, NodeId::new(2)).await?;
        }
        aml.barrier().await?;
        let waits = aml.metrics().flow_control_waits;
        aml.finalize().await?;
        Ok::<_, AmlError>((recorder.len(), waits))
    })
    .await;

    let outcomes: Vec<(usize, u64)> = results
        .into_iter()
        .map(|result| result.expect("node succeeded"))
        .collect();
    assert_eq!(outcomes, vec![(0, 0), (1, 0), (1, 0)]);
}

#[tokio::test]
async fn test_blocked_send_completes_once_peer_polls() {
    init_tracing();
    let config = AmlConfig::local();
    let len = config.max_medium * 2;
    let fabric = MemFabric::uniform(2, config.segment_size);

    let (sender, receiver) = tokio::join!(
        Aml::init(fabric.conduit(NodeId::new(0)), config.clone()),
        Aml::init(fabric.conduit(NodeId::new(1)), config.clone()),
    );
    let mut sender = sender.expect("init node 0");
    let mut receiver = receiver.expect("init node 1");

    let recorder = Recorder::default();
    let handler = recorder.handler();
    let (registered_0, registered_1) = tokio::join!(
        sender.register_handler(30, |_: NodeId, _: &[u8]| {}),
        receiver.register_handler(30, handler),
    );
    registered_0.expect("register on node 0");
    registered_1.expect("register on node 1");

    sender
        .send(&pattern(len, 7), 30, NodeId::new(1))
        .await
        .expect("first send");
    assert_eq!(fabric.pending_packets(NodeId::new(1)), 1);

    // The receiver polls only after the blocked send had a chance to spin.
    let polled = Cell::new(false);
    let blocked = async {
        sender
            .send(&pattern(len, 8), 30, NodeId::new(1))
            .await
            .expect("second send");
        assert!(polled.get(), "second send finished before the ack");
    };
    let peer = async {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        polled.set(true);
        assert_eq!(receiver.poll().expect("poll"), 1);
    };
    tokio::join!(blocked, peer);

    receiver
        .wait_until(|| recorder.len() == 2)
        .await
        .expect("second transfer dispatched");
    assert_eq!(sender.metrics().flow_control_waits, 1);
    assert_eq!(recorder.messages()[1].1, pattern(len, 8));

    let (done_0, done_1) = tokio::join!(sender.finalize(), receiver.finalize());
    done_0.expect("finalize node 0");
    done_1.expect("finalize node 1");
}
