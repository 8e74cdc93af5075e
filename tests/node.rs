use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mini_pdn::consensus::{Learner, ProposalNumber, Proposer, RoundPhase};
use mini_pdn::core::{ClientRequest, ClientResponse, Envelope, Request, Response};
use mini_pdn::storage::{LogEntry, StateStore};
use mini_pdn::testing::{TestCluster, test_config};
use mini_pdn::{Key, LogicalAddress, Node, Operation, PdnError, TcpTransport, Transport};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

async fn client(to: SocketAddr, request: ClientRequest) -> ClientResponse {
    let transport = TcpTransport::new(Duration::from_secs(10), 1024 * 1024);
    match transport
        .send(to, Envelope::new(None, Request::Client(request)))
        .await
        .unwrap()
    {
        Response::Client(response) => response,
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn test_tcp_cluster_put_get_delete() {
    let mut listeners = Vec::new();
    for _ in 0..3 {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let addrs: Vec<SocketAddr> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();

    let mut nodes = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let mut config = test_config(i, 0);
        config.listen_addr = addrs[i];
        config.members = addrs.clone();
        let transport = Arc::new(TcpTransport::new(
            config.dht.request_timeout(),
            config.max_frame_bytes,
        ));
        let node = Node::open(config, transport).await.unwrap();
        let _server = node.serve(listener);
        nodes.push(node);
    }
    for node in &nodes {
        node.start().await;
    }

    let address = LogicalAddress::new("alice", "bob");
    let receipt = match client(
        addrs[0],
        ClientRequest::Put {
            address: address.clone(),
            payload: b"hello bob".to_vec(),
        },
    )
    .await
    {
        ClientResponse::Committed(receipt) => receipt,
        other => panic!("put failed: {:?}", other),
    };
    assert_eq!(receipt.key, address.key());
    assert_eq!(receipt.index, 0);

    let read = client(
        addrs[2],
        ClientRequest::Get {
            key: address.key(),
            min_index: Some(0),
        },
    )
    .await;
    match read {
        ClientResponse::Value(value) => assert_eq!(value.payload, b"hello bob"),
        other => panic!("get failed: {:?}", other),
    }

    let deleted = client(addrs[1], ClientRequest::Delete { key: address.key() }).await;
    assert!(matches!(deleted, ClientResponse::Committed(ref r) if r.index == 1));
    let read = client(
        addrs[0],
        ClientRequest::Get {
            key: address.key(),
            min_index: Some(1),
        },
    )
    .await;
    assert!(matches!(read, ClientResponse::NotFound(key) if key == address.key()));

    match client(addrs[2], ClientRequest::Status).await {
        ClientResponse::Status(status) => {
            assert_eq!(status.commit_index, Some(1));
            assert_eq!(status.members.len(), 3);
            assert_eq!(status.pending_proposals, 0);
            assert!(!status.faulted);
        }
        other => panic!("status failed: {:?}", other),
    }
}

#[tokio::test]
async fn test_conflicting_learn_halts_node() {
    let cluster = TestCluster::start(1).await.unwrap();
    let node = cluster.node(0);
    let receipt = node.put_named("k1", b"v1".to_vec()).await.unwrap();

    let forged = LogEntry::new(
        receipt.index,
        ProposalNumber::new(99, node.id()),
        Operation::store(Key::from_name("k1"), b"other".to_vec()),
    );
    let err = node.on_learn(forged).await.unwrap_err();
    assert_eq!(err, PdnError::LogConflict { index: 0 });
    assert!(node.is_faulted());

    assert_eq!(
        node.propose(Operation::delete(Key::from_name("k1"))).await,
        Err(PdnError::Faulted)
    );
    assert!(node.node_status().await.faulted);
    // Reads of already applied state keep working.
    assert_eq!(node.get_local(&Key::from_name("k1")).await.unwrap().payload, b"v1");
}

#[tokio::test]
async fn test_relearning_committed_entry_is_harmless() {
    let cluster = TestCluster::start(3).await.unwrap();
    let node = cluster.node(1);
    cluster.node(0).put_named("k1", b"v1".to_vec()).await.unwrap();

    let entry = node.log().get(0).await.unwrap();
    assert!(matches!(
        node.on_learn(entry).await.unwrap(),
        Response::Learned { index: 0 }
    ));
    assert_eq!(node.commit_index(), Some(0));
    assert!(!node.is_faulted());
}

#[tokio::test]
async fn test_status_reports_cluster_view() {
    let cluster = TestCluster::start(3).await.unwrap();
    cluster.node(0).put_named("k1", b"v1".to_vec()).await.unwrap();

    let status = cluster.node(0).node_status().await;
    assert_eq!(status.routing_table_size, 2);
    assert_eq!(status.commit_index, Some(0));
    assert_eq!(status.highest_known_index, Some(0));
    assert_eq!(status.members.len(), 3);
    assert_eq!(status.pending_proposals, 0);
    assert!(status.in_flight_rounds.is_empty());
    assert_eq!(status.metrics.proposals_committed, 1);
}

#[tokio::test]
async fn test_status_lists_rounds_in_progress() {
    let cluster = TestCluster::start(3).await.unwrap();
    let node = cluster.node(0);

    node.proposer().set_phase(4, RoundPhase::AcceptedQuorum).await;
    node.proposer().set_phase(2, RoundPhase::Prepared).await;
    assert_eq!(
        node.node_status().await.in_flight_rounds,
        vec![(2, RoundPhase::Prepared), (4, RoundPhase::AcceptedQuorum)]
    );

    node.proposer().set_phase(2, RoundPhase::Idle).await;
    node.proposer().set_phase(4, RoundPhase::Committed).await;
    node.put_named("k1", b"v1".to_vec()).await.unwrap();
    assert!(node.node_status().await.in_flight_rounds.is_empty());
}

#[tokio::test]
async fn test_committed_index_leaves_no_acceptor_state() {
    let cluster = TestCluster::start(3).await.unwrap();
    cluster.node(0).put_named("k1", b"v1".to_vec()).await.unwrap();
    cluster.node(1).put_named("k2", b"v2".to_vec()).await.unwrap();

    // Late accept replies may still be settling on the slowest member.
    for node in &cluster.nodes {
        timeout(Duration::from_secs(5), async {
            while node.log().applied_index() != Some(1)
                || !node.acceptor().live_indices().await.is_empty()
            {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("acceptor state was not retired");
    }
    for state in &cluster.states {
        assert!(state.load_acceptors().await.unwrap().is_empty());
    }

    // Rounds used at retired indices still seed the proposer.
    for node in &cluster.nodes {
        assert!(node.acceptor().highest_round().await > 0);
    }
}
