//! End-to-end synchronization over real sockets: a fresh node dials a node
//! with history and downloads the whole chain through the TCP transport.

use cinderd::block::types::Block;
use cinderd::blockchain::Blockchain;
use cinderd::core::NodeCore;
use cinderd::mining::Miner;
use cinderd::network::protocol_handler::ProtocolHandler;
use cinderd::network::server::NetworkServer;
use cinderd::network_type::NetworkType;
use cinderd::transaction_pool::TransactionPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn make_node(blocks: usize) -> (Arc<ProtocolHandler>, Arc<Blockchain>) {
    let chain = Arc::new(Blockchain::new(NetworkType::Testnet));
    for i in 0..blocks {
        let (_, top_id) = chain.top();
        let block = Block::new(top_id, 1_700_000_000 + i as i64, Vec::new());
        assert!(chain.submit_block(block, Vec::new()).added_to_main_chain);
    }
    let core = NodeCore::new(
        Arc::clone(&chain),
        Arc::new(TransactionPool::new()),
        Arc::new(Miner::new()),
    );
    (Arc::new(ProtocolHandler::new(Arc::new(core))), chain)
}

#[tokio::test]
async fn fresh_node_syncs_over_tcp() {
    let cancel = CancellationToken::new();

    let (handler_a, chain_a) = make_node(30);
    handler_a.init(true); // the seeded node serves chain requests
    let server_a = NetworkServer::new(Arc::clone(&handler_a), cancel.clone());
    let addr_a = server_a
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .expect("node A must bind");

    let (handler_b, chain_b) = make_node(0);
    let server_b = NetworkServer::new(Arc::clone(&handler_b), cancel.clone());
    server_b.connect(addr_a).await.expect("node B must dial node A");

    tokio::time::timeout(Duration::from_secs(10), async {
        while chain_b.height() < 31 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node B must reach node A's height");

    assert_eq!(chain_b.height(), chain_a.height());
    assert_eq!(chain_b.top().1, chain_a.top().1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), async {
        while server_b.registry().connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connections must close once the stop token fires");
}
