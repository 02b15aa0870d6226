use client_pool::mock::fixtures;
use client_pool::{
    Address, ApiClient, ChainApi, ClientPool, HealthConfig, MockApiClient, MockFailure,
    PoolConfig, PoolError, Utxo,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

const E1: &str = "http://e1.test/api";
const E2: &str = "http://e2.test/api";

fn test_config() -> PoolConfig {
    let mut config = PoolConfig::new("test", Vec::new());
    config.health = HealthConfig {
        base_backoff_ms: 50,
        max_backoff_ms: 500,
        failure_window_secs: 300,
    };
    config
}

fn pool_with(endpoints: &[&str]) -> (ClientPool, Vec<Arc<MockApiClient>>) {
    pool_with_config(&test_config(), endpoints)
}

fn pool_with_config(
    config: &PoolConfig,
    endpoints: &[&str],
) -> (ClientPool, Vec<Arc<MockApiClient>>) {
    let mocks: Vec<Arc<MockApiClient>> = endpoints
        .iter()
        .map(|e| Arc::new(MockApiClient::new(e)))
        .collect();
    let clients = mocks
        .iter()
        .map(|m| Arc::clone(m) as Arc<dyn ApiClient>)
        .collect();
    let pool = ClientPool::with_clients(config, clients).unwrap();
    (pool, mocks)
}

/// Waits until `endpoint` is the started current target.
async fn wait_connected(pool: &ClientPool, endpoint: &str) {
    let mut status = pool.manager().watch_status();
    timeout(Duration::from_secs(2), async {
        loop {
            {
                let now = status.borrow_and_update();
                if now.started && now.current.as_deref() == Some(endpoint) {
                    return;
                }
            }
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never connected", endpoint));
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_request_before_start_is_rejected() {
    let (pool, mocks) = pool_with(&[E1]);
    assert!(matches!(pool.get_info().await, Err(PoolError::NotStarted)));
    assert_eq!(mocks[0].request_count(), 0);
}

#[tokio::test]
async fn test_request_waits_for_connection() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    pool.start().unwrap();

    // Issued immediately; must wait for the supervisor instead of failing.
    let info = pool.get_info().await.unwrap();
    assert_eq!(info, fixtures::info());
    assert!(mocks[0].is_started());
    assert_eq!(mocks[1].start_count(), 0);

    pool.close().await;
}

#[tokio::test]
async fn test_failed_request_rotates_to_next_endpoint() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    mocks[0].fail_with(MockFailure::Status(500));
    pool.start().unwrap();

    let tx = pool.get_transaction("tx1").await.unwrap();
    assert_eq!(tx.txid, "tx1");

    assert_eq!(mocks[0].request_count(), 1);
    assert_eq!(mocks[1].request_count(), 1);
    assert!(mocks[0].close_count() >= 1);

    let health = pool.manager().health(E1).await.unwrap();
    assert!(health.has_failed());
    assert!(pool.manager().health(E2).await.unwrap().is_healthy());
    wait_connected(&pool, E2).await;

    pool.close().await;
}

#[tokio::test]
async fn test_all_endpoints_failing_exhausts_retries() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    for mock in &mocks {
        mock.fail_with(MockFailure::Timeout(Duration::from_millis(200)));
    }
    pool.start().unwrap();

    let began = Instant::now();
    let result = pool.get_best_block().await;
    let elapsed = began.elapsed();

    assert!(matches!(
        result,
        Err(PoolError::Exhausted {
            operation: "get_best_block",
            attempts: 3
        })
    ));
    let total = mocks[0].request_count() + mocks[1].request_count();
    assert_eq!(total, 3);
    // Three timed-out attempts plus at most one short cooldown wait.
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);

    pool.close().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_on_same_pool() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    mocks[0].fail_next(1, MockFailure::Unreachable);
    mocks[1].set_fee(42);
    pool.start().unwrap();

    assert_eq!(pool.estimate_fee(6).await.unwrap(), 42);
    assert_eq!(mocks[0].request_count(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_start_failure_falls_over() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    mocks[0].fail_start(true);
    pool.start().unwrap();

    wait_connected(&pool, E2).await;
    assert_eq!(mocks[0].start_count(), 1);
    assert!(!mocks[0].is_started());
    assert!(pool.manager().health(E1).await.unwrap().has_failed());

    let block = pool.get_best_block().await.unwrap();
    assert_eq!(block, fixtures::block(1_000));
    assert_eq!(mocks[0].request_count(), 0);

    pool.close().await;
}

#[tokio::test]
async fn test_addresses_replayed_after_rotation() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    pool.start().unwrap();
    wait_connected(&pool, E1).await;

    let addr = Address::new("tb1qwatched");
    pool.listen_address(&addr).await;
    pool.listen_address(&addr).await;
    assert_eq!(pool.listened_addresses().await, vec![addr.clone()]);
    // Forwarded directly, or by the replay if that had not run yet.
    assert!(mocks[0].listened_addresses().contains(&addr));

    assert!(mocks[0].disconnect());
    wait_connected(&pool, E2).await;
    eventually("replay on E2", || mocks[1].listened_addresses().contains(&addr)).await;

    assert!(pool.manager().health(E1).await.unwrap().has_failed());
    pool.close().await;
}

#[tokio::test]
async fn test_address_registered_before_start_is_replayed() {
    let (pool, mocks) = pool_with(&[E1]);
    let addr = Address::new("tb1qearly");
    pool.listen_address(&addr).await;

    pool.start().unwrap();
    wait_connected(&pool, E1).await;
    eventually("replay on E1", || mocks[0].listened_addresses() == vec![addr.clone()]).await;

    pool.close().await;
}

#[tokio::test]
async fn test_notifications_survive_rotation() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    let mut blocks = pool.block_notify();
    let mut txs = pool.transaction_notify();
    pool.start().unwrap();
    wait_connected(&pool, E1).await;

    mocks[0].push_block(fixtures::block(1_001));
    let block = timeout(Duration::from_secs(1), blocks.recv()).await.unwrap().unwrap();
    assert_eq!(block.height, 1_001);

    assert!(mocks[0].disconnect());
    wait_connected(&pool, E2).await;

    mocks[1].push_block(fixtures::block(1_002));
    let block = timeout(Duration::from_secs(1), blocks.recv()).await.unwrap().unwrap();
    assert_eq!(block.height, 1_002);

    mocks[1].push_transaction(fixtures::transaction("tx-after-rotation"));
    let tx = timeout(Duration::from_secs(1), txs.recv()).await.unwrap().unwrap();
    assert_eq!(tx.txid, "tx-after-rotation");

    pool.close().await;
}

#[tokio::test]
async fn test_old_endpoint_notifications_not_forwarded() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    let mut blocks = pool.block_notify();
    pool.start().unwrap();
    wait_connected(&pool, E1).await;

    assert!(mocks[0].disconnect());
    wait_connected(&pool, E2).await;

    mocks[0].push_block(fixtures::block(5));
    mocks[1].push_block(fixtures::block(6));
    let block = timeout(Duration::from_secs(1), blocks.recv()).await.unwrap().unwrap();
    assert_eq!(block.height, 6);

    pool.close().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_endpoint() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    pool.start().unwrap();

    let requests = (0..16).map(|_| pool.get_best_block());
    let results = futures::future::join_all(requests).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(mocks[0].request_count(), 16);
    assert_eq!(mocks[1].request_count(), 0);

    pool.close().await;
}

#[tokio::test]
async fn test_broadcast_and_utxos() {
    let (pool, mocks) = pool_with(&[E1]);
    let utxo = Utxo {
        address: "tb1qreceiver".to_string(),
        txid: "aa".repeat(32),
        vout: 1,
        value: 5_000,
        height: 998,
        confirmations: 3,
        script_pub_key: "0014aa".to_string(),
    };
    mocks[0].insert_utxo(utxo.clone());
    pool.start().unwrap();

    let raw = vec![0x02, 0x00, 0x00, 0x00];
    let txid = pool.broadcast(&raw).await.unwrap();
    assert_eq!(txid, fixtures::txid_for(&raw));
    assert_eq!(mocks[0].broadcasts(), vec![raw]);

    let utxos = pool
        .get_utxos(&[Address::new("tb1qreceiver"), Address::new("tb1qnobody")])
        .await
        .unwrap();
    assert_eq!(utxos, vec![utxo]);

    pool.close().await;
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let (pool, mocks) = pool_with(&[E1]);
    pool.start().unwrap();
    assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
    assert!(pool.is_running());
    wait_connected(&pool, E1).await;

    pool.close().await;
    pool.close().await;
    assert!(!pool.is_running());
    assert_eq!(mocks[0].close_count(), 1);
    assert_eq!(pool.manager().current_endpoint(), None);

    assert!(matches!(pool.get_info().await, Err(PoolError::Closed)));
    assert!(matches!(pool.start(), Err(PoolError::Closed)));
}

#[tokio::test]
async fn test_unreachable_endpoints_exhaust_retries() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    for mock in &mocks {
        mock.fail_start(true);
    }
    pool.start().unwrap();

    let began = Instant::now();
    let result = timeout(Duration::from_secs(5), pool.get_transaction("tx1"))
        .await
        .expect("request must not wait forever");

    assert!(matches!(
        result,
        Err(PoolError::Exhausted {
            operation: "get_transaction",
            attempts: 3
        })
    ));
    assert_eq!(mocks[0].request_count() + mocks[1].request_count(), 0);
    assert!(mocks[0].start_count() >= 1);
    assert!(mocks[1].start_count() >= 1);
    assert!(began.elapsed() < Duration::from_secs(2), "took {:?}", began.elapsed());

    pool.close().await;
}

#[tokio::test]
async fn test_start_failure_then_recovery_serves_request() {
    let (pool, mocks) = pool_with(&[E1]);
    mocks[0].fail_start(true);
    pool.start().unwrap();
    eventually("first start attempt", || mocks[0].start_count() >= 1).await;

    mocks[0].fail_start(false);
    let info = pool.get_info().await.unwrap();
    assert_eq!(info, fixtures::info());
    assert!(mocks[0].is_started());

    pool.close().await;
}

#[tokio::test]
async fn test_listen_address_reaches_live_connection_behind_health_update() {
    let (pool, mocks) = pool_with(&[E1, E2]);
    let pool = Arc::new(pool);
    pool.start().unwrap();
    wait_connected(&pool, E1).await;

    // An in-flight request holds the read side while a health update queues.
    let in_flight = pool.manager().acquire_current().await.unwrap();
    let marker = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.manager().mark_unhealthy(E2).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let addr = Address::new("tb1qlive");
    let listener = {
        let pool = Arc::clone(&pool);
        let addr = addr.clone();
        tokio::spawn(async move { pool.listen_address(&addr).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.listened_addresses().await, vec![addr.clone()]);

    drop(in_flight);
    assert!(timeout(Duration::from_secs(1), marker).await.unwrap().unwrap());
    timeout(Duration::from_secs(1), listener).await.unwrap().unwrap();

    let status = pool.manager().status();
    assert_eq!(status.current.as_deref(), Some(E1));
    assert!(status.started);
    assert!(mocks[0].listened_addresses().contains(&addr));

    pool.close().await;
}

#[tokio::test]
async fn test_close_unblocks_waiting_request() {
    let mut config = test_config();
    config.health = HealthConfig {
        base_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
        failure_window_secs: 300,
    };
    let (pool, mocks) = pool_with_config(&config, &[E1]);
    mocks[0].fail_start(true);
    let pool = Arc::new(pool);
    pool.start().unwrap();

    // The first attempt fails at start; the next one waits out the cooldown.
    let waiting = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get_info().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());

    pool.close().await;
    let result = timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
}
