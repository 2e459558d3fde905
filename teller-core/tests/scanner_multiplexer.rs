//! Block scanners fanned into the multiplexer, driven by fake chain nodes.

use async_trait::async_trait;
use redb::Database;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use teller_core::coin::CoinType;
use teller_core::scanner::{
    BlockOutput, BlockScanner, ChainBlock, ChainClient, DepositNote, Multiplexer, ScanConfig,
    ScanSetHandle, ScanStore, ScannerError,
};
use teller_core::storage::open_db;
use tokio::sync::{mpsc, watch};

struct FakeChain {
    tip: i64,
    blocks: Mutex<HashMap<i64, ChainBlock>>,
}

impl FakeChain {
    fn new(tip: i64) -> Self {
        Self {
            tip,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    fn put_block(&self, height: i64, outputs: Vec<(&str, i64, &str, u32)>) {
        let outputs = outputs
            .into_iter()
            .map(|(address, value, tx, n)| BlockOutput {
                address: address.to_string(),
                value,
                tx: tx.to_string(),
                n,
            })
            .collect();
        self.blocks
            .lock()
            .unwrap()
            .insert(height, ChainBlock { height, outputs });
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn block_count(&self) -> Result<i64, ScannerError> {
        Ok(self.tip)
    }

    async fn block(&self, height: i64) -> Result<ChainBlock, ScannerError> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or(ScannerError::BlockNotFound { height })
    }
}

fn scan_config(initial: i64, confirmations: i64) -> ScanConfig {
    ScanConfig {
        scan_period: Duration::from_millis(10),
        initial_scan_height: initial,
        confirmations_required: confirmations,
        deposit_buffer_size: 2,
    }
}

fn temp_db() -> (tempfile::TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(open_db(dir.path().join("scan.db")).unwrap());
    (dir, db)
}

#[tokio::test]
async fn test_two_coin_fan_in_marks_everything_processed() {
    let (_dir, db) = temp_db();
    let store = ScanStore::new(db).unwrap();

    // BTC: three deposits across two blocks, one irrelevant output.
    let btc_chain = FakeChain::new(502);
    btc_chain.put_block(
        500,
        vec![
            ("1N8G4JM8krsHLQZjC51R7ZgwDyihmgsQYA", 10_000, "b1", 0),
            ("1N8G4JM8krsHLQZjC51R7ZgwDyihmgsQYA", 20_000, "b1", 1),
            ("1LcEkgX8DCrQczLMVh9LDTRnkdVV2oun3A", 999, "b1", 2),
        ],
    );
    btc_chain.put_block(
        501,
        vec![("1N8G4JM8krsHLQZjC51R7ZgwDyihmgsQYA", 30_000, "b2", 0)],
    );

    // SKY: two deposits in one block; no confirmation depth.
    let sky_chain = FakeChain::new(180);
    sky_chain.put_block(
        176,
        vec![
            ("v4qF7Ceq276tZpTS3HKsZbDguMAcAGAG1q", 1_000_000, "s1", 0),
            ("8MQsjc5HYbSjPTZikFZYeHHDtLungBEHYS", 2_000_000, "s1", 1),
        ],
    );
    for height in 177..=180 {
        sky_chain.put_block(height, vec![]);
    }

    let multiplexer = Arc::new(Multiplexer::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (btc_tx, btc_rx) = mpsc::channel(2);
    let btc_scanner = BlockScanner::new(
        CoinType::Btc,
        Box::new(btc_chain),
        store.clone(),
        scan_config(500, 1),
        btc_tx,
        shutdown_rx.clone(),
    );
    multiplexer
        .add_scanner(
            CoinType::Btc,
            Arc::new(ScanSetHandle::new(store.clone(), CoinType::Btc)),
            btc_rx,
        )
        .unwrap();

    let (sky_tx, sky_rx) = mpsc::channel(2);
    let sky_scanner = BlockScanner::new(
        CoinType::Sky,
        Box::new(sky_chain),
        store.clone(),
        scan_config(176, 0),
        sky_tx,
        shutdown_rx.clone(),
    );
    multiplexer
        .add_scanner(
            CoinType::Sky,
            Arc::new(ScanSetHandle::new(store.clone(), CoinType::Sky)),
            sky_rx,
        )
        .unwrap();

    // Watched addresses arrive through the multiplexer dispatch.
    multiplexer
        .add_scan_address("1N8G4JM8krsHLQZjC51R7ZgwDyihmgsQYA", CoinType::Btc)
        .unwrap();
    multiplexer
        .add_scan_address("v4qF7Ceq276tZpTS3HKsZbDguMAcAGAG1q", CoinType::Sky)
        .unwrap();
    multiplexer
        .add_scan_address("8MQsjc5HYbSjPTZikFZYeHHDtLungBEHYS", CoinType::Sky)
        .unwrap();

    let mut deposits = multiplexer.take_deposits().unwrap();

    let btc_handle = tokio::spawn(btc_scanner.run());
    let sky_handle = tokio::spawn(sky_scanner.run());
    let mux = multiplexer.clone();
    let mux_shutdown = shutdown_rx.clone();
    let mux_handle = tokio::spawn(async move { mux.multiplex(mux_shutdown).await });

    // 3 BTC + 2 SKY watched deposits in total. Each scanner waits for the
    // ack before publishing its next deposit, so the consumer answers as
    // it reads.
    let expected = 5;
    let mut received = 0usize;
    while received < expected {
        let note: DepositNote = tokio::time::timeout(Duration::from_secs(5), deposits.recv())
            .await
            .expect("deposit stream dried up")
            .unwrap();
        note.ack.send(Ok(())).unwrap();
        received += 1;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    btc_handle.await.unwrap().unwrap();
    sky_handle.await.unwrap().unwrap();
    mux_handle.await.unwrap();

    // Every acked deposit is flagged processed and the cursors sit past
    // the scanned blocks.
    for (coin, id) in [
        (CoinType::Btc, "b1:0"),
        (CoinType::Btc, "b1:1"),
        (CoinType::Btc, "b2:0"),
        (CoinType::Sky, "s1:0"),
        (CoinType::Sky, "s1:1"),
    ] {
        let stored = store.get_deposit(coin, id).unwrap().unwrap();
        assert!(stored.processed, "{id} not processed");
    }
    // The irrelevant output was never recorded.
    assert!(store.get_deposit(CoinType::Btc, "b1:2").unwrap().is_none());

    assert_eq!(store.scan_cursor(CoinType::Btc).unwrap(), Some(502));
    assert_eq!(store.scan_cursor(CoinType::Sky).unwrap(), Some(181));
}
