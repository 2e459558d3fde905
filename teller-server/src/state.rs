//! Shared application state for the HTTP layer.

use std::collections::HashMap;
use std::sync::Arc;
use teller_core::coin::CoinType;
use teller_core::scanner::DummyScanner;
use teller_core::sender::DummySender;
use teller_core::teller::TellerService;

/// Handles onto the in-memory fakes, present only in dummy mode.
#[derive(Clone, Default)]
pub struct DummyHandles {
    pub scanners: HashMap<CoinType, Arc<DummyScanner>>,
    pub sender: Option<Arc<DummySender>>,
}

#[derive(Clone)]
pub struct AppState {
    pub teller: Arc<TellerService>,
    pub dummy: DummyHandles,
}

#[cfg(test)]
pub mod testing {
    //! Assembles an [`AppState`] over in-memory fakes for handler tests.

    use super::{AppState, DummyHandles};
    use std::sync::Arc;
    use teller_core::addrs::{AddrManager, AddressPool};
    use teller_core::coin::CoinType;
    use teller_core::config::TellerConfig;
    use teller_core::exchange::{ExchangeStore, Exchanger};
    use teller_core::registry::{
        CatalogEntry, DummyVerifier, MemoryCatalog, RegistryStore, ReservationRegistry,
        ReservationStatus,
    };
    use teller_core::scanner::{DepositNote, DummyScanner, Multiplexer};
    use teller_core::sender::DummySender;
    use teller_core::storage::open_db;
    use teller_core::teller::TellerService;
    use tokio::sync::mpsc;

    pub struct TestState {
        pub state: AppState,
        /// Receiving end of the dummy BTC scanner's deposit stream.
        pub deposits: mpsc::Receiver<DepositNote>,
        pub sender: Arc<DummySender>,
        _dir: tempfile::TempDir,
    }

    /// A dummy-mode app state with one BTC scanner fake, a sender fake,
    /// and one catalog box.
    pub async fn dummy_state() -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open_db(dir.path().join("test.db")).unwrap());
        let store = ExchangeStore::new(db.clone()).unwrap();

        let mut addr_manager = AddrManager::new();
        addr_manager
            .push_pool(
                CoinType::Btc,
                AddressPool::new(
                    db.clone(),
                    &["14JwrdSxYXPxSi6crLKVwR4k2dbjfVZ3xj".to_string()],
                    "used_btc_addresses",
                )
                .unwrap(),
            )
            .unwrap();

        let verifier: Arc<DummyVerifier> = Arc::new(DummyVerifier::accepting_all());
        let registry = Arc::new(ReservationRegistry::new(
            RegistryStore::new(db.clone()).unwrap(),
            verifier.clone(),
            5,
        ));
        let catalog = MemoryCatalog::new(vec![CatalogEntry {
            kitty_id: "42".to_string(),
            status: ReservationStatus::Available,
            price_btc: 100_000,
            price_sky: 5_000_000,
        }]);
        registry.sync_catalog(&catalog, 10).await.unwrap();

        let (scanner, deposits) = DummyScanner::new(CoinType::Btc, 10);
        let sender = Arc::new(DummySender::new());

        let multiplexer = Arc::new(Multiplexer::new());
        let exchanger = Exchanger::new(store.clone(), multiplexer, sender.clone());
        let teller = Arc::new(TellerService::new(
            TellerConfig::default(),
            store,
            exchanger,
            Arc::new(addr_manager),
            registry,
            verifier,
        ));

        let mut dummy = DummyHandles::default();
        dummy.scanners.insert(CoinType::Btc, scanner);
        dummy.sender = Some(sender.clone());

        TestState {
            state: AppState { teller, dummy },
            deposits,
            sender,
            _dir: dir,
        }
    }
}
