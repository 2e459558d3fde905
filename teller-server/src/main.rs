//! Kitty box teller daemon.
//!
//! Mediates between incoming BTC/SKY deposits and delivery of kitty boxes
//! on the kitty ledger: reservations bind deposit addresses, scanners watch
//! the chains, and the exchange pipeline turns confirmed payments into
//! signed box transfers.

mod api;
mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use state::{AppState, DummyHandles};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use teller_core::addrs::{load_address_file, AddrManager, AddressPool};
use teller_core::coin::CoinType;
use teller_core::exchange::{Exchange, ExchangeStore, Exchanger};
use teller_core::registry::{
    Catalog, HttpVerifier, KittyApiClient, RegistryStore, ReservationRegistry, Verifier,
};
use teller_core::scanner::{
    BlockScanner, BtcRpcClient, DummyScanner, Multiplexer, ScanSetHandle, ScanStore, SkyRpcClient,
};
use teller_core::sender::{
    BoxSender, DummySender, KittyLedgerClient, SendService, SendServiceConfig,
};
use teller_core::storage::open_db;
use teller_core::teller::{run_delivery_updates, TellerService};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Buffer size of each scanner's deposit channel.
const DEPOSIT_BUFFER: usize = 100;
/// Buffer size of the delivery event channel.
const DELIVERED_BUFFER: usize = 32;
/// Catalog page size used for the startup sync.
const CATALOG_PAGE_SIZE: u64 = 50;

/// Kitty box teller - crypto payments in, collectibles out
#[derive(Parser, Debug)]
#[command(name = "teller-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./teller.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    tracing::info!("Starting teller-server v{}", env!("CARGO_PKG_VERSION"));

    let cfg = config::load(&args.config).inspect_err(|err| {
        tracing::error!(error = %err, "Failed to load configuration");
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let db = Arc::new(open_db(&cfg.dbfile).inspect_err(|err| {
        tracing::error!(error = %err, dbfile = ?cfg.dbfile, "Failed to open database");
    })?);

    // -- Address pools -----------------------------------------------------
    let mut addr_manager = AddrManager::new();
    let btc_addresses = load_address_file(&cfg.btc_addresses)?;
    addr_manager.push_pool(
        CoinType::Btc,
        AddressPool::new(db.clone(), &btc_addresses, "used_btc_addresses")?,
    )?;
    let sky_addresses = load_address_file(&cfg.sky_addresses)?;
    addr_manager.push_pool(
        CoinType::Sky,
        AddressPool::new(db.clone(), &sky_addresses, "used_sky_addresses")?,
    )?;
    let addr_manager = Arc::new(addr_manager);

    // -- Stores ------------------------------------------------------------
    let scan_store = ScanStore::new(db.clone())?;
    let exchange_store = ExchangeStore::new(db.clone())?;
    let registry_store = RegistryStore::new(db.clone())?;

    // -- Registry + catalog sync (fatal on failure) ------------------------
    let verifier: Arc<dyn Verifier> = Arc::new(HttpVerifier::new(&cfg.verifier_addr));
    let registry = Arc::new(ReservationRegistry::new(
        registry_store,
        verifier.clone(),
        cfg.teller.max_bound_addresses,
    ));
    let catalog: Arc<dyn Catalog> = Arc::new(KittyApiClient::new(&cfg.kitty_api_addr));
    registry
        .sync_catalog(catalog.as_ref(), CATALOG_PAGE_SIZE)
        .await
        .inspect_err(|err| {
            tracing::error!(error = %err, "Catalog synchronization failed");
        })?;

    // -- Shutdown plumbing -------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(8);
    let mut join_handles: Vec<JoinHandle<()>> = Vec::new();

    // -- Scanners + multiplexer --------------------------------------------
    let multiplexer = Arc::new(Multiplexer::new());
    let mut dummy_handles = DummyHandles::default();

    if cfg.dummy.scanner {
        tracing::info!("Dummy mode: scanners replaced by in-memory fakes");
        for coin in CoinType::ALL {
            let (scanner, deposits_rx) = DummyScanner::new(coin, DEPOSIT_BUFFER);
            multiplexer.add_scanner(coin, scanner.clone(), deposits_rx)?;
            dummy_handles.scanners.insert(coin, scanner);
        }
    } else {
        if cfg.btc_scanner.enabled {
            let (deposits_tx, deposits_rx) = mpsc::channel(DEPOSIT_BUFFER);
            let client =
                BtcRpcClient::new(&cfg.btc_rpc.server, &cfg.btc_rpc.user, &cfg.btc_rpc.pass);
            let scanner = BlockScanner::new(
                CoinType::Btc,
                Box::new(client),
                scan_store.clone(),
                cfg.btc_scanner.scan_config(DEPOSIT_BUFFER),
                deposits_tx,
                shutdown_rx.clone(),
            );
            multiplexer.add_scanner(
                CoinType::Btc,
                Arc::new(ScanSetHandle::new(scan_store.clone(), CoinType::Btc)),
                deposits_rx,
            )?;
            join_handles.push(spawn_scanner("btc", scanner, fatal_tx.clone()));
        }
        if cfg.sky_scanner.enabled {
            let (deposits_tx, deposits_rx) = mpsc::channel(DEPOSIT_BUFFER);
            let client = SkyRpcClient::new(&cfg.sky_rpc_address);
            let scanner = BlockScanner::new(
                CoinType::Sky,
                Box::new(client),
                scan_store.clone(),
                cfg.sky_scanner.scan_config(DEPOSIT_BUFFER),
                deposits_tx,
                shutdown_rx.clone(),
            );
            multiplexer.add_scanner(
                CoinType::Sky,
                Arc::new(ScanSetHandle::new(scan_store.clone(), CoinType::Sky)),
                deposits_rx,
            )?;
            join_handles.push(spawn_scanner("sky", scanner, fatal_tx.clone()));
        }
    }

    let notes_rx = multiplexer.take_deposits()?;
    {
        let mux = multiplexer.clone();
        let mux_shutdown = shutdown_rx.clone();
        join_handles.push(tokio::spawn(async move {
            mux.multiplex(mux_shutdown).await;
        }));
    }

    // -- Sender ------------------------------------------------------------
    let sender: Arc<dyn BoxSender> = if cfg.dummy.sender {
        tracing::info!("Dummy mode: sender replaced by in-memory fake");
        let dummy = Arc::new(DummySender::new());
        dummy_handles.sender = Some(dummy.clone());
        dummy
    } else {
        let client = Arc::new(KittyLedgerClient::new(
            &cfg.kitty_client_addr,
            &cfg.box_exchanger.genesis_key,
        ));
        let (service, retry_sender) =
            SendService::new(client, SendServiceConfig::default(), shutdown_rx.clone());
        join_handles.push(tokio::spawn(service.run()));
        Arc::new(retry_sender)
    };

    // -- Exchange pipeline -------------------------------------------------
    let (delivered_tx, delivered_rx) = mpsc::channel(DELIVERED_BUFFER);
    let exchange = Exchange::new(
        exchange_store.clone(),
        notes_rx,
        sender.clone(),
        cfg.box_exchanger.send_config(),
        shutdown_rx.clone(),
        Some(delivered_tx),
    );
    {
        let fatal = fatal_tx.clone();
        join_handles.push(tokio::spawn(async move {
            if let Err(err) = exchange.run().await {
                let _ = fatal.send(format!("exchange: {err}")).await;
            }
        }));
    }

    join_handles.push(tokio::spawn(run_delivery_updates(
        registry.clone(),
        catalog.clone(),
        delivered_rx,
        shutdown_rx.clone(),
    )));

    // -- Teller service + HTTP ---------------------------------------------
    let exchanger = Exchanger::new(exchange_store.clone(), multiplexer.clone(), sender.clone());
    let teller = Arc::new(TellerService::new(
        cfg.teller.clone(),
        exchange_store,
        exchanger,
        addr_manager,
        registry,
        verifier,
    ));
    let app_state = AppState {
        teller,
        dummy: dummy_handles,
    };
    let router = server::build_router(app_state);

    // Stop serving on a signal or on the first fatal component failure.
    let fatal_reason: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let shutdown_fut = {
        let fatal_reason = fatal_reason.clone();
        async move {
            tokio::select! {
                _ = shutdown::shutdown_signal() => {}
                Some(reason) = fatal_rx.recv() => {
                    tracing::error!(reason, "Fatal component failure, shutting down");
                    if let Ok(mut slot) = fatal_reason.lock() {
                        *slot = Some(reason);
                    }
                }
            }
        }
    };
    let serve_result = server::run_server(router, cfg.http_addr, shutdown_fut).await;

    // -- Graceful shutdown sequence ----------------------------------------
    tracing::info!("Signaling components to shut down...");
    let _ = shutdown_tx.send(true);
    for handle in join_handles {
        let _ = handle.await;
    }
    tracing::info!("Server shutdown complete");

    serve_result?;
    let fatal = fatal_reason.lock().ok().and_then(|mut slot| slot.take());
    match fatal {
        Some(reason) => Err(anyhow::anyhow!(reason)),
        None => Ok(()),
    }
}

fn spawn_scanner(
    name: &'static str,
    scanner: BlockScanner,
    fatal_tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = scanner.run().await {
            tracing::error!(scanner = name, error = %err, "Scanner failed");
            let _ = fatal_tx.send(format!("{name} scanner: {err}")).await;
        }
    })
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
