//! Node runtime
//!
//! Opens the stores, starts the exchange and serves the HTTP API until
//! Ctrl+C.

use libp2p::identity::Keypair;
use libp2p::PeerId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use crate::api::create_router;
use crate::config::Config;
use crate::exchange::{Exchange, ExchangeError};
use crate::filestore::{FileManager, FileStore};
use crate::network::{NullNetwork, NullRouting};
use crate::rocks_store::RocksBlockStore;
use crate::storage::{BlockStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("Failed to bind API server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Run a node with the given configuration
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    let keypair = Keypair::generate_secp256k1();
    let local_peer = PeerId::from(keypair.public());

    std::fs::create_dir_all(&config.data_dir).map_err(StorageError::from)?;
    let rocks = Arc::new(RocksBlockStore::open(config.db_path())?);
    info!("Block database at {}", config.db_path().display());

    let store: Arc<dyn BlockStore> = match &config.filestore_root {
        Some(root) => {
            let files = FileManager::open(config.filestore_index_path(), root)?;
            info!("Serving file references under {}", files.root().display());
            Arc::new(FileStore::new(Arc::clone(&rocks) as Arc<dyn BlockStore>, files))
        }
        None => Arc::clone(&rocks) as Arc<dyn BlockStore>,
    };

    let exchange = Arc::new(Exchange::new(
        config.exchange.clone(),
        local_peer,
        store,
        Arc::new(NullNetwork),
        Arc::new(NullRouting),
    ));
    exchange.start().await?;
    info!("Node started with peer ID: {}", local_peer);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| NodeError::Bind { addr, source })?;
    info!("HTTP API listening on http://{}", addr);

    let router = create_router(Arc::clone(&exchange), Some(rocks));
    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received Ctrl+C, shutting down...");
    });

    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
    }

    exchange.stop().await;
    info!("Node stopped");
    Ok(())
}
