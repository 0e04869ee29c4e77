//! Process-level orchestration: the atomic configuration snapshot, listener
//! lifecycle, and signal handling.
//!
//! The active [`GatewayConfig`] lives behind one `ArcSwap`; every other
//! component takes a single atomic load per operation boundary. Reloads are
//! serialized by the listener-map lock and follow a strict order: parse and
//! validate the file (any failure aborts with the live snapshot untouched),
//! publish the new snapshot, then diff the listener set. Sessions in flight
//! keep the snapshot they captured at accept time and are never disturbed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use ws_bridge::{GatewayConfig, WsListener};

use crate::config;

pub struct Server {
    config: Arc<ArcSwap<GatewayConfig>>,
    config_path: PathBuf,
    /// Serving listeners by configured address. The lock also serializes
    /// reloads.
    listeners: Mutex<HashMap<String, WsListener>>,
}

impl Server {
    /// Publish the initial snapshot and bind every configured listener.
    /// Any bind failure at startup is fatal.
    pub async fn new(config_path: PathBuf, initial: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        let server = Arc::new(Self {
            config: Arc::new(ArcSwap::from_pointee(initial)),
            config_path,
            listeners: Mutex::new(HashMap::new()),
        });

        let mut listeners = server.listeners.lock().await;
        server
            .sync_listeners(&mut listeners, true)
            .await
            .context("failed to set up listeners")?;
        drop(listeners);

        info!("server running");
        Ok(server)
    }

    /// The live snapshot handle, shared with every listener.
    pub fn config(&self) -> Arc<ArcSwap<GatewayConfig>> {
        Arc::clone(&self.config)
    }

    /// Run until a termination signal arrives. SIGHUP triggers a reload.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sighup = signal(SignalKind::hangup()).context("failed to register SIGHUP")?;
            let mut sigterm =
                signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT (ctrl-c)");
                        break;
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM");
                        break;
                    }
                    _ = sighup.recv() => {
                        let server = Arc::clone(self);
                        tokio::spawn(async move {
                            let _ = server.rehash().await;
                        });
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        self.shutdown().await;
        Ok(())
    }

    /// Reload the configuration file and apply it.
    pub async fn rehash(&self) -> anyhow::Result<()> {
        info!("attempting rehash");

        // Only one rehash at a time; the listener lock is the serializer.
        let mut listeners = self.listeners.lock().await;

        let new_config = match config::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load config file; keeping current configuration");
                return Err(e.into());
            }
        };

        let old = self.config.load();
        if new_config.log_level != old.log_level {
            info!(
                from = %old.log_level,
                to = %new_config.log_level,
                "log-level changed; the new value takes effect on restart"
            );
        }
        drop(old);

        // Validation passed: publish, then converge the listener set.
        self.config.store(Arc::new(new_config));
        if let Err(e) = self.sync_listeners(&mut listeners, false).await {
            error!(error = %e, "failed to rehash listeners");
            return Err(e);
        }

        info!("rehash completed successfully");
        Ok(())
    }

    /// Converge the serving listener set onto the published snapshot.
    ///
    /// Addresses present on both sides get an in-place reload; one that
    /// cannot be reloaded (fundamental mode change) is stopped and recreated
    /// below. Removed addresses are stopped; new ones are bound. With
    /// `fatal_binds`, the first bind failure aborts (startup); otherwise
    /// failures are logged and the remaining listeners still converge.
    async fn sync_listeners(
        &self,
        listeners: &mut HashMap<String, WsListener>,
        fatal_binds: bool,
    ) -> anyhow::Result<()> {
        let snapshot = self.config.load_full();

        let current: Vec<String> = listeners.keys().cloned().collect();
        for addr in current {
            match snapshot.listeners.get(&addr) {
                Some(spec) => {
                    if let Err(e) = listeners[&addr].reload(&addr, spec.clone()) {
                        warn!(%addr, error = %e, "in-place reload refused; recreating listener");
                        if let Some(listener) = listeners.remove(&addr) {
                            listener.stop();
                        }
                    }
                }
                None => {
                    if let Some(listener) = listeners.remove(&addr) {
                        listener.stop();
                    }
                    info!(%addr, "stopped listening");
                }
            }
        }

        let mut first_error = None;
        for (addr, spec) in &snapshot.listeners {
            if listeners.contains_key(addr) {
                continue;
            }
            match WsListener::bind(addr, spec.clone(), snapshot.unix_bind_mode, self.config()).await
            {
                Ok(listener) => {
                    listeners.insert(addr.clone(), listener);
                }
                Err(e) => {
                    error!(%addr, error = %e, "couldn't listen");
                    if first_error.is_none() {
                        first_error = Some(anyhow::Error::from(e));
                    }
                    if fatal_binds {
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(e) if fatal_binds => Err(e),
            _ => Ok(()),
        }
    }

    async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        for (addr, listener) in listeners.drain() {
            listener.stop();
            info!(%addr, "stopped listening");
        }
        info!("exiting");
    }
}
