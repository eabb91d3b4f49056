//! [`BridgeContext`] – the one owned instance of every bridge component,
//! built at process start and shared with the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rosdeck_dialog::{DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL, DialogCorrelator, install_dialog_relay};
use rosdeck_middleware::{
    BroadcastHub, ChannelSubscriptionRegistry, DEFAULT_RETRY_INTERVAL, ServiceInvoker,
    TransportConnection, install_relays,
};
use tokio::task::JoinHandle;
use tracing::info;

/// Default deadline for `/robot/command` calls made over HTTP.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime knobs for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// rosbridge server, e.g. `ws://localhost:9090`.
    pub broker_url: String,
    pub retry_interval: Duration,
    pub dialog_ttl: Duration,
    pub sweep_interval: Duration,
    pub command_timeout: Duration,
}

impl BridgeSettings {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            dialog_ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

pub struct BridgeContext {
    pub transport: Arc<TransportConnection>,
    pub invoker: ServiceInvoker,
    pub registry: Arc<ChannelSubscriptionRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub correlator: Arc<DialogCorrelator>,
    settings: BridgeSettings,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeContext {
    /// Build every component and wire the relays. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(settings: BridgeSettings) -> Arc<Self> {
        let transport = Arc::new(
            TransportConnection::new(settings.broker_url.clone())
                .with_retry_interval(settings.retry_interval),
        );
        let registry = ChannelSubscriptionRegistry::attach(Arc::clone(&transport));
        let hub = Arc::new(BroadcastHub::new());
        let correlator = Arc::new(
            DialogCorrelator::new(transport.clone(), Arc::clone(&hub)).with_ttl(settings.dialog_ttl),
        );

        install_relays(&transport, &registry, &hub);
        install_dialog_relay(&transport, &registry, &correlator);

        Arc::new(Self {
            invoker: ServiceInvoker::new(Arc::clone(&transport)),
            transport,
            registry,
            hub,
            correlator,
            settings,
            sweeper: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn command_timeout(&self) -> Duration {
        self.settings.command_timeout
    }

    /// Connect to the broker and start the dialog sweeper.
    pub fn start(&self) {
        info!(url = %self.settings.broker_url, "starting bridge");
        self.transport.connect();
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(self.correlator.spawn_sweeper(self.settings.sweep_interval));
        }
    }

    /// Stop the sweeper and close the broker connection for good.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.transport.shutdown();
    }
}
