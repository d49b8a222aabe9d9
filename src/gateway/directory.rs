use std::{fmt, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};

use super::GatewayAddress;
use crate::error::BoxError;

/// Receives unsolicited gateway list snapshots from a push-capable directory.
pub trait GatewayListListener: Send + Sync {
    /// Replaces the known gateway list with `gateways`.
    fn gateway_list_updated(&self, gateways: Vec<GatewayAddress>);
}

/// Source of the gateways a client may connect to.
pub trait GatewayDirectory: Send + Sync + 'static {
    /// Lists the gateways currently registered with the cluster.
    fn get_gateways(&self) -> BoxFuture<'_, Result<Vec<GatewayAddress>, BoxError>>;

    /// How long the directory may keep listing a gateway after it failed.
    ///
    /// Gateways marked dead are excluded for this long even when the directory still lists them.
    fn max_staleness(&self) -> Duration;

    /// Whether the directory can report changes without being polled.
    fn is_updatable(&self) -> bool;

    /// Registers `listener` for pushed updates. Returns whether the directory accepted it.
    fn subscribe(&self, listener: Arc<dyn GatewayListListener>) -> bool {
        let _ = listener;
        false
    }
}

/// A directory with a fixed list of gateways.
#[derive(Clone)]
pub struct StaticGatewayDirectory {
    gateways: Vec<GatewayAddress>,
    max_staleness: Duration,
}

impl StaticGatewayDirectory {
    /// Default time a dead gateway stays excluded.
    pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_secs(60);

    /// Creates a directory always listing `gateways`.
    pub fn new(gateways: impl IntoIterator<Item = GatewayAddress>) -> Self {
        StaticGatewayDirectory {
            gateways: gateways.into_iter().collect(),
            max_staleness: Self::DEFAULT_MAX_STALENESS,
        }
    }

    /// Sets how long a gateway marked dead stays excluded.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = max_staleness;
        self
    }
}

impl GatewayDirectory for StaticGatewayDirectory {
    fn get_gateways(&self) -> BoxFuture<'_, Result<Vec<GatewayAddress>, BoxError>> {
        let gateways = self.gateways.clone();
        async move { Ok(gateways) }.boxed()
    }

    fn max_staleness(&self) -> Duration {
        self.max_staleness
    }

    fn is_updatable(&self) -> bool {
        false
    }
}

impl fmt::Debug for StaticGatewayDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticGatewayDirectory")
            .field("gateways", &self.gateways.len())
            .field("max_staleness", &self.max_staleness)
            .finish()
    }
}
