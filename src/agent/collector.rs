//! Per-cycle yield collection

use crate::config::Network;
use crate::model::NetworkYieldSample;
use crate::services::{with_timeout, YieldOracle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Queries the oracle for every configured network
pub struct YieldCollector {
    oracle: Arc<dyn YieldOracle>,
    networks: Vec<Network>,
    timeout: Duration,
}

impl YieldCollector {
    pub fn new(oracle: Arc<dyn YieldOracle>, networks: Vec<Network>, timeout: Duration) -> Self {
        Self {
            oracle,
            networks,
            timeout,
        }
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// One sample per network that answered, in configured order.
    ///
    /// A network whose oracle call fails, times out or returns nonsense is
    /// skipped for this cycle; the rest are still returned.
    pub async fn collect(&self) -> Vec<NetworkYieldSample> {
        let mut samples = Vec::with_capacity(self.networks.len());

        for &network in &self.networks {
            let quote = match with_timeout(
                "get_yield",
                self.timeout,
                self.oracle.get_yield(network),
            )
            .await
            {
                Ok(quote) => quote,
                Err(e) => {
                    warn!(network = %network, error = %e, "Yield unavailable, skipping network");
                    continue;
                }
            };

            if !quote.apr.is_finite() || quote.apr < 0.0 || !quote.tvl.is_finite() || quote.tvl < 0.0
            {
                warn!(
                    network = %network,
                    apr = quote.apr,
                    tvl = quote.tvl,
                    "Discarding invalid yield reading"
                );
                continue;
            }

            debug!(network = %network, apr = quote.apr, tvl = quote.tvl, "Collected yield");
            samples.push(NetworkYieldSample {
                network,
                network_id: network.chain_id(),
                apr: quote.apr,
                tvl: quote.tvl,
                timestamp: quote.timestamp,
            });
        }

        samples
    }
}
