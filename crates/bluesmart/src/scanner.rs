//! Advertisement Scanner
//!
//! The scanner is the single delivery path from the radio to the registry:
//! the transport pushes [`ScanResult`]s into a bounded channel and one task
//! feeds them to [`DeviceRegistry::process_advertisement`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::registry::DeviceRegistry;
use crate::transport::{ScanMode, ScanResult, Transport, TransportError};

/// How long `stop` lets the pump drain buffered advertisements
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Feeds advertisements from the transport into a registry
pub struct Scanner {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    config: ScannerConfig,
    pump: Mutex<Option<JoinHandle<u64>>>,
}

impl Scanner {
    /// Create a new scanner using the registry's transport
    pub fn new(registry: Arc<DeviceRegistry>, config: ScannerConfig) -> Self {
        let transport = registry.transport().clone();
        Self {
            registry,
            transport,
            config,
            pump: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> ScanMode {
        self.config.mode
    }

    pub fn is_running(&self) -> bool {
        self.pump.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the radio scan and the pump task
    pub fn start(&self) -> Result<(), TransportError> {
        let mut pump = self.pump.lock();
        if pump.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<ScanResult>(self.config.buffer.max(1));
        self.transport.start_scan(self.config.mode, tx)?;

        let registry = self.registry.clone();
        *pump = Some(tokio::spawn(async move {
            let mut delivered = 0u64;
            while let Some(result) = rx.recv().await {
                registry.process_advertisement(&result.data, &result.address, result.rssi);
                delivered += 1;
            }
            delivered
        }));

        info!(mode = ?self.config.mode, "Scan started");
        Ok(())
    }

    /// Stop the radio scan and wait for buffered advertisements to be processed
    ///
    /// Returns the number of advertisements delivered since `start`.
    pub async fn stop(&self) -> u64 {
        self.transport.stop_scan();
        let handle = self.pump.lock().take();
        let Some(mut handle) = handle else {
            return 0;
        };

        match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
            Ok(Ok(delivered)) => {
                info!(delivered, "Scan stopped");
                delivered
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Scan pump failed");
                0
            }
            Err(_) => {
                debug!("Transport kept the scan channel open; aborting pump");
                handle.abort();
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::device::DeviceProfile;
    use crate::transport::SimulatedTransport;

    #[tokio::test]
    async fn test_pump_feeds_registry() {
        let sim = SimulatedTransport::new();
        let registry = Arc::new(DeviceRegistry::new(Arc::new(sim.clone())));
        registry.register_profile(DeviceProfile::new("tag").with_match(0, [0xAA]));

        let scanner = Scanner::new(registry.clone(), ScannerConfig::default());
        assert!(!sim.advertise("AA:00:00:00:00:01", -50, vec![0xAA]));

        scanner.start().unwrap();
        assert!(scanner.is_running());
        assert!(sim.is_scanning());
        assert!(sim.advertise("AA:00:00:00:00:01", -50, vec![0xAA]));
        assert!(sim.advertise("AA:00:00:00:00:02", -50, vec![0xAA, 0x01]));
        assert!(sim.advertise("AA:00:00:00:00:01", -49, vec![0xAA]));

        assert_eq!(scanner.stop().await, 3);
        assert!(!sim.is_scanning());
        assert_eq!(registry.len(), 2);
        let device = registry.device(&Address::new("AA:00:00:00:00:01")).unwrap();
        assert_eq!(device.rssi(), Some(-49));
    }
}
