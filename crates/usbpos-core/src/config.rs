//! Service configuration, loaded from and saved to TOML.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionSettings;
use crate::device::BindTarget;
use crate::encode::{EncodeOptions, FontSettings};

/// Configuration for a [`PrintService`](crate::service::PrintService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Restrict binding to this vendor id.
    pub vendor_id: Option<u16>,
    /// Restrict binding to this product id.
    pub product_id: Option<u16>,
    /// Pause between two jobs.
    pub job_interval_ms: u64,
    /// Wait after a detach before looking for the printer again.
    pub reconnect_grace_ms: u64,
    /// Bound on a single bulk transfer.
    pub transfer_timeout_ms: u64,
    /// Maximum number of pending jobs; unbounded when absent.
    pub queue_capacity: Option<usize>,
    pub encoding: EncodeOptions,
    pub font: FontSettings,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
            job_interval_ms: 1000,
            reconnect_grace_ms: 5000,
            transfer_timeout_ms: 5000,
            queue_capacity: None,
            encoding: EncodeOptions::default(),
            font: FontSettings::default(),
        }
    }
}

impl PrinterConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PrinterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A vid/pid pair pins the printer model; anything less takes the first printer.
    pub fn bind_target(&self) -> BindTarget {
        match (self.vendor_id, self.product_id) {
            (Some(vendor_id), Some(product_id)) => BindTarget::Ids {
                vendor_id,
                product_id,
            },
            _ => BindTarget::AnyPrinter,
        }
    }

    pub fn job_interval(&self) -> Duration {
        Duration::from_millis(self.job_interval_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            transfer_timeout: Duration::from_millis(self.transfer_timeout_ms),
        }
    }
}
