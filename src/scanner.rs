//! Unprovisioned device scan

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::Result;
use crate::mesh::{MeshClient, ScanOptions};

/// Collects identities of unprovisioned devices seen during a scan
#[derive(Debug, Default)]
pub struct Scanner {
    found: Mutex<BTreeSet<Uuid>>,
}

impl Scanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scan result; the identity is the first 16 bytes of `data`
    pub fn scan_result(&self, rssi: i16, data: &[u8], options: &ScanOptions) {
        let Some(uuid) = data.get(..16).and_then(|bytes| Uuid::from_slice(bytes).ok()) else {
            tracing::warn!(data = %hex::encode(data), "scan result without device identity");
            return;
        };

        let new = self
            .found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid);
        if new {
            tracing::info!(%uuid, rssi, "found unprovisioned node");
        }
        if !options.is_empty() {
            tracing::debug!(%uuid, ?options, "scan options not used");
        }
    }

    /// Identities seen so far
    #[must_use]
    pub fn found(&self) -> Vec<Uuid> {
        self.found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Scan for `seconds` and return everything found
    ///
    /// # Errors
    ///
    /// Returns error if the scan cannot be started
    pub async fn scan(&self, mesh: &MeshClient, seconds: u16) -> Result<Vec<Uuid>> {
        tracing::info!(seconds, "scanning for unprovisioned devices");
        mesh.interface().unprovisioned_scan(seconds).await?;
        tokio::time::sleep(Duration::from_secs(u64::from(seconds))).await;

        let found = self.found();
        tracing::info!(count = found.len(), "scan finished");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_taken_from_leading_bytes() {
        let scanner = Scanner::new();
        let uuid = Uuid::new_v4();

        let mut data = uuid.as_bytes().to_vec();
        data.extend_from_slice(&[0x40, 0x00]);
        scanner.scan_result(-70, &data, &ScanOptions::new());
        scanner.scan_result(-65, &data, &ScanOptions::new());

        assert_eq!(scanner.found(), vec![uuid]);
    }

    #[test]
    fn short_data_is_ignored() {
        let scanner = Scanner::new();
        scanner.scan_result(-70, &[1, 2, 3], &ScanOptions::new());
        assert!(scanner.found().is_empty());
    }
}
