use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::storage::{PortConfig, Storage, StorageError};

/// Hands out non-conflicting TCP ports to worktree sessions and dev servers.
///
/// Carries no state of its own beyond the configured range; assignments live
/// in storage, and every candidate is additionally probed against the OS so
/// ports occupied by unrelated processes are skipped.
pub struct PortAllocator {
    storage: Arc<Storage>,
    config: PortConfig,
}

impl PortAllocator {
    pub fn new(storage: Arc<Storage>, config: PortConfig) -> Self {
        Self { storage, config }
    }

    /// Walk the configured range, skipping recorded assignments and occupied
    /// ports. Exhaustion degrades to a pseudo-random in-range candidate
    /// rather than failing the caller.
    pub fn find_available_port(&self) -> u16 {
        let assigned = self.assigned_ports();
        let increment = self.config.increment.max(1);

        for i in 0..self.config.max_ports {
            let offset = match i.checked_mul(increment) {
                Some(offset) => offset,
                None => break,
            };
            let port = match self.config.base_port.checked_add(offset) {
                Some(port) => port,
                None => break,
            };
            if assigned.contains(&port) {
                continue;
            }
            if Self::port_is_free(port) {
                return port;
            }
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let offset = (nanos % u32::from(self.config.max_ports.max(1))) as u16;
        let fallback = self
            .config
            .base_port
            .saturating_add(offset.saturating_mul(increment));
        tracing::warn!("Port range exhausted; falling back to {}", fallback);
        fallback
    }

    fn port_is_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Record a port against a session. Guarded only by the allocation check;
    /// cross-process conflicts surface as spawn errors by design.
    pub fn assign_port(&self, session_id: &str, port: u16) -> Result<(), StorageError> {
        self.storage
            .update_session(session_id, |s| s.dev_server_port = Some(port))?;
        Ok(())
    }

    pub fn release_port(&self, session_id: &str) -> Result<(), StorageError> {
        self.storage
            .update_session(session_id, |s| s.dev_server_port = None)?;
        Ok(())
    }

    pub fn get_session_port(&self, session_id: &str) -> Result<Option<u16>, StorageError> {
        Ok(self.storage.get_session(session_id)?.dev_server_port)
    }

    /// Every port recorded against any session or dev server. Listing
    /// failures degrade to an empty set; the OS probe still guards.
    fn assigned_ports(&self) -> HashSet<u16> {
        let mut assigned = HashSet::new();
        if let Ok(sessions) = self.storage.list_sessions() {
            assigned.extend(sessions.iter().filter_map(|s| s.dev_server_port));
        }
        if let Ok(servers) = self.storage.list_servers() {
            for server in servers {
                assigned.extend(server.ports.iter().copied());
            }
        }
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SessionRecord;
    use tempfile::TempDir;

    fn allocator(base: u16) -> (TempDir, Arc<Storage>, PortAllocator) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new_with_base(dir.path().to_path_buf()).unwrap());
        let config = PortConfig {
            base_port: base,
            increment: 1,
            max_ports: 20,
        };
        let allocator = PortAllocator::new(Arc::clone(&storage), config);
        (dir, storage, allocator)
    }

    #[test]
    fn test_find_available_port_is_deterministic() {
        let (_dir, _storage, allocator) = allocator(42110);
        let first = allocator.find_available_port();
        let second = allocator.find_available_port();
        assert_eq!(first, second);
        assert!(first >= 42110);
    }

    #[test]
    fn test_assigned_port_is_skipped_until_released() {
        let (_dir, storage, allocator) = allocator(42140);
        let record = SessionRecord::new("s1", "n", "/tmp", "claude");
        storage.create_session(&record).unwrap();

        let first = allocator.find_available_port();
        allocator.assign_port("s1", first).unwrap();
        assert_eq!(allocator.get_session_port("s1").unwrap(), Some(first));

        let second = allocator.find_available_port();
        assert_ne!(first, second);

        allocator.release_port("s1").unwrap();
        assert_eq!(allocator.find_available_port(), first);
    }

    #[test]
    fn test_os_occupied_port_is_skipped() {
        let (_dir, _storage, allocator) = allocator(42170);
        let first = allocator.find_available_port();

        let _holder = TcpListener::bind(("127.0.0.1", first)).unwrap();
        let second = allocator.find_available_port();
        assert_ne!(first, second);
    }

    #[test]
    fn test_exhausted_range_falls_back_in_range() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new_with_base(dir.path().to_path_buf()).unwrap());
        // Every candidate in this tiny range is recorded as assigned
        let record = SessionRecord::new("s1", "n", "/tmp", "claude");
        storage.create_session(&record).unwrap();
        let config = PortConfig {
            base_port: 42200,
            increment: 1,
            max_ports: 1,
        };
        let allocator = PortAllocator::new(Arc::clone(&storage), config);
        allocator.assign_port("s1", 42200).unwrap();

        let fallback = allocator.find_available_port();
        assert_eq!(fallback, 42200);
    }
}
