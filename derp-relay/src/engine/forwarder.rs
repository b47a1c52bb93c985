//! Forwarder registrations: which mesh connections can reach a remote key.

use super::PacketForwarder;
use dashmap::DashMap;
use derp_types::NodePublic;
use std::sync::Arc;

/// Map from remote node key to the forwarders that reach it.
///
/// A key may be reachable through several mesh connections at once. The
/// earliest surviving registration is the one used for delivery.
#[derive(Default)]
pub struct ForwarderTable {
    entries: DashMap<NodePublic, Vec<Arc<dyn PacketForwarder>>>,
}

impl std::fmt::Debug for ForwarderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderTable")
            .field("keys", &self.entries.len())
            .finish()
    }
}

/// Forwarder identity is the allocation, not the value.
fn same(a: &Arc<dyn PacketForwarder>, b: &Arc<dyn PacketForwarder>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl ForwarderTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `forwarder` for `key`. Returns false if it was already registered.
    pub fn add(&self, key: NodePublic, forwarder: Arc<dyn PacketForwarder>) -> bool {
        let mut list = self.entries.entry(key).or_default();
        if list.iter().any(|f| same(f, &forwarder)) {
            return false;
        }
        list.push(forwarder);
        if list.len() > 1 {
            tracing::debug!("Key {:?} now reachable via {} forwarders", key, list.len());
        }
        true
    }

    /// Remove exactly `forwarder` for `key`.
    ///
    /// Returns false when `forwarder` does not hold `key`; the table is
    /// unchanged in that case.
    pub fn remove(&self, key: &NodePublic, forwarder: &Arc<dyn PacketForwarder>) -> bool {
        let removed = match self.entries.get_mut(key) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|f| !same(f, forwarder));
                list.len() != before
            }
            None => false,
        };
        if removed {
            self.entries.remove_if(key, |_, list| list.is_empty());
        } else {
            tracing::debug!("Ignoring stale forwarder removal for {:?}", key);
        }
        removed
    }

    /// The preferred forwarder for `key`.
    pub fn get(&self, key: &NodePublic) -> Option<Arc<dyn PacketForwarder>> {
        self.entries.get(key).and_then(|list| list.first().cloned())
    }

    /// Whether any forwarder is registered for `key`.
    pub fn contains(&self, key: &NodePublic) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of keys with at least one forwarder.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Null;

    #[async_trait]
    impl PacketForwarder for Null {
        async fn forward_packet(
            &self,
            _src: NodePublic,
            _dst: NodePublic,
            _packet: Bytes,
        ) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn forwarder() -> Arc<dyn PacketForwarder> {
        Arc::new(Null)
    }

    fn key(n: u8) -> NodePublic {
        NodePublic::from_bytes([n; 32])
    }

    #[test]
    fn add_then_remove() {
        let table = ForwarderTable::new();
        let fwd = forwarder();

        assert!(table.add(key(1), fwd.clone()));
        assert!(table.contains(&key(1)));
        assert!(table.remove(&key(1), &fwd));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let table = ForwarderTable::new();
        let fwd = forwarder();

        assert!(table.add(key(1), fwd.clone()));
        assert!(!table.add(key(1), fwd.clone()));
        assert!(table.remove(&key(1), &fwd));
        assert!(!table.contains(&key(1)));
    }

    #[test]
    fn earliest_registration_is_preferred() {
        let table = ForwarderTable::new();
        let first = forwarder();
        let second = forwarder();

        table.add(key(1), first.clone());
        table.add(key(1), second.clone());
        assert!(same(&table.get(&key(1)).unwrap(), &first));

        table.remove(&key(1), &first);
        assert!(same(&table.get(&key(1)).unwrap(), &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_removal_is_a_no_op() {
        let table = ForwarderTable::new();
        let holder = forwarder();
        let stranger = forwarder();

        table.add(key(1), holder.clone());
        assert!(!table.remove(&key(1), &stranger));
        assert!(!table.remove(&key(2), &holder));
        assert!(same(&table.get(&key(1)).unwrap(), &holder));
    }
}
