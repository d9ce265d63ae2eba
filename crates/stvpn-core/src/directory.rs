//! Server Directory
//!
//! In-memory catalog of known servers.
//!
//! The catalog is an immutable snapshot behind an `Arc`. Readers clone the
//! `Arc` and iterate without holding any lock; [`ServerDirectory::replace_all`]
//! builds a fresh snapshot and swaps the pointer, so nobody ever observes a
//! half-updated catalog.

use crate::admission::can_connect;
use crate::server::{CountryGroup, ServerDescriptor, ServerFilter, Tier};
use crate::subscription::Subscription;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::{debug, info};

/// One immutable version of the catalog
#[derive(Debug)]
struct Catalog {
    version: u64,
    servers: Vec<ServerDescriptor>,
}

/// Dashboard counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub total: usize,
    pub online: usize,
    pub free: usize,
    pub premium: usize,
}

/// Directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Duplicate server id: {0}")]
    DuplicateId(String),

    #[error("Server id must not be empty")]
    EmptyId,
}

/// Server catalog with atomic refresh
#[derive(Debug)]
pub struct ServerDirectory {
    current: RwLock<Arc<Catalog>>,
}

impl ServerDirectory {
    /// Create a directory seeded with `servers`
    pub fn new(servers: Vec<ServerDescriptor>) -> Result<Self, DirectoryError> {
        validate(&servers)?;
        Ok(Self {
            current: RwLock::new(Arc::new(Catalog {
                version: 1,
                servers,
            })),
        })
    }

    /// Create an empty directory
    pub fn empty() -> Self {
        Self {
            current: RwLock::new(Arc::new(Catalog {
                version: 0,
                servers: Vec::new(),
            })),
        }
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a whole new catalog.
    ///
    /// The new set is validated first; on error the old catalog stays.
    /// Returns the new catalog version.
    pub fn replace_all(&self, servers: Vec<ServerDescriptor>) -> Result<u64, DirectoryError> {
        validate(&servers)?;

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let version = guard.version + 1;
        let count = servers.len();
        *guard = Arc::new(Catalog { version, servers });
        drop(guard);

        info!("Server catalog refreshed: {} servers (v{})", count, version);
        Ok(version)
    }

    /// Catalog generation; bumped on every refresh
    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// All servers in insertion order
    pub fn list(&self) -> Vec<ServerDescriptor> {
        self.snapshot().servers.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Servers matching `filter`, in insertion order
    pub fn filter(&self, filter: &ServerFilter) -> Vec<ServerDescriptor> {
        self.snapshot()
            .servers
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect()
    }

    /// Look up a server by id
    pub fn by_id(&self, id: &str) -> Option<ServerDescriptor> {
        self.snapshot().servers.iter().find(|s| s.id == id).cloned()
    }

    /// Group servers by country, countries in first-seen order
    pub fn by_country(&self) -> Vec<CountryGroup> {
        let catalog = self.snapshot();
        let mut groups: Vec<CountryGroup> = Vec::new();

        for server in &catalog.servers {
            match groups.iter_mut().find(|g| g.country_code == server.country_code) {
                Some(group) => group.servers.push(server.clone()),
                None => groups.push(CountryGroup {
                    country: server.country.clone(),
                    country_code: server.country_code.clone(),
                    servers: vec![server.clone()],
                }),
            }
        }

        groups
    }

    /// Totals for the dashboard
    pub fn counts(&self) -> CatalogCounts {
        let catalog = self.snapshot();
        catalog
            .servers
            .iter()
            .fold(CatalogCounts::default(), |mut acc, s| {
                acc.total += 1;
                if s.is_online() {
                    acc.online += 1;
                }
                match s.tier {
                    Tier::Free => acc.free += 1,
                    Tier::Premium => acc.premium += 1,
                }
                acc
            })
    }

    /// Lowest-latency server `subscription` is admitted to.
    ///
    /// Unknown ping sorts last; ties go to the lower load, then to catalog
    /// order.
    pub fn fastest(&self, subscription: &Subscription, now: SystemTime) -> Option<ServerDescriptor> {
        let catalog = self.snapshot();

        let best = catalog
            .servers
            .iter()
            .enumerate()
            .filter(|(_, s)| can_connect(subscription, s, now).is_allowed())
            .min_by_key(|(index, s)| {
                (
                    s.ping.unwrap_or(u32::MAX),
                    s.load.unwrap_or(u8::MAX),
                    *index,
                )
            })
            .map(|(_, s)| s.clone());

        if let Some(ref server) = best {
            debug!("Fastest admitted server: {}", server);
        }
        best
    }
}

impl Default for ServerDirectory {
    fn default() -> Self {
        Self::empty()
    }
}

fn validate(servers: &[ServerDescriptor]) -> Result<(), DirectoryError> {
    let mut seen = HashSet::with_capacity(servers.len());
    for server in servers {
        if server.id.is_empty() {
            return Err(DirectoryError::EmptyId);
        }
        if !seen.insert(server.id.as_str()) {
            return Err(DirectoryError::DuplicateId(server.id.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerStatus;
    use std::time::Duration;

    fn stock() -> ServerDirectory {
        ServerDirectory::new(ServerDescriptor::default_catalog()).unwrap()
    }

    #[test]
    fn test_list_keeps_insertion_order() {
        let ids: Vec<_> = stock().list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5", "6"]);
    }

    #[test]
    fn test_by_id() {
        let dir = stock();
        assert_eq!(dir.by_id("5").unwrap().name, "Singapore");
        assert!(dir.by_id("42").is_none());
    }

    #[test]
    fn test_filter_by_search() {
        let dir = stock();
        let found = dir.filter(&ServerFilter::new().search("united"));
        let ids: Vec<_> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dup = vec![
            ServerDescriptor::new("a", "A"),
            ServerDescriptor::new("a", "B"),
        ];
        assert_eq!(
            ServerDirectory::new(dup).unwrap_err(),
            DirectoryError::DuplicateId("a".into())
        );
    }

    #[test]
    fn test_replace_all_swaps_atomically() {
        let dir = stock();
        let before = dir.list();
        let v1 = dir.version();

        let v2 = dir
            .replace_all(vec![ServerDescriptor::new("9", "Paris")])
            .unwrap();

        assert!(v2 > v1);
        assert_eq!(dir.len(), 1);
        // Snapshot taken before the refresh is untouched
        assert_eq!(before.len(), 6);
    }

    #[test]
    fn test_failed_replace_keeps_old_catalog() {
        let dir = stock();
        let version = dir.version();

        let err = dir.replace_all(vec![ServerDescriptor::new("", "Nameless")]);
        assert_eq!(err.unwrap_err(), DirectoryError::EmptyId);
        assert_eq!(dir.version(), version);
        assert_eq!(dir.len(), 6);
    }

    #[test]
    fn test_by_country_groups_in_first_seen_order() {
        let dir = ServerDirectory::new(vec![
            ServerDescriptor::new("1", "NY").with_location("New York", "United States", "us"),
            ServerDescriptor::new("2", "Tokyo").with_location("Tokyo", "Japan", "jp"),
            ServerDescriptor::new("3", "LA").with_location("Los Angeles", "United States", "us"),
        ])
        .unwrap();

        let groups = dir.by_country();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].country_code, "us");
        assert_eq!(groups[0].servers.len(), 2);
        assert_eq!(groups[1].country, "Japan");
    }

    #[test]
    fn test_counts() {
        let counts = stock().counts();
        assert_eq!(
            counts,
            CatalogCounts {
                total: 6,
                online: 4,
                free: 3,
                premium: 3,
            }
        );
    }

    #[test]
    fn test_fastest_respects_admission() {
        let dir = stock();
        let now = SystemTime::now();

        // Germany (90ms) is offline, UK (85ms) is premium + maintenance
        let free = dir.fastest(&Subscription::free(), now).unwrap();
        assert_eq!(free.id, "1");

        let premium = Subscription::premium_until(now + Duration::from_secs(60));
        assert_eq!(dir.fastest(&premium, now).unwrap().id, "1");
    }

    #[test]
    fn test_fastest_tie_breaks_on_load() {
        let dir = ServerDirectory::new(vec![
            ServerDescriptor::new("a", "A").with_ping(50).with_load(80),
            ServerDescriptor::new("b", "B").with_ping(50).with_load(10),
            ServerDescriptor::new("c", "C"),
        ])
        .unwrap();

        let best = dir.fastest(&Subscription::free(), SystemTime::now()).unwrap();
        assert_eq!(best.id, "b");
    }

    #[test]
    fn test_fastest_none_when_nothing_admitted() {
        let dir = ServerDirectory::new(vec![
            ServerDescriptor::new("a", "A").with_status(ServerStatus::Offline),
            ServerDescriptor::new("b", "B").with_tier(Tier::Premium),
        ])
        .unwrap();

        assert!(dir.fastest(&Subscription::free(), SystemTime::now()).is_none());
    }
}
