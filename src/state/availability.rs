//! Site Availability
//!
//! Tracks whether each backup site is currently online (receiving
//! replicated writes) or has been taken offline.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Reachability state of a backup site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteState {
    Online,
    Offline,
}

impl std::fmt::Display for SiteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteState::Online => write!(f, "ONLINE"),
            SiteState::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Registry of backup site states on this node
pub struct SiteAvailability {
    sites: RwLock<HashMap<String, SiteState>>,
}

impl SiteAvailability {
    /// Create a registry with every site online
    pub fn new<I, S>(sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sites = sites
            .into_iter()
            .map(|s| (s.into(), SiteState::Online))
            .collect();
        Self {
            sites: RwLock::new(sites),
        }
    }

    /// Current state of a site, `None` for unknown sites
    pub fn state(&self, site: &str) -> Option<SiteState> {
        self.sites
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(site)
            .copied()
    }

    /// Whether the site is known and offline
    pub fn is_offline(&self, site: &str) -> bool {
        self.state(site) == Some(SiteState::Offline)
    }

    /// Take a site offline. Returns `false` for unknown sites.
    pub fn take_offline(&self, site: &str) -> bool {
        self.set(site, SiteState::Offline)
    }

    /// Bring a site back online. Returns `false` for unknown sites.
    pub fn bring_online(&self, site: &str) -> bool {
        self.set(site, SiteState::Online)
    }

    fn set(&self, site: &str, state: SiteState) -> bool {
        let mut sites = self.sites.write().unwrap_or_else(|e| e.into_inner());
        match sites.get_mut(site) {
            Some(current) => {
                if *current != state {
                    tracing::info!("Site {} is now {}", site, state);
                }
                *current = state;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_online() {
        let sites = SiteAvailability::new(["NYC", "SFO"]);
        assert_eq!(sites.state("NYC"), Some(SiteState::Online));
        assert!(sites.take_offline("NYC"));
        assert!(sites.is_offline("NYC"));
        assert!(!sites.is_offline("SFO"));
        assert!(sites.bring_online("NYC"));
        assert!(!sites.is_offline("NYC"));
    }

    #[test]
    fn test_unknown_site() {
        let sites = SiteAvailability::new(["NYC"]);
        assert!(!sites.take_offline("NO_SITE"));
        assert_eq!(sites.state("NO_SITE"), None);
    }
}
