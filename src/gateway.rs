use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio::sync::Mutex;
use tracing::debug;

use crate::topology::Config;

/// Remembers which network each relay agent address belongs to.
///
/// Entries are only added by DISCOVER; a REQUEST from a relay that never
/// went through DISCOVER finds nothing here.
#[derive(Debug, Default)]
pub struct GatewayCache {
    networks: Mutex<HashMap<Ipv4Addr, usize>>,
}

impl GatewayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network position for `gateway`, scanning the topology on a miss.
    ///
    /// Unknown gateways are not cached, so a later configuration reload
    /// picking them up does not need a flush.
    pub async fn resolve(&self, config: &Config, gateway: Ipv4Addr) -> Option<usize> {
        let mut networks = self.networks.lock().await;
        if let Some(position) = networks.get(&gateway) {
            return Some(*position);
        }

        let position = config.network_index_for_ip(gateway)?;
        debug!(%gateway, network = %config.networks[position].name, "Cached relay gateway");
        networks.insert(gateway, position);
        Some(position)
    }

    /// Network position for `gateway`, only if a DISCOVER already resolved it.
    pub async fn cached(&self, gateway: Ipv4Addr) -> Option<usize> {
        self.networks.lock().await.get(&gateway).copied()
    }

    pub async fn len(&self) -> usize {
        self.networks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
global
    server-identifier 10.0.0.1
end

network "campus"
    unregistered
        subnet 10.0.1.0/24
            range 10.0.1.10 10.0.1.200
        end
    end
end

network "dorms"
    registered
        subnet 10.0.2.0/24
            range 10.0.2.10 10.0.2.200
        end
    end
end
"#;

    #[tokio::test]
    async fn test_resolve_caches_known_gateways() {
        let config = Config::parse_str("gateway.conf", CONFIG).unwrap();
        let cache = GatewayCache::new();

        assert_eq!(cache.cached(Ipv4Addr::new(10, 0, 2, 1)).await, None);
        assert_eq!(cache.resolve(&config, Ipv4Addr::new(10, 0, 2, 1)).await, Some(1));
        assert_eq!(cache.cached(Ipv4Addr::new(10, 0, 2, 1)).await, Some(1));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_gateway_not_cached() {
        let config = Config::parse_str("gateway.conf", CONFIG).unwrap();
        let cache = GatewayCache::new();

        assert_eq!(cache.resolve(&config, Ipv4Addr::new(192, 168, 9, 1)).await, None);
        assert_eq!(cache.len().await, 0);
    }
}
