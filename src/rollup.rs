use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::EnrichedNode;

/// Nodes sharing one (city, country) location.
#[derive(Debug, Clone, Serialize)]
pub struct GeoGroup {
    pub city: String,
    pub country: String,
    pub country_code: String,
    pub lat: f64,
    pub lon: f64,
    pub count: usize,
    /// Committed bytes across the group.
    pub total_storage: u64,
    /// `None` when no node in the group has a known credit value.
    pub total_credits: Option<f64>,
    pub avg_health: f64,
    pub avg_uptime: f64,
    pub storage_king: String,
    pub credits_king: Option<String>,
    pub health_king: String,
}

/// Groups located nodes by (city, country). Nodes on the sentinel location
/// are left out. Groups come back largest first.
pub fn geo_rollup(nodes: &[EnrichedNode]) -> Vec<GeoGroup> {
    let mut groups: BTreeMap<(&str, &str), Vec<&EnrichedNode>> = BTreeMap::new();
    for node in nodes.iter().filter(|n| !n.location.is_sentinel()) {
        groups
            .entry((node.location.city.as_str(), node.location.country.as_str()))
            .or_default()
            .push(node);
    }

    let mut rollup: Vec<GeoGroup> = groups.into_values().filter_map(|members| summarize(&members)).collect();
    rollup.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.city.cmp(&b.city)));
    rollup
}

fn summarize(members: &[&EnrichedNode]) -> Option<GeoGroup> {
    let first = members.first()?;
    let count = members.len();

    let known_credits: Vec<(&EnrichedNode, f64)> = members
        .iter()
        .filter_map(|n| n.credits.amount().map(|amount| (*n, amount)))
        .collect();
    let total_credits = (!known_credits.is_empty()).then(|| known_credits.iter().map(|(_, c)| c).sum());
    let credits_king = known_credits
        .iter()
        .fold(None::<(&EnrichedNode, f64)>, |best, &(node, amount)| match best {
            Some((_, top)) if top >= amount => best,
            _ => Some((node, amount)),
        })
        .map(|(node, _)| node.pubkey.clone());

    // first member wins ties
    let king_by = |better: fn(&EnrichedNode, &EnrichedNode) -> bool| {
        members
            .iter()
            .skip(1)
            .fold(*first, |best, &n| if better(n, best) { n } else { best })
            .pubkey
            .clone()
    };

    Some(GeoGroup {
        city: first.location.city.clone(),
        country: first.location.country.clone(),
        country_code: first.location.country_code.clone(),
        lat: first.location.lat,
        lon: first.location.lon,
        count,
        total_storage: members.iter().map(|n| n.storage_committed).sum(),
        total_credits,
        avg_health: members.iter().map(|n| n.health).sum::<f64>() / count as f64,
        avg_uptime: members.iter().map(|n| n.uptime as f64).sum::<f64>() / count as f64,
        storage_king: king_by(|a, b| a.storage_committed > b.storage_committed),
        credits_king,
        health_king: king_by(|a, b| a.health > b.health),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credits, GeoLocation, RawNodeRecord, Segment};
    use crate::vitality::GIB;

    fn located(key: &str, city: &str, country: &str, gib: u64, credits: Credits, health: f64) -> EnrichedNode {
        let raw = RawNodeRecord {
            pubkey: key.to_string(),
            address: "8.8.8.8:9001".to_string(),
            version: "0.8.0".to_string(),
            uptime: 1000,
            storage_committed: gib * GIB as u64,
            storage_used: 0,
            is_public: true,
            is_operator: false,
        };
        let mut node = EnrichedNode::from_raw(&raw, Segment::Mainnet, credits, false);
        node.location = GeoLocation {
            lat: 1.0,
            lon: 2.0,
            country: country.to_string(),
            country_code: String::new(),
            city: city.to_string(),
        };
        node.health = health;
        node
    }

    #[test]
    fn tokyo_pair() {
        let nodes = vec![
            located("small-rich", "Tokyo", "Japan", 1000, Credits::Known(500.0), 80.0),
            located("big-poor", "Tokyo", "Japan", 5000, Credits::Known(100.0), 60.0),
        ];
        let rollup = geo_rollup(&nodes);
        assert_eq!(rollup.len(), 1);
        let tokyo = &rollup[0];
        assert_eq!(tokyo.city, "Tokyo");
        assert_eq!(tokyo.count, 2);
        assert_eq!(tokyo.total_storage, 6000 * GIB as u64);
        assert_eq!(tokyo.total_credits, Some(600.0));
        assert_eq!(tokyo.credits_king.as_deref(), Some("small-rich"));
        assert_eq!(tokyo.storage_king, "big-poor");
        assert_eq!(tokyo.health_king, "small-rich");
        assert_eq!(tokyo.avg_health, 70.0);
    }

    #[test]
    fn sentinel_nodes_are_excluded_and_nobody_double_counts() {
        let mut hidden = located("hidden", "", "Private Network", 10, Credits::Unknown, 50.0);
        hidden.location = GeoLocation::sentinel();
        let nodes = vec![
            hidden,
            located("p1", "Paris", "France", 10, Credits::Unknown, 10.0),
            located("p2", "Paris", "Texas", 10, Credits::NotInLedger, 20.0),
            located("p3", "Paris", "France", 10, Credits::Unknown, 30.0),
        ];
        let rollup = geo_rollup(&nodes);
        assert_eq!(rollup.iter().map(|g| g.count).sum::<usize>(), 3);
        assert_eq!(rollup[0].country, "France");
        assert_eq!(rollup[0].count, 2);
        assert_eq!(rollup[0].total_credits, None);
        assert_eq!(rollup[0].credits_king, None);
        assert_eq!(rollup[1].country, "Texas");
    }
}
