use crate::config::{
    DEFAULT_COIN_DECIMALS, UCT_COIN_ID, UCT_DECIMALS, UCT_NAME, UCT_SYMBOL,
};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use std::sync::RwLock;

// Display metadata for a fungible coin class
#[derive(Debug, Clone)]
pub struct CoinMetadata {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub icon_url: Option<String>,
}

lazy_static! {
    // Global coin registry, seeded with the native coin and extended at
    // runtime as applications register the coins they mint
    static ref REGISTRY: RwLock<IndexMap<String, CoinMetadata>> = {
        let mut map = IndexMap::new();
        map.insert(
            UCT_COIN_ID.to_owned(),
            CoinMetadata {
                symbol: UCT_SYMBOL.to_owned(),
                name: UCT_NAME.to_owned(),
                decimals: UCT_DECIMALS,
                icon_url: None,
            },
        );
        RwLock::new(map)
    };
}

pub fn register_coin(coin_id: impl Into<String>, metadata: CoinMetadata) {
    let mut registry = REGISTRY.write().expect("coin registry poisoned");
    registry.insert(coin_id.into(), metadata);
}

pub fn registry_metadata(coin_id: &str) -> Option<CoinMetadata> {
    let registry = REGISTRY.read().expect("coin registry poisoned");
    registry.get(coin_id).cloned()
}

// Registry lookup with the display fallback applied: unknown coins show
// the first eight hex chars of their id and the default decimals
pub fn metadata_or_fallback(coin_id: &str) -> CoinMetadata {
    registry_metadata(coin_id).unwrap_or_else(|| {
        let label = super::fallback_coin_label(coin_id);
        CoinMetadata {
            symbol: label.clone(),
            name: label,
            decimals: DEFAULT_COIN_DECIMALS,
            icon_url: None,
        }
    })
}
