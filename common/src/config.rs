pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Decimals applied when a coin is not present in the registry
pub const DEFAULT_COIN_DECIMALS: u8 = 8;

// Number of leading hex chars of a coin id used as a display fallback
pub const COIN_ID_PREFIX_LEN: usize = 8;

// Coin id of the native Unicity token, registered at startup
pub const UCT_COIN_ID: &str = "455c1a2f9020d55b9e2d5b9f6b7e3d1c8a4f0e6b2d9c7a5e3f1b8d6c4a2e0f9d";
pub const UCT_SYMBOL: &str = "UCT";
pub const UCT_NAME: &str = "Unicity Token";
pub const UCT_DECIMALS: u8 = 8;
