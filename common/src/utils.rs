use primitive_types::U256;

// Parse a non-negative decimal amount string
pub fn parse_amount(s: &str) -> Option<U256> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    U256::from_dec_str(trimmed).ok()
}

// Format an atomic amount with the coin decimals
// 1234 with 2 decimals is rendered as "12.34"
pub fn format_coin(amount: U256, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }

    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let integral = amount / divisor;
    let fractional = amount % divisor;
    format!(
        "{}.{:0>width$}",
        integral,
        fractional.to_string(),
        width = decimals as usize
    )
}

// Serde helpers serializing U256 amounts as decimal strings, the
// representation used by the wire envelopes and the TXF archive format
pub mod serde_amount {
    use primitive_types::U256;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let value = String::deserialize(deserializer)?;
        U256::from_dec_str(&value).map_err(Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("50"), Some(U256::from(50u64)));
        assert_eq!(parse_amount(" 0 "), Some(U256::zero()));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("-1"), None);
        assert_eq!(parse_amount("12.5"), None);
    }

    #[test]
    fn test_format_coin() {
        assert_eq!(format_coin(U256::from(1234u64), 2), "12.34");
        assert_eq!(format_coin(U256::from(5u64), 2), "0.05");
        assert_eq!(format_coin(U256::from(42u64), 0), "42");
    }
}
