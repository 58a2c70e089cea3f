use crate::config::SUBSET_SEARCH_LIMIT;
use log::{debug, trace};
use primitive_types::U256;
use sphere_common::token::{parse_token_info, Token, TokenStatus};

// One token that must be split to hit the target exactly
#[derive(Debug, Clone)]
pub struct SplitTarget {
    pub token: Token,
    pub split_amount: U256,
    pub remainder_amount: U256,
}

// Minimal-waste selection of confirmed tokens covering a target amount
#[derive(Debug, Clone)]
pub struct SplitPlan {
    // Tokens transferred whole
    pub direct: Vec<Token>,
    pub split: Option<SplitTarget>,
    pub total_available: U256,
}

impl SplitPlan {
    pub fn requires_split(&self) -> bool {
        self.split.is_some()
    }

    // Local ids of every token the plan touches
    pub fn local_ids(&self) -> Vec<String> {
        self.direct
            .iter()
            .map(|t| t.local_id.clone())
            .chain(self.split.iter().map(|s| s.token.local_id.clone()))
            .collect()
    }
}

// Choose the tokens to cover `target`. Returns None when the confirmed
// balance for the coin cannot cover it.
//
// Decision order, first match wins:
//   1. total available < target        -> insufficient
//   2. a single token equals target    -> direct, no split
//   3. a subset sums exactly to target -> direct, no split
//   4. greedy partial                  -> split the last accumulated token
pub fn plan_split(available: &[Token], target: U256, coin_id: &str) -> Option<SplitPlan> {
    let candidates: Vec<Token> = available
        .iter()
        .filter(|t| t.status == TokenStatus::Confirmed && t.coin_id == coin_id)
        .filter(|t| {
            t.payload
                .blob()
                .map(|blob| parse_token_info(blob).is_some())
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    let total_available = candidates
        .iter()
        .fold(U256::zero(), |acc, t| acc.saturating_add(t.amount));

    if total_available < target {
        debug!(
            "insufficient funds for {}: need {}, have {}",
            coin_id, target, total_available
        );
        return None;
    }

    // Degenerate but valid: nothing to select
    if target.is_zero() {
        return Some(SplitPlan {
            direct: Vec::new(),
            split: None,
            total_available,
        });
    }

    // Single exact match
    if let Some(exact) = candidates.iter().find(|t| t.amount == target) {
        trace!("single token {} matches target exactly", exact.local_id);
        return Some(SplitPlan {
            direct: vec![exact.clone()],
            split: None,
            total_available,
        });
    }

    // Combination exact match, bounded to keep the search cheap
    if candidates.len() <= SUBSET_SEARCH_LIMIT {
        if let Some(subset) = find_exact_subset(&candidates, target) {
            trace!("subset of {} tokens matches target exactly", subset.len());
            return Some(SplitPlan {
                direct: subset,
                split: None,
                total_available,
            });
        }
    }

    // Greedy partial: accumulate descending until the target is covered,
    // the last token added becomes the token to split
    let mut sorted = candidates;
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

    let mut accumulated = U256::zero();
    let mut direct = Vec::new();
    for token in sorted {
        if accumulated >= target {
            break;
        }
        let before = accumulated;
        accumulated = accumulated.saturating_add(token.amount);
        if accumulated >= target {
            let split_amount = target - before;
            let remainder_amount = token.amount - split_amount;
            if remainder_amount.is_zero() {
                // Landed exactly on the target: no split needed
                direct.push(token);
                return Some(SplitPlan {
                    direct,
                    split: None,
                    total_available,
                });
            }
            return Some(SplitPlan {
                direct,
                split: Some(SplitTarget {
                    token,
                    split_amount,
                    remainder_amount,
                }),
                total_available,
            });
        }
        direct.push(token);
    }

    // Unreachable: total_available >= target guarantees coverage
    None
}

fn find_exact_subset(candidates: &[Token], target: U256) -> Option<Vec<Token>> {
    let n = candidates.len();
    let mut best: Option<u32> = None;

    for mask in 1u32..(1u32 << n) {
        let mut sum = U256::zero();
        for (index, token) in candidates.iter().enumerate() {
            if mask & (1 << index) != 0 {
                sum = sum.saturating_add(token.amount);
            }
        }
        if sum == target {
            // Prefer the smallest subset
            match best {
                Some(prior) if prior.count_ones() <= mask.count_ones() => {}
                _ => best = Some(mask),
            }
        }
    }

    best.map(|mask| {
        candidates
            .iter()
            .enumerate()
            .filter(|(index, _)| mask & (1 << index) != 0)
            .map(|(_, token)| token.clone())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sphere_common::token::TokenBlob;

    fn token(token_id: &str, amount: u64) -> Token {
        Token::from_blob(
            TokenBlob::Structured(json!({
                "genesis": {"tokenId": token_id, "data": {"coins": [["cafe", amount.to_string()]]}},
                "state": {"hash": format!("state_{}", token_id)},
            })),
            TokenStatus::Confirmed,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_insufficient_funds() {
        let tokens = vec![token("a", 10), token("b", 20)];
        assert!(plan_split(&tokens, U256::from(31u64), "cafe").is_none());
    }

    #[test]
    fn test_single_exact_match() {
        let tokens = vec![token("a", 10), token("b", 50), token("c", 20)];
        let plan = plan_split(&tokens, U256::from(50u64), "cafe").unwrap();
        assert!(!plan.requires_split());
        assert_eq!(plan.direct.len(), 1);
        assert_eq!(plan.direct[0].amount, U256::from(50u64));
    }

    #[test]
    fn test_subset_exact_match() {
        let tokens = vec![token("a", 30), token("b", 25), token("c", 20)];
        let plan = plan_split(&tokens, U256::from(45u64), "cafe").unwrap();
        assert!(!plan.requires_split());
        let sum: U256 = plan
            .direct
            .iter()
            .fold(U256::zero(), |acc, t| acc + t.amount);
        assert_eq!(sum, U256::from(45u64));
    }

    #[test]
    fn test_greedy_partial_split() {
        let tokens = vec![token("a", 100)];
        let plan = plan_split(&tokens, U256::from(50u64), "cafe").unwrap();
        assert!(plan.requires_split());
        assert!(plan.direct.is_empty());
        let split = plan.split.unwrap();
        assert_eq!(split.split_amount, U256::from(50u64));
        assert_eq!(split.remainder_amount, U256::from(50u64));
    }

    #[test]
    fn test_greedy_accumulates_descending() {
        let tokens = vec![token("a", 40), token("b", 35), token("c", 13)];
        let plan = plan_split(&tokens, U256::from(80u64), "cafe").unwrap();
        assert!(plan.requires_split());
        // 40 + 35 direct, 13 split into 5 + 8
        assert_eq!(plan.direct.len(), 2);
        let split = plan.split.unwrap();
        assert_eq!(split.split_amount, U256::from(5u64));
        assert_eq!(split.remainder_amount, U256::from(8u64));
    }

    #[test]
    fn test_target_one_under_total() {
        let tokens = vec![token("a", 60), token("b", 40)];
        let plan = plan_split(&tokens, U256::from(99u64), "cafe").unwrap();
        assert!(plan.requires_split());
        assert_eq!(plan.split.unwrap().remainder_amount, U256::from(1u64));
    }

    #[test]
    fn test_zero_target_is_valid() {
        let tokens = vec![token("a", 10)];
        let plan = plan_split(&tokens, U256::zero(), "cafe").unwrap();
        assert!(plan.direct.is_empty());
        assert!(!plan.requires_split());
    }

    #[test]
    fn test_filters_non_confirmed_and_other_coins() {
        let mut pending = token("a", 100);
        pending.status = TokenStatus::Submitted;
        let mut other = token("b", 100);
        other.coin_id = "beef".into();

        assert!(plan_split(&[pending, other], U256::from(10u64), "cafe").is_none());
    }
}
