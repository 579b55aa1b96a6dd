//! Token estimation for prompt budgeting.
//! Word based heuristic, more stable than a plain char/4 approximation.

/// Estimate tokens from text.
/// Rule: mixed-language chat averages ~1.3 tokens per word.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let words = text.split_whitespace().count();

    // Small overhead for formatting
    ((words as f64 * 1.3) + 5.0).ceil() as usize
}

/// Check if adding text would exceed limit
pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    current_tokens + estimate_tokens(new_text) > max_tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimation() {
        // 7 words * 1.3 + 5 = 14.1 -> 15
        let tokens = estimate_tokens("what are your opening hours on public holidays");
        assert!((13..=17).contains(&tokens));
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_would_exceed() {
        // ~500 words = 655 tokens
        let text = "word ".repeat(500);
        assert!(would_exceed_limit(1000, &text, 1500));
        assert!(!would_exceed_limit(1000, &text, 2000));
    }
}
