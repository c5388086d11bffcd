//! Opaque service tokens
//!
//! A token is a random 128-bit identifier rendered in the canonical
//! lowercase hyphenated UUID form (36 characters).

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Token parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Invalid token: {0:?}")]
    InvalidToken(String),
}

/// Unguessable identifier bound to one service record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(Uuid);

impl Token {
    /// Length of the canonical string form
    pub const ENCODED_LEN: usize = 36;

    /// Generate a fresh random token (UUID v4, backed by the OS CSPRNG)
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a token from its string form
    pub fn parse(s: &str) -> Result<Self, TokenError> {
        s.parse()
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s.trim())
            .map(Self)
            .map_err(|_| TokenError::InvalidToken(s.to_string()))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_string_roundtrip() {
        for _ in 0..64 {
            let token = Token::generate();
            let encoded = token.to_string();
            assert_eq!(encoded.len(), Token::ENCODED_LEN);
            assert_eq!(encoded, encoded.to_lowercase());
            assert_eq!(Token::parse(&encoded).unwrap(), token);
        }
    }

    #[test]
    fn test_token_rejects_garbage() {
        for input in [
            "",
            "not-a-real-token",
            "12345",
            "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz",
            "550e8400-e29b-41d4-a716-44665544000",
            "550e8400-e29b-41d4-a716-4466554400000",
            "\u{1f980}\u{1f980}",
        ] {
            let result = Token::parse(input);
            assert_eq!(result, Err(TokenError::InvalidToken(input.to_string())));
        }
    }

    #[test]
    fn test_token_uppercase_input_normalizes() {
        let token = Token::parse("550E8400-E29B-41D4-A716-446655440000").unwrap();
        assert_eq!(token.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn test_generated_tokens_are_distinct() {
        let tokens: HashSet<Token> = (0..1000).map(|_| Token::generate()).collect();
        assert_eq!(tokens.len(), 1000);
    }
}
