pub mod engine;
pub mod scripted;

use crate::models::PeerCounts;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

static BTIH_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"(?i)(?:^|[?&])xt=urn:btih:([0-9a-z]+)(?:&|$)").expect("valid btih regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("invalid magnet: {0}")]
    InvalidMagnet(String),
    #[error("swarm unreachable: {0}")]
    Unreachable(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidMagnet(_))
    }
}

/// Narrow capability over whatever DHT/peer-wire engine is available.
#[async_trait]
pub trait SwarmQueryClient: Send + Sync {
    async fn query(&self, magnet: &str, timeout: Duration) -> Result<PeerCounts, QueryError>;
}

/// 20-byte BitTorrent v1 info-hash, kept as lower-case hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InfoHash(String);

impl InfoHash {
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn parse_magnet(magnet: &str) -> Result<InfoHash, QueryError> {
    let magnet = magnet.trim();
    let Some(query) = magnet.strip_prefix("magnet:?") else {
        return Err(QueryError::InvalidMagnet("missing magnet:? prefix".to_string()));
    };
    let Some(captures) = BTIH_RE.captures(query) else {
        return Err(QueryError::InvalidMagnet("no urn:btih exact topic".to_string()));
    };
    let raw = &captures[1];
    match raw.len() {
        40 if raw.chars().all(|ch| ch.is_ascii_hexdigit()) => {
            Ok(InfoHash(raw.to_ascii_lowercase()))
        }
        32 => data_encoding::BASE32
            .decode(raw.to_ascii_uppercase().as_bytes())
            .ok()
            .filter(|bytes| bytes.len() == 20)
            .map(|bytes| InfoHash(hex::encode(bytes)))
            .ok_or_else(|| QueryError::InvalidMagnet(format!("bad base32 info-hash '{}'", raw))),
        _ => Err(QueryError::InvalidMagnet(format!("info-hash '{}' has unexpected length", raw))),
    }
}

/// Stable target identity: the info-hash when the magnet has one, otherwise a
/// name-based UUID so malformed magnets still get a consistent row.
pub fn target_id_for_magnet(magnet: &str) -> String {
    match parse_magnet(magnet) {
        Ok(hash) => hash.0,
        Err(_) => Uuid::new_v5(&Uuid::NAMESPACE_URL, magnet.trim().as_bytes()).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_magnet, target_id_for_magnet, QueryError};

    const HEX: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn parses_hex_info_hash_case_insensitively() {
        let magnet = format!("magnet:?xt=urn:btih:{}&dn=Sintel", HEX.to_uppercase());
        assert_eq!(parse_magnet(&magnet).expect("valid").as_hex(), HEX);
    }

    #[test]
    fn parses_base32_info_hash() {
        let magnet = "magnet:?dn=x&xt=urn:btih:YEX6DQDLXISUVHOJ6UM3GNNKPQJWPKEK";
        assert_eq!(parse_magnet(magnet).expect("valid").as_hex(), HEX);
        let lower = "magnet:?xt=urn:btih:yex6dqdlxisuvhoj6um3gnnkpqjwpkek";
        assert_eq!(parse_magnet(lower).expect("valid").as_hex(), HEX);
        assert!(matches!(
            parse_magnet("magnet:?xt=urn:btih:YEX6DQDLXISUVHOJ6UM3GNNKPQJWPKE1"),
            Err(QueryError::InvalidMagnet(_))
        ));
    }

    #[test]
    fn rejects_malformed_magnets() {
        assert!(matches!(parse_magnet("http://example.org"), Err(QueryError::InvalidMagnet(_))));
        assert!(matches!(parse_magnet("magnet:?dn=no-hash"), Err(QueryError::InvalidMagnet(_))));
        let short = parse_magnet("magnet:?xt=urn:btih:abc");
        assert!(matches!(short, Err(QueryError::InvalidMagnet(_))));
    }

    #[test]
    fn invalid_magnet_is_the_only_permanent_error() {
        assert!(!QueryError::InvalidMagnet("x".to_string()).is_retryable());
        assert!(QueryError::Unreachable("x".to_string()).is_retryable());
        assert!(QueryError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn target_ids_are_stable() {
        let magnet = format!("magnet:?xt=urn:btih:{}", HEX);
        assert_eq!(target_id_for_magnet(&magnet), HEX);
        assert_eq!(target_id_for_magnet("not a magnet"), target_id_for_magnet(" not a magnet "));
        assert_ne!(target_id_for_magnet("not a magnet"), target_id_for_magnet("other"));
    }
}
