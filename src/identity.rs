//! Reputation-ranked, time-boxed identity tokens.
//!
//! An [`IdentityToken`] is a short-lived signed claim used for in-person
//! verification: the subject's current trust score (read from an external
//! ledger) is mapped onto one of four rank tiers and signed together with
//! the issuance time. Tokens live exactly 60 seconds; consumers reject
//! anything at or past `exp`.
//!
//! Signing is Ed25519 over the canonical `"{sub}|{iat}|{score}"` payload,
//! hex-rendered into the wire `hash` field. Key rotation and distribution
//! of the verifying key are external collaborator concerns.

use std::future::Future;

use chrono::{DateTime, TimeDelta, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::FanoutError;
use crate::storage::Storage;

/// Token validity window in seconds.
pub const TOKEN_TTL_SECS: i64 = 60;

/// Trust tier derived from a reputation score. Ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    /// Flagged/untrusted. Also the fallback tier for any score outside
    /// the table, guaranteeing the mapping is total.
    Flagged,
    /// Under observation.
    Watched,
    /// Standard citizen.
    Citizen,
    /// Top trust.
    Guardian,
}

impl Rank {
    /// Get a human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Rank::Flagged => "Flagged",
            Rank::Watched => "Watched",
            Rank::Citizen => "Citizen",
            Rank::Guardian => "Guardian",
        }
    }
}

/// One contiguous score band. `max` of `None` means unbounded above.
struct RankBand {
    min: i64,
    max: Option<i64>,
    rank: Rank,
}

/// Ordered, contiguous, non-overlapping bands covering the score domain
/// from 0 upward. Boundary values belong to the band listing them.
const RANK_BANDS: [RankBand; 4] = [
    RankBand { min: 0, max: Some(19), rank: Rank::Flagged },
    RankBand { min: 20, max: Some(49), rank: Rank::Watched },
    RankBand { min: 50, max: Some(79), rank: Rank::Citizen },
    RankBand { min: 80, max: None, rank: Rank::Guardian },
];

/// Map a score onto its rank tier. Total over all integers: scores below
/// the table (negative) fall back to the lowest tier explicitly.
pub fn rank_for_score(score: i64) -> Rank {
    for band in &RANK_BANDS {
        if score >= band.min && band.max.is_none_or(|max| score <= max) {
            return band.rank;
        }
    }
    Rank::Flagged
}

/// Read-only access to the external reputation ledger.
pub trait ScoreLedger: Send + Sync {
    /// Current score for a subject. Unknown subjects score 0.
    fn score_for(&self, subject_id: &str) -> impl Future<Output = Result<i64, FanoutError>> + Send;
}

impl ScoreLedger for Storage {
    async fn score_for(&self, subject_id: &str) -> Result<i64, FanoutError> {
        Ok(Storage::score_for(self, subject_id).await?)
    }
}

/// A short-lived signed identity claim.
#[derive(Debug, Clone)]
pub struct IdentityToken {
    pub subject_id: String,
    pub issued_at: DateTime<Utc>,
    /// Always `issued_at + 60s`.
    pub expires_at: DateTime<Utc>,
    pub rank: Rank,
    pub score: i64,
    /// Hex-encoded Ed25519 signature over the canonical payload.
    pub signature: String,
}

impl IdentityToken {
    /// A token is valid strictly before its expiry instant.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Wire representation, ready for external QR rendering.
    pub fn to_wire(&self) -> TokenWire {
        TokenWire {
            sub: self.subject_id.clone(),
            iat: self.issued_at.timestamp(),
            exp: self.expires_at.timestamp(),
            rank: self.rank,
            score: self.score,
            hash: self.signature.clone(),
        }
    }
}

/// JSON wire format consumed by scanners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenWire {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub rank: Rank,
    pub score: i64,
    pub hash: String,
}

/// The byte string actually signed for a token.
fn canonical_payload(subject_id: &str, iat: i64, score: i64) -> String {
    format!("{subject_id}|{iat}|{score}")
}

/// Issues signed identity tokens from ledger scores.
#[derive(Clone)]
pub struct TokenIssuer {
    signing_key: SigningKey,
}

impl TokenIssuer {
    /// Create an issuer from a raw 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Generate an issuer with a fresh random key (ephemeral deployments).
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// The key consumers verify against.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Issue a token for `subject_id`, reading the current score from the
    /// ledger. The validity window is exactly [`TOKEN_TTL_SECS`].
    pub async fn issue<L: ScoreLedger>(
        &self,
        ledger: &L,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<IdentityToken, FanoutError> {
        let score = ledger.score_for(subject_id).await?;
        let rank = rank_for_score(score);

        let iat = now.timestamp();
        let payload = canonical_payload(subject_id, iat, score);
        let signature = self.signing_key.sign(payload.as_bytes());

        debug!(subject = %subject_id, score, rank = rank.label(), "Identity token issued");

        Ok(IdentityToken {
            subject_id: subject_id.to_string(),
            issued_at: now,
            expires_at: now + TimeDelta::seconds(TOKEN_TTL_SECS),
            rank,
            score,
            signature: to_hex(&signature.to_bytes()),
        })
    }
}

/// Render bytes as a lowercase hex string.
fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, FanoutError> {
    if hex.len() % 2 != 0 {
        return Err(FanoutError::TokenMalformed("odd-length hex".to_string()));
    }
    // Decode over raw bytes: indexing the str would panic on multi-byte
    // characters in an untrusted hash.
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| FanoutError::TokenMalformed("invalid hex".to_string()))
        })
        .collect()
}

/// Verifier-side check of a wire token: structure and signature first,
/// then expiry. Expiry is strict: a token is rejected at exactly `exp`.
pub fn verify(
    wire: &TokenWire,
    verifying_key: &VerifyingKey,
    now: DateTime<Utc>,
) -> Result<(), FanoutError> {
    let bytes = hex_to_bytes(&wire.hash)?;
    let sig_bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| FanoutError::TokenMalformed("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let payload = canonical_payload(&wire.sub, wire.iat, wire.score);
    verifying_key
        .verify(payload.as_bytes(), &signature)
        .map_err(|_| FanoutError::TokenMalformed("signature verification failed".to_string()))?;

    if wire.exp <= now.timestamp() {
        return Err(FanoutError::TokenExpired);
    }

    Ok(())
}

/// Cooperative per-subject token refresh.
///
/// Owns one logical timer: a one-second tick counts down the validity
/// window and reissues when it reaches zero. The owning session context
/// must hold at most one refresher per subject. Replacing (dropping) a
/// refresher aborts its timer, so a restart can never leave two concurrent
/// issuance loops behind.
pub struct TokenRefresher {
    subject_id: String,
    receiver: watch::Receiver<IdentityToken>,
    handle: JoinHandle<()>,
}

impl TokenRefresher {
    /// Issue the initial token and start the countdown task.
    pub async fn start<L>(
        issuer: TokenIssuer,
        ledger: L,
        subject_id: String,
    ) -> Result<Self, FanoutError>
    where
        L: ScoreLedger + 'static,
    {
        let initial = issuer.issue(&ledger, &subject_id, Utc::now()).await?;
        let (sender, receiver) = watch::channel(initial);

        let subject = subject_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            // Consume the immediate first tick so the countdown starts at
            // the full window.
            ticker.tick().await;

            let mut remaining = TOKEN_TTL_SECS;
            loop {
                ticker.tick().await;
                remaining -= 1;
                if remaining <= 0 {
                    match issuer.issue(&ledger, &subject, Utc::now()).await {
                        Ok(token) => {
                            // Receivers may all be gone; keep refreshing for
                            // late subscribers via current().
                            let _ = sender.send(token);
                            remaining = TOKEN_TTL_SECS;
                        }
                        Err(e) => {
                            warn!(subject = %subject, error = %e, "Token reissue failed; retrying next tick");
                        }
                    }
                }
            }
        });

        Ok(Self {
            subject_id,
            receiver,
            handle,
        })
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Latest issued token.
    pub fn current(&self) -> IdentityToken {
        self.receiver.borrow().clone()
    }

    /// Watch for reissued tokens.
    pub fn subscribe(&self) -> watch::Receiver<IdentityToken> {
        self.receiver.clone()
    }
}

impl Drop for TokenRefresher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
