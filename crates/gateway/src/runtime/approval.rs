//! ApprovalGateway — HMAC-signed approval tokens binding an approver's
//! consent to a specific plan for a bounded time.
//!
//! Tokens are verified statelessly: the canonical payload
//! `token|planId|issuedAt|expiresAt` is signed with the application secret
//! and compared in constant time. Single use falls out of the plan status
//! check — once a plan leaves `approved`, no token for it ever validates
//! again.

use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use fg_domain::plan::{Plan, PlanStatus};
use fg_domain::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A freshly issued approval token. `encode()` produces the opaque bearer
/// string handed to the client.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub plan_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

impl IssuedToken {
    /// `token.issued_ts.expires_ts.signature` — everything verification
    /// needs besides the plan itself.
    pub fn encode(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.token,
            self.issued_at.timestamp(),
            self.expires_at.timestamp(),
            self.signature
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ApprovalGateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ApprovalGateway {
    /// Read-only after startup; never logged or serialized.
    secret: Vec<u8>,
    token_ttl: Duration,
}

impl ApprovalGateway {
    pub fn new(secret: Vec<u8>, token_ttl_secs: i64) -> Self {
        Self {
            secret,
            token_ttl: Duration::seconds(token_ttl_secs),
        }
    }

    /// Load the signing secret from the named env var.
    pub fn from_env(secret_env: &str, token_ttl_secs: i64) -> Result<Self> {
        let secret = std::env::var(secret_env)
            .map_err(|_| Error::Internal(format!("approval secret env var {secret_env} not set")))?;
        if secret.len() < 16 {
            return Err(Error::Internal(
                "approval secret must be at least 16 bytes".into(),
            ));
        }
        Ok(Self::new(secret.into_bytes(), token_ttl_secs))
    }

    fn canonical_payload(
        token: &str,
        plan_id: Uuid,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> String {
        format!(
            "{token}|{plan_id}|{}|{}",
            issued_at.timestamp(),
            expires_at.timestamp()
        )
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a token for a plan awaiting approval.
    ///
    /// The plan must be in `pending_approval` and the approver must differ
    /// from the plan's creator. The caller transitions the plan to
    /// `approved` after a successful issue.
    pub fn issue(&self, plan: &Plan, approver: &str) -> Result<IssuedToken> {
        let now = Utc::now();
        if plan.is_expired(now) {
            return Err(Error::PlanExpired(plan.id));
        }
        match plan.status {
            PlanStatus::PendingApproval => {}
            PlanStatus::Draft => {
                return Err(Error::InvalidRequest(
                    "plan has not been submitted for approval".into(),
                ))
            }
            _ => return Err(Error::PlanAlreadyApplied(plan.id)),
        }
        if approver == plan.created_by {
            return Err(Error::SelfApprovalForbidden);
        }

        // 8 random bytes prefixed with the tool-family tag.
        let family = plan.tool_name.split('_').next().unwrap_or("plan");
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = format!("{family}-{}", hex::encode(bytes));

        let issued_at = now;
        let expires_at = now + self.token_ttl;
        let signature =
            self.sign(&Self::canonical_payload(&token, plan.id, issued_at, expires_at));

        Ok(IssuedToken {
            token,
            plan_id: plan.id,
            issued_at,
            expires_at,
            signature,
        })
    }

    /// Verify an encoded bearer token against the plan's current state.
    /// This is the gate on the executor's apply path.
    pub fn verify(&self, encoded: &str, plan: &Plan) -> Result<()> {
        self.verify_at(encoded, plan, Utc::now())
    }

    fn verify_at(&self, encoded: &str, plan: &Plan, now: DateTime<Utc>) -> Result<()> {
        let mut parts = encoded.split('.');
        let (token, issued_raw, expires_raw, signature) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(t), Some(i), Some(e), Some(s), None) => (t, i, e, s),
            _ => return Err(Error::ApprovalTokenInvalid),
        };

        let issued_at = issued_raw
            .parse::<i64>()
            .ok()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .ok_or(Error::ApprovalTokenInvalid)?;
        let expires_at = expires_raw
            .parse::<i64>()
            .ok()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .ok_or(Error::ApprovalTokenInvalid)?;

        // Signature first: an attacker learns nothing from expiry ordering.
        let expected = self.sign(&Self::canonical_payload(token, plan.id, issued_at, expires_at));
        if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() != 1 {
            return Err(Error::ApprovalTokenInvalid);
        }

        if now > expires_at {
            return Err(Error::ApprovalTokenExpired);
        }

        match plan.status {
            PlanStatus::Approved => Ok(()),
            _ => Err(Error::PlanAlreadyApplied(plan.id)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
