//! Signed session tokens and password hashing.
//!
//! A token is `base64url(claims json) "." base64url(hmac-sha256(first part))`.
//! Tokens are stateless except for logout, which records the token id in
//! `revoked_sessions` until it would have expired anyway.

use crate::error::{AppError, AppResult};
use crate::model::Role;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub email: String,
    pub name: String,
    pub jti: String,
    pub exp: i64,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed session token")]
    Malformed,
    #[error("session token signature mismatch")]
    BadSignature,
    #[error("session expired")]
    Expired,
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        AppError::Unauthorized(e.to_string())
    }
}

#[derive(Clone)]
pub struct TokenKey(HmacSha256);

impl std::fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenKey(..)")
    }
}

impl TokenKey {
    pub fn from_secret(secret: &str) -> anyhow::Result<Self> {
        if secret.is_empty() {
            anyhow::bail!("token secret must not be empty");
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid token secret: {e}"))?;
        Ok(Self(mac))
    }

    fn mac(&self) -> HmacSha256 {
        self.0.clone()
    }

    pub fn sign(&self, claims: &Claims) -> anyhow::Result<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", payload, sig))
    }

    pub fn verify(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let (payload, sig) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)?;
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

pub fn new_claims(
    user_id: &str,
    role: Role,
    email: &str,
    name: &str,
    ttl_days: i64,
    now: i64,
) -> anyhow::Result<Claims> {
    let exp = ttl_days
        .checked_mul(24 * 60 * 60)
        .and_then(|ttl| now.checked_add(ttl))
        .ok_or_else(|| anyhow::anyhow!("token lifetime of {ttl_days} days is out of range"))?;
    Ok(Claims {
        sub: user_id.to_string(),
        role,
        email: email.to_string(),
        name: name.to_string(),
        jti: Uuid::new_v4().to_string(),
        exp,
    })
}

pub fn authenticate(
    conn: &Connection,
    key: &TokenKey,
    token: Option<&str>,
    now: i64,
) -> AppResult<Claims> {
    let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
        return Err(AppError::Unauthorized("sign in first".to_string()));
    };
    let mut claims = key.verify(token, now)?;
    let revoked = conn
        .query_row(
            "SELECT 1 FROM revoked_sessions WHERE jti = ?",
            [&claims.jti],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if revoked {
        return Err(AppError::Unauthorized("session was signed out".to_string()));
    }
    // The account may have been removed or re-roled after the token was issued.
    let stored = conn
        .query_row("SELECT role FROM users WHERE id = ?", [&claims.sub], |r| {
            r.get::<_, String>(0)
        })
        .optional()?;
    let Some(stored) = stored else {
        return Err(AppError::Unauthorized("account no longer exists".to_string()));
    };
    claims.role = Role::parse(&stored)
        .ok_or_else(|| AppError::Unauthorized(format!("account has unknown role {stored:?}")))?;
    Ok(claims)
}

pub fn revoke(conn: &Connection, claims: &Claims, now: i64) -> AppResult<()> {
    conn.execute("DELETE FROM revoked_sessions WHERE expires_at <= ?", [now])?;
    conn.execute(
        "INSERT OR IGNORE INTO revoked_sessions(jti, expires_at) VALUES(?, ?)",
        (&claims.jti, claims.exp),
    )?;
    Ok(())
}

pub fn require_staff(claims: &Claims) -> AppResult<()> {
    if claims.role.is_staff() {
        Ok(())
    } else {
        Err(AppError::forbidden("staff role required"))
    }
}

pub fn require_role(claims: &Claims, role: Role) -> AppResult<()> {
    if claims.role == role {
        Ok(())
    } else {
        Err(AppError::forbidden(format!("{} role required", role.as_str())))
    }
}

pub fn require_at_least(claims: &Claims, role: Role) -> AppResult<()> {
    if claims.role.at_least(role) {
        Ok(())
    } else {
        Err(AppError::forbidden(format!(
            "{} role or higher required",
            role.as_str()
        )))
    }
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp: i64) -> Claims {
        Claims {
            sub: "u1".to_string(),
            role: Role::Admin,
            email: "t@example.com".to_string(),
            name: "Teacher".to_string(),
            jti: "j1".to_string(),
            exp,
        }
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let key = TokenKey::from_secret("k1").expect("key");
        let token = key.sign(&claims(2_000)).expect("sign");
        assert_eq!(key.verify(&token, 1_000).expect("verify"), claims(2_000));

        let other = TokenKey::from_secret("k2").expect("key");
        assert_eq!(other.verify(&token, 1_000), Err(TokenError::BadSignature));

        let (payload, sig) = token.split_once('.').expect("dot");
        let mut forged = claims(2_000);
        forged.role = Role::Master;
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).expect("json"));
        assert_ne!(forged_payload, payload);
        let forged_token = format!("{}.{}", forged_payload, sig);
        assert_eq!(key.verify(&forged_token, 1_000), Err(TokenError::BadSignature));

        assert_eq!(key.verify("garbage", 1_000), Err(TokenError::Malformed));
    }

    #[test]
    fn expiry_is_enforced() {
        let key = TokenKey::from_secret("k1").expect("key");
        let token = key.sign(&claims(2_000)).expect("sign");
        assert_eq!(key.verify(&token, 2_000), Err(TokenError::Expired));
    }

    #[test]
    fn claims_expiry_overflow_is_an_error() {
        let c = new_claims("u1", Role::Admin, "t@example.com", "Teacher", 7, 1_000).expect("claims");
        assert_eq!(c.exp, 1_000 + 7 * 86_400);
        assert!(new_claims("u1", Role::Admin, "t@example.com", "Teacher", i64::MAX, 1_000).is_err());
        assert!(new_claims("u1", Role::Admin, "t@example.com", "Teacher", 1, i64::MAX).is_err());
    }

    #[test]
    fn authenticate_takes_role_from_the_account() {
        let conn = crate::db::test_conn();
        conn.execute(
            "INSERT INTO users(id, name, email, password_hash, birth_day, gender, role, created_at)
             VALUES('u1', 'Teacher', 't@example.com', 'x', '1990-01-01', 'female', 'admin', 'now')",
            [],
        )
        .expect("user");
        let key = TokenKey::from_secret("k1").expect("key");
        let token = key.sign(&claims(2_000)).expect("sign");
        assert_eq!(
            authenticate(&conn, &key, Some(&token), 1_000).expect("auth").role,
            Role::Admin
        );

        conn.execute("UPDATE users SET role = 'child' WHERE id = 'u1'", [])
            .expect("demote");
        let demoted = authenticate(&conn, &key, Some(&token), 1_000).expect("auth");
        assert_eq!(demoted.role, Role::Child);
        assert!(require_staff(&demoted).is_err());

        conn.execute("DELETE FROM users WHERE id = 'u1'", []).expect("delete");
        let err = authenticate(&conn, &key, Some(&token), 1_000).expect_err("gone");
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn password_hash_verifies_only_the_original() {
        let hash = hash_password("s3cret").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("S3cret", &hash));
        assert!(!verify_password("s3cret", "not-a-phc-string"));
    }

    #[test]
    fn role_gates() {
        let mut c = claims(10);
        assert!(require_staff(&c).is_ok());
        assert!(require_at_least(&c, Role::SuperAdmin).is_err());
        c.role = Role::Child;
        assert!(require_staff(&c).is_err());
        c.role = Role::Master;
        assert!(require_at_least(&c, Role::SuperAdmin).is_ok());
        assert!(require_role(&c, Role::SuperAdmin).is_err());
    }
}
