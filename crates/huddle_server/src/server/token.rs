#![forbid(unsafe_code)]

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context as _, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use huddle_domain::{Role, RoomId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TokenError;
use crate::util::time::unix_secs_now;

/// Claim layout version written into every token.
pub const TOKEN_VERSION: u32 = 1;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Claims of a room-access token (hours to days).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoomAccessClaims {
	pub version: u32,
	pub room_id: RoomId,
	pub role: Role,
	/// Absolute expiry, Unix seconds.
	pub exp: i64,
}

/// Claims of a realtime-connection token (minutes). Authorizes opening one
/// connection, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectionClaims {
	pub version: u32,
	pub user_id: UserId,
	pub room_id: RoomId,
	/// Absolute expiry, Unix seconds.
	pub exp: i64,
}

trait Expiring {
	fn version(&self) -> u32;
	fn exp(&self) -> i64;
}

impl Expiring for RoomAccessClaims {
	fn version(&self) -> u32 {
		self.version
	}

	fn exp(&self) -> i64 {
		self.exp
	}
}

impl Expiring for ConnectionClaims {
	fn version(&self) -> u32 {
		self.version
	}

	fn exp(&self) -> i64 {
		self.exp
	}
}

/// Issues and verifies stateless AES-256-GCM tokens.
///
/// Wire format: `base64url(nonce || ciphertext || tag)` without padding. The
/// key is `SHA-256(secret)`. There is no revocation list, so callers must
/// re-check membership against the store before any privileged action.
#[derive(Clone)]
pub struct TokenAuthority {
	cipher: Aes256Gcm,
}

impl fmt::Debug for TokenAuthority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("TokenAuthority(<redacted>)")
	}
}

impl TokenAuthority {
	pub fn new(secret: &str) -> Self {
		let digest = Sha256::digest(secret.as_bytes());
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(digest.as_slice()));
		Self { cipher }
	}

	/// Issue a room-access token. A negative `ttl_secs` yields an already
	/// expired token.
	pub fn issue_room_token(&self, room_id: RoomId, role: Role, ttl_secs: i64) -> anyhow::Result<String> {
		let claims = RoomAccessClaims {
			version: TOKEN_VERSION,
			room_id,
			role,
			exp: unix_secs_now().saturating_add(ttl_secs),
		};
		self.seal(&claims).context("seal room token")
	}

	pub fn verify_room_token(&self, token: &str) -> Result<RoomAccessClaims, TokenError> {
		self.open(token)
	}

	/// Issue a realtime-connection token for `(user_id, room_id)`.
	pub fn issue_connection_token(&self, user_id: UserId, room_id: RoomId, ttl_secs: i64) -> anyhow::Result<String> {
		let claims = ConnectionClaims {
			version: TOKEN_VERSION,
			user_id,
			room_id,
			exp: unix_secs_now().saturating_add(ttl_secs),
		};
		self.seal(&claims).context("seal connection token")
	}

	pub fn verify_connection_token(&self, token: &str) -> Result<ConnectionClaims, TokenError> {
		self.open(token)
	}

	fn seal<T: Serialize>(&self, claims: &T) -> anyhow::Result<String> {
		let payload = serde_json::to_vec(claims).context("encode claims")?;

		let mut nonce_bytes = [0u8; NONCE_LEN];
		OsRng.fill_bytes(&mut nonce_bytes);
		let nonce = Nonce::from_slice(&nonce_bytes);

		let ciphertext = self
			.cipher
			.encrypt(nonce, payload.as_slice())
			.map_err(|e| anyhow!("AES-GCM encrypt: {e}"))?;

		let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
		combined.extend_from_slice(&nonce_bytes);
		combined.extend_from_slice(&ciphertext);
		Ok(URL_SAFE_NO_PAD.encode(combined))
	}

	fn open<T: DeserializeOwned + Expiring>(&self, token: &str) -> Result<T, TokenError> {
		let combined = URL_SAFE_NO_PAD.decode(token).map_err(|_| TokenError::Invalid)?;
		if combined.len() < NONCE_LEN + TAG_LEN {
			return Err(TokenError::Invalid);
		}

		let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
		let plaintext = self
			.cipher
			.decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
			.map_err(|_| TokenError::Invalid)?;

		let claims: T = serde_json::from_slice(&plaintext).map_err(|_| TokenError::Invalid)?;
		if claims.version() != TOKEN_VERSION {
			return Err(TokenError::Invalid);
		}

		if claims.exp() < unix_secs_now() {
			return Err(TokenError::Expired);
		}

		Ok(claims)
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;
	use uuid::Uuid;

	use super::*;

	fn authority() -> TokenAuthority {
		TokenAuthority::new("test-server-secret")
	}

	fn role_strategy() -> impl Strategy<Value = Role> {
		prop_oneof![Just(Role::Creator), Just(Role::Member)]
	}

	#[test]
	fn room_token_roundtrip() {
		let ta = authority();
		let room = RoomId::new_v4();

		let before = unix_secs_now();
		let token = ta.issue_room_token(room, Role::Creator, 3600).expect("issue");
		let claims = ta.verify_room_token(&token).expect("verify");

		assert_eq!(claims.version, TOKEN_VERSION);
		assert_eq!(claims.room_id, room);
		assert_eq!(claims.role, Role::Creator);
		assert!(claims.exp >= before + 3600);
	}

	#[test]
	fn connection_token_roundtrip() {
		let ta = authority();
		let user = UserId::new_v4();
		let room = RoomId::new_v4();

		let token = ta.issue_connection_token(user, room, 300).expect("issue");
		let claims = ta.verify_connection_token(&token).expect("verify");

		assert_eq!(claims.user_id, user);
		assert_eq!(claims.room_id, room);
	}

	#[test]
	fn each_token_uses_a_fresh_nonce() {
		let ta = authority();
		let room = RoomId::new_v4();

		let a = ta.issue_room_token(room, Role::Member, 60).unwrap();
		let b = ta.issue_room_token(room, Role::Member, 60).unwrap();
		assert_ne!(a, b);

		let a = URL_SAFE_NO_PAD.decode(a).unwrap();
		let b = URL_SAFE_NO_PAD.decode(b).unwrap();
		assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
	}

	#[test]
	fn expired_connection_token_is_expired_not_invalid() {
		let ta = authority();
		let token = ta.issue_connection_token(UserId::new_v4(), RoomId::new_v4(), -1).unwrap();
		assert_eq!(ta.verify_connection_token(&token), Err(TokenError::Expired));
	}

	#[test]
	fn token_kinds_are_not_interchangeable() {
		let ta = authority();
		let room = RoomId::new_v4();

		let room_token = ta.issue_room_token(room, Role::Member, 60).unwrap();
		let conn_token = ta.issue_connection_token(UserId::new_v4(), room, 60).unwrap();

		assert_eq!(ta.verify_connection_token(&room_token), Err(TokenError::Invalid));
		assert_eq!(ta.verify_room_token(&conn_token), Err(TokenError::Invalid));
	}

	#[test]
	fn other_secret_rejects_token() {
		let token = authority().issue_room_token(RoomId::new_v4(), Role::Member, 60).unwrap();
		let other = TokenAuthority::new("another-secret");
		assert_eq!(other.verify_room_token(&token), Err(TokenError::Invalid));
	}

	#[test]
	fn garbage_and_truncated_tokens_are_invalid() {
		let ta = authority();
		let token = ta.issue_room_token(RoomId::new_v4(), Role::Member, 60).unwrap();

		assert_eq!(ta.verify_room_token(""), Err(TokenError::Invalid));
		assert_eq!(ta.verify_room_token("not base64 at all!"), Err(TokenError::Invalid));
		assert_eq!(ta.verify_room_token(&token[..token.len() - 4]), Err(TokenError::Invalid));
		assert_eq!(ta.verify_room_token(&token[..8]), Err(TokenError::Invalid));
	}

	#[test]
	fn flipping_any_ciphertext_bit_is_invalid() {
		let ta = authority();
		let token = ta.issue_room_token(RoomId::new_v4(), Role::Creator, 3600).unwrap();
		let raw = URL_SAFE_NO_PAD.decode(&token).unwrap();

		for bit in 0..raw.len() * 8 {
			let mut tampered = raw.clone();
			tampered[bit / 8] ^= 1 << (bit % 8);
			let tampered = URL_SAFE_NO_PAD.encode(tampered);
			assert_eq!(
				ta.verify_room_token(&tampered),
				Err(TokenError::Invalid),
				"bit {bit} flip was accepted"
			);
		}
	}

	#[test]
	fn flipping_any_bit_of_the_encoded_token_is_invalid() {
		let ta = authority();
		let token = ta.issue_connection_token(UserId::new_v4(), RoomId::new_v4(), 3600).unwrap();

		for idx in 0..token.len() {
			for bit in 0..8 {
				let mut bytes = token.clone().into_bytes();
				bytes[idx] ^= 1 << bit;
				let Ok(tampered) = String::from_utf8(bytes) else {
					continue;
				};
				assert_eq!(
					ta.verify_connection_token(&tampered),
					Err(TokenError::Invalid),
					"char {idx} bit {bit} flip was accepted"
				);
			}
		}
	}

	proptest! {
		#[test]
		fn prop_room_token_roundtrip(raw in any::<u128>(), role in role_strategy(), ttl in 1i64..10_000_000) {
			let ta = authority();
			let room = RoomId::from_uuid(Uuid::from_u128(raw));

			let before = unix_secs_now();
			let token = ta.issue_room_token(room, role, ttl).unwrap();
			let claims = ta.verify_room_token(&token).unwrap();
			let after = unix_secs_now();

			prop_assert_eq!(claims.room_id, room);
			prop_assert_eq!(claims.role, role);
			prop_assert!(claims.exp >= before + ttl && claims.exp <= after + ttl);
		}

		#[test]
		fn prop_negative_ttl_is_always_expired(role in role_strategy(), ttl in -10_000_000i64..0) {
			let ta = authority();
			let token = ta.issue_room_token(RoomId::new_v4(), role, ttl).unwrap();
			prop_assert_eq!(ta.verify_room_token(&token), Err(TokenError::Expired));
		}
	}
}
