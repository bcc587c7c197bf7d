//! Access-control chain: credential validators (basic auth, API key) and
//! JWT validators, plus an expression-based allow/deny rule set layered on
//! top of either.
//!
//! `PolicySet`/`RuleSets` evaluate deny-wins-then-allow-then-default-deny:
//! no configured rules means allow-all, any matching deny rule wins
//! outright, otherwise any matching allow rule permits the request, and
//! anything left over is denied by default.

pub mod jwks;
pub mod jwt;

use std::collections::HashMap;
use std::sync::Arc;

use gateway_core::Strng;
use secrecy::{ExposeSecret, SecretString};

use crate::context::Claims;
use crate::error::{ErrorKind, GatewayError};
use crate::expr::{EvalContext, Expression};

/// A single validator in the access-control chain. Basic-auth and API-key
/// validators only confirm a shared secret and don't produce claims; JWT
/// validators produce claims plus granted permissions that get merged into
/// the request context.
pub enum Validator {
	BasicAuth { realm: Strng, users: HashMap<String, SecretString> },
	ApiKey { header: Strng, keys: Vec<SecretString> },
	Jwt(jwt::JwtValidator),
}

impl Validator {
	pub fn name(&self) -> &str {
		match self {
			Validator::BasicAuth { realm, .. } => realm.as_str(),
			Validator::ApiKey { header, .. } => header.as_str(),
			Validator::Jwt(v) => v.name.as_str(),
		}
	}

	pub async fn validate(
		&self,
		headers: &http::HeaderMap,
		cookies: &HashMap<String, String>,
	) -> Result<(Claims, Vec<String>), GatewayError> {
		match self {
			Validator::BasicAuth { users, .. } => validate_basic_auth(headers, users),
			Validator::ApiKey { header, keys } => validate_api_key(headers, header, keys),
			Validator::Jwt(v) => v.validate(headers, cookies).await.map_err(classify_jwt_error),
		}
	}
}

fn classify_jwt_error(err: jwt::JwtError) -> GatewayError {
	use jwt::JwtError::*;
	let kind = match &err {
		Missing => ErrorKind::JwtTokenMissing,
		InvalidHeader(_) | UnknownKeyId(_) | DisallowedAlgorithm(_) | MissingKeyId => ErrorKind::JwtTokenInvalid,
		Invalid(inner) if inner.kind() == &jsonwebtoken::errors::ErrorKind::ExpiredSignature => ErrorKind::JwtTokenExpired,
		Invalid(_) | MissingRequiredClaim(_) => ErrorKind::JwtTokenInvalid,
		Jwks(_) => ErrorKind::BackendUnreachable,
	};
	GatewayError::new(kind).with_cause(anyhow::anyhow!(err.to_string()))
}

fn validate_basic_auth(
	headers: &http::HeaderMap,
	users: &HashMap<String, SecretString>,
) -> Result<(Claims, Vec<String>), GatewayError> {
	let header = headers
		.get(http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| GatewayError::new(ErrorKind::AccessControlCredentialsMissing))?;
	let encoded = header
		.strip_prefix("Basic ")
		.ok_or_else(|| GatewayError::new(ErrorKind::AccessControlCredentialsMismatch))?;
	let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
		.map_err(|_| GatewayError::new(ErrorKind::AccessControlCredentialsMismatch))?;
	let decoded = String::from_utf8(decoded).map_err(|_| GatewayError::new(ErrorKind::AccessControlCredentialsMismatch))?;
	let (user, pass) = decoded
		.split_once(':')
		.ok_or_else(|| GatewayError::new(ErrorKind::AccessControlCredentialsMismatch))?;
	match users.get(user) {
		Some(expected) if expected.expose_secret() == pass => {
			let mut claims = Claims::new();
			claims.insert("user".to_string(), serde_json::Value::String(user.to_string()));
			Ok((claims, Vec::new()))
		},
		_ => Err(GatewayError::new(ErrorKind::AccessControlCredentialsMismatch)),
	}
}

fn validate_api_key(
	headers: &http::HeaderMap,
	header_name: &str,
	keys: &[SecretString],
) -> Result<(Claims, Vec<String>), GatewayError> {
	let provided = headers
		.get(header_name)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| GatewayError::new(ErrorKind::AccessControlCredentialsMissing))?;
	if keys.iter().any(|k| k.expose_secret() == provided) {
		Ok((Claims::new(), Vec::new()))
	} else {
		Err(GatewayError::new(ErrorKind::AccessControlCredentialsMismatch))
	}
}

/// Allow/deny expression rules layered on top of validators.
#[derive(Default)]
pub struct PolicySet {
	pub allow: Vec<Arc<Expression>>,
	pub deny: Vec<Arc<Expression>>,
}

impl PolicySet {
	fn has_rules(&self) -> bool {
		!self.allow.is_empty() || !self.deny.is_empty()
	}

	fn denies(&self, ctx: &EvalContext) -> bool {
		self.deny.iter().any(|rule| ctx.eval_bool(rule))
	}

	fn allows(&self, ctx: &EvalContext) -> bool {
		self.allow.iter().any(|rule| ctx.eval_bool(rule))
	}
}

#[derive(Default)]
pub struct RuleSets(pub Vec<PolicySet>);

impl RuleSets {
	/// No configured rule sets means allow-all; deny wins over allow;
	/// anything left over is denied by default.
	pub fn validate(&self, ctx: &EvalContext) -> bool {
		if !self.0.iter().any(|r| r.has_rules()) {
			return true;
		}
		if self.0.iter().any(|r| r.denies(ctx)) {
			return false;
		}
		self.0.iter().any(|r| r.allows(ctx))
	}
}

/// Named chain of validators run for an endpoint. Each validator that
/// succeeds contributes claims (keyed by its name) and merges its granted
/// permissions into the request context.
pub struct AccessControlChain {
	pub validators: Vec<Arc<Validator>>,
	pub rules: RuleSets,
}

pub struct ChainOutcome {
	pub claims_by_validator: HashMap<Strng, Claims>,
	pub granted_permissions: Vec<String>,
}

impl AccessControlChain {
	/// Runs every validator in insertion order; the first failure
	/// short-circuits and produces the template-rendered error. All must
	/// succeed: this is an AND chain, not an OR of alternatives. On
	/// success, each validator's claims are kept under its own name and
	/// granted permissions accumulate across the whole chain.
	pub async fn run(
		&self,
		headers: &http::HeaderMap,
		cookies: &HashMap<String, String>,
	) -> Result<ChainOutcome, GatewayError> {
		let mut claims_by_validator = HashMap::new();
		let mut granted_permissions = Vec::new();

		for validator in &self.validators {
			let (claims, granted) = validator.validate(headers, cookies).await?;
			claims_by_validator.insert(Strng::from(validator.name()), claims);
			for p in granted {
				if !granted_permissions.contains(&p) {
					granted_permissions.push(p);
				}
			}
		}

		Ok(ChainOutcome {
			claims_by_validator,
			granted_permissions,
		})
	}
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
