//! JWT access-control validator.
//!
//! Claim decoding/`kid` lookup: `decode_header` -> look up `kid` ->
//! `jsonwebtoken::decode`. Roles/permissions resolution:
//! permissions come from a configured permissions claim, from roles mapped
//! through `roles_map`, and then transitively from any newly granted
//! permission that is itself a key in `permissions_map`, with `roles_map["*"]`
//! (if present) always applied regardless of the token's actual roles.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use gateway_core::Strng;
use jsonwebtoken::jwk::AlgorithmParameters;
use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation, decode, decode_header};
use serde_json::Value as JsonValue;

use super::jwks::{JwksError, JwksHandle};
use crate::context::Claims;
use crate::expr::{EvalContext, Expression, RequestBinding};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JwtError {
	#[error("no bearer token present")]
	Missing,
	#[error("token header is malformed: {0:?}")]
	InvalidHeader(jsonwebtoken::errors::Error),
	#[error("token header does not specify a `kid`")]
	MissingKeyId,
	#[error("token refers to an unknown key {0:?}")]
	UnknownKeyId(String),
	#[error("token failed validation: {0:?}")]
	Invalid(jsonwebtoken::errors::Error),
	#[error("token uses a disallowed algorithm {0:?}")]
	DisallowedAlgorithm(Algorithm),
	#[error("a required claim is missing: {0}")]
	MissingRequiredClaim(String),
	#[error("JWKS data unavailable: {0}")]
	Jwks(String),
}

impl From<JwksError> for JwtError {
	fn from(e: JwksError) -> Self {
		JwtError::Jwks(e.to_string())
	}
}

/// Where the token is read from the request.
#[derive(Clone, Debug)]
pub enum TokenSource {
	AuthorizationHeader,
	Header(Strng),
	Cookie(Strng),
	/// A CEL expression evaluated against the request's headers/cookies,
	/// for sources the built-in variants can't express (e.g. a query
	/// parameter, or a composed value).
	Expression(Arc<Expression>),
}

#[derive(Clone)]
enum KeySource {
	/// A single statically configured key; tokens carrying a `kid` are not
	/// rejected for it, since a static signing key has no `kid` concept at
	/// all.
	Static {
		decoding: DecodingKey,
		algorithm: Algorithm,
	},
	Jwks(JwksHandle),
}

#[derive(Clone)]
pub struct JwtValidator {
	pub name: Strng,
	source: TokenSource,
	keys: KeySource,
	issuer: Option<String>,
	audiences: Vec<String>,
	claims_required: Vec<String>,
	roles_claim: Option<String>,
	roles_map: HashMap<String, Vec<String>>,
	permissions_claim: Option<String>,
	permissions_map: HashMap<String, Vec<String>>,
	allowed_algorithms: Vec<Algorithm>,
}

pub struct JwtValidatorBuilder {
	name: Strng,
	source: TokenSource,
	keys: KeySource,
	issuer: Option<String>,
	audiences: Vec<String>,
	claims_required: Vec<String>,
	roles_claim: Option<String>,
	roles_map: HashMap<String, Vec<String>>,
	permissions_claim: Option<String>,
	permissions_map: HashMap<String, Vec<String>>,
	allowed_algorithms: Vec<Algorithm>,
}

impl JwtValidator {
	pub fn builder_with_static_key(
		name: impl Into<Strng>,
		decoding: DecodingKey,
		algorithm: Algorithm,
	) -> JwtValidatorBuilder {
		JwtValidatorBuilder {
			name: name.into(),
			source: TokenSource::AuthorizationHeader,
			keys: KeySource::Static { decoding, algorithm },
			issuer: None,
			audiences: Vec::new(),
			claims_required: Vec::new(),
			roles_claim: None,
			roles_map: HashMap::new(),
			permissions_claim: None,
			permissions_map: HashMap::new(),
			allowed_algorithms: vec![algorithm],
		}
	}

	pub fn builder_with_jwks(
		name: impl Into<Strng>,
		jwks: JwksHandle,
		allowed_algorithms: Vec<Algorithm>,
	) -> JwtValidatorBuilder {
		JwtValidatorBuilder {
			name: name.into(),
			source: TokenSource::AuthorizationHeader,
			keys: KeySource::Jwks(jwks),
			issuer: None,
			audiences: Vec::new(),
			claims_required: Vec::new(),
			roles_claim: None,
			roles_map: HashMap::new(),
			permissions_claim: None,
			permissions_map: HashMap::new(),
			allowed_algorithms,
		}
	}

	fn extract_token<'a>(&self, headers: &'a http::HeaderMap, cookies: &'a HashMap<String, String>) -> Option<String> {
		match &self.source {
			TokenSource::AuthorizationHeader => headers
				.get(http::header::AUTHORIZATION)
				.and_then(|v| v.to_str().ok())
				.and_then(strip_bearer)
				.map(str::to_string),
			TokenSource::Header(name) => headers.get(name.as_str()).and_then(|v| v.to_str().ok()).map(str::to_string),
			TokenSource::Cookie(name) => cookies.get(name.as_str()).cloned(),
			TokenSource::Expression(expr) => {
				let binding = RequestBinding {
					method: http::Method::GET,
					url: http::Uri::default(),
					headers: headers
						.iter()
						.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
						.collect(),
					query: HashMap::new(),
					cookies: cookies.clone(),
					path_params: HashMap::new(),
					wildcard: None,
					body: None,
					json_body: None,
					form_body: None,
					body_bytes: None,
				};
				let ctx = EvalContext {
					request: Some(Arc::new(binding)),
					..Default::default()
				};
				ctx.eval_string(expr)
			},
		}
	}

	pub async fn validate(
		&self,
		headers: &http::HeaderMap,
		cookies: &HashMap<String, String>,
	) -> Result<(Claims, Vec<String>), JwtError> {
		let token = self.extract_token(headers, cookies).ok_or(JwtError::Missing)?;
		let claims = self.validate_claims(&token).await?;
		let granted = self.granted_permissions(&claims);
		Ok((claims, granted))
	}

	async fn validate_claims(&self, token: &str) -> Result<Claims, JwtError> {
		let header = decode_header(token).map_err(JwtError::InvalidHeader)?;
		if !self.allowed_algorithms.contains(&header.alg) {
			return Err(JwtError::DisallowedAlgorithm(header.alg));
		}

		let decoding = match &self.keys {
			KeySource::Static { decoding, .. } => decoding.clone(),
			KeySource::Jwks(handle) => {
				let kid = header.kid.as_ref().ok_or(JwtError::MissingKeyId)?;
				let jwks = handle.data().await?;
				let jwk = jwks.find(kid).ok_or_else(|| JwtError::UnknownKeyId(kid.clone()))?;
				decoding_key_from_jwk(jwk).ok_or_else(|| JwtError::UnknownKeyId(kid.clone()))?
			},
		};

		let mut validation = Validation::new(header.alg);
		if let Some(iss) = &self.issuer {
			validation.set_issuer(&[iss]);
		}
		if !self.audiences.is_empty() {
			validation.set_audience(&self.audiences);
		} else {
			validation.validate_aud = false;
		}

		let data: TokenData<Claims> = decode(token, &decoding, &validation).map_err(JwtError::Invalid)?;

		for required in &self.claims_required {
			if !data.claims.contains_key(required) {
				return Err(JwtError::MissingRequiredClaim(required.clone()));
			}
		}

		Ok(data.claims)
	}

	/// Resolves granted permissions: permissions claim values, then
	/// role-mapped permissions (with `*` in `roles_map` always applied),
	/// then transitively mapped permissions, each step deduplicated via
	/// insertion order.
	fn granted_permissions(&self, claims: &Claims) -> Vec<String> {
		let mut granted: Vec<String> = Vec::new();
		let mut push = |perms: &mut Vec<String>, value: &str| {
			let value = value.trim();
			if !value.is_empty() && !perms.iter().any(|p| p == value) {
				perms.push(value.to_string());
			}
		};

		if let Some(claim_name) = &self.permissions_claim {
			if let Some(JsonValue::Array(values)) = claims.get(claim_name) {
				for v in values {
					if let JsonValue::String(s) = v {
						push(&mut granted, s);
					}
				}
			} else if let Some(JsonValue::String(s)) = claims.get(claim_name) {
				for part in s.split_whitespace() {
					push(&mut granted, part);
				}
			}
		}

		let roles: Vec<String> = match self.roles_claim.as_ref().and_then(|c| claims.get(c)) {
			Some(JsonValue::Array(values)) => values
				.iter()
				.filter_map(|v| v.as_str().map(str::to_string))
				.collect(),
			Some(JsonValue::String(s)) => s.split_whitespace().map(str::to_string).collect(),
			_ => Vec::new(),
		};

		if let Some(always) = self.roles_map.get("*") {
			for p in always {
				push(&mut granted, p);
			}
		}
		for role in &roles {
			if let Some(mapped) = self.roles_map.get(role) {
				for p in mapped {
					push(&mut granted, p);
				}
			}
		}

		// Transitive closure over permissions_map, bounded by the number of
		// distinct permissions ever seen so it always terminates.
		let mut i = 0;
		while i < granted.len() {
			let current = granted[i].clone();
			if let Some(mapped) = self.permissions_map.get(&current) {
				for p in mapped.clone() {
					push(&mut granted, &p);
				}
			}
			i += 1;
		}

		granted
	}
}

/// Strips a case-insensitive `Bearer ` scheme prefix, per RFC 6750 §2.1
/// (the scheme name is case-insensitive even though the token itself is
/// not).
fn strip_bearer(value: &str) -> Option<&str> {
	let (scheme, rest) = value.split_once(' ')?;
	scheme.eq_ignore_ascii_case("bearer").then_some(rest)
}

fn decoding_key_from_jwk(jwk: &jsonwebtoken::jwk::Jwk) -> Option<DecodingKey> {
	match &jwk.algorithm {
		AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
		AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
		_ => None,
	}
}

impl JwtValidatorBuilder {
	pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
		self.issuer = Some(issuer.into());
		self
	}
	pub fn audiences(mut self, audiences: Vec<String>) -> Self {
		self.audiences = audiences;
		self
	}
	pub fn claims_required(mut self, claims: Vec<String>) -> Self {
		self.claims_required = claims;
		self
	}
	pub fn source(mut self, source: TokenSource) -> Self {
		self.source = source;
		self
	}
	pub fn roles_claim(mut self, claim: impl Into<String>) -> Self {
		self.roles_claim = Some(claim.into());
		self
	}
	pub fn roles_map(mut self, map: HashMap<String, Vec<String>>) -> Self {
		self.roles_map = map;
		self
	}
	pub fn permissions_claim(mut self, claim: impl Into<String>) -> Self {
		self.permissions_claim = Some(claim.into());
		self
	}
	pub fn permissions_map(mut self, map: HashMap<String, Vec<String>>) -> Self {
		self.permissions_map = map;
		self
	}

	pub fn build(self) -> JwtValidator {
		JwtValidator {
			name: self.name,
			source: self.source,
			keys: self.keys,
			issuer: self.issuer,
			audiences: self.audiences,
			claims_required: self.claims_required,
			roles_claim: self.roles_claim,
			roles_map: self.roles_map,
			permissions_claim: self.permissions_claim,
			permissions_map: self.permissions_map,
			allowed_algorithms: self.allowed_algorithms,
		}
	}
}

#[cfg(test)]
#[path = "jwt_tests.rs"]
mod tests;
