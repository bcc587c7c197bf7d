use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, encode};
use serde_json::json;

use super::*;

fn hs256_validator(roles_map: HashMap<String, Vec<String>>, permissions_map: HashMap<String, Vec<String>>) -> JwtValidator {
	JwtValidator::builder_with_static_key(
		"test",
		DecodingKey::from_secret(b"secret"),
		Algorithm::HS256,
	)
	.roles_claim("roles")
	.roles_map(roles_map)
	.permissions_claim("permissions")
	.permissions_map(permissions_map)
	.build()
}

#[tokio::test]
async fn validates_token_and_extracts_claims() {
	let validator = hs256_validator(HashMap::new(), HashMap::new());
	let claims = json!({"sub": "alice"}).as_object().unwrap().clone();
	let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"secret")).unwrap();

	let mut headers = http::HeaderMap::new();
	headers.insert(
		http::header::AUTHORIZATION,
		http::HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
	);
	let (decoded, _granted) = validator.validate(&headers, &HashMap::new()).await.unwrap();
	assert_eq!(decoded.get("sub").unwrap().as_str(), Some("alice"));
}

#[tokio::test]
async fn missing_bearer_token_is_an_error() {
	let validator = hs256_validator(HashMap::new(), HashMap::new());
	let err = validator.validate(&http::HeaderMap::new(), &HashMap::new()).await.unwrap_err();
	assert_eq!(err, JwtError::Missing);
}

#[test]
fn wildcard_role_mapping_always_applies() {
	let mut roles_map = HashMap::new();
	roles_map.insert("*".to_string(), vec!["base".to_string()]);
	roles_map.insert("admin".to_string(), vec!["manage".to_string()]);
	let validator = hs256_validator(roles_map, HashMap::new());

	let mut claims = serde_json::Map::new();
	claims.insert("roles".to_string(), json!(["admin"]));
	let granted = validator.granted_permissions(&claims);
	assert!(granted.contains(&"base".to_string()));
	assert!(granted.contains(&"manage".to_string()));
}

#[test]
fn permissions_map_resolves_transitively() {
	let mut permissions_map = HashMap::new();
	permissions_map.insert("manage".to_string(), vec!["read".to_string(), "write".to_string()]);
	permissions_map.insert("write".to_string(), vec!["audit".to_string()]);
	let mut roles_map = HashMap::new();
	roles_map.insert("admin".to_string(), vec!["manage".to_string()]);
	let validator = hs256_validator(roles_map, permissions_map);

	let mut claims = serde_json::Map::new();
	claims.insert("roles".to_string(), json!(["admin"]));
	let granted = validator.granted_permissions(&claims);
	assert!(granted.contains(&"manage".to_string()));
	assert!(granted.contains(&"read".to_string()));
	assert!(granted.contains(&"write".to_string()));
	assert!(granted.contains(&"audit".to_string()));
}

#[test]
fn permissions_are_deduplicated() {
	let mut permissions_map = HashMap::new();
	permissions_map.insert("a".to_string(), vec!["b".to_string()]);
	permissions_map.insert("c".to_string(), vec!["b".to_string()]);
	let mut roles_map = HashMap::new();
	roles_map.insert("r".to_string(), vec!["a".to_string(), "c".to_string()]);
	let validator = hs256_validator(roles_map, permissions_map);

	let mut claims = serde_json::Map::new();
	claims.insert("roles".to_string(), json!(["r"]));
	let granted = validator.granted_permissions(&claims);
	assert_eq!(granted.iter().filter(|p| *p == "b").count(), 1);
}
