use std::collections::HashMap;

use secrecy::SecretString;

use super::*;

fn headers_with_basic_auth(user: &str, pass: &str) -> http::HeaderMap {
	let mut headers = http::HeaderMap::new();
	let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, format!("{user}:{pass}"));
	headers.insert(
		http::header::AUTHORIZATION,
		http::HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
	);
	headers
}

#[tokio::test]
async fn basic_auth_accepts_matching_credentials() {
	let mut users = HashMap::new();
	users.insert("alice".to_string(), SecretString::new("hunter2".into()));
	let validator = Validator::BasicAuth {
		realm: Strng::from("default"),
		users,
	};
	let headers = headers_with_basic_auth("alice", "hunter2");
	let (claims, _) = validator.validate(&headers, &HashMap::new()).await.unwrap();
	assert_eq!(claims.get("user").unwrap().as_str(), Some("alice"));
}

#[tokio::test]
async fn basic_auth_rejects_wrong_password() {
	let mut users = HashMap::new();
	users.insert("alice".to_string(), SecretString::new("hunter2".into()));
	let validator = Validator::BasicAuth {
		realm: Strng::from("default"),
		users,
	};
	let headers = headers_with_basic_auth("alice", "wrong");
	let err = validator.validate(&headers, &HashMap::new()).await.unwrap_err();
	assert_eq!(err.kind.label(), ErrorKind::AccessControlCredentialsMismatch.label());
}

#[tokio::test]
async fn api_key_validator_checks_header_against_known_keys() {
	let validator = Validator::ApiKey {
		header: Strng::from("x-api-key"),
		keys: vec![SecretString::new("abc123".into())],
	};
	let mut headers = http::HeaderMap::new();
	headers.insert("x-api-key", http::HeaderValue::from_static("abc123"));
	assert!(validator.validate(&headers, &HashMap::new()).await.is_ok());
}

#[tokio::test]
async fn chain_short_circuits_on_first_failure() {
	let mut users = HashMap::new();
	users.insert("alice".to_string(), SecretString::new("hunter2".into()));
	let chain = AccessControlChain {
		validators: vec![
			Arc::new(Validator::BasicAuth {
				realm: Strng::from("default"),
				users,
			}),
			Arc::new(Validator::ApiKey {
				header: Strng::from("x-api-key"),
				keys: vec![SecretString::new("abc123".into())],
			}),
		],
		rules: RuleSets::default(),
	};
	let headers = headers_with_basic_auth("alice", "wrong");
	assert!(chain.run(&headers, &HashMap::new()).await.is_err());
}

#[tokio::test]
async fn chain_requires_all_validators_to_pass() {
	let mut users = HashMap::new();
	users.insert("alice".to_string(), SecretString::new("hunter2".into()));
	let chain = AccessControlChain {
		validators: vec![
			Arc::new(Validator::BasicAuth {
				realm: Strng::from("default"),
				users,
			}),
			Arc::new(Validator::ApiKey {
				header: Strng::from("x-api-key"),
				keys: vec![SecretString::new("abc123".into())],
			}),
		],
		rules: RuleSets::default(),
	};
	let mut headers = headers_with_basic_auth("alice", "hunter2");
	headers.insert("x-api-key", http::HeaderValue::from_static("abc123"));
	let outcome = chain.run(&headers, &HashMap::new()).await.unwrap();
	assert_eq!(outcome.claims_by_validator.len(), 2);
}

#[test]
fn no_rules_means_allow_all() {
	let rules = RuleSets::default();
	let ctx = EvalContext::default();
	assert!(rules.validate(&ctx));
}

#[test]
fn deny_wins_over_allow() {
	let allow = Arc::new(Expression::new("true").unwrap());
	let deny = Arc::new(Expression::new("true").unwrap());
	let rules = RuleSets(vec![PolicySet {
		allow: vec![allow],
		deny: vec![deny],
	}]);
	let ctx = EvalContext::default();
	assert!(!rules.validate(&ctx));
}
