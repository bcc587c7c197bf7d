//! Declarative configuration data model and the load/build pipeline.
//!
//! A serde-deserialized raw document (`RawConfig` and friends) is turned
//! into the runtime types the rest of the crate consumes by [`build`]. Only
//! the YAML data model is in scope. Documents are read via `serde_yaml` plus
//! `serde_path_to_error`, so a malformed document reports a path into the
//! tree instead of a bare line/column.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gateway_core::Strng;
use indexmap::IndexMap;
use jsonwebtoken::{Algorithm, DecodingKey};
use secrecy::SecretString;
use serde::Deserialize;

use crate::accesscontrol::jwks::JwksSynchronizer;
use crate::accesscontrol::jwt::{JwtValidator, TokenSource};
use crate::accesscontrol::{AccessControlChain, PolicySet, RuleSets, Validator};
use crate::backend::openapi::OpenApiValidator;
use crate::backend::producer::{BackendCall, Kind as ProducerKind};
use crate::backend::transport::Transport;
use crate::backend::BackendConfig;
use crate::endpoint::sequence::{Sequence, SequenceNode};
use crate::endpoint::{EndpointConfig, Producer, ResponseSpec};
use crate::error::{DefaultErrorTemplate, ErrorChain, ErrorTemplate, GatewayError};
use crate::expr::{accumulate_buffer_options, Expression};
use crate::mux::Mux;
use crate::server::{ForwardingConfig, HostRouter, ListenerConfig};
use crate::telemetry::log::{LoggingConfig, LoggingFields};

// ---------------------------------------------------------------------
// Raw (serde) document model
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RawConfig {
	#[serde(default)]
	pub servers: Vec<ServerRaw>,
	#[serde(default)]
	pub definitions: DefinitionsRaw,
	#[serde(default)]
	pub settings: SettingsRaw,
}

#[derive(Debug, Default, Deserialize)]
pub struct DefinitionsRaw {
	#[serde(default)]
	pub backends: HashMap<String, BackendConfig>,
	#[serde(default)]
	pub access_controls: HashMap<String, AccessControlRaw>,
	#[serde(default)]
	pub jwks: HashMap<String, JwksProfileRaw>,
}

#[derive(Debug, Deserialize)]
pub struct JwksProfileRaw {
	pub url: String,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub ttl: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub max_stale: Option<Duration>,
	#[serde(default)]
	pub algorithms: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessControlRaw {
	BasicAuth {
		realm: String,
		users: HashMap<String, String>,
	},
	ApiKey {
		header: String,
		keys: Vec<String>,
	},
	Jwt {
		#[serde(default)]
		source: JwtSourceRaw,
		key: JwtKeyRaw,
		#[serde(default)]
		issuer: Option<String>,
		#[serde(default)]
		audiences: Vec<String>,
		#[serde(default)]
		claims_required: Vec<String>,
		#[serde(default)]
		roles_claim: Option<String>,
		#[serde(default)]
		roles_map: HashMap<String, Vec<String>>,
		#[serde(default)]
		permissions_claim: Option<String>,
		#[serde(default)]
		permissions_map: HashMap<String, Vec<String>>,
	},
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum JwtSourceRaw {
	#[default]
	AuthorizationHeader,
	Header {
		name: String,
	},
	Cookie {
		name: String,
	},
	/// Token extracted by evaluating a CEL expression against the request
	/// (e.g. a custom header or query parameter scheme).
	Expression {
		expr: String,
	},
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JwtKeyRaw {
	/// HMAC secret; `algorithm` must be one of the `HS*` variants.
	Static { secret: String, algorithm: String },
	/// RSA/ECDSA public key in PEM form.
	StaticPem { pem: String, algorithm: String },
	/// Reference into `definitions.jwks` by name.
	Jwks { profile: String },
}

#[derive(Debug, Deserialize)]
pub struct ServerRaw {
	pub hosts: Vec<String>,
	pub ports: Vec<u16>,
	#[serde(default)]
	pub apis: Vec<ApiRaw>,
	#[serde(default)]
	pub endpoints: Vec<EndpointRaw>,
	#[serde(default)]
	pub access_control: Vec<String>,
	#[serde(default)]
	pub tls: Option<TlsRaw>,
	#[serde(default)]
	pub logging: LoggingRaw,
}

/// Certificate/key paths for TLS termination on this server's ports.
#[derive(Debug, Deserialize)]
pub struct TlsRaw {
	pub cert_path: String,
	pub key_path: String,
}

/// Access-log customization: a CEL `filter` deciding whether a request is
/// logged at all, fields to `add` (name -> CEL expression), and field names
/// to `remove` from the default set. Inherited server -> api -> endpoint,
/// with `add`/`remove` accumulating and `filter` overridden by the
/// innermost level that sets one.
#[derive(Debug, Default, Deserialize)]
pub struct LoggingRaw {
	#[serde(default)]
	pub filter: Option<String>,
	#[serde(default)]
	pub add: IndexMap<String, String>,
	#[serde(default)]
	pub remove: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiRaw {
	#[serde(default)]
	pub base_path: String,
	#[serde(default)]
	pub endpoints: Vec<EndpointRaw>,
	#[serde(default)]
	pub access_control: Vec<String>,
	#[serde(default)]
	pub disable_access_control: Vec<String>,
	#[serde(default)]
	pub logging: LoggingRaw,
}

#[derive(Debug, Deserialize)]
pub struct EndpointRaw {
	pub pattern: String,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default)]
	pub access_control: Vec<String>,
	#[serde(default)]
	pub disable_access_control: Vec<String>,
	#[serde(default)]
	pub proxies: Vec<BackendCallRaw>,
	#[serde(default)]
	pub requests: Vec<BackendCallRaw>,
	#[serde(default)]
	pub sequences: Vec<SequenceRaw>,
	#[serde(default)]
	pub response: Option<ResponseRaw>,
	#[serde(default)]
	pub allow: Vec<String>,
	#[serde(default)]
	pub deny: Vec<String>,
	/// Permissions a request's granted-permission set must contain in full
	/// for this endpoint to run, checked after access control and
	/// independently of any `allow`/`deny` rule.
	#[serde(default)]
	pub required_permissions: Vec<String>,
	#[serde(default)]
	pub logging: LoggingRaw,
}

#[derive(Debug, Deserialize)]
pub struct BackendCallRaw {
	pub name: String,
	/// Either a reference to `definitions.backends.<name>` or an inline
	/// override merged onto it via [`BackendConfig::merge`].
	pub backend: String,
	#[serde(default)]
	pub backend_override: Option<BackendConfig>,
	#[serde(default = "default_method")]
	pub method: String,
	#[serde(default = "default_path")]
	pub path: String,
	#[serde(default)]
	pub request_headers: HashMap<String, String>,
	#[serde(default)]
	pub forward_request_body: bool,
	#[serde(default)]
	pub expected_status: Option<Vec<u16>>,
	#[serde(default)]
	pub openapi_spec: Option<String>,
	/// Log and continue instead of failing the call when the request fails
	/// OpenAPI validation.
	#[serde(default)]
	pub ignore_request_violations: bool,
	/// Log and continue instead of failing the call when the response fails
	/// OpenAPI validation.
	#[serde(default)]
	pub ignore_response_violations: bool,
}

fn default_method() -> String {
	"GET".to_string()
}

fn default_path() -> String {
	"/".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SequenceRaw {
	pub name: String,
	#[serde(default)]
	pub depends_on: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseRaw {
	#[serde(default)]
	pub status: Option<String>,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	#[serde(default)]
	pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SettingsRaw {
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub connect_timeout: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub ttfb_timeout: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub timeout: Option<Duration>,
	#[serde(default)]
	pub xfh_enabled: bool,
	#[serde(default)]
	pub xfp_enabled: bool,
	#[serde(default = "default_health_path")]
	pub health_path: String,
	#[serde(default = "default_bind_address")]
	pub bind_address: std::net::IpAddr,
	#[serde(default)]
	pub secure_cookies: bool,
	#[serde(default = "default_shutdown_delay", with = "crate::serdes::serde_dur")]
	pub shutdown_delay: Duration,
	#[serde(default = "default_shutdown_timeout", with = "crate::serdes::serde_dur")]
	pub shutdown_timeout: Duration,
}

fn default_health_path() -> String {
	crate::server::health::DEFAULT_HEALTH_PATH.to_string()
}

fn default_bind_address() -> std::net::IpAddr {
	std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_shutdown_delay() -> Duration {
	Duration::from_secs(0)
}

fn default_shutdown_timeout() -> Duration {
	Duration::from_secs(30)
}

impl Default for SettingsRaw {
	fn default() -> Self {
		SettingsRaw {
			connect_timeout: None,
			ttfb_timeout: None,
			timeout: None,
			xfh_enabled: false,
			xfp_enabled: false,
			health_path: default_health_path(),
			bind_address: default_bind_address(),
			secure_cookies: false,
			shutdown_delay: default_shutdown_delay(),
			shutdown_timeout: default_shutdown_timeout(),
		}
	}
}

/// Loads and parses a YAML configuration document, reporting a precise path
/// into the document on malformed input via `serde_path_to_error`.
pub fn load(path: &Path) -> anyhow::Result<RawConfig> {
	let contents = std::fs::read_to_string(path)
		.map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
	let de = serde_yaml::Deserializer::from_str(&contents);
	serde_path_to_error::deserialize(de).map_err(|e| anyhow::anyhow!("{} at {}", e, e.path()))
}

// ---------------------------------------------------------------------
// Build: raw document -> runtime types
// ---------------------------------------------------------------------

pub struct CompiledEndpoint {
	pub config: EndpointConfig,
	pub access_control: Arc<AccessControlChain>,
	pub error_chain: Arc<ErrorChain>,
	pub required_permissions: Vec<String>,
	pub logging: LoggingConfig,
}

pub struct BuiltGateway {
	pub listeners: Vec<ListenerConfig<Arc<CompiledEndpoint>>>,
	pub health_path: String,
	pub shutdown_delay: Duration,
	pub shutdown_timeout: Duration,
}

/// Builds every runtime structure from a parsed [`RawConfig`]: backends and
/// JWKS synchronizers are constructed once and shared by name, then each
/// server's routes are compiled into a [`Mux`] keyed into a [`HostRouter`]
/// per listening port.
pub fn build(raw: RawConfig) -> anyhow::Result<BuiltGateway> {
	let _ = rustls::crypto::ring::default_provider().install_default();

	let backends = build_backends(&raw.definitions.backends, &raw.settings)?;
	let jwks = build_jwks(&raw.definitions.jwks)?;
	let validators = build_validators(&raw.definitions.access_controls, &jwks)?;

	let default_tpl: Arc<dyn ErrorTemplate> = Arc::new(DefaultErrorTemplate);

	// host -> port -> Mux
	let mut by_port: HashMap<u16, HostRouter<Arc<CompiledEndpoint>>> = HashMap::new();
	let mut tls_by_port: HashMap<u16, Arc<rustls::ServerConfig>> = HashMap::new();

	for server in &raw.servers {
		let mut api_base_paths = Vec::new();
		for api in &server.apis {
			if !api.base_path.is_empty() {
				api_base_paths.push(Strng::from(api.base_path.clone()));
			}
		}

		let server_tls = server.tls.as_ref().map(build_tls_config).transpose()?;
		let server_logging = [&server.logging];

		for &port in &server.ports {
			if let Some(tls) = &server_tls {
				tls_by_port.insert(port, tls.clone());
			}

			let router = by_port.entry(port).or_default();
			let mut mux: Mux<Arc<CompiledEndpoint>> = Mux::new(api_base_paths.clone());

			let server_names: Vec<String> = server.access_control.clone();
			register_endpoints(
				&mut mux,
				&server.endpoints,
				&server_names,
				&[],
				&server_logging,
				&backends,
				&validators,
				&default_tpl,
			)?;
			for api in &server.apis {
				let mut names = server_names.clone();
				names.extend(api.access_control.clone());
				let api_logging = [&server.logging, &api.logging];
				register_endpoints(
					&mut mux,
					&api.endpoints,
					&names,
					&api.disable_access_control,
					&api_logging,
					&backends,
					&validators,
					&default_tpl,
				)?;
			}

			let mux = Arc::new(mux);
			for host in &server.hosts {
				router.insert(host, port, mux.clone());
			}
		}
	}

	let bind_address = raw.settings.bind_address;
	let forwarding = crate::server::ForwardingConfig {
		xfh_enabled: raw.settings.xfh_enabled,
		xfp_enabled: raw.settings.xfp_enabled,
	};
	let mut listeners = Vec::new();
	for (port, router) in by_port {
		listeners.push(ListenerConfig {
			address: SocketAddr::new(bind_address, port),
			hosts: Arc::new(router),
			health_path: raw.settings.health_path.clone(),
			forwarding,
			tls: tls_by_port.get(&port).cloned(),
		});
	}

	Ok(BuiltGateway {
		listeners,
		health_path: raw.settings.health_path,
		shutdown_delay: raw.settings.shutdown_delay,
		shutdown_timeout: raw.settings.shutdown_timeout,
	})
}

fn build_tls_config(raw: &TlsRaw) -> anyhow::Result<Arc<rustls::ServerConfig>> {
	let cert_bytes = std::fs::read(&raw.cert_path).map_err(|e| anyhow::anyhow!("reading tls cert {}: {e}", raw.cert_path))?;
	let key_bytes = std::fs::read(&raw.key_path).map_err(|e| anyhow::anyhow!("reading tls key {}: {e}", raw.key_path))?;

	let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| anyhow::anyhow!("parsing tls cert {}: {e}", raw.cert_path))?;
	let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
		.map_err(|e| anyhow::anyhow!("parsing tls key {}: {e}", raw.key_path))?
		.ok_or_else(|| anyhow::anyhow!("no private key found in {}", raw.key_path))?;

	let config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|e| anyhow::anyhow!("building tls server config: {e}"))?;
	Ok(Arc::new(config))
}

fn build_logging_config(chain: &[&LoggingRaw]) -> anyhow::Result<LoggingConfig> {
	let mut filter: Option<Arc<Expression>> = None;
	let mut remove: HashSet<String> = HashSet::new();
	let mut add: IndexMap<String, Arc<Expression>> = IndexMap::new();
	for raw in chain {
		if let Some(f) = &raw.filter {
			filter = Some(Arc::new(Expression::new(f.clone()).map_err(|e| anyhow::anyhow!(e.to_string()))?));
		}
		for r in &raw.remove {
			remove.insert(r.clone());
		}
		for (k, v) in &raw.add {
			add.insert(k.clone(), Arc::new(Expression::new(v.clone()).map_err(|e| anyhow::anyhow!(e.to_string()))?));
		}
	}
	Ok(LoggingConfig {
		filter,
		fields: Arc::new(LoggingFields { remove, add }),
	})
}

fn build_backends(
	raw: &HashMap<String, BackendConfig>,
	settings: &SettingsRaw,
) -> anyhow::Result<HashMap<String, Arc<BackendConfig>>> {
	let mut out = HashMap::new();
	for (name, cfg) in raw {
		let mut cfg = cfg.clone();
		cfg.connect_timeout = cfg.connect_timeout.or(settings.connect_timeout).or(Some(Duration::from_secs(10)));
		cfg.ttfb_timeout = cfg.ttfb_timeout.or(settings.ttfb_timeout).or(Some(Duration::from_secs(60)));
		cfg.timeout = cfg.timeout.or(settings.timeout).or(Some(Duration::from_secs(300)));
		out.insert(name.clone(), Arc::new(cfg));
	}
	Ok(out)
}

fn build_jwks(raw: &HashMap<String, JwksProfileRaw>) -> anyhow::Result<HashMap<String, crate::accesscontrol::jwks::JwksHandle>> {
	let mut out = HashMap::new();
	for (name, profile) in raw {
		let client = reqwest::Client::new();
		let synchronizer = JwksSynchronizer::new(
			profile.url.clone(),
			client,
			profile.ttl.unwrap_or(Duration::from_secs(300)),
			profile.max_stale.unwrap_or(Duration::from_secs(3600)),
		);
		out.insert(name.clone(), synchronizer.spawn());
	}
	Ok(out)
}

fn build_validators(
	raw: &HashMap<String, AccessControlRaw>,
	jwks: &HashMap<String, crate::accesscontrol::jwks::JwksHandle>,
) -> anyhow::Result<HashMap<String, Arc<Validator>>> {
	let mut out = HashMap::new();
	for (name, cfg) in raw {
		let validator = match cfg {
			AccessControlRaw::BasicAuth { realm, users } => Validator::BasicAuth {
				realm: Strng::from(realm.clone()),
				users: users.iter().map(|(k, v)| (k.clone(), SecretString::from(v.clone()))).collect(),
			},
			AccessControlRaw::ApiKey { header, keys } => Validator::ApiKey {
				header: Strng::from(header.clone()),
				keys: keys.iter().map(|k| SecretString::from(k.clone())).collect(),
			},
			AccessControlRaw::Jwt {
				source,
				key,
				issuer,
				audiences,
				claims_required,
				roles_claim,
				roles_map,
				permissions_claim,
				permissions_map,
			} => {
				let token_source = match source {
					JwtSourceRaw::AuthorizationHeader => TokenSource::AuthorizationHeader,
					JwtSourceRaw::Header { name } => TokenSource::Header(Strng::from(name.clone())),
					JwtSourceRaw::Cookie { name } => TokenSource::Cookie(Strng::from(name.clone())),
					JwtSourceRaw::Expression { expr } => {
						TokenSource::Expression(Arc::new(Expression::new(expr.clone()).map_err(|e| anyhow::anyhow!(e.to_string()))?))
					},
				};
				let mut builder = match key {
					JwtKeyRaw::Static { secret, algorithm } => {
						let alg = parse_algorithm(algorithm)?;
						JwtValidator::builder_with_static_key(name.clone(), DecodingKey::from_secret(secret.as_bytes()), alg)
					},
					JwtKeyRaw::StaticPem { pem, algorithm } => {
						let alg = parse_algorithm(algorithm)?;
						let key = if matches!(alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::PS256 | Algorithm::PS384 | Algorithm::PS512) {
							DecodingKey::from_rsa_pem(pem.as_bytes())
						} else {
							DecodingKey::from_ec_pem(pem.as_bytes())
						}
						.map_err(|e| anyhow::anyhow!("invalid PEM key for access control {name}: {e}"))?;
						JwtValidator::builder_with_static_key(name.clone(), key, alg)
					},
					JwtKeyRaw::Jwks { profile } => {
						let handle = jwks
							.get(profile)
							.ok_or_else(|| anyhow::anyhow!("access control {name} references unknown jwks profile {profile}"))?
							.clone();
						let algorithms = vec![Algorithm::RS256, Algorithm::ES256];
						JwtValidator::builder_with_jwks(name.clone(), handle, algorithms)
					},
				};
				builder = builder.source(token_source);
				if let Some(iss) = issuer {
					builder = builder.issuer(iss.clone());
				}
				if !audiences.is_empty() {
					builder = builder.audiences(audiences.clone());
				}
				if !claims_required.is_empty() {
					builder = builder.claims_required(claims_required.clone());
				}
				if let Some(claim) = roles_claim {
					builder = builder.roles_claim(claim.clone());
				}
				if !roles_map.is_empty() {
					builder = builder.roles_map(roles_map.clone());
				}
				if let Some(claim) = permissions_claim {
					builder = builder.permissions_claim(claim.clone());
				}
				if !permissions_map.is_empty() {
					builder = builder.permissions_map(permissions_map.clone());
				}
				Validator::Jwt(builder.build())
			},
		};
		out.insert(name.clone(), Arc::new(validator));
	}
	Ok(out)
}

fn parse_algorithm(name: &str) -> anyhow::Result<Algorithm> {
	match name {
		"HS256" => Ok(Algorithm::HS256),
		"HS384" => Ok(Algorithm::HS384),
		"HS512" => Ok(Algorithm::HS512),
		"RS256" => Ok(Algorithm::RS256),
		"RS384" => Ok(Algorithm::RS384),
		"RS512" => Ok(Algorithm::RS512),
		"ES256" => Ok(Algorithm::ES256),
		"ES384" => Ok(Algorithm::ES384),
		"PS256" => Ok(Algorithm::PS256),
		"PS384" => Ok(Algorithm::PS384),
		"PS512" => Ok(Algorithm::PS512),
		other => Err(anyhow::anyhow!("unsupported JWT algorithm {other}")),
	}
}

fn register_endpoints(
	mux: &mut Mux<Arc<CompiledEndpoint>>,
	endpoints: &[EndpointRaw],
	inherited_access_control: &[String],
	disabled: &[String],
	logging_chain: &[&LoggingRaw],
	backends: &HashMap<String, Arc<BackendConfig>>,
	validators: &HashMap<String, Arc<Validator>>,
	default_tpl: &Arc<dyn ErrorTemplate>,
) -> anyhow::Result<()> {
	for ep in endpoints {
		let mut chain: Vec<&LoggingRaw> = logging_chain.to_vec();
		chain.push(&ep.logging);
		let compiled = Arc::new(build_endpoint(ep, inherited_access_control, disabled, &chain, backends, validators, default_tpl)?);
		let methods = if ep.methods.is_empty() {
			vec![http::Method::GET, http::Method::POST, http::Method::PUT, http::Method::DELETE, http::Method::PATCH]
		} else {
			ep.methods
				.iter()
				.map(|m| http::Method::from_bytes(m.as_bytes()))
				.collect::<Result<Vec<_>, _>>()
				.map_err(|e| anyhow::anyhow!("invalid method in endpoint {}: {e}", ep.pattern))?
		};
		for method in methods {
			mux
				.add_endpoint_route(method, &ep.pattern, compiled.clone())
				.map_err(|e| anyhow::anyhow!(e))?;
		}
	}
	Ok(())
}

fn build_endpoint(
	ep: &EndpointRaw,
	inherited_access_control: &[String],
	disabled: &[String],
	logging_chain: &[&LoggingRaw],
	backends: &HashMap<String, Arc<BackendConfig>>,
	validators: &HashMap<String, Arc<Validator>>,
	default_tpl: &Arc<dyn ErrorTemplate>,
) -> anyhow::Result<CompiledEndpoint> {
	let mut names: Vec<String> = inherited_access_control.to_vec();
	names.extend(ep.access_control.clone());
	names.retain(|n| !disabled.contains(n) && !ep.disable_access_control.contains(n));

	let mut chain_validators = Vec::new();
	for name in &names {
		let v = validators
			.get(name)
			.ok_or_else(|| anyhow::anyhow!("endpoint {} references unknown access control {name}", ep.pattern))?;
		chain_validators.push(v.clone());
	}
	let policy_set = build_policy_set(&ep.allow, &ep.deny)?;
	let policy_exprs: Vec<Arc<Expression>> = policy_set.allow.iter().chain(policy_set.deny.iter()).cloned().collect();
	let access_control = Arc::new(AccessControlChain {
		validators: chain_validators,
		rules: RuleSets(vec![policy_set]),
	});

	let mut proxy_calls = Vec::new();
	for p in &ep.proxies {
		proxy_calls.push(build_producer(p, ProducerKind::Proxy, backends)?);
	}
	let mut request_calls = Vec::new();
	for r in &ep.requests {
		request_calls.push(build_producer(r, ProducerKind::Request, backends)?);
	}
	let proxies: Vec<Arc<dyn Producer>> = proxy_calls.iter().map(|p| p.clone() as Arc<dyn Producer>).collect();
	let requests: Vec<Arc<dyn Producer>> = request_calls.iter().map(|p| p.clone() as Arc<dyn Producer>).collect();

	let mut by_name: HashMap<String, Arc<dyn Producer>> = HashMap::new();
	for p in proxies.iter().chain(requests.iter()) {
		by_name.insert(p.name().to_string(), p.clone());
	}
	let mut sequences = Vec::new();
	for seq in &ep.sequences {
		let producer = by_name
			.get(&seq.name)
			.ok_or_else(|| anyhow::anyhow!("sequence {} in endpoint {} references unknown proxy/request", seq.name, ep.pattern))?
			.clone();
		sequences.push(SequenceNode {
			name: Strng::from(seq.name.clone()),
			depends_on: seq.depends_on.iter().map(|d| Strng::from(d.clone())).collect(),
			producer,
		});
	}
	let sequences = if sequences.is_empty() {
		Vec::new()
	} else {
		vec![Sequence { nodes: sequences }]
	};

	if ep.response.is_none() && proxies.is_empty() && requests.is_empty() {
		anyhow::bail!("endpoint {} must define at least one of proxy, request, response", ep.pattern);
	}

	let response = ep.response.as_ref().map(build_response_spec).transpose()?;

	let mut all_exprs: Vec<Arc<Expression>> = Vec::new();
	if let Some(r) = &response {
		all_exprs.extend(r.status.iter().cloned());
		all_exprs.extend(r.headers.values().cloned());
		all_exprs.extend(r.body.iter().cloned());
	}
	for call in proxy_calls.iter().chain(request_calls.iter()) {
		all_exprs.extend(call.request_headers.values().cloned());
	}
	all_exprs.extend(policy_exprs);
	let mut buffer_options = accumulate_buffer_options(all_exprs);
	if proxy_calls.iter().chain(request_calls.iter()).any(|c| c.forward_request_body) {
		buffer_options |= crate::context::BufferOptions::REQUEST_BODY;
	}

	Ok(CompiledEndpoint {
		config: EndpointConfig {
			name: Strng::from(ep.pattern.clone()),
			proxies,
			requests,
			sequences,
			response,
			buffer_options,
		},
		access_control,
		error_chain: Arc::new(ErrorChain {
			endpoint_handlers: None,
			endpoint_template: None,
			api_template: None,
			server_template: default_tpl.clone(),
		}),
		required_permissions: ep.required_permissions.clone(),
		logging: build_logging_config(logging_chain)?,
	})
}

fn build_policy_set(allow: &[String], deny: &[String]) -> anyhow::Result<PolicySet> {
	Ok(PolicySet {
		allow: allow
			.iter()
			.map(|e| Expression::new(e.clone()).map(Arc::new))
			.collect::<Result<_, _>>()
			.map_err(|e| anyhow::anyhow!(e.to_string()))?,
		deny: deny
			.iter()
			.map(|e| Expression::new(e.clone()).map(Arc::new))
			.collect::<Result<_, _>>()
			.map_err(|e| anyhow::anyhow!(e.to_string()))?,
	})
}

fn build_response_spec(raw: &ResponseRaw) -> anyhow::Result<ResponseSpec> {
	Ok(ResponseSpec {
		status: raw.status.as_ref().map(|s| Expression::new(s.clone()).map(Arc::new)).transpose().map_err(|e| anyhow::anyhow!(e.to_string()))?,
		headers: raw
			.headers
			.iter()
			.map(|(k, v)| Expression::new(v.clone()).map(|e| (k.clone(), Arc::new(e))))
			.collect::<Result<_, _>>()
			.map_err(|e| anyhow::anyhow!(e.to_string()))?,
		body: raw.body.as_ref().map(|s| Expression::new(s.clone()).map(Arc::new)).transpose().map_err(|e| anyhow::anyhow!(e.to_string()))?,
	})
}

fn build_producer(
	raw: &BackendCallRaw,
	kind: ProducerKind,
	backends: &HashMap<String, Arc<BackendConfig>>,
) -> anyhow::Result<Arc<BackendCall>> {
	let base = backends
		.get(&raw.backend)
		.ok_or_else(|| anyhow::anyhow!("proxy/request {} references unknown backend {}", raw.name, raw.backend))?;
	let effective = match &raw.backend_override {
		Some(over) => base.merge(over),
		None => (**base).clone(),
	};
	let transport = Transport::new(effective).map_err(|e| anyhow::anyhow!(e.to_string()))?;
	let method = http::Method::from_bytes(raw.method.as_bytes()).map_err(|e| anyhow::anyhow!("invalid method for {}: {e}", raw.name))?;
	let request_headers = raw
		.request_headers
		.iter()
		.map(|(k, v)| Expression::new(v.clone()).map(|e| (k.clone(), Arc::new(e))))
		.collect::<Result<_, _>>()
		.map_err(|e: crate::expr::Error| anyhow::anyhow!(e.to_string()))?;
	let openapi = raw
		.openapi_spec
		.as_ref()
		.map(|path| {
			let raw_doc = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading openapi spec {path}: {e}"))?;
			OpenApiValidator::from_yaml(&raw_doc)
				.map(Arc::new)
				.map_err(|e: GatewayError| anyhow::anyhow!(e.to_string()))
		})
		.transpose()?;

	Ok(Arc::new(BackendCall {
		name: Strng::from(raw.name.clone()),
		kind,
		transport,
		method,
		path_template: raw.path.clone(),
		request_headers,
		forward_request_body: raw.forward_request_body,
		openapi,
		expected_status: raw.expected_status.clone(),
		ignore_request_violations: raw.ignore_request_violations,
		ignore_response_violations: raw.ignore_response_violations,
	}))
}

#[cfg(test)]
mod tests {
	use super::*;

	const DOC: &str = r#"
servers:
  - hosts: ["*"]
    ports: [8080]
    endpoints:
      - pattern: "/health-proxy"
        proxies:
          - name: upstream
            backend: api
definitions:
  backends:
    api:
      origin: "http://127.0.0.1:9999"
settings:
  health_path: "/healthz"
"#;

	#[test]
	fn parses_minimal_document() {
		let de = serde_yaml::Deserializer::from_str(DOC);
		let raw: RawConfig = serde_path_to_error::deserialize(de).unwrap();
		assert_eq!(raw.servers.len(), 1);
		assert_eq!(raw.servers[0].ports, vec![8080]);
		assert_eq!(raw.definitions.backends.len(), 1);
	}

	#[test]
	fn build_produces_one_listener_per_port() {
		let de = serde_yaml::Deserializer::from_str(DOC);
		let raw: RawConfig = serde_path_to_error::deserialize(de).unwrap();
		let built = build(raw).unwrap();
		assert_eq!(built.listeners.len(), 1);
		assert_eq!(built.listeners[0].address.port(), 8080);
	}

	#[test]
	fn endpoint_without_producer_or_response_is_rejected() {
		let doc = r#"
servers:
  - hosts: ["*"]
    ports: [8080]
    endpoints:
      - pattern: "/nothing"
definitions: {}
"#;
		let de = serde_yaml::Deserializer::from_str(doc);
		let raw: RawConfig = serde_path_to_error::deserialize(de).unwrap();
		assert!(build(raw).is_err());
	}
}
