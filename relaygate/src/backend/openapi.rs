//! Request/response validation against a backend's OpenAPI document.
//!
//! `$ref` resolution walks `#/components/schemas/...` against the parsed
//! `openapiv3::OpenAPI` document, and operations are looked up per path
//! template. Validation is intentionally shallow -- required properties,
//! primitive type compatibility, and required parameter presence -- a
//! pass/fail gate rather than a full JSON Schema engine.

use std::collections::HashMap;

use openapiv3::{OpenAPI, Operation, Parameter, ReferenceOr, Schema, SchemaKind, Type};
use serde_json::Value as JsonValue;

use crate::error::{ErrorKind, GatewayError};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
	#[error("no operation found for {0} {1}")]
	NoOperation(String, String),
	#[error("missing required property `{0}`")]
	MissingProperty(String),
	#[error("property `{0}` expected type {1}")]
	WrongType(String, &'static str),
	#[error("unresolved schema reference: {0}")]
	UnresolvedReference(String),
	#[error("missing required parameter `{0}`")]
	MissingParameter(String),
}

pub struct OpenApiValidator {
	doc: OpenAPI,
}

impl OpenApiValidator {
	pub fn new(doc: OpenAPI) -> Self {
		OpenApiValidator { doc }
	}

	pub fn from_yaml(raw: &str) -> Result<Self, GatewayError> {
		let doc: OpenAPI =
			serde_yaml::from_str(raw).map_err(|e| GatewayError::new(ErrorKind::Configuration).with_cause(e))?;
		Ok(OpenApiValidator::new(doc))
	}

	fn find_operation(&self, method: &http::Method, path: &str) -> Option<&Operation> {
		for (template, item) in self.doc.paths.iter() {
			if !path_matches_template(template, path) {
				continue;
			}
			let item = item.as_item()?;
			let op = match method.as_str() {
				"GET" => &item.get,
				"POST" => &item.post,
				"PUT" => &item.put,
				"DELETE" => &item.delete,
				"PATCH" => &item.patch,
				"HEAD" => &item.head,
				"OPTIONS" => &item.options,
				_ => &None,
			};
			if op.is_some() {
				return op.as_ref();
			}
		}
		None
	}

	pub fn validate_request_body(
		&self,
		method: &http::Method,
		path: &str,
		body: &JsonValue,
	) -> Result<(), ValidationError> {
		let op = self
			.find_operation(method, path)
			.ok_or_else(|| ValidationError::NoOperation(method.to_string(), path.to_string()))?;
		let Some(request_body) = &op.request_body else {
			return Ok(());
		};
		let request_body = match request_body {
			ReferenceOr::Item(rb) => rb,
			ReferenceOr::Reference { reference } => {
				return Err(ValidationError::UnresolvedReference(reference.clone()));
			},
		};
		let Some(media) = request_body.content.get("application/json") else {
			return Ok(());
		};
		let Some(schema_ref) = &media.schema else {
			return Ok(());
		};
		let schema = self.resolve(schema_ref)?;
		validate_value(&schema, body)
	}

	pub fn validate_response_body(
		&self,
		method: &http::Method,
		path: &str,
		status: u16,
		body: &JsonValue,
	) -> Result<(), ValidationError> {
		let op = self
			.find_operation(method, path)
			.ok_or_else(|| ValidationError::NoOperation(method.to_string(), path.to_string()))?;
		let key = status.to_string();
		let response = op
			.responses
			.responses
			.get(&openapiv3::StatusCode::Code(status))
			.or_else(|| op.responses.responses.iter().find(|(k, _)| k.to_string() == key).map(|(_, v)| v));
		let Some(response) = response else {
			return Ok(());
		};
		let response = match response {
			ReferenceOr::Item(r) => r,
			ReferenceOr::Reference { reference } => {
				return Err(ValidationError::UnresolvedReference(reference.clone()));
			},
		};
		let Some(media) = response.content.get("application/json") else {
			return Ok(());
		};
		let Some(schema_ref) = &media.schema else {
			return Ok(());
		};
		let schema = self.resolve(schema_ref)?;
		validate_value(&schema, body)
	}

	/// Checks that every required query/header parameter the document
	/// declares for this operation is present on the request. Path
	/// parameters are not checked here since the mux already had to match
	/// the segment for the route to be selected, and cookie parameters are
	/// left to access control.
	pub fn validate_parameters(
		&self,
		method: &http::Method,
		path: &str,
		query: &HashMap<String, String>,
		headers: &HashMap<String, String>,
	) -> Result<(), ValidationError> {
		let op = self
			.find_operation(method, path)
			.ok_or_else(|| ValidationError::NoOperation(method.to_string(), path.to_string()))?;
		for (name, param) in declared_parameters(op) {
			let (required, present) = match &param {
				Parameter::Query { parameter_data, .. } => (parameter_data.required, query.contains_key(&name)),
				Parameter::Header { parameter_data, .. } => {
					(parameter_data.required, headers.keys().any(|h| h.eq_ignore_ascii_case(&name)))
				},
				Parameter::Path { .. } | Parameter::Cookie { .. } => continue,
			};
			if required && !present {
				return Err(ValidationError::MissingParameter(name));
			}
		}
		Ok(())
	}

	fn resolve(&self, reference: &ReferenceOr<Schema>) -> Result<Schema, ValidationError> {
		match reference {
			ReferenceOr::Item(s) => Ok(s.clone()),
			ReferenceOr::Reference { reference } => {
				let name = reference
					.strip_prefix("#/components/schemas/")
					.ok_or_else(|| ValidationError::UnresolvedReference(reference.clone()))?;
				let components = self
					.doc
					.components
					.as_ref()
					.ok_or_else(|| ValidationError::UnresolvedReference(reference.clone()))?;
				let schema = components
					.schemas
					.get(name)
					.ok_or_else(|| ValidationError::UnresolvedReference(reference.clone()))?;
				self.resolve(schema)
			},
		}
	}
}

/// Matches a literal request path against an OpenAPI path template
/// (`/users/{id}`), ignoring the captured segment's value.
fn path_matches_template(template: &str, path: &str) -> bool {
	let t_segs: Vec<&str> = template.split('/').filter(|s| !s.is_empty()).collect();
	let p_segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
	if t_segs.len() != p_segs.len() {
		return false;
	}
	t_segs
		.iter()
		.zip(p_segs.iter())
		.all(|(t, p)| (t.starts_with('{') && t.ends_with('}')) || t == p)
}

fn validate_value(schema: &Schema, value: &JsonValue) -> Result<(), ValidationError> {
	match &schema.schema_kind {
		SchemaKind::Type(Type::Object(obj)) => {
			let JsonValue::Object(map) = value else {
				return Err(ValidationError::WrongType("$".to_string(), "object"));
			};
			for required in &obj.required {
				if !map.contains_key(required) {
					return Err(ValidationError::MissingProperty(required.clone()));
				}
			}
			for (name, prop_schema) in &obj.properties {
				if let Some(v) = map.get(name) {
					if let ReferenceOr::Item(s) = prop_schema.as_ref() {
						validate_value(s, v)?;
					}
				}
			}
			Ok(())
		},
		SchemaKind::Type(Type::Array(arr)) => {
			let JsonValue::Array(items) = value else {
				return Err(ValidationError::WrongType("$".to_string(), "array"));
			};
			if let Some(ReferenceOr::Item(item_schema)) = &arr.items {
				for item in items {
					validate_value(item_schema, item)?;
				}
			}
			Ok(())
		},
		SchemaKind::Type(Type::String(_)) => match value {
			JsonValue::String(_) => Ok(()),
			_ => Err(ValidationError::WrongType("$".to_string(), "string")),
		},
		SchemaKind::Type(Type::Number(_)) => match value {
			JsonValue::Number(_) => Ok(()),
			_ => Err(ValidationError::WrongType("$".to_string(), "number")),
		},
		SchemaKind::Type(Type::Integer(_)) => match value {
			JsonValue::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
			_ => Err(ValidationError::WrongType("$".to_string(), "integer")),
		},
		SchemaKind::Type(Type::Boolean(_)) => match value {
			JsonValue::Bool(_) => Ok(()),
			_ => Err(ValidationError::WrongType("$".to_string(), "boolean")),
		},
		_ => Ok(()),
	}
}

/// Extracts declared query/path/header parameter names for a route.
pub fn declared_parameters(op: &Operation) -> HashMap<String, Parameter> {
	op.parameters
		.iter()
		.filter_map(|p| match p {
			ReferenceOr::Item(param) => Some((parameter_name(param), param.clone())),
			ReferenceOr::Reference { .. } => None,
		})
		.collect()
}

fn parameter_name(param: &Parameter) -> String {
	match param {
		Parameter::Query { parameter_data, .. } => parameter_data.name.clone(),
		Parameter::Header { parameter_data, .. } => parameter_data.name.clone(),
		Parameter::Path { parameter_data, .. } => parameter_data.name.clone(),
		Parameter::Cookie { parameter_data, .. } => parameter_data.name.clone(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const DOC: &str = r#"
openapi: 3.0.0
info:
  title: test
  version: "1"
paths:
  /users/{id}:
    post:
      requestBody:
        content:
          application/json:
            schema:
              type: object
              required: [name]
              properties:
                name:
                  type: string
      responses:
        '200':
          content:
            application/json:
              schema:
                type: object
                required: [id]
                properties:
                  id:
                    type: integer
"#;

	#[test]
	fn validates_required_property_present() {
		let v = OpenApiValidator::from_yaml(DOC).unwrap();
		let body = serde_json::json!({"name": "alice"});
		assert!(v.validate_request_body(&http::Method::POST, "/users/42", &body).is_ok());
	}

	#[test]
	fn rejects_missing_required_property() {
		let v = OpenApiValidator::from_yaml(DOC).unwrap();
		let body = serde_json::json!({});
		let err = v.validate_request_body(&http::Method::POST, "/users/42", &body).unwrap_err();
		assert!(matches!(err, ValidationError::MissingProperty(p) if p == "name"));
	}

	#[test]
	fn validates_response_schema() {
		let v = OpenApiValidator::from_yaml(DOC).unwrap();
		let body = serde_json::json!({"id": 1});
		assert!(v.validate_response_body(&http::Method::POST, "/users/42", 200, &body).is_ok());
	}

	const DOC_WITH_PARAMS: &str = r#"
openapi: 3.0.0
info:
  title: test
  version: "1"
paths:
  /search:
    get:
      parameters:
        - name: q
          in: query
          required: true
          schema:
            type: string
      responses:
        '200':
          description: ok
"#;

	#[test]
	fn rejects_missing_required_query_parameter() {
		let v = OpenApiValidator::from_yaml(DOC_WITH_PARAMS).unwrap();
		let err = v
			.validate_parameters(&http::Method::GET, "/search", &HashMap::new(), &HashMap::new())
			.unwrap_err();
		assert!(matches!(err, ValidationError::MissingParameter(p) if p == "q"));
	}

	#[test]
	fn accepts_present_required_query_parameter() {
		let v = OpenApiValidator::from_yaml(DOC_WITH_PARAMS).unwrap();
		let mut query = HashMap::new();
		query.insert("q".to_string(), "rust".to_string());
		assert!(v.validate_parameters(&http::Method::GET, "/search", &query, &HashMap::new()).is_ok());
	}
}
