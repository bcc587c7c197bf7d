use super::*;

#[test]
fn attributes_collects_top_level_bindings() {
	let expr = Expression::new("request.method == \"GET\" && backend_responses.default.status == 200").unwrap();
	assert!(expr.attributes().contains("request"));
	assert!(expr.attributes().contains("backend_responses"));
	assert!(!expr.attributes().contains("env"));
}

#[test]
fn buffer_options_accumulate_from_json_body_reference() {
	let expr = Arc::new(Expression::new("request.json_body.id == 1").unwrap());
	let opts = accumulate_buffer_options(vec![expr]);
	assert!(opts.contains(crate::context::BufferOptions::REQUEST_JSON_BODY));
	assert!(!opts.contains(crate::context::BufferOptions::REQUEST_BODY));
}

#[test]
fn eval_context_only_binds_referenced_attributes() {
	let expr = Expression::new("env.STAGE == \"prod\"").unwrap();
	let mut env = HashMap::new();
	env.insert("STAGE".to_string(), "prod".to_string());
	let ctx = EvalContext {
		env: Arc::new(env),
		..Default::default()
	};
	assert!(ctx.eval_bool(&expr));
}

#[test]
fn named_bindings_default_alias_mirrors_single_proxy() {
	let mut bindings = NamedBindings::default();
	bindings.insert("api", BackendCallBinding {
		status: Some(200),
		..Default::default()
	});
	bindings.set_default_alias("api");
	let expr = Expression::new("backend_responses.default.status == 200").unwrap();
	let ctx = EvalContext {
		backend_responses: Arc::new(bindings),
		..Default::default()
	};
	assert!(ctx.eval_bool(&expr));
}
