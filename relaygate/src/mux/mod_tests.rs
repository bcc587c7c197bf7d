use super::*;

fn build() -> Mux<&'static str> {
	let mut mux = Mux::new(vec![Strng::from("/api")]);
	mux.add_endpoint_route(Method::GET, "/api/users/{id}", "get_user").unwrap();
	mux.add_endpoint_route(Method::POST, "/api/users", "create_user").unwrap();
	mux.add_file_route("/static/**", "files").unwrap();
	mux.add_spa_route("/**", "spa").unwrap();
	mux
}

#[test]
fn matched_endpoint_route_carries_path_params() {
	let mux = build();
	match mux.find(&Method::GET, "/api/users/42") {
		Dispatch::Matched(m) => {
			assert_eq!(m.handler, "get_user");
			assert_eq!(m.path_params.get("id").unwrap(), "42");
		},
		_ => panic!("expected match"),
	}
}

#[test]
fn wrong_method_on_existing_path_is_405() {
	let mux = build();
	assert!(matches!(mux.find(&Method::DELETE, "/api/users/42"), Dispatch::MethodNotAllowed));
}

#[test]
fn missing_route_inside_api_base_path_is_api_not_found() {
	let mux = build();
	match mux.find(&Method::GET, "/api/unknown") {
		Dispatch::ApiNotFound { api_base_path } => assert_eq!(api_base_path.as_str(), "/api"),
		_ => panic!("expected api not found"),
	}
}

#[test]
fn falls_through_to_spa_outside_api_scope() {
	let mux = build();
	match mux.find(&Method::GET, "/anything/else") {
		Dispatch::Matched(m) => assert_eq!(m.handler, "spa"),
		_ => panic!("expected spa fallback"),
	}
}
