use std::sync::Arc;

use super::*;

struct StubProducer {
	name: Strng,
	status: u16,
	body: &'static str,
}

#[async_trait]
impl Producer for StubProducer {
	fn name(&self) -> &Strng {
		&self.name
	}

	async fn produce(&self, _ctx: &EvalContext) -> Result<ProducerOutcome, EndpointError> {
		Ok(ProducerOutcome {
			name: self.name.clone(),
			response: BackendCallBinding {
				status: Some(self.status),
				headers: Default::default(),
				body: Some(self.body.to_string()),
				json_body: None,
			},
		})
	}
}

struct FailingProducer {
	name: Strng,
}

#[async_trait]
impl Producer for FailingProducer {
	fn name(&self) -> &Strng {
		&self.name
	}

	async fn produce(&self, _ctx: &EvalContext) -> Result<ProducerOutcome, EndpointError> {
		Err(GatewayError::new(ErrorKind::BackendUnreachable))
	}
}

#[tokio::test]
async fn single_proxy_without_response_block_streams_through() {
	let config = EndpointConfig {
		name: Strng::from("ep"),
		proxies: vec![Arc::new(StubProducer {
			name: Strng::from("api"),
			status: 201,
			body: "hello",
		})],
		requests: vec![],
		sequences: vec![],
		response: None,
		buffer_options: BufferOptions::empty(),
	};
	let resp = Engine::execute(&config, EvalContext::default()).await.unwrap();
	assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn no_producers_and_no_response_block_yields_204() {
	let config = EndpointConfig {
		name: Strng::from("ep"),
		proxies: vec![],
		requests: vec![],
		sequences: vec![],
		response: None,
		buffer_options: BufferOptions::empty(),
	};
	let resp = Engine::execute(&config, EvalContext::default()).await.unwrap();
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn response_block_takes_precedence_over_passthrough() {
	let config = EndpointConfig {
		name: Strng::from("ep"),
		proxies: vec![Arc::new(StubProducer {
			name: Strng::from("api"),
			status: 201,
			body: "hello",
		})],
		requests: vec![],
		sequences: vec![],
		response: Some(ResponseSpec {
			status: Some(Arc::new(Expression::new("\"200\"").unwrap())),
			headers: HashMap::new(),
			body: Some(Arc::new(Expression::new("\"fixed\"").unwrap())),
		}),
		buffer_options: BufferOptions::empty(),
	};
	let resp = Engine::execute(&config, EvalContext::default()).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn producer_failure_short_circuits_with_backend_unreachable() {
	let config = EndpointConfig {
		name: Strng::from("ep"),
		proxies: vec![Arc::new(FailingProducer { name: Strng::from("api") })],
		requests: vec![],
		sequences: vec![],
		response: None,
		buffer_options: BufferOptions::empty(),
	};
	let err = Engine::execute(&config, EvalContext::default()).await.unwrap_err();
	assert_eq!(err.kind.label(), ErrorKind::BackendUnreachable.label());
}
