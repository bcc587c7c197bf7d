//! Sequence DAG construction and execution.
//!
//! Each sequence item may depend on other named proxies/requests;
//! dependencies run to completion before the item that needs them, while
//! independent items (including independent sequences) run concurrently.
//! An explicit dependency graph with a `tokio::sync::Notify` per node: a
//! node awaits its dependencies' notifications, runs its producer, stores
//! the result, and fires its own notification so dependents can proceed.
//! `leftover_names` partitions off any producer not referenced by any
//! sequence, which runs immediately in the unconstrained parallel group.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use gateway_core::Strng;
use tokio::sync::Notify;

use super::{EndpointError, Producer, ProducerOutcome};
use crate::expr::EvalContext;

pub struct SequenceNode {
	pub name: Strng,
	pub depends_on: Vec<Strng>,
    pub producer: Arc<dyn Producer>,
}

pub struct Sequence {
	pub nodes: Vec<SequenceNode>,
}

impl Sequence {
	/// Every name that appears as a dependency anywhere in this sequence --
	/// used by [`leftover_names`] to exclude sequence members from the
	/// unconstrained parallel group.
	pub fn referenced_names(&self) -> HashSet<Strng> {
		self.nodes.iter().flat_map(|n| n.depends_on.iter().cloned()).collect()
	}

	pub fn member_names(&self) -> HashSet<Strng> {
		self.nodes.iter().map(|n| n.name.clone()).collect()
	}

	/// Runs the full DAG to completion, returning every node's outcome
	/// keyed by name. Independent branches run concurrently; a node with
	/// unmet dependencies waits on their `Notify` before starting.
	pub async fn run(&self, ctx: &EvalContext) -> HashMap<Strng, Result<ProducerOutcome, EndpointError>> {
		let notifies: HashMap<Strng, Arc<Notify>> =
			self.nodes.iter().map(|n| (n.name.clone(), Arc::new(Notify::new()))).collect();
		let results: Arc<std::sync::Mutex<HashMap<Strng, Result<ProducerOutcome, EndpointError>>>> =
			Arc::new(std::sync::Mutex::new(HashMap::new()));

		let mut handles = Vec::new();
		for node in &self.nodes {
			let my_notify = notifies[&node.name].clone();
			let dep_notifies: Vec<Arc<Notify>> = node.depends_on.iter().filter_map(|d| notifies.get(d).cloned()).collect();
			let producer = node.producer.clone();
			let results = results.clone();
			let ctx = ctx.clone();
			let name = node.name.clone();

			handles.push(tokio::spawn(async move {
				for dep in &dep_notifies {
					dep.notified().await;
				}
				let outcome = producer.produce(&ctx).await;
				results.lock().unwrap().insert(name, outcome);
				my_notify.notify_waiters();
			}));
		}

		for h in handles {
			let _ = h.await;
		}

		Arc::try_unwrap(results).map(|m| m.into_inner().unwrap()).unwrap_or_default()
	}
}

/// Partitions `all` into members of any configured sequence vs. leftovers
/// that should run in the unconstrained parallel group.
pub fn leftover_names(all: &[Strng], sequences: &[Sequence]) -> Vec<Strng> {
	let referenced: HashSet<Strng> = sequences.iter().flat_map(|s| s.member_names()).collect();
	all.iter().filter(|n| !referenced.contains(*n)).cloned().collect()
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;

	use super::*;
	use crate::expr::BackendCallBinding;

	struct Recorder {
		name: Strng,
		log: Arc<std::sync::Mutex<Vec<Strng>>>,
	}

	#[async_trait]
	impl Producer for Recorder {
		fn name(&self) -> &Strng {
			&self.name
		}

		async fn produce(&self, _ctx: &EvalContext) -> Result<ProducerOutcome, EndpointError> {
			self.log.lock().unwrap().push(self.name.clone());
			Ok(ProducerOutcome {
				name: self.name.clone(),
				response: BackendCallBinding::default(),
			})
		}
	}

	#[tokio::test]
	async fn dependency_runs_before_dependent() {
		let log = Arc::new(std::sync::Mutex::new(Vec::new()));
		let seq = Sequence {
			nodes: vec![
				SequenceNode {
					name: Strng::from("first"),
					depends_on: vec![],
					producer: Arc::new(Recorder {
						name: Strng::from("first"),
						log: log.clone(),
					}),
				},
				SequenceNode {
					name: Strng::from("second"),
					depends_on: vec![Strng::from("first")],
					producer: Arc::new(Recorder {
						name: Strng::from("second"),
						log: log.clone(),
					}),
				},
			],
		};
		let outcomes = seq.run(&EvalContext::default()).await;
		assert_eq!(outcomes.len(), 2);
		let order = log.lock().unwrap().clone();
		assert_eq!(order, vec![Strng::from("first"), Strng::from("second")]);
	}

	#[test]
	fn leftovers_excludes_sequence_members() {
		let seq = Sequence {
			nodes: vec![SequenceNode {
				name: Strng::from("a"),
				depends_on: vec![],
				producer: Arc::new(Recorder {
					name: Strng::from("a"),
					log: Arc::new(std::sync::Mutex::new(Vec::new())),
				}),
			}],
		};
		let all = vec![Strng::from("a"), Strng::from("b")];
		let left = leftover_names(&all, std::slice::from_ref(&seq));
		assert_eq!(left, vec![Strng::from("b")]);
	}
}
