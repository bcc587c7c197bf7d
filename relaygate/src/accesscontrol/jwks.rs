//! Single-owner JWKS synchronizer with TTL/backoff/max-stale and rendezvous
//! reads.
//!
//! A single background task owns the fetch loop and holds the current
//! `JwkSet` plus its validity state; readers never touch the network
//! themselves, they send a request on a channel and block for the reply.
//! On fetch failure the data stays servable until `max_stale` elapses from
//! the first failure (`Invalidated`), and the retry interval backs off by
//! doubling up to a one-minute cap.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use reqwest::Client;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum JwksError {
	#[error("fetch failed: {0}")]
	Fetch(#[from] reqwest::Error),
	#[error("invalid JWKS JSON: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("JWKS data unavailable and past max-stale window")]
	Stale,
	#[error("JWKS synchronizer task is no longer running")]
	SynchronizerGone,
}

enum Freshness {
	/// Good until this instant; after that, still servable until `max_stale`.
	Valid { expires_at: Instant },
	/// Last fetch failed; still servable until `invalidated_at`.
	Invalidated { invalidated_at: Instant },
	NeverFetched,
}

struct State {
	data: Option<Arc<JwkSet>>,
	freshness: Freshness,
	backoff: Duration,
}

type DataRequest = oneshot::Sender<Result<Arc<JwkSet>, JwksError>>;

/// Handle held by callers (e.g. [`super::jwt::JwtValidator`]). Cloning is cheap; all
/// clones talk to the same background synchronizer task.
#[derive(Clone)]
pub struct JwksHandle {
	tx: mpsc::Sender<DataRequest>,
}

impl JwksHandle {
	/// Rendezvous read: blocks until the synchronizer task replies with its
	/// current best-effort data, or an error if none is servable.
	pub async fn data(&self) -> Result<Arc<JwkSet>, JwksError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.tx.send(reply_tx).await.map_err(|_| JwksError::SynchronizerGone)?;
		reply_rx.await.map_err(|_| JwksError::SynchronizerGone)?
	}
}

pub struct JwksSynchronizer {
	url: String,
	client: Client,
	ttl: Duration,
	max_stale: Duration,
}

impl JwksSynchronizer {
	pub fn new(url: impl Into<String>, client: Client, ttl: Duration, max_stale: Duration) -> Self {
		JwksSynchronizer {
			url: url.into(),
			client,
			ttl,
			max_stale,
		}
	}

	/// Spawns the single owner task and returns a cloneable handle. The task
	/// runs until the handle and all its clones are dropped.
	pub fn spawn(self) -> JwksHandle {
		let (tx, rx) = mpsc::channel(8);
		tokio::spawn(self.run(rx));
		JwksHandle { tx }
	}

	async fn run(self, mut requests: mpsc::Receiver<DataRequest>) {
		let mut state = State {
			data: None,
			freshness: Freshness::NeverFetched,
			backoff: MIN_BACKOFF,
		};

		// Fetch immediately on startup so the first request doesn't stall.
		self.refresh(&mut state).await;

		loop {
			let next_fetch = match &state.freshness {
				Freshness::Valid { expires_at } => *expires_at,
				Freshness::Invalidated { .. } | Freshness::NeverFetched => Instant::now() + state.backoff,
			};

			tokio::select! {
				_ = sleep_until(next_fetch) => {
					self.refresh(&mut state).await;
				}
				maybe_req = requests.recv() => {
					match maybe_req {
						Some(reply) => {
							let _ = reply.send(self.current(&state));
						}
						None => return,
					}
				}
			}
		}
	}

	fn current(&self, state: &State) -> Result<Arc<JwkSet>, JwksError> {
		match (&state.data, &state.freshness) {
			(Some(data), Freshness::Valid { .. }) => Ok(data.clone()),
			(Some(data), Freshness::Invalidated { invalidated_at }) => {
				if Instant::now() < *invalidated_at {
					Ok(data.clone())
				} else {
					Err(JwksError::Stale)
				}
			},
			_ => Err(JwksError::Stale),
		}
	}

	async fn refresh(&self, state: &mut State) {
		match self.fetch().await {
			Ok(jwks) => {
				state.data = Some(Arc::new(jwks));
				state.freshness = Freshness::Valid {
					expires_at: Instant::now() + self.ttl,
				};
				state.backoff = MIN_BACKOFF;
			},
			Err(_err) => {
				// Keep the stale deadline fixed at the first failure; a retry
				// failing again must not push it further out, or data could
				// stay servable indefinitely under a sustained outage.
				let invalidated_at = match state.freshness {
					Freshness::Invalidated { invalidated_at } => invalidated_at,
					Freshness::Valid { .. } | Freshness::NeverFetched => Instant::now() + self.max_stale,
				};
				state.freshness = Freshness::Invalidated { invalidated_at };
				state.backoff = (state.backoff * 2).min(MAX_BACKOFF);
			},
		}
	}

	async fn fetch(&self) -> Result<JwkSet, JwksError> {
		let resp = self.client.get(&self.url).send().await?;
		let jwks: JwkSet = resp.json().await?;
		Ok(jwks)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_up_to_cap() {
		let mut backoff = MIN_BACKOFF;
		for _ in 0..10 {
			backoff = (backoff * 2).min(MAX_BACKOFF);
		}
		assert_eq!(backoff, MAX_BACKOFF);
	}
}
