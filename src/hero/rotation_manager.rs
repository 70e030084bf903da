//! Hero rotation runtime component.
//!
//! Owns a `PoolBuilder` and the validated policy, consumes rotation requests
//! from the bus and publishes pools, failures, config issues and provider
//! rate-limit changes back onto it.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast::{
    error::{RecvError, TryRecvError},
    Receiver, Sender,
};

use crate::config::RawPolicy;
use crate::hero::pool_builder::{PoolBuilder, PoolRequest};
use crate::policy::{validate_policy, Policy};
use crate::protocol::{HeroMessage, RateLimitState, RotationNotification, RotationRequest};

pub struct RotationManager {
    bus_consumer: Receiver<HeroMessage>,
    bus_producer: Sender<HeroMessage>,
    builder: PoolBuilder,
    policy: Policy,
    rate_limit_updates: Option<Receiver<RateLimitState>>,
}

impl RotationManager {
    /// Creates a manager bound to one bus receiver/sender pair.
    pub fn new(
        bus_consumer: Receiver<HeroMessage>,
        bus_producer: Sender<HeroMessage>,
        builder: PoolBuilder,
        raw_policy: &RawPolicy,
    ) -> Self {
        let rate_limit_updates = builder.client().subscribe_rate_limit();
        let mut manager = Self {
            bus_consumer,
            bus_producer,
            builder,
            policy: Policy::default(),
            rate_limit_updates,
        };
        manager.apply_policy(raw_policy);
        manager
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn publish(&self, notification: RotationNotification) {
        let _ = self
            .bus_producer
            .send(HeroMessage::Notification(notification));
    }

    fn apply_policy(&mut self, raw_policy: &RawPolicy) {
        let (policy, issues) = validate_policy(raw_policy);
        for issue in &issues {
            warn!("Hero: config issue: {}", issue);
        }
        if !issues.is_empty() {
            self.publish(RotationNotification::ConfigIssues(issues));
        }
        self.policy = policy;
    }

    fn forward_rate_limit_changes(&mut self) {
        let Some(updates) = self.rate_limit_updates.as_mut() else {
            return;
        };
        let mut latest = None;
        loop {
            match updates.try_recv() {
                Ok(state) => latest = Some(state),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Closed) => {
                    self.rate_limit_updates = None;
                    break;
                }
            }
        }
        if let Some(state) = latest {
            self.publish(RotationNotification::RateLimitChanged(state));
        }
    }

    fn handle_request(&mut self, request: RotationRequest) -> bool {
        match request {
            RotationRequest::BuildPool {
                request_id,
                kind,
                items,
                force,
            } => {
                debug!("Hero[{}]: pool requested ({})", kind, request_id);
                let pool_request = PoolRequest {
                    force,
                    ..PoolRequest::new(kind, items)
                };
                match self.builder.build_pool(&self.policy, &pool_request) {
                    Ok(pool) => self.publish(RotationNotification::PoolReady {
                        request_id,
                        pool: Arc::new(pool),
                    }),
                    Err(error) => {
                        warn!("Hero[{}]: pool build failed: {}", kind, error);
                        self.publish(RotationNotification::PoolFailed {
                            request_id,
                            kind,
                            reason: error.to_string(),
                        });
                    }
                }
            }
            RotationRequest::PolicyChanged(raw_policy) => {
                info!("Hero: policy changed");
                self.apply_policy(&raw_policy);
            }
            RotationRequest::InvalidatePool(kind) => {
                if let Err(error) = self.builder.store().invalidate_pool(kind) {
                    warn!("Hero[{}]: could not invalidate pool: {}", kind, error);
                }
            }
            RotationRequest::ClearHeroMemory(kind) => {
                if let Err(error) = self.builder.store().clear_hero_memory(kind) {
                    warn!("Hero[{}]: could not clear hero memory: {}", kind, error);
                }
            }
            RotationRequest::ClearHeroFailures(kind) => {
                if let Err(error) = self.builder.store().clear_hero_failures(kind) {
                    warn!("Hero[{}]: could not clear failure registry: {}", kind, error);
                }
            }
            RotationRequest::ClearEnrichmentCache => {
                let cleared_entries = self.builder.client().clear_cache();
                info!("Hero: cleared {} enrichment cache entries", cleared_entries);
                self.publish(RotationNotification::EnrichmentCacheCleared { cleared_entries });
            }
            RotationRequest::Shutdown => return false,
        }
        true
    }

    /// Returns `false` once the manager should stop.
    fn handle_bus_message(&mut self, message: HeroMessage) -> bool {
        let keep_running = match message {
            HeroMessage::Request(request) => self.handle_request(request),
            HeroMessage::Notification(_) => true,
        };
        self.forward_rate_limit_changes();
        keep_running
    }

    /// Starts the blocking event loop.
    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => {
                    if !self.handle_bus_message(message) {
                        debug!("Hero: rotation manager shutting down");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Hero: rotation manager lagged, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
