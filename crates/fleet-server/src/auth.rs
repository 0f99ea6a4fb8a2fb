//! Per-session authorization of outbound events.
//!
//! Every ADDED/MODIFIED event is checked against the session's token before it
//! is written. The questions asked are, in order, stopping at the first yes:
//!
//! 1. may the user `list` the kind cluster-wide,
//! 2. may the user `list` the kind in the object's namespace,
//! 3. may the user `get` the object.
//!
//! Answers are memoized per token and target for a short TTL. The memoized
//! value is the in-flight future itself, so concurrent sessions of the same
//! user asking the same question share one review. A failed review counts as
//! "no".

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleet_core::{
    resource_plural, ApiVersion, Event, EventData, FleetError, FleetResult, Resource, SharedClock,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace, warn};

use crate::metrics::FleetMetrics;

/// Access verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Read one object.
    Get,
    /// List a collection.
    List,
}

impl Verb {
    /// Verb as sent to the API server.
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
        }
    }
}

/// What an access review asks about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessTarget {
    /// Object kind.
    pub kind: String,
    /// API group and version of the kind.
    pub api_version: ApiVersion,
    /// Namespace, if the question is namespaced.
    pub namespace: Option<String>,
    /// Object name, if the question is about one object.
    pub name: Option<String>,
}

impl AccessTarget {
    /// The whole kind, cluster-wide.
    pub fn kind_wide(resource: &Resource) -> Self {
        Self {
            kind: resource.kind.clone(),
            api_version: ApiVersion::new(resource.api_version.clone()),
            namespace: None,
            name: None,
        }
    }

    /// The kind within one namespace.
    pub fn in_namespace(resource: &Resource, namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Self::kind_wide(resource)
        }
    }

    /// One object.
    pub fn object(resource: &Resource) -> Self {
        Self {
            namespace: resource.namespace().map(str::to_string),
            name: resource.name().map(str::to_string),
            ..Self::kind_wide(resource)
        }
    }
}

/// Answers one access question for a bearer token.
#[async_trait]
pub trait AccessReviewer: Send + Sync + 'static {
    /// Whether `token` may perform `verb` on `target`.
    async fn review(&self, token: &str, target: &AccessTarget, verb: Verb) -> FleetResult<bool>;
}

/// A shared, possibly still running, access decision.
pub type Decision = Shared<BoxFuture<'static, bool>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AccessKey {
    token: Arc<str>,
    kind: String,
    namespace: Option<String>,
    name: Option<String>,
}

struct CachedDecision {
    created: Instant,
    decision: Decision,
}

/// Memoizes access decisions per token and target.
pub struct AccessCache {
    reviewer: Arc<dyn AccessReviewer>,
    entries: DashMap<AccessKey, CachedDecision>,
    ttl: Duration,
    clock: SharedClock,
    metrics: FleetMetrics,
}

impl std::fmt::Debug for AccessCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl AccessCache {
    /// Create an empty cache in front of `reviewer`.
    pub fn new(
        reviewer: Arc<dyn AccessReviewer>,
        ttl: Duration,
        clock: SharedClock,
        metrics: FleetMetrics,
    ) -> Self {
        Self {
            reviewer,
            entries: DashMap::new(),
            ttl,
            clock,
            metrics,
        }
    }

    /// Decision for `verb` on `target`, reusing a fresh one when present.
    pub fn check(&self, token: &Arc<str>, target: AccessTarget, verb: Verb) -> Decision {
        let key = AccessKey {
            token: Arc::clone(token),
            kind: target.kind.clone(),
            namespace: target.namespace.clone(),
            name: target.name.clone(),
        };
        let now = self.clock.now();

        match self.entries.entry(key) {
            Entry::Occupied(entry) if now.duration_since(entry.get().created) < self.ttl => {
                self.metrics.access_cached();
                entry.get().decision.clone()
            }
            Entry::Occupied(mut entry) => {
                let decision = self.review(token, target, verb);
                entry.insert(CachedDecision {
                    created: now,
                    decision: decision.clone(),
                });
                decision
            }
            Entry::Vacant(entry) => {
                let decision = self.review(token, target, verb);
                entry.insert(CachedDecision {
                    created: now,
                    decision: decision.clone(),
                });
                decision
            }
        }
    }

    fn review(&self, token: &Arc<str>, target: AccessTarget, verb: Verb) -> Decision {
        let reviewer = Arc::clone(&self.reviewer);
        let token = Arc::clone(token);
        let metrics = self.metrics.clone();
        async move {
            let started = Instant::now();
            match reviewer.review(&token, &target, verb).await {
                Ok(allowed) => {
                    metrics.access_reviewed(verb.as_str(), started.elapsed());
                    debug!(
                        verb = verb.as_str(),
                        kind = %target.kind,
                        namespace = target.namespace.as_deref().unwrap_or_default(),
                        name = target.name.as_deref().unwrap_or_default(),
                        allowed,
                        "access"
                    );
                    allowed
                }
                Err(e) => {
                    metrics.access_failed();
                    warn!(
                        verb = verb.as_str(),
                        kind = %target.kind,
                        error = %e,
                        "access review failed"
                    );
                    false
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drop expired decisions. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, cached| now.duration_since(cached.created) < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            trace!(removed, "expired access decisions");
        }
        removed
    }

    /// Number of memoized decisions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decides whether a session may see an event.
#[derive(Debug)]
pub struct Authorizer {
    cache: AccessCache,
    public_kinds: HashSet<String>,
}

impl Authorizer {
    /// Create an authorizer. Events of `public_kinds` skip review.
    pub fn new(cache: AccessCache, public_kinds: impl IntoIterator<Item = String>) -> Self {
        Self {
            cache,
            public_kinds: public_kinds.into_iter().collect(),
        }
    }

    /// The decision cache.
    pub fn cache(&self) -> &AccessCache {
        &self.cache
    }

    /// The decision for events that need no review, `None` otherwise.
    ///
    /// DELETED is always delivered: by the time it arrives the namespace may
    /// be gone and every review would fail.
    pub fn decide_now(&self, event: &Event) -> Option<bool> {
        match &event.data {
            EventData::Start
            | EventData::Loaded
            | EventData::Eop
            | EventData::Settings { .. }
            | EventData::Deleted { .. } => Some(true),
            EventData::Added { object } | EventData::Modified { object } => {
                self.public_kinds.contains(&object.kind).then_some(true)
            }
        }
    }

    /// Whether `token` may see `event`.
    pub async fn allowed(&self, token: &Arc<str>, event: &Event) -> bool {
        if let Some(decision) = self.decide_now(event) {
            return decision;
        }
        let Some(resource) = event.data.resource() else {
            return false;
        };

        if self
            .cache
            .check(token, AccessTarget::kind_wide(resource), Verb::List)
            .await
        {
            return true;
        }
        if let Some(namespace) = resource.namespace() {
            if self
                .cache
                .check(token, AccessTarget::in_namespace(resource, namespace), Verb::List)
                .await
            {
                return true;
            }
        }
        self.cache
            .check(token, AccessTarget::object(resource), Verb::Get)
            .await
    }
}

const REVIEW_PATH: &str = "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews";

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    #[serde(default)]
    status: ReviewStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ReviewStatus {
    #[serde(default)]
    allowed: bool,
}

/// Request body of a SelfSubjectAccessReview.
pub fn review_body(target: &AccessTarget, verb: Verb) -> serde_json::Value {
    let namespace = target.namespace.clone().or_else(|| {
        (target.kind == "Namespace")
            .then(|| target.name.clone())
            .flatten()
    });
    json!({
        "apiVersion": "authorization.k8s.io/v1",
        "kind": "SelfSubjectAccessReview",
        "metadata": {},
        "spec": {
            "resourceAttributes": {
                "group": target.api_version.group(),
                "name": target.name,
                "namespace": namespace,
                "resource": resource_plural(&target.kind),
                "verb": verb.as_str(),
            }
        }
    })
}

/// [`AccessReviewer`] that asks the API server with a SelfSubjectAccessReview.
pub struct SelfSubjectAccessReviewer {
    client: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for SelfSubjectAccessReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSubjectAccessReviewer")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl SelfSubjectAccessReviewer {
    /// Create a reviewer against `base_url`.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AccessReviewer for SelfSubjectAccessReviewer {
    async fn review(&self, token: &str, target: &AccessTarget, verb: Verb) -> FleetResult<bool> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, REVIEW_PATH))
            .bearer_auth(token)
            .json(&review_body(target, verb))
            .send()
            .await
            .map_err(|e| FleetError::authorization("access review request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::UpstreamStatus {
                status: status.as_u16(),
                target: REVIEW_PATH.to_string(),
            });
        }

        let body: ReviewResponse = response
            .json()
            .await
            .map_err(|e| FleetError::authorization("access review response unreadable", e))?;
        Ok(body.status.allowed)
    }
}
