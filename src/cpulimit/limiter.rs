//! Resource limiters
//!
//! A limiter turns a workspace's history into a bandwidth decision. The set of
//! strategies is small and fixed, so it is a closed enum rather than a trait
//! object:
//!
//! | Variant          | Decision                                                  |
//! |------------------|-----------------------------------------------------------|
//! | `Fixed`          | always the same bandwidth                                 |
//! | `Annotation`     | quantity stored under an annotation key                   |
//! | `Bucket`         | progressive ladder over the workspace's total usage       |
//! | `ClampingBucket` | `Bucket`, but sticks to the floor once it reached it      |
//! | `Composite`      | first inner limiter that succeeds                         |
//! | `PerWorkspace`   | one clone of a template limiter per workspace ID          |
//!
//! # Buckets
//!
//! ```text
//! usage ─────────────────────────────────────────────────────────────►
//!       │ budget 50 @ 100 │ budget 30 @ 50 │ budget 20 @ 20 │ 5 forever
//!       └─────────────────┴────────────────┴────────────────┴──────────
//! ```
//!
//! The last bucket is the floor: its budget is ignored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bandwidth::{Bandwidth, CpuTime};
use super::history::WorkspaceHistory;
use crate::quantity::{Quantity, QuantityError};

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("workspace has no annotation {key}")]
    MissingAnnotation { key: String },

    #[error("cannot parse annotation {key}={value:?}: {source}")]
    InvalidAnnotation {
        key: String,
        value: String,
        source: QuantityError,
    },

    #[error("all limiters failed: {}", join_errors(.0))]
    AllFailed(Vec<LimitError>),
}

fn join_errors(errors: &[LimitError]) -> String {
    if errors.is_empty() {
        return "no limiter configured".to_string();
    }
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Amount of CPU time consumable at `limit` before falling through to the
/// next bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub budget: CpuTime,
    pub limit: Bandwidth,
}

impl Bucket {
    pub fn new(budget: CpuTime, limit: Bandwidth) -> Self {
        Self { budget, limit }
    }
}

/// Walks `buckets` and returns the index of the bucket `usage` falls into.
fn find_bucket(buckets: &[Bucket], usage: CpuTime) -> Option<usize> {
    let mut remaining = usage;
    for (i, bucket) in buckets.iter().enumerate() {
        if i + 1 == buckets.len() {
            return Some(i);
        }
        remaining -= bucket.budget;
        if !remaining.is_positive() {
            return Some(i);
        }
    }
    None
}

/// Bucket ladder with hysteresis on the floor bucket
///
/// State is held per instance. Wrap it in [`ResourceLimiter::PerWorkspace`]
/// when every workspace needs its own lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClampingBucketLimiter {
    pub buckets: Vec<Bucket>,
    locked: bool,
}

impl ClampingBucketLimiter {
    pub fn new(buckets: Vec<Bucket>) -> Self {
        Self {
            buckets,
            locked: false,
        }
    }

    /// Whether the limiter is pinned to the floor bucket
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn limit(&mut self, usage: CpuTime) -> Bandwidth {
        let Some(floor) = self.buckets.last().copied() else {
            return Bandwidth(0);
        };

        if self.locked && usage < floor.budget {
            self.locked = false;
        }
        if self.locked {
            return floor.limit;
        }

        match find_bucket(&self.buckets, usage) {
            Some(i) => {
                if i + 1 == self.buckets.len() {
                    self.locked = true;
                }
                self.buckets[i].limit
            }
            None => Bandwidth(0),
        }
    }
}

/// Keeps one clone of `template` per workspace ID
#[derive(Debug, Clone, PartialEq)]
pub struct PerWorkspaceLimiter {
    template: Box<ResourceLimiter>,
    instances: HashMap<String, ResourceLimiter>,
}

impl PerWorkspaceLimiter {
    pub fn new(template: ResourceLimiter) -> Self {
        Self {
            template: Box::new(template),
            instances: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceLimiter {
    Fixed(Bandwidth),
    /// Reads a CPU quantity from the named annotation
    Annotation(String),
    Bucket(Vec<Bucket>),
    ClampingBucket(ClampingBucketLimiter),
    Composite(Vec<ResourceLimiter>),
    PerWorkspace(PerWorkspaceLimiter),
}

impl ResourceLimiter {
    pub fn fixed(limit: Bandwidth) -> Self {
        ResourceLimiter::Fixed(limit)
    }

    pub fn annotation(key: impl Into<String>) -> Self {
        ResourceLimiter::Annotation(key.into())
    }

    pub fn bucket(buckets: Vec<Bucket>) -> Self {
        ResourceLimiter::Bucket(buckets)
    }

    pub fn clamping_bucket(buckets: Vec<Bucket>) -> Self {
        ResourceLimiter::ClampingBucket(ClampingBucketLimiter::new(buckets))
    }

    pub fn composite(limiters: Vec<ResourceLimiter>) -> Self {
        ResourceLimiter::Composite(limiters)
    }

    pub fn per_workspace(template: ResourceLimiter) -> Self {
        ResourceLimiter::PerWorkspace(PerWorkspaceLimiter::new(template))
    }

    /// Bandwidth this limiter grants the workspace.
    pub fn limit(&mut self, history: &WorkspaceHistory) -> Result<Bandwidth, LimitError> {
        match self {
            ResourceLimiter::Fixed(limit) => Ok(*limit),

            ResourceLimiter::Annotation(key) => {
                let value = history
                    .annotations()
                    .and_then(|a| a.get(key.as_str()))
                    .ok_or_else(|| LimitError::MissingAnnotation { key: key.clone() })?;
                let quantity: Quantity =
                    value
                        .parse()
                        .map_err(|source| LimitError::InvalidAnnotation {
                            key: key.clone(),
                            value: value.clone(),
                            source,
                        })?;
                Ok(Bandwidth::from_quantity(&quantity))
            }

            ResourceLimiter::Bucket(buckets) => Ok(find_bucket(buckets, history.usage())
                .map(|i| buckets[i].limit)
                .unwrap_or_default()),

            ResourceLimiter::ClampingBucket(clamping) => Ok(clamping.limit(history.usage())),

            ResourceLimiter::Composite(limiters) => {
                let mut errors = Vec::new();
                for limiter in limiters.iter_mut() {
                    match limiter.limit(history) {
                        Ok(limit) => return Ok(limit),
                        Err(e) => errors.push(e),
                    }
                }
                Err(LimitError::AllFailed(errors))
            }

            ResourceLimiter::PerWorkspace(per_ws) => {
                let template = &per_ws.template;
                per_ws
                    .instances
                    .entry(history.id.clone())
                    .or_insert_with(|| template.as_ref().clone())
                    .limit(history)
            }
        }
    }

    /// Drops any state kept for a workspace that is no longer tracked.
    pub fn forget(&mut self, id: &str) {
        match self {
            ResourceLimiter::Composite(limiters) => {
                limiters.iter_mut().for_each(|l| l.forget(id));
            }
            ResourceLimiter::PerWorkspace(per_ws) => {
                per_ws.instances.remove(id);
            }
            _ => {}
        }
    }
}
