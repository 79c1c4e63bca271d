use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{validate_address, CheckDefinition, ConfigError};
use crate::models::{CheckIdentity, StateEvent};
use crate::notify::NotificationHub;
use crate::probes::{ProbeError, SmtpProbe, TlsProbe};

/// Outcome of feeding one observation into a [`StateTracker`].
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// First observation ever; establishes the baseline.
    Baseline(StateEvent),
    /// Health flipped since the previous observation.
    Transition(StateEvent),
    Unchanged,
}

/// Edge detector for a single check.
#[derive(Debug, Default, Clone)]
pub struct StateTracker {
    last_evaluation: Option<DateTime<Utc>>,
    last_transition: Option<DateTime<Utc>>,
    last_ok: bool,
    initialized: bool,
}

impl StateTracker {
    pub fn observe(
        &mut self,
        identity: &CheckIdentity,
        now: DateTime<Utc>,
        ok: bool,
        reason: String,
    ) -> Observation {
        self.last_evaluation = Some(now);
        let event = |reason| StateEvent {
            identity: identity.clone(),
            timestamp: now,
            ok,
            reason,
        };

        if !self.initialized {
            self.initialized = true;
            self.last_ok = ok;
            return Observation::Baseline(event(reason));
        }
        if ok == self.last_ok {
            return Observation::Unchanged;
        }

        self.last_ok = ok;
        self.last_transition = Some(now);
        Observation::Transition(event(reason))
    }

    pub fn last_ok(&self) -> Option<bool> {
        self.initialized.then_some(self.last_ok)
    }

    pub fn last_evaluation(&self) -> Option<DateTime<Utc>> {
        self.last_evaluation
    }

    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        self.last_transition
    }
}

#[derive(Debug)]
pub enum CheckKind {
    Group(Vec<CheckNode>),
    Tls(TlsProbe),
    Smtp(SmtpProbe),
}

/// A named node of the check tree.
#[derive(Debug)]
pub struct CheckNode {
    identity: CheckIdentity,
    tracker: StateTracker,
    kind: CheckKind,
}

impl CheckNode {
    pub fn new(identity: CheckIdentity, kind: CheckKind) -> Self {
        Self {
            identity,
            tracker: StateTracker::default(),
            kind,
        }
    }

    /// Builds a node and its subtree from a definition, nesting ids under
    /// `parent_id`.
    pub fn build(def: &CheckDefinition, parent_id: Option<&str>) -> Result<Self, ConfigError> {
        if def.name().trim().is_empty() {
            return Err(ConfigError::EmptyName {
                parent: parent_id.unwrap_or_default().to_string(),
            });
        }
        let identity = CheckIdentity::new(def.name(), parent_id);

        let kind = match def {
            CheckDefinition::Group { checks, .. } => {
                if checks.is_empty() {
                    return Err(ConfigError::EmptyGroup { id: identity.id });
                }
                CheckKind::Group(build_siblings(checks, Some(&identity.id))?)
            }
            CheckDefinition::Tls { address, insecure, .. } => {
                validate_address(&identity.id, address)?;
                CheckKind::Tls(TlsProbe::new(address.as_str(), *insecure))
            }
            CheckDefinition::Smtp { address, .. } => {
                validate_address(&identity.id, address)?;
                CheckKind::Smtp(SmtpProbe::new(address.as_str()))
            }
        };

        Ok(Self::new(identity, kind))
    }

    pub fn identity(&self) -> &CheckIdentity {
        &self.identity
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn children(&self) -> &[CheckNode] {
        match &self.kind {
            CheckKind::Group(children) => children,
            _ => &[],
        }
    }

    /// Number of nodes in this subtree, this one included.
    pub fn count(&self) -> usize {
        1 + self.children().iter().map(CheckNode::count).sum::<usize>()
    }

    /// Runs this check (every child of a group, in order) and reports
    /// transitions to `hub`. Returns whether the check is healthy now.
    pub async fn evaluate(&mut self, hub: &NotificationHub) -> bool {
        let (ok, reason) = match &mut self.kind {
            CheckKind::Group(children) => {
                let mut all_ok = true;
                for child in children.iter_mut() {
                    if !Box::pin(child.evaluate(hub)).await {
                        all_ok = false;
                    }
                }
                (all_ok, String::new())
            }
            CheckKind::Tls(probe) => outcome(probe.run().await),
            CheckKind::Smtp(probe) => outcome(probe.run().await),
        };

        let previous_transition = self.tracker.last_transition();
        let previous_evaluation = self.tracker.last_evaluation();
        match self.tracker.observe(&self.identity, Utc::now(), ok, reason) {
            Observation::Baseline(event) => {
                debug!(check = %self.identity.id, ok, "baseline recorded");
                if let Err(e) = hub.baseline(&event).await {
                    debug!(check = %self.identity.id, error = %e, "baseline delivery incomplete");
                }
            }
            Observation::Transition(event) => {
                debug!(
                    check = %self.identity.id,
                    ok,
                    previous_transition = ?previous_transition,
                    previous_evaluation = ?previous_evaluation,
                    "state changed"
                );
                if let Err(e) = hub.notify(&event).await {
                    debug!(check = %self.identity.id, error = %e, "notification delivery incomplete");
                }
            }
            Observation::Unchanged => {}
        }
        ok
    }
}

fn outcome(result: Result<(), ProbeError>) -> (bool, String) {
    match result {
        Ok(()) => (true, String::new()),
        Err(e) => (false, e.to_string()),
    }
}

fn build_siblings(
    defs: &[CheckDefinition],
    parent_id: Option<&str>,
) -> Result<Vec<CheckNode>, ConfigError> {
    let mut seen = HashSet::new();
    let mut nodes = Vec::with_capacity(defs.len());
    for def in defs {
        let node = CheckNode::build(def, parent_id)?;
        if !seen.insert(node.identity.id.clone()) {
            return Err(ConfigError::DuplicateId {
                id: node.identity.id,
            });
        }
        nodes.push(node);
    }
    Ok(nodes)
}

/// The configured top-level checks, evaluated in declaration order.
#[derive(Debug)]
pub struct CheckTree {
    roots: Vec<CheckNode>,
}

impl CheckTree {
    pub fn new(roots: Vec<CheckNode>) -> Self {
        Self { roots }
    }

    pub fn build(defs: &[CheckDefinition]) -> Result<Self, ConfigError> {
        Ok(Self::new(build_siblings(defs, None)?))
    }

    pub fn roots(&self) -> &[CheckNode] {
        &self.roots
    }

    pub fn count(&self) -> usize {
        self.roots.iter().map(CheckNode::count).sum()
    }

    /// One full pass over every check. True if all top-level checks pass.
    pub async fn evaluate(&mut self, hub: &NotificationHub) -> bool {
        let mut all_ok = true;
        for root in &mut self.roots {
            if !root.evaluate(hub).await {
                all_ok = false;
            }
        }
        all_ok
    }
}

/// Polling loop over the check tree.
pub struct Monitor {
    tree: CheckTree,
    hub: NotificationHub,
    interval: Duration,
}

impl Monitor {
    pub fn new(tree: CheckTree, hub: NotificationHub, interval: Duration) -> Self {
        Self { tree, hub, interval }
    }

    pub fn tree(&self) -> &CheckTree {
        &self.tree
    }

    /// Evaluates the tree, then waits for the interval or `stop`, whichever
    /// comes first. A pass in flight when `stop` fires is finished; no new
    /// pass starts after it. Returns the number of passes run.
    pub async fn run<S>(&mut self, stop: S) -> u64
    where
        S: Future<Output = ()>,
    {
        info!(
            checks = self.tree.count(),
            interval = ?self.interval,
            "NetPulse engine: check tree monitoring active"
        );
        if self.hub.is_empty() {
            warn!("No notification sinks registered, transitions will go unreported.");
        }
        tokio::pin!(stop);
        let mut passes = 0;

        loop {
            let started = Instant::now();
            info!("Running checks.");
            let all_ok = self.tree.evaluate(&self.hub).await;
            passes += 1;
            info!(
                checks = self.tree.count(),
                all_ok,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Check cycle completed."
            );

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = &mut stop => {
                    info!("Exiting.");
                    break;
                }
            }
        }
        passes
    }
}
