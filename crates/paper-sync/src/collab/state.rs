use tracing::debug;

use crate::model::{Node, Schema};
use crate::transform::{Applied, Step, StepMap, Transform};
use crate::{SyncError, SyncResult};

/// A locally applied step that has not been confirmed yet, with its inverse
/// against the document it was applied to
#[derive(Debug, Clone, PartialEq)]
pub struct Rebaseable {
    pub step: Step,
    pub inverted: Step,
}

/// Outcome of folding a remote batch into the local state
#[derive(Debug, Clone)]
pub struct Received {
    pub doc: Node,
    /// Leading steps of the batch that were our own and are now confirmed
    pub confirmed: usize,
    /// Steps of the batch that came from other clients and were applied
    pub foreign: usize,
    /// Pending steps that no longer applied after the rebase
    pub dropped: usize,
    /// Every step applied to reach `doc`: undone pending steps, the foreign
    /// steps and the rebased pending steps
    pub steps: Vec<Step>,
    /// The document before each of `steps`
    pub docs: Vec<Node>,
}

/// Local synchronization state of one client for one document
#[derive(Debug, Clone)]
pub struct CollabState {
    version: u64,
    unconfirmed: Vec<Rebaseable>,
    client_id: String,
}

impl CollabState {
    pub fn new(version: u64, client_id: impl Into<String>) -> Self {
        Self {
            version,
            unconfirmed: Vec::new(),
            client_id: client_id.into(),
        }
    }

    /// Version last reconciled with the relay
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn pending(&self) -> &[Rebaseable] {
        &self.unconfirmed
    }

    pub fn pending_steps(&self) -> Vec<Step> {
        self.unconfirmed.iter().map(|r| r.step.clone()).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.unconfirmed.is_empty()
    }

    /// Record the steps of a locally applied transaction as pending
    pub fn push_local(&mut self, applied: &Applied) {
        let count = applied.steps.len();
        // `inverted` is in undo order, the reverse of the steps
        for (i, step) in applied.steps.iter().enumerate() {
            self.unconfirmed.push(Rebaseable {
                step: step.clone(),
                inverted: applied.inverted[count - 1 - i].clone(),
            });
        }
    }

    /// Fold a batch broadcast by the relay into the local document
    ///
    /// `doc` is the current local document, with all pending steps applied.
    /// Steps at the front of the batch that carry our client id confirm our
    /// oldest pending steps and are not applied again. The remaining steps are
    /// applied underneath the pending ones, which are then rebased on top.
    pub fn receive(
        &mut self,
        schema: &Schema,
        doc: &Node,
        steps: Vec<Step>,
        client_ids: &[String],
    ) -> SyncResult<Received> {
        if steps.len() != client_ids.len() {
            return Err(SyncError::Protocol {
                message: format!(
                    "{} steps but {} client ids in remote batch",
                    steps.len(),
                    client_ids.len()
                ),
            });
        }

        let ours = client_ids
            .iter()
            .take_while(|id| **id == self.client_id)
            .count();
        if ours > self.unconfirmed.len() {
            return Err(SyncError::Internal(format!(
                "relay echoed {} steps but only {} are pending",
                ours,
                self.unconfirmed.len()
            )));
        }

        let total = steps.len() as u64;
        let foreign: Vec<Step> = steps.into_iter().skip(ours).collect();
        let unconfirmed: Vec<Rebaseable> = self.unconfirmed[ours..].to_vec();

        let mut received = Received {
            doc: doc.clone(),
            confirmed: ours,
            foreign: foreign.len(),
            dropped: 0,
            steps: Vec::new(),
            docs: Vec::new(),
        };

        if !foreign.is_empty() {
            let mut transform = Transform::new(schema, doc.clone());
            let rebased = rebase_steps(&unconfirmed, &foreign, &mut transform)?;
            received.dropped = unconfirmed.len() - rebased.len();
            received.doc = transform.doc().clone();
            received.steps = transform.steps().to_vec();
            received.docs = transform.docs().to_vec();
            self.unconfirmed = rebased;
        } else {
            self.unconfirmed = unconfirmed;
        }

        self.version += total;
        debug!(
            "Received {} steps ({} confirmed), now at version {} with {} pending",
            total,
            ours,
            self.version,
            self.unconfirmed.len()
        );
        Ok(received)
    }
}

/// Undo `steps`, apply `over`, then map and reapply `steps` on top
///
/// Steps that no longer apply after mapping are left out of the result.
/// Mirror information is recorded so positions inside content that was
/// removed and restored map back to where they were.
pub fn rebase_steps(
    steps: &[Rebaseable],
    over: &[Step],
    transform: &mut Transform<'_>,
) -> SyncResult<Vec<Rebaseable>> {
    for rebaseable in steps.iter().rev() {
        // undoing a mark step may replace its range wholesale, but no position moves
        let map = if rebaseable.step.is_mark_step() {
            StepMap::empty()
        } else {
            rebaseable.inverted.get_map()
        };
        transform
            .step_with_map(rebaseable.inverted.clone(), map)
            .map_err(|e| SyncError::Internal(format!("cannot undo pending step: {}", e)))?;
    }
    for step in over {
        transform.step(step.clone())?;
    }

    let mut result = Vec::with_capacity(steps.len());
    let mut map_from = steps.len();
    for rebaseable in steps {
        let mapped = rebaseable.step.map(&transform.mapping().slice(map_from));
        map_from -= 1;
        let Some(mapped) = mapped else {
            continue;
        };
        if transform.maybe_step(mapped.clone()) {
            let applied_at = transform.steps().len() - 1;
            transform.mapping_mut().set_mirror(map_from, applied_at);
            if let Some(inverted) = transform.last_inverse() {
                result.push(Rebaseable {
                    step: mapped,
                    inverted: inverted.clone(),
                });
            }
        }
    }
    Ok(result)
}
