//! Proposals: mutations offered to a perspective's owners.
//!
//! Only the data shape and the storage contract live here. Deciding on a
//! proposal belongs to whoever owns the target perspective.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::EveesMutation;

/// What a proposer submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalCreate {
    pub to_perspective_id: String,
    /// Perspective the changes were taken from, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_perspective_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    pub timestamp: i64,
    pub mutation: EveesMutation,
}

/// A stored proposal; `id` is the content id of its [`ProposalCreate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    #[serde(flatten)]
    pub object: ProposalCreate,
}

#[async_trait]
pub trait Proposals: Send + Sync {
    /// Store a proposal and return its id.
    async fn create_proposal(&self, proposal: ProposalCreate) -> Result<String>;

    async fn get_proposal(&self, proposal_id: &str) -> Result<Proposal>;

    /// Ids of proposals targeting `perspective_id`, oldest first.
    async fn get_proposals_to_perspective(&self, perspective_id: &str) -> Result<Vec<String>>;

    async fn can_propose(&self, perspective_id: &str, user_id: Option<&str>) -> Result<bool>;

    async fn can_delete(&self, proposal_id: &str, user_id: Option<&str>) -> Result<bool>;

    async fn delete_proposal(&self, proposal_id: &str) -> Result<()>;
}

/// Proposals kept in memory. Anyone may propose; only the creator may delete.
#[derive(Debug)]
pub struct MemoryProposals {
    hasher: Hasher,
    proposals: Mutex<HashMap<String, Proposal>>,
}

impl MemoryProposals {
    #[must_use]
    pub fn new(hasher: Hasher) -> Self {
        Self {
            hasher,
            proposals: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Proposals for MemoryProposals {
    async fn create_proposal(&self, proposal: ProposalCreate) -> Result<String> {
        let id = self.hasher.entity(&proposal)?.id;
        debug!(%id, to = %proposal.to_perspective_id, "stored proposal");
        self.proposals.lock().insert(
            id.clone(),
            Proposal {
                id: id.clone(),
                object: proposal,
            },
        );
        Ok(id)
    }

    async fn get_proposal(&self, proposal_id: &str) -> Result<Proposal> {
        self.proposals
            .lock()
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| EveesError::EntityNotFound(proposal_id.to_string()))
    }

    async fn get_proposals_to_perspective(&self, perspective_id: &str) -> Result<Vec<String>> {
        let proposals = self.proposals.lock();
        let mut matching: Vec<&Proposal> = proposals
            .values()
            .filter(|p| p.object.to_perspective_id == perspective_id)
            .collect();
        matching.sort_by(|a, b| {
            a.object
                .timestamp
                .cmp(&b.object.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matching.into_iter().map(|p| p.id.clone()).collect())
    }

    async fn can_propose(&self, _perspective_id: &str, _user_id: Option<&str>) -> Result<bool> {
        Ok(true)
    }

    async fn can_delete(&self, proposal_id: &str, user_id: Option<&str>) -> Result<bool> {
        let proposals = self.proposals.lock();
        let proposal = proposals
            .get(proposal_id)
            .ok_or_else(|| EveesError::EntityNotFound(proposal_id.to_string()))?;
        Ok(match (&proposal.object.creator_id, user_id) {
            (Some(creator), Some(user)) => creator == user,
            _ => false,
        })
    }

    async fn delete_proposal(&self, proposal_id: &str) -> Result<()> {
        self.proposals
            .lock()
            .remove(proposal_id)
            .map(|_| ())
            .ok_or_else(|| EveesError::EntityNotFound(proposal_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Update;

    fn create(to: &str, creator: &str, timestamp: i64) -> ProposalCreate {
        ProposalCreate {
            to_perspective_id: to.into(),
            from_perspective_id: None,
            creator_id: Some(creator.into()),
            timestamp,
            mutation: EveesMutation {
                updates: vec![Update::head(to, format!("h{timestamp}"))],
                ..EveesMutation::default()
            },
        }
    }

    #[tokio::test]
    async fn proposals_are_content_addressed() {
        let proposals = MemoryProposals::new(Hasher::default());
        let a = proposals.create_proposal(create("p", "alice", 1)).await.expect("a");
        let again = proposals.create_proposal(create("p", "alice", 1)).await.expect("again");
        assert_eq!(a, again);

        let stored = proposals.get_proposal(&a).await.expect("get");
        assert_eq!(stored.object.mutation.updates.len(), 1);
    }

    #[tokio::test]
    async fn listed_by_target_oldest_first() {
        let proposals = MemoryProposals::new(Hasher::default());
        let late = proposals.create_proposal(create("p", "alice", 5)).await.expect("late");
        let early = proposals.create_proposal(create("p", "bob", 2)).await.expect("early");
        proposals.create_proposal(create("q", "bob", 1)).await.expect("other");

        assert_eq!(
            proposals.get_proposals_to_perspective("p").await.expect("list"),
            vec![early, late]
        );
    }

    #[tokio::test]
    async fn only_creator_may_delete() {
        let proposals = MemoryProposals::new(Hasher::default());
        let id = proposals.create_proposal(create("p", "alice", 1)).await.expect("create");
        assert!(proposals.can_delete(&id, Some("alice")).await.expect("alice"));
        assert!(!proposals.can_delete(&id, Some("bob")).await.expect("bob"));
        assert!(!proposals.can_delete(&id, None).await.expect("anonymous"));

        proposals.delete_proposal(&id).await.expect("delete");
        assert!(proposals.get_proposal(&id).await.is_err());
    }
}
