//! The evees service: one entry point over a configured client stack.
//!
//! [`EveesContext`] is built once with the client, the remotes behind it, the
//! merge behaviours and the configuration, and handed to [`Evees::new`].
//! Nothing is looked up globally.
//!
//! Every write goes through [`Client::update`]: content is hashed locally and
//! travels inline with the mutation, so a layered client keeps it buffered
//! until flush.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::client::{self, Client, ClientCachedWithBase, FlushOptions, head_of};
use crate::config::EveesConfig;
use crate::error::{EveesError, Result};
use crate::merge::{BehaviourRegistry, CommitGraph, MergeOutcome, MergeStrategy};
use crate::model::{
    ArrayChanges, Commit, Entity, EveesMutation, ForkOf, IndexData, NewPerspective,
    PartialPerspective, Perspective, PerspectiveDetails, PerspectiveMeta, Update,
};
use crate::proposals::{ProposalCreate, Proposals};
use crate::remote::RemoteEvees;

/// Everything [`Evees`] needs, built once.
#[derive(Clone)]
pub struct EveesContext {
    pub client: Arc<dyn Client>,
    pub remotes: Vec<Arc<dyn RemoteEvees>>,
    pub behaviours: BehaviourRegistry,
    pub config: EveesConfig,
}

impl EveesContext {
    pub fn new(
        client: Arc<dyn Client>,
        remotes: Vec<Arc<dyn RemoteEvees>>,
        config: EveesConfig,
    ) -> Self {
        Self {
            client,
            remotes,
            behaviours: BehaviourRegistry::default(),
            config,
        }
    }

    #[must_use]
    pub fn with_behaviours(mut self, behaviours: BehaviourRegistry) -> Self {
        self.behaviours = behaviours;
        self
    }
}

impl std::fmt::Debug for EveesContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EveesContext")
            .field("remotes", &self.remotes.iter().map(|r| r.id()).collect::<Vec<_>>())
            .field("behaviours", &self.behaviours)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Evees {
    ctx: EveesContext,
}

impl Evees {
    pub const fn new(ctx: EveesContext) -> Self {
        Self { ctx }
    }

    pub const fn context(&self) -> &EveesContext {
        &self.ctx
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.ctx.client
    }

    /// Remote by id; `None` is the configured default, else the first one.
    pub fn remote(&self, id: Option<&str>) -> Result<Arc<dyn RemoteEvees>> {
        let wanted = id.unwrap_or(&self.ctx.config.store.remote);
        self.ctx
            .remotes
            .iter()
            .find(|r| r.id() == wanted)
            .or_else(|| self.ctx.remotes.first().filter(|_| id.is_none()))
            .cloned()
            .ok_or_else(|| EveesError::Config(format!("no remote registered as '{wanted}'")))
    }

    /// Creator recorded on new commits: the default remote's user.
    fn creator_id(&self) -> String {
        self.remote(None)
            .ok()
            .and_then(|r| r.user_id())
            .unwrap_or_default()
    }

    async fn hash(&self, object: Value) -> Result<Entity> {
        self.ctx.client.store().hash_entity(object).await
    }

    fn commit(&self, data_id: &str, parents: Vec<String>, message: Option<String>) -> Commit {
        Commit {
            creators_ids: vec![self.creator_id()],
            timestamp: chrono::Utc::now().timestamp_millis(),
            message,
            parents_ids: parents,
            data_id: data_id.to_string(),
            forking: None,
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    pub async fn snap_perspective(
        &self,
        remote: Option<&str>,
        context: Option<String>,
        path: Option<String>,
    ) -> Result<Entity<Perspective>> {
        self.remote(remote)?
            .snap_perspective(PartialPerspective {
                context,
                path,
                ..PartialPerspective::default()
            })
            .await
    }

    /// Store a commit pointing at `data_id`.
    pub async fn create_commit(
        &self,
        data_id: &str,
        parents: Vec<String>,
        message: Option<String>,
    ) -> Result<Entity<Commit>> {
        let commit = self.commit(data_id, parents, message);
        let stored = crate::cas::put(self.ctx.client.store().as_ref(), &commit).await?;
        Ok(Entity {
            id: stored.id,
            object: commit,
        })
    }

    /// Create a perspective whose first commit holds `object`.
    ///
    /// With `parent`, the new perspective is appended to the parent's first
    /// link field and guarded by it, in the same mutation.
    #[instrument(level = "debug", skip(self, object))]
    pub async fn create_evee(
        &self,
        object: Value,
        remote: Option<&str>,
        parent: Option<&str>,
    ) -> Result<String> {
        let data = self.hash(object).await?;
        let commit = self.commit(&data.id, Vec::new(), None);
        let commit = self.hash(serde_json::to_value(commit)?).await?;
        let perspective = self
            .snap_perspective(remote, Some(commit.id.clone()), None)
            .await?;
        let perspective_id = perspective.id.clone();

        let mut update = Update::head(perspective_id.clone(), commit.id.clone());
        update.details.guardian_id = parent.map(str::to_string);
        let mut mutation = EveesMutation {
            new_perspectives: vec![NewPerspective {
                perspective,
                update: Some(update),
            }],
            entities: vec![data, commit],
            ..EveesMutation::default()
        };

        if let Some(parent) = parent {
            let (parent_update, entities) = self.append_child(parent, &perspective_id).await?;
            mutation.updates.push(parent_update);
            mutation.entities.extend(entities);
        }

        self.ctx.client.update(mutation).await?;
        debug!(perspective = %perspective_id, "created evee");
        Ok(perspective_id)
    }

    /// New perspective in the same context as `perspective_id`, starting at
    /// its current head.
    pub async fn fork_perspective(
        &self,
        perspective_id: &str,
        remote: Option<&str>,
    ) -> Result<String> {
        let client = self.ctx.client.as_ref();
        let original = client::load_perspective(client, perspective_id).await?;
        let head = head_of(client, perspective_id).await?;
        let perspective = self
            .remote(remote)?
            .snap_perspective(PartialPerspective {
                context: Some(original.object.context),
                path: Some(original.object.path),
                meta: Some(PerspectiveMeta {
                    forking: Some(ForkOf {
                        perspective_id: perspective_id.to_string(),
                        head_id: head.clone(),
                    }),
                }),
                ..PartialPerspective::default()
            })
            .await?;
        let id = perspective.id.clone();
        client
            .new_perspective(NewPerspective {
                perspective,
                update: head.map(|h| Update::head(id.clone(), h)),
            })
            .await?;
        debug!(from = %perspective_id, fork = %id, "forked perspective");
        Ok(id)
    }

    /// Update appending `child` to `parent`'s first link field.
    async fn append_child(&self, parent: &str, child: &str) -> Result<(Update, Vec<Entity>)> {
        let (head, data) = self.head_and_data(parent).await?;
        let data = data.ok_or_else(|| EveesError::malformed(parent, "parent has no content"))?;
        let behaviour = self.ctx.behaviours.resolve(&data.object);
        let field = behaviour.link_fields().first().copied().ok_or_else(|| {
            EveesError::malformed(&data.id, "parent type has no link field")
        })?;

        let mut object = data.object.clone();
        let Some(fields) = object.as_object_mut() else {
            return Err(EveesError::malformed(&data.id, "parent content is not an object"));
        };
        let links = fields
            .entry(field)
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(links) = links.as_array_mut() else {
            return Err(EveesError::malformed(&data.id, format!("'{field}' is not a list")));
        };
        links.push(Value::String(child.to_string()));

        self.commit_update(parent, head, &data.object, object, None).await
    }

    // -----------------------------------------------------------------------
    // Content
    // -----------------------------------------------------------------------

    async fn head_and_data(&self, perspective_id: &str) -> Result<(Option<String>, Option<Entity>)> {
        let client = self.ctx.client.as_ref();
        let (details, head) = client::resolve_head(client, perspective_id).await?;
        let data = match head {
            Some(commit) => Some(client.store().get_entity(&commit.object.data_id).await?),
            None => None,
        };
        Ok((details.head_id, data))
    }

    /// Data object at the perspective's head, if it has one.
    pub async fn get_perspective_data(&self, perspective_id: &str) -> Result<Option<Entity>> {
        Ok(self.head_and_data(perspective_id).await?.1)
    }

    /// Commit `object` on top of the perspective's head. Returns the new head.
    #[instrument(level = "debug", skip(self, object))]
    pub async fn update_perspective_data(
        &self,
        perspective_id: &str,
        object: Value,
        message: Option<String>,
    ) -> Result<String> {
        let (head, data) = self.head_and_data(perspective_id).await?;
        let previous = data.map_or(Value::Null, |d| d.object);
        let (update, entities) = self
            .commit_update(perspective_id, head, &previous, object, message)
            .await?;
        let new_head = update.details.head_id.clone().unwrap_or_default();
        self.ctx
            .client
            .update(EveesMutation {
                updates: vec![update],
                entities,
                ..EveesMutation::default()
            })
            .await?;
        Ok(new_head)
    }

    /// Update moving `perspective_id` from `head` to a new commit of `object`,
    /// with the children delta against `previous`.
    async fn commit_update(
        &self,
        perspective_id: &str,
        head: Option<String>,
        previous: &Value,
        object: Value,
        message: Option<String>,
    ) -> Result<(Update, Vec<Entity>)> {
        let behaviour = self.ctx.behaviours.resolve(&object);
        let children =
            ArrayChanges::between(&behaviour.children(previous), &behaviour.children(&object));

        let data = self.hash(object).await?;
        let parents: Vec<String> = head.iter().cloned().collect();
        let commit = self
            .hash(serde_json::to_value(self.commit(&data.id, parents, message))?)
            .await?;

        let mut update = Update::head(perspective_id, commit.id.clone()).with_old_head(head);
        if !children.is_empty() {
            update = update.with_index_data(IndexData::children(children));
        }
        Ok((update, vec![data, commit]))
    }

    /// Point a perspective at an existing commit.
    pub async fn set_head(&self, perspective_id: &str, head_id: &str) -> Result<()> {
        let old = head_of(self.ctx.client.as_ref(), perspective_id).await?;
        self.ctx
            .client
            .update_perspective(Update::head(perspective_id, head_id).with_old_head(old))
            .await
    }

    pub async fn delete_perspective(&self, perspective_id: &str) -> Result<()> {
        self.ctx.client.delete_perspective(perspective_id).await
    }

    pub async fn get_perspective_details(&self, perspective_id: &str) -> Result<PerspectiveDetails> {
        Ok(self
            .ctx
            .client
            .get_perspective(perspective_id, crate::model::GetPerspectiveOptions::default())
            .await?
            .details)
    }

    /// Commits reachable from the perspective's head, newest first along
    /// first parents.
    pub async fn history(&self, perspective_id: &str, limit: usize) -> Result<Vec<Entity<Commit>>> {
        let client = self.ctx.client.as_ref();
        let mut next = head_of(client, perspective_id).await?;
        let mut commits = Vec::new();
        while let Some(id) = next {
            if commits.len() >= limit {
                break;
            }
            let commit = client::load_commit(client, &id).await?;
            next = commit.object.parents_ids.first().cloned();
            commits.push(commit);
        }
        Ok(commits)
    }

    // -----------------------------------------------------------------------
    // History and merge
    // -----------------------------------------------------------------------

    pub async fn is_ancestor_of(&self, candidate: &str, commit_id: &str) -> Result<bool> {
        let store = self.ctx.client.store();
        CommitGraph::new(store.as_ref())
            .is_ancestor_of(candidate, commit_id, &[])
            .await
    }

    fn strategy<'a>(&'a self, client: &'a dyn Client) -> MergeStrategy<'a> {
        MergeStrategy::new(client, &self.ctx.behaviours)
            .with_config(self.ctx.config.merge)
            .with_creator(self.creator_id())
    }

    /// Merge `from` into `to` through the context's client.
    pub async fn merge_perspectives(&self, to: &str, from: &str) -> Result<MergeOutcome> {
        self.strategy(self.ctx.client.as_ref())
            .merge_perspectives(to, from)
            .await
    }

    /// Flush buffered changes, squashing commit chains first.
    pub async fn condense_pending(&self) -> Result<()> {
        self.ctx
            .client
            .flush_with(FlushOptions { condensate: true })
            .await
    }

    pub async fn flush(&self) -> Result<()> {
        self.ctx.client.flush().await
    }

    /// Run the merge in a scratch layer and file the result as a proposal.
    ///
    /// The context's client is left untouched. Returns `None` when the merge
    /// has nothing to propose.
    #[instrument(level = "info", skip(self, proposals))]
    pub async fn propose_merge(
        &self,
        to: &str,
        from: &str,
        proposals: &dyn Proposals,
    ) -> Result<Option<String>> {
        let scratch =
            ClientCachedWithBase::new(self.ctx.client.clone(), self.ctx.config.hash, "proposal");
        let outcome = self.strategy(&scratch).merge_perspectives(to, from).await?;
        if !outcome.changed() {
            return Ok(None);
        }

        let mutation = scratch.diff().await?;
        let id = proposals
            .create_proposal(ProposalCreate {
                to_perspective_id: to.to_string(),
                from_perspective_id: Some(from.to_string()),
                creator_id: Some(self.creator_id()).filter(|c| !c.is_empty()),
                timestamp: chrono::Utc::now().timestamp_millis(),
                mutation,
            })
            .await?;
        info!(proposal = %id, "filed merge proposal");
        Ok(Some(id))
    }
}
