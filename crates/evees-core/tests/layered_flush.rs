//! Layered client behaviour against real remotes: buffering, flush ordering,
//! cache coherency, notifications and routing by owner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evees_core::cas::CasStore;
use evees_core::client::{BaseRouter, Client, ClientCachedWithBase, FlushOptions};
use evees_core::hash::Hasher;
use evees_core::model::{
    Commit, Entity, EveesMutation, GetPerspectiveOptions, NewPerspective, PartialPerspective,
    PerspectiveGetResult, Update,
};
use tokio::sync::broadcast;
use evees_core::remote::{MemoryRemote, RemoteEvees, SqliteRemote};
use evees_core::{EveesError, cas};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn hasher() -> Hasher {
    Hasher::default()
}

fn memory(id: &str) -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::with_user(id, hasher(), "alice"))
}

fn commit_object(data_id: &str, parents: &[&str], ts: i64) -> Commit {
    Commit {
        creators_ids: vec!["alice".into()],
        timestamp: ts,
        message: None,
        parents_ids: parents.iter().map(|p| (*p).to_string()).collect(),
        data_id: data_id.into(),
        forking: None,
    }
}

/// Hash data and a commit on top of `parents`, returning both entities.
fn content(text: &str, parents: &[&str], ts: i64) -> (Entity, Entity) {
    let data = hasher().entity(&json!({"text": text})).expect("data");
    let commit = hasher()
        .entity(&commit_object(&data.id, parents, ts))
        .expect("commit");
    (data, commit)
}

async fn snap(remote: &dyn RemoteEvees, context: &str) -> Entity<evees_core::Perspective> {
    remote
        .snap_perspective(PartialPerspective {
            context: Some(context.into()),
            timestamp: Some(1),
            ..PartialPerspective::default()
        })
        .await
        .expect("snap")
}

/// Register a perspective with a first commit through `client`.
async fn create(client: &dyn Client, remote: &dyn RemoteEvees, context: &str) -> (String, String) {
    let perspective = snap(remote, context).await;
    let id = perspective.id.clone();
    let (data, commit) = content(context, &[], 1);
    let head = commit.id.clone();
    client
        .update(EveesMutation {
            new_perspectives: vec![NewPerspective {
                perspective,
                update: Some(Update::head(id.clone(), head.clone())),
            }],
            entities: vec![data, commit],
            ..EveesMutation::default()
        })
        .await
        .expect("create");
    (id, head)
}

async fn head(client: &dyn Client, id: &str) -> Option<String> {
    client
        .get_perspective(id, GetPerspectiveOptions::default())
        .await
        .expect("get")
        .details
        .head_id
}

// ---------------------------------------------------------------------------
// Buffering and flush
// ---------------------------------------------------------------------------

#[tokio::test]
async fn writes_stay_local_until_flush() {
    let remote = memory("mem");
    let client = ClientCachedWithBase::new(remote.clone(), hasher(), "app");

    let (id, first_head) = create(&client, remote.as_ref(), "doc").await;
    assert_eq!(head(&client, &id).await, Some(first_head.clone()));
    assert!(matches!(
        remote
            .get_perspective(&id, GetPerspectiveOptions::default())
            .await,
        Err(EveesError::PerspectiveNotFound(_))
    ));
    let diff = client.diff().await.expect("diff");
    assert_eq!(diff.new_perspectives.len(), 1);
    assert!(!diff.entities.is_empty());

    client.flush().await.expect("flush");

    let diff = client.diff().await.expect("diff");
    assert!(diff.is_empty());
    assert_eq!(head(remote.as_ref(), &id).await, Some(first_head.clone()));
    assert_eq!(head(&client, &id).await, Some(first_head.clone()));

    // Content reached the base before the pointer did.
    let commit = cas::load::<Commit>(remote.store().as_ref(), &first_head)
        .await
        .expect("commit at base");
    assert!(remote.store().try_get_entity(&commit.object.data_id).await.expect("data").is_some());
}

#[tokio::test]
async fn stale_precondition_fails_the_flush() {
    let remote = memory("mem");
    let (id, first) = create(remote.as_ref(), remote.as_ref(), "doc").await;

    let client = ClientCachedWithBase::new(remote.clone(), hasher(), "app");
    let (data, commit) = content("local", &[&first], 2);
    client
        .update(EveesMutation {
            updates: vec![
                Update::head(id.clone(), commit.id.clone()).with_old_head(Some(first.clone())),
            ],
            entities: vec![data, commit],
            ..EveesMutation::default()
        })
        .await
        .expect("buffer");

    // Someone else moves the head first.
    let (other_data, other) = content("remote", &[&first], 3);
    remote
        .update(EveesMutation {
            updates: vec![Update::head(id.clone(), other.id.clone())],
            entities: vec![other_data, other.clone()],
            ..EveesMutation::default()
        })
        .await
        .expect("concurrent");

    let err = client.flush().await.expect_err("precondition");
    assert!(matches!(err, EveesError::PreconditionFailed { .. }));
    assert_eq!(head(remote.as_ref(), &id).await, Some(other.id));
}

#[tokio::test]
async fn base_notifications_evict_cached_details() {
    let remote = memory("mem");
    let (id, first) = create(remote.as_ref(), remote.as_ref(), "doc").await;

    let reader = ClientCachedWithBase::new(remote.clone(), hasher(), "reader");
    assert_eq!(head(&reader, &id).await, Some(first.clone()));

    let (data, commit) = content("next", &[&first], 2);
    remote
        .update(EveesMutation {
            updates: vec![Update::head(id.clone(), commit.id.clone())],
            entities: vec![data, commit.clone()],
            ..EveesMutation::default()
        })
        .await
        .expect("update base");

    assert_eq!(head(&reader, &id).await, Some(commit.id));
}

#[tokio::test]
async fn condensed_flush_ships_one_commit() {
    let remote = memory("mem");
    let (id, first) = create(remote.as_ref(), remote.as_ref(), "doc").await;
    let client = ClientCachedWithBase::new(remote.clone(), hasher(), "app");

    let mut parent = first.clone();
    let mut last_data = String::new();
    for step in 0..3 {
        let (data, commit) = content(&format!("v{step}"), &[&parent], 10 + step);
        last_data.clone_from(&data.id);
        let old = parent.clone();
        parent.clone_from(&commit.id);
        client
            .update(EveesMutation {
                updates: vec![
                    Update::head(id.clone(), commit.id.clone()).with_old_head(Some(old)),
                ],
                entities: vec![data, commit],
                ..EveesMutation::default()
            })
            .await
            .expect("buffer");
    }

    client
        .flush_with(FlushOptions { condensate: true })
        .await
        .expect("flush");

    let new_head = head(remote.as_ref(), &id).await.expect("head");
    assert_ne!(new_head, parent);
    let squashed = cas::load::<Commit>(remote.store().as_ref(), &new_head)
        .await
        .expect("squashed");
    assert_eq!(squashed.object.parents_ids, vec![first]);
    assert_eq!(squashed.object.data_id, last_data);
}

/// A base that takes its time applying mutations.
struct SlowBase {
    inner: Arc<MemoryRemote>,
    delay: Duration,
}

#[async_trait]
impl Client for SlowBase {
    fn store(&self) -> Arc<dyn CasStore> {
        self.inner.store()
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.inner.subscribe()
    }

    async fn get_perspective(
        &self,
        perspective_id: &str,
        options: GetPerspectiveOptions,
    ) -> evees_core::Result<PerspectiveGetResult> {
        self.inner.get_perspective(perspective_id, options).await
    }

    async fn update(&self, mutation: EveesMutation) -> evees_core::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.update(mutation).await
    }

    async fn diff(&self) -> evees_core::Result<EveesMutation> {
        self.inner.diff().await
    }

    async fn flush(&self) -> evees_core::Result<()> {
        self.inner.flush().await
    }

    async fn refresh(&self) -> evees_core::Result<()> {
        self.inner.refresh().await
    }

    async fn can_update(
        &self,
        perspective_id: &str,
        user_id: Option<&str>,
    ) -> evees_core::Result<bool> {
        self.inner.can_update(perspective_id, user_id).await
    }

    async fn get_user_perspectives(&self, perspective_id: &str) -> evees_core::Result<Vec<String>> {
        self.inner.get_user_perspectives(perspective_id).await
    }
}

#[tokio::test]
async fn writes_during_flush_reach_the_base_next_time() {
    let remote = memory("mem");
    let (id, first) = create(remote.as_ref(), remote.as_ref(), "doc").await;
    let slow = Arc::new(SlowBase {
        inner: remote.clone(),
        delay: Duration::from_millis(50),
    });
    let client = ClientCachedWithBase::new(slow, hasher(), "app");

    let (data, second) = content("v2", &[&first], 2);
    client
        .update(EveesMutation {
            updates: vec![Update::head(id.clone(), second.id.clone()).with_old_head(Some(first))],
            entities: vec![data, second.clone()],
            ..EveesMutation::default()
        })
        .await
        .expect("buffer v2");

    let (late_data, third) = content("v3", &[&second.id], 3);
    let late_data_id = late_data.id.clone();
    let (flushed, late) = tokio::join!(client.flush(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        client
            .update(EveesMutation {
                updates: vec![
                    Update::head(id.clone(), third.id.clone())
                        .with_old_head(Some(second.id.clone())),
                ],
                entities: vec![late_data, third.clone()],
                ..EveesMutation::default()
            })
            .await
    });
    flushed.expect("flush");
    late.expect("buffer v3");

    assert_eq!(head(remote.as_ref(), &id).await, Some(second.id.clone()));
    let pending = client.diff().await.expect("diff");
    assert_eq!(pending.updates.len(), 1);
    assert!(pending.entities.iter().any(|e| e.id == late_data_id));
    assert_eq!(head(&client, &id).await, Some(third.id.clone()));

    client.flush().await.expect("second flush");
    assert!(client.diff().await.expect("diff").is_empty());
    assert_eq!(head(remote.as_ref(), &id).await, Some(third.id));
    assert!(remote.store().try_get_entity(&late_data_id).await.expect("data").is_some());
}

#[tokio::test]
async fn write_before_read_keeps_base_details() {
    let remote = memory("mem");
    let (guardian, _) = create(remote.as_ref(), remote.as_ref(), "guardian").await;
    let (id, first) = create(remote.as_ref(), remote.as_ref(), "doc").await;
    let mut guarded = Update::head(id.clone(), first.clone());
    guarded.details.guardian_id = Some(guardian.clone());
    remote.update_perspective(guarded).await.expect("set guardian");

    let client = ClientCachedWithBase::new(remote.clone(), hasher(), "app");
    let (data, next) = content("local", &[&first], 2);
    client
        .update(EveesMutation {
            updates: vec![Update::head(id.clone(), next.id.clone()).with_old_head(Some(first))],
            entities: vec![data, next.clone()],
            ..EveesMutation::default()
        })
        .await
        .expect("buffer without reading");

    let details = client
        .get_perspective(&id, GetPerspectiveOptions::default())
        .await
        .expect("get")
        .details;
    assert_eq!(details.head_id, Some(next.id));
    assert_eq!(details.guardian_id, Some(guardian));
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn router_dispatches_by_owner() {
    let home = memory("home");
    let work = memory("work");
    let router = Arc::new(BaseRouter::new(
        vec![
            home.clone() as Arc<dyn RemoteEvees>,
            work.clone() as Arc<dyn RemoteEvees>,
        ],
        hasher(),
        Duration::from_secs(1),
    ));
    let client = ClientCachedWithBase::new(router.clone(), hasher(), "app");

    let (home_id, home_head) = create(&client, home.as_ref(), "h").await;
    let (work_id, work_head) = create(&client, work.as_ref(), "w").await;
    client.flush().await.expect("flush");

    assert_eq!(head(home.as_ref(), &home_id).await, Some(home_head));
    assert_eq!(head(work.as_ref(), &work_id).await, Some(work_head.clone()));
    assert!(home
        .get_perspective(&work_id, GetPerspectiveOptions::default())
        .await
        .is_err());
    assert_eq!(head(router.as_ref(), &work_id).await, Some(work_head));
}

#[tokio::test]
async fn unregistered_remote_is_a_routing_error() {
    let home = memory("home");
    let stray = memory("stray");
    let router = BaseRouter::new(
        vec![home.clone() as Arc<dyn RemoteEvees>],
        hasher(),
        Duration::from_secs(1),
    );

    let perspective = snap(stray.as_ref(), "x").await;
    let err = router
        .update(EveesMutation {
            new_perspectives: vec![NewPerspective {
                perspective,
                update: None,
            }],
            ..EveesMutation::default()
        })
        .await
        .expect_err("no such remote");
    assert!(matches!(err, EveesError::UnresolvableRemote { .. }));
}

// ---------------------------------------------------------------------------
// SQLite base
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_base_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("evees.db");

    let (id, first) = {
        let remote = Arc::new(SqliteRemote::open(&path, "local", hasher()).expect("open"));
        remote.login("alice").await.expect("login");
        let client = ClientCachedWithBase::new(remote.clone(), hasher(), "app");
        let created = create(&client, remote.as_ref(), "doc").await;
        client.flush().await.expect("flush");
        created
    };

    let reopened = SqliteRemote::open(&path, "local", hasher()).expect("reopen");
    assert_eq!(head(&reopened, &id).await, Some(first.clone()));
    let commit = cas::load::<Commit>(reopened.store().as_ref(), &first)
        .await
        .expect("commit");
    assert_eq!(
        reopened
            .perspectives_with_data(&commit.object.data_id)
            .expect("by data"),
        vec![id]
    );
}
