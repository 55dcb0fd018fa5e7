//! End-to-end merges through the facade over a layered client: forks,
//! recursive child merges, fast-forwards and flushing the result.

use std::sync::Arc;

use evees_core::client::{Client, ClientCachedWithBase};
use evees_core::config::EveesConfig;
use evees_core::merge::{MergeOutcome, Side};
use evees_core::remote::{MemoryRemote, RemoteEvees};
use evees_core::{Evees, EveesContext, Hasher};
use serde_json::{Value, json};

struct Fixture {
    evees: Evees,
    remote: Arc<MemoryRemote>,
    client: Arc<ClientCachedWithBase>,
}

fn fixture(config: EveesConfig) -> Fixture {
    let remote = Arc::new(MemoryRemote::with_user("local", Hasher::default(), "alice"));
    let client = Arc::new(ClientCachedWithBase::new(
        remote.clone(),
        Hasher::default(),
        "app",
    ));
    let ctx = EveesContext::new(
        client.clone(),
        vec![remote.clone() as Arc<dyn RemoteEvees>],
        config,
    );
    Fixture {
        evees: Evees::new(ctx),
        remote,
        client,
    }
}

fn node(text: &str, links: &[&str]) -> Value {
    json!({"type": "TextNode", "text": text, "links": links})
}

async fn data(evees: &Evees, id: &str) -> Value {
    evees
        .get_perspective_data(id)
        .await
        .expect("read")
        .expect("has data")
        .object
}

async fn head(evees: &Evees, id: &str) -> String {
    evees
        .get_perspective_details(id)
        .await
        .expect("details")
        .head_id
        .expect("head")
}

#[tokio::test]
async fn fork_adds_child_and_merges_back() {
    let fx = fixture(EveesConfig::default());
    let evees = &fx.evees;

    let doc = evees.create_evee(node("root", &[]), None, None).await.expect("doc");
    let a = evees
        .create_evee(node("a", &[]), None, Some(&doc))
        .await
        .expect("child a");
    let fork = evees.fork_perspective(&doc, None).await.expect("fork");
    assert_eq!(head(evees, &fork).await, head(evees, &doc).await);

    let b = evees
        .create_evee(node("b", &[]), None, Some(&fork))
        .await
        .expect("child b");
    evees
        .update_perspective_data(&doc, node("root v2", &[a.as_str()]), None)
        .await
        .expect("edit doc");
    let doc_head = head(evees, &doc).await;
    let fork_head = head(evees, &fork).await;

    let outcome = evees.merge_perspectives(&doc, &fork).await.expect("merge");
    let MergeOutcome::Merged(merge_head) = outcome else {
        panic!("expected a merge commit, got {outcome:?}");
    };

    assert_eq!(data(evees, &doc).await, node("root v2", &[a.as_str(), b.as_str()]));
    let history = evees.history(&doc, 1).await.expect("history");
    assert_eq!(history[0].id, merge_head);
    assert_eq!(history[0].object.parents_ids, vec![doc_head, fork_head.clone()]);

    // The fork is untouched.
    assert_eq!(head(evees, &fork).await, fork_head);

    // Nothing reached the remote until now.
    assert!(fx.remote.ecosystem_parents(&b).is_empty());
    evees.flush().await.expect("flush");
    assert!(fx.client.diff().await.expect("diff").is_empty());

    assert_eq!(
        fx.remote.ecosystem_parents(&b),
        {
            let mut expected = vec![doc.clone(), fork.clone()];
            expected.sort();
            expected
        }
    );
    let remote_head = evees_core::client::head_of(fx.remote.as_ref(), &doc)
        .await
        .expect("remote head");
    assert_eq!(remote_head, Some(merge_head));
}

#[tokio::test]
async fn forked_children_merge_recursively() {
    let fx = fixture(EveesConfig::default());
    let evees = &fx.evees;

    let doc = evees.create_evee(node("root", &[]), None, None).await.expect("doc");
    let a = evees
        .create_evee(node("a", &[]), None, Some(&doc))
        .await
        .expect("child a");
    let doc_head = head(evees, &doc).await;

    // Fork both levels and point the forked parent at the forked child.
    let fork = evees.fork_perspective(&doc, None).await.expect("fork doc");
    let fork_a = evees.fork_perspective(&a, None).await.expect("fork a");
    evees
        .update_perspective_data(&fork, node("root", &[fork_a.as_str()]), None)
        .await
        .expect("relink");
    evees
        .update_perspective_data(&fork_a, node("a edited", &[]), None)
        .await
        .expect("edit fork a");
    let fork_a_head = head(evees, &fork_a).await;

    let outcome = evees.merge_perspectives(&doc, &fork).await.expect("merge");

    // The parent keeps linking to its own child, which caught up.
    assert_eq!(outcome, MergeOutcome::Unchanged(Some(doc_head.clone())));
    assert_eq!(head(evees, &doc).await, doc_head);
    assert_eq!(data(evees, &doc).await, node("root", &[a.as_str()]));
    assert_eq!(head(evees, &a).await, fork_a_head);
    assert_eq!(data(evees, &a).await, node("a edited", &[]));
}

#[tokio::test]
async fn without_recursion_children_stay_put() {
    let mut config = EveesConfig::default();
    config.merge.recurse = false;
    let fx = fixture(config);
    let evees = &fx.evees;

    let doc = evees.create_evee(node("root", &[]), None, None).await.expect("doc");
    let a = evees
        .create_evee(node("a", &[]), None, Some(&doc))
        .await
        .expect("child a");
    let a_head = head(evees, &a).await;

    let fork = evees.fork_perspective(&doc, None).await.expect("fork doc");
    let fork_a = evees.fork_perspective(&a, None).await.expect("fork a");
    evees
        .update_perspective_data(&fork, node("root", &[fork_a.as_str()]), None)
        .await
        .expect("relink");
    evees
        .update_perspective_data(&fork_a, node("a edited", &[]), None)
        .await
        .expect("edit fork a");

    evees.merge_perspectives(&doc, &fork).await.expect("merge");
    assert_eq!(head(evees, &a).await, a_head);
}

#[tokio::test]
async fn behind_target_fast_forwards_then_noops() {
    let fx = fixture(EveesConfig::default());
    let evees = &fx.evees;

    let doc = evees.create_evee(node("v1", &[]), None, None).await.expect("doc");
    let fork = evees.fork_perspective(&doc, None).await.expect("fork");
    let ahead = evees
        .update_perspective_data(&fork, node("v2", &[]), None)
        .await
        .expect("advance fork");

    let outcome = evees.merge_perspectives(&doc, &fork).await.expect("merge");
    assert_eq!(outcome, MergeOutcome::FastForward(ahead.clone()));
    assert_eq!(head(evees, &doc).await, ahead);

    let again = evees.merge_perspectives(&doc, &fork).await.expect("merge again");
    assert!(!again.changed());
    assert_eq!(again.head(), Some(ahead.as_str()));
}

#[tokio::test]
async fn conflicting_text_follows_the_configured_winner() {
    for (winner, expected) in [(Side::From, "theirs"), (Side::To, "ours")] {
        let mut config = EveesConfig::default();
        config.merge.winner = winner;
        let fx = fixture(config);
        let evees = &fx.evees;

        let doc = evees.create_evee(node("base", &[]), None, None).await.expect("doc");
        let fork = evees.fork_perspective(&doc, None).await.expect("fork");
        evees
            .update_perspective_data(&doc, node("ours", &[]), None)
            .await
            .expect("ours");
        evees
            .update_perspective_data(&fork, node("theirs", &[]), None)
            .await
            .expect("theirs");

        evees.merge_perspectives(&doc, &fork).await.expect("merge");
        assert_eq!(data(evees, &doc).await["text"], json!(expected), "{winner:?}");
    }
}

#[tokio::test]
async fn condensed_merge_history_reaches_remote() {
    let fx = fixture(EveesConfig::default());
    let evees = &fx.evees;

    let doc = evees.create_evee(node("v0", &[]), None, None).await.expect("doc");
    evees.flush().await.expect("publish doc");
    let published = head(evees, &doc).await;

    for step in 1..=3 {
        evees
            .update_perspective_data(&doc, node(&format!("v{step}"), &[]), None)
            .await
            .expect("edit");
    }
    evees.condense_pending().await.expect("condense");

    let remote_head = evees_core::client::head_of(fx.remote.as_ref(), &doc)
        .await
        .expect("remote head")
        .expect("has head");
    let squashed = evees_core::client::load_commit(fx.remote.as_ref(), &remote_head)
        .await
        .expect("squashed commit");
    assert_eq!(squashed.object.parents_ids, vec![published]);
    assert_eq!(data(evees, &doc).await, node("v3", &[]));
    assert!(fx.client.diff().await.expect("diff").is_empty());
}
