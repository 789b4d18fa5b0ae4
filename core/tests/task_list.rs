#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Task-post lifecycle: create-and-pin, progress updates, minimize,
//! terminal completion, and both bump shapes.

use std::sync::Arc;

use coderelay_core::executor::content::ContentExecutor;
use coderelay_core::executor::task_list::TaskListExecutor;
use coderelay_core::post_tracker::PostKind;
use coderelay_core::post_tracker::PostTracker;
use coderelay_platform::ReactionAction;
use coderelay_protocol::operation::TaskItem;
use coderelay_protocol::operation::TaskStatus;
use core_test_support::RecordingClient;
use pretty_assertions::assert_eq;
use tokio::sync::Mutex;

fn task(content: &str, status: TaskStatus) -> TaskItem {
    TaskItem {
        content: content.to_string(),
        status,
        active_form: None,
    }
}

fn fixtures(
    client: &Arc<RecordingClient>,
) -> (TaskListExecutor, Arc<Mutex<PostTracker>>) {
    let tracker = Arc::new(Mutex::new(PostTracker::new()));
    let task_list = TaskListExecutor::new(
        "mm:T1".to_string(),
        "T1".to_string(),
        client.clone(),
        tracker.clone(),
    );
    (task_list, tracker)
}

#[tokio::test]
async fn update_creates_then_updates_one_pinned_post() {
    let client = RecordingClient::new(16_000);
    let (task_list, tracker) = fixtures(&client);

    task_list
        .update(&[
            task("a", TaskStatus::Pending),
            task("b", TaskStatus::InProgress),
            task("c", TaskStatus::Pending),
        ])
        .await
        .unwrap();

    let posts = client.posts().await;
    assert_eq!(posts.len(), 1);
    assert!(posts[0].pinned);
    assert!(posts[0].body.contains("Tasks (0/3"));
    assert!(posts[0].reactions.contains("arrow_down_small"));
    assert_eq!(
        tracker.lock().await.lookup(&posts[0].id).map(|e| e.kind),
        Some(PostKind::Task)
    );

    task_list
        .update(&[
            task("a", TaskStatus::Completed),
            task("b", TaskStatus::Completed),
            task("c", TaskStatus::InProgress),
        ])
        .await
        .unwrap();

    let posts = client.posts().await;
    assert_eq!(posts.len(), 1, "second update must not create a post");
    assert!(posts[0].body.contains("Tasks (2/3"));
}

#[tokio::test]
async fn minimize_is_idempotent_and_restores() {
    let client = RecordingClient::new(16_000);
    let (task_list, _tracker) = fixtures(&client);

    task_list
        .update(&[
            task("a", TaskStatus::Completed),
            task("b", TaskStatus::InProgress),
        ])
        .await
        .unwrap();
    let post_id = client.posts().await[0].id.clone();
    let full_body = client.post(&post_id).await.unwrap().body;

    task_list
        .toggle_minimize(ReactionAction::Added)
        .await
        .unwrap();
    let minimized = client.post(&post_id).await.unwrap().body;
    assert!(minimized.contains("Tasks (1/2"));
    assert!(!minimized.contains("✅"), "minimized view hides done items");

    let updates_before = client.log().await.len();
    task_list
        .toggle_minimize(ReactionAction::Added)
        .await
        .unwrap();
    assert_eq!(
        client.log().await.len(),
        updates_before,
        "repeated minimize must not touch the platform"
    );

    task_list
        .toggle_minimize(ReactionAction::Removed)
        .await
        .unwrap();
    assert_eq!(client.post(&post_id).await.unwrap().body, full_body);
}

#[tokio::test]
async fn completion_is_terminal() {
    let client = RecordingClient::new(16_000);
    let (task_list, _tracker) = fixtures(&client);

    task_list
        .update(&[task("a", TaskStatus::InProgress)])
        .await
        .unwrap();
    task_list
        .complete(&[task("a", TaskStatus::Completed)])
        .await
        .unwrap();

    let post = client.posts().await[0].clone();
    assert!(!post.pinned, "completed task post must be unpinned");
    assert!(post.body.contains("~~"));

    // Monotonic: no mutation after completion.
    let log_before = client.log().await;
    task_list
        .update(&[task("z", TaskStatus::Pending)])
        .await
        .unwrap();
    task_list
        .toggle_minimize(ReactionAction::Added)
        .await
        .unwrap();
    task_list.on_bump_to_bottom().await.unwrap();
    assert_eq!(
        task_list.on_bump_task_list("new content").await.unwrap(),
        None
    );
    assert_eq!(client.log().await, log_before);
}

#[tokio::test]
async fn new_content_post_repurposes_the_task_post() {
    let client = RecordingClient::new(16_000);
    let (task_list, tracker) = fixtures(&client);
    let (mut content, _flush_rx) = ContentExecutor::new(
        "mm:T1".to_string(),
        "T1".to_string(),
        client.clone(),
        tracker.clone(),
    );

    task_list
        .update(&[task("a", TaskStatus::InProgress)])
        .await
        .unwrap();
    let old_task_post = client.posts().await[0].id.clone();

    content.append("fresh agent output", false);
    content.flush(&task_list).await.unwrap();

    // The old task post now carries the content and lost its toggle.
    let old = client.post(&old_task_post).await.unwrap();
    assert_eq!(old.body, "fresh agent output");
    assert!(!old.reactions.contains("arrow_down_small"));
    assert_eq!(
        tracker.lock().await.lookup(&old_task_post).map(|e| e.kind),
        Some(PostKind::Content)
    );

    // A fresh task post exists at the bottom, pinned, with the same body.
    let posts = client.posts().await;
    assert_eq!(posts.len(), 2);
    let fresh = posts.last().unwrap();
    assert!(fresh.pinned);
    assert!(fresh.body.contains("Tasks (0/1"));
    assert_eq!(
        tracker.lock().await.lookup(&fresh.id).map(|e| e.kind),
        Some(PostKind::Task)
    );
}

#[tokio::test]
async fn bump_to_bottom_recreates_preserving_body() {
    let client = RecordingClient::new(16_000);
    let (task_list, _tracker) = fixtures(&client);

    task_list
        .update(&[task("a", TaskStatus::InProgress)])
        .await
        .unwrap();
    let first = client.posts().await[0].clone();

    task_list.on_bump_to_bottom().await.unwrap();

    let posts = client.posts().await;
    assert!(posts[0].deleted);
    let fresh = posts.last().unwrap();
    assert!(!fresh.deleted);
    assert_eq!(fresh.body, first.body);
    assert!(fresh.pinned);
}
