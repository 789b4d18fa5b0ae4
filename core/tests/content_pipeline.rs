#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Content executor scenarios: creation, update-in-place, overflow splits,
//! and recovery — driven against the recording platform double.

use std::sync::Arc;

use coderelay_core::executor::content::ContentExecutor;
use coderelay_core::executor::task_list::TaskListExecutor;
use coderelay_core::post_tracker::PostTracker;
use core_test_support::FailKind;
use core_test_support::RecordingClient;
use pretty_assertions::assert_eq;
use tokio::sync::Mutex;

fn fixtures(
    client: &Arc<RecordingClient>,
) -> (ContentExecutor, TaskListExecutor, Arc<Mutex<PostTracker>>) {
    let tracker = Arc::new(Mutex::new(PostTracker::new()));
    let (content, _flush_rx) = ContentExecutor::new(
        "mm:T1".to_string(),
        "T1".to_string(),
        client.clone(),
        tracker.clone(),
    );
    let task_list = TaskListExecutor::new(
        "mm:T1".to_string(),
        "T1".to_string(),
        client.clone(),
        tracker.clone(),
    );
    (content, task_list, tracker)
}

#[tokio::test]
async fn append_flush_then_update_in_place() {
    let client = RecordingClient::new(16_000);
    let (mut content, task_list, _tracker) = fixtures(&client);

    content.append("Hello", false);
    content.flush(&task_list).await.unwrap();
    assert_eq!(client.live_bodies().await, vec!["Hello".to_string()]);

    content.append("World", false);
    content.flush(&task_list).await.unwrap();
    assert_eq!(
        client.live_bodies().await,
        vec!["Hello\n\nWorld".to_string()]
    );
    // Still one post; the second flush was an update.
    assert_eq!(client.create_count().await, 1);
}

#[tokio::test]
async fn overflow_splits_into_a_second_post() {
    let client = RecordingClient::new(100);
    let (mut content, task_list, _tracker) = fixtures(&client);

    let a = "A".repeat(60);
    let b = "B".repeat(60);
    content.append(&a, false);
    content.flush(&task_list).await.unwrap();
    content.append(&b, false);
    content.flush(&task_list).await.unwrap();

    let bodies = client.live_bodies().await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0].trim_end(), a);
    assert_eq!(bodies[1], b);

    // No single create or update ever exceeded the hard limit.
    for post in client.posts().await {
        for body in &post.history {
            assert!(body.len() <= 100, "body of {} bytes posted", body.len());
        }
    }
}

#[tokio::test]
async fn bytes_arriving_between_flushes_appear_exactly_once() {
    let client = RecordingClient::new(16_000);
    let (mut content, task_list, _tracker) = fixtures(&client);

    content.append("first chunk", false);
    content.flush(&task_list).await.unwrap();

    // New bytes land after the update returned; they must show up in the
    // very next flush, once.
    content.append("second chunk", false);
    content.flush(&task_list).await.unwrap();

    let bodies = client.live_bodies().await;
    assert_eq!(bodies, vec!["first chunk\n\nsecond chunk".to_string()]);
    let body = &bodies[0];
    assert_eq!(body.matches("second chunk").count(), 1);
}

#[tokio::test]
async fn no_byte_loss_across_many_appends_and_splits() {
    let client = RecordingClient::new(300);
    let (mut content, task_list, _tracker) = fixtures(&client);

    let chunks: Vec<String> = (0..20)
        .map(|i| format!("chunk-{i} {}\n", "x".repeat(40)))
        .collect();
    for (i, chunk) in chunks.iter().enumerate() {
        content.append(chunk, i % 3 == 0);
        if i % 4 == 3 {
            content.flush(&task_list).await.unwrap();
        }
    }
    content.flush(&task_list).await.unwrap();

    let all = client.live_bodies().await.join("");
    for (i, _) in chunks.iter().enumerate() {
        let marker = format!("chunk-{i} ");
        assert_eq!(all.matches(&marker).count(), 1, "marker {i} lost or duplicated");
    }
}

#[tokio::test]
async fn post_gone_on_update_reopens_the_chain() {
    let client = RecordingClient::new(16_000);
    let (mut content, task_list, _tracker) = fixtures(&client);

    content.append("one", false);
    content.flush(&task_list).await.unwrap();

    client.fail_next_update(FailKind::PostGone).await;
    content.append("two", false);
    content.flush(&task_list).await.unwrap();

    let bodies = client.live_bodies().await;
    assert_eq!(bodies, vec!["one".to_string(), "two".to_string()]);

    // Nothing left pending.
    assert!(!content.has_pending());
}

#[tokio::test]
async fn message_too_long_is_recovered_like_post_gone() {
    let client = RecordingClient::new(16_000);
    let (mut content, task_list, _tracker) = fixtures(&client);

    content.append("alpha", false);
    content.flush(&task_list).await.unwrap();

    client.fail_next_update(FailKind::TooLong).await;
    content.append("beta", false);
    content.flush(&task_list).await.unwrap();

    assert_eq!(
        client.live_bodies().await,
        vec!["alpha".to_string(), "beta".to_string()]
    );
}

#[tokio::test]
async fn flush_on_empty_buffer_is_a_no_op() {
    let client = RecordingClient::new(16_000);
    let (mut content, task_list, _tracker) = fixtures(&client);

    content.flush(&task_list).await.unwrap();
    assert_eq!(client.create_count().await, 0);
    assert!(client.log().await.is_empty());
}

#[tokio::test]
async fn open_fence_is_never_split() {
    let client = RecordingClient::new(300);
    let (mut content, task_list, _tracker) = fixtures(&client);

    // Prose first, then a fence that would straddle the limit: the split
    // must land at the paragraph boundary before the fence opens.
    let prose = format!("{}\n", format!("{}\n", "p".repeat(60)).repeat(4));
    content.append(&prose, false);
    let fence = format!("```\n{}```", "code line\n".repeat(20));
    content.append(&fence, true);
    content.flush(&task_list).await.unwrap();

    let posts = client.posts().await;
    assert!(posts.len() >= 2);
    for post in posts {
        let opens = post.body.matches("```").count();
        assert_eq!(opens % 2, 0, "post left a fence dangling: {:?}", post.body);
    }
}
