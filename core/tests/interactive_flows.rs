#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Question sets, approvals, and cross-user message approval, driven
//! through the message manager the way reactions arrive at runtime.

use std::sync::Arc;

use coderelay_core::message_manager::MessageManager;
use coderelay_core::post_tracker::PostTracker;
use coderelay_platform::ReactionAction;
use coderelay_protocol::agent::AgentEvent;
use coderelay_protocol::manager_event::ManagerEvent;
use coderelay_protocol::manager_event::MessageApprovalDecision;
use coderelay_protocol::operation::ApprovalKind;
use core_test_support::RecordingClient;
use pretty_assertions::assert_eq;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

fn manager(
    client: &Arc<RecordingClient>,
) -> (MessageManager, mpsc::UnboundedReceiver<ManagerEvent>) {
    let tracker = Arc::new(Mutex::new(PostTracker::new()));
    let (mut manager, _flush_rx) = MessageManager::new(
        "mm:T1".to_string(),
        "T1".to_string(),
        client.clone(),
        tracker,
        "U_OWNER".to_string(),
        None,
        false,
    );
    let events = manager.subscribe();
    (manager, events)
}

fn question_event() -> AgentEvent {
    let line = r#"{"type":"tool_use","tool_use":{"id":"q1","name":"AskUserQuestion","input":{
        "questions":[
            {"header":"Scope","question":"Which part?","options":[
                {"label":"parser","description":"the parser"},
                {"label":"lexer"}
            ]},
            {"header":"Depth","question":"How deep?","options":[
                {"label":"quick"},
                {"label":"thorough"}
            ]}
        ]
    }}}"#;
    AgentEvent::parse_line(line).unwrap().unwrap()
}

#[tokio::test]
async fn question_set_completes_after_all_answers() {
    let client = RecordingClient::new(16_000);
    let (mut manager, mut events) = manager(&client);

    manager.handle_event(&question_event()).await.unwrap();

    let posts = client.posts().await;
    assert_eq!(posts.len(), 1);
    let post_id = posts[0].id.clone();
    assert!(posts[0].body.contains("Question 1/2"));
    assert!(posts[0].reactions.contains("one"));
    assert!(posts[0].reactions.contains("two"));

    // Owner answers question 1 with option 2.
    manager
        .handle_reaction(&post_id, "two", ReactionAction::Added, "U_OWNER")
        .await
        .unwrap();
    assert!(client.post(&post_id).await.unwrap().body.contains("Question 2/2"));
    assert!(events.try_recv().is_err(), "no completion mid-set");

    // An unauthorized reaction in between is ignored.
    manager
        .handle_reaction(&post_id, "one", ReactionAction::Added, "U_RANDO")
        .await
        .unwrap();
    assert!(client.post(&post_id).await.unwrap().body.contains("Question 2/2"));
    assert!(events.try_recv().is_err());

    // Owner answers question 2 with option 1: exactly one completion.
    manager
        .handle_reaction(&post_id, "one", ReactionAction::Added, "U_OWNER")
        .await
        .unwrap();
    let event = events.try_recv().unwrap();
    let ManagerEvent::QuestionComplete { tool_use_id, answers } = event else {
        panic!("expected question completion, got {event:?}");
    };
    assert_eq!(tool_use_id, "q1");
    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0].answer, "lexer");
    assert_eq!(answers[1].answer, "quick");
    assert!(events.try_recv().is_err(), "completion must fire once");
}

#[tokio::test]
async fn out_of_range_number_reactions_are_ignored() {
    let client = RecordingClient::new(16_000);
    let (mut manager, mut events) = manager(&client);

    manager.handle_event(&question_event()).await.unwrap();
    let post_id = client.posts().await[0].id.clone();

    manager
        .handle_reaction(&post_id, "nine", ReactionAction::Added, "U_OWNER")
        .await
        .unwrap();
    assert!(client.post(&post_id).await.unwrap().body.contains("Question 1/2"));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn plan_approval_resolves_on_owner_reaction() {
    let client = RecordingClient::new(16_000);
    let (mut manager, mut events) = manager(&client);

    let event = AgentEvent::parse_line(
        r#"{"type":"tool_use","tool_use":{"id":"plan1","name":"ExitPlanMode","input":{"plan":"1. refactor\n2. test"}}}"#,
    )
    .unwrap()
    .unwrap();
    manager.handle_event(&event).await.unwrap();

    let posts = client.posts().await;
    // Plan content post plus the approval post.
    assert_eq!(posts.len(), 2);
    assert!(posts[0].body.contains("refactor"));
    let approval_id = posts[1].id.clone();
    assert!(posts[1].reactions.contains("+1"));

    // A globally-allowed (non-owner) user may also approve.
    manager
        .handle_reaction(&approval_id, "thumbsup", ReactionAction::Added, "U_ALLY")
        .await
        .unwrap();

    let ManagerEvent::ApprovalComplete {
        tool_use_id,
        kind,
        approved,
        ..
    } = events.try_recv().unwrap()
    else {
        panic!("expected approval completion");
    };
    assert_eq!(tool_use_id, "plan1");
    assert_eq!(kind, ApprovalKind::Plan);
    assert!(approved);
    assert!(client.post(&approval_id).await.unwrap().body.contains("Approved by @ally"));
}

#[tokio::test]
async fn denial_reaction_denies_the_plan() {
    let client = RecordingClient::new(16_000);
    let (mut manager, mut events) = manager(&client);

    let event = AgentEvent::parse_line(
        r#"{"type":"tool_use","tool_use":{"id":"p2","name":"ExitPlanMode","input":{"plan":"do it"}}}"#,
    )
    .unwrap()
    .unwrap();
    manager.handle_event(&event).await.unwrap();
    let approval_id = client.posts().await.last().unwrap().id.clone();

    // Unauthorized denial keeps the waiter alive.
    manager
        .handle_reaction(&approval_id, "x", ReactionAction::Added, "U_RANDO")
        .await
        .unwrap();
    assert!(events.try_recv().is_err());

    manager
        .handle_reaction(&approval_id, "thumbsdown", ReactionAction::Added, "U_OWNER")
        .await
        .unwrap();
    let ManagerEvent::ApprovalComplete { approved, .. } = events.try_recv().unwrap() else {
        panic!("expected approval completion");
    };
    assert!(!approved);
}

#[tokio::test]
async fn cross_user_message_approval_is_owner_only() {
    let client = RecordingClient::new(16_000);
    let (mut manager, mut events) = manager(&client);

    manager
        .request_message_approval("U_RANDO", "please run the tests", vec![])
        .await
        .unwrap();
    let post_id = client.posts().await[0].id.clone();

    // Even a globally-allowed user cannot rule on it.
    manager
        .handle_reaction(&post_id, "white_check_mark", ReactionAction::Added, "U_ALLY")
        .await
        .unwrap();
    assert!(events.try_recv().is_err());

    manager
        .handle_reaction(&post_id, "white_check_mark", ReactionAction::Added, "U_OWNER")
        .await
        .unwrap();
    let ManagerEvent::MessageApprovalComplete {
        decision,
        from_user,
        message,
        ..
    } = events.try_recv().unwrap()
    else {
        panic!("expected message approval completion");
    };
    assert_eq!(decision, MessageApprovalDecision::Invite);
    assert_eq!(from_user, "U_RANDO");
    assert_eq!(message, "please run the tests");
}

#[tokio::test]
async fn reactions_on_unknown_posts_are_ignored() {
    let client = RecordingClient::new(16_000);
    let (mut manager, mut events) = manager(&client);

    manager
        .handle_reaction("nope", "+1", ReactionAction::Added, "U_OWNER")
        .await
        .unwrap();
    assert!(events.try_recv().is_err());
    assert_eq!(client.create_count().await, 0);
}
