//! Full-run tests for the agent turn loop.
//!
//! Each test drives `Agent::run_request` against a real shell and a temporary
//! repository, with the model replaced by a scripted chat client. They check
//! the terminal status, the tool results fed back to the model, the final diff
//! and the persisted transcript.

use std::sync::Arc;
use std::time::Duration;

use nano::core::invariants::validate_transcript;
use nano::core::types::{Message, Role, SessionStatus, TokenUsage, ToolCall};
use nano::io::chat::{ChatReply, ModelApiError};
use nano::io::config::NanoConfig;
use nano::io::transcript::{load_messages, load_metadata};
use nano::orchestrator::{Agent, RunOutcome, RunRequest};
use nano::test_support::{
    FixedClock, ScriptedChatClient, TestRepo, patch_call, shell_call, test_config,
};

const CALC: &str = "def value():\n    return 1\n";

fn request(repo: &TestRepo, max_turns: u32) -> RunRequest {
    RunRequest {
        problem_statement: "Make value() return 2.".to_string(),
        repo_root: repo.path().to_path_buf(),
        max_turns,
        thinking: false,
        label: None,
    }
}

fn run(client: &ScriptedChatClient, config: NanoConfig, req: &RunRequest) -> RunOutcome {
    Agent::new(client, config)
        .with_clock(Arc::new(FixedClock::default()))
        .run_request(req)
        .expect("run")
}

fn tool_messages(outcome: &RunOutcome) -> Vec<&Message> {
    outcome
        .session
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect()
}

/// Inspect, patch, stop: the canonical successful run.
///
/// ```text
/// turn 1: shell `cat calc.py`
/// turn 2: apply_patch `return 1` -> `return 2`
/// turn 3: no tool calls -> done
/// ```
#[test]
fn patch_run_ends_done_with_final_diff() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![shell_call("c1", "cat calc.py")]),
        ChatReply::with_tool_calls(vec![patch_call("c2", "calc.py", "return 1", "return 2")]),
        ChatReply::text("Changed the return value."),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 10));

    assert_eq!(outcome.status(), SessionStatus::Done);
    assert_eq!(outcome.session.turn_count(), 3);
    assert_eq!(repo.read("calc.py"), "def value():\n    return 2\n");
    assert!(outcome.final_diff.starts_with("diff --git a/calc.py b/calc.py\n"));
    assert!(outcome.final_diff.contains("-    return 1\n"));
    assert!(outcome.final_diff.contains("+    return 2\n"));

    let results = tool_messages(&outcome);
    assert_eq!(results.len(), 2);
    assert!(results[0].content.contains("return 1"));
    assert_eq!(results[0].success, Some(true));
    assert!(results[1].content.starts_with("[patch applied to calc.py]"));

    assert_eq!(outcome.metadata.tool_calls.shell, 1);
    assert_eq!(outcome.metadata.tool_calls.apply_patch, 1);
    assert_eq!(outcome.metadata.tool_calls.invalid, 0);
    assert_eq!(client.request_count(), 3);
}

/// A search string absent from the file is reported back and nothing changes.
#[test]
fn missing_search_text_is_a_tool_error_not_a_run_error() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![patch_call("c1", "calc.py", "return 3", "return 4")]),
        ChatReply::text("Giving up."),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 10));

    assert_eq!(outcome.status(), SessionStatus::Done);
    assert_eq!(repo.read("calc.py"), CALC);
    assert!(outcome.final_diff.is_empty());
    let results = tool_messages(&outcome);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].success, Some(false));
    assert!(results[0].content.contains("search string not found in calc.py"));
}

/// A model that answers without tools finishes at turn 1.
#[test]
fn immediate_stop_is_done_at_turn_one() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![ChatReply::text("")]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 10));

    assert_eq!(outcome.status(), SessionStatus::Done);
    assert_eq!(outcome.session.turn_count(), 1);
    assert!(tool_messages(&outcome).is_empty());
    assert!(outcome.final_diff.is_empty());
    assert_eq!(outcome.session.messages().len(), 3);
}

/// A model that always calls a tool is cut off after exactly `max_turns` turns.
#[test]
fn always_tool_model_is_truncated_at_max_turns() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::always_shell("pwd");

    let outcome = run(&client, test_config(out.path()), &request(&repo, 3));

    assert_eq!(outcome.status(), SessionStatus::Truncated);
    assert_eq!(outcome.session.turn_count(), 3);
    assert_eq!(client.request_count(), 3);
    assert_eq!(tool_messages(&outcome).len(), 3);
    assert_eq!(
        outcome.metadata.token_usage,
        TokenUsage {
            prompt_tokens: 30,
            completion_tokens: 6,
        }
    );
}

/// Every call in a reply gets one result, in call order, before the next request.
#[test]
fn results_follow_calls_in_order() {
    let repo = TestRepo::with_file("calc.py", CALC);
    repo.write("sub/notes.txt", "notes\n");
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![
            shell_call("a", "cd sub"),
            shell_call("b", "pwd"),
            shell_call("c", "cat notes.txt"),
        ]),
        ChatReply::text("done"),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    let results = tool_messages(&outcome);
    let ids: Vec<_> = results
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(results[1].content.trim_end().ends_with("/sub"));
    assert_eq!(results[2].content, "notes\n");

    let second_request = &client.requests()[1];
    assert_eq!(second_request.len(), 6);
    assert!(validate_transcript(outcome.session.messages()).is_empty());
}

/// A fatal endpoint error ends the run as `error` with the transcript kept.
#[test]
fn fatal_model_error_ends_run_with_error_status() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::new(vec![Err(ModelApiError::Rejected {
        status: 401,
        body: "invalid api key".to_string(),
    })]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    assert_eq!(outcome.status(), SessionStatus::Error);
    assert_eq!(outcome.session.turn_count(), 0);
    assert_eq!(client.request_count(), 1);
    let error = outcome.metadata.error.as_deref().expect("error recorded");
    assert!(error.contains("401"));

    let on_disk = load_messages(&outcome.artifacts.messages_path).expect("messages");
    assert_eq!(on_disk.len(), 2);
    let metadata = load_metadata(&outcome.artifacts.metadata_path).expect("metadata");
    assert_eq!(metadata.status, SessionStatus::Error);
}

/// Transient endpoint errors are retried within the same turn.
#[test]
fn transient_model_errors_are_retried() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::new(vec![
        Err(ModelApiError::Server {
            status: 503,
            body: "overloaded".to_string(),
        }),
        Err(ModelApiError::RateLimited {
            retry_after_secs: None,
        }),
        Ok(ChatReply::text("done")),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    assert_eq!(outcome.status(), SessionStatus::Done);
    assert_eq!(outcome.metadata.model_requests, 3);
    assert_eq!(outcome.session.turn_count(), 1);
}

/// Retries stop after `max_attempts`; the run then fails.
#[test]
fn exhausted_retries_end_run_with_error_status() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let network = || Err(ModelApiError::Network("connection refused".to_string()));
    let client = ScriptedChatClient::new(vec![network(), network(), network(), network()]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    assert_eq!(outcome.status(), SessionStatus::Error);
    assert_eq!(client.request_count(), 3);
}

/// A repeated call id is rejected; the first occurrence still runs.
#[test]
fn duplicate_call_ids_reject_only_the_repeat() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![shell_call("dup", "ls"), shell_call("dup", "pwd")]),
        ChatReply::text("done"),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    let results = tool_messages(&outcome);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].success, Some(true));
    assert!(results[0].content.contains("calc.py"));
    assert_eq!(results[1].success, Some(false));
    assert!(results[1].content.contains("duplicate tool call id `dup`"));
    assert_eq!(outcome.metadata.tool_calls.shell, 1);
    assert_eq!(outcome.metadata.tool_calls.invalid, 1);
}

/// Unknown tools and undecodable arguments become error results.
#[test]
fn malformed_calls_become_error_results() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![
            ToolCall::new("c1", "write_file", r#"{"path":"x"}"#),
            ToolCall::new("c2", "shell", "not json"),
        ]),
        ChatReply::text("done"),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    assert_eq!(outcome.status(), SessionStatus::Done);
    let results = tool_messages(&outcome);
    assert!(results[0].content.contains("unknown tool `write_file`"));
    assert!(results[1].content.contains("not valid JSON"));
    assert_eq!(outcome.metadata.tool_calls.invalid, 2);
}

/// A call without a function name is answered like any unknown tool.
#[test]
fn nameless_call_is_an_unknown_tool_result() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![
            ToolCall::new("c1", "", "{}"),
            shell_call("c2", "ls"),
        ]),
        ChatReply::text("done"),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    assert_eq!(outcome.status(), SessionStatus::Done);
    let results = tool_messages(&outcome);
    assert_eq!(results.len(), 2);
    assert!(results[0].content.contains("unknown tool ``"));
    assert_eq!(results[1].success, Some(true));
    assert_eq!(outcome.metadata.tool_calls.invalid, 1);
    assert_eq!(outcome.metadata.tool_calls.shell, 1);
}

/// Calls without an id get one, and results reference it.
#[test]
fn id_less_calls_are_given_ids_results_can_reference() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![shell_call("", "ls"), shell_call("", "pwd")]),
        ChatReply::text("done"),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    assert_eq!(outcome.status(), SessionStatus::Done);
    let sent = &client.requests()[1];
    let ids: Vec<&str> = sent[2].tool_calls.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["call_1_0", "call_1_1"]);
    assert_eq!(sent[3].tool_call_id.as_deref(), Some("call_1_0"));
    assert_eq!(sent[4].tool_call_id.as_deref(), Some("call_1_1"));
    assert_eq!(sent[3].success, Some(true));
    assert_eq!(outcome.metadata.tool_calls.invalid, 0);
}

/// Commands outside the read-only set are refused without ending the run.
#[test]
fn sandbox_violations_are_reported_to_the_model() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![
            shell_call("c1", "rm calc.py"),
            shell_call("c2", "echo hi > calc.py"),
        ]),
        ChatReply::text("done"),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    let results = tool_messages(&outcome);
    assert!(results.iter().all(|m| m.success == Some(false)));
    assert!(results[0].content.starts_with("[sandbox violation:"));
    assert_eq!(repo.read("calc.py"), CALC);
}

/// Tool results carry a warning once few turns remain.
#[test]
fn remaining_turn_warning_is_prefixed_near_the_limit() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(out.path());
    config.run.remaining_turns_warning = 2;
    let client = ScriptedChatClient::always_shell("pwd");

    let outcome = run(&client, config, &request(&repo, 4));

    let results = tool_messages(&outcome);
    assert_eq!(results.len(), 4);
    assert!(!results[0].content.contains("SYSTEM WARNING"));
    assert!(!results[1].content.contains("SYSTEM WARNING"));
    assert!(
        results[2]
            .content
            .starts_with("[SYSTEM WARNING: Only 1 turns remaining. Finish your task soon]\n")
    );
    assert!(
        results[3]
            .content
            .starts_with("[SYSTEM WARNING: Only 0 turns remaining.")
    );
}

/// Long tool output is capped with a visible notice.
#[test]
fn tool_output_is_capped() {
    let repo = TestRepo::with_file("big.txt", &"x".repeat(1_500));
    let out = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(out.path());
    config.run.tool_output_limit_bytes = 100;
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![shell_call("c1", "cat big.txt")]),
        ChatReply::text("done"),
    ]);

    let outcome = run(&client, config, &request(&repo, 5));

    let results = tool_messages(&outcome);
    assert!(results[0].content.starts_with(&"x".repeat(100)));
    assert!(results[0].content.ends_with("[tool output truncated 1400 bytes]"));
}

/// The transcript on disk matches the in-memory session.
#[test]
fn transcript_artifacts_are_complete() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply {
            reasoning: Some("look first".to_string()),
            ..ChatReply::with_tool_calls(vec![shell_call("c1", "ls")])
        },
        ChatReply::text("done"),
    ]);
    let mut req = request(&repo, 5);
    req.label = Some("case one".to_string());

    let outcome = run(&client, test_config(out.path()), &req);

    assert_eq!(
        outcome.artifacts.dir,
        out.path().join("20260102T030405.000Z-case_one")
    );
    let on_disk = load_messages(&outcome.artifacts.messages_path).expect("messages");
    assert_eq!(on_disk, outcome.session.messages());
    assert_eq!(on_disk[2].reasoning.as_deref(), Some("look first"));
    let metadata = load_metadata(&outcome.artifacts.metadata_path).expect("metadata");
    assert_eq!(metadata, outcome.metadata);
    assert_eq!(metadata.turns, 2);
    assert!(outcome.artifacts.tools_path.is_file());
}

/// Two runs with the same session id cannot share an output directory.
#[test]
fn session_directory_collision_is_a_setup_error() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![ChatReply::text("a"), ChatReply::text("b")]);
    let agent =
        Agent::new(&client, test_config(out.path())).with_clock(Arc::new(FixedClock::default()));

    agent.run_request(&request(&repo, 5)).expect("first run");
    let err = agent
        .run_request(&request(&repo, 5))
        .expect_err("second run");
    assert!(format!("{err:#}").contains("already exists"));
}

#[test]
fn missing_repository_is_a_setup_error() {
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![ChatReply::text("done")]);
    let agent = Agent::new(&client, test_config(out.path()));
    let err = agent
        .run(
            "fix it",
            &out.path().join("does-not-exist"),
            5,
            false,
        )
        .expect_err("missing repo");
    assert!(format!("{err:#}").contains("resolve repository root"));
    assert_eq!(client.request_count(), 0);
}

/// A slow endpoint runs the wall-clock budget out before the turn limit.
#[test]
fn wall_clock_budget_truncates_the_run() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(out.path());
    config.run.max_run_secs = Some(1);
    let client = ScriptedChatClient::always_shell("echo $$").with_delay(Duration::from_millis(1_200));

    let outcome = run(&client, config, &request(&repo, 10));

    assert_eq!(outcome.status(), SessionStatus::Truncated);
    assert_eq!(outcome.metadata.turns, 1);
    assert_eq!(client.request_count(), 1);
    assert_eq!(tool_messages(&outcome).len(), 1);
    #[cfg(target_os = "linux")]
    assert_shell_is_gone(&outcome);
}

/// The shell process does not outlive the run.
#[cfg(target_os = "linux")]
#[test]
fn shell_process_is_reaped_when_the_run_ends() {
    let repo = TestRepo::with_file("calc.py", CALC);
    let out = tempfile::tempdir().expect("tempdir");
    let client = ScriptedChatClient::replies(vec![
        ChatReply::with_tool_calls(vec![shell_call("c1", "echo $$")]),
        ChatReply::text("done"),
    ]);

    let outcome = run(&client, test_config(out.path()), &request(&repo, 5));

    assert_eq!(outcome.status(), SessionStatus::Done);
    assert_shell_is_gone(&outcome);
}

/// The first tool result holds the pid printed by `echo $$`.
#[cfg(target_os = "linux")]
fn assert_shell_is_gone(outcome: &RunOutcome) {
    let results = tool_messages(outcome);
    let pid: u32 = results[0].content.trim().parse().expect("shell pid");
    assert!(
        !std::path::Path::new(&format!("/proc/{pid}")).exists(),
        "shell {pid} still running"
    );
}
