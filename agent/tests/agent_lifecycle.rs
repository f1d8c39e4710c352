//! End-to-end runs of the orchestrator against a scripted chat model.
//!
//! Each test drives `run_input`/`run_pending` over a temporary working
//! directory and checks files on disk, the requests the model saw, and how
//! the run stopped.

use agent::core::conversation::Role;
use agent::core::types::AgentState;
use agent::io::history_store::load_snapshot;
use agent::orchestrator::{CycleEvent, LoopStop};
use agent::test_support::{
    ScriptedChatModel, Step, TEST_SYSTEM_PROMPT, TempWorkspace, fast_config, read_file, write_file,
};

fn request_texts(model: &ScriptedChatModel, index: usize) -> Vec<String> {
    model.requests()[index]
        .messages
        .iter()
        .map(|message| message.content.text())
        .collect()
}

#[test]
fn write_file_directive_writes_and_reports_back() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new([
        "Creating the file.\n[[WRITE_FILE a.txt]]\n```text\nhello\n```",
        "It is written.\n[[FINISHED]]",
    ]);
    let mut agent = ws.orchestrator(fast_config(), &model);

    let outcome = agent.run_input("write hello to a.txt", |_| {});

    assert_eq!(outcome.stop, LoopStop::Finished);
    assert_eq!(outcome.cycles, 2);
    assert_eq!(read_file(ws.workdir(), "a.txt"), "hello");

    let second = request_texts(&model, 1);
    assert!(second.iter().any(|text| text == "File written to a.txt."));
    assert!(second.iter().any(|text| text.ends_with("\n[[OBSERVE]]")));
    assert_eq!(model.requests()[0].stop, vec!["[[OBSERVE]]".to_string()]);
    assert_eq!(agent.agent_state(), AgentState::Idle);
}

#[test]
fn ambiguous_merge_leaves_file_unchanged() {
    let ws = TempWorkspace::new().expect("workspace");
    let workdir = ws.workdir();
    write_file(workdir, "m.py", "x = 1\nprint(x)\nx = 1\n");
    let model = ScriptedChatModel::new([
        "[[MERGE_FILE m.py]]\n```python\nx = 1\n```\n```python\nx = 2\n```",
    ]);
    let mut agent = ws.orchestrator(fast_config(), &model);

    let mut outcomes = Vec::new();
    agent.run_input("bump x", |event| {
        if let CycleEvent::Outcome(message) = event {
            outcomes.push(message.content.text());
        }
    });

    assert_eq!(
        outcomes,
        vec!["Error in MERGE_FILE: The code block to be replaced was found 2 times in the file but should be unique."]
    );
    assert_eq!(read_file(workdir, "m.py"), "x = 1\nprint(x)\nx = 1\n");
}

#[test]
fn autonomous_limit_stops_a_chatty_model() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new(["Let me think.", "Still thinking.", "Hmm.", "More.", "Later."]);
    let mut config = fast_config();
    config.autonomous_running_limit = 2;
    let no_code_message = config.no_code_message.clone();
    let mut agent = ws.orchestrator(config, &model);

    let outcome = agent.run_input("do something", |_| {});

    assert_eq!(outcome.stop, LoopStop::LimitReached { limit: 2 });
    assert_eq!(outcome.cycles, 2);
    assert_eq!(model.calls(), 2);
    assert_eq!(request_texts(&model, 1).last(), Some(&no_code_message));
}

#[test]
fn limit_of_one_allows_a_single_call_per_input() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new(["Let me think.", "Still thinking.", "Hmm."]);
    let mut config = fast_config();
    config.autonomous_running_limit = 1;
    let mut agent = ws.orchestrator(config, &model);

    let outcome = agent.run_input("do something", |_| {});

    assert_eq!(outcome.stop, LoopStop::LimitReached { limit: 1 });
    assert_eq!(model.calls(), 1);

    agent.run_input("go on", |_| {});
    assert_eq!(model.calls(), 2);
}

#[test]
fn interrupted_call_is_discarded_and_queue_cleared() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::from_steps([Step::Interrupt(
        "[[WRITE_FILE a.txt]]\n```\nlate\n```".to_string(),
    )]);
    let mut agent = ws.orchestrator(fast_config(), &model);
    agent.submit("first");
    agent.submit("second");

    let outcomes = agent.run_pending(|_| {});

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].stop, LoopStop::Cancelled);
    assert_eq!(agent.pending(), 0);
    assert!(!ws.workdir().join("a.txt").exists());
    assert!(
        agent
            .conversation()
            .messages()
            .iter()
            .all(|message| message.role != Role::Assistant)
    );

    agent.submit("again");
    let outcomes = agent.run_pending(|_| {});
    assert_eq!(outcomes[0].stop, LoopStop::Finished);
}

#[test]
fn interrupt_after_the_run_ends_does_not_cancel_the_next_one() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new(["[[FINISHED]]", "[[FINISHED]]"]);
    let mut agent = ws.orchestrator(fast_config(), &model);
    let handle = agent.cancel_handle();

    agent.run_input("first", |_| {});
    assert!(!handle.is_busy());
    assert!(!handle.interrupt());

    let outcome = agent.run_input("second", |_| {});
    assert_eq!(outcome.stop, LoopStop::Finished);
    assert_eq!(model.calls(), 2);
}

#[test]
fn interrupt_during_a_run_is_consumed_when_it_ends() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new(["thinking", "[[FINISHED]]"]);
    let mut agent = ws.orchestrator(fast_config(), &model);
    let handle = agent.cancel_handle();

    let mut accepted = false;
    let outcome = agent.run_input("first", |event| {
        if let CycleEvent::Reply(_) = event {
            accepted = handle.interrupt();
        }
    });
    assert!(accepted);
    assert_eq!(outcome.stop, LoopStop::Cancelled);

    let outcome = agent.run_input("second", |_| {});
    assert_eq!(outcome.stop, LoopStop::Finished);
}

#[test]
fn queued_inputs_run_in_arrival_order() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new(["[[FINISHED]]", "[[CALL_USER]]"]);
    let mut agent = ws.orchestrator(fast_config(), &model);
    agent.submit("first");
    agent.submit("second");

    let outcomes = agent.run_pending(|_| {});

    let inputs: Vec<&str> = outcomes.iter().map(|o| o.input.as_str()).collect();
    assert_eq!(inputs, vec!["first", "second"]);
    assert_eq!(request_texts(&model, 0).last().map(String::as_str), Some("first"));
    assert_eq!(request_texts(&model, 1).last().map(String::as_str), Some("second"));
}

#[test]
fn transport_failures_are_retried_until_success() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::from_steps([
        Step::Fail("connection reset".to_string()),
        Step::Fail("502".to_string()),
        Step::Reply("[[FINISHED]]".to_string()),
    ]);
    let mut agent = ws.orchestrator(fast_config(), &model);

    let outcome = agent.run_input("go", |_| {});

    assert_eq!(outcome.stop, LoopStop::Finished);
    assert_eq!(outcome.cycles, 1);
    assert_eq!(model.calls(), 3);
}

#[test]
fn cycle_model_rotates_per_call() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new(["thinking", "[[FINISHED]]"]);
    let mut config = fast_config();
    config.model = "cycle".to_string();
    config.models_if_cycle = vec!["a".to_string(), "b".to_string()];
    let mut agent = ws.orchestrator(config, &model);

    agent.run_input("go", |_| {});

    let models: Vec<String> = model.requests().into_iter().map(|r| r.model).collect();
    assert_eq!(models, vec!["a", "b"]);
}

#[test]
fn snapshot_is_written_before_each_call() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new(["[[FINISHED]]"]);
    let mut agent = ws.orchestrator(fast_config(), &model);

    agent.run_input("remember me", |_| {});

    let (state, conversation) =
        load_snapshot(&ws.root().join("0.history.json")).expect("snapshot");
    assert_eq!(conversation.system().content.text(), TEST_SYSTEM_PROMPT);
    assert!(
        conversation
            .messages()
            .iter()
            .any(|message| message.content.text() == "remember me")
    );
    assert!(state.get("workdir").is_some());
}

#[test]
fn reset_keeps_only_the_system_message() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new(["noted", "[[FINISHED]]"]);
    let mut agent = ws.orchestrator(fast_config(), &model);
    agent.run_input("hello", |_| {});
    assert!(agent.conversation().len() > 1);

    agent.reset();

    assert_eq!(agent.conversation().len(), 1);
    assert_eq!(agent.conversation().system().role, Role::System);
    assert_eq!(agent.state().len(), 1);
}

#[test]
fn workspace_snapshot_reaches_the_model_and_then_expires() {
    let ws = TempWorkspace::new().expect("workspace");
    write_file(ws.workdir(), "main.py", "print('hi')\n");
    let model = ScriptedChatModel::new(["[[FINISHED]]"]);
    let mut agent = ws.orchestrator(fast_config(), &model);

    agent.run_input("look", |_| {});

    let first = request_texts(&model, 0);
    assert!(first[1].starts_with("[Below are the up-to-date contents of CODEBASE FILE TREE."));
    assert!(first[2].contains("[Up-to-date file contents of main.py]"));
    assert!(
        agent
            .conversation()
            .messages()
            .iter()
            .all(|message| message.expire.is_none())
    );
}

#[cfg(unix)]
#[test]
fn shell_command_output_is_fed_back() {
    let ws = TempWorkspace::new().expect("workspace");
    let model = ScriptedChatModel::new([
        "[[RUN_SHELL_COMMAND]]\n```sh\necho from-shell\n```",
        "[[FINISHED]]",
    ]);
    let mut agent = ws.orchestrator(fast_config(), &model);

    agent.run_input("run it", |_| {});

    let second = request_texts(&model, 1);
    let outcome = second
        .iter()
        .find(|text| text.starts_with("[[Executed code block #1 (sh)"))
        .expect("execution outcome");
    assert!(outcome.contains("from-shell"));
}
