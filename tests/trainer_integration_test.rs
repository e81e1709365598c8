//! 训练器集成测试：通过命令通道驱动后台主控循环，观察投影状态与落盘结果

use std::sync::Arc;
use std::time::Duration;

use mi_trainer::agents::PromptSet;
use mi_trainer::config::AppConfig;
use mi_trainer::core::{
    create_trainer, spawn_trainer, Command, NoticeLevel, StartupSession, StreamEvent, StreamTag, TrainerDeps,
    TrainerHandle, UiState,
};
use mi_trainer::llm::{LlmClient, MockLlmClient, ScriptedLlmClient};
use mi_trainer::memory::{FeedbackOrigin, Session, SessionStore, Speaker};
use mi_trainer::scenario::{Scenario, ScenarioLibrary};
use tempfile::TempDir;
use tokio::sync::watch;

const OPENING: &str = "My doctor keeps bugging me about smoking.";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let builtin = dir.path().join("builtin");
        std::fs::create_dir_all(&builtin).unwrap();
        let scenario = Scenario {
            id: "smoker".to_string(),
            name: "Ambivalent Smoker".to_string(),
            description: "Long-time smoker, not sure about quitting".to_string(),
            demographics: "Sam, 45, mechanic".to_string(),
            presenting_issue: "Smoking".to_string(),
            opening_statement: OPENING.to_string(),
            ..Scenario::default()
        };
        std::fs::write(
            builtin.join("smoker.json"),
            serde_json::to_string_pretty(&scenario).unwrap(),
        )
        .unwrap();
        Self { dir }
    }

    fn sessions_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("sessions")
    }

    fn user_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("user")
    }

    fn deps(&self, llm: Arc<dyn LlmClient>) -> TrainerDeps {
        TrainerDeps {
            llm,
            prompts: PromptSet::default(),
            library: ScenarioLibrary::new(self.dir.path().join("builtin"), self.user_dir()),
            store: SessionStore::new(self.sessions_dir()),
            stream_timeout: Duration::from_secs(5),
            excerpt_chars: 200,
            min_debrief_messages: 4,
        }
    }

    fn spawn(&self, llm: Arc<dyn LlmClient>, initial: StartupSession) -> TrainerHandle {
        spawn_trainer(self.deps(llm), initial)
    }
}

/// 等到投影状态满足条件；超时则失败
async fn wait_for(rx: &mut watch::Receiver<UiState>, pred: impl Fn(&UiState) -> bool) -> UiState {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&state) {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                let state = rx.borrow().clone();
                assert!(pred(&state), "trainer exited before condition held: {:?}", state);
                return state;
            }
        }
    })
    .await;
    result.expect("timed out waiting for trainer state")
}

fn submit(handle: &TrainerHandle, text: &str) {
    handle.cmd_tx.send(Command::Submit(text.to_string())).unwrap();
}

fn has_error(state: &UiState, needle: &str) -> bool {
    state
        .notices
        .iter()
        .any(|n| n.level == NoticeLevel::Error && n.text.contains(needle))
}

#[tokio::test]
async fn test_scenario_start_commits_opening_as_root() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Scenario("1".to_string()));

    let state = wait_for(&mut handle.state_rx, |s| !s.path.is_empty()).await;
    assert_eq!(state.scenario_name.as_deref(), Some("Ambivalent Smoker"));
    assert_eq!(state.path.len(), 1);
    assert_eq!(state.path[0].speaker, Speaker::Client);
    assert_eq!(state.path[0].content, OPENING);
}

#[tokio::test]
async fn test_full_turn_with_mock_backend() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Scenario("smoker".to_string()));
    wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;

    submit(&handle, "What brings you in today?");
    let state = wait_for(&mut handle.state_rx, |s| !s.turn_in_flight && s.path.len() == 3).await;

    assert_eq!(state.path[1].speaker, Speaker::Practitioner);
    assert_eq!(state.path[1].content, "What brings you in today?");
    assert_eq!(state.path[2].speaker, Speaker::Client);
    assert!(state.path[2].content.contains("mock client"));

    let feedback = state.latest_feedback().expect("feedback attached to the practitioner node");
    assert_eq!(feedback.techniques_used, vec!["open_question"]);
    assert!(feedback.overall_note.contains("mock coach"));
}

#[tokio::test]
async fn test_stream_events_are_tagged_per_generator() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Scenario("smoker".to_string()));
    wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;

    submit(&handle, "How do you feel about that?");
    wait_for(&mut handle.state_rx, |s| !s.turn_in_flight && s.path.len() == 3).await;

    let mut client_text = String::new();
    let mut finished = Vec::new();
    while let Ok(event) = handle.stream_rx.try_recv() {
        match event {
            StreamEvent::Chunk { stream: StreamTag::Client, text } => client_text.push_str(&text),
            StreamEvent::Finished { stream } => finished.push(stream),
            _ => {}
        }
    }
    assert!(client_text.contains("mock client"));
    assert!(finished.contains(&StreamTag::Client));
    assert!(finished.contains(&StreamTag::Coach));
}

#[tokio::test]
async fn test_busy_commands_rejected_but_navigation_allowed_mid_turn() {
    let fx = Fixture::new();
    let llm = ScriptedLlmClient::new(["Well, ", "maybe ", "you're ", "right."])
        .with_delay(Duration::from_millis(40));
    let mut handle = fx.spawn(Arc::new(llm), StartupSession::Scenario("smoker".to_string()));
    wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;

    submit(&handle, "You should really quit.");
    wait_for(&mut handle.state_rx, |s| s.turn_in_flight).await;

    submit(&handle, "/hint");
    let state = wait_for(&mut handle.state_rx, |s| has_error(s, "still being generated")).await;
    assert!(state.turn_in_flight);

    // 回退到开场白：current 离开 anchor
    submit(&handle, "/rewind 1");
    let state = wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;
    assert!(state.turn_in_flight);

    // 回复仍挂在 anchor 下，焦点被拉到新回复
    let state = wait_for(&mut handle.state_rx, |s| !s.turn_in_flight && s.path.len() == 3).await;
    assert_eq!(state.path[1].content, "You should really quit.");
    assert_eq!(state.path[2].content, "Well, maybe you're right.");
    assert!(state.path[1].feedback.is_some());
}

#[tokio::test]
async fn test_cancel_keeps_anchor_without_reply() {
    let fx = Fixture::new();
    let llm = ScriptedLlmClient::new(["a ", "b ", "c ", "d ", "e"]).with_delay(Duration::from_millis(200));
    let mut handle = fx.spawn(Arc::new(llm), StartupSession::Scenario("smoker".to_string()));
    wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;

    submit(&handle, "Tell me more.");
    wait_for(&mut handle.state_rx, |s| s.turn_in_flight).await;
    handle.cmd_tx.send(Command::Cancel).unwrap();

    let state = wait_for(&mut handle.state_rx, |s| !s.turn_in_flight && s.path.len() == 2).await;
    assert_eq!(state.path[1].speaker, Speaker::Practitioner);
    assert!(has_error(&state, "did not reply"));
    // 教练那一半降级为替代记录
    let feedback = state.path[1].feedback.as_ref().unwrap();
    assert!(feedback.techniques_used.is_empty());
}

#[tokio::test]
async fn test_quit_saves_session_and_exits() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Scenario("smoker".to_string()));
    wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;

    submit(&handle, "What would you like to talk about?");
    wait_for(&mut handle.state_rx, |s| !s.turn_in_flight && s.path.len() == 3).await;

    submit(&handle, "/quit");
    let state = wait_for(&mut handle.state_rx, |s| s.is_exited()).await;
    assert!(state.is_exited());
    tokio::time::timeout(Duration::from_secs(5), handle.task)
        .await
        .unwrap()
        .unwrap();

    let store = SessionStore::new(fx.sessions_dir());
    let sessions = store.list();
    assert_eq!(sessions.len(), 1);
    let loaded = store.load(&sessions[0].path).unwrap();
    assert_eq!(loaded.scenario.id, "smoker");
    assert_eq!(loaded.conversation.len(), 3);
}

#[tokio::test]
async fn test_quit_without_conversation_saves_nothing() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Pick);
    let state = wait_for(&mut handle.state_rx, |s| !s.notices.is_empty()).await;
    assert!(state.notices.iter().any(|n| n.text.contains("Ambivalent Smoker")));

    handle.cmd_tx.send(Command::Quit).unwrap();
    handle.task.await.unwrap();
    assert!(SessionStore::new(fx.sessions_dir()).list().is_empty());
}

#[tokio::test]
async fn test_resume_restores_tree_without_new_opening() {
    let fx = Fixture::new();
    let store = SessionStore::new(fx.sessions_dir());
    let library = ScenarioLibrary::new(fx.dir.path().join("builtin"), fx.user_dir());
    let mut session = Session::new(library.find_by_id("smoker").unwrap());
    session.conversation.add_message(Speaker::Client, OPENING);
    session.conversation.add_message(Speaker::Practitioner, "Sounds frustrating.");
    session.conversation.add_message(Speaker::Client, "It is.");
    let path = store.save(&mut session, None).unwrap();

    let llm = ScriptedLlmClient::new(["unused"]);
    let mut handle = fx.spawn(Arc::new(llm.clone()), StartupSession::Resume(path));
    let state = wait_for(&mut handle.state_rx, |s| s.path.len() == 3).await;
    assert_eq!(state.path[2].content, "It is.");
    assert!(llm.requests().is_empty());
}

#[tokio::test]
async fn test_new_scenario_is_saved_and_selectable() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Pick);
    wait_for(&mut handle.state_rx, |s| !s.notices.is_empty()).await;

    submit(&handle, "/new a student who vapes between classes");
    wait_for(&mut handle.state_rx, |s| {
        s.notices.iter().any(|n| n.text.contains("Created scenario: Mock Scenario"))
    })
    .await;
    assert!(fx.user_dir().join("mock-scenario.json").exists());

    submit(&handle, "/scenario mock-scenario");
    let state = wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;
    assert_eq!(state.scenario_name.as_deref(), Some("Mock Scenario"));
}

#[tokio::test]
async fn test_branches_and_goto_after_rewind() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Scenario("smoker".to_string()));
    wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;

    submit(&handle, "First try.");
    wait_for(&mut handle.state_rx, |s| !s.turn_in_flight && s.path.len() == 3).await;

    submit(&handle, "/rewind 2");
    wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;

    submit(&handle, "Second try.");
    let state = wait_for(&mut handle.state_rx, |s| !s.turn_in_flight && s.path.len() == 3).await;
    assert_eq!(state.path[1].content, "Second try.");
    assert_eq!(state.path[1].siblings, 2);

    submit(&handle, "/rewind 2");
    let state = wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;
    assert_eq!(state.branches_here, 2);

    submit(&handle, "/goto 1");
    let state = wait_for(&mut handle.state_rx, |s| s.path.len() == 2).await;
    assert_eq!(state.path[1].content, "First try.");

    submit(&handle, "/goto nope");
    wait_for(&mut handle.state_rx, |s| has_error(s, "Node not found: nope")).await;
}

#[tokio::test]
async fn test_unknown_command_and_no_session_errors() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Pick);
    wait_for(&mut handle.state_rx, |s| !s.notices.is_empty()).await;

    submit(&handle, "/dance");
    wait_for(&mut handle.state_rx, |s| has_error(s, "dance")).await;

    submit(&handle, "Hello?");
    let state = wait_for(&mut handle.state_rx, |s| has_error(s, "No active session")).await;
    assert!(state.path.is_empty());
}

#[tokio::test]
async fn test_run_turn_then_save_and_reload() {
    use mi_trainer::agents::{ClientAgent, CoachAgent};
    use mi_trainer::core::TurnOrchestrator;

    let fx = Fixture::new();
    let library = ScenarioLibrary::new(fx.dir.path().join("builtin"), fx.user_dir());
    let scenario = library.find_by_id("smoker").unwrap();
    let prompts = PromptSet::default();
    let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient);

    let client = ClientAgent::new(llm.clone(), scenario.clone(), &prompts.client_system);
    let coach = CoachAgent::new(llm, prompts.coach_system, prompts.hint, prompts.debrief);
    let turns = TurnOrchestrator::new(Arc::new(client), Arc::new(coach));

    let mut session = Session::new(scenario);
    session.conversation.add_message(Speaker::Client, OPENING);
    let mut sink: Vec<StreamEvent> = Vec::new();
    let outcome = turns
        .run_turn(&mut session.conversation, "What matters most to you?", &mut sink)
        .await;
    assert!(outcome.reply.is_ok());
    assert_eq!(outcome.feedback, FeedbackOrigin::Parsed);

    let store = SessionStore::new(fx.sessions_dir());
    let path = store.save(&mut session, Some("reload.json")).unwrap();
    let loaded = store.load(path).unwrap();
    assert_eq!(loaded.conversation, session.conversation);
    assert!(loaded.conversation.get(outcome.anchor.as_str()).unwrap().feedback().is_some());
}

#[tokio::test]
async fn test_rewind_reports_steps_actually_taken() {
    let fx = Fixture::new();
    let mut handle = fx.spawn(Arc::new(MockLlmClient), StartupSession::Scenario("smoker".to_string()));
    wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;

    submit(&handle, "What would you like to change?");
    wait_for(&mut handle.state_rx, |s| !s.turn_in_flight && s.path.len() == 3).await;

    submit(&handle, "/rewind 10");
    let state = wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;
    assert!(state.notices.iter().any(|n| n.text == "Rewound 2 step(s)."));
    assert!(!state.notices.iter().any(|n| n.text.contains("Rewound 10")));

    submit(&handle, "/rewind 3");
    wait_for(&mut handle.state_rx, |s| {
        s.notices.iter().any(|n| n.text == "Already at the beginning.")
    })
    .await;
}

#[tokio::test]
async fn test_create_trainer_uses_given_config() {
    let fx = Fixture::new();
    let mut cfg = AppConfig::default();
    cfg.app.data_dir = Some(fx.dir.path().to_path_buf());
    cfg.app.builtin_scenarios_dir = Some(fx.dir.path().join("builtin"));

    let mut handle = create_trainer(&cfg, StartupSession::Scenario("smoker".to_string()))
        .await
        .unwrap();
    let state = wait_for(&mut handle.state_rx, |s| s.path.len() == 1).await;
    assert_eq!(state.scenario_name.as_deref(), Some("Ambivalent Smoker"));

    submit(&handle, "/save");
    wait_for(&mut handle.state_rx, |s| {
        s.notices.iter().any(|n| n.text.starts_with("Session saved"))
    })
    .await;
    // 会话落在配置的数据目录下
    assert_eq!(SessionStore::new(fx.sessions_dir()).list().len(), 1);
}
