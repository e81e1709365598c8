//! 训练器编排：主控循环
//!
//! 负责：按配置创建 LLM/智能体/场景库/会话存储，建立 cmd/state/stream 三通道，
//! 并在后台任务中独占会话与对话树：消费用户命令（Submit/Cancel/Quit），
//! 同时扇入进行中一轮的生成事件，逐条提交到树上并把投影后的状态发给 UI。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::agents::{ClientAgent, CoachAgent, PromptSet, ScenarioBuilder};
use crate::config::AppConfig;
use crate::core::command::{parse_input, CommandError, Input, SlashCommand, HELP_TEXT};
use crate::core::state::{project, Notices, TrainerPhase, UiState};
use crate::core::turn::{
    GenerationEvent, InFlightTurn, StreamEvent, TurnOrchestrator, TurnOutcome,
};
use crate::core::{SessionSupervisor, TrainerError};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
use crate::memory::{Session, SessionStore, Speaker};
use crate::scenario::{Scenario, ScenarioLibrary};

/// 流事件广播容量；一轮的块数通常远小于此，UI 落后时会把缓冲标记为不完整
const STREAM_CHANNEL_CAPACITY: usize = 1024;

/// 从 UI 发往编排器的用户命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 一行输入：练习者发言或 / 命令
    Submit(String),
    /// 取消进行中的一轮（Esc / Ctrl+C）
    Cancel,
    /// 保存并退出
    Quit,
}

/// 启动时要进入的会话
#[derive(Debug, Clone, Default)]
pub enum StartupSession {
    /// 列出场景，等用户 /scenario
    #[default]
    Pick,
    /// 按编号、id 或名称选场景
    Scenario(String),
    /// 从会话文件恢复
    Resume(PathBuf),
}

/// 编排器运行所需的全部依赖（测试可直接构造）
pub struct TrainerDeps {
    pub llm: Arc<dyn LlmClient>,
    pub prompts: PromptSet,
    pub library: ScenarioLibrary,
    pub store: SessionStore,
    pub stream_timeout: Duration,
    pub excerpt_chars: usize,
    pub min_debrief_messages: usize,
}

impl TrainerDeps {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            llm: create_llm_from_config(cfg),
            prompts: PromptSet::load(),
            library: ScenarioLibrary::new(
                cfg.app.builtin_scenarios_dir(),
                cfg.app.user_scenarios_dir(),
            ),
            store: SessionStore::new(cfg.app.sessions_dir()),
            stream_timeout: Duration::from_secs(cfg.llm.timeouts.stream),
            excerpt_chars: cfg.coach.excerpt_chars,
            min_debrief_messages: cfg.coach.min_debrief_messages,
        }
    }
}

/// 编排器句柄：命令发送端、状态接收端、流接收端，以及后台任务（退出时 await 以确保已保存）
pub struct TrainerHandle {
    pub cmd_tx: mpsc::UnboundedSender<Command>,
    pub state_rx: watch::Receiver<UiState>,
    pub stream_rx: broadcast::Receiver<StreamEvent>,
    pub task: JoinHandle<()>,
}

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();
    let request_timeout = Duration::from_secs(cfg.llm.timeouts.request);

    // provider 为 openai 且有 OpenAI Key 时走 OpenAI；否则有 DeepSeek Key，或配置为 deepseek 且仅有 OpenAI Key 时走 DeepSeek 兼容端点
    let prefer_openai = provider == "openai" && openai_key.is_some();
    let use_deepseek =
        !prefer_openai && (deepseek_key.is_some() || (provider == "deepseek" && openai_key.is_some()));

    if use_deepseek {
        let model = cfg.llm.model.clone().unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
        let base = cfg.llm.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
        let key = deepseek_key.or(openai_key);
        tracing::info!("Using DeepSeek LLM ({})", model);
        Arc::new(
            OpenAiClient::new(Some(base), &model, key.as_deref())
                .with_max_tokens(cfg.llm.max_tokens)
                .with_request_timeout(request_timeout),
        )
    } else if let Some(key) = openai_key {
        let model = cfg.llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!("Using OpenAI LLM ({})", model);
        Arc::new(
            OpenAiClient::new(cfg.llm.base_url.as_deref(), &model, Some(&key))
                .with_max_tokens(cfg.llm.max_tokens)
                .with_request_timeout(request_timeout),
        )
    } else {
        tracing::warn!("No API key set, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}

/// 创建训练器运行时：按已加载的配置组装依赖并启动后台主控循环
pub async fn create_trainer(cfg: &AppConfig, initial: StartupSession) -> anyhow::Result<TrainerHandle> {
    Ok(spawn_trainer(TrainerDeps::from_config(cfg), initial))
}

/// 用给定依赖启动主控循环
pub fn spawn_trainer(deps: TrainerDeps, initial: StartupSession) -> TrainerHandle {
    // 三通道：UI -> Core 命令；Core -> UI 状态快照；Core -> UI 流事件
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (state_tx, state_rx) = watch::channel(UiState::default());
    let (stream_tx, stream_rx) = broadcast::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);

    let trainer = Trainer::new(deps, state_tx, stream_tx);
    let task = tokio::spawn(trainer.run(cmd_rx, initial));

    TrainerHandle {
        cmd_tx,
        state_rx,
        stream_rx,
        task,
    }
}

/// 后台任务独占的状态：当前会话、智能体、提示与阶段
struct Trainer {
    llm: Arc<dyn LlmClient>,
    prompts: PromptSet,
    library: ScenarioLibrary,
    store: SessionStore,
    stream_timeout: Duration,
    min_debrief_messages: usize,

    coach: Arc<CoachAgent>,
    builder: ScenarioBuilder,
    supervisor: SessionSupervisor,

    session: Option<Session>,
    turns: Option<TurnOrchestrator>,
    notices: Notices,
    phase: TrainerPhase,

    state_tx: watch::Sender<UiState>,
    stream_tx: broadcast::Sender<StreamEvent>,
}

impl Trainer {
    fn new(
        deps: TrainerDeps,
        state_tx: watch::Sender<UiState>,
        stream_tx: broadcast::Sender<StreamEvent>,
    ) -> Self {
        let coach = CoachAgent::new(
            deps.llm.clone(),
            deps.prompts.coach_system.clone(),
            deps.prompts.hint.clone(),
            deps.prompts.debrief.clone(),
        )
        .with_excerpt_chars(deps.excerpt_chars);
        let builder = ScenarioBuilder::new(deps.llm.clone(), deps.prompts.scenario_builder.clone());

        Self {
            llm: deps.llm,
            prompts: deps.prompts,
            library: deps.library,
            store: deps.store,
            stream_timeout: deps.stream_timeout,
            min_debrief_messages: deps.min_debrief_messages,
            coach: Arc::new(coach),
            builder,
            supervisor: SessionSupervisor::new(),
            session: None,
            turns: None,
            notices: Notices::default(),
            phase: TrainerPhase::Idle,
            state_tx,
            stream_tx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>, initial: StartupSession) {
        self.startup(initial).await;

        // 进行中的一轮；select 在执行分支体之前已释放各分支 future，分支体里可以再借用
        let mut in_flight: Option<InFlightTurn> = None;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Submit(text)) => {
                        if !self.handle_input(&text, &mut in_flight).await {
                            break;
                        }
                    }
                    Some(Command::Cancel) => self.cancel(&in_flight),
                    Some(Command::Quit) | None => {
                        self.quit(&mut in_flight).await;
                        break;
                    }
                },
                event = next_generation_event(&mut in_flight) => match event {
                    Some(event) => self.apply_event(event, &mut in_flight),
                    None => self.abandon(&mut in_flight),
                },
            }
        }
        tracing::info!("Trainer loop exited");
    }

    async fn startup(&mut self, initial: StartupSession) {
        let result = match initial {
            StartupSession::Pick => {
                self.list_scenarios();
                Ok(())
            }
            StartupSession::Scenario(query) => self.select_scenario(&query).await,
            StartupSession::Resume(path) => self.load_session_file(&path).await,
        };
        if let Err(e) = result {
            self.notices.error(e.to_string());
        }
        self.publish();
    }

    /// 处理一行输入；返回 false 表示退出
    async fn handle_input(&mut self, text: &str, in_flight: &mut Option<InFlightTurn>) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return true;
        }

        let result = match parse_input(text) {
            Ok(Input::Message(message)) => self.start_turn(&message, in_flight),
            Ok(Input::Command(SlashCommand::Quit)) => {
                self.quit(in_flight).await;
                return false;
            }
            Ok(Input::Command(command)) => self.run_command(command, in_flight.is_some()).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            tracing::debug!("Command failed: {}", e);
            self.notices.error(e.to_string());
        }
        if in_flight.is_none() {
            self.phase = TrainerPhase::Idle;
        }
        self.publish();
        true
    }

    fn start_turn(&mut self, text: &str, in_flight: &mut Option<InFlightTurn>) -> Result<(), TrainerError> {
        if in_flight.is_some() {
            return Err(TrainerError::TurnInFlight);
        }
        let (Some(session), Some(turns)) = (self.session.as_mut(), self.turns.as_ref()) else {
            return Err(TrainerError::NoSession);
        };

        let token = self.supervisor.turn_token();
        *in_flight = Some(turns.begin_turn(&mut session.conversation, text, token));
        self.phase = TrainerPhase::Responding;
        Ok(())
    }

    async fn run_command(&mut self, command: SlashCommand, busy: bool) -> Result<(), TrainerError> {
        let blocked = matches!(
            command,
            SlashCommand::Hint
                | SlashCommand::Debrief
                | SlashCommand::Load(Some(_))
                | SlashCommand::Scenario(Some(_))
                | SlashCommand::New(_)
        );
        if busy && blocked {
            return Err(TrainerError::TurnInFlight);
        }

        match command {
            SlashCommand::Help => self.notices.info(HELP_TEXT),
            SlashCommand::Hint => self.hint().await?,
            SlashCommand::Debrief => self.debrief().await?,
            SlashCommand::Save => self.save()?,
            SlashCommand::Load(None) => self.list_sessions(),
            SlashCommand::Load(Some(n)) => {
                let sessions = self.store.list();
                let summary = n
                    .checked_sub(1)
                    .and_then(|i| sessions.get(i))
                    .ok_or(CommandError::InvalidArgument {
                        command: "load",
                        arg: n.to_string(),
                    })?;
                let path = summary.path.clone();
                self.load_session_file(&path).await?;
            }
            SlashCommand::Scenario(None) => self.list_scenarios(),
            SlashCommand::Scenario(Some(query)) => self.select_scenario(&query).await?,
            SlashCommand::New(description) => self.new_scenario(&description).await?,
            SlashCommand::Rewind(steps) => self.rewind(steps)?,
            SlashCommand::Branches => self.branches()?,
            SlashCommand::Goto(target) => self.goto(&target)?,
            // 已在 handle_input 中处理
            SlashCommand::Quit => {}
        }
        Ok(())
    }

    // ---------- 会话生命周期 ----------

    async fn select_scenario(&mut self, query: &str) -> Result<(), TrainerError> {
        let scenarios = self.library.list_all();
        let scenario = query
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| scenarios.get(i).cloned())
            .or_else(|| self.library.find_by_id(query))
            .or_else(|| self.library.find_by_name(query))
            .ok_or_else(|| TrainerError::ScenarioNotFound(query.to_string()))?;

        self.notices.clear();
        self.notices.info(format!("Starting scenario: {}", scenario.name));
        self.start_session(Session::new(scenario)).await;
        Ok(())
    }

    async fn load_session_file(&mut self, path: &Path) -> Result<(), TrainerError> {
        let session = self.store.load(path)?;
        self.notices.clear();
        self.notices.info(format!("Loaded session: {}", session.scenario.name));
        self.start_session(session).await;
        Ok(())
    }

    /// 切换到新会话；树为空时取来访者开场白作为根节点
    async fn start_session(&mut self, session: Session) {
        tracing::info!("Session started: {} ({} nodes)", session.scenario.name, session.conversation.len());
        let client = ClientAgent::new(self.llm.clone(), session.scenario.clone(), &self.prompts.client_system);
        self.turns = Some(
            TurnOrchestrator::new(Arc::new(client), self.coach.clone())
                .with_stream_timeout(self.stream_timeout),
        );
        let needs_opening = session.conversation.is_empty();
        self.session = Some(session);

        if needs_opening {
            self.opening().await;
        }
    }

    async fn opening(&mut self) {
        let Some(turns) = self.turns.as_ref() else {
            return;
        };
        let client = turns.client().clone();

        self.phase = TrainerPhase::Opening;
        self.publish();

        match client.opening().await {
            Ok(text) => {
                if let Some(session) = self.session.as_mut() {
                    let id = session.conversation.add_message(Speaker::Client, text).id().clone();
                    tracing::info!("Opening statement committed as {}", id);
                }
            }
            Err(e) => {
                tracing::warn!("Opening statement failed: {}", e);
                self.notices.error(format!(
                    "Could not get the client's opening ({}). You can start the conversation yourself.",
                    e
                ));
            }
        }
        self.phase = TrainerPhase::Idle;
    }

    fn save(&mut self) -> Result<(), TrainerError> {
        let session = self.session.as_mut().ok_or(TrainerError::NoSession)?;
        let path = self.store.save(session, None)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.notices.info(format!("Session saved: {}", name));
        Ok(())
    }

    fn list_sessions(&mut self) {
        let sessions = self.store.list();
        if sessions.is_empty() {
            self.notices.info("No saved sessions found.");
            return;
        }
        self.notices.info("Saved sessions:");
        for (i, s) in sessions.iter().enumerate() {
            self.notices.info(format!(
                "  {}. {} ({})",
                i + 1,
                s.scenario_name,
                s.created_at.format("%Y-%m-%d %H:%M")
            ));
        }
        self.notices.info("Use /load <number> to load.");
    }

    fn list_scenarios(&mut self) {
        let scenarios = self.library.list_all();
        if scenarios.is_empty() {
            self.notices.info("No scenarios found. Use /new <description> to create one.");
            return;
        }
        self.notices.info("Available scenarios:");
        for (i, s) in scenarios.iter().enumerate() {
            self.notices.info(format!("  {}. {} - {}", i + 1, s.name, preview(&s.description, 50)));
        }
        self.notices.info("Use /scenario <number> or /scenario <name>");
    }

    async fn new_scenario(&mut self, description: &str) -> Result<(), TrainerError> {
        self.thinking();
        let scenario: Scenario = self.builder.build(description).await?;
        self.library.save_user(&scenario)?;
        self.notices.info(format!("Created scenario: {}", scenario.name));
        self.notices.info("Use /scenario to select it.");
        Ok(())
    }

    // ---------- 教练 ----------

    async fn hint(&mut self) -> Result<(), TrainerError> {
        let session = self.session.as_ref().ok_or(TrainerError::NoSession)?;
        if session.conversation.is_empty() {
            self.notices.info("No conversation yet. Start talking first!");
            return Ok(());
        }
        let history = session.conversation.conversation_for_llm();
        self.thinking();
        let hint = self.coach.hint(&history).await?;
        self.notices.info(format!("Hint: {}", hint));
        Ok(())
    }

    async fn debrief(&mut self) -> Result<(), TrainerError> {
        let session = self.session.as_ref().ok_or(TrainerError::NoSession)?;
        let history = session.conversation.conversation_for_llm();
        if history.len() < self.min_debrief_messages {
            return Err(TrainerError::ConversationTooShort(self.min_debrief_messages));
        }
        let scenario = session.scenario.clone();
        self.thinking();
        let debrief = self.coach.debrief(&scenario, &history).await?;
        self.notices.clear();
        self.notices.info(debrief);
        Ok(())
    }

    fn thinking(&mut self) {
        self.phase = TrainerPhase::Thinking;
        self.publish();
    }

    // ---------- 导航（进行中的一轮也允许） ----------

    fn rewind(&mut self, steps: usize) -> Result<(), TrainerError> {
        let tree = &mut self.session.as_mut().ok_or(TrainerError::NoSession)?.conversation;
        let depth_before = tree.current_path().len();
        tree.rewind(steps);
        // 到根即停，实际步数可能少于请求
        let moved = depth_before.saturating_sub(tree.current_path().len());
        if moved == 0 {
            self.notices.info("Already at the beginning.");
            return Ok(());
        }

        self.notices.info(format!("Rewound {} step(s).", moved));
        let branches = tree.children_of_current().len();
        if branches > 1 {
            self.notices.info(format!("{} branch(es) from here.", branches));
        }
        Ok(())
    }

    fn branches(&mut self) -> Result<(), TrainerError> {
        let tree = &self.session.as_ref().ok_or(TrainerError::NoSession)?.conversation;
        let lines: Vec<String> = tree
            .children_of_current()
            .iter()
            .enumerate()
            .map(|(i, node)| {
                format!(
                    "  {}. [{}] {} ({})",
                    i + 1,
                    node.speaker().label(),
                    preview(node.content(), 50),
                    node.id()
                )
            })
            .collect();

        if lines.is_empty() {
            self.notices.info("No branches from current position.");
            return Ok(());
        }
        self.notices.info("Branches from current point:");
        for line in lines {
            self.notices.info(line);
        }
        self.notices.info("Use /goto <n> or /goto <node id> to jump to a branch.");
        Ok(())
    }

    /// 先按当前分支编号解析，再按节点 id
    fn goto(&mut self, target: &str) -> Result<(), TrainerError> {
        let tree = &mut self.session.as_mut().ok_or(TrainerError::NoSession)?.conversation;

        let branch = target
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| tree.children_of_current().get(i).map(|node| (i, node.id().clone())));
        if let Some((i, id)) = branch {
            tree.goto(id.as_str());
            self.notices.info(format!("Jumped to branch {}.", i + 1));
            return Ok(());
        }

        if tree.goto(target).is_some() {
            self.notices.info(format!("Jumped to node {}.", target));
            Ok(())
        } else {
            tracing::debug!("Goto miss: {}", target);
            Err(TrainerError::NodeNotFound(target.to_string()))
        }
    }

    // ---------- 进行中的一轮 ----------

    fn apply_event(&mut self, event: GenerationEvent, in_flight: &mut Option<InFlightTurn>) {
        let Some(turn) = in_flight.as_mut() else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            tracing::warn!("Generation event without a session, dropping turn");
            *in_flight = None;
            return;
        };

        let is_chunk = matches!(event, GenerationEvent::Chunk(..));
        if let Some(outcome) = turn.apply(event, &mut session.conversation, &mut self.stream_tx) {
            *in_flight = None;
            self.finish_turn(outcome);
        } else if !is_chunk {
            // 一半已提交（反馈或来访者回复），刷新投影
            self.publish();
        }
    }

    fn abandon(&mut self, in_flight: &mut Option<InFlightTurn>) {
        let Some(mut turn) = in_flight.take() else {
            return;
        };
        match self.session.as_mut() {
            Some(session) => {
                let outcome = turn.finish_abandoned(&mut session.conversation, &mut self.stream_tx);
                self.finish_turn(outcome);
            }
            None => self.supervisor.finish_turn(),
        }
    }

    fn finish_turn(&mut self, outcome: TurnOutcome) {
        self.supervisor.finish_turn();
        if let Err(e) = &outcome.reply {
            self.notices.error(format!(
                "{}. The client did not reply; send another message or /rewind to try again.",
                e
            ));
        }
        self.phase = TrainerPhase::Idle;
        self.publish();
    }

    fn cancel(&mut self, in_flight: &Option<InFlightTurn>) {
        if in_flight.is_some() && self.supervisor.cancel_turn() {
            tracing::info!("Turn cancelled by user");
            self.notices.info("Cancelling...");
            self.publish();
        }
    }

    /// 退出：先收尾进行中的一轮，再保存非空会话
    async fn quit(&mut self, in_flight: &mut Option<InFlightTurn>) {
        if let Some(turn) = in_flight.as_ref() {
            turn.cancel();
        }
        while in_flight.is_some() {
            match next_generation_event(in_flight).await {
                Some(event) => self.apply_event(event, in_flight),
                None => self.abandon(in_flight),
            }
        }

        if self.session.as_ref().is_some_and(|s| !s.conversation.is_empty()) {
            self.notices.info("Saving session before exit...");
            if let Err(e) = self.save() {
                tracing::warn!("Save on exit failed: {}", e);
                self.notices.error(e.to_string());
            }
        }
        self.supervisor.shutdown();
        self.phase = TrainerPhase::Exited;
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(project(
            self.session.as_ref(),
            self.phase,
            &self.notices,
            self.phase == TrainerPhase::Responding,
        ));
    }
}

/// 没有进行中的一轮时永远挂起，让 select 只等命令
async fn next_generation_event(in_flight: &mut Option<InFlightTurn>) -> Option<GenerationEvent> {
    match in_flight {
        Some(turn) => turn.next_event().await,
        None => std::future::pending().await,
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}
