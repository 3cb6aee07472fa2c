//! Self-healing stream session.
//!
//! A [`HealingSession`] wraps one upstream streaming generation. Fragments
//! are forwarded as they arrive. When the upstream stream breaks before a
//! clean finish, the text delivered so far is replayed as a model turn,
//! followed by a user turn asking the model to continue, and the call is
//! re-issued with the same key. The caller sees one continuous stream.

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ApiKey, Config};
use crate::upstream::{
    ConversationTurn, FinishReason, FragmentStream, GenerationRequest, StreamFragment, TurnRole,
    Upstream, UpstreamError,
};

/// Instruction sent as the synthetic user turn after an interruption.
pub const CONTINUE_PROMPT: &str =
    "Continue exactly where you left off. Do not repeat any text you have already written.";

/// Events a session yields to the emitter.
pub type SessionStream = BoxStream<'static, Result<StreamFragment, UpstreamError>>;

/// Limits applied to one session.
#[derive(Debug, Clone, Copy)]
pub struct HealingPolicy {
    /// Retries after the initial stream; `0` disables healing.
    pub max_retries: u32,
    /// Longest wait for the next upstream event.
    pub idle_timeout: Duration,
    /// Longest wait for a resumed stream to open.
    pub open_timeout: Duration,
}

/// Model family the healing replay is known to work with.
pub const HEALABLE_MODEL_PREFIX: &str = "gemini";

impl HealingPolicy {
    /// Policy for one request. Models outside the Gemini family never heal.
    pub fn for_model(config: &Config, model: &str) -> Self {
        let max_retries = if model.starts_with(HEALABLE_MODEL_PREFIX) {
            config.healing.effective_retries()
        } else {
            0
        };
        Self {
            max_retries,
            idle_timeout: config.upstream.stream_idle_timeout(),
            open_timeout: config.upstream.attempt_timeout(),
        }
    }
}

/// Session-scoped progress, rebuilt on every interruption.
#[derive(Debug, Clone, Default)]
pub struct HealingState {
    pub accumulated_text: String,
    pub retries_used: u32,
    pub turns: Vec<ConversationTurn>,
}

/// Withholds text that merely repeats what was replayed before a resume.
#[derive(Debug, Default)]
struct EchoGuard {
    replayed: String,
    pending: String,
    active: bool,
}

impl EchoGuard {
    fn new(replayed: String) -> Self {
        Self {
            active: !replayed.is_empty(),
            replayed,
            pending: String::new(),
        }
    }

    /// Text of `incoming` that should reach the caller.
    fn filter(&mut self, incoming: &str) -> String {
        if !self.active {
            return incoming.to_string();
        }
        self.pending.push_str(incoming);

        if self.pending.starts_with(&self.replayed) {
            self.active = false;
            let fresh = self.pending[self.replayed.len()..].to_string();
            self.pending.clear();
            tracing::debug!(
                dropped = self.replayed.len(),
                "Dropped echoed text after resume"
            );
            return fresh;
        }
        if self.replayed.starts_with(&self.pending) {
            return String::new();
        }

        self.active = false;
        std::mem::take(&mut self.pending)
    }
}

enum Phase {
    Starting,
    Streaming(FragmentStream),
    Done,
}

/// One inbound streaming request's view of the upstream.
pub struct HealingSession {
    upstream: Arc<dyn Upstream>,
    key: ApiKey,
    request: GenerationRequest,
    policy: HealingPolicy,
    state: HealingState,
    phase: Phase,
    echo: EchoGuard,
    /// Terminal reason seen on the current upstream stream.
    terminal: Option<FinishReason>,
    delivered_any: bool,
}

impl HealingSession {
    /// Wrap an already opened upstream stream.
    pub fn new(
        upstream: Arc<dyn Upstream>,
        key: ApiKey,
        mut request: GenerationRequest,
        opened: FragmentStream,
        policy: HealingPolicy,
    ) -> Self {
        let turns = std::mem::take(&mut request.turns);
        Self {
            upstream,
            key,
            request,
            policy,
            state: HealingState {
                turns,
                ..HealingState::default()
            },
            phase: Phase::Streaming(opened),
            echo: EchoGuard::default(),
            terminal: None,
            delivered_any: false,
        }
    }

    pub fn state(&self) -> &HealingState {
        &self.state
    }

    /// Consume the session as a stream of delivered fragments.
    ///
    /// Ends after a clean finish or a safety block; yields one `Err` and ends
    /// when retries are exhausted. Dropping the stream drops the upstream
    /// connection.
    pub fn into_stream(self) -> SessionStream {
        stream::unfold(self, |mut session| async move {
            let event = session.next_event().await?;
            Some((event, session))
        })
        .boxed()
    }

    async fn next_event(&mut self) -> Option<Result<StreamFragment, UpstreamError>> {
        loop {
            match self.phase {
                Phase::Done => return None,
                Phase::Starting => {
                    if let Err(err) = self.reopen().await {
                        if let Some(err) = self.interrupt(err) {
                            return Some(Err(err));
                        }
                    }
                    continue;
                }
                Phase::Streaming(_) => {}
            }

            let idle_timeout = self.policy.idle_timeout;
            let Phase::Streaming(upstream) = &mut self.phase else {
                continue;
            };
            let polled = tokio::time::timeout(idle_timeout, upstream.next()).await;

            let failure = match polled {
                Err(_) => UpstreamError::Timeout(idle_timeout),
                Ok(Some(Err(err))) => err,
                Ok(Some(Ok(response))) => {
                    let fragment = StreamFragment::from(&response);
                    if let Some(event) = self.deliver(fragment) {
                        return Some(Ok(event));
                    }
                    continue;
                }
                Ok(None) => match self.terminal {
                    Some(_) if self.delivered_any => {
                        tracing::debug!(
                            key = %self.key.suffix(),
                            retries = self.state.retries_used,
                            "Upstream stream finished"
                        );
                        self.phase = Phase::Done;
                        return None;
                    }
                    Some(_) => UpstreamError::Empty,
                    None => UpstreamError::Truncated,
                },
            };

            if let Some(err) = self.interrupt(failure) {
                return Some(Err(err));
            }
        }
    }

    /// Record a fragment and decide what, if anything, reaches the caller.
    fn deliver(&mut self, fragment: StreamFragment) -> Option<StreamFragment> {
        if fragment.finish.is_some() {
            self.terminal = fragment.finish;
        }

        let text = self.echo.filter(&fragment.text);
        if !text.is_empty() {
            self.state.accumulated_text.push_str(&text);
            self.delivered_any = true;
        }

        if fragment.finish.is_some_and(|f| f.is_safety_block()) {
            tracing::warn!(
                key = %self.key.suffix(),
                reason = ?fragment.finish,
                "Upstream stopped generation with a safety block"
            );
            self.phase = Phase::Done;
            return Some(StreamFragment::new(text, fragment.finish));
        }

        if text.is_empty() {
            return None;
        }
        Some(StreamFragment::new(text, fragment.finish))
    }

    /// Handle a broken stream. Returns the error to surface once retries run out.
    fn interrupt(&mut self, err: UpstreamError) -> Option<UpstreamError> {
        if self.state.retries_used >= self.policy.max_retries {
            tracing::warn!(
                key = %self.key.suffix(),
                retries = self.state.retries_used,
                error = %err,
                "Upstream stream failed, no retries left"
            );
            self.phase = Phase::Done;
            return Some(err);
        }

        let replay = std::mem::take(&mut self.state.accumulated_text);
        tracing::info!(
            key = %self.key.suffix(),
            retry = self.state.retries_used + 1,
            max_retries = self.policy.max_retries,
            replayed_chars = replay.chars().count(),
            error = %err,
            "Upstream stream interrupted, resuming"
        );

        if !replay.is_empty() {
            self.state.turns.push(ConversationTurn::model(replay.clone()));
        }
        let already_asked = self
            .state
            .turns
            .last()
            .is_some_and(|t| t.role == TurnRole::User && t.text() == CONTINUE_PROMPT);
        if !already_asked {
            self.state.turns.push(ConversationTurn::user(CONTINUE_PROMPT));
        }

        self.state.retries_used += 1;
        self.echo = EchoGuard::new(replay);
        self.phase = Phase::Starting;
        None
    }

    async fn reopen(&mut self) -> Result<(), UpstreamError> {
        let request = GenerationRequest {
            turns: self.state.turns.clone(),
            ..self.request.clone()
        };
        let opened = tokio::time::timeout(
            self.policy.open_timeout,
            self.upstream.stream_generate(&self.key, &request),
        )
        .await
        .map_err(|_| UpstreamError::Timeout(self.policy.open_timeout))??;

        self.terminal = None;
        self.phase = Phase::Streaming(opened);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::upstream::types::{GenerateContentResponse, GenerationOptions, ModelInfo};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) type Script =
        Result<Vec<Result<GenerateContentResponse, UpstreamError>>, UpstreamError>;

    /// Upstream whose streaming calls replay queued scripts in order.
    #[derive(Default)]
    pub(crate) struct ScriptedUpstream {
        scripts: Mutex<VecDeque<Script>>,
        pub(crate) seen: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedUpstream {
        pub(crate) fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn generate(
            &self,
            _key: &ApiKey,
            _request: &GenerationRequest,
        ) -> Result<GenerateContentResponse, UpstreamError> {
            Err(UpstreamError::Transport("not scripted".to_string()))
        }

        async fn stream_generate(
            &self,
            _key: &ApiKey,
            request: &GenerationRequest,
        ) -> Result<FragmentStream, UpstreamError> {
            self.seen.lock().unwrap().push(request.clone());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(UpstreamError::Transport("script exhausted".to_string())));
            script.map(|events| stream::iter(events).boxed())
        }

        async fn list_models(&self, _key: &ApiKey) -> Result<Vec<ModelInfo>, UpstreamError> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn chunk(
        text: &str,
        finish: Option<&str>,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        let mut candidate =
            serde_json::json!({"content": {"role": "model", "parts": [{"text": text}]}});
        if let Some(reason) = finish {
            candidate["finishReason"] = serde_json::json!(reason);
        }
        Ok(serde_json::from_value(serde_json::json!({"candidates": [candidate]})).unwrap())
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "gemini-2.0-flash".to_string(),
            turns: vec![ConversationTurn::user("tell me a story")],
            system_instruction: None,
            options: GenerationOptions::default(),
        }
    }

    fn policy(max_retries: u32) -> HealingPolicy {
        HealingPolicy {
            max_retries,
            idle_timeout: Duration::from_secs(5),
            open_timeout: Duration::from_secs(5),
        }
    }

    /// Open the first script the way the orchestrator does, then wrap it.
    async fn session(upstream: Arc<ScriptedUpstream>, max_retries: u32) -> HealingSession {
        let key = ApiKey::from("key-abcd1234");
        let opened = upstream.stream_generate(&key, &request()).await.unwrap();
        HealingSession::new(upstream, key, request(), opened, policy(max_retries))
    }

    async fn collect(session: HealingSession) -> Vec<Result<StreamFragment, UpstreamError>> {
        session.into_stream().collect().await
    }

    fn texts(events: &[Result<StreamFragment, UpstreamError>]) -> String {
        events
            .iter()
            .filter_map(|e| e.as_ref().ok())
            .map(|f| f.text.as_str())
            .collect()
    }

    #[test]
    fn test_policy_heals_gemini_models_only() {
        let mut config = Config::default();
        config.healing.enabled = true;
        config.healing.max_retries = 3;

        assert_eq!(HealingPolicy::for_model(&config, "gemini-2.0-flash").max_retries, 3);
        assert_eq!(HealingPolicy::for_model(&config, "learnlm-1.5-pro").max_retries, 0);

        config.healing.enabled = false;
        assert_eq!(HealingPolicy::for_model(&config, "gemini-2.0-flash").max_retries, 0);
    }

    #[tokio::test]
    async fn test_clean_stream_passes_through() {
        let upstream = ScriptedUpstream::new(vec![Ok(vec![
            chunk("Once ", None),
            chunk("upon a time.", Some("STOP")),
        ])]);
        let events = collect(session(upstream.clone(), 2).await).await;

        assert_eq!(events.len(), 2);
        assert_eq!(texts(&events), "Once upon a time.");
        assert_eq!(
            events[1].as_ref().unwrap().finish,
            Some(FinishReason::Stop)
        );
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_heals_after_drop() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![
                chunk("F1 ", None),
                Err(UpstreamError::Transport("reset".to_string())),
            ]),
            Ok(vec![chunk("F2", Some("STOP"))]),
        ]);
        let events = collect(session(upstream.clone(), 2).await).await;

        assert!(events.iter().all(|e| e.is_ok()));
        assert_eq!(texts(&events), "F1 F2");

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1].turns,
            vec![
                ConversationTurn::user("tell me a story"),
                ConversationTurn::model("F1 "),
                ConversationTurn::user(CONTINUE_PROMPT),
            ]
        );
    }

    #[tokio::test]
    async fn test_state_follows_interruptions() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("F1 ", None)]),
            Ok(vec![chunk("F2", Some("STOP"))]),
        ]);
        let mut session = session(upstream, 2).await;
        assert_eq!(session.state().retries_used, 0);
        assert_eq!(session.state().turns.len(), 1);

        let first = session.next_event().await.unwrap().unwrap();
        assert_eq!(first.text, "F1 ");
        assert_eq!(session.state().accumulated_text, "F1 ");

        let second = session.next_event().await.unwrap().unwrap();
        assert_eq!(second.text, "F2");
        let state = session.state();
        assert_eq!(state.retries_used, 1);
        assert_eq!(state.accumulated_text, "F2");
        assert_eq!(state.turns.last().unwrap().text(), CONTINUE_PROMPT);

        assert!(session.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_interruption() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("partial", None)]),
            Ok(vec![chunk(" rest", Some("STOP"))]),
        ]);
        let events = collect(session(upstream.clone(), 1).await).await;

        assert_eq!(texts(&events), "partial rest");
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("a", None)]),
            Ok(vec![chunk("b", None)]),
            Ok(vec![chunk("c", None)]),
            Ok(vec![chunk("never", Some("STOP"))]),
        ]);
        let events = collect(session(upstream.clone(), 2).await).await;

        assert_eq!(upstream.calls(), 3);
        assert_eq!(texts(&events), "abc");
        assert_eq!(events.last().unwrap(), &Err(UpstreamError::Truncated));
        assert_eq!(events.iter().filter(|e| e.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_healing_disabled_surfaces_error() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![
                chunk("only chunk", None),
                Err(UpstreamError::Transport("reset".to_string())),
            ]),
            Ok(vec![chunk("unused", Some("STOP"))]),
        ]);
        let events = collect(session(upstream.clone(), 0).await).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().text, "only chunk");
        assert_eq!(
            events[1],
            Err(UpstreamError::Transport("reset".to_string()))
        );
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_safety_block_ends_without_retry() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("some text", None), chunk("", Some("SAFETY"))]),
            Ok(vec![chunk("unused", Some("STOP"))]),
        ]);
        let events = collect(session(upstream.clone(), 2).await).await;

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].as_ref().unwrap().finish,
            Some(FinishReason::Safety)
        );
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_terminal_without_content_is_retried() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("", Some("STOP"))]),
            Ok(vec![chunk("hello", Some("STOP"))]),
        ]);
        let events = collect(session(upstream.clone(), 1).await).await;

        assert_eq!(texts(&events), "hello");
        assert_eq!(upstream.calls(), 2);
        // Nothing was replayed, so only the continue turn is added.
        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen[1].turns.len(), 2);
    }

    #[tokio::test]
    async fn test_continue_turn_not_duplicated() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("x", None)]),
            Err(UpstreamError::Status {
                status: 503,
                message: "busy".to_string(),
            }),
            Ok(vec![chunk("y", Some("STOP"))]),
        ]);
        let events = collect(session(upstream.clone(), 2).await).await;

        assert_eq!(texts(&events), "xy");
        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].turns, seen[1].turns);
        assert_eq!(
            seen[2].turns.iter().filter(|t| t.text() == CONTINUE_PROMPT).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_echoed_text_is_dropped() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("The quick ", None)]),
            Ok(vec![
                chunk("The qu", None),
                chunk("ick brown fox", Some("STOP")),
            ]),
        ]);
        let events = collect(session(upstream, 1).await).await;

        assert_eq!(texts(&events), "The quick brown fox");
    }

    #[tokio::test]
    async fn test_divergent_text_after_resume_is_kept() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("Hello", None)]),
            Ok(vec![chunk("He", None), chunk("y there", Some("STOP"))]),
        ]);
        let events = collect(session(upstream, 1).await).await;

        assert_eq!(texts(&events), "HelloHey there");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_interrupts() {
        let upstream = ScriptedUpstream::new(vec![Ok(vec![chunk("late", Some("STOP"))])]);
        let key = ApiKey::from("key-abcd1234");
        let stalled: FragmentStream = stream::pending().boxed();
        let session = HealingSession::new(upstream.clone(), key, request(), stalled, policy(1));

        let events = collect(session).await;
        assert_eq!(texts(&events), "late");
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_attempts() {
        let upstream = ScriptedUpstream::new(vec![
            Ok(vec![chunk("first", None)]),
            Ok(vec![chunk("second", Some("STOP"))]),
        ]);
        let mut events = session(upstream.clone(), 2).await.into_stream();

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.text, "first");
        drop(events);

        assert_eq!(upstream.calls(), 1);
    }

    #[test]
    fn test_echo_guard_exact_repeat_then_more() {
        let mut guard = EchoGuard::new("abc".to_string());
        assert_eq!(guard.filter("abc"), "");
        assert_eq!(guard.filter("def"), "def");
    }

    #[test]
    fn test_echo_guard_inactive_without_replay() {
        let mut guard = EchoGuard::new(String::new());
        assert_eq!(guard.filter("abc"), "abc");
    }
}
