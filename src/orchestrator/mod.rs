//! Turn orchestration
//!
//! A turn moves through `Normalizing -> BuildingContext -> Generating ->
//! Persisting -> Completed`, or ends in `Failed(reason)` from any state.
//! The conversation token is held from BuildingContext through Persisting,
//! so at most one turn per conversation is ever in flight, and the user and
//! assistant messages are written as one pair or not at all.

mod locks;

pub use locks::{ConversationLocks, ConversationToken};

use crate::context::ContextWindowBuilder;
use crate::gateway::ModelGateway;
use crate::modality::{ModalityNormalizer, TurnInput};
use crate::persona::{CompanionDirectory, PersonaCompiler};
use crate::store::{Conversation, ConversationStore, Message, MessageRole};
use crate::{CancelPolicy, CompanionConfig, CompanionError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, field, info, info_span, Instrument, Span};

/// Inbound turn submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Authenticated by the caller; trusted as-is
    pub user_id: String,
    pub companion_id: String,
    #[serde(flatten)]
    pub input: TurnInput,
}

impl TurnRequest {
    pub fn new(user_id: impl Into<String>, companion_id: impl Into<String>, input: TurnInput) -> Self {
        Self {
            user_id: user_id.into(),
            companion_id: companion_id.into(),
            input,
        }
    }

    pub fn text(
        user_id: impl Into<String>,
        companion_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(user_id, companion_id, TurnInput::Text(text.into()))
    }
}

/// The persisted pair produced by a completed turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub user_message: Message,
    pub assistant_message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnState {
    Normalizing,
    BuildingContext,
    Generating,
    Persisting,
    Completed,
    /// Terminal; carries the error's reason code
    Failed(&'static str),
}

/// Callback invoked on every state transition of every turn
pub type StateObserver = Arc<dyn Fn(&TurnState) + Send + Sync>;

/// Tracks the current state of one turn and reports transitions.
struct TurnProgress<'a> {
    state: TurnState,
    observer: Option<&'a StateObserver>,
}

impl<'a> TurnProgress<'a> {
    fn start(observer: Option<&'a StateObserver>) -> Self {
        let progress = Self {
            state: TurnState::Normalizing,
            observer,
        };
        progress.report();
        progress
    }

    fn advance(&mut self, next: TurnState) {
        debug!("Turn state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.report();
    }

    fn report(&self) {
        if let Some(observer) = self.observer {
            observer(&self.state);
        }
    }
}

pub struct ConversationOrchestrator {
    store: Arc<dyn ConversationStore>,
    directory: Arc<dyn CompanionDirectory>,
    gateway: ModelGateway,
    window: ContextWindowBuilder,
    persist_timeout: Duration,
    on_cancel: CancelPolicy,
    locks: ConversationLocks,
    observer: Option<StateObserver>,
}

impl ConversationOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        directory: Arc<dyn CompanionDirectory>,
        gateway: ModelGateway,
        config: &CompanionConfig,
    ) -> Self {
        Self {
            store,
            directory,
            gateway,
            window: ContextWindowBuilder::new(config.window_size),
            persist_timeout: config.persist_timeout,
            on_cancel: config.on_cancel,
            locks: ConversationLocks::new(),
            observer: None,
        }
    }

    pub fn with_state_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    /// Run one turn to completion.
    ///
    /// Under [`CancelPolicy::Complete`] the turn runs on its own task, so
    /// dropping this future does not stop a reply that is already being
    /// generated from being persisted. Under [`CancelPolicy::Discard`]
    /// dropping the future abandons the turn and nothing is written.
    pub async fn submit(self: &Arc<Self>, request: TurnRequest) -> Result<TurnResponse> {
        match self.on_cancel {
            CancelPolicy::Discard => self.run_turn(request).await,
            CancelPolicy::Complete => {
                let this = Arc::clone(self);
                match tokio::spawn(async move { this.run_turn(request).await }).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => Err(CompanionError::Persistence(format!("turn task aborted: {e}"))),
                }
            }
        }
    }

    async fn run_turn(&self, request: TurnRequest) -> Result<TurnResponse> {
        let span = info_span!(
            "turn",
            conversation_id = field::Empty,
            input = request.input.kind()
        );

        async {
            let mut progress = TurnProgress::start(self.observer.as_ref());
            match self.execute(&request, &mut progress).await {
                Ok(response) => {
                    progress.advance(TurnState::Completed);
                    Ok(response)
                }
                Err(e) => {
                    error!("Turn failed in {:?}: {}", progress.state, e);
                    progress.advance(TurnState::Failed(e.reason()));
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        request: &TurnRequest,
        progress: &mut TurnProgress<'_>,
    ) -> Result<TurnResponse> {
        let input = ModalityNormalizer::normalize(&request.input)?;

        let companion = self.directory.get_companion(&request.companion_id).await?;
        let preamble = PersonaCompiler::compile(&companion)?;

        let conversation = self
            .resolve_conversation(&request.user_id, &request.companion_id)
            .await?;
        Span::current().record("conversation_id", conversation.id.as_str());

        // Held until this function returns, on every path
        let _token = self.locks.acquire(&conversation.id).await;
        progress.advance(TurnState::BuildingContext);

        // Re-read on every turn; other clients may have written since
        let history = self
            .store
            .list_recent_messages(&conversation.id, self.window.window_size().max(1))
            .await?;
        let context = self.window.build(&history, &preamble, &input);
        let user_at = next_timestamp(history.last().map(|m| m.created_at));

        progress.advance(TurnState::Generating);
        let reply = self.gateway.generate(&context).await?;
        debug!("Model {} replied after {} attempt(s)", reply.model, reply.attempts);

        progress.advance(TurnState::Persisting);
        let user_message = Message::new(
            &conversation.id,
            MessageRole::User,
            input.into_string(),
            user_at,
        );
        let assistant_message = Message::new(
            &conversation.id,
            MessageRole::Assistant,
            reply.content,
            next_timestamp(Some(user_at)),
        );

        self.store
            .append_message_pair_within(
                &conversation.id,
                &user_message,
                &assistant_message,
                self.persist_timeout,
            )
            .await?;

        info!(
            "Turn completed for companion {} ({} prior messages in window)",
            companion.id,
            context.history().len()
        );
        Ok(TurnResponse {
            user_message,
            assistant_message,
        })
    }

    async fn resolve_conversation(&self, user_id: &str, companion_id: &str) -> Result<Conversation> {
        if let Some(existing) = self.store.find_conversation(user_id, companion_id).await? {
            return Ok(existing);
        }
        let created = self.store.create_conversation(user_id, companion_id).await?;
        info!(
            "Started conversation {} for user {} and companion {}",
            created.id, user_id, companion_id
        );
        Ok(created)
    }
}

/// Now, or just after `after` when the clock has not moved past it, so
/// messages within a conversation are strictly ordered by creation time.
fn next_timestamp(after: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match after {
        Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ModelBackend;
    use crate::persona::{Companion, MemoryCompanionDirectory};
    use crate::store::MemoryConversationStore;
    use crate::PromptContext;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct Echo;

    #[async_trait::async_trait]
    impl ModelBackend for Echo {
        async fn complete(&self, context: &PromptContext) -> Result<String> {
            Ok(format!("echo: {}", context.latest_input()))
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    fn orchestrator(store: Arc<MemoryConversationStore>) -> ConversationOrchestrator {
        let directory = MemoryCompanionDirectory::new().with(Companion::new(
            "luna",
            "Luna",
            "A retired astronomer who loves night walks.",
        ));
        let gateway = ModelGateway::new(
            Arc::new(Echo),
            Duration::from_millis(200),
            Duration::from_millis(5),
        );
        ConversationOrchestrator::new(
            store,
            Arc::new(directory),
            gateway,
            &CompanionConfig::new(PathBuf::from("/unused")),
        )
    }

    #[tokio::test]
    async fn test_turn_state_sequence_on_success() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let orchestrator = Arc::new(
            orchestrator(Arc::new(MemoryConversationStore::new())).with_state_observer(Arc::new(
                move |state: &TurnState| recorder.lock().unwrap().push(state.clone()),
            )),
        );

        orchestrator
            .submit(TurnRequest::text("u1", "luna", "Hello"))
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TurnState::Normalizing,
                TurnState::BuildingContext,
                TurnState::Generating,
                TurnState::Persisting,
                TurnState::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_input_fails_before_conversation_exists() {
        let store = Arc::new(MemoryConversationStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let orchestrator = Arc::new(orchestrator(store.clone()).with_state_observer(Arc::new(
            move |state: &TurnState| recorder.lock().unwrap().push(state.clone()),
        )));

        let err = orchestrator
            .submit(TurnRequest::text("u1", "luna", "   "))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "empty_input");
        assert!(store.find_conversation("u1", "luna").await.unwrap().is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![TurnState::Normalizing, TurnState::Failed("empty_input")]
        );
    }

    #[tokio::test]
    async fn test_unknown_companion_is_not_found() {
        let orchestrator = Arc::new(orchestrator(Arc::new(MemoryConversationStore::new())));
        let err = orchestrator
            .submit(TurnRequest::text("u1", "nobody", "Hi"))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "companion_not_found");
    }

    #[tokio::test]
    async fn test_response_carries_normalized_input_and_ordered_times() {
        let store = Arc::new(MemoryConversationStore::new());
        let orchestrator = Arc::new(orchestrator(store.clone()));
        let response = orchestrator
            .submit(TurnRequest::new(
                "u1",
                "luna",
                TurnInput::ImageDescription("A red kite over a beach.".into()),
            ))
            .await
            .unwrap();

        assert_eq!(response.user_message.content, "[Image] A red kite over a beach.");
        assert_eq!(
            response.assistant_message.content,
            "echo: [Image] A red kite over a beach."
        );
        assert!(response.user_message.created_at < response.assistant_message.created_at);
        assert_eq!(
            response.user_message.conversation_id,
            response.assistant_message.conversation_id
        );
        assert!(!orchestrator.locks().is_held(&response.user_message.conversation_id));
    }

    #[test]
    fn test_next_timestamp_is_strictly_after_previous() {
        let future = Utc::now() + ChronoDuration::seconds(60);
        assert_eq!(next_timestamp(Some(future)), future + ChronoDuration::microseconds(1));
        let past = Utc::now() - ChronoDuration::seconds(60);
        assert!(next_timestamp(Some(past)) > past);
    }

    #[test]
    fn test_request_wire_shape() {
        let request: TurnRequest = serde_json::from_str(
            r#"{"userId":"u1","companionId":"luna","inputKind":"voiceTranscript","content":"hello there"}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            TurnRequest::new("u1", "luna", TurnInput::VoiceTranscript("hello there".into()))
        );

        let value = serde_json::to_value(TurnRequest::text("u1", "luna", "hi")).unwrap();
        assert_eq!(value["inputKind"], "text");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["companionId"], "luna");
    }
}
