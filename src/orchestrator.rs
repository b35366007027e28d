//! Chat orchestrator
//!
//! Drives one chat turn end to end:
//! validate → load vault → guardrail → system prompt → model turn 1 →
//! concurrent tool fan-out → model turn 2 (iff tools ran) → final text.
//!
//! The batch path returns the complete string; the streaming path pushes
//! fragments onto an mpsc channel and treats channel closure as caller
//! cancellation.

use crate::chain::ChainAgent;
use crate::error::ChatError;
use crate::gemini::{Content, GeminiClient, ModelTurn};
use crate::guardrail::Guardrail;
use crate::models::{ChatTurn, GuardrailVerdict, MessageRole, ToolResult, Vault};
use crate::prompt::{block_team_response, block_token_response, build_system_prompt};
use crate::store::VaultStore;
use crate::tools::{create_registry, ToolRegistry};
use crate::Result;
use futures_util::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Raw chat request as submitted by the caller. Fields are optional so
/// validation can produce the exact error messages the contract promises
/// instead of opaque deserialization failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Option<Vec<IncomingTurn>>,
    pub vault_id: Option<i64>,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingTurn {
    pub role: Option<String>,
    pub content: Option<String>,
}

/// A request that passed validation.
#[derive(Debug)]
struct ValidatedChat {
    turns: Vec<ChatTurn>,
    latest: String,
    vault_id: i64,
    wallet_address: Option<String>,
}

pub struct ChatOrchestrator {
    gemini: GeminiClient,
    guardrail: Guardrail,
    agent: Arc<ChainAgent>,
    store: Arc<dyn VaultStore>,
}

impl ChatOrchestrator {
    pub fn new(
        gemini_api_key: String,
        agent: Arc<ChainAgent>,
        store: Arc<dyn VaultStore>,
    ) -> Self {
        Self {
            gemini: GeminiClient::new(gemini_api_key.clone()),
            guardrail: Guardrail::new(gemini_api_key),
            agent,
            store,
        }
    }

    pub fn agent(&self) -> &ChainAgent {
        &self.agent
    }

    /// Batch contract: run the full pipeline and return the final text.
    pub async fn chat(&self, request: ChatRequest) -> Result<String> {
        let validated = validate(request)?;
        let vault = self.load_vault(validated.vault_id).await?;

        // RPC liveness probe before any model work, as the original flow did.
        self.agent.probe().await?;

        let verdict = self
            .guardrail
            .classify(&validated.latest, &vault.name)
            .await;

        let response = match canned_response(&vault.name, verdict) {
            Some(blocked) => blocked,
            None => {
                let (registry, system_prompt) = self.prepare(&vault, &validated);
                self.run_model_turns(&system_prompt, &validated.latest, &registry)
                    .await?
            }
        };

        self.persist_turn(&validated, &vault, &response).await;

        Ok(response)
    }

    /// Pre-flight for the streaming endpoint: runs the same validation and
    /// vault lookup as a full turn so those failures surface as proper HTTP
    /// statuses before any response body is committed.
    pub async fn check_request(&self, request: ChatRequest) -> Result<()> {
        let validated = validate(request)?;
        self.load_vault(validated.vault_id).await?;
        Ok(())
    }

    /// Streaming contract: push fragments onto `tx` as they are produced.
    /// A closed channel means the caller went away; the producer aborts at
    /// its next suspension point with `StreamClosed`.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<()> {
        let validated = validate(request)?;
        let vault = self.load_vault(validated.vault_id).await?;

        self.agent.probe().await?;

        let verdict = self
            .guardrail
            .classify(&validated.latest, &vault.name)
            .await;

        if let Some(blocked) = canned_response(&vault.name, verdict) {
            tx.send(blocked.clone())
                .await
                .map_err(|_| ChatError::StreamClosed)?;
            self.persist_turn(&validated, &vault, &blocked).await;
            return Ok(());
        }

        if tx.is_closed() {
            return Err(ChatError::StreamClosed);
        }

        let (registry, system_prompt) = self.prepare(&vault, &validated);
        let declarations = registry.declarations();
        let contents = vec![Content::user(validated.latest.clone())];

        // Turn 1 streams as it arrives; tool-call parts are buffered out of
        // the fragment stream, so when tools run the turn-1 text is emitted
        // preamble ahead of the streamed follow-up turn.
        let turn = self
            .gemini
            .stream_invoke(Some(&system_prompt), &contents, &declarations, &tx)
            .await?;

        let mut response = turn.text.clone();

        if !turn.tool_calls.is_empty() {
            if tx.is_closed() {
                return Err(ChatError::StreamClosed);
            }

            let results = self.execute_tools(&registry, &turn).await;
            let follow_up = follow_up_contents(contents, &turn, &results);

            let final_turn = self
                .gemini
                .stream_invoke(Some(&system_prompt), &follow_up, &declarations, &tx)
                .await?;
            response.push_str(&final_turn.text);
        }

        self.persist_turn(&validated, &vault, &response).await;

        Ok(())
    }

    async fn load_vault(&self, vault_id: i64) -> Result<Vault> {
        self.store
            .get_vault(vault_id)
            .await?
            .ok_or(ChatError::VaultNotFound)
    }

    fn prepare(&self, vault: &Vault, validated: &ValidatedChat) -> (ToolRegistry, String) {
        let registry = create_registry(self.agent.clone(), self.store.clone(), vault);
        let system_prompt = build_system_prompt(
            vault,
            vault.available_prize,
            &self.agent.address(),
            &validated.turns,
        );
        (registry, system_prompt)
    }

    async fn run_model_turns(
        &self,
        system_prompt: &str,
        latest: &str,
        registry: &ToolRegistry,
    ) -> Result<String> {
        let declarations = registry.declarations();
        let contents = vec![Content::user(latest.to_string())];

        let turn = self
            .gemini
            .invoke(Some(system_prompt), &contents, &declarations)
            .await?;

        if turn.tool_calls.is_empty() {
            debug!("Model answered without tool calls");
            return Ok(turn.text);
        }

        let results = self.execute_tools(registry, &turn).await;
        let follow_up = follow_up_contents(contents, &turn, &results);

        let final_turn = self
            .gemini
            .invoke(Some(system_prompt), &follow_up, &declarations)
            .await?;

        Ok(final_turn.text)
    }

    /// Dispatch every tool call from one model turn concurrently. Results
    /// come back matched to their originating call by id; order of
    /// completion does not matter.
    async fn execute_tools(&self, registry: &ToolRegistry, turn: &ModelTurn) -> Vec<ToolResult> {
        info!(count = turn.tool_calls.len(), "Executing tool calls");

        join_all(turn.tool_calls.iter().map(|call| registry.run(call))).await
    }

    /// Append the turn to the persisted transcript when the caller
    /// identified themselves. Transcript failures are logged, never fatal.
    async fn persist_turn(&self, validated: &ValidatedChat, vault: &Vault, response: &str) {
        let Some(wallet) = validated.wallet_address.as_deref() else {
            return;
        };

        let result = async {
            let conversation = self
                .store
                .get_or_create_conversation(wallet, vault.id)
                .await?;
            self.store
                .append_message(conversation.id, MessageRole::User, &validated.latest)
                .await?;
            self.store
                .append_message(conversation.id, MessageRole::Assistant, response)
                .await?;
            Ok::<(), ChatError>(())
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to persist chat turn: {}", e);
        }
    }
}

/// Interleave the first-turn contents with the assistant's tool-call
/// message and one tool-result part per call.
fn follow_up_contents(
    mut contents: Vec<Content>,
    turn: &ModelTurn,
    results: &[ToolResult],
) -> Vec<Content> {
    contents.push(Content::model_turn(turn));
    contents.push(Content::tool_results(results));
    contents
}

/// Terminal response for a blocked verdict, if any.
fn canned_response(club_name: &str, verdict: GuardrailVerdict) -> Option<String> {
    match verdict {
        GuardrailVerdict::Allow => None,
        GuardrailVerdict::BlockToken => Some(block_token_response(club_name)),
        GuardrailVerdict::BlockTeam => Some(block_team_response(club_name)),
    }
}

fn validate(request: ChatRequest) -> Result<ValidatedChat> {
    let messages = request
        .messages
        .ok_or_else(|| ChatError::Validation("Messages array is required".to_string()))?;

    if messages.is_empty() {
        return Err(ChatError::Validation(
            "At least one message is required".to_string(),
        ));
    }

    let mut turns = Vec::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        let role = message.role.as_deref().unwrap_or("");
        let content = message.content.as_deref().unwrap_or("");
        if role.is_empty() || content.is_empty() {
            return Err(ChatError::Validation(format!(
                "Invalid message format at index {}",
                index
            )));
        }
        turns.push(ChatTurn {
            role: role.to_string(),
            content: content.to_string(),
        });
    }

    let vault_id = request
        .vault_id
        .ok_or_else(|| ChatError::Validation("Vault ID is required".to_string()))?;

    let latest = turns.last().ok_or_else(|| {
        ChatError::Validation("At least one message is required".to_string())
    })?;
    if latest.role != "user" {
        return Err(ChatError::Validation(
            "Latest message must be from user".to_string(),
        ));
    }
    let latest = latest.content.clone();

    Ok(ValidatedChat {
        turns,
        latest,
        vault_id,
        wallet_address: request.wallet_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryVaultStore, NewVault};

    fn turn(role: &str, content: &str) -> IncomingTurn {
        IncomingTurn {
            role: Some(role.to_string()),
            content: Some(content.to_string()),
        }
    }

    fn request(messages: Option<Vec<IncomingTurn>>, vault_id: Option<i64>) -> ChatRequest {
        ChatRequest {
            messages,
            vault_id,
            wallet_address: None,
        }
    }

    fn orchestrator_with_store() -> (ChatOrchestrator, Arc<InMemoryVaultStore>) {
        let store = Arc::new(InMemoryVaultStore::new());
        let agent = Arc::new(
            ChainAgent::new(
                "0x0000000000000000000000000000000000000000000000000000000000000001",
                "https://spicy-rpc.chiliz.com",
            )
            .unwrap(),
        );
        let orchestrator =
            ChatOrchestrator::new("test-key".to_string(), agent, store.clone());
        (orchestrator, store)
    }

    #[test]
    fn test_validate_missing_messages() {
        let err = validate(request(None, Some(1))).unwrap_err();
        assert_eq!(err.to_string(), "Messages array is required");
    }

    #[test]
    fn test_validate_empty_messages() {
        let err = validate(request(Some(vec![]), Some(1))).unwrap_err();
        assert_eq!(err.to_string(), "At least one message is required");
    }

    #[test]
    fn test_validate_malformed_message() {
        let messages = vec![
            turn("user", "hello"),
            IncomingTurn {
                role: Some("user".to_string()),
                content: None,
            },
        ];
        let err = validate(request(Some(messages), Some(1))).unwrap_err();
        assert_eq!(err.to_string(), "Invalid message format at index 1");
    }

    #[test]
    fn test_validate_missing_vault_id() {
        let err = validate(request(Some(vec![turn("user", "hi")]), None)).unwrap_err();
        assert_eq!(err.to_string(), "Vault ID is required");
    }

    #[test]
    fn test_validate_latest_must_be_user() {
        let messages = vec![turn("user", "hi"), turn("assistant", "hello")];
        let err = validate(request(Some(messages), Some(1))).unwrap_err();
        assert_eq!(err.to_string(), "Latest message must be from user");
    }

    #[test]
    fn test_validate_accepts_well_formed_request() {
        let messages = vec![turn("assistant", "welcome"), turn("user", "tell me about PSG")];
        let validated = validate(request(Some(messages), Some(7))).unwrap();
        assert_eq!(validated.vault_id, 7);
        assert_eq!(validated.latest, "tell me about PSG");
        assert_eq!(validated.turns.len(), 2);
    }

    #[test]
    fn test_canned_responses() {
        assert!(canned_response("PSG", GuardrailVerdict::Allow).is_none());

        let token = canned_response("PSG", GuardrailVerdict::BlockToken).unwrap();
        assert!(token.contains("the PSG vault"));
        assert!(!token.contains("50 CHZ"));

        let team = canned_response("PSG", GuardrailVerdict::BlockTeam).unwrap();
        assert!(team.contains("only discuss PSG"));
    }

    #[tokio::test]
    async fn test_chat_rejects_invalid_input_before_any_upstream_call() {
        let (orchestrator, _store) = orchestrator_with_store();

        let err = orchestrator.chat(request(Some(vec![]), Some(1))).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn test_chat_unknown_vault_is_404_before_classification() {
        let (orchestrator, store) = orchestrator_with_store();
        store
            .create_vault(NewVault {
                name: "PSG".to_string(),
                total_prize: 100.0,
                sponsor: None,
                ai_prompt: None,
                sponsor_links: None,
            })
            .await
            .unwrap();

        let err = orchestrator
            .chat(request(Some(vec![turn("user", "hi")]), Some(999_999)))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::VaultNotFound));
    }

    #[tokio::test]
    async fn test_persisted_turn_appends_user_and_assistant_messages() {
        let (orchestrator, store) = orchestrator_with_store();
        let vault = store
            .create_vault(NewVault {
                name: "PSG".to_string(),
                total_prize: 100.0,
                sponsor: None,
                ai_prompt: None,
                sponsor_links: None,
            })
            .await
            .unwrap();

        let validated = ValidatedChat {
            turns: vec![ChatTurn {
                role: "user".to_string(),
                content: "Who wears 10?".to_string(),
            }],
            latest: "Who wears 10?".to_string(),
            vault_id: vault.id,
            wallet_address: Some("0xfan".to_string()),
        };

        orchestrator
            .persist_turn(&validated, &vault, "Tell me first.")
            .await;

        let conversation = store
            .get_or_create_conversation("0xfan", vault.id)
            .await
            .unwrap();
        let messages = store.list_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "Who wears 10?");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "Tell me first.");
    }

    #[tokio::test]
    async fn test_persist_is_skipped_without_wallet_address() {
        let (orchestrator, store) = orchestrator_with_store();
        let vault = store
            .create_vault(NewVault {
                name: "PSG".to_string(),
                total_prize: 100.0,
                sponsor: None,
                ai_prompt: None,
                sponsor_links: None,
            })
            .await
            .unwrap();

        let validated = ValidatedChat {
            turns: vec![],
            latest: "anonymous question".to_string(),
            vault_id: vault.id,
            wallet_address: None,
        };

        orchestrator.persist_turn(&validated, &vault, "answer").await;

        let conversation = store
            .get_or_create_conversation("0xfan", vault.id)
            .await
            .unwrap();
        assert!(store
            .list_messages(conversation.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stream_validation_errors_surface_before_streaming() {
        let (orchestrator, _store) = orchestrator_with_store();
        let (tx, _rx) = mpsc::channel(8);

        let err = orchestrator
            .chat_stream(request(None, Some(1)), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }
}
