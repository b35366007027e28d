//! Tool trait and registry
//!
//! Tools are the blockchain-reading/writing functions the model may call
//! mid-conversation. Each tool is self-contained: it parses its argument
//! object, performs one chain operation through the bound agent, and
//! returns a string. Execution failures are converted to descriptive
//! error strings so one failing tool never aborts the orchestration.

use crate::chain::ChainAgent;
use crate::error::ChatError;
use crate::gemini::ToolDeclaration;
use crate::models::{ToolCall, ToolResult, Vault};
use crate::store::VaultStore;
use crate::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Trait for a single model-callable tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the argument object, surfaced to the model.
    fn parameters(&self) -> Value;
    async fn execute(&self, args: &Value) -> Result<String>;
}

/// Tool registry for looking up and executing tools by model-supplied name
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Function declarations handed to the model.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<ToolDeclaration> = self
            .tools
            .values()
            .map(|tool| ToolDeclaration {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    /// Execute one model-requested call. Never errors: unknown names and
    /// execution failures become result strings handed back to the model.
    pub async fn run(&self, call: &ToolCall) -> ToolResult {
        let content = match self.get(&call.name) {
            None => {
                warn!(tool = %call.name, "Tool not found");
                format!("Tool {} not found.", call.name)
            }
            Some(tool) => match tool.execute(&call.args).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool execution failed");
                    format!("Error executing tool {}: {}", call.name, e)
                }
            },
        };

        ToolResult {
            call_id: call.id,
            name: call.name.clone(),
            content,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Argument Helpers =================
//

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ChatError::Tool(format!("Expected string argument {:?}", key)))
}

fn require_f64(args: &Value, key: &str) -> Result<f64> {
    args.get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| ChatError::Tool(format!("Expected positive number argument {:?}", key)))
}

//
// ================= Tools =================
//

/// Native CHZ balance of the agent wallet.
pub struct GetNativeBalanceTool {
    agent: Arc<ChainAgent>,
}

#[async_trait::async_trait]
impl Tool for GetNativeBalanceTool {
    fn name(&self) -> &'static str {
        "get_native_balance"
    }

    fn description(&self) -> &'static str {
        "Get the vault wallet's native CHZ balance"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _args: &Value) -> Result<String> {
        let balance = self.agent.native_balance().await?;
        Ok(format!("{} CHZ", balance))
    }
}

/// Fan-token balance of an arbitrary holder for one club.
pub struct GetTokenBalanceTool {
    agent: Arc<ChainAgent>,
}

#[async_trait::async_trait]
impl Tool for GetTokenBalanceTool {
    fn name(&self) -> &'static str {
        "get_token_balance"
    }

    fn description(&self) -> &'static str {
        "Get the fan-token balance of a wallet address for a given club code"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "club": {
                    "type": "string",
                    "description": "Club code, e.g. PSG or BAR"
                },
                "address": {
                    "type": "string",
                    "description": "Holder wallet address (0x-prefixed)"
                }
            },
            "required": ["club", "address"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<String> {
        let club = require_str(args, "club")?;
        let address = require_str(args, "address")?;

        let balance = self.agent.token_balance(club, address).await?;
        Ok(format!("{} holds {} {} fan tokens", address, balance, club.to_uppercase()))
    }
}

/// Reward transfer from the vault wallet, gated by the prize ledger.
///
/// The debit-with-floor runs before the chain transfer, so a
/// conversational "grant" from the model can never overdraw the vault no
/// matter what the prompt said. A failed transfer credits the ledger back.
pub struct SendRewardTool {
    agent: Arc<ChainAgent>,
    store: Arc<dyn VaultStore>,
    vault: Vault,
}

#[async_trait::async_trait]
impl Tool for SendRewardTool {
    fn name(&self) -> &'static str {
        "send_reward"
    }

    fn description(&self) -> &'static str {
        "Transfer earned fan-token rewards from the vault wallet to a fan's address"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": {
                    "type": "string",
                    "description": "Recipient wallet address (0x-prefixed)"
                },
                "amount": {
                    "type": "number",
                    "description": "Reward amount in whole tokens"
                }
            },
            "required": ["to", "amount"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<String> {
        let to = require_str(args, "to")?;
        let amount = require_f64(args, "amount")?;

        let remaining = self
            .store
            .debit_available_prize(self.vault.id, amount)
            .await?;

        match self.agent.transfer_token(&self.vault.name, to, amount).await {
            Ok(tx_hash) => {
                info!(
                    vault_id = self.vault.id,
                    to = %to,
                    amount = amount,
                    tx = %tx_hash,
                    "Reward transferred"
                );
                Ok(format!(
                    "Transferred {} {} to {} (tx {}). Remaining prize pool: {} CHZ",
                    amount, self.vault.name, to, tx_hash, remaining
                ))
            }
            Err(e) => {
                // Compensate the ledger; the tokens never left the wallet.
                if let Err(credit_err) = self
                    .store
                    .credit_available_prize(self.vault.id, amount)
                    .await
                {
                    warn!(
                        vault_id = self.vault.id,
                        error = %credit_err,
                        "Failed to credit back after failed transfer"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Build the per-request registry bound to the agent, the ledger, and the
/// vault being chatted against.
pub fn create_registry(
    agent: Arc<ChainAgent>,
    store: Arc<dyn VaultStore>,
    vault: &Vault,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(GetNativeBalanceTool {
        agent: agent.clone(),
    }));
    registry.register(Arc::new(GetTokenBalanceTool {
        agent: agent.clone(),
    }));
    registry.register(Arc::new(SendRewardTool {
        agent,
        store,
        vault: vault.clone(),
    }));

    registry
}
