//! Persistence layer for vaults, conversations, and messages
//!
//! Thin CRUD over the hosted database. The only business rule living here
//! is the atomic decrement-with-floor on the prize ledger, which the
//! transfer tool relies on so the model's conversational "grants" can
//! never overdraw a vault.

use crate::error::ChatError;
use crate::models::{Conversation, Message, MessageRole, Vault};
use crate::Result;
use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

/// Fields supplied by the (external) vault-creation flow.
#[derive(Debug, Clone)]
pub struct NewVault {
    pub name: String,
    pub total_prize: f64,
    pub sponsor: Option<String>,
    pub ai_prompt: Option<String>,
    pub sponsor_links: Option<serde_json::Value>,
}

/// Trait for vault/conversation persistence
#[async_trait::async_trait]
pub trait VaultStore: Send + Sync {
    async fn get_vault(&self, id: i64) -> Result<Option<Vault>>;
    async fn create_vault(&self, new: NewVault) -> Result<Vault>;

    /// Atomically subtract `amount` from the available prize, failing with
    /// `InsufficientPrize` when the balance would go below zero.
    /// Returns the remaining available prize.
    async fn debit_available_prize(&self, vault_id: i64, amount: f64) -> Result<f64>;

    /// Compensating credit for a debit whose on-chain transfer failed.
    async fn credit_available_prize(&self, vault_id: i64, amount: f64) -> Result<f64>;

    async fn get_or_create_conversation(
        &self,
        user_wallet: &str,
        vault_id: i64,
    ) -> Result<Conversation>;

    async fn append_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<Message>;

    async fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>>;
}

//
// ================= In-Memory Store =================
//

#[derive(Default)]
struct InMemoryInner {
    vaults: HashMap<i64, Vault>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    next_vault_id: i64,
    next_conversation_id: i64,
    next_message_id: i64,
}

/// In-memory store for development and tests
pub struct InMemoryVaultStore {
    inner: Arc<RwLock<InMemoryInner>>,
}

impl InMemoryVaultStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(InMemoryInner {
                next_vault_id: 1,
                next_conversation_id: 1,
                next_message_id: 1,
                ..Default::default()
            })),
        }
    }
}

impl Default for InMemoryVaultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VaultStore for InMemoryVaultStore {
    async fn get_vault(&self, id: i64) -> Result<Option<Vault>> {
        let inner = self.inner.read().await;
        Ok(inner.vaults.get(&id).cloned())
    }

    async fn create_vault(&self, new: NewVault) -> Result<Vault> {
        let mut inner = self.inner.write().await;
        let id = inner.next_vault_id;
        inner.next_vault_id += 1;

        let vault = Vault {
            id,
            name: new.name,
            total_prize: new.total_prize,
            available_prize: new.total_prize,
            sponsor: new.sponsor,
            ai_prompt: new.ai_prompt,
            sponsor_links: new.sponsor_links,
            created_at: Utc::now(),
        };
        inner.vaults.insert(id, vault.clone());
        Ok(vault)
    }

    async fn debit_available_prize(&self, vault_id: i64, amount: f64) -> Result<f64> {
        let mut inner = self.inner.write().await;
        let vault = inner
            .vaults
            .get_mut(&vault_id)
            .ok_or(ChatError::VaultNotFound)?;

        if amount > vault.available_prize {
            return Err(ChatError::InsufficientPrize {
                requested: amount,
                available: vault.available_prize,
            });
        }

        vault.available_prize -= amount;
        Ok(vault.available_prize)
    }

    async fn credit_available_prize(&self, vault_id: i64, amount: f64) -> Result<f64> {
        let mut inner = self.inner.write().await;
        let vault = inner
            .vaults
            .get_mut(&vault_id)
            .ok_or(ChatError::VaultNotFound)?;

        // available_prize <= total_prize must hold after compensation too
        vault.available_prize = (vault.available_prize + amount).min(vault.total_prize);
        Ok(vault.available_prize)
    }

    async fn get_or_create_conversation(
        &self,
        user_wallet: &str,
        vault_id: i64,
    ) -> Result<Conversation> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner
            .conversations
            .iter()
            .find(|c| c.user_wallet == user_wallet && c.vault_id == vault_id)
        {
            return Ok(existing.clone());
        }

        let id = inner.next_conversation_id;
        inner.next_conversation_id += 1;

        let conversation = Conversation {
            id,
            user_wallet: user_wallet.to_string(),
            vault_id,
            created_at: Utc::now(),
        };
        inner.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let mut inner = self.inner.write().await;
        let id = inner.next_message_id;
        inner.next_message_id += 1;

        let message = Message {
            id,
            conversation_id,
            content: content.to_string(),
            role,
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

//
// ================= Postgres Store =================
//

/// Postgres-backed store (hosted Supabase in production)
pub struct PostgresVaultStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresVaultStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| ChatError::Database(format!("Failed to initialize pool: {}", e)))?;

        info!("Vault store backend: postgres");

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS vaults (
                      id BIGSERIAL PRIMARY KEY,
                      name TEXT NOT NULL,
                      total_prize DOUBLE PRECISION NOT NULL DEFAULT 0,
                      available_prize DOUBLE PRECISION NOT NULL DEFAULT 0,
                      sponsor TEXT,
                      ai_prompt TEXT,
                      sponsor_links JSONB,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversations (
                      id BIGSERIAL PRIMARY KEY,
                      user_wallet TEXT NOT NULL,
                      vault_id BIGINT NOT NULL REFERENCES vaults(id),
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      UNIQUE (user_wallet, vault_id)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS messages (
                      id BIGSERIAL PRIMARY KEY,
                      conversation_id BIGINT NOT NULL REFERENCES conversations(id),
                      content TEXT NOT NULL,
                      role TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| ChatError::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    fn vault_from_row(row: &sqlx::postgres::PgRow) -> Vault {
        Vault {
            id: row.try_get("id").unwrap_or_default(),
            name: row.try_get("name").unwrap_or_default(),
            total_prize: row.try_get("total_prize").unwrap_or(0.0),
            available_prize: row.try_get("available_prize").unwrap_or(0.0),
            sponsor: row.try_get("sponsor").ok(),
            ai_prompt: row.try_get("ai_prompt").ok(),
            sponsor_links: row.try_get("sponsor_links").ok(),
            created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
        }
    }

    fn role_from_db(role: &str) -> MessageRole {
        match role {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

#[async_trait::async_trait]
impl VaultStore for PostgresVaultStore {
    async fn get_vault(&self, id: i64) -> Result<Option<Vault>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT * FROM vaults WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ChatError::Database(format!("Failed to load vault: {}", e)))?;

        Ok(row.as_ref().map(Self::vault_from_row))
    }

    async fn create_vault(&self, new: NewVault) -> Result<Vault> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO vaults (name, total_prize, available_prize, sponsor, ai_prompt, sponsor_links)
            VALUES ($1, $2, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(new.total_prize)
        .bind(&new.sponsor)
        .bind(&new.ai_prompt)
        .bind(&new.sponsor_links)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ChatError::Database(format!("Failed to create vault: {}", e)))?;

        Ok(Self::vault_from_row(&row))
    }

    async fn debit_available_prize(&self, vault_id: i64, amount: f64) -> Result<f64> {
        self.ensure_schema().await?;

        // Single statement so the floor check and the decrement are atomic.
        let row = sqlx::query(
            r#"
            UPDATE vaults
            SET available_prize = available_prize - $2
            WHERE id = $1 AND available_prize >= $2
            RETURNING available_prize
            "#,
        )
        .bind(vault_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ChatError::Database(format!("Failed to debit vault: {}", e)))?;

        match row {
            Some(row) => Ok(row.try_get("available_prize").unwrap_or(0.0)),
            None => {
                let vault = self
                    .get_vault(vault_id)
                    .await?
                    .ok_or(ChatError::VaultNotFound)?;
                Err(ChatError::InsufficientPrize {
                    requested: amount,
                    available: vault.available_prize,
                })
            }
        }
    }

    async fn credit_available_prize(&self, vault_id: i64, amount: f64) -> Result<f64> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            UPDATE vaults
            SET available_prize = LEAST(available_prize + $2, total_prize)
            WHERE id = $1
            RETURNING available_prize
            "#,
        )
        .bind(vault_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ChatError::Database(format!("Failed to credit vault: {}", e)))?;

        row.map(|r| r.try_get("available_prize").unwrap_or(0.0))
            .ok_or(ChatError::VaultNotFound)
    }

    async fn get_or_create_conversation(
        &self,
        user_wallet: &str,
        vault_id: i64,
    ) -> Result<Conversation> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO conversations (user_wallet, vault_id)
            VALUES ($1, $2)
            ON CONFLICT (user_wallet, vault_id) DO UPDATE SET user_wallet = EXCLUDED.user_wallet
            RETURNING id, user_wallet, vault_id, created_at
            "#,
        )
        .bind(user_wallet)
        .bind(vault_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ChatError::Database(format!("Failed to load conversation: {}", e)))?;

        Ok(Conversation {
            id: row.try_get("id").unwrap_or_default(),
            user_wallet: row.try_get("user_wallet").unwrap_or_default(),
            vault_id: row.try_get("vault_id").unwrap_or_default(),
            created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
        })
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO messages (conversation_id, content, role)
            VALUES ($1, $2, $3)
            RETURNING id, conversation_id, content, role, created_at
            "#,
        )
        .bind(conversation_id)
        .bind(content)
        .bind(role.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ChatError::Database(format!("Failed to append message: {}", e)))?;

        let role: String = row.try_get("role").unwrap_or_else(|_| "user".to_string());

        Ok(Message {
            id: row.try_get("id").unwrap_or_default(),
            conversation_id: row.try_get("conversation_id").unwrap_or_default(),
            content: row.try_get("content").unwrap_or_default(),
            role: Self::role_from_db(&role),
            created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
        })
    }

    async fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, content, role, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ChatError::Database(format!("Failed to load messages: {}", e)))?;

        Ok(rows
            .iter()
            .map(|row| {
                let role: String = row.try_get("role").unwrap_or_else(|_| "user".to_string());
                Message {
                    id: row.try_get("id").unwrap_or_default(),
                    conversation_id: row.try_get("conversation_id").unwrap_or_default(),
                    content: row.try_get("content").unwrap_or_default(),
                    role: Self::role_from_db(&role),
                    created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
                }
            })
            .collect())
    }
}

/// Select the backend from configuration: Postgres when a database URL is
/// present, otherwise in-memory.
pub fn build_store(database_url: Option<&str>) -> Result<Arc<dyn VaultStore>> {
    match database_url {
        Some(url) => Ok(Arc::new(PostgresVaultStore::connect_lazy(url)?)),
        None => {
            info!("Vault store backend: in-memory");
            Ok(Arc::new(InMemoryVaultStore::new()))
        }
    }
}
