use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use parley_common::{Attachment, ContentPart, Error, Identity, MessageRole, Result, Visibility};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

/// A conversation row. Immutable after creation except for its sharing state.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub owner_id: String,
    pub workspace_id: String,
    pub title: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub context_window: u32,
    pub agent_id: Option<String>,
    pub visibility: Visibility,
    pub last_shared_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields the pipeline supplies when lazily creating a conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub id: String,
    pub owner_id: String,
    pub workspace_id: String,
    pub title: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub context_window: u32,
    pub agent_id: Option<String>,
}

/// Persisted message row with its assigned sequence position.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
    pub attachments: Vec<Attachment>,
    pub position: i64,
    pub model: Option<String>,
    pub response_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message about to be persisted; the store assigns its position.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
    pub attachments: Vec<Attachment>,
    pub model: Option<String>,
    pub response_id: Option<String>,
}

/// A stored model + system prompt bundle, addressed as `agent/<id>`.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub context_window: u32,
    pub owner_id: String,
    pub workspace_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteKind {
    Up,
    Down,
}

impl VoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteKind::Up => "up",
            VoteKind::Down => "down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(VoteKind::Up),
            "down" => Some(VoteKind::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vote {
    pub conversation_id: String,
    pub message_id: String,
    pub kind: VoteKind,
}

/// Key for the per-day usage counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageKey {
    pub day: String,
    pub user_id: String,
    pub model: String,
    pub workspace_id: String,
}

impl UsageKey {
    pub fn today(user_id: &str, model: &str, workspace_id: &str) -> Self {
        Self {
            day: Utc::now().format("%Y-%m-%d").to_string(),
            user_id: user_id.to_string(),
            model: model.to_string(),
            workspace_id: workspace_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub messages: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Persistent storage for conversations, messages, votes, agents, sessions,
/// and usage counters.
pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening chat store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    model TEXT NOT NULL,
                    system_prompt TEXT NOT NULL DEFAULT '',
                    temperature REAL NOT NULL DEFAULT 0.7,
                    context_window INTEGER NOT NULL DEFAULT 128000,
                    agent_id TEXT,
                    visibility TEXT NOT NULL DEFAULT 'private',
                    last_shared_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id),
                    role TEXT NOT NULL,
                    parts TEXT NOT NULL,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    position INTEGER NOT NULL,
                    model TEXT,
                    response_id TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE (conversation_id, position)
                );

                CREATE INDEX IF NOT EXISTS idx_messages_conversation
                    ON messages(conversation_id, position);

                CREATE TABLE IF NOT EXISTS agents (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    model TEXT NOT NULL,
                    system_prompt TEXT NOT NULL,
                    temperature REAL NOT NULL DEFAULT 0.7,
                    context_window INTEGER NOT NULL DEFAULT 128000,
                    owner_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS votes (
                    conversation_id TEXT NOT NULL REFERENCES conversations(id),
                    message_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    PRIMARY KEY (conversation_id, message_id)
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS usage (
                    day TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    model TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    messages INTEGER NOT NULL DEFAULT 0,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (day, user_id, model, workspace_id)
                );",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub fn create_conversation(&self, new: &NewConversation) -> Result<Conversation> {
        let created_at = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO conversations
                    (id, owner_id, workspace_id, title, model, system_prompt,
                     temperature, context_window, agent_id, visibility, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'private', ?10)",
                params![
                    new.id,
                    new.owner_id,
                    new.workspace_id,
                    new.title,
                    new.model,
                    new.system_prompt,
                    new.temperature,
                    new.context_window,
                    new.agent_id,
                    created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Database(format!("failed to create conversation: {e}")))?;

        Ok(Conversation {
            id: new.id.clone(),
            owner_id: new.owner_id.clone(),
            workspace_id: new.workspace_id.clone(),
            title: new.title.clone(),
            model: new.model.clone(),
            system_prompt: new.system_prompt.clone(),
            temperature: new.temperature,
            context_window: new.context_window,
            agent_id: new.agent_id.clone(),
            visibility: Visibility::Private,
            last_shared_at: None,
            created_at,
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.conn()
            .query_row(
                "SELECT id, owner_id, workspace_id, title, model, system_prompt,
                        temperature, context_window, agent_id, visibility,
                        last_shared_at, created_at
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    let visibility: String = row.get(9)?;
                    let last_shared: Option<String> = row.get(10)?;
                    let created: String = row.get(11)?;
                    Ok(Conversation {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        workspace_id: row.get(2)?,
                        title: row.get(3)?,
                        model: row.get(4)?,
                        system_prompt: row.get(5)?,
                        temperature: row.get(6)?,
                        context_window: row.get(7)?,
                        agent_id: row.get(8)?,
                        visibility: Visibility::parse(&visibility),
                        last_shared_at: last_shared.as_deref().map(parse_timestamp),
                        created_at: parse_timestamp(&created),
                    })
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load conversation: {e}")))
    }

    /// Delete a conversation along with its messages and votes.
    /// Returns false when the id does not exist.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        conn.execute("DELETE FROM votes WHERE conversation_id = ?1", params![id])
            .map_err(|e| Error::Database(format!("failed to delete votes: {e}")))?;
        conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id],
        )
        .map_err(|e| Error::Database(format!("failed to delete messages: {e}")))?;
        let rows = conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .map_err(|e| Error::Database(format!("failed to delete conversation: {e}")))?;
        Ok(rows > 0)
    }

    pub fn set_title(&self, id: &str, title: &str) -> Result<()> {
        let rows = self
            .conn()
            .execute(
                "UPDATE conversations SET title = ?2 WHERE id = ?1",
                params![id, title],
            )
            .map_err(|e| Error::Database(format!("failed to update title: {e}")))?;
        if rows == 0 {
            return Err(Error::NotFound(format!("conversation '{id}'")));
        }
        Ok(())
    }

    /// Update sharing state. Moving to `Shared` also bumps the last-shared
    /// pointer, the one mutation the data model permits.
    pub fn set_visibility(&self, id: &str, visibility: Visibility) -> Result<()> {
        let rows = match visibility {
            Visibility::Shared => self
                .conn()
                .execute(
                    "UPDATE conversations
                     SET visibility = 'shared', last_shared_at = ?2
                     WHERE id = ?1",
                    params![id, Utc::now().to_rfc3339()],
                )
                .map_err(|e| Error::Database(format!("failed to share conversation: {e}")))?,
            Visibility::Private => self
                .conn()
                .execute(
                    "UPDATE conversations SET visibility = 'private' WHERE id = ?1",
                    params![id],
                )
                .map_err(|e| Error::Database(format!("failed to unshare conversation: {e}")))?,
        };
        if rows == 0 {
            return Err(Error::NotFound(format!("conversation '{id}'")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append a message, assigning the next sequence position atomically
    /// inside the INSERT so interleaved turns cannot claim the same slot.
    pub fn append_message(&self, new: &NewMessage) -> Result<StoredMessage> {
        let parts = serde_json::to_string(&new.parts)?;
        let attachments = serde_json::to_string(&new.attachments)?;
        let created_at = Utc::now();

        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages
                (id, conversation_id, role, parts, attachments, position,
                 model, response_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5,
                 (SELECT COALESCE(MAX(position) + 1, 0)
                  FROM messages WHERE conversation_id = ?2),
                 ?6, ?7, ?8)",
            params![
                new.id,
                new.conversation_id,
                new.role.as_str(),
                parts,
                attachments,
                new.model,
                new.response_id,
                created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to append message: {e}")))?;

        let position: i64 = conn
            .query_row(
                "SELECT position FROM messages WHERE id = ?1",
                params![new.id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to read back position: {e}")))?;

        Ok(StoredMessage {
            id: new.id.clone(),
            conversation_id: new.conversation_id.clone(),
            role: new.role,
            parts: new.parts.clone(),
            attachments: new.attachments.clone(),
            position,
            model: new.model.clone(),
            response_id: new.response_id.clone(),
            created_at,
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<StoredMessage>> {
        self.conn()
            .query_row(
                "SELECT id, conversation_id, role, parts, attachments, position,
                        model, response_id, created_at
                 FROM messages WHERE id = ?1",
                params![id],
                Self::message_from_row,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load message: {e}")))
    }

    /// All messages of a conversation in sequence order.
    pub fn load_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, parts, attachments, position,
                        model, response_id, created_at
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY position ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;

        let rows = stmt
            .query_map(params![conversation_id], Self::message_from_row)
            .map_err(|e| Error::Database(format!("failed to load messages: {e}")))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(
                row.map_err(|e| Error::Database(format!("failed to read message row: {e}")))?,
            );
        }
        Ok(messages)
    }

    fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        let role_raw: String = row.get(2)?;
        let parts_raw: String = row.get(3)?;
        let attachments_raw: String = row.get(4)?;
        let created_raw: String = row.get(8)?;

        let role = MessageRole::parse(&role_raw).unwrap_or_else(|| {
            warn!("unknown message role '{role_raw}', treating as user");
            MessageRole::User
        });

        Ok(StoredMessage {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role,
            parts: serde_json::from_str(&parts_raw).unwrap_or_default(),
            attachments: serde_json::from_str(&attachments_raw).unwrap_or_default(),
            position: row.get(5)?,
            model: row.get(6)?,
            response_id: row.get(7)?,
            created_at: parse_timestamp(&created_raw),
        })
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub fn create_agent(&self, agent: &Agent) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO agents
                    (id, name, model, system_prompt, temperature, context_window,
                     owner_id, workspace_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    agent.id,
                    agent.name,
                    agent.model,
                    agent.system_prompt,
                    agent.temperature,
                    agent.context_window,
                    agent.owner_id,
                    agent.workspace_id,
                ],
            )
            .map_err(|e| Error::Database(format!("failed to create agent: {e}")))?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        self.conn()
            .query_row(
                "SELECT id, name, model, system_prompt, temperature, context_window,
                        owner_id, workspace_id
                 FROM agents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Agent {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        model: row.get(2)?,
                        system_prompt: row.get(3)?,
                        temperature: row.get(4)?,
                        context_window: row.get(5)?,
                        owner_id: row.get(6)?,
                        workspace_id: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load agent: {e}")))
    }

    // ------------------------------------------------------------------
    // Votes
    // ------------------------------------------------------------------

    pub fn upsert_vote(&self, vote: &Vote) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO votes (conversation_id, message_id, kind)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(conversation_id, message_id)
                 DO UPDATE SET kind = excluded.kind",
                params![vote.conversation_id, vote.message_id, vote.kind.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to upsert vote: {e}")))?;
        Ok(())
    }

    pub fn list_votes(&self, conversation_id: &str) -> Result<Vec<Vote>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, message_id, kind
                 FROM votes WHERE conversation_id = ?1",
            )
            .map_err(|e| Error::Database(format!("failed to prepare vote query: {e}")))?;

        let rows = stmt
            .query_map(params![conversation_id], |row| {
                let kind_raw: String = row.get(2)?;
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, kind_raw))
            })
            .map_err(|e| Error::Database(format!("failed to load votes: {e}")))?;

        let mut votes = Vec::new();
        for row in rows {
            let (conversation_id, message_id, kind_raw) =
                row.map_err(|e| Error::Database(format!("failed to read vote row: {e}")))?;
            let Some(kind) = VoteKind::parse(&kind_raw) else {
                warn!("skipping vote with unknown kind '{kind_raw}'");
                continue;
            };
            votes.push(Vote {
                conversation_id,
                message_id,
                kind,
            });
        }
        Ok(votes)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn insert_session(&self, token: &str, identity: &Identity) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO sessions (token, user_id, workspace_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(token) DO UPDATE SET
                   user_id = excluded.user_id,
                   workspace_id = excluded.workspace_id",
                params![token, identity.user_id, identity.workspace_id.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to insert session: {e}")))?;
        Ok(())
    }

    pub fn resolve_session(&self, token: &str) -> Result<Option<Identity>> {
        self.conn()
            .query_row(
                "SELECT user_id, workspace_id FROM sessions WHERE token = ?1",
                params![token],
                |row| {
                    Ok(Identity {
                        user_id: row.get(0)?,
                        workspace_id: parley_common::WorkspaceId(row.get(1)?),
                    })
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to resolve session: {e}")))
    }

    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------

    /// Atomically increment the per-(day, user, model, workspace) counters.
    pub fn record_usage(
        &self,
        key: &UsageKey,
        messages: u32,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO usage
                    (day, user_id, model, workspace_id, messages, input_tokens, output_tokens)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(day, user_id, model, workspace_id) DO UPDATE SET
                   messages = messages + excluded.messages,
                   input_tokens = input_tokens + excluded.input_tokens,
                   output_tokens = output_tokens + excluded.output_tokens",
                params![
                    key.day,
                    key.user_id,
                    key.model,
                    key.workspace_id,
                    messages,
                    input_tokens,
                    output_tokens,
                ],
            )
            .map_err(|e| Error::Database(format!("failed to record usage: {e}")))?;
        Ok(())
    }

    pub fn usage_totals(&self, key: &UsageKey) -> Result<Option<UsageTotals>> {
        self.conn()
            .query_row(
                "SELECT messages, input_tokens, output_tokens FROM usage
                 WHERE day = ?1 AND user_id = ?2 AND model = ?3 AND workspace_id = ?4",
                params![key.day, key.user_id, key.model, key.workspace_id],
                |row| {
                    Ok(UsageTotals {
                        messages: row.get(0)?,
                        input_tokens: row.get::<_, i64>(1)? as u64,
                        output_tokens: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read usage: {e}")))
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("failed to parse timestamp '{value}': {e}, falling back to now");
            Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::WorkspaceId;

    fn store() -> ChatStore {
        ChatStore::in_memory().expect("in-memory store should open")
    }

    fn sample_conversation(id: &str, owner: &str) -> NewConversation {
        NewConversation {
            id: id.to_string(),
            owner_id: owner.to_string(),
            workspace_id: "ws-1".to_string(),
            title: "Weather chat".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            system_prompt: "You are helpful.".to_string(),
            temperature: 0.7,
            context_window: 128_000,
            agent_id: None,
        }
    }

    #[test]
    fn conversation_create_and_get_round_trip() {
        let store = store();
        store.create_conversation(&sample_conversation("c1", "u1")).unwrap();

        let loaded = store.get_conversation("c1").unwrap().expect("should exist");
        assert_eq!(loaded.owner_id, "u1");
        assert_eq!(loaded.title, "Weather chat");
        assert_eq!(loaded.visibility, Visibility::Private);
        assert!(loaded.last_shared_at.is_none());

        assert!(store.get_conversation("nope").unwrap().is_none());
    }

    #[test]
    fn message_round_trip_preserves_role_parts_and_position() {
        let store = store();
        store.create_conversation(&sample_conversation("c1", "u1")).unwrap();

        let parts = vec![
            ContentPart::text("Checking the weather"),
            ContentPart::ToolCall {
                id: "call-1".to_string(),
                name: "get_weather".to_string(),
                input: serde_json::json!({"city": "Oslo"}),
            },
            ContentPart::ToolResult {
                id: "call-1".to_string(),
                output: "4C, overcast".to_string(),
            },
            ContentPart::text("It is 4C in Oslo."),
        ];

        let saved = store
            .append_message(&NewMessage {
                id: "m1".to_string(),
                conversation_id: "c1".to_string(),
                role: MessageRole::Assistant,
                parts: parts.clone(),
                attachments: vec![],
                model: Some("claude-sonnet-4-20250514".to_string()),
                response_id: Some("resp-1".to_string()),
            })
            .unwrap();
        assert_eq!(saved.position, 0);

        let loaded = store.get_message("m1").unwrap().expect("should exist");
        assert_eq!(loaded.role, MessageRole::Assistant);
        assert_eq!(loaded.parts, parts);
        assert_eq!(loaded.position, 0);
        assert_eq!(loaded.response_id.as_deref(), Some("resp-1"));
    }

    #[test]
    fn positions_are_monotonic_per_conversation() {
        let store = store();
        store.create_conversation(&sample_conversation("c1", "u1")).unwrap();
        store.create_conversation(&sample_conversation("c2", "u1")).unwrap();

        for (i, conv) in ["c1", "c1", "c2", "c1"].iter().enumerate() {
            store
                .append_message(&NewMessage {
                    id: format!("m{i}"),
                    conversation_id: conv.to_string(),
                    role: MessageRole::User,
                    parts: vec![ContentPart::text("hi")],
                    attachments: vec![],
                    model: None,
                    response_id: None,
                })
                .unwrap();
        }

        let c1 = store.load_messages("c1").unwrap();
        let positions: Vec<i64> = c1.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);

        let c2 = store.load_messages("c2").unwrap();
        assert_eq!(c2.len(), 1);
        assert_eq!(c2[0].position, 0);
    }

    #[test]
    fn delete_conversation_cascades() {
        let store = store();
        store.create_conversation(&sample_conversation("c1", "u1")).unwrap();
        store
            .append_message(&NewMessage {
                id: "m1".to_string(),
                conversation_id: "c1".to_string(),
                role: MessageRole::User,
                parts: vec![ContentPart::text("hi")],
                attachments: vec![],
                model: None,
                response_id: None,
            })
            .unwrap();
        store
            .upsert_vote(&Vote {
                conversation_id: "c1".to_string(),
                message_id: "m1".to_string(),
                kind: VoteKind::Up,
            })
            .unwrap();

        assert!(store.delete_conversation("c1").unwrap());
        assert!(store.get_conversation("c1").unwrap().is_none());
        assert!(store.load_messages("c1").unwrap().is_empty());
        assert!(store.list_votes("c1").unwrap().is_empty());

        // Second delete is a no-op
        assert!(!store.delete_conversation("c1").unwrap());
    }

    #[test]
    fn share_sets_last_shared_pointer() {
        let store = store();
        store.create_conversation(&sample_conversation("c1", "u1")).unwrap();

        store.set_visibility("c1", Visibility::Shared).unwrap();
        let shared = store.get_conversation("c1").unwrap().unwrap();
        assert_eq!(shared.visibility, Visibility::Shared);
        assert!(shared.last_shared_at.is_some());

        store.set_visibility("c1", Visibility::Private).unwrap();
        let private = store.get_conversation("c1").unwrap().unwrap();
        assert_eq!(private.visibility, Visibility::Private);
        // Pointer is retained after unsharing
        assert!(private.last_shared_at.is_some());

        assert!(store.set_visibility("missing", Visibility::Shared).is_err());
    }

    #[test]
    fn vote_upsert_replaces_kind() {
        let store = store();
        store.create_conversation(&sample_conversation("c1", "u1")).unwrap();

        let mut vote = Vote {
            conversation_id: "c1".to_string(),
            message_id: "m1".to_string(),
            kind: VoteKind::Up,
        };
        store.upsert_vote(&vote).unwrap();
        vote.kind = VoteKind::Down;
        store.upsert_vote(&vote).unwrap();

        let votes = store.list_votes("c1").unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].kind, VoteKind::Down);
    }

    #[test]
    fn session_resolve_round_trip() {
        let store = store();
        let identity = Identity {
            user_id: "u1".to_string(),
            workspace_id: WorkspaceId::from("ws-1"),
        };
        store.insert_session("tok-1", &identity).unwrap();

        assert_eq!(store.resolve_session("tok-1").unwrap(), Some(identity));
        assert!(store.resolve_session("tok-2").unwrap().is_none());
    }

    #[test]
    fn usage_increments_accumulate() {
        let store = store();
        let key = UsageKey {
            day: "2026-08-29".to_string(),
            user_id: "u1".to_string(),
            model: "m".to_string(),
            workspace_id: "ws-1".to_string(),
        };

        assert!(store.usage_totals(&key).unwrap().is_none());

        store.record_usage(&key, 1, 100, 40).unwrap();
        store.record_usage(&key, 1, 50, 10).unwrap();

        let totals = store.usage_totals(&key).unwrap().unwrap();
        assert_eq!(totals.messages, 2);
        assert_eq!(totals.input_tokens, 150);
        assert_eq!(totals.output_tokens, 50);

        // A different model is a separate counter row
        let other = UsageKey {
            model: "other".to_string(),
            ..key.clone()
        };
        assert!(store.usage_totals(&other).unwrap().is_none());
    }
}
