//! SQLite schema definition

/// SQL schema for the CRM database
pub const SCHEMA_SQL: &str = r#"
-- Leads: one row per prospective client
CREATE TABLE IF NOT EXISTS leads (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT,
    phone TEXT,
    telegram_handle TEXT,
    source TEXT,
    external_id TEXT,
    status TEXT NOT NULL DEFAULT 'NEW',
    extracted_data TEXT NOT NULL DEFAULT '{}',
    human_edited_keys TEXT NOT NULL DEFAULT '[]',
    ai_qualification_status TEXT NOT NULL DEFAULT 'in_progress',
    ai_summary TEXT,
    processed_seq INTEGER NOT NULL DEFAULT 0,
    followup_count INTEGER NOT NULL DEFAULT 0,
    last_message_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(org_id, source, external_id)
);

-- Chat messages: append-only, seq increases per lead
CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    lead_id TEXT NOT NULL REFERENCES leads(id),
    seq INTEGER NOT NULL,
    direction TEXT NOT NULL,
    content TEXT NOT NULL,
    media_url TEXT,
    sender_name TEXT,
    channel_message_id TEXT,
    ai_metadata TEXT,
    delivery_status TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(lead_id, seq),
    UNIQUE(lead_id, channel_message_id)
);

-- Custom fields: operator-defined extraction keys
CREATE TABLE IF NOT EXISTS custom_fields (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    label TEXT NOT NULL,
    field_type TEXT NOT NULL,
    options TEXT NOT NULL DEFAULT '[]',
    description TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    position INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(org_id, name)
);

-- Prompt configurations: at most one active per org
CREATE TABLE IF NOT EXISTS prompt_configs (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    system_prompt TEXT NOT NULL,
    llm_model TEXT,
    active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Qualification turns: one row per attempted turn
CREATE TABLE IF NOT EXISTS qualification_turns (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    lead_id TEXT NOT NULL REFERENCES leads(id),
    message_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    error_kind TEXT,
    trace TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_leads_org_status ON leads(org_id, status);
CREATE INDEX IF NOT EXISTS idx_messages_lead_seq ON chat_messages(lead_id, seq);
CREATE INDEX IF NOT EXISTS idx_fields_org ON custom_fields(org_id, position);
CREATE INDEX IF NOT EXISTS idx_prompts_org ON prompt_configs(org_id, active);
CREATE INDEX IF NOT EXISTS idx_turns_lead ON qualification_turns(lead_id, seq);
"#;
