//! leadq CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use lead_qualifier::{
    commands::{
        cmd_fields_add, cmd_fields_list, cmd_fields_remove, cmd_fields_set_active, cmd_inbound, cmd_init,
        cmd_knowledge_add, cmd_knowledge_clear, cmd_knowledge_delete, cmd_knowledge_query,
        cmd_knowledge_upload, cmd_lead_edit_field, cmd_lead_history, cmd_lead_list, cmd_lead_release_field,
        cmd_lead_reply, cmd_lead_resume_ai, cmd_lead_set_status, cmd_lead_show, cmd_lead_turns,
        cmd_mark_delivery, cmd_process, cmd_prompt_set, cmd_prompt_show, cmd_sweep, print_chat_message,
        print_custom_field, print_field_listing, print_history, print_inbound_report, print_ingest_report,
        print_init_report, print_knowledge_hits, print_lead, print_lead_details, print_lead_list,
        print_prompt_profile, print_prompt_view, print_sweep_report, print_turn_outcome, print_turns,
        print_upload_stats, InboundArgs, InboundTarget, Services,
    },
    config::Config,
    error::{Error, Result},
    fields::FieldType,
    models::{Contact, OrgContext},
    progress::LogWriterFactory,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "leadq")]
#[command(version, about = "AI lead qualification for a renovation CRM", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Organization to act for (defaults to default_org_id)
    #[arg(long, global = true, env = "LEADQ_ORG")]
    org: Option<String>,

    /// Act as this operator
    #[arg(long = "as", global = true, env = "LEADQ_OPERATOR")]
    operator: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config file and CRM database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Manage the knowledge base
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },

    /// Manage custom extraction fields
    Fields {
        #[command(subcommand)]
        action: FieldsAction,
    },

    /// Show or replace the system prompt
    Prompt {
        #[command(subcommand)]
        action: PromptAction,
    },

    /// Store a client message and run a qualification turn for it
    Inbound {
        /// Message text
        text: String,

        /// Existing lead id
        #[arg(long, conflicts_with = "chat")]
        lead: Option<Uuid>,

        /// Chat id on the channel; creates the lead on first contact
        #[arg(long, required_unless_present = "lead")]
        chat: Option<String>,

        /// Channel the chat belongs to
        #[arg(long, default_value = "telegram")]
        source: String,

        /// Channel message id, for idempotent redelivery
        #[arg(long)]
        message_id: Option<String>,

        /// Client name as known to the channel
        #[arg(long)]
        name: Option<String>,

        /// Client phone as known to the channel
        #[arg(long)]
        phone: Option<String>,

        /// Client telegram handle
        #[arg(long)]
        handle: Option<String>,
    },

    /// Re-run the qualification turn of a stored message
    Process {
        /// Lead id
        lead: Uuid,

        /// Message id (defaults to the latest inbound message)
        #[arg(long)]
        message: Option<Uuid>,
    },

    /// Inspect and operate on leads
    Lead {
        #[command(subcommand)]
        action: LeadAction,
    },

    /// Retry pending turns and send follow-ups
    Sweep {
        /// Keep sweeping at the configured interval
        #[arg(long)]
        watch: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum KnowledgeAction {
    /// Index a piece of text
    Add {
        /// Document title
        title: String,

        /// Document text
        text: String,

        #[arg(long, default_value = "general")]
        category: String,
    },

    /// Index text, markdown or PDF files
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long, default_value = "general")]
        category: String,
    },

    /// Search the knowledge base
    Query {
        query: String,

        /// Maximum number of results
        #[arg(short, long, default_value = "5")]
        limit: usize,

        #[arg(long)]
        category: Option<String>,
    },

    /// Delete one chunk
    Delete { id: Uuid },

    /// Delete every chunk of the org
    Clear {
        /// Skip confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum FieldsAction {
    /// Show the extraction schema
    List,

    /// Define a custom field
    Add {
        /// snake_case key
        name: String,

        /// Display label
        label: String,

        #[arg(long = "type", default_value = "text")]
        field_type: FieldType,

        /// Allowed values of a select field
        #[arg(long, value_delimiter = ',')]
        options: Vec<String>,

        /// Hint shown to the model
        #[arg(long)]
        description: Option<String>,
    },

    /// Put a field back into the schema
    Activate { name: String },

    /// Take a field out of the schema, keeping stored values
    Deactivate { name: String },

    /// Delete a field definition, keeping stored values
    Remove { name: String },
}

#[derive(Subcommand)]
enum PromptAction {
    /// Show the active prompt as the model sees it
    Show,

    /// Store and activate a new prompt
    Set {
        /// Prompt text, or @path to read it from a file
        prompt: String,

        #[arg(long, default_value = "custom")]
        name: String,

        /// Completion model for this prompt
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
enum LeadAction {
    /// Most recently active leads
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Lead details and latest messages
    Show { id: Uuid },

    /// Conversation of a lead
    History {
        id: Uuid,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Qualification turns of a lead
    Turns { id: Uuid },

    /// Set an extracted field; the agent will not overwrite it
    EditField {
        id: Uuid,
        field: String,
        /// JSON value, or plain text
        value: String,
    },

    /// Let the agent fill a field again
    ReleaseField { id: Uuid, field: String },

    /// Move a lead to any pipeline status
    SetStatus { id: Uuid, status: String },

    /// Let the agent answer again after a handoff
    ResumeAi { id: Uuid },

    /// Queue an operator reply
    Reply { id: Uuid, text: String },

    /// Record the delivery result of an outbound message
    MarkDelivery {
        message_id: Uuid,
        /// pending, sent or failed
        status: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(LogWriterFactory::default()))
            .with(filter)
            .init();
    }

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        let base_dir = cli
            .config
            .as_deref()
            .map(|path| match path.extension() {
                Some(ext) if ext == "toml" => path.parent().map(Path::to_path_buf).unwrap_or_default(),
                _ => path.to_path_buf(),
            });
        let report = cmd_init(base_dir, force).await?;
        return emit(cli.json, &report, print_init_report);
    }

    // Handle completions command (doesn't need config/db/store)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "leadq", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let services = Services::open(config).await?;
    let ctx = services.context(cli.org.as_deref(), cli.operator.as_deref());

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Knowledge { action } => handle_knowledge(&services, &ctx, action, cli.json).await?,

        Commands::Fields { action } => handle_fields(&services, &ctx, action, cli.json).await?,

        Commands::Prompt { action } => match action {
            PromptAction::Show => {
                let view = cmd_prompt_show(&services.db, &ctx).await?;
                emit(cli.json, &view, print_prompt_view)?;
            }
            PromptAction::Set { prompt, name, model } => {
                let text = read_text_arg(&prompt)?;
                let profile = cmd_prompt_set(&services.db, &ctx, &name, &text, model.as_deref()).await?;
                emit(cli.json, &profile, print_prompt_profile)?;
            }
        },

        Commands::Inbound {
            text,
            lead,
            chat,
            source,
            message_id,
            name,
            phone,
            handle,
        } => {
            let target = match (lead, chat) {
                (Some(id), _) => InboundTarget::Lead(id),
                (None, Some(chat_id)) => InboundTarget::Chat { source, chat_id },
                (None, None) => return Err(Error::InvalidInput("either --lead or --chat is required".into())),
            };
            let args = InboundArgs {
                target,
                text,
                message_id,
                sender: None,
                contact: Contact {
                    name,
                    phone,
                    telegram_handle: handle,
                },
            };
            let report = cmd_inbound(&services.engine()?, &ctx, args).await?;
            emit(cli.json, &report, print_inbound_report)?;
        }

        Commands::Process { lead, message } => {
            let outcome = cmd_process(&services.engine()?, &services.db, &ctx, lead, message).await?;
            emit(cli.json, &outcome, print_turn_outcome)?;
        }

        Commands::Lead { action } => handle_lead(&services, &ctx, action, cli.json).await?,

        Commands::Sweep { watch } => {
            let report = cmd_sweep(services.engine()?, &services.config.followup, watch).await?;
            if !watch {
                emit(cli.json, &report, print_sweep_report)?;
            }
        }
    }

    Ok(())
}

/// Print as JSON with `--json`, otherwise through the human printer
fn emit<T: Serialize + ?Sized>(json: bool, value: &T, print: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print(value);
    }
    Ok(())
}

/// `@path` reads the file, anything else is taken literally
fn read_text_arg(raw: &str) -> Result<String> {
    match raw.strip_prefix('@') {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => Ok(raw.to_string()),
    }
}

async fn handle_knowledge(services: &Services, ctx: &OrgContext, action: KnowledgeAction, json: bool) -> Result<()> {
    let knowledge = &services.knowledge;
    match action {
        KnowledgeAction::Add { title, text, category } => {
            let text = read_text_arg(&text)?;
            let report = cmd_knowledge_add(knowledge, ctx, &title, &text, &category).await?;
            emit(json, &report, print_ingest_report)?;
        }
        KnowledgeAction::Upload { paths, category } => {
            let stats = cmd_knowledge_upload(knowledge, ctx, &paths, &category).await?;
            emit(json, &stats, print_upload_stats)?;
        }
        KnowledgeAction::Query { query, limit, category } => {
            let hits = cmd_knowledge_query(knowledge, ctx, &query, limit, category.as_deref()).await?;
            emit(json, hits.as_slice(), |hits| print_knowledge_hits(&query, hits))?;
        }
        KnowledgeAction::Delete { id } => {
            cmd_knowledge_delete(knowledge, ctx, id).await?;
            if json {
                println!(r#"{{"status": "ok", "deleted": "{}"}}"#, id);
            } else {
                println!("✓ Deleted chunk {}", id);
            }
        }
        KnowledgeAction::Clear { yes } => {
            if !yes {
                eprintln!("⚠️  This will delete ALL knowledge of org {}!", ctx.org_id);
                eprintln!("Run with --yes to confirm.");
                std::process::exit(1);
            }
            let removed = cmd_knowledge_clear(knowledge, ctx).await?;
            if json {
                println!(r#"{{"status": "ok", "removed": {}}}"#, removed);
            } else {
                println!("✓ Removed {} chunks", removed);
            }
        }
    }
    Ok(())
}

async fn handle_fields(services: &Services, ctx: &OrgContext, action: FieldsAction, json: bool) -> Result<()> {
    let db = &services.db;
    match action {
        FieldsAction::List => {
            let listing = cmd_fields_list(db, ctx).await?;
            emit(json, &listing, print_field_listing)?;
        }
        FieldsAction::Add {
            name,
            label,
            field_type,
            options,
            description,
        } => {
            let field = cmd_fields_add(db, ctx, &name, &label, field_type, options, description).await?;
            emit(json, &field, print_custom_field)?;
        }
        FieldsAction::Activate { name } => {
            cmd_fields_set_active(db, ctx, &name, true).await?;
            print_done(json, &format!("Field '{}' activated", name));
        }
        FieldsAction::Deactivate { name } => {
            cmd_fields_set_active(db, ctx, &name, false).await?;
            print_done(json, &format!("Field '{}' deactivated", name));
        }
        FieldsAction::Remove { name } => {
            cmd_fields_remove(db, ctx, &name).await?;
            print_done(json, &format!("Field '{}' removed; stored values are kept", name));
        }
    }
    Ok(())
}

async fn handle_lead(services: &Services, ctx: &OrgContext, action: LeadAction, json: bool) -> Result<()> {
    let db = &services.db;
    match action {
        LeadAction::List { limit } => {
            let leads = cmd_lead_list(db, ctx, limit).await?;
            emit(json, leads.as_slice(), print_lead_list)?;
        }
        LeadAction::Show { id } => {
            let details = cmd_lead_show(db, ctx, id).await?;
            emit(json, &details, print_lead_details)?;
        }
        LeadAction::History { id, limit } => {
            let messages = cmd_lead_history(db, ctx, id, limit).await?;
            emit(json, messages.as_slice(), print_history)?;
        }
        LeadAction::Turns { id } => {
            let turns = cmd_lead_turns(db, ctx, id).await?;
            emit(json, turns.as_slice(), print_turns)?;
        }
        LeadAction::EditField { id, field, value } => {
            let lead = cmd_lead_edit_field(&services.operators()?, ctx, id, &field, &value).await?;
            emit(json, &lead, print_lead)?;
        }
        LeadAction::ReleaseField { id, field } => {
            let lead = cmd_lead_release_field(&services.operators()?, ctx, id, &field).await?;
            emit(json, &lead, print_lead)?;
        }
        LeadAction::SetStatus { id, status } => {
            let lead = cmd_lead_set_status(&services.operators()?, ctx, id, &status).await?;
            emit(json, &lead, print_lead)?;
        }
        LeadAction::ResumeAi { id } => {
            let lead = cmd_lead_resume_ai(&services.operators()?, ctx, id).await?;
            emit(json, &lead, print_lead)?;
        }
        LeadAction::Reply { id, text } => {
            let message = cmd_lead_reply(&services.operators()?, ctx, id, &text).await?;
            emit(json, &message, print_chat_message)?;
        }
        LeadAction::MarkDelivery { message_id, status } => {
            cmd_mark_delivery(db, ctx, message_id, &status).await?;
            print_done(json, &format!("Message {} marked {}", message_id, status));
        }
    }
    Ok(())
}

fn print_done(json: bool, message: &str) {
    if json {
        println!("{}", serde_json::json!({ "status": "ok", "message": message }));
    } else {
        println!("✓ {}", message);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        return Err(Error::NotInitialized);
    }

    Config::load(&config_path)
}
