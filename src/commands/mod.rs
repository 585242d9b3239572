//! CLI commands implementation

pub mod fields;
pub mod init;
pub mod knowledge;
pub mod leads;
pub mod prompt;
pub mod sweep;
pub mod turns;

pub use fields::*;
pub use init::*;
pub use knowledge::*;
pub use leads::*;
pub use prompt::*;
pub use sweep::*;
pub use turns::*;

use std::sync::Arc;
use tracing::debug;

use crate::complete::CompletionGateway;
use crate::config::Config;
use crate::db::CrmDb;
use crate::embed::EmbeddingGateway;
use crate::engine::{Operators, QualificationEngine};
use crate::error::{Error, Result};
use crate::knowledge::KnowledgeBase;
use crate::models::OrgContext;
use crate::retrieve::RetrievalPlanner;
use crate::store::open_store;

/// Everything a command may need, opened from the config
pub struct Services {
    pub config: Config,
    pub db: CrmDb,
    pub knowledge: KnowledgeBase,
    pub retrieval: RetrievalPlanner,
}

impl Services {
    pub async fn open(config: Config) -> Result<Self> {
        if !config.paths.db_file.exists() {
            return Err(Error::NotInitialized);
        }
        let db = CrmDb::connect(&config).await?;
        let store = open_store(&config, db.pool()).await?;
        let embedder = EmbeddingGateway::from_config(&config.embedding)?;
        debug!(
            "Opened services: embedding model {}, dimension {}",
            embedder.model_name(),
            embedder.dimension()
        );

        let knowledge = KnowledgeBase::new(store.clone(), embedder.clone(), &config.knowledge);
        let retrieval = RetrievalPlanner::new(
            store,
            embedder,
            &config.retrieval,
            config.knowledge.search_timeout(),
        );
        Ok(Self {
            config,
            db,
            knowledge,
            retrieval,
        })
    }

    /// Auth context of a CLI call: the configured org, or `org` when given.
    /// With an operator name the call acts as that operator.
    pub fn context(&self, org: Option<&str>, operator: Option<&str>) -> OrgContext {
        let org_id = org.unwrap_or(&self.config.default_org_id).to_string();
        match operator {
            Some(name) => OrgContext::operator(org_id, name),
            None => OrgContext::system(org_id),
        }
    }

    /// The engine needs the completion provider, which only some commands use
    pub fn engine(&self) -> Result<QualificationEngine> {
        let completion = CompletionGateway::from_config(&self.config.completion)?;
        Ok(QualificationEngine::new(
            Arc::new(self.db.clone()),
            self.retrieval.clone(),
            completion,
            &self.config,
        ))
    }

    pub fn operators(&self) -> Result<Operators> {
        Ok(Operators::new(&self.engine()?, self.knowledge.clone()))
    }
}

/// Shorten text for one-line display
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.trim().replace('\n', " ");
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    } else {
        flat
    }
}
