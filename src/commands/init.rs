//! Init command implementation

use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::{Config, KnowledgeBackend};
use crate::db::CrmDb;
use crate::error::{Error, Result};
use crate::store::open_store;

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub knowledge_backend: String,
    /// False when the vector backend could not be reached yet
    pub knowledge_ready: bool,
}

/// Write the default config and create the CRM database
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<InitReport> {
    let mut config = Config::default();
    config.init_paths(base_dir);

    if config.paths.config_file.exists() && !force {
        return Err(Error::AlreadyInitialized(
            config.paths.base_dir.display().to_string(),
        ));
    }

    std::fs::create_dir_all(&config.paths.base_dir)?;
    config.validate()?;
    config.save()?;
    info!("Created config at {:?}", config.paths.config_file);

    let db = CrmDb::connect(&config).await?;
    db.init_schema().await?;
    info!("Created database at {:?}", config.paths.db_file);

    let knowledge_ready = match open_store(&config, db.pool()).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Knowledge store not ready: {}. It will be created on first use.", e);
            false
        }
    };

    Ok(InitReport {
        config_path: config.paths.config_file.clone(),
        db_path: config.paths.db_file.clone(),
        knowledge_backend: match config.knowledge.backend {
            KnowledgeBackend::Sqlite => "sqlite".to_string(),
            KnowledgeBackend::Qdrant => format!("qdrant ({})", config.knowledge.qdrant_url),
        },
        knowledge_ready,
    })
}

pub fn print_init_report(report: &InitReport) {
    println!("✓ leadq initialized successfully");
    println!("  Config: {}", report.config_path.display());
    println!("  Database: {}", report.db_path.display());
    let state = if report.knowledge_ready { "ready" } else { "not reachable yet" };
    println!("  Knowledge store: {} ({})", report.knowledge_backend, state);
    println!("\nNext steps:");
    println!("  1. Set the API keys named in the config (embedding.api_key_env, completion.api_key_env)");
    println!("  2. Add knowledge: leadq knowledge upload price-list.txt --category prices");
    println!("  3. Try a message: leadq inbound --chat 42 \"Здравствуйте, хочу ремонт\"");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_config_and_database() {
        let tmp = TempDir::new().unwrap();
        let report = cmd_init(Some(tmp.path().to_path_buf()), false).await.unwrap();
        assert!(report.config_path.exists());
        assert!(report.db_path.exists());
        assert!(report.knowledge_ready);

        let loaded = Config::load(&report.config_path).unwrap();
        assert_eq!(loaded.paths.db_file, report.db_path);
        assert!(loaded.is_initialized());
    }

    #[tokio::test]
    async fn test_init_refuses_to_overwrite_without_force() {
        let tmp = TempDir::new().unwrap();
        cmd_init(Some(tmp.path().to_path_buf()), false).await.unwrap();
        let err = cmd_init(Some(tmp.path().to_path_buf()), false).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized(_)));
        assert!(cmd_init(Some(tmp.path().to_path_buf()), true).await.is_ok());
    }
}
