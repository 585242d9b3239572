//! Prompt configuration commands

use serde::Serialize;

use crate::db::{CrmDb, LeadStore, PromptProfile};
use crate::error::Result;
use crate::fields::FieldSchema;
use crate::models::OrgContext;
use crate::prompt::{render_template, DEFAULT_SYSTEM_PROMPT};

#[derive(Debug, Clone, Serialize)]
pub struct PromptView {
    /// None when the org runs on the built-in prompt
    pub profile: Option<PromptProfile>,
    /// Template with the current field schema filled in
    pub rendered: String,
}

pub async fn cmd_prompt_show(db: &CrmDb, ctx: &OrgContext) -> Result<PromptView> {
    let profile = db.active_prompt(&ctx.org_id).await?;
    let schema = FieldSchema::build(&db.custom_fields(&ctx.org_id).await?);
    let template = profile
        .as_ref()
        .map(|p| p.system_prompt.as_str())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let rendered = render_template(template, &schema);
    Ok(PromptView { profile, rendered })
}

pub async fn cmd_prompt_set(
    db: &CrmDb,
    ctx: &OrgContext,
    name: &str,
    system_prompt: &str,
    model: Option<&str>,
) -> Result<PromptProfile> {
    db.set_prompt(ctx, name, system_prompt, model).await
}

pub fn print_prompt_view(view: &PromptView) {
    match &view.profile {
        Some(profile) => {
            println!("Active prompt: {} (since {})", profile.name, profile.created_at.format("%Y-%m-%d %H:%M"));
            if let Some(model) = &profile.llm_model {
                println!("Model override: {}", model);
            }
        }
        None => println!("Active prompt: built-in default"),
    }
    println!("\n{}", view.rendered);
}

pub fn print_prompt_profile(profile: &PromptProfile) {
    println!("✓ Activated prompt '{}'", profile.name);
    if let Some(model) = &profile.llm_model {
        println!("  Model: {}", model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::TestEnv;

    #[tokio::test]
    async fn test_show_falls_back_to_builtin_then_tracks_latest() {
        let env = TestEnv::new().await;
        let ctx = env.ctx();

        let view = cmd_prompt_show(&env.db, &ctx).await.unwrap();
        assert!(view.profile.is_none());
        assert!(!view.rendered.is_empty());

        cmd_prompt_set(&env.db, &ctx, "first", "Вы менеджер.", None).await.unwrap();
        cmd_prompt_set(&env.db, &ctx, "second", "Вы вежливый менеджер.", Some("gpt-4o"))
            .await
            .unwrap();

        let view = cmd_prompt_show(&env.db, &ctx).await.unwrap();
        let profile = view.profile.unwrap();
        assert_eq!(profile.name, "second");
        assert_eq!(profile.llm_model.as_deref(), Some("gpt-4o"));
        assert!(view.rendered.starts_with("Вы вежливый менеджер."));
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let env = TestEnv::new().await;
        let err = cmd_prompt_set(&env.db, &env.ctx(), "blank", "  ", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
