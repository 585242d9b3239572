//! Custom field commands

use serde::Serialize;
use tracing::info;

use crate::db::{CrmDb, LeadStore};
use crate::error::Result;
use crate::fields::{validate_field_name, CustomField, FieldDef, FieldSchema, FieldType, NewCustomField};
use crate::models::OrgContext;

/// Stored definitions plus the schema the model currently sees
#[derive(Debug, Clone, Serialize)]
pub struct FieldListing {
    pub custom: Vec<CustomField>,
    pub effective: Vec<FieldDef>,
}

pub async fn cmd_fields_list(db: &CrmDb, ctx: &OrgContext) -> Result<FieldListing> {
    let custom = db.custom_fields(&ctx.org_id).await?;
    let effective = FieldSchema::build(&custom).fields().to_vec();
    Ok(FieldListing { custom, effective })
}

pub async fn cmd_fields_add(
    db: &CrmDb,
    ctx: &OrgContext,
    name: &str,
    label: &str,
    field_type: FieldType,
    options: Vec<String>,
    description: Option<String>,
) -> Result<CustomField> {
    let field = NewCustomField {
        name: name.to_string(),
        label: label.to_string(),
        field_type,
        options,
        description: description.filter(|d| !d.trim().is_empty()),
    };
    db.create_custom_field(ctx, &field).await
}

pub async fn cmd_fields_set_active(db: &CrmDb, ctx: &OrgContext, name: &str, active: bool) -> Result<()> {
    validate_field_name(name)?;
    db.set_field_active(ctx, name, active).await?;
    info!(
        "Field {} {}",
        name,
        if active { "activated" } else { "deactivated" }
    );
    Ok(())
}

pub async fn cmd_fields_remove(db: &CrmDb, ctx: &OrgContext, name: &str) -> Result<()> {
    validate_field_name(name)?;
    db.delete_custom_field(ctx, name).await
}

pub fn print_field_listing(listing: &FieldListing) {
    println!("\n📋 Extraction schema ({} keys)\n", listing.effective.len());
    for field in &listing.effective {
        let origin = if field.standard { "standard" } else { "custom" };
        print!("  {:<20} {:<8} {:<9} {}", field.name, field.field_type.as_str(), origin, field.label);
        if !field.options.is_empty() {
            print!(" [{}]", field.options.join(" | "));
        }
        println!();
    }

    let inactive: Vec<&CustomField> = listing.custom.iter().filter(|f| !f.active).collect();
    if !inactive.is_empty() {
        println!("\nInactive custom fields:");
        for field in inactive {
            println!("  {:<20} {:<8} {}", field.name, field.field_type.as_str(), field.label);
        }
    }
}

pub fn print_custom_field(field: &CustomField) {
    println!("✓ Created field '{}' ({}) at position {}", field.name, field.field_type, field.position);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::TestEnv;

    #[tokio::test]
    async fn test_added_field_joins_the_schema_until_deactivated() {
        let env = TestEnv::new().await;
        let ctx = env.ctx();
        cmd_fields_add(
            &env.db,
            &ctx,
            "has_pets",
            "Есть животные",
            FieldType::Boolean,
            Vec::new(),
            Some("   ".to_string()),
        )
        .await
        .unwrap();

        let listing = cmd_fields_list(&env.db, &ctx).await.unwrap();
        assert!(listing.effective.iter().any(|f| f.name == "has_pets" && !f.standard));
        assert_eq!(listing.custom[0].description, None);

        cmd_fields_set_active(&env.db, &ctx, "has_pets", false).await.unwrap();
        let listing = cmd_fields_list(&env.db, &ctx).await.unwrap();
        assert!(!listing.effective.iter().any(|f| f.name == "has_pets"));
        assert_eq!(listing.custom.len(), 1);

        cmd_fields_remove(&env.db, &ctx, "has_pets").await.unwrap();
        let err = cmd_fields_remove(&env.db, &ctx, "has_pets").await.unwrap_err();
        assert!(matches!(err, Error::FieldNotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_names_are_rejected_before_the_database() {
        let env = TestEnv::new().await;
        let err = cmd_fields_add(&env.db, &env.ctx(), "Has Pets", "x", FieldType::Text, Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFieldName(_)));

        let err = cmd_fields_set_active(&env.db, &env.ctx(), "9lives", true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFieldName(_)));
    }
}
