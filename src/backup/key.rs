use crate::error::{BackupError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};

const DATABASE_PLACEHOLDER: &str = "$database";
const EXTENSION_PLACEHOLDER: &str = "$ext";

/// Renders `[prefix/]<strftime template>` with `$database` and `$ext` substituted.
#[derive(Debug, Clone)]
pub struct KeyTemplate {
    template: String,
    prefix: String,
}

impl KeyTemplate {
    pub fn new(template: &str, prefix: &str) -> Result<Self> {
        if !template.contains(DATABASE_PLACEHOLDER) {
            return Err(BackupError::Config(format!(
                "KEYNAME_TEMPLATE '{}' does not contain {}",
                template, DATABASE_PLACEHOLDER
            )));
        }
        if StrftimeItems::new(template).any(|item| matches!(item, Item::Error)) {
            return Err(BackupError::Config(format!(
                "KEYNAME_TEMPLATE '{}' is not a valid date format",
                template
            )));
        }
        let has_date = StrftimeItems::new(template)
            .any(|item| matches!(item, Item::Numeric(..) | Item::Fixed(_)));
        if !has_date {
            return Err(BackupError::Config(format!(
                "KEYNAME_TEMPLATE '{}' has no date field (expected strftime items like %Y/%m/%d)",
                template
            )));
        }

        Ok(Self {
            template: template.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    pub fn render(&self, database: &str, at: DateTime<Utc>, extension: &str) -> String {
        // The database name goes in last so a '%' in it is never read as a date item.
        let dated = at
            .format(&self.template.replace(EXTENSION_PLACEHOLDER, extension))
            .to_string();
        let key = dated.replace(DATABASE_PLACEHOLDER, database);

        if self.prefix.is_empty() {
            key
        } else {
            format!("{}/{}", self.prefix, key.trim_start_matches('/'))
        }
    }
}
