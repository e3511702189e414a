//! Dump document types shared by every pipeline stage

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Year → article number. A missing year is stored under the empty key.
pub type ArticleNumbers = BTreeMap<String, String>;

/// Fields every FTDB ticket carries, kit or part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: u64,
    pub created: String,
    pub title: String,
    #[serde(default)]
    pub article_numbers: ArticleNumbers,
    pub uuid: Option<String>,
    pub url_api: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
}

/// A construction kit with its part list (part id → count)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kit {
    #[serde(flatten)]
    pub ticket: Ticket,
    #[serde(default)]
    pub parts: BTreeMap<String, Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub weight: Option<Value>,
}

/// The complete `ftdb-dump.json` document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dump {
    pub kits: BTreeMap<String, Kit>,
    pub parts: BTreeMap<String, Part>,
}

impl Dump {
    /// Parts of a kit, resolved against the part table and sorted by title
    pub fn parts_of(&self, kit: &Kit) -> Vec<(&Part, Option<u32>)> {
        let mut parts: Vec<(&Part, Option<u32>)> = kit
            .parts
            .iter()
            .filter_map(|(id, count)| self.parts.get(id).map(|p| (p, *count)))
            .collect();
        parts.sort_by(|a, b| a.0.ticket.title.cmp(&b.0.ticket.title));
        parts
    }
}

/// Render a JSON scalar the way it should appear in the dump.
/// Null becomes an empty string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Format article numbers as "artno (year), ..." sorted by year
pub fn format_article_numbers(numbers: &ArticleNumbers) -> String {
    numbers
        .iter()
        .map(|(year, artno)| format!("{} ({})", artno, year))
        .collect::<Vec<_>>()
        .join(", ")
        .replace("()", "")
}
