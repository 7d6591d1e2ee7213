use serde::Deserialize;

/// A user-declared entity type. The field list drives table creation and
/// lets loaders resolve relational references by field name.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub fields: Vec<EntityFieldConfig>,
}

fn default_id_field() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityFieldConfig {
    pub name: String,
    /// Entity type this field's id (or list of ids) points at, if any.
    #[serde(default)]
    pub references: Option<String>,
    /// True when the field holds an array of values.
    #[serde(default)]
    pub list: bool,
}

impl EntityConfig {
    pub fn reference_fields(&self) -> impl Iterator<Item = &EntityFieldConfig> {
        self.fields.iter().filter(|f| f.references.is_some())
    }
}
