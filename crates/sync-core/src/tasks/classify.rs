//! Schema classification for project/area resolution.

use crate::model::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaClass {
    Project,
    Area,
}

/// Classify a container schema.
///
/// An explicit `kind` tag decides on its own. Schemas without one fall back to
/// a case-insensitive substring match on id and name, "project" before "area".
pub fn classify_schema(schema: &Schema) -> Option<SchemaClass> {
    if let Some(kind) = schema.kind.as_deref() {
        return match kind.trim().to_ascii_lowercase().as_str() {
            "project" => Some(SchemaClass::Project),
            "area" => Some(SchemaClass::Area),
            _ => None,
        };
    }

    let id = schema.id.to_ascii_lowercase();
    let name = schema.name.to_ascii_lowercase();
    if id.contains("project") || name.contains("project") {
        Some(SchemaClass::Project)
    } else if id.contains("area") || name.contains("area") {
        Some(SchemaClass::Area)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(id: &str, name: &str, kind: Option<&str>) -> Schema {
        Schema {
            id: id.into(),
            name: name.into(),
            kind: kind.map(String::from),
            version: 1,
            fields: json!([]),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_heuristic_matches_id_or_name() {
        assert_eq!(
            classify_schema(&schema("s-proj", "Client Projects", None)),
            Some(SchemaClass::Project)
        );
        assert_eq!(
            classify_schema(&schema("area-schema", "Life", None)),
            Some(SchemaClass::Area)
        );
        assert_eq!(classify_schema(&schema("s1", "Reading list", None)), None);
    }

    #[test]
    fn test_explicit_kind_overrides_heuristic() {
        assert_eq!(
            classify_schema(&schema("project-archive", "Projects", Some("reference"))),
            None
        );
        assert_eq!(
            classify_schema(&schema("s9", "Whatever", Some("Area"))),
            Some(SchemaClass::Area)
        );
    }
}
