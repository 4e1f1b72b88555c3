use once_cell::sync::Lazy;
use regex::Regex;

/// Parsed field-reference tag embedded in a fillable PDF's raw field value:
/// `{signature}`, `{date:sig}`, `{ date : sig }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub field_type: String,
    pub parent: Option<String>,
}

static FIELD_REF_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*\{\s*([\w\d._,?+=\-&*^%$#@! ]+)\s*(?::\s*([\w\d. ]+)\s*)?\}\s*$"#)
        .expect("field reference pattern is a valid regex")
});

/// Returns `None` for raw values that don't match the grammar, those fields
/// are simply non-fillable, not an error.
pub fn parse_field_reference(raw: &str) -> Option<FieldDescriptor> {
    let caps = FIELD_REF_PATTERN.captures(raw.trim())?;
    let field_type = caps.get(1)?.as_str().trim().to_string();
    let parent = caps.get(2).map(|m| m.as_str().trim().to_string());
    Some(FieldDescriptor { field_type, parent })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Signature,
    Text,
    Date,
}

impl FieldType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "signature" => Some(FieldType::Signature),
            "text" => Some(FieldType::Text),
            "date" => Some(FieldType::Date),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Signature => "signature",
            FieldType::Text => "text",
            FieldType::Date => "date",
        }
    }
}

/// Field types a dependent field's parent may currently carry.
/// Only `date` dependents exist today, so only `signature`/`text` parents
/// are valid; enforced again at insert time in `lifecycle::create_document`.
pub fn is_valid_parent_type(field_type: FieldType) -> bool {
    matches!(field_type, FieldType::Signature | FieldType::Text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_bare_type() {
        let d = parse_field_reference("{signature}").unwrap();
        assert_eq!(d.field_type, "signature");
        assert_eq!(d.parent, None);
    }

    #[test]
    fn parses_type_with_parent_and_whitespace() {
        let d = parse_field_reference("{  date : sig  }").unwrap();
        assert_eq!(d.field_type, "date");
        assert_eq!(d.parent.as_deref(), Some("sig"));
    }

    #[test]
    fn rejects_values_missing_braces() {
        assert!(parse_field_reference("signature").is_none());
        assert!(parse_field_reference("").is_none());
    }

    #[test]
    fn field_type_round_trips() {
        for t in [FieldType::Signature, FieldType::Text, FieldType::Date] {
            assert_eq!(FieldType::parse(t.as_str()), Some(t));
        }
        assert_eq!(FieldType::parse("bogus"), None);
    }
}
