//! Parsing for the list API's `filter`, `order` and `fields` parameters.
//!
//! - `filter=field:OP:value` with OP in {EQ NE LT LE GT GE LIKE ILIKE IN}
//! - `order=field:asc|desc|iasc|idesc` (the `i` variants compare
//!   case-insensitively)
//! - `fields=a,b,source[name,url]` selects columns and expands relationships

use std::collections::HashMap;

use crate::db::handlers::requests::{FilterClause, FilterOp, OrderClause, REQUEST_FIELDS};
use crate::errors::Error;

/// Relationships the queue projection can expand into server objects.
pub const REQUEST_RELATIONSHIPS: &[&str] = &["source", "destination", "cc_servers"];

/// Fields that can be projected but not filtered or ordered on.
const PROJECTION_ONLY_FIELDS: &[&str] = &[
    "body",
    "response",
    "cc_servers",
    "cc_servers_status",
    "raw_msg",
    "extras",
    "url_suffix",
    "body_is_query_param",
];

fn whitelisted(field: &str) -> Option<&'static str> {
    REQUEST_FIELDS.iter().find(|f| **f == field).copied()
}

pub fn parse_filter(raw: &str) -> Result<FilterClause, Error> {
    let mut parts = raw.splitn(3, ':');
    let (Some(field), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::BadRequest {
            message: format!("filter must be field:OP:value, got '{raw}'"),
        });
    };

    let field = whitelisted(field).ok_or_else(|| Error::BadRequest {
        message: format!("unknown filter field '{field}'"),
    })?;
    let op = FilterOp::parse(op).ok_or_else(|| Error::BadRequest {
        message: format!("unknown filter operator '{op}'"),
    })?;

    Ok(FilterClause {
        field,
        op,
        value: value.to_string(),
    })
}

pub fn parse_order(raw: &str) -> Result<OrderClause, Error> {
    let (field, direction) = raw.split_once(':').ok_or_else(|| Error::BadRequest {
        message: format!("order must be field:direction, got '{raw}'"),
    })?;

    let field = whitelisted(field).ok_or_else(|| Error::BadRequest {
        message: format!("unknown order field '{field}'"),
    })?;

    let (descending, case_insensitive) = match direction {
        "asc" => (false, false),
        "desc" => (true, false),
        "iasc" => (false, true),
        "idesc" => (true, true),
        other => {
            return Err(Error::BadRequest {
                message: format!("unknown order direction '{other}'"),
            });
        }
    };

    Ok(OrderClause {
        field,
        descending,
        case_insensitive,
    })
}

/// Selected plain fields plus relationship expansions from the `fields` DSL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSelection {
    pub fields: Vec<String>,
    pub relationships: HashMap<String, Vec<String>>,
}

impl FieldSelection {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.relationships.is_empty()
    }
}

/// Parse the comma/bracket projection DSL. Unknown plain fields and unknown
/// relationship names are dropped rather than rejected, matching the
/// forgiving behaviour callers rely on.
pub fn parse_fields(input: &str) -> FieldSelection {
    let mut selection = FieldSelection::default();
    let mut name = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ',' => {
                push_plain(&mut selection, &name);
                name.clear();
            }
            '[' => {
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                let rel = name.trim();
                if REQUEST_RELATIONSHIPS.contains(&rel) {
                    let subfields: Vec<String> = inner
                        .split(',')
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect();
                    selection.relationships.insert(rel.to_string(), subfields);
                }
                name.clear();
                // consume the separator after the bracket group, if any
                if chars.peek() == Some(&',') {
                    chars.next();
                }
            }
            _ => name.push(c),
        }
    }
    push_plain(&mut selection, &name);

    selection
}

fn push_plain(selection: &mut FieldSelection, name: &str) {
    let name = name.trim();
    if name.is_empty() {
        return;
    }
    if whitelisted(name).is_some() || PROJECTION_ONLY_FIELDS.contains(&name) {
        selection.fields.push(name.to_string());
    }
}

/// Keep only the selected plain fields of a serialized row.
pub fn project(mut value: serde_json::Value, selection: &FieldSelection) -> serde_json::Value {
    if selection.is_empty() {
        return value;
    }
    if let serde_json::Value::Object(map) = &mut value {
        map.retain(|key, _| selection.fields.iter().any(|f| f == key));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parsing() {
        let clause = parse_filter("status:EQ:failed").unwrap();
        assert_eq!(clause.field, "status");
        assert_eq!(clause.op, FilterOp::Eq);
        assert_eq!(clause.value, "failed");

        // values may themselves contain colons
        let clause = parse_filter("errors:LIKE:%connect: refused%").unwrap();
        assert_eq!(clause.value, "%connect: refused%");

        let clause = parse_filter("status:IN:failed,expired").unwrap();
        assert_eq!(clause.op, FilterOp::In);

        assert!(parse_filter("status").is_err());
        assert!(parse_filter("nonsense:EQ:x").is_err());
        assert!(parse_filter("status:BETWEEN:a").is_err());
    }

    #[test]
    fn order_parsing() {
        let order = parse_order("created:desc").unwrap();
        assert_eq!(order.field, "created");
        assert!(order.descending);
        assert!(!order.case_insensitive);

        let order = parse_order("facility:iasc").unwrap();
        assert!(!order.descending);
        assert!(order.case_insensitive);

        assert!(parse_order("created").is_err());
        assert!(parse_order("created:sideways").is_err());
    }

    #[test]
    fn fields_dsl_plain_and_relationships() {
        let selection = parse_fields("uid,status,source[name,url],destination[name]");
        assert_eq!(selection.fields, vec!["uid", "status"]);
        assert_eq!(
            selection.relationships["source"],
            vec!["name".to_string(), "url".to_string()]
        );
        assert_eq!(selection.relationships["destination"], vec!["name".to_string()]);
    }

    #[test]
    fn fields_dsl_drops_unknown_names() {
        let selection = parse_fields("uid,bogus,status");
        assert_eq!(selection.fields, vec!["uid", "status"]);
    }

    #[test]
    fn bare_relationship_name_projects_the_raw_column() {
        let selection = parse_fields("uid,cc_servers");
        assert_eq!(selection.fields, vec!["uid", "cc_servers"]);
        assert!(selection.relationships.is_empty());
    }

    #[test]
    fn projection_retains_selected_keys() {
        let value = serde_json::json!({"uid": "A1", "status": "ready", "body": "{}"});
        let selection = parse_fields("uid,status");
        let projected = project(value, &selection);
        assert_eq!(projected, serde_json::json!({"uid": "A1", "status": "ready"}));
    }
}
