//! The declarative expression grammar used by conditions, transformers, and
//! dependency parameters.
//!
//! On the wire an expression is a JSON object carrying exactly one tag:
//!
//! ```yaml
//! condition:
//!   helper: matches
//!   params:
//!     a: { ref: event.foo.bar }
//!     b: { value: 4 }
//! ```
//!
//! Bare scalars and arrays are shorthand for `{ value: ... }`. Objects with no
//! tag, or with more than one, are rejected when the configuration is parsed.

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ExpressionParseError;

/// Named sub-expressions, kept in declaration order.
pub type ExpressionMap = IndexMap<String, Expression>;

const TAG_VALUE: &str = "value";
const TAG_REF: &str = "ref";
const TAG_EVERY: &str = "every";
const TAG_SOME: &str = "some";
const TAG_NOT: &str = "not";
const TAG_OR: &str = "or";
const TAG_ALL: &str = "all";
const TAG_HELPER: &str = "helper";
const KEY_PARAMS: &str = "params";

const TAGS: [&str; 8] = [
    TAG_VALUE, TAG_REF, TAG_EVERY, TAG_SOME, TAG_NOT, TAG_OR, TAG_ALL, TAG_HELPER,
];

/// A parsed expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// An embedded value, returned verbatim.
    Literal(Value),
    /// Dotted-path lookup into the resolution context.
    Ref(String),
    /// True iff every entry is truthy.
    Every(ExpressionMap),
    /// True iff at least one entry is truthy.
    Some(ExpressionMap),
    /// Boolean negation.
    Not(Box<Expression>),
    /// First entry that resolves to a non-null value.
    Or(Vec<Expression>),
    /// Record of every resolved entry.
    All(ExpressionMap),
    /// Call to a named helper with resolved parameters.
    Helper { name: String, params: ExpressionMap },
}

impl Expression {
    /// Shorthand for a literal node.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    /// Shorthand for a reference node.
    pub fn reference(path: impl Into<String>) -> Self {
        Expression::Ref(path.into())
    }

    /// Parse an expression node from its JSON form.
    pub fn from_value(value: &Value) -> Result<Self, ExpressionParseError> {
        parse_node(value, "$")
    }

    /// Parse an expression node, reporting errors relative to `path`.
    pub fn from_value_at(value: &Value, path: &str) -> Result<Self, ExpressionParseError> {
        parse_node(value, path)
    }

    /// Render the node back to its tagged JSON form.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        match self {
            Expression::Literal(v) => {
                obj.insert(TAG_VALUE.to_string(), v.clone());
            }
            Expression::Ref(path) => {
                obj.insert(TAG_REF.to_string(), Value::String(path.clone()));
            }
            Expression::Every(map) => {
                obj.insert(TAG_EVERY.to_string(), map_to_value(map));
            }
            Expression::Some(map) => {
                obj.insert(TAG_SOME.to_string(), map_to_value(map));
            }
            Expression::Not(inner) => {
                obj.insert(TAG_NOT.to_string(), inner.to_value());
            }
            Expression::Or(list) => {
                obj.insert(
                    TAG_OR.to_string(),
                    Value::Array(list.iter().map(Expression::to_value).collect()),
                );
            }
            Expression::All(map) => {
                obj.insert(TAG_ALL.to_string(), map_to_value(map));
            }
            Expression::Helper { name, params } => {
                obj.insert(TAG_HELPER.to_string(), Value::String(name.clone()));
                if !params.is_empty() {
                    obj.insert(KEY_PARAMS.to_string(), map_to_value(params));
                }
            }
        }
        Value::Object(obj)
    }

    /// Names of every helper referenced anywhere in this tree.
    pub fn helper_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_helper_names(&mut names);
        names
    }

    fn collect_helper_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expression::Literal(_) | Expression::Ref(_) => {}
            Expression::Every(map) | Expression::Some(map) | Expression::All(map) => {
                map.values().for_each(|e| e.collect_helper_names(names));
            }
            Expression::Not(inner) => inner.collect_helper_names(names),
            Expression::Or(list) => list.iter().for_each(|e| e.collect_helper_names(names)),
            Expression::Helper { name, params } => {
                names.push(name.as_str());
                params.values().for_each(|e| e.collect_helper_names(names));
            }
        }
    }
}

fn map_to_value(map: &ExpressionMap) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect(),
    )
}

fn parse_node(value: &Value, path: &str) -> Result<Expression, ExpressionParseError> {
    let obj = match value {
        Value::Object(obj) => obj,
        other => return Ok(Expression::Literal(other.clone())),
    };

    let tags: Vec<&str> = TAGS
        .iter()
        .copied()
        .filter(|tag| obj.contains_key(*tag))
        .collect();

    let tag = match tags.as_slice() {
        [] => {
            return Err(ExpressionParseError::MissingTag {
                path: path.to_string(),
            });
        }
        [tag] => *tag,
        many => {
            return Err(ExpressionParseError::MultipleTags {
                path: path.to_string(),
                tags: many.join(", "),
            });
        }
    };

    for key in obj.keys() {
        let allowed = key == tag || (tag == TAG_HELPER && key == KEY_PARAMS);
        if !allowed {
            return Err(ExpressionParseError::UnexpectedKey {
                path: path.to_string(),
                key: key.clone(),
            });
        }
    }

    let body = &obj[tag];
    let child_path = format!("{path}.{tag}");
    match tag {
        TAG_VALUE => Ok(Expression::Literal(body.clone())),
        TAG_REF => match body {
            Value::String(s) if !s.is_empty() => Ok(Expression::Ref(s.clone())),
            _ => Err(invalid(path, "'ref' must be a non-empty dotted path string")),
        },
        TAG_EVERY => Ok(Expression::Every(parse_map(body, &child_path)?)),
        TAG_SOME => Ok(Expression::Some(parse_map(body, &child_path)?)),
        TAG_ALL => Ok(Expression::All(parse_map(body, &child_path)?)),
        TAG_NOT => Ok(Expression::Not(Box::new(parse_node(body, &child_path)?))),
        TAG_OR => match body {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| parse_node(item, &format!("{child_path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Expression::Or),
            _ => Err(invalid(path, "'or' must be a list of expressions")),
        },
        TAG_HELPER => {
            let name = match body {
                Value::String(s) if !s.is_empty() => s.clone(),
                _ => return Err(invalid(path, "'helper' must be a non-empty name")),
            };
            let params = match obj.get(KEY_PARAMS) {
                None | Some(Value::Null) => ExpressionMap::new(),
                Some(p) => parse_map(p, &format!("{path}.{KEY_PARAMS}"))?,
            };
            Ok(Expression::Helper { name, params })
        }
        other => Err(invalid(path, &format!("unsupported tag '{other}'"))),
    }
}

fn parse_map(value: &Value, path: &str) -> Result<ExpressionMap, ExpressionParseError> {
    match value {
        Value::Object(obj) => obj
            .iter()
            .map(|(k, v)| Ok((k.clone(), parse_node(v, &format!("{path}.{k}"))?)))
            .collect(),
        _ => Err(invalid(path, "expected a map of named expressions")),
    }
}

fn invalid(path: &str, reason: &str) -> ExpressionParseError {
    ExpressionParseError::InvalidShape {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Expression::from_value(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ref_and_literal() {
        assert_eq!(
            Expression::from_value(&json!({ "ref": "event.foo" })).unwrap(),
            Expression::Ref("event.foo".to_string())
        );
        assert_eq!(
            Expression::from_value(&json!({ "value": false })).unwrap(),
            Expression::Literal(json!(false))
        );
    }

    #[test]
    fn test_bare_values_are_literals() {
        assert_eq!(
            Expression::from_value(&json!("plain")).unwrap(),
            Expression::Literal(json!("plain"))
        );
        assert_eq!(
            Expression::from_value(&json!([1, 2])).unwrap(),
            Expression::Literal(json!([1, 2]))
        );
    }

    #[test]
    fn test_parse_helper_with_params() {
        let expr = Expression::from_value(&json!({
            "helper": "matches",
            "params": { "a": { "ref": "event.foo.bar" }, "b": { "value": 4 } }
        }))
        .unwrap();
        match expr {
            Expression::Helper { name, params } => {
                assert_eq!(name, "matches");
                assert_eq!(params["a"], Expression::Ref("event.foo.bar".to_string()));
                assert_eq!(params["b"], Expression::Literal(json!(4)));
            }
            other => panic!("expected helper, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_combinators() {
        let expr = Expression::from_value(&json!({
            "every": {
                "x": { "not": { "ref": "a" } },
                "y": { "or": [{ "ref": "b" }, { "value": 1 }] }
            }
        }))
        .unwrap();
        let Expression::Every(map) = expr else {
            panic!("expected every");
        };
        assert!(matches!(map["x"], Expression::Not(_)));
        assert!(matches!(&map["y"], Expression::Or(list) if list.len() == 2));
    }

    #[test]
    fn test_multiple_tags_rejected() {
        let err = Expression::from_value(&json!({ "ref": "a", "value": 1 })).unwrap_err();
        assert!(matches!(err, ExpressionParseError::MultipleTags { .. }));
    }

    #[test]
    fn test_untagged_object_rejected() {
        let err = Expression::from_value(&json!({ "bucket": "foo" })).unwrap_err();
        assert!(matches!(err, ExpressionParseError::MissingTag { .. }));
    }

    #[test]
    fn test_unexpected_key_rejected() {
        let err = Expression::from_value(&json!({ "ref": "a", "params": {} })).unwrap_err();
        assert!(matches!(err, ExpressionParseError::UnexpectedKey { ref key, .. } if key == "params"));
    }

    #[test]
    fn test_error_path_points_at_nested_node() {
        let err = Expression::from_value(&json!({
            "all": { "inner": { "ref": "x", "value": 1 } }
        }))
        .unwrap_err();
        match err {
            ExpressionParseError::MultipleTags { path, .. } => assert_eq!(path, "$.all.inner"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_through_serde() {
        let source = json!({
            "helper": "template",
            "params": { "template": { "value": "${a}" }, "params": { "all": { "a": { "ref": "stage.a" } } } }
        });
        let expr: Expression = serde_json::from_value(source.clone()).unwrap();
        assert_eq!(serde_json::to_value(&expr).unwrap(), source);
    }

    #[test]
    fn test_helper_names_collects_nested() {
        let expr = Expression::from_value(&json!({
            "some": {
                "a": { "helper": "isEmptyList", "params": { "list": { "helper": "fromJson" } } },
                "b": { "ref": "x" }
            }
        }))
        .unwrap();
        assert_eq!(expr.helper_names(), vec!["isEmptyList", "fromJson"]);
    }
}
