use thiserror::Error;

/// Errors raised while parsing an expression node from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionParseError {
    #[error("expression at '{path}' has no recognized tag")]
    MissingTag { path: String },

    #[error("expression at '{path}' sets more than one tag: {tags}")]
    MultipleTags { path: String, tags: String },

    #[error("expression at '{path}' has unexpected key '{key}'")]
    UnexpectedKey { path: String, key: String },

    #[error("expression at '{path}': {reason}")]
    InvalidShape { path: String, reason: String },
}

/// Errors raised when parsing an invocation type string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown invocation type: '{0}'")]
pub struct InvocationTypeError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_parse_error_display() {
        let err = ExpressionParseError::MultipleTags {
            path: "stages.fetch.condition".to_string(),
            tags: "ref, value".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "expression at 'stages.fetch.condition' sets more than one tag: ref, value"
        );
    }

    #[test]
    fn test_invocation_type_error_display() {
        let err = InvocationTypeError("Later".to_string());
        assert_eq!(err.to_string(), "unknown invocation type: 'Later'");
    }
}
