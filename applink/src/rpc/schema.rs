//! Schema attachment as a validating visitor over [`RpcValue`] trees.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::rpc::value::RpcValue;

/// Validation failure with the path of the offending node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid data at `{path}`: {reason}")]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

impl ValidationError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_owned(),
            reason: reason.into(),
        }
    }
}

/// A map member: its schema plus whether it must be present.
#[derive(Debug, Clone)]
pub struct Member {
    pub schema: Schema,
    pub mandatory: bool,
}

impl Member {
    #[must_use]
    pub fn required(schema: Schema) -> Self {
        Self {
            schema,
            mandatory: true,
        }
    }

    #[must_use]
    pub fn optional(schema: Schema) -> Self {
        Self {
            schema,
            mandatory: false,
        }
    }
}

/// Structural schema for one RPC parameter tree.
#[derive(Debug, Clone, Default)]
pub enum Schema {
    /// Anything goes; used for payloads the core routes but never reads.
    #[default]
    Any,
    Bool,
    Int {
        min: Option<i64>,
        max: Option<i64>,
    },
    Double,
    String {
        max_length: Option<usize>,
    },
    /// A string restricted to a fixed vocabulary.
    Enumeration(Vec<&'static str>),
    Array {
        element: Box<Schema>,
        min_size: Option<usize>,
        max_size: Option<usize>,
    },
    /// Unknown members are tolerated and left unvalidated, the way the
    /// wire format evolves without breaking older head units.
    Map(BTreeMap<&'static str, Member>),
}

impl Schema {
    #[must_use]
    pub fn int() -> Self {
        Self::Int {
            min: None,
            max: None,
        }
    }

    #[must_use]
    pub fn string() -> Self {
        Self::String { max_length: None }
    }

    #[must_use]
    pub fn array_of(element: Schema) -> Self {
        Self::Array {
            element: Box::new(element),
            min_size: None,
            max_size: None,
        }
    }

    #[must_use]
    pub fn map<const N: usize>(members: [(&'static str, Member); N]) -> Self {
        Self::Map(members.into_iter().collect())
    }

    /// Walks `value` and checks it against this schema.
    pub fn validate(&self, value: &RpcValue) -> Result<(), ValidationError> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &RpcValue, path: &str) -> Result<(), ValidationError> {
        match (self, value) {
            (Self::Any, _) => Ok(()),
            (Self::Bool, RpcValue::Bool(_)) => Ok(()),
            (Self::Int { min, max }, RpcValue::Int(i)) => {
                if let Some(min) = min {
                    if i < min {
                        return Err(ValidationError::new(path, format!("{i} below minimum {min}")));
                    }
                }
                if let Some(max) = max {
                    if i > max {
                        return Err(ValidationError::new(path, format!("{i} above maximum {max}")));
                    }
                }
                Ok(())
            }
            (Self::Double, RpcValue::Double(_) | RpcValue::Int(_)) => Ok(()),
            (Self::String { max_length }, RpcValue::String(s)) => {
                if let Some(max) = max_length {
                    if s.len() > *max {
                        return Err(ValidationError::new(
                            path,
                            format!("string length {} above maximum {max}", s.len()),
                        ));
                    }
                }
                Ok(())
            }
            (Self::Enumeration(allowed), RpcValue::String(s)) => {
                if allowed.contains(&s.as_str()) {
                    Ok(())
                } else {
                    Err(ValidationError::new(path, format!("`{s}` not in enumeration")))
                }
            }
            (
                Self::Array {
                    element,
                    min_size,
                    max_size,
                },
                RpcValue::Array(items),
            ) => {
                if let Some(min) = min_size {
                    if items.len() < *min {
                        return Err(ValidationError::new(
                            path,
                            format!("array size {} below minimum {min}", items.len()),
                        ));
                    }
                }
                if let Some(max) = max_size {
                    if items.len() > *max {
                        return Err(ValidationError::new(
                            path,
                            format!("array size {} above maximum {max}", items.len()),
                        ));
                    }
                }
                for (index, item) in items.iter().enumerate() {
                    element.validate_at(item, &format!("{path}[{index}]"))?;
                }
                Ok(())
            }
            (Self::Map(members), RpcValue::Map(map)) => {
                for (name, member) in members {
                    match map.get(*name) {
                        Some(value) => {
                            member.schema.validate_at(value, &format!("{path}.{name}"))?;
                        }
                        None if member.mandatory => {
                            return Err(ValidationError::new(
                                path,
                                format!("missing mandatory member `{name}`"),
                            ));
                        }
                        None => {}
                    }
                }
                Ok(())
            }
            (expected, got) => Err(ValidationError::new(
                path,
                format!("expected {expected:?}, got {got:?}"),
            )),
        }
    }
}
