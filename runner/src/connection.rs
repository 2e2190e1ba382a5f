//! Rewiring rules of interface kernels.
//!
//! A [`Connection`] is a `(key, operator, definition)` triple. It can be built from a tuple
//! or from a string such as `"file $= input{rep}.txt"`, where the first word is the key,
//! the second the operator and the rest the definition.

use crate::{
    expr::{self, ExprError},
    record::{Record, Value, TEMPLATE},
    template::{Template, TemplateError},
};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Structural problems, raised while a kernel is being built
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection '{0}' must have the form 'key operator definition'")]
    Arity(String),
    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("Invalid key '{0}'")]
    InvalidKey(String),
    #[error("Definition of '{key}' is not a valid template: {source}")]
    Template {
        key: String,
        #[source]
        source: TemplateError,
    },
    #[error("A kernel cannot both scatter and gather")]
    MixedOperation,
}

/// Problems applying a connection to a record, these end up in the record's `output`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Failed to evaluate '{expression}': {source}")]
    Expr {
        expression: String,
        #[source]
        source: ExprError,
    },
    #[error("Key '{0}' is not present in the record")]
    MissingKey(String),
    #[error("'{key}' = '{value}' is not an integer")]
    NotAnInteger { key: String, value: String },
    #[error("Incrementing '{0}' overflowed")]
    Overflow(String),
    #[error("Scatter of '{key}' has no element {index}")]
    ScatterIndex { key: String, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `=` or `$=`
    Assign,
    /// `?=`
    Evaluate,
    /// `+`
    Increment,
    /// `>` or `]=`
    Scatter,
    /// `<` or `[=`
    Gather,
    /// `+=`
    Append,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Assign => "=",
            Self::Evaluate => "?=",
            Self::Increment => "+",
            Self::Scatter => ">",
            Self::Gather => "<",
            Self::Append => "+=",
        }
    }

    pub fn is_scatter(&self) -> bool {
        matches!(self, Self::Scatter)
    }

    /// both gather flavours combine many records into one
    pub fn is_gather(&self) -> bool {
        matches!(self, Self::Gather | Self::Append)
    }
}

impl FromStr for Operator {
    type Err = ConnectionError;

    fn from_str(symbol: &str) -> Result<Self, Self::Err> {
        match symbol {
            "=" | "$=" => Ok(Self::Assign),
            "?=" => Ok(Self::Evaluate),
            "+" => Ok(Self::Increment),
            ">" | "]=" => Ok(Self::Scatter),
            "<" | "[=" => Ok(Self::Gather),
            "+=" => Ok(Self::Append),
            _ => Err(ConnectionError::UnknownOperator(symbol.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    key: String,
    operator: Operator,
    definition: Template,
}

impl Connection {
    pub fn new(key: &str, operator: &str, definition: &str) -> Result<Self, ConnectionError> {
        Self::with_operator(key, operator.parse()?, definition)
    }

    pub fn with_operator(
        key: &str,
        operator: Operator,
        definition: &str,
    ) -> Result<Self, ConnectionError> {
        if key.is_empty() || key.contains(|c: char| c.is_whitespace() || "{}[]".contains(c)) {
            return Err(ConnectionError::InvalidKey(key.to_string()));
        }

        let definition = Template::parse(definition).map_err(|source| ConnectionError::Template {
            key: key.to_string(),
            source,
        })?;

        Ok(Self {
            key: key.to_string(),
            operator,
            definition,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn definition(&self) -> &Template {
        &self.definition
    }

    pub fn render(&self, record: &Record) -> Result<String, TemplateError> {
        self.definition.render(record)
    }

    /// Apply a link operator to `record` in place
    ///
    /// Scatter and gather operators need the surrounding kernel and are left alone here.
    pub fn apply(&self, record: &mut Record) -> Result<(), RuleError> {
        match self.operator {
            // the command template is kept raw, it is rendered once all keys are set
            Operator::Assign if self.key == TEMPLATE => {
                record.insert(TEMPLATE, self.definition.as_str());
            }
            Operator::Assign => {
                let value = self.render(record)?;
                record.insert(self.key.as_str(), value);
            }
            Operator::Evaluate => {
                let expression = self.render(record)?;
                let value = expr::evaluate(&expression)
                    .map_err(|source| RuleError::Expr { expression, source })?;
                record.insert(self.key.as_str(), value);
            }
            Operator::Increment => {
                let current = record
                    .get(&self.key)
                    .ok_or_else(|| RuleError::MissingKey(self.key.clone()))?;
                let current = current.as_int().ok_or_else(|| RuleError::NotAnInteger {
                    key: self.key.clone(),
                    value: current.to_string(),
                })?;

                let step = self.render(record)?;
                let step = step.trim().parse::<i64>().map_err(|_| RuleError::NotAnInteger {
                    key: self.key.clone(),
                    value: step.clone(),
                })?;

                let next = current
                    .checked_add(step)
                    .ok_or_else(|| RuleError::Overflow(self.key.clone()))?;
                record.insert(self.key.as_str(), next);
            }
            Operator::Scatter | Operator::Gather | Operator::Append => {}
        }

        Ok(())
    }

    /// Values a scatter connection spreads over the branches
    ///
    /// A definition that is a single `{key}` naming a list yields the list elements as
    /// they are, everything else is rendered and split on whitespace.
    pub fn scatter_values(&self, record: &Record) -> Result<Vec<Value>, RuleError> {
        if let Some(elements) = self
            .definition
            .single_field()
            .and_then(|field| record.get(field.name()))
            .and_then(Value::elements)
        {
            return Ok(elements);
        }

        Ok(self
            .render(record)?
            .split_whitespace()
            .map(Value::from)
            .collect())
    }
}

impl FromStr for Connection {
    type Err = ConnectionError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words = line.split_whitespace().collect::<Vec<_>>();

        match words.as_slice() {
            [key, operator, definition @ ..] if !definition.is_empty() => {
                Self::new(key, operator, &definition.join(" "))
            }
            _ => Err(ConnectionError::Arity(line.to_string())),
        }
    }
}

impl TryFrom<(&str, &str, &str)> for Connection {
    type Error = ConnectionError;

    fn try_from((key, operator, definition): (&str, &str, &str)) -> Result<Self, Self::Error> {
        Self::new(key, operator, definition)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.key, self.operator, self.definition)
    }
}
