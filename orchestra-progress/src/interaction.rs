//! Prompts that block a pipeline until someone answers them.

use serde::{Deserialize, Serialize};

use crate::ProgressError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "inputType", rename_all = "camelCase")]
pub enum InputKind {
    Text,
    SecretText,
    Boolean,
    Number,
    Choice { options: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDescriptor {
    pub name: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: InputKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

impl InputDescriptor {
    pub fn new(name: impl Into<String>, label: impl Into<String>, kind: InputKind) -> Self {
        InputDescriptor {
            name: name.into(),
            label: label.into(),
            kind,
            required: false,
            placeholder: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    /// Parse a raw answer. An empty answer means "not provided".
    fn parse(&self, raw: &str) -> Result<Option<InputValue>, ProgressError> {
        let invalid = |reason: String| ProgressError::InvalidAnswer {
            input: self.name.clone(),
            reason,
        };
        if raw.is_empty() {
            return if self.required {
                Err(invalid("a value is required".to_owned()))
            } else {
                Ok(None)
            };
        }
        let value = match &self.kind {
            InputKind::Text | InputKind::SecretText => InputValue::Text(raw.to_owned()),
            InputKind::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => InputValue::Boolean(true),
                "false" | "no" | "n" | "0" => InputValue::Boolean(false),
                _ => return Err(invalid(format!("'{}' is not a yes/no answer", raw))),
            },
            InputKind::Number => match raw.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => InputValue::Number(n),
                _ => return Err(invalid(format!("'{}' is not a number", raw))),
            },
            InputKind::Choice { options } => {
                if options.iter().any(|o| o == raw) {
                    InputValue::Text(raw.to_owned())
                } else {
                    return Err(invalid(format!(
                        "'{}' is not one of: {}",
                        raw,
                        options.join(", ")
                    )));
                }
            }
        };
        Ok(Some(value))
    }
}

/// A question, or with no inputs, a notification to acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub title: String,
    pub message: String,
    pub inputs: Vec<InputDescriptor>,
    pub enable_markdown: bool,
}

impl Interaction {
    pub fn notification(title: impl Into<String>, message: impl Into<String>) -> Self {
        Interaction {
            title: title.into(),
            message: message.into(),
            inputs: Vec::new(),
            enable_markdown: false,
        }
    }

    pub fn inputs(
        title: impl Into<String>,
        message: impl Into<String>,
        inputs: Vec<InputDescriptor>,
    ) -> Self {
        Interaction {
            title: title.into(),
            message: message.into(),
            inputs,
            enable_markdown: false,
        }
    }

    /// A single yes/no question.
    pub fn confirm(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::inputs(
            title,
            message,
            vec![InputDescriptor::new("confirm", "Confirm", InputKind::Boolean).required()],
        )
    }

    pub fn with_markdown(mut self) -> Self {
        self.enable_markdown = true;
        self
    }

    /// Check `answers` (one per input, in order) against the inputs.
    pub fn parse_answers(&self, answers: &[String]) -> Result<InteractionResponse, ProgressError> {
        if answers.len() != self.inputs.len() {
            return Err(ProgressError::InvalidAnswer {
                input: self.title.clone(),
                reason: format!(
                    "expected {} answer(s), got {}",
                    self.inputs.len(),
                    answers.len()
                ),
            });
        }
        let values = self
            .inputs
            .iter()
            .zip(answers)
            .map(|(input, raw)| Ok((input.name.clone(), input.parse(raw)?)))
            .collect::<Result<Vec<_>, ProgressError>>()?;
        Ok(InteractionResponse { values })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Text(String),
    Boolean(bool),
    Number(f64),
}

impl InputValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            InputValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            InputValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InputValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// The parsed answers to an [`Interaction`], in input order. Optional inputs
/// that were left empty map to `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InteractionResponse {
    pub values: Vec<(String, Option<InputValue>)>,
}

impl InteractionResponse {
    pub fn get(&self, name: &str) -> Option<&InputValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref())
    }

    /// For [`Interaction::confirm`] prompts.
    pub fn confirmed(&self) -> bool {
        self.get("confirm")
            .and_then(InputValue::as_bool)
            .unwrap_or(false)
    }
}
