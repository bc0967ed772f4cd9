//! Label selector evaluation.
//!
//! A [`LabelSelector`] from the wire is compiled into a [`Selector`], a flat list of
//! requirements that are ANDed together. An empty selector matches nothing.

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::error::Error;
use crate::resources::{LabelSelector, LabelSelectorOperator, MachineSet};

pub type Labels = BTreeMap<String, String>;

pub trait Matches {
    fn matches(&self, labels: &Labels) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals { key: String, value: String },
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Matches for Requirement {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key) == Some(value),
            Requirement::In { key, values } => labels.get(key).map_or(false, |v| values.contains(v)),
            Requirement::NotIn { key, values } => {
                labels.get(key).map_or(true, |v| !values.contains(v))
            }
            Requirement::Exists { key } => labels.contains_key(key),
            Requirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requirement::Equals { key, value } => write!(f, "{key}={value}"),
            Requirement::In { key, values } => write!(f, "{key} in ({})", values.join(",")),
            Requirement::NotIn { key, values } => write!(f, "{key} notin ({})", values.join(",")),
            Requirement::Exists { key } => write!(f, "{key}"),
            Requirement::DoesNotExist { key } => write!(f, "!{key}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn parse(selector: &LabelSelector) -> Result<Self, Error> {
        let mut requirements = Vec::new();
        for (key, value) in &selector.match_labels {
            if key.is_empty() {
                return Err(Error::InvalidSelector("empty key in matchLabels".to_owned()));
            }
            requirements.push(Requirement::Equals {
                key: key.clone(),
                value: value.clone(),
            });
        }
        for expr in &selector.match_expressions {
            if expr.key.is_empty() {
                return Err(Error::InvalidSelector(
                    "empty key in matchExpressions".to_owned(),
                ));
            }
            let key = expr.key.clone();
            let requirement = match expr.operator {
                LabelSelectorOperator::In | LabelSelectorOperator::NotIn
                    if expr.values.is_empty() =>
                {
                    return Err(Error::InvalidSelector(format!(
                        "values must be non-empty for operator {:?} on key {key:?}",
                        expr.operator
                    )));
                }
                LabelSelectorOperator::Exists | LabelSelectorOperator::DoesNotExist
                    if !expr.values.is_empty() =>
                {
                    return Err(Error::InvalidSelector(format!(
                        "values must be empty for operator {:?} on key {key:?}",
                        expr.operator
                    )));
                }
                LabelSelectorOperator::In => Requirement::In {
                    key,
                    values: expr.values.clone(),
                },
                LabelSelectorOperator::NotIn => Requirement::NotIn {
                    key,
                    values: expr.values.clone(),
                },
                LabelSelectorOperator::Exists => Requirement::Exists { key },
                LabelSelectorOperator::DoesNotExist => Requirement::DoesNotExist { key },
                LabelSelectorOperator::Unknown => {
                    return Err(Error::InvalidSelector(format!(
                        "unknown operator on key {key:?}"
                    )));
                }
            };
            requirements.push(requirement);
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Render in the label selector query syntax accepted by list calls.
    pub fn to_query(&self) -> String {
        self.requirements
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Matches for Selector {
    fn matches(&self, labels: &Labels) -> bool {
        !self.requirements.is_empty() && self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_query())
    }
}

/// Check that machines created from the template would be selected by the machineset, and that
/// the selector is still the one recorded in status by an earlier reconcile.
pub fn validate_template(machineset: &MachineSet) -> Result<Selector, Error> {
    let selector = Selector::parse(&machineset.spec.selector)?;
    if selector.is_empty() {
        return Err(Error::InvalidSelector("selector is empty".to_owned()));
    }
    if let Some(recorded) = machineset.status.label_selector.as_deref() {
        let current = selector.to_query();
        if !recorded.is_empty() && recorded != current {
            return Err(Error::SelectorChanged {
                recorded: recorded.to_owned(),
                current,
            });
        }
    }
    if !selector.matches(&machineset.spec.template.metadata.labels) {
        return Err(Error::SelectorMismatch {
            selector: selector.to_query(),
        });
    }
    Ok(selector)
}
