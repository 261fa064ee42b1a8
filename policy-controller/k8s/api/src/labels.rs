use crate::LabelSelector;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of objects by their labels.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

/// The difference between two label maps.
///
/// A key whose value changed is reported in `changed` only, never in `added` or `removed`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: Map,
    pub removed: Map,
    /// Maps each key to its `(old, new)` values.
    pub changed: BTreeMap<String, (String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSelector {
    #[error("unknown operator {operator:?} for key {key:?}")]
    UnknownOperator { key: String, operator: String },

    #[error("operator {operator:?} requires values for key {key:?}")]
    MissingValues { key: String, operator: &'static str },

    #[error("operator {operator:?} does not accept values for key {key:?}")]
    UnexpectedValues { key: String, operator: &'static str },

    #[error("empty label key")]
    EmptyKey,
}

// === Selector ===

impl Selector {
    pub fn match_labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.match_labels
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn expressions(&self) -> &[Expression] {
        self.match_expressions.as_deref().unwrap_or_default()
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = InvalidSelector;

    fn try_from(selector: &LabelSelector) -> Result<Self, Self::Error> {
        if let Some(labels) = selector.match_labels.as_ref() {
            if labels.keys().any(|k| k.is_empty()) {
                return Err(InvalidSelector::EmptyKey);
            }
        }

        let match_expressions = match selector.match_expressions.as_ref() {
            Some(reqs) => Some(
                reqs.iter()
                    .map(|req| {
                        Expression::new(
                            req.key.clone(),
                            &req.operator,
                            req.values.iter().flatten().cloned(),
                        )
                    })
                    .collect::<Result<Expressions, _>>()?,
            ),
            None => None,
        };

        Ok(Self {
            match_labels: selector.match_labels.clone(),
            match_expressions,
        })
    }
}

// === Labels ===

impl Labels {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Computes the changes required to go from `self` to `new`.
    pub fn delta(&self, new: &Labels) -> Delta {
        delta(self.as_ref(), new.as_ref())
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

// === Delta ===

/// Computes the label-set difference between two label maps.
pub fn delta(old: &Map, new: &Map) -> Delta {
    let mut delta = Delta::default();
    for (k, v) in old.iter() {
        match new.get(k) {
            None => {
                delta.removed.insert(k.clone(), v.clone());
            }
            Some(nv) if nv != v => {
                delta.changed.insert(k.clone(), (v.clone(), nv.clone()));
            }
            Some(_) => {}
        }
    }
    for (k, v) in new.iter() {
        if !old.contains_key(k) {
            delta.added.insert(k.clone(), v.clone());
        }
    }
    delta
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

// === Expression ===

impl Expression {
    pub fn new(
        key: String,
        operator: &str,
        values: impl IntoIterator<Item = String>,
    ) -> Result<Self, InvalidSelector> {
        if key.is_empty() {
            return Err(InvalidSelector::EmptyKey);
        }
        let operator = match operator {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            op => {
                return Err(InvalidSelector::UnknownOperator {
                    key,
                    operator: op.to_string(),
                })
            }
        };
        let values = values.into_iter().collect::<BTreeSet<_>>();
        match operator {
            Operator::In | Operator::NotIn if values.is_empty() => {
                Err(InvalidSelector::MissingValues {
                    key,
                    operator: operator.as_str(),
                })
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                Err(InvalidSelector::UnexpectedValues {
                    key,
                    operator: operator.as_str(),
                })
            }
            _ => Ok(Self {
                key,
                operator,
                values,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "In",
            Self::NotIn => "NotIn",
            Self::Exists => "Exists",
            Self::DoesNotExist => "DoesNotExist",
        }
    }
}
