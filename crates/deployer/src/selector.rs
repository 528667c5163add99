//! Label sets and the equality selectors derived from them.
//!
//! Validation follows the Kubernetes label syntax: keys are qualified names
//! with an optional DNS subdomain prefix, values are at most 63 characters.

use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::DeployError;

/// Labels selecting a workload's pods, ordered by key.
pub type LabelSet = BTreeMap<String, String>;

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

lazy_static! {
    static ref QUALIFIED_NAME: Regex =
        Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("valid regex");
    static ref DNS_SUBDOMAIN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("valid regex");
    static ref LABEL_VALUE: Regex =
        Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("valid regex");
}

/// A validated label-equality selector, e.g. `app=web,tier=frontend`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector(String);

impl LabelSelector {
    /// Build a selector from a label set.
    ///
    /// Fails when the set is empty (it would select every pod in the
    /// namespace) or when any key or value is not valid label syntax.
    pub fn from_labels(labels: &LabelSet) -> Result<Self, DeployError> {
        if labels.is_empty() {
            return Err(DeployError::InvalidSelector(
                "label set is empty".to_string(),
            ));
        }

        let mut terms = Vec::with_capacity(labels.len());
        for (key, value) in labels {
            validate_key(key).map_err(DeployError::InvalidSelector)?;
            validate_value(key, value).map_err(DeployError::InvalidSelector)?;
            terms.push(format!("{key}={value}"));
        }

        Ok(Self(terms.join(",")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_key(key: &str) -> Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN || !DNS_SUBDOMAIN.is_match(prefix) {
            return Err(format!("label key {key:?} has an invalid prefix"));
        }
    }

    if name.is_empty() || name.len() > MAX_NAME_LEN || !QUALIFIED_NAME.is_match(name) {
        return Err(format!("label key {key:?} is not a valid qualified name"));
    }

    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), String> {
    if value.len() > MAX_NAME_LEN || !LABEL_VALUE.is_match(value) {
        return Err(format!("label {key:?} has invalid value {value:?}"));
    }
    Ok(())
}
