use figment::{
    Figment,
    providers::{Format, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::db::query::{Record, RowScope, record_matches};
use crate::error::WardenError;
use crate::policy::context::AuthContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Read => "read",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A single access condition.
///
/// Context-only rules resolve to a yes/no for the caller; row rules resolve to an equality
/// filter the row must contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    Always,
    Authenticated,
    Anonymous,
    /// `field` holds the id of the current user.
    Owner { field: String },
    /// The current user has at least one of `roles`.
    Role { roles: Vec<String> },
    FieldEquals { field: String, value: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Always,
    Never,
    RowsMatching(Record),
}

impl Rule {
    pub fn evaluate(&self, ctx: &AuthContext) -> Verdict {
        match self {
            Rule::Always => Verdict::Always,
            Rule::Authenticated if ctx.user.is_some() => Verdict::Always,
            Rule::Anonymous if ctx.user.is_none() => Verdict::Always,
            Rule::Authenticated | Rule::Anonymous => Verdict::Never,
            Rule::Owner { field } => match &ctx.user {
                Some(user) => Verdict::RowsMatching(single(field, user.id.clone())),
                None => Verdict::Never,
            },
            Rule::Role { roles } if roles.iter().any(|r| ctx.has_role(r)) => Verdict::Always,
            Rule::Role { .. } => Verdict::Never,
            Rule::FieldEquals { field, value } => {
                Verdict::RowsMatching(single(field, value.clone()))
            }
        }
    }
}

fn single(field: &str, value: Value) -> Record {
    let mut r = Record::new();
    r.insert(field.to_string(), value);
    r
}

/// Outcome of resolving a list of allow rules for one caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Grant {
    None,
    All,
    Rows(Vec<Record>),
}

/// Resolve allow rules: any `Always` grants everything, otherwise row filters are alternatives.
pub fn grant(rules: &[Rule], ctx: &AuthContext) -> Grant {
    let mut filters = Vec::new();
    for rule in rules {
        match rule.evaluate(ctx) {
            Verdict::Always => return Grant::All,
            Verdict::Never => {}
            Verdict::RowsMatching(f) => filters.push(f),
        }
    }
    if filters.is_empty() {
        Grant::None
    } else {
        Grant::Rows(filters)
    }
}

impl Grant {
    pub fn admits(&self, record: &Record) -> bool {
        match self {
            Grant::None => false,
            Grant::All => true,
            Grant::Rows(filters) => filters.iter().any(|f| record_matches(record, f)),
        }
    }
}

/// Allow and deny rules for one operation. Deny wins; no matching allow rule means denied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperationRules {
    pub allow: Vec<Rule>,
    pub deny: Vec<Rule>,
}

impl OperationRules {
    /// Rows the caller may touch, or `None` when the operation is refused outright.
    pub fn scope(&self, ctx: &AuthContext) -> Option<RowScope> {
        let mut scope = RowScope::unrestricted();
        for rule in &self.deny {
            match rule.evaluate(ctx) {
                Verdict::Always => return None,
                Verdict::Never => {}
                Verdict::RowsMatching(f) => scope.deny.push(f),
            }
        }
        match grant(&self.allow, ctx) {
            Grant::None => None,
            Grant::All => Some(scope),
            Grant::Rows(filters) => {
                scope.restrict(filters);
                Some(scope)
            }
        }
    }
}

/// Column-level allow lists. `None` leaves the column unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldPolicy {
    pub read: Option<Vec<Rule>>,
    pub write: Option<Vec<Rule>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelPolicy {
    pub read: OperationRules,
    pub create: OperationRules,
    pub update: OperationRules,
    pub delete: OperationRules,
    pub fields: BTreeMap<String, FieldPolicy>,
}

impl ModelPolicy {
    pub fn rules(&self, op: Operation) -> &OperationRules {
        match op {
            Operation::Read => &self.read,
            Operation::Create => &self.create,
            Operation::Update => &self.update,
            Operation::Delete => &self.delete,
        }
    }

    /// Drop the columns of `record` the caller may not read.
    pub fn strip_unreadable(&self, ctx: &AuthContext, mut record: Record) -> Record {
        // Rules are judged against the full row, before anything is removed.
        let hidden: Vec<&String> = self
            .fields
            .iter()
            .filter(|(field, _)| record.contains_key(field.as_str()))
            .filter_map(|(field, policy)| policy.read.as_ref().map(|rules| (field, rules)))
            .filter(|(_, rules)| !grant(rules, ctx).admits(&record))
            .map(|(field, _)| field)
            .collect();
        for field in hidden {
            record.remove(field.as_str());
        }
        record
    }
}

/// Access rules for every model. Models without an entry are closed to every operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySet {
    pub models: BTreeMap<String, ModelPolicy>,
}

impl PolicySet {
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, WardenError> {
        if !path.is_file() {
            return Err(WardenError::PolicyFileMissing(path.to_path_buf()));
        }
        Ok(Figment::from(Toml::file(path)).extract()?)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, WardenError> {
        Ok(Figment::from(Toml::string(source)).extract()?)
    }

    pub fn model(&self, name: &str) -> Option<&ModelPolicy> {
        self.models.get(name)
    }
}
