//! Fixed category enumeration and the declarative merge policy per category.
//!
//! Every category resolves its ingestion behaviour by table lookup
//! ([`PolicyTable::policy`]), never by inspecting payload shape.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::error::{RelayError, RelayResult};

/// Named bucket of records of one kind.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    Reviews,
    Requests,
    ChatMessages,
    Orders,
    /// Raw Mini App submissions that map to no other category
    Updates,
    /// Aggregate rating snapshot
    Rating,
}

impl Category {
    /// Parses a category name, rejecting anything outside the enumeration.
    pub fn parse(name: &str) -> RelayResult<Self> {
        Category::from_str(name.trim()).map_err(|_| RelayError::UnknownCategory(name.to_string()))
    }

    /// Category implied by a Mini App payload `type`, if any.
    pub fn from_payload_type(kind: &str) -> Option<Self> {
        match kind {
            "review" | "reviews" => Some(Category::Reviews),
            "request" | "requests" => Some(Category::Requests),
            "chat_message" | "chat_messages" | "message" => Some(Category::ChatMessages),
            "order" | "orders" => Some(Category::Orders),
            _ => None,
        }
    }

    pub fn default_strategy(self) -> MergeStrategy {
        match self {
            Category::Reviews | Category::Requests | Category::ChatMessages | Category::Updates => {
                MergeStrategy::UnionById
            }
            Category::Orders => MergeStrategy::Replace,
            Category::Rating => MergeStrategy::Scalar,
        }
    }

    pub fn all() -> impl Iterator<Item = Category> {
        Category::iter()
    }
}

/// How bot-sourced data for a category is folded into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MergeStrategy {
    /// Append-only history; newest record wins per identifier
    UnionById,
    /// Incoming batch becomes the whole collection
    Replace,
    /// Single snapshot value instead of a sequence
    Scalar,
}

impl MergeStrategy {
    pub fn is_scalar(self) -> bool {
        matches!(self, MergeStrategy::Scalar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryPolicy {
    pub category: Category,
    pub merge: MergeStrategy,
}

/// Resolved policy for every category.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<Category, CategoryPolicy>,
}

impl PolicyTable {
    /// Builds the table from defaults plus configured overrides.
    ///
    /// Scalar is a shape rather than a strategy, so an override may switch a
    /// sequence category between `union-by-id` and `replace` but can never
    /// turn a sequence into a scalar or the reverse.
    pub fn with_overrides(overrides: &HashMap<Category, MergeStrategy>) -> RelayResult<Self> {
        let mut policies = HashMap::new();
        for category in Category::all() {
            let default = category.default_strategy();
            let merge = match overrides.get(&category) {
                Some(&wanted) if wanted.is_scalar() != default.is_scalar() => {
                    return Err(RelayError::validation(format!(
                        "category '{}' cannot use '{}' (declared shape is {})",
                        category,
                        wanted,
                        if default.is_scalar() { "scalar" } else { "sequence" }
                    )));
                }
                Some(&wanted) => wanted,
                None => default,
            };
            policies.insert(category, CategoryPolicy { category, merge });
        }
        Ok(Self { policies })
    }

    pub fn policy(&self, category: Category) -> CategoryPolicy {
        self.policies.get(&category).copied().unwrap_or(CategoryPolicy {
            category,
            merge: category.default_strategy(),
        })
    }

    pub fn is_scalar(&self, category: Category) -> bool {
        self.policy(category).merge.is_scalar()
    }

    pub fn iter(&self) -> impl Iterator<Item = CategoryPolicy> + '_ {
        Category::all().map(|c| self.policy(c))
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let policies = Category::all()
            .map(|category| {
                (
                    category,
                    CategoryPolicy {
                        category,
                        merge: category.default_strategy(),
                    },
                )
            })
            .collect();
        Self { policies }
    }
}
