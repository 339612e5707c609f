//! Subscription descriptors.

use common::messages::SubscribeRequest;
use common::stream::Topic;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Which entities of a topic are wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every entity the server knows about.
    All,
    /// An explicit set of entity ids.
    Entities(BTreeSet<String>),
}

impl Scope {
    pub fn entities<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Scope::Entities(ids.into_iter().map(Into::into).collect())
    }

    /// An explicit scope naming no entity can never match anything.
    pub fn is_empty(&self) -> bool {
        matches!(self, Scope::Entities(ids) if ids.is_empty())
    }

    pub fn includes(&self, entity_id: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Entities(ids) => ids.contains(entity_id),
        }
    }

    /// Payload of the topic's subscribe frame.
    pub fn to_request(&self) -> SubscribeRequest {
        match self {
            Scope::All => SubscribeRequest::all(),
            Scope::Entities(ids) => SubscribeRequest::entities(ids.iter().cloned().collect()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Entities(ids) => write!(f, "{} entities", ids.len()),
        }
    }
}

/// A topic together with the scope the consumer asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionDescriptor {
    pub topic: Topic,
    pub scope: Scope,
}

impl SubscriptionDescriptor {
    pub fn new(topic: Topic, scope: Scope) -> Self {
        Self { topic, scope }
    }
}
