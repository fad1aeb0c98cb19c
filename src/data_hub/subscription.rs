use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::RegistrationError;
use crate::item::{ContentType, Message};

/// Name of the wildcard subscription in configuration files
pub const ANY: &str = "ANY";

/// Identifier the hub assigns to each registered consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A consumer's declared interest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Every item, whatever its content type
    Any,
    Types(BTreeSet<ContentType>),
}

impl Subscription {
    pub fn any() -> Self {
        Subscription::Any
    }

    /// Subscribe to a list of content types; duplicates collapse, and the
    /// `ANY` sentinel anywhere in the list widens the subscription to everything.
    pub fn to<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ContentType>,
    {
        let mut set = BTreeSet::new();
        for ct in types {
            let ct = ct.into();
            if matches!(&ct, ContentType::Other(s) if s.eq_ignore_ascii_case(ANY)) {
                return Subscription::Any;
            }
            set.insert(ct);
        }
        Subscription::Types(set)
    }

    pub fn matches(&self, content_type: &ContentType) -> bool {
        match self {
            Subscription::Any => true,
            Subscription::Types(types) => types.contains(content_type),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Subscription::Types(types) if types.is_empty())
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscription::Any => f.write_str(ANY),
            Subscription::Types(types) => {
                let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
                write!(f, "{}", names.join(","))
            }
        }
    }
}

/// A registered consumer as seen from the hub loop
pub(crate) struct ConsumerEntry {
    pub name: String,
    pub subscription: Subscription,
    pub inbox: flume::Sender<Message>,
    /// Publishes back into the hub while consuming (transformation stages)
    pub republishes: bool,
    /// Has already been handed the shutdown sentinel
    pub pilled: bool,
}

/// Multimap from content type to registered consumers
///
/// Only the hub loop touches this, so it needs no locking. Each consumer is
/// indexed either under the wildcard list or once per subscribed type, which
/// makes a consumer appear at most once in any dispatch.
#[derive(Default)]
pub(crate) struct Registry {
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    by_type: HashMap<ContentType, Vec<ConsumerId>>,
    any: Vec<ConsumerId>,
}

impl Registry {
    pub fn register(&mut self, id: ConsumerId, entry: ConsumerEntry) -> Result<(), RegistrationError> {
        if self.consumers.contains_key(&id) {
            return Err(RegistrationError::Duplicate(id.0));
        }
        if entry.subscription.is_empty() {
            return Err(RegistrationError::EmptySubscription(entry.name));
        }

        match &entry.subscription {
            Subscription::Any => self.any.push(id),
            Subscription::Types(types) => {
                for ct in types {
                    self.by_type.entry(ct.clone()).or_default().push(id);
                }
            }
        }
        self.consumers.insert(id, entry);
        Ok(())
    }

    pub fn deregister(&mut self, id: ConsumerId) -> Result<ConsumerEntry, RegistrationError> {
        let entry = self
            .consumers
            .remove(&id)
            .ok_or(RegistrationError::NotRegistered(id.0))?;

        match &entry.subscription {
            Subscription::Any => self.any.retain(|c| *c != id),
            Subscription::Types(types) => {
                for ct in types {
                    if let Some(ids) = self.by_type.get_mut(ct) {
                        ids.retain(|c| *c != id);
                        if ids.is_empty() {
                            self.by_type.remove(ct);
                        }
                    }
                }
            }
        }
        Ok(entry)
    }

    /// Consumers whose subscription matches `content_type`
    pub fn matching(&self, content_type: &ContentType) -> Vec<ConsumerId> {
        let typed = self.by_type.get(content_type).map(Vec::as_slice).unwrap_or(&[]);
        let mut ids = Vec::with_capacity(self.any.len() + typed.len());
        ids.extend_from_slice(&self.any);
        ids.extend_from_slice(typed);
        ids
    }

    pub fn get(&self, id: ConsumerId) -> Option<&ConsumerEntry> {
        self.consumers.get(&id)
    }

    pub fn get_mut(&mut self, id: ConsumerId) -> Option<&mut ConsumerEntry> {
        self.consumers.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<ConsumerId> {
        let mut ids: Vec<ConsumerId> = self.consumers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }
}
