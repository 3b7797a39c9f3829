// src/core/topic.rs

//! Topic and namespace name grammar.
//!
//! A fully qualified topic name has the form
//! `{persistent|non-persistent}://<property>/<cluster>/<namespace>/<local>`.
//! Global namespaces carry the literal cluster name `global`. Partitions of a
//! partitioned topic append `-partition-<N>` to the local name and are
//! otherwise ordinary topics.

use crate::core::DriftError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The sentinel cluster name used by globally replicated namespaces.
pub const GLOBAL_CLUSTER: &str = "global";

const PARTITION_SUFFIX: &str = "-partition-";

/// The storage domain of a topic.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum TopicDomain {
    Persistent,
    NonPersistent,
}

impl fmt::Display for TopicDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicDomain::Persistent => write!(f, "persistent"),
            TopicDomain::NonPersistent => write!(f, "non-persistent"),
        }
    }
}

impl FromStr for TopicDomain {
    type Err = DriftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(TopicDomain::Persistent),
            "non-persistent" => Ok(TopicDomain::NonPersistent),
            other => Err(DriftError::InvalidTopicName(format!(
                "unknown domain '{other}'"
            ))),
        }
    }
}

/// A namespace identity: `<property>/<cluster>/<namespace>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceName {
    pub property: String,
    pub cluster: String,
    pub namespace: String,
}

impl NamespaceName {
    pub fn new(property: &str, cluster: &str, namespace: &str) -> Result<Self, DriftError> {
        for seg in [property, cluster, namespace] {
            validate_segment(seg)?;
        }
        Ok(Self {
            property: property.to_string(),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Parses a `<property>/<cluster>/<namespace>` path.
    pub fn parse(s: &str) -> Result<Self, DriftError> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return Err(DriftError::InvalidTopicName(format!(
                "invalid namespace '{s}': expected <property>/<cluster>/<namespace>"
            )));
        }
        Self::new(parts[0], parts[1], parts[2])
    }

    /// Whether the namespace is globally replicated rather than bound to one
    /// cluster.
    pub fn is_global(&self) -> bool {
        self.cluster == GLOBAL_CLUSTER
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.property, self.cluster, self.namespace)
    }
}

/// A fully parsed topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicName {
    pub domain: TopicDomain,
    pub property: String,
    pub cluster: String,
    pub namespace: String,
    pub local: String,
}

impl TopicName {
    /// Parses a fully qualified topic name.
    pub fn parse(s: &str) -> Result<Self, DriftError> {
        let (domain_str, rest) = s.split_once("://").ok_or_else(|| {
            DriftError::InvalidTopicName(format!("'{s}' is missing the domain scheme"))
        })?;
        let domain = domain_str.parse()?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 4 {
            return Err(DriftError::InvalidTopicName(format!(
                "'{s}' must have exactly <property>/<cluster>/<namespace>/<local>"
            )));
        }
        for seg in &parts {
            validate_segment(seg)?;
        }
        Ok(Self {
            domain,
            property: parts[0].to_string(),
            cluster: parts[1].to_string(),
            namespace: parts[2].to_string(),
            local: parts[3].to_string(),
        })
    }

    /// The namespace this topic belongs to.
    pub fn namespace(&self) -> NamespaceName {
        NamespaceName {
            property: self.property.clone(),
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// The `<property>/<cluster>/<namespace>/<local>` path. This is the
    /// canonical hashing input for bundle placement.
    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.property, self.cluster, self.namespace, self.local
        )
    }

    /// The topic for partition `i` of this (base) topic.
    pub fn partition(&self, i: u32) -> TopicName {
        let mut t = self.clone();
        t.local = format!("{}{PARTITION_SUFFIX}{i}", self.local);
        t
    }

    /// The partition index if this is a partition of a partitioned topic.
    pub fn partition_index(&self) -> Option<u32> {
        let idx = self.local.rfind(PARTITION_SUFFIX)?;
        self.local[idx + PARTITION_SUFFIX.len()..].parse().ok()
    }

    /// The base topic with any `-partition-<N>` suffix removed.
    pub fn base(&self) -> TopicName {
        match self.local.rfind(PARTITION_SUFFIX) {
            Some(idx) if self.local[idx + PARTITION_SUFFIX.len()..].parse::<u32>().is_ok() => {
                let mut t = self.clone();
                t.local = self.local[..idx].to_string();
                t
            }
            _ => self.clone(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.cluster == GLOBAL_CLUSTER
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.domain, self.path())
    }
}

impl FromStr for TopicName {
    type Err = DriftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicName::parse(s)
    }
}

fn validate_segment(seg: &str) -> Result<(), DriftError> {
    if seg.is_empty() {
        return Err(DriftError::InvalidTopicName(
            "empty path segment".to_string(),
        ));
    }
    if seg.contains('/') || seg.contains("://") {
        return Err(DriftError::InvalidTopicName(format!(
            "segment '{seg}' contains reserved characters"
        )));
    }
    Ok(())
}
