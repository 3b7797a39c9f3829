// src/core/metadata/paths.rs

//! The persisted metadata layout. Every component addresses the store
//! through these helpers so the hierarchy lives in exactly one place.
//!
//! ```text
//! /policies/<property>/<cluster>/<namespace>        namespace policies
//! /local-policies/<property>/<cluster>/<namespace>  cluster-local overrides
//! /clusters/<clusterName>                           cluster descriptor
//! /loadbalance/brokers/<server-address>             ephemeral load report
//! /namespace/<property>/<cluster>/<namespace>/<bundle>  ephemeral ownership claim
//! /admin/partitioned-topics/<domain>/<path>         partitioned-topic metadata
//! /admin/topics/<domain>/<path>                     topic existence markers
//! ```

use crate::core::bundle::BundleRange;
use crate::core::topic::{NamespaceName, TopicDomain, TopicName};

pub const LOADBALANCE_BROKERS_PREFIX: &str = "/loadbalance/brokers";

pub fn policies_path(ns: &NamespaceName) -> String {
    format!("/policies/{ns}")
}

pub fn local_policies_path(ns: &NamespaceName) -> String {
    format!("/local-policies/{ns}")
}

pub fn cluster_path(cluster: &str) -> String {
    format!("/clusters/{cluster}")
}

pub fn load_report_path(broker_address: &str) -> String {
    format!("{LOADBALANCE_BROKERS_PREFIX}/{broker_address}")
}

pub fn ownership_path(ns: &NamespaceName, bundle: &BundleRange) -> String {
    format!("/namespace/{ns}/{bundle}")
}

pub fn ownership_prefix(ns: &NamespaceName) -> String {
    format!("/namespace/{ns}/")
}

pub fn partitioned_topic_path(topic: &TopicName) -> String {
    format!("/admin/partitioned-topics/{}/{}", topic.domain, topic.path())
}

pub fn topic_path(topic: &TopicName) -> String {
    format!("/admin/topics/{}/{}", topic.domain, topic.path())
}

pub fn topics_prefix(domain: TopicDomain, ns: &NamespaceName) -> String {
    format!("/admin/topics/{domain}/{ns}/")
}
