use driftmq::core::DriftError;
use driftmq::core::broker::{
    AdmitAll, AllowAllAuthorization, AuthorizationProvider, PolicyAuthorization,
    PublishInterceptor,
};
use driftmq::core::bundle::BundlesDescriptor;
use driftmq::core::metadata::policies::{
    AuthAction, BacklogQuota, BacklogRetentionPolicy, DispatchRate, NamespacePolicies,
    SubscriptionAuthMode,
};
use driftmq::core::topic::TopicName;
use std::collections::BTreeSet;

fn base_policies() -> NamespacePolicies {
    NamespacePolicies::with_bundles(BundlesDescriptor::with_default_bundles(4).unwrap())
}

fn topic() -> TopicName {
    TopicName::parse("persistent://p/c/n/t").unwrap()
}

#[test]
fn test_policy_authorization_follows_role_grants() {
    let mut policies = base_policies();
    policies.auth_policies.insert(
        "app-writer".to_string(),
        BTreeSet::from([AuthAction::Produce, AuthAction::Lookup]),
    );
    policies.auth_policies.insert(
        "app-reader".to_string(),
        BTreeSet::from([AuthAction::Consume, AuthAction::Lookup]),
    );
    let authz = PolicyAuthorization;

    authz
        .authorize("app-writer", AuthAction::Produce, &topic(), &policies)
        .unwrap();
    authz
        .authorize("app-reader", AuthAction::Consume, &topic(), &policies)
        .unwrap();

    // A role without the grant is refused, as is an unknown role.
    let err = authz
        .authorize("app-writer", AuthAction::Consume, &topic(), &policies)
        .unwrap_err();
    assert!(matches!(err, DriftError::Unauthorized(_)));
    let err = authz
        .authorize("stranger", AuthAction::Lookup, &topic(), &policies)
        .unwrap_err();
    assert!(matches!(err, DriftError::Unauthorized(_)));
}

#[test]
fn test_policy_authorization_prefix_subscription_mode() {
    let mut policies = base_policies();
    policies.subscription_auth_mode = SubscriptionAuthMode::Prefix;
    let authz = PolicyAuthorization;

    authz
        .authorize_subscription("app-reader", "app-reader-events", &policies)
        .unwrap();
    let err = authz
        .authorize_subscription("app-reader", "events", &policies)
        .unwrap_err();
    assert!(matches!(err, DriftError::Unauthorized(_)));

    // The default mode accepts any name.
    policies.subscription_auth_mode = SubscriptionAuthMode::None;
    authz
        .authorize_subscription("app-reader", "events", &policies)
        .unwrap();
}

#[test]
fn test_allow_all_authorization_needs_no_grants() {
    let policies = base_policies();
    let authz = AllowAllAuthorization;
    for action in [AuthAction::Produce, AuthAction::Consume, AuthAction::Lookup] {
        authz.authorize("anyone", action, &topic(), &policies).unwrap();
    }
    authz
        .authorize_subscription("anyone", "whatever", &policies)
        .unwrap();
}

/// A publish hook acting on the namespace policies it is handed: refuses
/// payloads beyond the backlog quota and topics with a zeroed dispatch
/// rate.
struct QuotaHook;

impl PublishInterceptor for QuotaHook {
    fn before_publish(
        &self,
        topic: &TopicName,
        policies: &NamespacePolicies,
        payload_size: usize,
    ) -> Result<(), DriftError> {
        if let Some(quota) = policies.backlog_quota
            && quota.limit_bytes >= 0
            && payload_size as i64 > quota.limit_bytes
        {
            return Err(DriftError::PreconditionFailed(format!(
                "payload of {payload_size} bytes exceeds the backlog quota of {topic}"
            )));
        }
        if let Some(rate) = policies.dispatch_rate
            && rate.msgs_per_second == 0
        {
            return Err(DriftError::PreconditionFailed(format!(
                "publishing to {topic} is currently blocked"
            )));
        }
        Ok(())
    }
}

#[test]
fn test_publish_hook_sees_namespace_policies() {
    let mut policies = base_policies();
    let hook = QuotaHook;

    // No quota configured: everything is admitted.
    hook.before_publish(&topic(), &policies, 1 << 20).unwrap();

    policies.backlog_quota = Some(BacklogQuota {
        limit_bytes: 1024,
        policy: BacklogRetentionPolicy::ProducerException,
    });
    hook.before_publish(&topic(), &policies, 512).unwrap();
    let err = hook.before_publish(&topic(), &policies, 4096).unwrap_err();
    assert!(matches!(err, DriftError::PreconditionFailed(_)));

    policies.backlog_quota = None;
    policies.dispatch_rate = Some(DispatchRate {
        msgs_per_second: 0,
        bytes_per_second: 0,
    });
    let err = hook.before_publish(&topic(), &policies, 16).unwrap_err();
    assert!(matches!(err, DriftError::PreconditionFailed(_)));

    // The default hook stays permissive regardless of policy content.
    AdmitAll.before_publish(&topic(), &policies, 1 << 22).unwrap();
}
