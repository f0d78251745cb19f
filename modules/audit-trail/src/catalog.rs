//! # Event catalog
//!
//! Every topic the service audits, as data. The generic
//! [`AuditEventHandler`](crate::handlers::AuditEventHandler) reads its row to
//! decide the action verb, where to find the resource and acting user in the
//! payload, and which severity and tags to attach.

use serde::Serialize;

use crate::models::EventAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Per-topic audit mapping
#[derive(Debug, Clone, Copy)]
pub struct EventMapping {
    pub topic: &'static str,
    pub action: EventAction,
    pub resource_type: &'static str,
    /// `data` keys tried in order for the resource id
    pub resource_id_keys: &'static [&'static str],
    /// `data` keys tried in order for the acting user
    pub user_id_keys: &'static [&'static str],
    pub severity: Severity,
    pub tags: &'static [&'static str],
}

const fn row(
    topic: &'static str,
    action: EventAction,
    resource_type: &'static str,
    resource_id_keys: &'static [&'static str],
    user_id_keys: &'static [&'static str],
    severity: Severity,
    tags: &'static [&'static str],
) -> EventMapping {
    EventMapping {
        topic,
        action,
        resource_type,
        resource_id_keys,
        user_id_keys,
        severity,
        tags,
    }
}

use EventAction::{Access, Authenticate, Create, Delete, Process, Update};
use Severity::{Critical, High, Low, Medium};

const USER_IDS: &[&str] = &["userId", "user_id", "id"];
const USER_ACTOR: &[&str] = &["userId", "user_id"];
const SESSION_IDS: &[&str] = &["sessionId", "session_id"];
const ORDER_IDS: &[&str] = &["orderId", "order_id", "id"];
const CUSTOMER_ACTOR: &[&str] = &["customerId", "customer_id", "userId", "user_id"];
const PAYMENT_IDS: &[&str] = &["paymentId", "payment_id", "transactionId", "id"];
const PRODUCT_IDS: &[&str] = &["productId", "product_id", "sku", "id"];
const EDITOR_ACTOR: &[&str] = &["updatedBy", "createdBy", "deletedBy", "userId", "user_id"];
const INVENTORY_IDS: &[&str] = &["inventoryId", "productId", "sku", "id"];
const INVENTORY_ACTOR: &[&str] = &["adjustedBy", "userId", "user_id"];
const NOTIFICATION_IDS: &[&str] = &["notificationId", "notification_id", "id"];
const RECIPIENT_ACTOR: &[&str] = &["recipientId", "userId", "user_id"];
const FILE_IDS: &[&str] = &["fileId", "file_id", "id"];
const FILE_ACTOR: &[&str] = &["uploadedBy", "downloadedBy", "deletedBy", "userId", "user_id"];
const ORG_IDS: &[&str] = &["organizationId", "organization_id", "orgId", "id"];
const ORG_ACTOR: &[&str] = &["actorId", "performedBy", "userId", "user_id"];
const SUBSCRIPTION_IDS: &[&str] = &["subscriptionId", "subscription_id", "id"];
const SETTING_IDS: &[&str] = &["settingKey", "key", "id"];

const IDENTITY: &[&str] = &["identity"];
const IDENTITY_SECURITY: &[&str] = &["identity", "security"];
const AUTH: &[&str] = &["authentication", "security"];
const COMMERCE: &[&str] = &["commerce", "order"];
const FINANCIAL: &[&str] = &["financial", "payment"];
const FINANCIAL_ALERT: &[&str] = &["financial", "payment", "alert"];
const CATALOG: &[&str] = &["catalog"];
const INVENTORY: &[&str] = &["inventory"];
const MESSAGING: &[&str] = &["notification"];
const STORAGE: &[&str] = &["storage"];
const STORAGE_SECURITY: &[&str] = &["storage", "security"];
const TENANCY: &[&str] = &["tenancy"];
const TENANCY_SECURITY: &[&str] = &["tenancy", "security"];
const BILLING: &[&str] = &["billing", "subscription"];
const CONFIGURATION: &[&str] = &["configuration"];

/// All audited topics
pub static EVENT_CATALOG: &[EventMapping] = &[
    // user
    row("user.created", Create, "user", USER_IDS, USER_ACTOR, Medium, IDENTITY),
    row("user.updated", Update, "user", USER_IDS, USER_ACTOR, Low, IDENTITY),
    row("user.deleted", Delete, "user", USER_IDS, USER_ACTOR, High, IDENTITY_SECURITY),
    row("user.password_changed", Update, "user", USER_IDS, USER_ACTOR, High, IDENTITY_SECURITY),
    row("user.role_changed", Update, "user", USER_IDS, USER_ACTOR, High, IDENTITY_SECURITY),
    row("user.suspended", Update, "user", USER_IDS, USER_ACTOR, High, IDENTITY_SECURITY),
    row("user.activated", Update, "user", USER_IDS, USER_ACTOR, Medium, IDENTITY),
    row("user.profile_viewed", Access, "user", USER_IDS, USER_ACTOR, Low, IDENTITY),
    // auth
    row("auth.login", Authenticate, "session", SESSION_IDS, USER_ACTOR, Low, AUTH),
    row("auth.logout", Authenticate, "session", SESSION_IDS, USER_ACTOR, Low, AUTH),
    row("auth.login_failed", Authenticate, "session", SESSION_IDS, USER_ACTOR, High, AUTH),
    row("auth.token_refreshed", Authenticate, "session", SESSION_IDS, USER_ACTOR, Low, AUTH),
    row("auth.mfa_enabled", Update, "user", USER_IDS, USER_ACTOR, High, AUTH),
    row("auth.password_reset_requested", Process, "user", USER_IDS, USER_ACTOR, Medium, AUTH),
    // order
    row("order.created", Create, "order", ORDER_IDS, CUSTOMER_ACTOR, Medium, COMMERCE),
    row("order.updated", Update, "order", ORDER_IDS, CUSTOMER_ACTOR, Low, COMMERCE),
    row("order.cancelled", Update, "order", ORDER_IDS, CUSTOMER_ACTOR, Medium, COMMERCE),
    row("order.completed", Process, "order", ORDER_IDS, CUSTOMER_ACTOR, Medium, COMMERCE),
    row("order.shipped", Process, "order", ORDER_IDS, CUSTOMER_ACTOR, Low, COMMERCE),
    row("order.refunded", Process, "order", ORDER_IDS, CUSTOMER_ACTOR, High, COMMERCE),
    // payment
    row("payment.initiated", Create, "payment", PAYMENT_IDS, CUSTOMER_ACTOR, Medium, FINANCIAL),
    row("payment.completed", Process, "payment", PAYMENT_IDS, CUSTOMER_ACTOR, Medium, FINANCIAL),
    row("payment.failed", Process, "payment", PAYMENT_IDS, CUSTOMER_ACTOR, High, FINANCIAL_ALERT),
    row("payment.refunded", Process, "payment", PAYMENT_IDS, CUSTOMER_ACTOR, High, FINANCIAL),
    row("payment.chargeback", Process, "payment", PAYMENT_IDS, CUSTOMER_ACTOR, Critical, FINANCIAL_ALERT),
    // product
    row("product.created", Create, "product", PRODUCT_IDS, EDITOR_ACTOR, Low, CATALOG),
    row("product.updated", Update, "product", PRODUCT_IDS, EDITOR_ACTOR, Low, CATALOG),
    row("product.deleted", Delete, "product", PRODUCT_IDS, EDITOR_ACTOR, Medium, CATALOG),
    row("product.price_changed", Update, "product", PRODUCT_IDS, EDITOR_ACTOR, Medium, CATALOG),
    // inventory
    row("inventory.adjusted", Update, "inventory", INVENTORY_IDS, INVENTORY_ACTOR, Medium, INVENTORY),
    row("inventory.reserved", Update, "inventory", INVENTORY_IDS, INVENTORY_ACTOR, Low, INVENTORY),
    row("inventory.released", Update, "inventory", INVENTORY_IDS, INVENTORY_ACTOR, Low, INVENTORY),
    row("inventory.low_stock", Process, "inventory", INVENTORY_IDS, INVENTORY_ACTOR, Medium, INVENTORY),
    // notification
    row("notification.sent", Process, "notification", NOTIFICATION_IDS, RECIPIENT_ACTOR, Low, MESSAGING),
    row("notification.failed", Process, "notification", NOTIFICATION_IDS, RECIPIENT_ACTOR, Medium, MESSAGING),
    // file
    row("file.uploaded", Create, "file", FILE_IDS, FILE_ACTOR, Low, STORAGE),
    row("file.downloaded", Access, "file", FILE_IDS, FILE_ACTOR, Low, STORAGE),
    row("file.deleted", Delete, "file", FILE_IDS, FILE_ACTOR, Medium, STORAGE_SECURITY),
    // organization
    row("organization.created", Create, "organization", ORG_IDS, ORG_ACTOR, Medium, TENANCY),
    row("organization.updated", Update, "organization", ORG_IDS, ORG_ACTOR, Low, TENANCY),
    row("organization.member_added", Update, "organization", ORG_IDS, ORG_ACTOR, Medium, TENANCY_SECURITY),
    row("organization.member_removed", Update, "organization", ORG_IDS, ORG_ACTOR, High, TENANCY_SECURITY),
    // subscription
    row("subscription.created", Create, "subscription", SUBSCRIPTION_IDS, CUSTOMER_ACTOR, Medium, BILLING),
    row("subscription.renewed", Process, "subscription", SUBSCRIPTION_IDS, CUSTOMER_ACTOR, Low, BILLING),
    row("subscription.cancelled", Update, "subscription", SUBSCRIPTION_IDS, CUSTOMER_ACTOR, Medium, BILLING),
    // settings
    row("settings.updated", Update, "settings", SETTING_IDS, EDITOR_ACTOR, Medium, CONFIGURATION),
];

/// Catalog row for an exact topic
pub fn lookup(topic: &str) -> Option<&'static EventMapping> {
    EVENT_CATALOG.iter().find(|m| m.topic == topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_covers_forty_plus_topics() {
        assert!(EVENT_CATALOG.len() >= 40);
    }

    #[test]
    fn test_topics_are_unique() {
        let topics: HashSet<_> = EVENT_CATALOG.iter().map(|m| m.topic).collect();
        assert_eq!(topics.len(), EVENT_CATALOG.len());
    }

    #[test]
    fn test_rows_are_well_formed() {
        for mapping in EVENT_CATALOG {
            let domain = mapping.topic.split('.').next().unwrap();
            assert!(mapping.topic.contains('.'), "{}", mapping.topic);
            assert!(!domain.is_empty(), "{}", mapping.topic);
            assert!(!mapping.resource_type.is_empty(), "{}", mapping.topic);
            assert!(!mapping.resource_id_keys.is_empty(), "{}", mapping.topic);
            assert!(!mapping.user_id_keys.is_empty(), "{}", mapping.topic);
            assert!(!mapping.tags.is_empty(), "{}", mapping.topic);
        }
    }

    #[test]
    fn test_lookup_is_exact() {
        let mapping = lookup("user.created").unwrap();
        assert_eq!(mapping.action, EventAction::Create);
        assert_eq!(mapping.resource_type, "user");

        assert!(lookup("user").is_none());
        assert!(lookup("user.created.v2").is_none());
    }
}
