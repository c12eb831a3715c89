pub mod api_keys;
pub mod database;
pub mod gateway;
pub mod limits;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod reporter;
pub mod store;
pub mod stripe;
pub mod usage_webhook;
pub mod webhooks;

pub use api_keys::{
    ApiKeyPrincipal, ApiKeyVerifier, AuthServiceKeyVerifier, StaticKeyVerifier,
    SCOPE_BILLING_ADMIN, SCOPE_USAGE_READ, SCOPE_USAGE_WRITE,
};
pub use database::Database;
pub use gateway::{IngestOutcome, IngestUsage, UsageGateway};
pub use limits::{LimitDecision, LimitEvaluation, LimitEvaluator};
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::ThresholdNotifier;
pub use reporter::{
    BillingProvider, BillingReporter, ProviderError, ProviderUsageRecord, ReconcileSummary,
    ReportOutcome, SkipReason,
};
pub use store::MeteringStore;
pub use stripe::StripeClient;
pub use usage_webhook::UsageWebhookClient;
pub use webhooks::{WebhookAck, WebhookProcessor, SIGNATURE_HEADER};
