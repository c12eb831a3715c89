//! Domain models for metering-service.

mod limit_event;
mod notification;
mod subscription;
mod tier;
mod usage;
mod webhook_event;

pub use limit_event::{LimitEventType, NewLimitEvent, UsageLimitEvent};
pub use notification::{EmailNotification, NewNotification, NotificationType};
pub use subscription::{MeteringContext, Subscription, SubscriptionStateUpdate, SubscriptionStatus};
pub use tier::{LimitAction, Product, Tier, DEFAULT_WARNING_THRESHOLDS};
pub use usage::{ListUsageFilter, NewUsageRecord, UsageRecord};
pub use webhook_event::{ListWebhookEventsFilter, WebhookEvent, WebhookEventStatus, WebhookInsert};
