//! Domain models for billing-service.

mod analytics;
mod billing_run;
mod customer;
mod invoice;
mod membership;
mod order;
mod payment;
mod payment_method;
mod provider;
mod subscription;
mod webhook;

pub use analytics::{AnalyticsSnapshot, MetricType};
pub use billing_run::{
    BillResultStatus, BillingRun, BillingRunResult, BillingRunStatus, BillingRunType,
    ListBillingRunsFilter,
};
pub use customer::{CreateCustomer, ProviderCustomer};
pub use invoice::{invoice_number, Invoice, InvoiceStatus};
pub use membership::{
    start_of_day, BillingInterval, CreateMembershipType, MembershipStatus, MembershipType,
    NewMembership, UserMembership,
};
pub use order::{CreateOrder, Order, OrderStatus};
pub use payment::{NewPayment, Payment, PaymentStatus};
pub use payment_method::{CreatePaymentMethod, PaymentMethod};
pub use provider::Provider;
pub use subscription::{
    BillingStatus, CreateSubscription, ListSubscriptionsFilter, Subscription,
    SubscriptionTransition,
};
pub use webhook::WebhookEventRecord;
