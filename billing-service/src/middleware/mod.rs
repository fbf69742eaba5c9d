pub mod tenant;

pub use tenant::{TenantContext, TENANT_HEADER};
