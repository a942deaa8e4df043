pub mod proxy_credentials;
pub mod upstream_credentials;
pub mod usage_daily;
pub mod usage_monthly;
pub mod usage_records;
pub mod users;

pub use proxy_credentials::Entity as ProxyCredentials;
pub use upstream_credentials::Entity as UpstreamCredentials;
pub use usage_daily::Entity as UsageDaily;
pub use usage_monthly::Entity as UsageMonthly;
pub use usage_records::Entity as UsageRecords;
pub use users::Entity as Users;
