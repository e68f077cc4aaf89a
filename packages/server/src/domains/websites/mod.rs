pub mod service;
pub mod store;
pub mod website;

pub use service::{CreateWebsite, UpdateWebsite, WebsiteService};
pub use store::{MemoryWebsiteStore, PostgresWebsiteStore, WebsiteStore};
pub use website::{Website, WebsiteConfigHistory, WebsiteStatus};
