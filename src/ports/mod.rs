pub mod auth_strategy;
pub mod data_provider;
pub mod http_server;
pub mod view_provider;

pub use auth_strategy::{AuthResult, AuthStrategy};
pub use data_provider::DataProvider;
pub use http_server::HttpServer;
pub use view_provider::ViewProvider;
