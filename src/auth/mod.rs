// 认证模块

pub mod provider;
pub mod token_manager;
pub mod types;

pub use provider::{AuthProvider, OAuthRefreshProvider};
pub use token_manager::TokenManager;
pub use types::{AccessToken, Identity, TokenCache};
