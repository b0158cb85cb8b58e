//! # 诊所 Web 模块
//!
//! 基于 axum 的 REST 接口。调用方身份来自网关转发的 `x-user-*` 请求头，
//! 路由守卫按 [`routes`] 中声明的权限放行。

pub mod auth;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod server;
pub mod state;

pub use auth::Caller;
pub use error::{ApiError, ApiResult};
pub use response::ApiResponse;
pub use server::{create_app, WebOptions, WebServer};
pub use state::AppState;
