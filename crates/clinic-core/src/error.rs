//! 错误定义模块

use thiserror::Error;

/// 诊所系统统一错误类型
#[derive(Error, Debug)]
pub enum ClinicError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 校验失败，消息原样返回给客户端
    #[error("{0}")]
    Validation(String),

    /// 站点/角色/归属校验失败
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    /// 乐观锁版本冲突
    #[error("{0}")]
    Conflict(String),

    #[error("Transición de estado no permitida: de '{from}' a '{to}'")]
    InvalidTransition { from: String, to: String },

    /// 状态转换缺少必填原因
    #[error("{0}")]
    MissingReason(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl ClinicError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// 是否为客户端错误（4xx），其余错误只记录在服务端日志中
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            ClinicError::Config(_)
                | ClinicError::Database(_)
                | ClinicError::Serialization(_)
                | ClinicError::Internal(_)
        )
    }
}

/// 诊所系统统一结果类型
pub type Result<T> = std::result::Result<T, ClinicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_names_both_states() {
        let err = ClinicError::invalid_transition("aceptado", "pendiente");
        let msg = err.to_string();
        assert!(msg.contains("aceptado"));
        assert!(msg.contains("pendiente"));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_internal_errors_are_not_client_errors() {
        assert!(!ClinicError::Database("pool closed".into()).is_client_error());
        assert!(!ClinicError::Internal("boom".into()).is_client_error());
        assert!(ClinicError::validation("x").is_client_error());
    }
}
