use flare_net::FlareError;
use thiserror::Error;

/// TLS 适配层自身的错误。
///
/// 握手与记录层错误在进入连接之后统一折算为 [`FlareError::Protocol`]，
/// 本类型只覆盖构造会话阶段的失败。
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid tls server name `{0}`")]
    InvalidServerName(String),
    #[error("tls engine error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl From<TlsError> for FlareError {
    fn from(err: TlsError) -> Self {
        FlareError::Protocol {
            message: err.to_string(),
        }
    }
}

/// rustls 在握手或解密时报告的错误，折算为协议违规。
pub(crate) fn protocol_violation(err: rustls::Error) -> FlareError {
    FlareError::Protocol {
        message: format!("tls: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_errors_surface_as_protocol_violations() {
        let err: FlareError = TlsError::InvalidServerName("not a name!".into()).into();
        match &err {
            FlareError::Protocol { message } => assert!(message.contains("not a name!")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.category(), flare_net::ErrorCategory::Protocol);

        let engine = protocol_violation(rustls::Error::DecryptError);
        assert!(matches!(engine, FlareError::Protocol { .. }));
    }
}
