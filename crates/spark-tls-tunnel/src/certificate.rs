use std::time::{SystemTime, UNIX_EPOCH};

use rustls_pki_types::CertificateDer;
use tracing::warn;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::TunnelError;

/// 客户端握手完成后的证书有效期校验器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 在引擎自身的链校验之外，额外确认对端链上每张证书都处于 not-before/not-after 窗口内；
///   即使引擎配置了宽松的信任策略，过期证书也不会悄悄进入稳态传输；
///
/// ## 契约（What）
/// - 链缺失或为空：[`TunnelError::MissingCertificate`]；
/// - 任一证书过期：[`TunnelError::CertificateExpired`]，携带其在链中的下标与主题；
/// - 任一证书尚未生效：[`TunnelError::CertificateNotYetValid`]；
/// - 证书无法解析：[`TunnelError::CertificateParse`]；
/// - 边界时刻（恰好等于 not-before 或 not-after）视为有效。
///
/// ## 风险与权衡（Trade-offs）
/// - 默认读取系统时钟；测试或离线复核可用 [`CertificateValidator::at_unix_time`] 固定时刻。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CertificateValidator {
    fixed_unix_time: Option<i64>,
}

impl CertificateValidator {
    /// 使用系统时钟的校验器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 固定在给定 Unix 时间（秒）执行校验。
    pub fn at_unix_time(seconds: i64) -> Self {
        Self {
            fixed_unix_time: Some(seconds),
        }
    }

    /// 校验对端证书链。
    pub fn validate(&self, chain: Option<&[CertificateDer<'_>]>) -> Result<(), TunnelError> {
        let now = self.fixed_unix_time.unwrap_or_else(unix_now);
        let result = check_chain(chain, now);
        if let Err(err) = &result {
            warn!(error = %err, now, "peer certificate rejected");
        }
        result
    }
}

fn check_chain(chain: Option<&[CertificateDer<'_>]>, now: i64) -> Result<(), TunnelError> {
    let chain = match chain {
        Some(chain) if !chain.is_empty() => chain,
        _ => return Err(TunnelError::MissingCertificate),
    };

    for (index, der) in chain.iter().enumerate() {
        let (_, certificate) =
            X509Certificate::from_der(der.as_ref()).map_err(|err| TunnelError::CertificateParse {
                index,
                detail: err.to_string(),
            })?;
        let validity = certificate.validity();
        let not_before = validity.not_before.timestamp();
        let not_after = validity.not_after.timestamp();

        if now > not_after {
            return Err(TunnelError::CertificateExpired {
                index,
                subject: certificate.subject().to_string(),
                not_after,
            });
        }
        if now < not_before {
            return Err(TunnelError::CertificateNotYetValid {
                index,
                subject: certificate.subject().to_string(),
                not_before,
            });
        }
    }
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
