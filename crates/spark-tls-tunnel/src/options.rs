use serde::Deserialize;
use thiserror::Error;

/// 隧道可调参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 密钥、信任链与协议列表由外部协作者解析为现成的引擎配置；本结构只承载隧道自身的调参：
///   四块缓冲的放大系数，以及客户端是否执行证书有效期后置校验；
/// - 支持从 TOML 片段加载，使宿主进程可以把隧道参数与其它配置放在同一文件中。
///
/// ## 契约（What）
/// - `receive_buffer_factor`：接收侧（`net_recv`/`app_recv`）相对引擎尺寸的倍数，默认 4；
/// - `send_buffer_factor`：发送侧（`app_send`/`net_send`）倍数，默认 2；
/// - `validate_peer_certificates`：客户端握手成功后是否校验对端证书有效期，默认开启；
/// - 两个系数必须大于 0，见 [`TunnelOptions::validate`]。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelOptions {
    pub receive_buffer_factor: usize,
    pub send_buffer_factor: usize,
    pub validate_peer_certificates: bool,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            receive_buffer_factor: 4,
            send_buffer_factor: 2,
            validate_peer_certificates: true,
        }
    }
}

impl TunnelOptions {
    /// 解析 TOML 片段；缺省字段取默认值，未知字段报错。
    pub fn from_toml_str(source: &str) -> Result<Self, OptionsError> {
        let options: TunnelOptions = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    /// 检查参数取值范围。
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.receive_buffer_factor == 0 {
            return Err(OptionsError::ZeroFactor {
                field: "receive_buffer_factor",
            });
        }
        if self.send_buffer_factor == 0 {
            return Err(OptionsError::ZeroFactor {
                field: "send_buffer_factor",
            });
        }
        Ok(())
    }
}

/// 选项加载失败。
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid tunnel options: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("`{field}` must be greater than zero")]
    ZeroFactor { field: &'static str },
}
