use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;

use crate::{
    certificate::CertificateValidator,
    engine::TlsEngine,
    error::TunnelError,
    handshake::HandshakePlan,
    options::TunnelOptions,
    rustls_engine::RustlsEngine,
};

/// 为隧道创建引擎并给出对应握手计划的协作者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 密钥、信任链、协议版本与密码套件的解析不属于隧道职责；工厂把这些
///   “已就绪的配置”折叠成一个引擎实例，隧道只需调用一次 [`EngineFactory::create_engine`]；
/// - 握手计划随角色变化（客户端追加证书校验），由工厂一并决定。
///
/// ## 契约（What）
/// - `create_engine` 每次返回一个全新的会话；
/// - `options` 决定隧道四块缓冲的放大系数。
pub trait EngineFactory {
    type Engine: TlsEngine;

    fn create_engine(&self) -> Result<Self::Engine, TunnelError>;

    fn handshake_plan(&self) -> HandshakePlan;

    fn options(&self) -> &TunnelOptions;
}

#[derive(Clone, Debug)]
enum Side {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

/// 基于 rustls 配置的引擎工厂。
#[derive(Clone, Debug)]
pub struct RustlsEngineFactory {
    side: Side,
    options: TunnelOptions,
    validator: CertificateValidator,
}

impl RustlsEngineFactory {
    /// 客户端工厂：`server_name` 用于 SNI 与主机名校验。
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self::from_side(Side::Client {
            config,
            server_name,
        })
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self::from_side(Side::Server { config })
    }

    fn from_side(side: Side) -> Self {
        Self {
            side,
            options: TunnelOptions::default(),
            validator: CertificateValidator::new(),
        }
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }

    /// 替换客户端握手后使用的证书校验器，例如固定校验时刻。
    pub fn with_certificate_validator(mut self, validator: CertificateValidator) -> Self {
        self.validator = validator;
        self
    }
}

impl EngineFactory for RustlsEngineFactory {
    type Engine = RustlsEngine;

    fn create_engine(&self) -> Result<RustlsEngine, TunnelError> {
        match &self.side {
            Side::Client {
                config,
                server_name,
            } => RustlsEngine::client(Arc::clone(config), server_name.clone()),
            Side::Server { config } => RustlsEngine::server(Arc::clone(config)),
        }
    }

    fn handshake_plan(&self) -> HandshakePlan {
        match self.side {
            Side::Client { .. } if self.options.validate_peer_certificates => {
                HandshakePlan::negotiate_then_validate(self.validator.clone())
            }
            _ => HandshakePlan::negotiate(),
        }
    }

    fn options(&self) -> &TunnelOptions {
        &self.options
    }
}
