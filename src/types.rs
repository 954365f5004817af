//! 定义库中使用的公共类型、错误、事件、站点配置和内部消息。

use crate::reference::{MimeKind, Protocol, Reference};
use bytes::Bytes;
use faststr::FastStr;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// --- 公共类型 ---

/// 库中通用的 `Result` 类型别名，错误类型为 `RequestError`。
pub type Result<T> = std::result::Result<T, RequestError>;

/// HTTP 头集合，键统一为小写。
pub type Headers = HashMap<FastStr, FastStr>;

/// 内部通信信道的容量。
pub(crate) const CHANNEL_CAPACITY: usize = 1024;

/// 请求失败的具体原因，与对外呈现的错误串一一对应。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestCause {
    /// 连接超时且一个字节都没有收到。
    SocketTimeout,
    /// 连接反复中断，重试预算耗尽。
    SocketStability,
    /// 重定向响应缺少 `location` 头。
    HeadersLocation,
}

impl RequestCause {
    /// 错误原因的规范字符串形式。
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCause::SocketTimeout => "socket-timeout",
            RequestCause::SocketStability => "socket-stability",
            RequestCause::HeadersLocation => "headers-location",
        }
    }
}

impl fmt::Display for RequestCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输层错误。
///
/// 具体故障以字符串承载而不是包裹底层错误，保证事件类型可以被克隆
/// 并经广播信道分发。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 引用的协议没有对应的传输实现。
    #[error("没有可用的传输协议: {0}")]
    Unsupported(FastStr),
    /// 建立连接失败。
    #[error("连接建立失败: {0}")]
    Connect(FastStr),
    /// 套接字读写超时。
    #[error("套接字超时")]
    Timeout,
    /// 暂存的部分数据与服务器响应不一致，续传无法继续。
    #[error("暂存数据与响应不一致: {0}")]
    Stash(FastStr),
    /// 其他传输层故障。
    #[error("传输层故障: {0}")]
    Socket(FastStr),
}

/// 定义了库中可能发生的所有公共错误类型。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// 请求被策略拒绝：拦截、模式关闭、过滤或下载资格检查未通过。
    #[error("请求被策略拒绝 (HTTP {code})")]
    Policy {
        /// 等价的 HTTP 状态码，目前恒为 403。
        code: u16,
    },
    /// 站点模式不放行页面载入，提示性错误。
    #[error("站点模式不允许载入该页面")]
    Mode,
    /// 过滤规则不放行页面载入，提示性错误。
    #[error("过滤规则不允许载入该页面")]
    Filter,
    /// 主机解析失败，引用没有任何可用地址。
    #[error("无法解析引用的主机地址")]
    Host,
    /// 下载阶段以不可恢复的方式失败。
    #[error("请求失败: {cause}")]
    Request {
        /// 失败原因。
        cause: RequestCause,
    },
    /// 传输层错误原样上抛。
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// 请求已被外部终止。
    #[error("请求已被终止")]
    Killed,
}

// --- 记录类型 ---

/// 一次完整的响应。
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// HTTP 状态码。
    pub status: u16,
    /// 响应头，键为小写。
    pub headers: Headers,
    /// 响应体。重定向等无体响应为 `None`。
    pub payload: Option<Bytes>,
}

/// 暂存的部分下载数据，断点续传的凭据。
#[derive(Clone, Debug, PartialEq)]
pub struct Partial {
    /// 截至中断时收到的响应头，其中 `content-length` 为完整长度。
    pub headers: Headers,
    /// 已接收的响应体字节。
    pub payload: Bytes,
}

/// 主机服务返回的解析记录。
///
/// 地址以字符串形式给出，可能缺失或非法，使用前逐项校验。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostRecord {
    /// IPv4 地址。
    pub ipv4: Option<FastStr>,
    /// IPv6 地址。
    pub ipv6: Option<FastStr>,
}

/// 请求管线的终态。
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// 得到完整响应。
    Response(Response),
    /// 以重定向收尾，调用方应向新地址发起后续请求。
    Redirect {
        /// 重定向目标。
        location: FastStr,
    },
}

// --- 站点配置 ---

/// 五种内容类别的放行开关。
///
/// 开关存放在原子变量里，持有同一份 [`Config`] 的所有请求都能立即
/// 观察到修改，例如拦截阶段的全量清零。
#[derive(Debug, Default)]
pub struct ModeFlags {
    text: AtomicBool,
    image: AtomicBool,
    audio: AtomicBool,
    video: AtomicBool,
    other: AtomicBool,
}

impl ModeFlags {
    /// 创建一组开关，五个类别使用同一个初始值。
    pub fn uniform(value: bool) -> Self {
        let flags = Self::default();
        for kind in MimeKind::ALL {
            flags.set(kind, value);
        }
        flags
    }

    /// 查询某一类别是否放行。
    pub fn allows(&self, kind: MimeKind) -> bool {
        self.flag(kind).load(Ordering::Relaxed)
    }

    /// 设置某一类别的开关。
    pub fn set(&self, kind: MimeKind, value: bool) {
        self.flag(kind).store(value, Ordering::Relaxed);
    }

    /// 清空全部开关，拦截阶段用它覆盖站点配置。
    pub fn block_all(&self) {
        for kind in MimeKind::ALL {
            self.set(kind, false);
        }
    }

    fn flag(&self, kind: MimeKind) -> &AtomicBool {
        match kind {
            MimeKind::Text => &self.text,
            MimeKind::Image => &self.image,
            MimeKind::Audio => &self.audio,
            MimeKind::Video => &self.video,
            MimeKind::Other => &self.other,
        }
    }
}

/// 站点配置：域名加上五种内容类别的放行模式。
///
/// 同一站点的多个请求持有同一份配置（见 [`SharedConfig`]），任何一方
/// 的修改对全体持有者可见。
#[derive(Debug, Default)]
pub struct Config {
    /// 配置所属的域名，`None` 表示通用配置。
    pub domain: Option<FastStr>,
    /// 内容放行开关。
    pub mode: ModeFlags,
}

/// 按引用共享的站点配置。
pub type SharedConfig = Arc<Config>;

impl Config {
    /// 新建一份域名配置。
    pub fn new(domain: impl Into<FastStr>, mode: ModeFlags) -> SharedConfig {
        Arc::new(Self {
            domain: Some(domain.into()),
            mode,
        })
    }

    /// 默认配置：五个类别全部拒绝。
    pub fn deny_all() -> SharedConfig {
        Arc::new(Self::default())
    }

    /// 放行一切的配置。
    pub fn allow_all() -> SharedConfig {
        Arc::new(Self {
            domain: None,
            mode: ModeFlags::uniform(true),
        })
    }

    /// 为引用挑选生效的配置。
    ///
    /// `stealth:` 协议的内部页面永远全量放行；其余引用使用调用方给定的
    /// 配置，未给定时退回拒绝一切的默认配置。
    pub fn for_reference(reference: &Reference, config: Option<SharedConfig>) -> SharedConfig {
        if reference.protocol == Protocol::Stealth {
            Arc::new(Self {
                domain: reference.domain.clone(),
                mode: ModeFlags::uniform(true),
            })
        } else {
            config.unwrap_or_else(Self::deny_all)
        }
    }
}

/// 请求级别的行为开关。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// 强制刷新：跳过缓存与暂存读取，直接走网络。
    pub refresh: bool,
    /// 页面将交给 webview 渲染的提示，本引擎不消费。
    pub webview: bool,
}

impl Flags {
    /// 按键名设置开关。只认识 `refresh` 和 `webview`，其余键返回 `false`。
    pub fn set(&mut self, key: &str, value: bool) -> bool {
        match key {
            "refresh" => {
                self.refresh = value;
                true
            }
            "webview" => {
                self.webview = value;
                true
            }
            _ => false,
        }
    }
}

// --- 公共事件 ---

/// 面向订阅者的请求事件。
///
/// 通过 [`Request::events`](crate::Request::events) 订阅广播信道接收。
#[derive(Clone, Debug)]
pub enum RequestEvent {
    /// 下载进度更新，每个采样周期至多一次。
    Progress {
        /// 已累计的字节数，包含续传的种子数据。
        downloaded: u64,
        /// 已知的完整长度。
        total: Option<u64>,
    },
    /// 请求以重定向收尾。
    Redirect {
        /// 重定向目标。
        location: FastStr,
        /// `true` 表示命中已知的重定向表，本次没有发起网络请求。
        known: bool,
    },
    /// 请求以响应收尾。
    Response(Response),
    /// 请求以错误收尾。
    Error(RequestError),
}

// --- 内部下载事件 ---

/// 单次下载尝试发往请求状态机的事件。
#[derive(Debug)]
pub(crate) enum DownloadEvent {
    /// 采样周期的进度汇报，附带可暂存的部分数据快照。
    Progress {
        partial: Partial,
        downloaded: u64,
        total: Option<u64>,
    },
    /// 连接超时或中断。`None` 表示没有收到任何数据。
    Timeout(Option<Partial>),
    /// 服务器返回重定向。
    Redirect(Response),
    /// 下载完整结束。
    Response(Response),
    /// 传输失败。
    Failed(TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_accept_known_keys_only() {
        let mut flags = Flags::default();
        assert!(flags.set("refresh", true));
        assert!(flags.set("webview", true));
        assert!(!flags.set("proxy", true));
        assert!(flags.refresh);
        assert!(flags.webview);
    }

    #[test]
    fn test_block_all_is_visible_to_every_holder() {
        let config = Config::allow_all();
        let other = config.clone();
        config.mode.block_all();
        for kind in MimeKind::ALL {
            assert!(!other.mode.allows(kind));
        }
    }

    #[test]
    fn test_stealth_references_get_full_permissions() {
        let reference = Reference::parse("stealth:welcome").unwrap();
        let config = Config::for_reference(&reference, Some(Config::deny_all()));
        for kind in MimeKind::ALL {
            assert!(config.mode.allows(kind));
        }
    }

    #[test]
    fn test_cause_strings_are_stable() {
        assert_eq!(RequestCause::SocketTimeout.as_str(), "socket-timeout");
        assert_eq!(RequestCause::SocketStability.as_str(), "socket-stability");
        assert_eq!(RequestCause::HeadersLocation.as_str(), "headers-location");
    }
}
