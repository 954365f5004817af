//! 隐私浏览客户端的网络请求引擎。
//!
//! 给定解析好的资源引用，决定是否抓取、如何抓取：依次经过重定向表、
//! 缓存、暂存、拦截、模式、过滤、域名解析、下载与后处理，最终产出
//! 响应、重定向或分类错误。
//!
//! # 核心特性
//!
//! - **断点续传**：未完成的响应体进入暂存区，重试时按 `range` 头从既有偏移继续。
//! - **带宽监控**：1 Hz 采样的滑动窗口，平均速率跌破阈值即判停滞并强制断开。
//! - **策略管控**：拦截、按内容类别的模式门与过滤器都在建立连接之前生效。
//! - **按引用共享的配置**：同一份 [`Config`] 可被多个请求持有，拦截命中时
//!   压平的模式开关对所有持有方立即可见。
//! - **可插拔协作服务**：缓存、暂存、重定向表、域名解析、拦截、过滤与传输
//!   全部是 trait，宿主可自由替换，内存实现开箱即用。
//!
//! # 架构
//!
//! - **`Request`**: 顶层状态机，按既定次序驱动各阶段并对外广播事件。
//! - **`DownloadManager`**: 资格检查（协议 + 站点模式），构造下载尝试。
//! - **`Download`**: 单次下载尝试，独占传输缓冲、带宽窗口和至多一条连接。
//! - **`Services`**: 注入给请求的协作服务集合。
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use privacy_request::{Config, Outcome, Request, ReqwestTransport, RequestEvent, Services};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let services = Services::in_memory(Arc::new(ReqwestTransport::new()));
//!     let mut request = Request::from_url(
//!         "https://example.com/index.html",
//!         services,
//!         Some(Config::allow_all()),
//!     )
//!     .expect("URL 不合法");
//!
//!     let mut events = request.events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let RequestEvent::Progress { downloaded, total } = event {
//!                 println!("已下载 {downloaded} / {total:?} 字节");
//!             }
//!         }
//!     });
//!
//!     match request.init().await {
//!         Some(Ok(Outcome::Response(response))) => {
//!             let size = response.payload.map(|p| p.len()).unwrap_or(0);
//!             println!("HTTP {}，共 {} 字节", response.status, size);
//!         }
//!         Some(Ok(Outcome::Redirect { location })) => println!("重定向 -> {location}"),
//!         Some(Err(e)) => eprintln!("请求失败: {e}"),
//!         None => {}
//!     }
//! }
//! ```

mod bandwidth;
mod download;
mod manager;
mod reference;
mod request;
mod services;
mod timeline;
mod transport;
mod types;

// --- 公共 API 导出 ---

// 导出顶层的 `Request`，它是使用方的主要入口点。
pub use request::{Halt, Request};
// 重新导出 `reqwest`，允许使用方提供自定义的 `ClientBuilder`。
pub use reqwest;
// 导出公共类型，方便在类型注解和模式匹配中使用。
pub use bandwidth::BandwidthTracker;
pub use download::{Download, TransferBuffer};
pub use manager::DownloadManager;
pub use reference::{Mime, MimeKind, Protocol, Proxy, Reference};
pub use services::{
    AllowAllFilter, Blocker, CacheStore, DomainBlocker, Filter, HostResolver, IdentityOptimizer,
    MemoryCache, MemoryRedirects, MemoryStash, Optimizer, PathFilter, RedirectStore, Services,
    StashStore, StaticHosts, SystemResolver,
};
pub use timeline::{Stage, Timeline};
pub use transport::{Connection, ReqwestTransport, Transport, TransportEvent};
pub use types::{
    Config, Flags, Headers, HostRecord, ModeFlags, Outcome, Partial, RequestCause, RequestError,
    RequestEvent, Response, Result, SharedConfig, TransportError,
};
