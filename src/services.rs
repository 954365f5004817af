//! services.rs - 请求管线的可插拔协作服务。
//!
//! 管线本身只依赖这里的 trait，宿主按需注入实现：浏览器接数据库与
//! 规则引擎，测试接内存实现。

use crate::reference::Reference;
use crate::transport::Transport;
use crate::types::{HostRecord, Partial, Response};
use async_trait::async_trait;
use faststr::FastStr;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

// --- 服务契约 ---

/// 已知重定向的存取。
#[async_trait]
pub trait RedirectStore: Send + Sync {
    /// 查询该引用是否已记录过重定向目标。
    async fn read(&self, reference: &Reference) -> Option<FastStr>;
    /// 记录一次服务器重定向，返回是否写入成功。
    async fn save(&self, reference: &Reference, location: &str) -> bool;
}

/// 完整响应的缓存。
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn read(&self, reference: &Reference) -> Option<Response>;
    async fn save(&self, reference: &Reference, response: &Response) -> bool;
}

/// 未完成下载的暂存区。
#[async_trait]
pub trait StashStore: Send + Sync {
    async fn read(&self, reference: &Reference) -> Option<Partial>;
    async fn save(&self, reference: &Reference, partial: &Partial) -> bool;
    /// 清除暂存，返回是否确有记录被清除。
    async fn remove(&self, reference: &Reference) -> bool;
}

/// 域名到地址的解析。
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn read(&self, domain: &str, subdomain: Option<&str>) -> Option<HostRecord>;
}

/// 拦截判定，返回 `true` 表示该引用应被拦截。
#[async_trait]
pub trait Blocker: Send + Sync {
    async fn check(&self, reference: &Reference) -> bool;
}

/// 过滤判定，返回 `true` 表示放行。
#[async_trait]
pub trait Filter: Send + Sync {
    async fn check(&self, reference: &Reference) -> bool;
}

/// 响应后处理。
#[async_trait]
pub trait Optimizer: Send + Sync {
    async fn optimize(&self, reference: &Reference, response: Response) -> Response;
}

// --- 服务集合 ---

/// 一组注入给请求的协作服务。
///
/// 克隆只复制 `Arc` 句柄，多个请求共享同一批服务。
#[derive(Clone)]
pub struct Services {
    pub redirect: Arc<dyn RedirectStore>,
    pub cache: Arc<dyn CacheStore>,
    pub stash: Arc<dyn StashStore>,
    pub host: Arc<dyn HostResolver>,
    pub blocker: Arc<dyn Blocker>,
    pub filter: Arc<dyn Filter>,
    pub optimizer: Option<Arc<dyn Optimizer>>,
    pub transport: Arc<dyn Transport>,
}

impl Services {
    /// 以内存实现建立全套服务，常用于测试与演示。
    pub fn in_memory(transport: Arc<dyn Transport>) -> Self {
        Self {
            redirect: Arc::new(MemoryRedirects::default()),
            cache: Arc::new(MemoryCache::default()),
            stash: Arc::new(MemoryStash::default()),
            host: Arc::new(StaticHosts::default()),
            blocker: Arc::new(DomainBlocker::default()),
            filter: Arc::new(AllowAllFilter),
            optimizer: None,
            transport,
        }
    }

    pub fn with_redirect(mut self, redirect: Arc<dyn RedirectStore>) -> Self {
        self.redirect = redirect;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_stash(mut self, stash: Arc<dyn StashStore>) -> Self {
        self.stash = stash;
        self
    }

    pub fn with_host(mut self, host: Arc<dyn HostResolver>) -> Self {
        self.host = host;
        self
    }

    pub fn with_blocker(mut self, blocker: Arc<dyn Blocker>) -> Self {
        self.blocker = blocker;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }
}

// --- 内存实现 ---

/// 以 URL 为键的内存重定向表。
#[derive(Default)]
pub struct MemoryRedirects {
    entries: Mutex<HashMap<FastStr, FastStr>>,
}

impl MemoryRedirects {
    /// 预置一条重定向记录。
    pub async fn insert(&self, url: impl Into<FastStr>, location: impl Into<FastStr>) {
        self.entries.lock().await.insert(url.into(), location.into());
    }

    /// 读取一条记录，测试用。
    pub async fn get(&self, url: &str) -> Option<FastStr> {
        self.entries.lock().await.get(url).cloned()
    }
}

#[async_trait]
impl RedirectStore for MemoryRedirects {
    async fn read(&self, reference: &Reference) -> Option<FastStr> {
        self.entries.lock().await.get(reference.url.as_str()).cloned()
    }

    async fn save(&self, reference: &Reference, location: &str) -> bool {
        debug!("[Services] 记录重定向 {} -> {}", reference.url, location);
        self.entries
            .lock()
            .await
            .insert(reference.url.clone(), FastStr::new(location));
        true
    }
}

/// 以 URL 为键的内存响应缓存。
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<FastStr, Response>>,
}

impl MemoryCache {
    pub async fn insert(&self, url: impl Into<FastStr>, response: Response) {
        self.entries.lock().await.insert(url.into(), response);
    }

    pub async fn get(&self, url: &str) -> Option<Response> {
        self.entries.lock().await.get(url).cloned()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn read(&self, reference: &Reference) -> Option<Response> {
        self.entries.lock().await.get(reference.url.as_str()).cloned()
    }

    async fn save(&self, reference: &Reference, response: &Response) -> bool {
        debug!("[Services] 缓存响应 {} ({})", reference.url, response.status);
        self.entries
            .lock()
            .await
            .insert(reference.url.clone(), response.clone());
        true
    }
}

/// 以 URL 为键的内存暂存区。
#[derive(Default)]
pub struct MemoryStash {
    entries: Mutex<HashMap<FastStr, Partial>>,
}

impl MemoryStash {
    pub async fn insert(&self, url: impl Into<FastStr>, partial: Partial) {
        self.entries.lock().await.insert(url.into(), partial);
    }

    /// 是否仍有该 URL 的暂存，测试用。
    pub async fn contains(&self, url: &str) -> bool {
        self.entries.lock().await.contains_key(url)
    }
}

#[async_trait]
impl StashStore for MemoryStash {
    async fn read(&self, reference: &Reference) -> Option<Partial> {
        self.entries.lock().await.get(reference.url.as_str()).cloned()
    }

    async fn save(&self, reference: &Reference, partial: &Partial) -> bool {
        debug!(
            "[Services] 暂存 {} 字节: {}",
            partial.payload.len(),
            reference.url
        );
        self.entries
            .lock()
            .await
            .insert(reference.url.clone(), partial.clone());
        true
    }

    async fn remove(&self, reference: &Reference) -> bool {
        self.entries
            .lock()
            .await
            .remove(reference.url.as_str())
            .is_some()
    }
}

/// 静态域名表，按注册域返回预置地址。
#[derive(Default)]
pub struct StaticHosts {
    entries: Mutex<HashMap<FastStr, HostRecord>>,
}

impl StaticHosts {
    pub async fn insert(&self, domain: impl Into<FastStr>, record: HostRecord) {
        self.entries.lock().await.insert(domain.into(), record);
    }
}

#[async_trait]
impl HostResolver for StaticHosts {
    async fn read(&self, domain: &str, _subdomain: Option<&str>) -> Option<HostRecord> {
        self.entries.lock().await.get(domain).cloned()
    }
}

/// 走系统解析器的域名解析。
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn read(&self, domain: &str, subdomain: Option<&str>) -> Option<HostRecord> {
        let name = match subdomain {
            Some(subdomain) => format!("{subdomain}.{domain}"),
            None => domain.to_owned(),
        };
        let addrs = tokio::net::lookup_host((name.as_str(), 0)).await.ok()?;

        let mut record = HostRecord::default();
        for addr in addrs {
            match addr.ip() {
                std::net::IpAddr::V4(v4) if record.ipv4.is_none() => {
                    record.ipv4 = Some(FastStr::new(v4.to_string()));
                }
                std::net::IpAddr::V6(v6) if record.ipv6.is_none() => {
                    record.ipv6 = Some(FastStr::new(v6.to_string()));
                }
                _ => {}
            }
        }
        if record.ipv4.is_none() && record.ipv6.is_none() {
            return None;
        }
        Some(record)
    }
}

/// 按域名匹配的拦截器，命中规则域或其子域即拦截。
#[derive(Default)]
pub struct DomainBlocker {
    rules: Mutex<Vec<FastStr>>,
}

impl DomainBlocker {
    /// 追加一条拦截规则。
    pub async fn block(&self, domain: impl Into<FastStr>) {
        self.rules.lock().await.push(domain.into());
    }
}

#[async_trait]
impl Blocker for DomainBlocker {
    async fn check(&self, reference: &Reference) -> bool {
        let Some(domain) = &reference.domain else {
            return false;
        };
        let full = match &reference.subdomain {
            Some(subdomain) => format!("{subdomain}.{domain}"),
            None => domain.to_string(),
        };
        self.rules
            .lock()
            .await
            .iter()
            .any(|rule| full == rule.as_str() || full.ends_with(&format!(".{rule}")))
    }
}

/// 放行一切的过滤器。
pub struct AllowAllFilter;

#[async_trait]
impl Filter for AllowAllFilter {
    async fn check(&self, _reference: &Reference) -> bool {
        true
    }
}

/// 按路径前缀拒绝的过滤器。
pub struct PathFilter {
    denied_prefixes: Vec<FastStr>,
}

impl PathFilter {
    pub fn new(denied_prefixes: Vec<FastStr>) -> Self {
        Self { denied_prefixes }
    }
}

#[async_trait]
impl Filter for PathFilter {
    async fn check(&self, reference: &Reference) -> bool {
        !self
            .denied_prefixes
            .iter()
            .any(|prefix| reference.path.starts_with(prefix.as_str()))
    }
}

/// 透传响应头和响应体的空后处理器，占位用。
pub struct IdentityOptimizer;

#[async_trait]
impl Optimizer for IdentityOptimizer {
    async fn optimize(&self, _reference: &Reference, response: Response) -> Response {
        response
    }
}
