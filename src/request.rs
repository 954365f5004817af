//! request.rs - 请求状态机：按既定次序驱动各阶段，产出响应或分类错误。

use crate::bandwidth::BandwidthTracker;
use crate::manager::DownloadManager;
use crate::reference::Reference;
use crate::services::Services;
use crate::timeline::{Stage, Timeline};
use crate::types::{
    Config, DownloadEvent, Flags, Outcome, Partial, RequestCause, RequestError, RequestEvent,
    Response, Result, SharedConfig, TransportError, CHANNEL_CAPACITY,
};
use faststr::FastStr;
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};

/// 超时续传的重试上限。
const MAX_RETRIES: u32 = 10;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// 请求的终止开关。
///
/// 标志位和广播并用：广播唤醒正在等待的任务，标志位保证晚来的
/// 观察者同样看得到终止。
#[derive(Clone)]
pub struct Halt {
    flag: Arc<AtomicBool>,
    signal: broadcast::Sender<()>,
}

impl Halt {
    pub(crate) fn new() -> Self {
        let (signal, _) = broadcast::channel(1);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            signal,
        }
    }

    /// 触发终止。
    pub fn kill(&self) {
        self.flag.store(true, Ordering::Relaxed);
        let _ = self.signal.send(());
    }

    /// 是否已触发终止。
    pub fn killed(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal.subscribe()
    }
}

enum Step {
    Init,
    Cache,
    Stash,
    Block,
    Mode,
    Filter,
    Connect,
    Download,
    Optimize,
    Response,
}

enum Flow {
    Goto(Step),
    Finish(Outcome),
}

/// 单个资源请求的完整生命周期。
///
/// 管线次序：重定向表 → 缓存 → 暂存 → 拦截 → 模式 → 过滤 → 解析 →
/// 下载 → 后处理 → 响应。每个阶段要么推进，要么以 [`Outcome`] 或
/// [`RequestError`] 收尾。
pub struct Request {
    id: u64,
    reference: Reference,
    config: SharedConfig,
    flags: Flags,
    timeline: Timeline,
    retries: u32,
    response: Option<Response>,
    bandwidth: Option<Arc<Mutex<BandwidthTracker>>>,
    services: Services,
    manager: DownloadManager,
    events: broadcast::Sender<RequestEvent>,
    halt: Halt,
}

impl Request {
    /// 建立请求。`config` 为空时按引用推导默认配置。
    pub fn new(reference: Reference, services: Services, config: Option<SharedConfig>) -> Self {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let config = Config::for_reference(&reference, config);
        let manager = DownloadManager::new(Arc::clone(&services.transport));
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            id,
            reference,
            config,
            flags: Flags::default(),
            timeline: Timeline::default(),
            retries: 0,
            response: None,
            bandwidth: None,
            services,
            manager,
            events,
            halt: Halt::new(),
        }
    }

    /// 从原始 URL 建立请求，无法解析时返回 `None`。
    pub fn from_url(url: &str, services: Services, config: Option<SharedConfig>) -> Option<Self> {
        let reference = Reference::parse(url)?;
        Some(Self::new(reference, services, config))
    }

    /// 订阅请求事件。
    pub fn events(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    /// 取一份终止开关，可交给其他任务随时触发。
    pub fn halt(&self) -> Halt {
        self.halt.clone()
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// 已消耗的重试次数。
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// 当前下载尝试的窗口平均带宽（字节每秒）。
    ///
    /// 管线尚未建立连接、或请求已终结时为 `None`。
    pub fn bandwidth(&self) -> Option<f64> {
        let tracker = self.bandwidth.as_ref()?;
        tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .average()
    }

    /// 修改已知开关，未知键拒绝并返回 `false`。
    pub fn set(&mut self, key: &str, value: bool) -> bool {
        self.flags.set(key, value)
    }

    /// 终止请求：记录时刻并通知下载任务中止。重复调用是空操作。
    pub fn kill(&mut self) {
        if self.timeline.mark(Stage::Kill) {
            self.halt.kill();
        }
    }

    /// 启动管线，驱动全部阶段直至终态。
    ///
    /// 只有第一次调用生效，之后的调用不做任何事并返回 `None`。
    pub async fn init(&mut self) -> Option<Result<Outcome>> {
        if !self.timeline.mark(Stage::Init) {
            return None;
        }
        info!("[Request:{}] 开始处理 {}", self.id, self.reference.url);

        let outcome = self.drive().await;
        self.bandwidth = None;
        match &outcome {
            Ok(_) => {}
            Err(RequestError::Killed) => {
                self.timeline.mark(Stage::Kill);
            }
            Err(e) => {
                self.timeline.mark(Stage::Error);
                warn!("[Request:{}] 终止于错误: {}", self.id, e);
                self.emit(RequestEvent::Error(e.clone()));
            }
        }
        Some(outcome)
    }

    /// 终止后不再对外发事件。
    fn emit(&self, event: RequestEvent) {
        if self.halt.killed() {
            return;
        }
        let _ = self.events.send(event);
    }

    async fn drive(&mut self) -> Result<Outcome> {
        let mut step = Step::Init;
        loop {
            if self.halt.killed() {
                return Err(RequestError::Killed);
            }
            let flow = match step {
                Step::Init => self.stage_init().await?,
                Step::Cache => self.stage_cache().await?,
                Step::Stash => self.stage_stash().await?,
                Step::Block => self.stage_block().await?,
                Step::Mode => self.stage_mode()?,
                Step::Filter => self.stage_filter().await?,
                Step::Connect => self.stage_connect().await?,
                Step::Download => self.stage_download().await?,
                Step::Optimize => self.stage_optimize().await?,
                Step::Response => self.stage_response().await?,
            };
            match flow {
                Flow::Goto(next) => step = next,
                Flow::Finish(outcome) => return Ok(outcome),
            }
        }
    }

    /// 查询重定向表，已知重定向直接以它收尾，不再落盘。
    async fn stage_init(&mut self) -> Result<Flow> {
        if let Some(location) = self.services.redirect.read(&self.reference).await {
            info!("[Request:{}] 命中已知重定向 -> {}", self.id, location);
            self.emit(RequestEvent::Redirect {
                location: location.clone(),
                known: true,
            });
            return Ok(Flow::Finish(Outcome::Redirect { location }));
        }
        Ok(Flow::Goto(Step::Cache))
    }

    async fn stage_cache(&mut self) -> Result<Flow> {
        if self.flags.refresh {
            return Ok(Flow::Goto(Step::Stash));
        }
        self.timeline.mark(Stage::Cache);
        if let Some(response) = self.services.cache.read(&self.reference).await {
            if response.payload.is_some() {
                debug!("[Request:{}] 缓存命中", self.id);
                self.response = Some(response);
                return Ok(Flow::Goto(Step::Response));
            }
        }
        Ok(Flow::Goto(Step::Stash))
    }

    /// 暂存命中时把残留头和部分响应体原样并入引用，供下载续传。
    /// 记录是否已覆盖全部内容由下载缓冲判定，空记录也照常还原。
    async fn stage_stash(&mut self) -> Result<Flow> {
        if self.flags.refresh {
            return Ok(Flow::Goto(Step::Block));
        }
        self.timeline.mark(Stage::Stash);
        if let Some(partial) = self.services.stash.read(&self.reference).await {
            let mut headers = partial.headers;
            // 存储服务自己的记账头不属于响应
            for key in ["service", "event", "method"] {
                headers.remove(key);
            }
            debug!(
                "[Request:{}] 暂存命中，已有 {} 字节",
                self.id,
                partial.payload.len()
            );
            self.reference.headers = Some(headers);
            self.reference.payload = Some(partial.payload);
        }
        Ok(Flow::Goto(Step::Block))
    }

    /// 拦截命中时压平共享配置的全部模式开关，同配置的请求立即跟进。
    async fn stage_block(&mut self) -> Result<Flow> {
        self.timeline.mark(Stage::Block);
        if self.services.blocker.check(&self.reference).await {
            warn!("[Request:{}] 已被拦截: {}", self.id, self.reference.url);
            self.config.mode.block_all();
            return Err(RequestError::Policy { code: 403 });
        }
        Ok(Flow::Goto(Step::Mode))
    }

    /// 模式门。页面被拒给出可提示的模式错误，其余内容一律 403。
    fn stage_mode(&mut self) -> Result<Flow> {
        self.timeline.mark(Stage::Mode);
        if self.config.mode.allows(self.reference.mime.kind) {
            return Ok(Flow::Goto(Step::Filter));
        }
        if self.reference.mime.ext == "html" {
            return Err(RequestError::Mode);
        }
        Err(RequestError::Policy { code: 403 })
    }

    async fn stage_filter(&mut self) -> Result<Flow> {
        self.timeline.mark(Stage::Filter);
        if self.services.filter.check(&self.reference).await {
            return Ok(Flow::Goto(Step::Connect));
        }
        if self.reference.mime.ext == "html" {
            return Err(RequestError::Filter);
        }
        Err(RequestError::Policy { code: 403 })
    }

    /// 域名解析。引用已带地址时直接进入下载。
    async fn stage_connect(&mut self) -> Result<Flow> {
        self.timeline.mark(Stage::Connect);
        if !self.reference.hosts.is_empty() {
            return Ok(Flow::Goto(Step::Download));
        }
        let Some(domain) = self.reference.domain.clone() else {
            return Err(RequestError::Host);
        };

        let record = self
            .services
            .host
            .read(domain.as_str(), self.reference.subdomain.as_deref())
            .await;
        if let Some(record) = record {
            if let Some(ipv4) = record.ipv4 {
                match ipv4.parse::<Ipv4Addr>() {
                    Ok(ip) => self.reference.hosts.push(IpAddr::V4(ip)),
                    Err(_) => warn!("[Request:{}] 丢弃无效 IPv4: {}", self.id, ipv4),
                }
            }
            if let Some(ipv6) = record.ipv6 {
                match ipv6.parse::<Ipv6Addr>() {
                    Ok(ip) => self.reference.hosts.push(IpAddr::V6(ip)),
                    Err(_) => warn!("[Request:{}] 丢弃无效 IPv6: {}", self.id, ipv6),
                }
            }
        }
        if self.reference.hosts.is_empty() {
            return Err(RequestError::Host);
        }
        Ok(Flow::Goto(Step::Download))
    }

    /// 下载阶段。超时续传与暂存损坏在此就地重试，其余错误原样上抛。
    async fn stage_download(&mut self) -> Result<Flow> {
        'attempts: loop {
            if self.halt.killed() {
                return Err(RequestError::Killed);
            }
            if !self.manager.check(&self.reference, &self.config) {
                return Err(RequestError::Policy { code: 403 });
            }
            self.timeline.mark(Stage::Download);
            let Some(mut download) = self.manager.download(&self.reference, &self.config) else {
                return Err(RequestError::Policy { code: 403 });
            };
            if !download.init().await {
                return Err(RequestError::Policy { code: 403 });
            }
            self.bandwidth = download.bandwidth_handle();
            debug!(
                "[Request:{}] 第 {} 次尝试，自 {} 字节处开始",
                self.id,
                self.retries + 1,
                download.start_offset()
            );

            let (event_tx, mut event_rx) = mpsc::channel(CHANNEL_CAPACITY);
            tokio::spawn(download.run(event_tx, self.halt.clone()));

            while let Some(event) = event_rx.recv().await {
                match event {
                    DownloadEvent::Progress {
                        partial,
                        downloaded,
                        total,
                    } => {
                        self.persist_partial(partial);
                        self.emit(RequestEvent::Progress { downloaded, total });
                    }
                    DownloadEvent::Timeout(Some(partial)) => {
                        self.retries += 1;
                        if self.retries < MAX_RETRIES {
                            info!(
                                "[Request:{}] 超时，保留 {} 字节后重试 ({}/{})",
                                self.id,
                                partial.payload.len(),
                                self.retries,
                                MAX_RETRIES
                            );
                            self.services.stash.save(&self.reference, &partial).await;
                            self.reference.headers = Some(partial.headers);
                            self.reference.payload = Some(partial.payload);
                            continue 'attempts;
                        }
                        warn!("[Request:{}] 重试已达上限 {}", self.id, MAX_RETRIES);
                        return Err(RequestError::Request {
                            cause: RequestCause::SocketStability,
                        });
                    }
                    DownloadEvent::Timeout(None) => {
                        // 没有任何字节可续传，立即判死
                        return Err(RequestError::Request {
                            cause: RequestCause::SocketTimeout,
                        });
                    }
                    DownloadEvent::Failed(TransportError::Stash(reason)) => {
                        warn!("[Request:{}] 暂存不可用（{}），清空后重来", self.id, reason);
                        self.services.stash.remove(&self.reference).await;
                        self.reference.headers = None;
                        self.reference.payload = None;
                        continue 'attempts;
                    }
                    DownloadEvent::Failed(e) => {
                        return Err(RequestError::Transport(e));
                    }
                    DownloadEvent::Redirect(response) => {
                        self.services.stash.remove(&self.reference).await;
                        let Some(location) = response.headers.get("location").cloned() else {
                            return Err(RequestError::Request {
                                cause: RequestCause::HeadersLocation,
                            });
                        };
                        self.services
                            .redirect
                            .save(&self.reference, location.as_str())
                            .await;
                        self.emit(RequestEvent::Redirect {
                            location: location.clone(),
                            known: false,
                        });
                        return Ok(Flow::Finish(Outcome::Redirect { location }));
                    }
                    DownloadEvent::Response(response) => {
                        self.services.stash.remove(&self.reference).await;
                        self.reference.headers = None;
                        self.reference.payload = None;
                        self.response = Some(response);
                        return Ok(Flow::Goto(Step::Optimize));
                    }
                }
            }

            // 事件通道关闭而无终止事件：任务被终止信号带走，或异常退出
            return if self.halt.killed() {
                Err(RequestError::Killed)
            } else {
                Err(RequestError::Transport(TransportError::Socket(
                    FastStr::new("下载任务异常退出"),
                )))
            };
        }
    }

    async fn stage_optimize(&mut self) -> Result<Flow> {
        self.timeline.mark(Stage::Optimize);
        if let Some(optimizer) = &self.services.optimizer {
            if let Some(response) = self.response.take() {
                let optimized = optimizer.optimize(&self.reference, response).await;
                self.response = Some(optimized);
            }
        }
        Ok(Flow::Goto(Step::Response))
    }

    /// 响应收尾：入缓存，成功后清掉暂存与引用上的残留。
    async fn stage_response(&mut self) -> Result<Flow> {
        self.timeline.mark(Stage::Response);
        let Some(response) = self.response.clone() else {
            return Err(RequestError::Transport(TransportError::Socket(
                FastStr::new("响应缺失"),
            )));
        };

        if response.payload.is_some()
            && self.services.cache.save(&self.reference, &response).await
        {
            self.services.stash.remove(&self.reference).await;
            self.reference.headers = None;
            self.reference.payload = None;
        }
        info!(
            "[Request:{}] 完成（HTTP {}，{} 字节）",
            self.id,
            response.status,
            response.payload.as_ref().map(|p| p.len()).unwrap_or(0)
        );
        self.emit(RequestEvent::Response(response.clone()));
        Ok(Flow::Finish(Outcome::Response(response)))
    }

    /// 后台持久化进度快照，不阻塞事件处理。
    fn persist_partial(&self, partial: Partial) {
        let stash = Arc::clone(&self.services.stash);
        let reference = self.reference.clone();
        tokio::spawn(async move {
            stash.save(&reference, &partial).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_halt_reaches_every_clone() {
        let halt = Halt::new();
        let observer = halt.clone();
        let mut signal = observer.subscribe();

        assert!(!observer.killed());
        halt.kill();
        assert!(observer.killed());
        assert!(signal.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_the_flag() {
        let halt = Halt::new();
        halt.kill();
        // 广播收不到历史消息，标志位必须兜底。
        assert!(halt.clone().killed());
    }
}
