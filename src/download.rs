//! download.rs - 单次下载尝试：传输缓冲、带宽监控与停滞处理。

use crate::bandwidth::BandwidthTracker;
use crate::reference::Reference;
use crate::request::Halt;
use crate::transport::{Connection, Transport, TransportEvent};
use crate::types::{DownloadEvent, Headers, Partial, Response, TransportError};
use bytes::Bytes;
use faststr::FastStr;
use log::{info, trace, warn};
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};

/// 带宽采样间隔。
pub(crate) const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// 单次尝试的传输缓冲。
///
/// 续传时由暂存数据播种：`start` 即已有字节数，`length` 取暂存头里的
/// `content-length`。总长已知后累积长度不会越过它。
#[derive(Debug, Default)]
pub struct TransferBuffer {
    /// 本次请求的起始偏移。
    pub start: u64,
    /// 资源总长，响应头未声明时为 `None`。
    pub length: Option<u64>,
    /// 是否为续传。
    pub partial: bool,
    /// 已累积的响应体。
    pub payload: Vec<u8>,
}

impl TransferBuffer {
    /// 由引用携带的暂存数据初始化缓冲。
    pub(crate) fn seed(reference: &Reference) -> Self {
        let payload: Vec<u8> = reference
            .payload
            .as_ref()
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default();
        let length = reference
            .headers
            .as_ref()
            .and_then(|headers| headers.get("content-length"))
            .and_then(|value| value.parse::<u64>().ok());
        let start = payload.len() as u64;
        Self {
            start,
            length,
            partial: start > 0,
            payload,
        }
    }

    /// 引用携带的暂存是否已覆盖全部内容。
    fn satisfied(&self, reference: &Reference) -> bool {
        reference.headers.is_some()
            && reference.payload.is_some()
            && self.length == Some(self.payload.len() as u64)
    }

    /// 追加一段数据，超出已知总长的部分被丢弃，返回实际写入的字节数。
    fn append(&mut self, data: &[u8]) -> usize {
        let take = match self.length {
            Some(length) => {
                let remaining = length.saturating_sub(self.payload.len() as u64);
                data.len().min(remaining as usize)
            }
            None => data.len(),
        };
        self.payload.extend_from_slice(&data[..take]);
        take
    }

    /// 是否已收满声明的总长。
    fn complete(&self) -> bool {
        matches!(self.length, Some(length) if self.payload.len() as u64 >= length)
    }

    /// 当前累积字节数。
    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// 缓冲是否为空。
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 以当前内容生成可暂存的部分响应。
    ///
    /// `content-length` 固定写为总长，续传时据此还原起始偏移与总量。
    fn snapshot(&self, headers: &Headers) -> Partial {
        let mut headers = headers.clone();
        if let Some(length) = self.length {
            headers.insert(
                FastStr::new("content-length"),
                FastStr::new(length.to_string()),
            );
        }
        Partial {
            headers,
            payload: Bytes::copy_from_slice(&self.payload),
        }
    }
}

/// 一次下载尝试。
///
/// `init` 决定走快速路径还是建立连接，`run` 驱动传输事件与采样计时器
/// 直至发出终止事件。缓冲和连接归本次尝试独占；带宽窗口在共享句柄
/// 后面，属主在尝试运行期间仍能读取实时均值。
pub struct Download {
    reference: Reference,
    transport: Arc<dyn Transport>,
    buffer: TransferBuffer,
    bandwidth: Option<Arc<Mutex<BandwidthTracker>>>,
    connection: Option<Connection>,
    satisfied: bool,
    headers: Headers,
    status: u16,
    failure: Option<TransportError>,
}

impl Download {
    pub(crate) fn new(reference: Reference, transport: Arc<dyn Transport>) -> Self {
        let buffer = TransferBuffer::seed(&reference);
        let headers = reference.headers.clone().unwrap_or_default();
        Self {
            reference,
            transport,
            buffer,
            bandwidth: None,
            connection: None,
            satisfied: false,
            headers,
            status: 0,
            failure: None,
        }
    }

    /// 本次尝试的起始偏移。
    pub fn start_offset(&self) -> u64 {
        self.buffer.start
    }

    /// 当前窗口平均带宽（字节每秒），没有活动连接时为 `None`。
    pub fn bandwidth(&self) -> Option<f64> {
        self.connection.as_ref()?;
        let tracker = self.bandwidth.as_ref()?;
        tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .average()
    }

    /// 共享带宽窗口的句柄，属主借此在尝试运行期间读取均值。
    pub(crate) fn bandwidth_handle(&self) -> Option<Arc<Mutex<BandwidthTracker>>> {
        self.bandwidth.clone()
    }

    /// 初始化尝试。
    ///
    /// 暂存已覆盖全部内容时直接判定完成，不建连接、不起计时器；
    /// 返回 `false` 仅表示没有可用的传输方式。
    pub async fn init(&mut self) -> bool {
        if self.buffer.satisfied(&self.reference) {
            info!("[Download] 暂存已完整覆盖，跳过网络: {}", self.reference.url);
            self.satisfied = true;
            self.status = 200;
            return true;
        }

        match self
            .transport
            .connect(&self.reference, self.buffer.start)
            .await
        {
            Ok(connection) => {
                self.connection = Some(connection);
                self.bandwidth = Some(Arc::new(Mutex::new(BandwidthTracker::new(
                    self.buffer.len(),
                ))));
                true
            }
            Err(TransportError::Unsupported(scheme)) => {
                warn!("[Download] 没有适配 {} 的传输: {}", scheme, self.reference.url);
                false
            }
            Err(e) => {
                self.failure = Some(e);
                true
            }
        }
    }

    /// 驱动尝试直至终止，结果经 `events` 发回属主。
    ///
    /// 收到终止信号时中止传输并直接退出，不再发事件。
    pub(crate) async fn run(mut self, events: mpsc::Sender<DownloadEvent>, halt: Halt) {
        // 先订阅再查标志，订阅之前触发的终止也能看到
        let mut halted = halt.subscribe();
        if halt.killed() {
            return;
        }

        if self.satisfied {
            let response = self.take_response();
            let _ = events.send(DownloadEvent::Response(response)).await;
            return;
        }
        if let Some(failure) = self.failure.take() {
            let _ = events.send(DownloadEvent::Failed(failure)).await;
            return;
        }
        let Some(mut connection) = self.connection.take() else {
            let _ = events
                .send(DownloadEvent::Failed(TransportError::Connect(
                    FastStr::new("连接尚未建立"),
                )))
                .await;
            return;
        };
        let bandwidth = match self.bandwidth.take() {
            Some(tracker) => tracker,
            None => Arc::new(Mutex::new(BandwidthTracker::new(self.buffer.len()))),
        };

        enum Step {
            Halted,
            Transport(Option<TransportEvent>),
            Sample,
        }

        let mut ticker = interval_at(Instant::now() + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
        loop {
            let step = tokio::select! {
                biased;
                _ = halted.recv() => Step::Halted,
                event = connection.events.recv() => Step::Transport(event),
                _ = ticker.tick() => Step::Sample,
            };

            match step {
                Step::Halted => {
                    connection.close();
                    return;
                }
                Step::Transport(Some(event)) => match event {
                    TransportEvent::Connected => {
                        trace!("[Download] 连接已建立: {}", self.reference.url);
                    }
                    TransportEvent::Head { status, headers } => {
                        // 1. 重定向交回属主处理
                        if (300..400).contains(&status) {
                            connection.close();
                            let _ = events
                                .send(DownloadEvent::Redirect(Response {
                                    status,
                                    headers,
                                    payload: None,
                                }))
                                .await;
                            return;
                        }
                        // 2. 续传请求必须得到 206，否则暂存不可信
                        if self.buffer.start > 0 && status != 206 {
                            connection.close();
                            let _ = events
                                .send(DownloadEvent::Failed(TransportError::Stash(
                                    FastStr::new(format!("续传请求得到 HTTP {status}")),
                                )))
                                .await;
                            return;
                        }
                        // 3. 核对或补全总长
                        if status == 206 {
                            if let Some(total) = content_range_total(&headers) {
                                match self.buffer.length {
                                    Some(expected) if expected != total => {
                                        connection.close();
                                        let _ = events
                                            .send(DownloadEvent::Failed(TransportError::Stash(
                                                FastStr::new(format!(
                                                    "总长不一致: 暂存 {expected}，响应 {total}"
                                                )),
                                            )))
                                            .await;
                                        return;
                                    }
                                    Some(_) => {}
                                    None => self.buffer.length = Some(total),
                                }
                            }
                        } else if let Some(length) = headers
                            .get("content-length")
                            .and_then(|value| value.parse::<u64>().ok())
                        {
                            self.buffer.length = Some(length);
                        }
                        self.status = status;
                        self.headers.extend(headers);
                    }
                    TransportEvent::Data(data) => {
                        let written = self.buffer.append(&data);
                        trace!(
                            "[Download] 收到 {} 字节，累计 {}/{:?}",
                            written,
                            self.buffer.len(),
                            self.buffer.length
                        );
                        if self.buffer.complete() {
                            connection.close();
                            let response = self.take_response();
                            let _ = events.send(DownloadEvent::Response(response)).await;
                            return;
                        }
                    }
                    TransportEvent::Closed => {
                        // 总长未知时对端关闭即视为完成
                        if self.buffer.length.is_none() || self.buffer.complete() {
                            let response = self.take_response();
                            let _ = events.send(DownloadEvent::Response(response)).await;
                        } else {
                            let _ = events
                                .send(DownloadEvent::Timeout(self.partial_or_none()))
                                .await;
                        }
                        return;
                    }
                    TransportEvent::Failed(TransportError::Timeout) => {
                        let _ = events
                            .send(DownloadEvent::Timeout(self.partial_or_none()))
                            .await;
                        return;
                    }
                    TransportEvent::Failed(e) => {
                        let _ = events.send(DownloadEvent::Failed(e)).await;
                        return;
                    }
                },
                Step::Transport(None) => {
                    warn!("[Download] 传输通道意外关闭: {}", self.reference.url);
                    let _ = events
                        .send(DownloadEvent::Timeout(self.partial_or_none()))
                        .await;
                    return;
                }
                Step::Sample => {
                    let stalled = {
                        let mut tracker =
                            bandwidth.lock().unwrap_or_else(PoisonError::into_inner);
                        tracker.record(self.buffer.len());
                        tracker.stalled()
                    };
                    let _ = events
                        .send(DownloadEvent::Progress {
                            partial: self.buffer.snapshot(&self.headers),
                            downloaded: self.buffer.len(),
                            total: self.buffer.length,
                        })
                        .await;
                    if stalled {
                        warn!("[Download] 带宽停滞，强制断开: {}", self.reference.url);
                        connection.close();
                        let _ = events
                            .send(DownloadEvent::Timeout(self.partial_or_none()))
                            .await;
                        return;
                    }
                }
            }
        }
    }

    /// 汇出最终响应。续传和快速路径一律按完整内容回报 200。
    fn take_response(&mut self) -> Response {
        let payload = mem::take(&mut self.buffer.payload);
        let mut headers = mem::take(&mut self.headers);
        let length = self.buffer.length.unwrap_or(payload.len() as u64);
        headers.insert(
            FastStr::new("content-length"),
            FastStr::new(length.to_string()),
        );
        let status = match self.status {
            0 | 206 => 200,
            status => status,
        };
        Response {
            status,
            headers,
            payload: Some(Bytes::from(payload)),
        }
    }

    fn partial_or_none(&self) -> Option<Partial> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.snapshot(&self.headers))
    }
}

/// 解析 `content-range: bytes a-b/total` 里的总长。
fn content_range_total(headers: &Headers) -> Option<u64> {
    let value = headers.get("content-range")?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn reference_with_stash(total: u64, payload: &'static [u8]) -> Reference {
        let mut reference = Reference::parse("https://example.com/video.mp4").unwrap();
        let mut headers = Headers::new();
        headers.insert(
            FastStr::new("content-length"),
            FastStr::new(total.to_string()),
        );
        reference.headers = Some(headers);
        reference.payload = Some(Bytes::from_static(payload));
        reference
    }

    #[test]
    fn test_seed_restores_offset_from_stash() {
        let reference = reference_with_stash(100, b"abcde");
        let buffer = TransferBuffer::seed(&reference);
        assert_eq!(buffer.start, 5);
        assert_eq!(buffer.length, Some(100));
        assert!(buffer.partial);
        assert!(!buffer.satisfied(&reference));
    }

    #[test]
    fn test_seed_detects_complete_stash() {
        let reference = reference_with_stash(5, b"abcde");
        let buffer = TransferBuffer::seed(&reference);
        assert!(buffer.satisfied(&reference));
    }

    #[test]
    fn test_append_never_exceeds_declared_length() {
        let mut buffer = TransferBuffer {
            length: Some(4),
            ..TransferBuffer::default()
        };
        assert_eq!(buffer.append(b"abc"), 3);
        assert_eq!(buffer.append(b"defg"), 1);
        assert_eq!(buffer.payload, b"abcd");
        assert!(buffer.complete());
    }

    #[test]
    fn test_snapshot_reports_total_length() {
        let mut buffer = TransferBuffer {
            length: Some(100),
            ..TransferBuffer::default()
        };
        buffer.append(b"abc");

        let mut headers = Headers::new();
        headers.insert(FastStr::new("content-length"), FastStr::new("97"));
        let partial = buffer.snapshot(&headers);
        assert_eq!(partial.headers.get("content-length").unwrap(), "100");
        assert_eq!(partial.payload.as_ref(), b"abc");
    }

    #[test]
    fn test_content_range_total_parsing() {
        let mut headers = Headers::new();
        headers.insert(
            FastStr::new("content-range"),
            FastStr::new("bytes 5-99/100"),
        );
        assert_eq!(content_range_total(&headers), Some(100));

        headers.insert(FastStr::new("content-range"), FastStr::new("bytes */??"));
        assert_eq!(content_range_total(&headers), None);
    }

    /// 发出响应头和一段数据后挂起的传输，模拟缓慢的对端。
    struct TricklingTransport;

    #[async_trait]
    impl Transport for TricklingTransport {
        async fn connect(
            &self,
            _reference: &Reference,
            _start: u64,
        ) -> Result<Connection, TransportError> {
            let (tx, rx) = mpsc::channel(8);
            let task = tokio::spawn(async move {
                let mut headers = Headers::new();
                headers.insert(FastStr::new("content-length"), FastStr::new("100"));
                let _ = tx.send(TransportEvent::Head { status: 200, headers }).await;
                let _ = tx
                    .send(TransportEvent::Data(Bytes::from_static(b"abcde")))
                    .await;
                std::future::pending::<()>().await;
            });
            Ok(Connection::new(rx, task))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_window_updates_during_transfer() {
        let reference = Reference::parse("https://example.com/video.mp4").unwrap();
        let mut download = Download::new(reference, Arc::new(TricklingTransport));
        assert!(download.init().await);
        // 连接刚建立，窗口尚无样本
        assert_eq!(download.bandwidth(), None);
        let window = download.bandwidth_handle().unwrap();

        let halt = Halt::new();
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(download.run(tx, halt));

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            DownloadEvent::Progress { downloaded: 5, .. }
        ));
        assert_eq!(window.lock().unwrap().average(), Some(5.0));
    }
}
