//! transport.rs - 传输层抽象与基于 reqwest 的实现。

use crate::reference::{Protocol, Reference};
use crate::types::{Headers, TransportError, CHANNEL_CAPACITY};
use async_trait::async_trait;
use bytes::Bytes;
use faststr::FastStr;
use futures_util::StreamExt;
use log::info;
use reqwest::header::RANGE;
use reqwest::redirect;
use reqwest::{Client, ClientBuilder};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 传输连接吐出的事件。
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// 连接任务已启动。
    Connected,
    /// 状态行与响应头已就绪。
    Head { status: u16, headers: Headers },
    /// 一段响应体。
    Data(Bytes),
    /// 对端正常关闭。
    Closed,
    /// 传输失败。
    Failed(TransportError),
}

/// 一条活动的传输连接。
///
/// 丢弃连接即中止底层任务，不会留下悬挂的网络请求。
pub struct Connection {
    /// 传输事件流。
    pub events: mpsc::Receiver<TransportEvent>,
    task: JoinHandle<()>,
}

impl Connection {
    pub fn new(events: mpsc::Receiver<TransportEvent>, task: JoinHandle<()>) -> Self {
        Self { events, task }
    }

    /// 终止底层传输任务。
    pub fn close(&mut self) {
        self.task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 传输层契约：从某个偏移开始取回引用指向的资源。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立连接并从 `start` 字节处开始请求数据。
    async fn connect(
        &self,
        reference: &Reference,
        start: u64,
    ) -> Result<Connection, TransportError>;
}

/// 基于 reqwest 的 HTTP/HTTPS 传输。
///
/// 代理优先于直连，已解析的地址会被固定到客户端，避免二次解析。
/// 3xx 状态原样上交，不在传输层跟随。
pub struct ReqwestTransport<F = fn() -> ClientBuilder>
where
    F: Fn() -> ClientBuilder + Send + Sync,
{
    client_builder: F,
}

impl ReqwestTransport {
    /// 使用默认客户端配置：不自动跟随重定向，忽略系统代理。
    pub fn new() -> Self {
        Self {
            client_builder: default_builder,
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// 默认的客户端底座。
///
/// 重定向不自动跟随：上层靠原样上交的 3xx 维护重定向表，客户端自行
/// 跟随会让它永远记不到。系统代理环境变量一律忽略，代理只认引用上
/// 携带的 SOCKS5 描述符。
fn default_builder() -> ClientBuilder {
    ClientBuilder::new()
        .redirect(redirect::Policy::none())
        .no_proxy()
}

impl<F> ReqwestTransport<F>
where
    F: Fn() -> ClientBuilder + Send + Sync,
{
    /// 以自定义构造器建立传输，用于注入超时、UA 等客户端配置。
    ///
    /// 自定义构造器同样不应让客户端自动跟随重定向：3xx 要原样交回，
    /// 重定向表才有机会记录。
    ///
    /// # 参数
    /// * `client_builder` - 每次连接前调用，返回打好底的 `ClientBuilder`
    pub fn with_builder(client_builder: F) -> Self {
        Self { client_builder }
    }

    fn build_client(&self, reference: &Reference) -> Result<Client, TransportError> {
        let mut builder = (self.client_builder)();

        if let Some(proxy) = &reference.proxy {
            let address = format!("socks5://{}:{}", proxy.host, proxy.port);
            let proxy = reqwest::Proxy::all(&address)
                .map_err(|e| TransportError::Connect(FastStr::new(e.to_string())))?;
            builder = builder.proxy(proxy);
        }

        // 域名请求固定到已解析的首选地址，连接时不再查询系统解析器。
        if let (Some(_), Some(ip)) = (&reference.domain, reference.hosts.first()) {
            if let Some(host) = reference.host_name() {
                builder = builder.resolve(
                    host.as_str(),
                    SocketAddr::new(*ip, reference.effective_port()),
                );
            }
        }

        builder
            .build()
            .map_err(|e| TransportError::Connect(FastStr::new(e.to_string())))
    }
}

#[async_trait]
impl<F> Transport for ReqwestTransport<F>
where
    F: Fn() -> ClientBuilder + Send + Sync,
{
    async fn connect(
        &self,
        reference: &Reference,
        start: u64,
    ) -> Result<Connection, TransportError> {
        let url = target_url(reference)?;
        let client = self.build_client(reference)?;
        let range = format!("bytes={start}-");
        info!("[Transport] GET {} (range: {})", url, range);

        let request = client.get(&url).header(RANGE, range);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(stream_response(request, event_tx));
        Ok(Connection::new(event_rx, task))
    }
}

/// 由引用重组请求 URL，只接受 HTTP 与 HTTPS。
fn target_url(reference: &Reference) -> Result<String, TransportError> {
    let scheme = match reference.protocol {
        Protocol::Http => "http",
        Protocol::Https => "https",
        _ => {
            return Err(TransportError::Unsupported(FastStr::new(
                reference.protocol.as_str(),
            )))
        }
    };
    let host = reference
        .host_name()
        .ok_or_else(|| TransportError::Connect(FastStr::new("引用缺少可用主机")))?;

    let mut url = format!("{scheme}://{host}");
    if let Some(port) = reference.port {
        url.push_str(&format!(":{port}"));
    }
    url.push_str(reference.path.as_str());
    if let Some(query) = &reference.query {
        url.push('?');
        url.push_str(query.as_str());
    }
    Ok(url)
}

/// 把一次 HTTP 响应转成事件流。
///
/// 1. 宣告连接建立
/// 2. 发送状态与响应头
/// 3. 逐块转发响应体
/// 4. 以 `Closed` 或 `Failed` 收尾
async fn stream_response(request: reqwest::RequestBuilder, events: mpsc::Sender<TransportEvent>) {
    if events.send(TransportEvent::Connected).await.is_err() {
        return;
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = events.send(TransportEvent::Failed(classify(&e))).await;
            return;
        }
    };

    let status = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(FastStr::new(name.as_str()), FastStr::new(value));
        }
    }
    if events
        .send(TransportEvent::Head { status, headers })
        .await
        .is_err()
    {
        return;
    }

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(data) => {
                if events.send(TransportEvent::Data(data)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Failed(classify(&e))).await;
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed).await;
}

fn classify(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(FastStr::new(error.to_string()))
    } else {
        TransportError::Socket(FastStr::new(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 起一个只应答一次的本地服务器，返回监听端口。
    async fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            // 读完请求头再应答
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        port
    }

    #[test]
    fn test_target_url_keeps_port_and_query() {
        let reference = Reference::parse("https://www.example.com:8443/a/b.png?x=1").unwrap();
        assert_eq!(
            target_url(&reference).unwrap(),
            "https://www.example.com:8443/a/b.png?x=1"
        );
    }

    #[test]
    fn test_target_url_omits_default_port() {
        let reference = Reference::parse("http://example.com/index.html").unwrap();
        assert_eq!(
            target_url(&reference).unwrap(),
            "http://example.com/index.html"
        );
    }

    #[test]
    fn test_target_url_rejects_other_protocols() {
        let reference = Reference::parse("ftp://example.com/file.bin").unwrap();
        assert_eq!(
            target_url(&reference),
            Err(TransportError::Unsupported(FastStr::new("ftp")))
        );
    }

    #[tokio::test]
    async fn test_redirect_status_reaches_caller() {
        let port = serve_once(
            "HTTP/1.1 301 Moved Permanently\r\nlocation: /b.html\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let reference = Reference::parse(&format!("http://127.0.0.1:{port}/a.html")).unwrap();

        let mut connection = ReqwestTransport::new().connect(&reference, 0).await.unwrap();
        let (status, headers) = loop {
            match connection.events.recv().await {
                Some(TransportEvent::Head { status, headers }) => break (status, headers),
                Some(TransportEvent::Failed(e)) => panic!("传输失败: {e}"),
                Some(_) => continue,
                None => panic!("事件通道未送出响应头"),
            }
        };
        assert_eq!(status, 301);
        assert_eq!(headers.get("location").unwrap(), "/b.html");
    }

    #[tokio::test]
    async fn test_default_client_ignores_proxy_env() {
        // 指向没人监听的端口，客户端若读环境变量就会连不上
        std::env::set_var("HTTP_PROXY", "http://127.0.0.1:9");
        std::env::set_var("http_proxy", "http://127.0.0.1:9");
        let port =
            serve_once("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await;
        let reference = Reference::parse(&format!("http://127.0.0.1:{port}/ok.txt")).unwrap();

        let mut connection = ReqwestTransport::new().connect(&reference, 0).await.unwrap();
        let mut status = None;
        while let Some(event) = connection.events.recv().await {
            match event {
                TransportEvent::Head { status: code, .. } => status = Some(code),
                TransportEvent::Failed(e) => panic!("不应走系统代理: {e}"),
                _ => {}
            }
        }
        assert_eq!(status, Some(200));
        std::env::remove_var("HTTP_PROXY");
        std::env::remove_var("http_proxy");
    }
}
