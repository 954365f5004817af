//! reference.rs - 解析后的 URL 引用描述符。

use crate::types::Headers;
use bytes::Bytes;
use faststr::FastStr;
use std::fmt;
use std::net::IpAddr;
use url::Url;

/// 引用的协议。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    /// 浏览器内部页面协议。
    Stealth,
    /// 其他协议，保留原始 scheme。
    Other(FastStr),
}

impl Protocol {
    fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            "stealth" => Protocol::Stealth,
            other => Protocol::Other(FastStr::new(other)),
        }
    }

    /// 协议的规范字符串。
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Stealth => "stealth",
            Protocol::Other(scheme) => scheme.as_str(),
        }
    }

    /// 协议的默认端口。
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            _ => 443,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 内容的五种粗分类，站点配置按它放行或拒绝。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MimeKind {
    Text,
    Image,
    Audio,
    Video,
    Other,
}

impl MimeKind {
    /// 全部类别，便于批量操作。
    pub const ALL: [MimeKind; 5] = [
        MimeKind::Text,
        MimeKind::Image,
        MimeKind::Audio,
        MimeKind::Video,
        MimeKind::Other,
    ];

    /// 类别的规范名称。
    pub fn as_str(&self) -> &'static str {
        match self {
            MimeKind::Text => "text",
            MimeKind::Image => "image",
            MimeKind::Audio => "audio",
            MimeKind::Video => "video",
            MimeKind::Other => "other",
        }
    }
}

impl fmt::Display for MimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 按扩展名推断的内容类型。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mime {
    /// 粗分类。
    pub kind: MimeKind,
    /// 原始扩展名，小写。
    pub ext: FastStr,
}

impl Mime {
    /// 根据扩展名建立内容类型，未知扩展名归入 `other`。
    pub fn from_ext(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        let kind = match ext.as_str() {
            "html" | "htm" | "css" | "js" | "mjs" | "txt" | "md" | "xml" | "json" => MimeKind::Text,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" => MimeKind::Image,
            "mp3" | "ogg" | "wav" | "flac" => MimeKind::Audio,
            "mp4" | "webm" | "mkv" | "avi" => MimeKind::Video,
            _ => MimeKind::Other,
        };
        Self {
            kind,
            ext: FastStr::new(ext),
        }
    }

    /// 无扩展名的路径按页面载入处理。
    pub fn page() -> Self {
        Self {
            kind: MimeKind::Text,
            ext: FastStr::new("html"),
        }
    }
}

/// SOCKS5 代理描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proxy {
    /// 代理主机。
    pub host: FastStr,
    /// 代理端口。
    pub port: u16,
}

/// 解析后的 URL 引用。
///
/// 字段由解析器产出，请求管线只读取和补全（headers、payload、hosts），
/// 不会重新解析。
#[derive(Clone, Debug)]
pub struct Reference {
    /// 规范化的原始 URL，同时充当各存储服务的主键。
    pub url: FastStr,
    /// 协议。
    pub protocol: Protocol,
    /// 注册域，即主机名的最后两级标签。IP 直连时为 `None`。
    pub domain: Option<FastStr>,
    /// 子域，即注册域之前的标签。
    pub subdomain: Option<FastStr>,
    /// 显式端口，`None` 时由协议决定。
    pub port: Option<u16>,
    /// 路径，以 `/` 开头。
    pub path: FastStr,
    /// 查询串，不含 `?`。
    pub query: Option<FastStr>,
    /// 按扩展名推断的内容类型。
    pub mime: Mime,
    /// 暂存命中后回填的响应头。
    pub headers: Option<Headers>,
    /// 暂存命中后回填的部分响应体。
    pub payload: Option<Bytes>,
    /// 已解析的主机地址，按优先级排序。
    pub hosts: Vec<IpAddr>,
    /// SOCKS5 代理。
    pub proxy: Option<Proxy>,
}

impl Reference {
    /// 解析一个绝对 URL。
    ///
    /// 相对地址等无法解析的输入返回 `None`，调用方据此拒绝请求。
    pub fn parse(input: &str) -> Option<Self> {
        let url = Url::parse(input).ok()?;
        let protocol = Protocol::from_scheme(url.scheme());

        let mut domain = None;
        let mut subdomain = None;
        let mut hosts = Vec::new();
        match url.host() {
            Some(url::Host::Domain(name)) => {
                let lower = name.to_ascii_lowercase();
                let labels: Vec<String> = lower
                    .split('.')
                    .filter(|label| !label.is_empty())
                    .map(str::to_owned)
                    .collect();
                if labels.len() > 2 {
                    subdomain = Some(FastStr::new(labels[..labels.len() - 2].join(".")));
                    domain = Some(FastStr::new(labels[labels.len() - 2..].join(".")));
                } else if !labels.is_empty() {
                    domain = Some(FastStr::new(labels.join(".")));
                }
            }
            Some(url::Host::Ipv4(ip)) => hosts.push(IpAddr::V4(ip)),
            Some(url::Host::Ipv6(ip)) => hosts.push(IpAddr::V6(ip)),
            None => {}
        }

        let path = FastStr::new(url.path());
        let file = path.rsplit('/').next().unwrap_or("");
        let mime = match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Mime::from_ext(ext),
            _ => Mime::page(),
        };

        Some(Self {
            url: FastStr::new(url.as_str()),
            protocol,
            domain,
            subdomain,
            port: url.port(),
            query: url.query().map(FastStr::new),
            path,
            mime,
            headers: None,
            payload: None,
            hosts,
            proxy: None,
        })
    }

    /// 请求所用的主机名：`子域.域名`、域名，或首个已解析地址。
    ///
    /// IPv6 地址带方括号，可直接用于 URL 和 `host` 头。
    pub fn host_name(&self) -> Option<FastStr> {
        match (&self.subdomain, &self.domain) {
            (Some(subdomain), Some(domain)) => {
                Some(FastStr::new(format!("{subdomain}.{domain}")))
            }
            (None, Some(domain)) => Some(domain.clone()),
            _ => self.hosts.first().map(|ip| match ip {
                IpAddr::V4(v4) => FastStr::new(v4.to_string()),
                IpAddr::V6(v6) => FastStr::new(format!("[{v6}]")),
            }),
        }
    }

    /// 生效的端口：显式端口优先，否则按协议取默认值。
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_subdomain_and_domain() {
        let reference = Reference::parse("https://cdn.static.example.com/app.js?v=3").unwrap();
        assert_eq!(reference.protocol, Protocol::Https);
        assert_eq!(reference.subdomain.as_deref(), Some("cdn.static"));
        assert_eq!(reference.domain.as_deref(), Some("example.com"));
        assert_eq!(reference.path, "/app.js");
        assert_eq!(reference.query.as_deref(), Some("v=3"));
        assert_eq!(reference.mime.kind, MimeKind::Text);
        assert_eq!(reference.mime.ext, "js");
        assert!(reference.hosts.is_empty());
    }

    #[test]
    fn test_parse_defaults_pages_to_html() {
        let reference = Reference::parse("https://example.com/articles/today").unwrap();
        assert_eq!(reference.mime.kind, MimeKind::Text);
        assert_eq!(reference.mime.ext, "html");

        let root = Reference::parse("https://example.com/").unwrap();
        assert_eq!(root.mime.ext, "html");
    }

    #[test]
    fn test_parse_ip_literal_fills_hosts() {
        let reference = Reference::parse("http://192.168.0.1:8080/status.json").unwrap();
        assert!(reference.domain.is_none());
        assert_eq!(reference.hosts, vec!["192.168.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(reference.port, Some(8080));
        assert_eq!(reference.effective_port(), 8080);
        assert_eq!(reference.host_name().as_deref(), Some("192.168.0.1"));
    }

    #[test]
    fn test_parse_maps_extensions_to_kinds() {
        let cases = [
            ("https://example.com/a.png", MimeKind::Image),
            ("https://example.com/a.mp3", MimeKind::Audio),
            ("https://example.com/a.webm", MimeKind::Video),
            ("https://example.com/a.css", MimeKind::Text),
            ("https://example.com/a.zip", MimeKind::Other),
        ];
        for (url, kind) in cases {
            assert_eq!(Reference::parse(url).unwrap().mime.kind, kind, "{url}");
        }
    }

    #[test]
    fn test_parse_keeps_unknown_schemes() {
        let reference = Reference::parse("stealth:settings").unwrap();
        assert_eq!(reference.protocol, Protocol::Stealth);

        let reference = Reference::parse("ftp://example.com/file.bin").unwrap();
        assert_eq!(reference.protocol, Protocol::Other(FastStr::new("ftp")));
    }

    #[test]
    fn test_host_name_prefers_domain_over_addresses() {
        let mut reference = Reference::parse("https://www.example.com/").unwrap();
        reference.hosts.push("10.0.0.1".parse().unwrap());
        assert_eq!(reference.host_name().as_deref(), Some("www.example.com"));
    }

    #[test]
    fn test_ipv6_host_name_is_bracketed() {
        let reference = Reference::parse("http://[2001:db8::1]/index.html").unwrap();
        assert_eq!(reference.host_name().as_deref(), Some("[2001:db8::1]"));
    }
}
