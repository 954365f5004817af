//! manager.rs - 下载资格检查与尝试构造。

use crate::download::Download;
use crate::reference::{Protocol, Reference};
use crate::transport::Transport;
use crate::types::SharedConfig;
use log::debug;
use std::sync::Arc;

/// 按协议和站点模式决定能否下载，并构造下载尝试。
pub struct DownloadManager {
    transport: Arc<dyn Transport>,
}

impl DownloadManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// 引用是否有下载资格：协议为 HTTP/HTTPS 且站点模式放行该内容类别。
    pub fn check(&self, reference: &Reference, config: &SharedConfig) -> bool {
        matches!(reference.protocol, Protocol::Http | Protocol::Https)
            && config.mode.allows(reference.mime.kind)
    }

    /// 构造一次下载尝试。
    ///
    /// 构造前重新核对资格：共享配置可能在检查与构造之间被改动。
    pub fn download(&self, reference: &Reference, config: &SharedConfig) -> Option<Download> {
        if !self.check(reference, config) {
            debug!(
                "[Manager] 资格不符，拒绝下载: {} ({})",
                reference.url,
                reference.mime.kind
            );
            return None;
        }
        Some(Download::new(reference.clone(), Arc::clone(&self.transport)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::MimeKind;
    use crate::transport::{Connection, TransportEvent};
    use crate::types::{Config, TransportError};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn connect(
            &self,
            _reference: &Reference,
            _start: u64,
        ) -> Result<Connection, TransportError> {
            let (_tx, rx) = mpsc::channel::<TransportEvent>(1);
            Ok(Connection::new(rx, tokio::spawn(async {})))
        }
    }

    fn manager() -> DownloadManager {
        DownloadManager::new(Arc::new(NoopTransport))
    }

    #[tokio::test]
    async fn test_check_requires_web_protocol() {
        let manager = manager();
        let config = Config::allow_all();

        let web = Reference::parse("https://example.com/a.png").unwrap();
        assert!(manager.check(&web, &config));

        let ftp = Reference::parse("ftp://example.com/a.png").unwrap();
        assert!(!manager.check(&ftp, &config));
        assert!(manager.download(&ftp, &config).is_none());
    }

    #[tokio::test]
    async fn test_check_respects_mode_flags() {
        let manager = manager();
        let config = Config::deny_all();
        let image = Reference::parse("https://example.com/a.png").unwrap();

        assert!(!manager.check(&image, &config));

        config.mode.set(MimeKind::Image, true);
        assert!(manager.check(&image, &config));
    }

    #[tokio::test]
    async fn test_download_revalidates_before_construction() {
        let manager = manager();
        let config = Config::allow_all();
        let image = Reference::parse("https://example.com/a.png").unwrap();

        assert!(manager.check(&image, &config));
        // 检查之后配置被共享方收紧，构造时必须再次核对。
        config.mode.set(MimeKind::Image, false);
        assert!(manager.download(&image, &config).is_none());
    }
}
