//! 演示拦截器、站点模式与共享配置的联动。
//!
//! 运行：cargo run --example with_policies

use faststr::FastStr;
use privacy_request::{
    Config, DomainBlocker, HostRecord, MimeKind, ModeFlags, ReqwestTransport, Request, Services,
    StaticHosts,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    // --- 1. 策略：拦截 tracker.example，example.com 只放行文本 ---
    let blocker = Arc::new(DomainBlocker::default());
    blocker.block("tracker.example").await;

    let hosts = Arc::new(StaticHosts::default());
    hosts
        .insert(
            "example.com",
            HostRecord {
                ipv4: Some(FastStr::new("93.184.215.14")),
                ipv6: None,
            },
        )
        .await;

    let services = Services::in_memory(Arc::new(ReqwestTransport::new()))
        .with_blocker(blocker)
        .with_host(hosts);

    let mode = ModeFlags::default();
    mode.set(MimeKind::Text, true);
    let config = Config::new("example.com", mode);

    // --- 2. 被拦截的请求：403，共享配置被压平 ---
    let mut tracker = Request::from_url(
        "https://tracker.example/pixel.gif",
        services.clone(),
        Some(config.clone()),
    )
    .expect("URL 无法解析");
    match tracker.init().await {
        Some(Err(e)) => println!("tracker.example/pixel.gif -> {e}"),
        other => println!("tracker.example/pixel.gif -> 意外结果: {other:?}"),
    }
    println!(
        "拦截后共享配置的 text 开关: {}",
        config.mode.allows(MimeKind::Text)
    );

    // --- 3. 同一份配置下的图片请求：模式门直接 403 ---
    let mut image = Request::from_url(
        "https://example.com/logo.png",
        services.clone(),
        Some(config.clone()),
    )
    .expect("URL 无法解析");
    if let Some(Err(e)) = image.init().await {
        println!("example.com/logo.png -> {e}");
    }

    // --- 4. 重新放行文本后，页面请求走通模式门 ---
    config.mode.set(MimeKind::Text, true);
    let mut page =
        Request::from_url("https://example.com/index.html", services, Some(config))
            .expect("URL 无法解析");
    match page.init().await {
        Some(Ok(outcome)) => println!("example.com/index.html -> {outcome:?}"),
        Some(Err(e)) => println!("example.com/index.html -> {e}"),
        None => {}
    }
}
