//! 抓取一个 URL 并打印进度与结果。
//!
//! 运行：cargo run --example fetch -- https://example.com/

use privacy_request::{
    Config, Outcome, ReqwestTransport, Request, RequestEvent, Services, SystemResolver,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    // --- 1. 解析参数 ---
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://example.com/index.html".to_string());

    // --- 2. 组装服务：真实传输 + 系统解析器，其余用内存实现 ---
    let services = Services::in_memory(Arc::new(ReqwestTransport::new()))
        .with_host(Arc::new(SystemResolver));

    // --- 3. 建立请求并订阅事件 ---
    let mut request =
        Request::from_url(&url, services, Some(Config::allow_all())).expect("URL 无法解析");
    let mut events = request.events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RequestEvent::Progress { downloaded, total } => match total {
                    Some(total) => println!("进度: {downloaded}/{total} 字节"),
                    None => println!("进度: {downloaded} 字节"),
                },
                RequestEvent::Redirect { location, known } => {
                    println!("重定向 (已知: {known}) -> {location}");
                }
                RequestEvent::Response(response) => {
                    println!("响应: HTTP {}", response.status);
                }
                RequestEvent::Error(e) => println!("错误: {e}"),
            }
        }
    });

    // --- 4. 驱动管线 ---
    match request.init().await {
        Some(Ok(Outcome::Response(response))) => {
            let size = response.payload.map(|p| p.len()).unwrap_or(0);
            println!("完成: HTTP {}，共 {} 字节", response.status, size);
        }
        Some(Ok(Outcome::Redirect { location })) => println!("完成: 重定向 -> {location}"),
        Some(Err(e)) => eprintln!("失败: {e}"),
        None => {}
    }

    // 关闭事件通道，让打印任务退出
    drop(request);
    let _ = printer.await;
}
