pub mod overlay;

use crate::error::StartupError;
use overlay::OverlayAsset;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 本地内容服务器句柄
///
/// 端口在整个生命周期内由该句柄独占，`stop` 之后释放。
pub struct ContentServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ContentServer {
    /// 绑定端口并在后台任务中提供服务
    ///
    /// # 错误处理
    /// - 端口绑定失败时返回 `StartupError::Bind`，由编排器决定是否终止启动
    pub async fn start(port: u16, asset: OverlayAsset) -> Result<Self, StartupError> {
        let requested = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| StartupError::Bind {
                addr: requested,
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind {
                addr: requested,
                source,
            })?;

        let app = overlay::router(Arc::new(asset));
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await
            {
                error!("Content server terminated unexpectedly: {}", e);
            }
        });

        info!("Overlay server running at http://{}", addr);
        Ok(Self {
            addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// 停止接收连接并释放端口
    ///
    /// 在途请求最多等待 `drain`，超时后强制中止服务任务。重复调用无副作用。
    pub async fn stop(&mut self, drain: Duration) -> anyhow::Result<()> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        self.shutdown.cancel();

        let outcome = tokio::time::timeout(drain, &mut task).await;
        match outcome {
            Ok(Ok(())) => {
                info!("Overlay server on {} stopped", self.addr);
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::anyhow!("content server task failed: {}", e)),
            Err(_) => {
                warn!(
                    "Overlay server did not drain within {:?}, aborting",
                    drain
                );
                task.abort();
                let _ = task.await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn start_embedded() -> ContentServer {
        ContentServer::start(0, OverlayAsset::Embedded).await.unwrap()
    }

    #[tokio::test]
    async fn root_is_served_with_or_without_query() {
        let mut server = start_embedded().await;
        let base = server.base_url();

        for path in ["/", "/?title=Late%20Night%20Radio&playlist=x", "/overlay.html"] {
            let resp = reqwest::get(format!("{}{}", base, path)).await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::OK, "{}", path);
            let ct = resp.headers()[reqwest::header::CONTENT_TYPE].to_str().unwrap().to_string();
            assert!(ct.starts_with("text/html"), "{}", ct);
            let body = resp.text().await.unwrap();
            assert_eq!(body, overlay::EMBEDDED_OVERLAY);
        }

        server.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_paths_are_404() {
        let mut server = start_embedded().await;
        let base = server.base_url();

        for path in ["/favicon.ico", "/overlay.html/extra", "/%2e%2e/etc/passwd", "/index.html?x=1"] {
            let resp = reqwest::get(format!("{}{}", base, path)).await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "{}", path);
        }

        server.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn only_200_or_404_regardless_of_method() {
        let mut server = start_embedded().await;
        let base = server.base_url();
        let client = reqwest::Client::new();

        for method in [reqwest::Method::POST, reqwest::Method::PUT, reqwest::Method::DELETE] {
            let resp = client
                .request(method.clone(), format!("{}/", base))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::OK, "{} /", method);

            let resp = client
                .request(method.clone(), format!("{}/favicon.ico", base))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "{} /favicon.ico", method);
        }

        let resp = client
            .post(format!("{}{}?title=x", base, overlay::ASSET_PATH))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        server.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn file_override_is_read_per_request() {
        let mut file = tempfile::Builder::new().suffix(".html").tempfile().unwrap();
        write!(file, "<h1>custom</h1>").unwrap();

        let mut server = ContentServer::start(0, OverlayAsset::File(file.path().to_path_buf()))
            .await
            .unwrap();
        let body = reqwest::get(server.base_url()).await.unwrap().text().await.unwrap();
        assert_eq!(body, "<h1>custom</h1>");

        server.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn unreadable_override_returns_500() {
        let mut server = ContentServer::start(
            0,
            OverlayAsset::File("/nonexistent/overlay.html".into()),
        )
        .await
        .unwrap();

        let resp = reqwest::get(server.base_url()).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.text().await.unwrap().starts_with("Error loading overlay"));

        server.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported_and_stop_releases_port() {
        let mut first = start_embedded().await;
        let port = first.addr().port();

        let err = ContentServer::start(port, OverlayAsset::Embedded)
            .await
            .err()
            .expect("second bind must fail");
        assert!(matches!(err, StartupError::Bind { .. }));

        first.stop(Duration::from_secs(2)).await.unwrap();
        // 重复停止不报错
        first.stop(Duration::from_secs(2)).await.unwrap();

        let mut again = ContentServer::start(port, OverlayAsset::Embedded).await.unwrap();
        again.stop(Duration::from_secs(2)).await.unwrap();
    }
}
