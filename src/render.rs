//! 渲染端：用有界面的 Chromium 打开叠加层页面，作为虚拟显示器上的画面来源。
//!
//! 前置条件：浏览器窗口尺寸必须与采集编码的分辨率一致，两者都取自同一个
//! [`QualityProfile`]。窗口显示在 `DISPLAY` 指向的虚拟显示器上，由编码进程采集。

use crate::config::QualityProfile;
use crate::error::StartupError;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use futures::StreamExt;
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 允许无用户手势自动播放、关闭媒体采集沙箱
const CHROME_ARGS: &[&str] = &[
    "--disable-dev-shm-usage",
    "--disable-accelerated-2d-canvas",
    "--disable-gpu",
    "--autoplay-policy=no-user-gesture-required",
    "--use-fake-ui-for-media-stream",
    "--enable-audio-service-sandbox=false",
];

const READY_POLL: Duration = Duration::from_millis(100);

/// 可启动渲染实例的后端
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn launch(&self, profile: &QualityProfile) -> anyhow::Result<Box<dyn RenderSession>>;
}

/// 一个渲染实例及其唯一页面
#[async_trait]
pub trait RenderSession: Send {
    /// 导航到 `url`，在 DOM 解析完成后返回，不等待次要资源
    async fn navigate(&mut self, url: &str) -> anyhow::Result<()>;

    /// 关闭实例，释放窗口
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// 构造叠加层页面地址，`title` / `playlist` 由页面自行解析
pub fn overlay_url(
    base: &str,
    title: &str,
    playlist: Option<&str>,
) -> Result<String, StartupError> {
    let mut params = vec![("title", title)];
    if let Some(playlist) = playlist {
        params.push(("playlist", playlist));
    }

    Url::parse_with_params(base, &params)
        .map(String::from)
        .map_err(|e| StartupError::Navigation {
            url: base.to_string(),
            source: anyhow!(e),
        })
}

/// 在有界时间内完成导航
///
/// # 错误处理
/// - 超时返回 `StartupError::NavigationTimeout`
/// - 页面加载失败返回 `StartupError::Navigation`
pub async fn navigate(
    session: &mut dyn RenderSession,
    url: &str,
    timeout: Duration,
) -> Result<(), StartupError> {
    info!("Navigating to: {}", url);
    match tokio::time::timeout(timeout, session.navigate(url)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(StartupError::Navigation {
            url: url.to_string(),
            source,
        }),
        Err(_) => Err(StartupError::NavigationTimeout {
            url: url.to_string(),
            timeout,
        }),
    }
}

/// 基于 DevTools 协议驱动的 Chromium
pub struct ChromiumBackend {
    executable: Option<PathBuf>,
}

impl ChromiumBackend {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl RenderBackend for ChromiumBackend {
    async fn launch(&self, profile: &QualityProfile) -> anyhow::Result<Box<dyn RenderSession>> {
        info!(
            "Launching browser ({}x{})...",
            profile.width, profile.height
        );

        let mut builder = BrowserConfig::builder()
            .with_head()
            .no_sandbox()
            .window_size(profile.width, profile.height)
            .viewport(Viewport {
                width: profile.width,
                height: profile.height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: false,
                has_touch: false,
            })
            .args(CHROME_ARGS.iter().copied());
        if let Some(exe) = &self.executable {
            builder = builder.chrome_executable(exe);
        }
        let config = builder.build().map_err(|e| anyhow!(e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to start browser process")?;

        // DevTools 事件必须持续消费，否则所有命令都会挂起
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {}", e);
                }
            }
        });

        Ok(Box::new(ChromiumSession {
            browser,
            page: None,
            events: Some(events),
        }))
    }
}

struct ChromiumSession {
    browser: Browser,
    page: Option<Page>,
    events: Option<JoinHandle<()>>,
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> anyhow::Result<()> {
        let page = self.browser.new_page("about:blank").await?;

        let resp = page.execute(NavigateParams::new(url)).await?;
        if let Some(error) = &resp.result.error_text {
            return Err(anyhow!("navigation error: {}", error));
        }

        // 等价于 domcontentloaded
        loop {
            let state: String = page
                .evaluate("document.readyState")
                .await?
                .into_value()?;
            if state != "loading" {
                break;
            }
            tokio::time::sleep(READY_POLL).await;
        }

        self.page = Some(page);
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.page = None;
        self.browser.close().await.context("failed to close browser")?;
        if let Err(e) = self.browser.wait().await {
            warn!("Failed to reap browser process: {}", e);
        }
        if let Some(events) = self.events.take() {
            events.abort();
        }
        info!("Browser closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRenderer, NavigationBehavior};

    #[test]
    fn overlay_url_encodes_parameters() {
        let url = overlay_url("http://127.0.0.1:8080", "Lo-Fi & Chill 24/7", None).unwrap();
        assert!(url.starts_with("http://127.0.0.1:8080/?title="), "{}", url);
        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<_> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("title".to_string(), "Lo-Fi & Chill 24/7".to_string())]);
    }

    #[test]
    fn playlist_is_passed_through() {
        let url = overlay_url(
            "http://127.0.0.1:8080",
            "Radio",
            Some("https://www.youtube.com/playlist?list=PL123"),
        )
        .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let playlist = parsed
            .query_pairs()
            .find(|(k, _)| k == "playlist")
            .map(|(_, v)| v.into_owned());
        assert_eq!(
            playlist.as_deref(),
            Some("https://www.youtube.com/playlist?list=PL123")
        );
    }

    #[tokio::test]
    async fn navigation_is_bounded() {
        let backend = FakeRenderer::new(NavigationBehavior::Hang);
        let mut session = backend.launch(&QualityProfile::HD_720).await.unwrap();

        let err = navigate(session.as_mut(), "http://127.0.0.1:1/", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::NavigationTimeout { .. }));
    }

    #[tokio::test]
    async fn navigation_failure_is_surfaced() {
        let backend = FakeRenderer::new(NavigationBehavior::Fail);
        let mut session = backend.launch(&QualityProfile::HD_720).await.unwrap();

        let err = navigate(session.as_mut(), "http://127.0.0.1:1/", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::Navigation { .. }));
    }

    #[tokio::test]
    async fn successful_navigation_records_url() {
        let backend = FakeRenderer::new(NavigationBehavior::Succeed);
        let mut session = backend.launch(&QualityProfile::HD_1080).await.unwrap();

        navigate(session.as_mut(), "http://127.0.0.1:9/?title=x", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(backend.navigations(), vec!["http://127.0.0.1:9/?title=x".to_string()]);
        assert_eq!(backend.launched_profiles(), vec![QualityProfile::HD_1080]);
    }
}
